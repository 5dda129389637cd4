//! Command resolution and caching.
//!
//! [`CommandResolver`] turns a [`CommandDescriptor`] into a
//! [`ResolvedCommand`] by looking the command up on the remote service.
//!
//! Lookups are cached per `(card id, channel, command)`:
//!
//! - concurrent lookups of the same key share one in-flight request
//! - a failed request is evicted, so the next lookup retries
//! - personalization commands (`Personalize*`) always go to the service
//!   with the session's token and realm, and are never cached

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::reader::ApduTemplate;
use crate::script::CommandDescriptor;
use crate::service::{CommandDefinition, CommandKey, CommandService, PersonalizationRequest};

type SharedFetch = Shared<BoxFuture<'static, core::result::Result<CommandDefinition, Arc<Error>>>>;

/// When the user must touch the sensor for a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presence {
    /// Prompt and hold before transmission.
    pub before: bool,
    /// Prompt around transmission.
    pub during: bool,
}

/// A command ready to be executed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCommand {
    /// The parsed command.
    pub descriptor: CommandDescriptor,
    /// Template sent to the reader.
    pub template: ApduTemplate,
    /// Form to fill before the real command can be generated.
    pub form: Option<Value>,
    /// Presence requirements.
    pub presence: Presence,
}

impl ResolvedCommand {
    /// Builds a resolved command from a service definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommandNotFound`] if the definition has no template.
    pub fn from_definition(
        descriptor: CommandDescriptor,
        definition: CommandDefinition,
    ) -> Result<Self> {
        let template = definition
            .template
            .filter(|template| !template.is_empty())
            .ok_or_else(|| Error::CommandNotFound {
                command: descriptor.name().to_string(),
                reason: "response field missing".to_string(),
            })?;

        Ok(Self {
            descriptor,
            template,
            form: definition
                .needs_generation
                .then_some(definition.form)
                .flatten(),
            presence: Presence {
                before: definition.presence_before,
                during: definition.presence_during,
            },
        })
    }

    /// A command sent as-is, without lookup.
    #[must_use]
    pub fn direct(name: impl Into<String>, template: ApduTemplate) -> Self {
        Self {
            descriptor: CommandDescriptor::new(name, None),
            template,
            form: None,
            presence: Presence::default(),
        }
    }

    /// Checks whether the command must be generated from form data first.
    #[must_use]
    pub const fn needs_dynamic_form(&self) -> bool {
        self.form.is_some()
    }

    /// Returns the command name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// A generated follow-up: same name and presence requirements, the new
    /// template, no parameters and no form.
    #[must_use]
    pub fn follow_up(&self, template: ApduTemplate) -> Self {
        Self {
            descriptor: CommandDescriptor::new(self.descriptor.name(), None),
            template,
            form: None,
            presence: self.presence,
        }
    }
}

/// Resolves command names through the remote service, with caching.
pub struct CommandResolver {
    service: Arc<dyn CommandService>,
    channel: String,
    cache: Mutex<HashMap<CommandKey, SharedFetch>>,
    personalization: Mutex<Option<PersonalizationRequest>>,
}

impl fmt::Debug for CommandResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandResolver")
            .field("channel", &self.channel)
            .field("cached", &self.cached_len())
            .finish_non_exhaustive()
    }
}

impl CommandResolver {
    /// Creates a resolver for `channel`.
    #[must_use]
    pub fn new(service: Arc<dyn CommandService>, channel: impl Into<String>) -> Self {
        Self {
            service,
            channel: channel.into(),
            cache: Mutex::new(HashMap::new()),
            personalization: Mutex::new(None),
        }
    }

    /// Sets the token and realm sent with personalization lookups.
    pub fn set_personalization(&self, request: Option<PersonalizationRequest>) {
        *self
            .personalization
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = request;
    }

    /// Resolves one command for a card.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommandNotFound`] if the lookup fails or the
    /// definition has no template, and [`Error::Config`] for a
    /// personalization command without personalization fields.
    pub async fn resolve(
        &self,
        card_id: &str,
        descriptor: &CommandDescriptor,
    ) -> Result<ResolvedCommand> {
        let key = CommandKey::new(card_id, &self.channel, descriptor.name());

        let definition = if descriptor.is_personalization() {
            let request = self
                .personalization
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or_else(|| {
                    Error::Config("personalization token and realm are not set".to_string())
                })?;
            debug!(command = %key.command, "personalization lookup");
            self.service
                .personalization_command(&key, &request)
                .await
                .map_err(|e| not_found(&key, &e))?
        } else {
            let definition = self.cached(key.clone()).await?;
            if definition.template.as_ref().is_none_or(ApduTemplate::is_empty) {
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
                debug!(command = %key.command, "evicted lookup without template");
            }
            definition
        };

        ResolvedCommand::from_definition(descriptor.clone(), definition)
    }

    async fn cached(&self, key: CommandKey) -> Result<CommandDefinition> {
        let fetch = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!(card_id = %key.card_id, command = %key.command, "command cache miss");
                    let service = Arc::clone(&self.service);
                    let key = key.clone();
                    async move { service.get_command(&key).await.map_err(Arc::new) }
                        .boxed()
                        .shared()
                })
                .clone()
        };

        match fetch.clone().await {
            Ok(definition) => Ok(definition),
            Err(e) => {
                let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                if cache.get(&key).is_some_and(|entry| entry.ptr_eq(&fetch)) {
                    cache.remove(&key);
                    debug!(command = %key.command, "evicted failed command lookup");
                }
                Err(not_found(&key, &e))
            }
        }
    }

    /// Returns the number of cached lookups, pending or resolved.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every cached lookup.
    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn not_found(key: &CommandKey, err: &Error) -> Error {
    Error::CommandNotFound {
        command: key.command.clone(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mock::MockService;
    use crate::script::parse;

    fn descriptor(name: &str) -> CommandDescriptor {
        CommandDescriptor::new(name, None)
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let service = Arc::new(MockService::new());
        let resolver = CommandResolver::new(service.clone(), "NFC");

        let select = descriptor("SelectBeCard");
        let login = descriptor("LoginBeCard");
        let (a, b, c) = tokio::join!(
            resolver.resolve("card-1", &select),
            resolver.resolve("card-1", &select),
            resolver.resolve("card-1", &login),
        );

        assert_eq!(a.unwrap().template, b.unwrap().template);
        assert!(c.is_ok());
        assert_eq!(service.get_command_calls("SelectBeCard"), 1);
        assert_eq!(service.get_command_calls("LoginBeCard"), 1);
        assert_eq!(resolver.cached_len(), 2);

        resolver.resolve("card-1", &select).await.unwrap();
        assert_eq!(service.get_command_calls("SelectBeCard"), 1);
    }

    #[tokio::test]
    async fn failed_lookup_is_evicted() {
        let service = Arc::new(MockService::new());
        service.fail_get_command("ReadSequenceInfo", 1);
        let resolver = CommandResolver::new(service.clone(), "NFC");
        let read = descriptor("ReadSequenceInfo");

        let err = resolver.resolve("card-1", &read).await.unwrap_err();
        assert!(matches!(err, Error::CommandNotFound { .. }));
        assert_eq!(resolver.cached_len(), 0);

        assert!(resolver.resolve("card-1", &read).await.is_ok());
        assert_eq!(service.get_command_calls("ReadSequenceInfo"), 2);
    }

    #[tokio::test]
    async fn keys_include_card_identity() {
        let service = Arc::new(MockService::new());
        let resolver = CommandResolver::new(service.clone(), "NFC");
        let select = descriptor("SelectBeCard");

        resolver.resolve("card-1", &select).await.unwrap();
        resolver.resolve("card-2", &select).await.unwrap();
        assert_eq!(service.get_command_calls("SelectBeCard"), 2);
    }

    #[tokio::test]
    async fn personalization_bypasses_cache() {
        let service = Arc::new(MockService::new());
        let resolver = CommandResolver::new(service.clone(), "NFC");
        let personalize = &parse("[PersonalizeD {token=tok-1}]")[0];

        let err = resolver.resolve("card-1", personalize).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        resolver.set_personalization(Some(PersonalizationRequest {
            token: "tok-1".into(),
            realm: "wibio".into(),
        }));
        resolver.resolve("card-1", personalize).await.unwrap();
        resolver.resolve("card-1", personalize).await.unwrap();

        assert_eq!(service.personalization_calls(), 2);
        assert_eq!(service.get_command_calls("PersonalizeD"), 0);
        assert_eq!(resolver.cached_len(), 0);
    }

    #[tokio::test]
    async fn lookup_without_template_is_not_cached() {
        let service = Arc::new(MockService::new());
        service.define("GetVersion", CommandDefinition::default());
        let resolver = CommandResolver::new(service.clone(), "NFC");

        let err = resolver
            .resolve("card-1", &descriptor("GetVersion"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandNotFound { .. }));
        assert_eq!(resolver.cached_len(), 0);
    }

    #[test]
    fn definition_without_template_is_not_found() {
        let err = ResolvedCommand::from_definition(
            descriptor("GetVersion"),
            CommandDefinition::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::CommandNotFound { .. }));
    }

    #[test]
    fn form_only_when_generation_needed() {
        let definition: CommandDefinition = serde_json::from_value(json!({
            "Response": "80", "NeedGeneration": 0, "Form": "[]"
        }))
        .unwrap();
        let command = ResolvedCommand::from_definition(descriptor("X"), definition).unwrap();
        assert!(!command.needs_dynamic_form());

        let definition: CommandDefinition = serde_json::from_value(json!({
            "Response": "80", "NeedGeneration": 1, "Form": "[]", "requireFingerPrintBefore": 1
        }))
        .unwrap();
        let command = ResolvedCommand::from_definition(descriptor("X"), definition).unwrap();
        assert!(command.needs_dynamic_form());
        assert!(command.presence.before);

        let follow_up = command.follow_up(ApduTemplate::new("81"));
        assert!(!follow_up.needs_dynamic_form());
        assert!(follow_up.presence.before);
        assert_eq!(follow_up.name(), "X");
    }
}
