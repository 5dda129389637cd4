//! The orchestration engine.
//!
//! [`Engine`] wires the resolver and the executor to the configuration, the
//! remote service, the reader host and the presenter. Workflows only talk
//! to the engine: they hand it a script and a [`CardSession`] and get the
//! ordered results back.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::debug;

use crate::classify::ScriptResults;
use crate::config::Config;
use crate::error::Result;
use crate::executor::{ExecutionResult, Executor};
use crate::presenter::{Presenter, UiEvent};
use crate::reader::{ReaderHost, ReaderSession};
use crate::resolver::{CommandResolver, ResolvedCommand};
use crate::script;
use crate::service::CommandService;
use crate::session::{CancelToken, CardSession};

/// Resolver, executor and collaborators of one page session.
pub struct Engine {
    config: Arc<Config>,
    service: Arc<dyn CommandService>,
    host: Arc<dyn ReaderHost>,
    presenter: Arc<dyn Presenter>,
    resolver: CommandResolver,
    executor: Executor,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("channel", &self.config.channel)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        config: Config,
        service: Arc<dyn CommandService>,
        host: Arc<dyn ReaderHost>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        let config = Arc::new(config);
        let resolver = CommandResolver::new(Arc::clone(&service), config.channel.clone());
        let executor = Executor::new(
            Arc::clone(&config),
            Arc::clone(&service),
            Arc::clone(&host),
            Arc::clone(&presenter),
        );
        Self {
            config,
            service,
            host,
            presenter,
            resolver,
            executor,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the remote service.
    #[must_use]
    pub fn service(&self) -> &dyn CommandService {
        self.service.as_ref()
    }

    /// Returns the reader host.
    #[must_use]
    pub fn host(&self) -> &dyn ReaderHost {
        self.host.as_ref()
    }

    /// Returns the presenter.
    #[must_use]
    pub fn presenter(&self) -> &dyn Presenter {
        self.presenter.as_ref()
    }

    /// Reports an event to the presenter.
    pub fn emit(&self, event: UiEvent) {
        self.presenter.emit(event);
    }

    /// Returns the command resolver.
    #[must_use]
    pub const fn resolver(&self) -> &CommandResolver {
        &self.resolver
    }

    /// Parses `script` and resolves every command for `card_id`.
    /// Resolution runs concurrently; the order of the script is kept.
    ///
    /// # Errors
    ///
    /// Returns the first resolution error, typically
    /// [`crate::Error::CommandNotFound`].
    pub async fn resolve_script(&self, card_id: &str, script: &str) -> Result<Vec<ResolvedCommand>> {
        let descriptors = script::parse(script);
        try_join_all(
            descriptors
                .iter()
                .map(|descriptor| self.resolver.resolve(card_id, descriptor)),
        )
        .await
    }

    /// Runs already-resolved commands against a reader.
    ///
    /// # Errors
    ///
    /// See [`Executor::run`].
    pub async fn run(
        &self,
        reader: &Arc<dyn ReaderSession>,
        card_id: Option<&str>,
        commands: Vec<ResolvedCommand>,
        cancel: &CancelToken,
    ) -> Result<Vec<ExecutionResult>> {
        self.executor.run(reader, card_id, commands, cancel).await
    }

    /// Resolves and runs a script against the session's card.
    ///
    /// Every command is resolved before the reader is touched, so a lookup
    /// failure sends nothing to the card.
    ///
    /// # Errors
    ///
    /// Returns resolution errors, the reader's connect error, or
    /// [`crate::Error::Cancelled`] when the card is removed mid-run.
    pub async fn run_script(&self, session: &CardSession, script: &str) -> Result<Vec<ExecutionResult>> {
        debug!(card_id = session.card_id(), script, "running script");
        let commands = self.resolve_script(session.card_id(), script).await?;
        self.run(
            session.reader(),
            Some(session.card_id()),
            commands,
            session.cancel_token(),
        )
        .await
    }

    /// Runs a script and requires exactly `expected` results.
    ///
    /// # Errors
    ///
    /// As [`Engine::run_script`], plus [`crate::Error::ScriptShape`] on a
    /// result count mismatch.
    pub async fn run_checked(
        &self,
        session: &CardSession,
        script: &str,
        expected: usize,
    ) -> Result<ScriptResults> {
        let results = self.run_script(session, script).await?;
        ScriptResults::new(script, results)
            .with_accept_code(self.config.accept_code.clone())
            .expect_count(expected)
    }
}
