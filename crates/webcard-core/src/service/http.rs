//! HTTP client for the remote command-definition service.
//!
//! Every request carries the API key in the `X-Authorization` header. Path
//! segments are percent-encoded. Transport failures, HTTP 5xx and HTTP 429
//! are retried up to [`Config::fetch_retries`] times with exponential
//! backoff, and a `Retry-After` header on a 429 overrides the backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::types::{self, check_envelope};
use super::{AtrCandidates, CommandDefinition, CommandKey, CommandService, PersonalizationRequest};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::reader::{ApduTemplate, ReaderHost};
use crate::service::SupportedCard;

/// Header carrying the API key.
const API_KEY_HEADER: &str = "X-Authorization";

/// [`CommandService`] over HTTPS.
pub struct HttpCommandService {
    client: Client,
    base_url: Url,
    api_key: String,
    retries: u32,
    backoff: Duration,
}

impl std::fmt::Debug for HttpCommandService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCommandService")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpCommandService {
    /// Creates a client for the service at [`Config::base_url`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL does not parse and
    /// [`Error::Network`] if the HTTP client cannot be built.
    pub fn new(config: &Config, api_key: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("base_url {}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "base_url cannot carry a path: {}",
                config.base_url
            )));
        }
        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
            retries: config.fetch_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// Creates a client using [`Config::api_key`], or the host's key when
    /// the configuration has none.
    ///
    /// # Errors
    ///
    /// Propagates the host's API key error and the errors of
    /// [`HttpCommandService::new`].
    pub async fn from_host(config: &Config, host: &dyn ReaderHost) -> Result<Self> {
        let api_key = match &config.api_key {
            Some(key) => key.clone(),
            None => host.api_key().await?,
        };
        Self::new(config, api_key)
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        endpoint(&self.base_url, segments)
    }

    async fn send(&self, request: impl Fn() -> RequestBuilder + Send + Sync) -> Result<Response> {
        let mut backoff = self.backoff;
        let mut attempt = 0;

        loop {
            let result = request().header(API_KEY_HEADER, &self.api_key).send().await;
            let retry = attempt < self.retries;

            match result {
                Ok(response) if retry && response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let wait = retry_after(response.headers()).unwrap_or(backoff);
                    warn!(url = %response.url(), wait_ms = wait.as_millis(), "rate limited");
                    tokio::time::sleep(wait).await;
                }
                Ok(response) if retry && response.status().is_server_error() => {
                    warn!(url = %response.url(), status = %response.status(), "server error, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Ok(response) => return Ok(response.error_for_status()?),
                Err(e) if retry => {
                    warn!(error = %e, attempt, "request failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }

            attempt += 1;
            backoff *= 2;
        }
    }

    async fn get_json(&self, operation: &str, segments: &[&str]) -> Result<Value> {
        let url = self.endpoint(segments);
        debug!(%url, operation, "GET");
        let body: Value = self.send(|| self.client.get(url.clone())).await?.json().await?;
        check_envelope(operation, &body)?;
        Ok(body)
    }

    async fn post_json(&self, operation: &str, segments: &[&str], payload: &Value) -> Result<Value> {
        let url = self.endpoint(segments);
        debug!(%url, operation, "POST");
        let body: Value = self
            .send(|| self.client.post(url.clone()).json(payload))
            .await?
            .json()
            .await?;
        check_envelope(operation, &body)?;
        Ok(body)
    }
}

#[async_trait]
impl CommandService for HttpCommandService {
    async fn supported_cards(&self) -> Result<Vec<SupportedCard>> {
        let url = self.endpoint(&["getSupportedCards"]);
        let body: Value = self.send(|| self.client.get(url.clone())).await?.json().await?;
        types::supported_cards(body)
    }

    async fn check_card_by_atr(&self, channel: &str, atr: &str) -> Result<AtrCandidates> {
        let body = self
            .get_json("checkCardByAtr", &["checkCardByAtr", channel, atr])
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn get_command(&self, key: &CommandKey) -> Result<CommandDefinition> {
        let body = self
            .get_json(
                "getCommand",
                &["getCommand", &key.card_id, &key.channel, &key.command],
            )
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn personalization_command(
        &self,
        key: &CommandKey,
        request: &PersonalizationRequest,
    ) -> Result<CommandDefinition> {
        let body = self
            .post_json(
                "generateCommand",
                &["generateCommand", &key.card_id, &key.channel, &key.command],
                &serde_json::to_value(request)?,
            )
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn generate_command(&self, key: &CommandKey, data: &str) -> Result<Vec<ApduTemplate>> {
        let body = self
            .post_json(
                "generateCommand",
                &["generateCommand", &key.card_id, &key.channel, &key.command],
                &json!({ "data": data }),
            )
            .await?;
        types::generated_templates(body)
    }

    async fn verify_token_by_email(&self, token: &str, email: &str) -> Result<String> {
        let url = self.endpoint(&["verifyTokenByEmail", token, email]);
        let text = self.send(|| self.client.get(url.clone())).await?.text().await?;
        Ok(text.trim().to_string())
    }

    async fn rollback_token(&self, token: &str) -> Result<()> {
        self.get_json("rollbackTokens", &["rollbackTokens", token])
            .await
            .map(drop)
    }

    async fn list_user_data(&self) -> Result<Vec<Value>> {
        let body = self.get_json("listUserData", &["listUserData"]).await?;
        types::user_data(body)
    }
}

/// Appends percent-encoded path segments to the service root.
fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Reads a `Retry-After` header given in seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}
