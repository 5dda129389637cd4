//! Engine configuration.
//!
//! [`Config`] carries the remote service location, the lookup channel and
//! the timings used by the execution engine and the OTP workflows. It can be
//! built from JSON and then adjusted from `WEBCARD_*` environment variables.
//!
//! # Example
//!
//! ```
//! use webcard_core::Config;
//!
//! let config = Config::from_json(r#"{"channel": "USB", "fetch_retries": 0}"#).unwrap();
//! assert_eq!(config.channel, "USB");
//! assert_eq!(config.presence_hold_ms, 2000);
//! ```

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default remote command-definition service.
pub const DEFAULT_BASE_URL: &str = "https://smartmanager.wibiocard.com/api";

/// Default lookup channel.
pub const DEFAULT_CHANNEL: &str = "NFC";

/// Raw status code accepted as success.
pub const ACCEPT_CODE: &str = "9000";

/// Settings for the orchestration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root URL of the remote command-definition service.
    pub base_url: String,

    /// Transport context used to key command lookups.
    pub channel: String,

    /// API key sent with every remote request. When unset the key is taken
    /// from the reader host.
    pub api_key: Option<String>,

    /// Per-request HTTP timeout.
    pub request_timeout_ms: u64,

    /// Extra attempts for a failed remote fetch.
    pub fetch_retries: u32,

    /// Initial retry backoff, doubled per attempt.
    pub retry_backoff_ms: u64,

    /// Hold after a presence prompt that precedes transmission.
    pub presence_hold_ms: u64,

    /// Settle delay after a presence prompt shown during transmission.
    pub presence_settle_ms: u64,

    /// Length of the TOTP countdown before the token is read again.
    pub totp_refresh_secs: u64,

    /// TOTP epoch length used for `timestamp` form parameters.
    pub totp_period_secs: u64,

    /// Raw status code treated as success.
    pub accept_code: String,

    /// Number of chunks read from the identity applet.
    pub identity_chunks: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            api_key: None,
            request_timeout_ms: 30_000,
            fetch_retries: 2,
            retry_backoff_ms: 1_000,
            presence_hold_ms: 2_000,
            presence_settle_ms: 100,
            totp_refresh_secs: 29,
            totp_period_secs: 30,
            accept_code: ACCEPT_CODE.to_string(),
            identity_chunks: 8,
        }
    }
}

impl Config {
    /// Parses a configuration from JSON. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if the text is not valid JSON and
    /// [`Error::Config`] if the result fails [`Config::validate`].
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `WEBCARD_BASE_URL`, `WEBCARD_CHANNEL`, `WEBCARD_API_KEY` and
    /// `WEBCARD_FETCH_RETRIES` on top of the current values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `WEBCARD_FETCH_RETRIES` is not a number
    /// or the resulting configuration is invalid.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(base_url) = lookup("WEBCARD_BASE_URL") {
            self.base_url = base_url;
        }
        if let Some(channel) = lookup("WEBCARD_CHANNEL") {
            self.channel = channel;
        }
        if let Some(api_key) = lookup("WEBCARD_API_KEY") {
            self.api_key = Some(api_key);
        }
        if let Some(retries) = lookup("WEBCARD_FETCH_RETRIES") {
            self.fetch_retries = retries
                .parse()
                .map_err(|e| Error::Config(format!("WEBCARD_FETCH_RETRIES: {e}")))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks that the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(Error::Config("channel must not be empty".to_string()));
        }
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(Error::Config(format!(
                "base_url is not an http(s) URL: {}",
                self.base_url
            )));
        }
        if self.totp_period_secs == 0 {
            return Err(Error::Config("totp_period_secs must be positive".to_string()));
        }
        if self.totp_refresh_secs == 0 {
            return Err(Error::Config("totp_refresh_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// Hold after a presence-before prompt.
    #[must_use]
    pub const fn presence_hold(&self) -> Duration {
        Duration::from_millis(self.presence_hold_ms)
    }

    /// Settle delay after a presence-during prompt.
    #[must_use]
    pub const fn presence_settle(&self) -> Duration {
        Duration::from_millis(self.presence_settle_ms)
    }

    /// Remote request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.channel, "NFC");
        assert_eq!(config.totp_refresh_secs, 29);
        assert_eq!(config.totp_period_secs, 30);
        assert_eq!(config.presence_hold(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{"api_key": "k-123"}"#).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("k-123"));
        assert_eq!(config.accept_code, "9000");
        assert_eq!(config.identity_chunks, 8);
    }

    #[test]
    fn rejects_empty_channel() {
        let err = Config::from_json(r#"{"channel": " "}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_zero_period() {
        let err = Config::from_json(r#"{"totp_period_secs": 0}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WEBCARD_CHANNEL", "USB"),
            ("WEBCARD_API_KEY", "secret"),
            ("WEBCARD_FETCH_RETRIES", "5"),
        ]
        .into_iter()
        .collect();

        let config = Config::default()
            .with_overrides(|key| vars.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.channel, "USB");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.fetch_retries, 5);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn env_override_rejects_bad_number() {
        let err = Config::default()
            .with_overrides(|key| (key == "WEBCARD_FETCH_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
