//! Remote command-definition service.
//!
//! The engine resolves command names into templates, generates dynamic
//! commands and checks sequence bindings through [`CommandService`]. The
//! HTTP implementation lives in [`http`] (feature `http`); tests use
//! [`crate::mock::MockService`].

#[cfg(feature = "http")]
pub mod http;
pub mod types;

#[cfg(feature = "http")]
pub use http::HttpCommandService;
pub use types::{
    AtrCandidates, CommandDefinition, CommandKey, OneOrMany, PersonalizationRequest,
    SupportedCard,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::reader::ApduTemplate;

/// The remote card-command service.
#[async_trait]
pub trait CommandService: Send + Sync {
    /// `GET /getSupportedCards`
    async fn supported_cards(&self) -> Result<Vec<SupportedCard>>;

    /// `GET /checkCardByAtr/{channel}/{atr}`
    async fn check_card_by_atr(&self, channel: &str, atr: &str) -> Result<AtrCandidates>;

    /// `GET /getCommand/{cardId}/{channel}/{commandName}`
    async fn get_command(&self, key: &CommandKey) -> Result<CommandDefinition>;

    /// Personalization lookup: `POST /generateCommand/{cardId}/{channel}/{commandName}`
    /// with the token and realm as body.
    async fn personalization_command(
        &self,
        key: &CommandKey,
        request: &PersonalizationRequest,
    ) -> Result<CommandDefinition>;

    /// `POST /generateCommand/{cardId}/{channel}/{commandName}` with the
    /// encrypted form payload. Returns one or more follow-up templates.
    async fn generate_command(&self, key: &CommandKey, data: &str) -> Result<Vec<ApduTemplate>>;

    /// `GET /verifyTokenByEmail/{token}/{email}`. `"0"` means unbound.
    async fn verify_token_by_email(&self, token: &str, email: &str) -> Result<String>;

    /// `GET /rollbackTokens/{token}`
    async fn rollback_token(&self, token: &str) -> Result<()>;

    /// `GET /listUserData`
    async fn list_user_data(&self) -> Result<Vec<Value>>;
}
