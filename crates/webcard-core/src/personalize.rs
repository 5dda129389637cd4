//! Card personalization.
//!
//! A factory-fresh card is bound to an enrollment token: the card's UUID
//! must equal the token and the card must not carry OTP sequences yet.
//! Personalization commands are looked up with the token and realm of the
//! session and never cached.

use serde_json::Value;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::otp::list_sequences;
use crate::presenter::{Confirmation, Level, UiEvent};
use crate::service::PersonalizationRequest;
use crate::session::{CardFamily, CardSession};

/// Personalizes the session's card for `request.token`.
///
/// Returns `false` when the user declines.
///
/// # Errors
///
/// - [`Error::AppletNotFound`] if an applet cannot be selected
/// - [`Error::CardIdMismatch`] if the card UUID differs from the token
/// - [`Error::CardInUse`] if the card already holds sequences
/// - [`Error::CommandFailed`] if the card refuses the personalization;
///   for families T/D the token is rolled back first
pub async fn personalize(
    engine: &Engine,
    session: &CardSession,
    request: &PersonalizationRequest,
) -> Result<bool> {
    engine
        .resolver()
        .set_personalization(Some(request.clone()));

    match session.family() {
        CardFamily::F => {
            check_uuid_f(engine, session, &request.token).await?;
            ensure_empty(engine, session).await?;
            if !ready(engine).await {
                return Ok(false);
            }

            let results = engine
                .run_checked(session, "[SelectBeCard][PersonalizeF]", 2)
                .await?;
            if !results.ok(0) {
                return Err(Error::AppletNotFound("BeCard".to_string()));
            }
            if !results.ok(1) {
                return Err(Error::CommandFailed("PersonalizeF".to_string()));
            }
        }
        CardFamily::T | CardFamily::D => {
            let results = engine
                .run_checked(session, "[SelectWibioApp][GetCardUuid_V2]", 2)
                .await?;
            if !results.ok(0) {
                return Err(Error::AppletNotFound("Wibio".to_string()));
            }
            check_uuid(results.ok(1).then(|| results.parsed(1)).flatten(), &request.token)?;
            ensure_empty(engine, session).await?;
            if !ready(engine).await {
                return Ok(false);
            }

            let script = format!("[PersonalizeD {{token={}}}]", request.token);
            let results = engine.run_checked(session, &script, 1).await?;
            if !results.ok(0) {
                warn!(token = %request.token, "personalization failed, rolling back token");
                engine.service().rollback_token(&request.token).await?;
                return Err(Error::CommandFailed("PersonalizeD".to_string()));
            }
        }
        other => return Err(Error::UnsupportedFamily(other.to_string())),
    }

    info!(card_id = session.card_id(), "card personalized");
    engine.emit(UiEvent::message(Level::Info, "Card data updated successfully"));
    engine.emit(UiEvent::PersonalizationComplete);
    Ok(true)
}

/// Family F: older applets report `CardType` on select and use the first
/// UUID command.
async fn check_uuid_f(engine: &Engine, session: &CardSession, token: &str) -> Result<()> {
    let select = engine.run_checked(session, "[SelectWibioApp]", 1).await?;
    if !select.ok(0) {
        return Err(Error::AppletNotFound("Wibio".to_string()));
    }
    let legacy = select
        .parsed(0)
        .is_some_and(|data| data.contains_key("CardType"));
    let script = if legacy {
        "[GetCardUuid]"
    } else {
        "[GetCardUuid_V2]"
    };

    let results = engine.run_checked(session, script, 1).await?;
    check_uuid(results.ok(0).then(|| results.parsed(0)).flatten(), token)
}

fn check_uuid(data: Option<&serde_json::Map<String, Value>>, token: &str) -> Result<()> {
    let uuid = data
        .and_then(|data| data.get("uuid"))
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| Error::CommandFailed("GetCardUuid".to_string()))?;
    if uuid != token {
        return Err(Error::CardIdMismatch {
            expected: token.to_string(),
            actual: uuid.to_string(),
        });
    }
    Ok(())
}

async fn ensure_empty(engine: &Engine, session: &CardSession) -> Result<()> {
    let in_use = match list_sequences(engine, session).await {
        Ok(entries) => !entries.is_empty(),
        // An unreadable sequence table is what an empty card reports.
        Err(Error::CommandFailed(_)) => false,
        Err(e) => return Err(e),
    };
    if in_use {
        engine.emit(UiEvent::message(
            Level::Error,
            "Card already in use, to perform this operation you need a factory resetted card",
        ));
        return Err(Error::CardInUse);
    }
    Ok(())
}

async fn ready(engine: &Engine) -> bool {
    engine.emit(UiEvent::message(
        Level::Info,
        "Card personalization available, this card is empty",
    ));
    engine.emit(UiEvent::PersonalizationReady);
    engine.presenter().confirm(Confirmation::Personalize).await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn uuid_must_match_token() {
        let data = json!({"uuid": "tok-1"});
        assert!(check_uuid(data.as_object(), "tok-1").is_ok());
        assert!(matches!(
            check_uuid(data.as_object(), "tok-2"),
            Err(Error::CardIdMismatch { .. })
        ));
        assert!(matches!(
            check_uuid(None, "tok-1"),
            Err(Error::CommandFailed(_))
        ));
    }
}
