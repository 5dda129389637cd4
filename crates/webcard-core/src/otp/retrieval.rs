use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use super::sequences::text;
use super::{Delivery, OtpContext, OtpSubmission, OtpType, SequenceEntry, TotpRefresher};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::presenter::UiEvent;
use crate::session::{CardFamily, CardSession};

/// Answer of the binding check for a sequence that is not the user's.
const UNBOUND: &str = "0";

/// Checks that `sequence` is bound to `email`.
///
/// # Errors
///
/// Returns [`Error::SequenceNotBound`] if the service answers `"0"`.
pub async fn ensure_bound(engine: &Engine, sequence: &str, email: &str) -> Result<()> {
    let answer = engine.service().verify_token_by_email(sequence, email).await?;
    if answer.trim() == UNBOUND {
        return Err(Error::SequenceNotBound(sequence.to_string()));
    }
    Ok(())
}

/// Reads the next HOTP of `sequence`.
///
/// # Errors
///
/// [`Error::AppletNotFound`] if the OTP applet is missing and
/// [`Error::OtpUnavailable`] if the card produces no OTP.
pub async fn read_hotp(engine: &Engine, session: &CardSession, sequence: &str) -> Result<String> {
    let (script, expected) = match session.family() {
        CardFamily::F => (format!("[SelectBeCard][ReadOtpToken {{OtpMode={sequence}}}]"), 2),
        CardFamily::T | CardFamily::D => (
            format!("[SelectBeCard][LoginBeCard][ReadHotpToken {{serial_no={sequence}}}]"),
            3,
        ),
        other => return Err(Error::UnsupportedFamily(other.to_string())),
    };

    let results = engine.run_checked(session, &script, expected).await?;
    if !results.ok(0) {
        return Err(Error::AppletNotFound("BeCard".to_string()));
    }
    let last = expected - 1;
    results
        .ok(last)
        .then(|| results.parsed(last))
        .flatten()
        .and_then(|data| data.get("Otp"))
        .filter(|otp| !otp.is_null())
        .map(text)
        .ok_or_else(|| Error::OtpUnavailable(sequence.to_string()))
}

/// Reads the current TOTP of `sequence`.
///
/// # Errors
///
/// [`Error::AppletNotFound`] if the OTP applet is missing and
/// [`Error::OtpUnavailable`] if login fails or no entry matches.
pub async fn read_totp(engine: &Engine, session: &CardSession, sequence: &str) -> Result<String> {
    const SCRIPT: &str = "[SelectBeCard][LoginBeCard][ReadTotpToken {timestamp=}]";

    let results = engine.run_checked(session, SCRIPT, 3).await?;
    if !results.ok(0) {
        return Err(Error::AppletNotFound("BeCard".to_string()));
    }
    results
        .ok(2)
        .then(|| results.parsed(2))
        .flatten()
        .and_then(|data| totp_for(data, sequence))
        .ok_or_else(|| Error::OtpUnavailable(sequence.to_string()))
}

/// Picks the TOTP of `sequence` from a `ReadTotpToken` response.
///
/// `Otp` and `Serial_no` are parallel lists; entries that are themselves
/// lists are skipped.
#[must_use]
pub fn totp_for(data: &Map<String, Value>, sequence: &str) -> Option<String> {
    let otps = data.get("Otp")?.as_array()?;
    let serials = data.get("Serial_no")?.as_array()?;
    otps.iter()
        .zip(serials)
        .find(|(otp, serial)| !otp.is_array() && text(serial) == sequence)
        .map(|(otp, _)| text(otp))
}

/// Retrieves an OTP for `entry` and delivers it.
///
/// HOTPs are read once. TOTPs shown to the user start `refresher`, which
/// keeps reading until stopped; relayed TOTPs are read once.
///
/// # Errors
///
/// [`Error::SequenceNotBound`] before any card access if the sequence is
/// not the user's, then the read errors.
pub async fn retrieve(
    engine: &Arc<Engine>,
    session: &CardSession,
    context: &OtpContext,
    entry: &SequenceEntry,
    refresher: &TotpRefresher,
) -> Result<()> {
    refresher.stop();
    ensure_bound(engine, &entry.label, &context.email).await?;

    match (entry.otp_type, &context.delivery) {
        (OtpType::Totp, Delivery::Display) => {
            refresher.start(Arc::clone(engine), session.clone(), entry.label.clone());
            Ok(())
        }
        (OtpType::Totp, Delivery::Relay(_)) => {
            let otp = read_totp(engine, session, &entry.label).await?;
            deliver(engine, context, entry, otp).await
        }
        (OtpType::Hotp, _) => {
            let otp = read_hotp(engine, session, &entry.label).await?;
            deliver(engine, context, entry, otp).await
        }
    }
}

async fn deliver(
    engine: &Engine,
    context: &OtpContext,
    entry: &SequenceEntry,
    otp: String,
) -> Result<()> {
    match &context.delivery {
        Delivery::Display => {
            engine.emit(UiEvent::OtpAvailable {
                sequence: entry.label.clone(),
                otp_type: entry.otp_type,
                otp,
            });
            Ok(())
        }
        Delivery::Relay(relay) => {
            debug!(sequence = %entry.label, "relaying OTP");
            relay
                .submit(OtpSubmission {
                    otp,
                    sequence: entry.label.clone(),
                    email: context.email.clone(),
                })
                .await
        }
    }
}

/// Deletes `sequence` from the card and rolls its token back remotely.
///
/// # Errors
///
/// [`Error::SequenceNotBound`] before any card access if the sequence is
/// not the user's, and [`Error::CommandFailed`] if the card refuses the
/// deletion. Nothing is rolled back in either case.
pub async fn delete_sequence(
    engine: &Engine,
    session: &CardSession,
    email: &str,
    sequence: &str,
) -> Result<()> {
    ensure_bound(engine, sequence, email).await?;

    let script = format!("[SelectBeCard][LoginBeCard][DeleteOtpToken {{sequence={sequence}}}]");
    let results = engine.run_checked(session, &script, 3).await?;
    if !(0..results.len()).all(|i| results.ok(i)) {
        return Err(Error::CommandFailed("DeleteOtpToken".to_string()));
    }

    engine.service().rollback_token(sequence).await?;
    info!(sequence, "sequence deleted");
    engine.emit(UiEvent::SequenceDeleted {
        sequence: sequence.to_string(),
    });
    Ok(())
}
