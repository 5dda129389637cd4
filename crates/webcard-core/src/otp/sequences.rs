use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use super::{OtpContext, OtpType, SequenceEntry, TotpRefresher, retrieve};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::presenter::{Level, UiEvent};
use crate::session::{CardFamily, CardSession};

const LIST_F: &str = "[SelectBeCard][ReadSequenceInfo]";
const LIST_TD: &str = "[SelectBeCard][LoginBeCard][ReadSequenceInfo]";

/// What discovery found on the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceSelection {
    /// No sequence; retrieval is unavailable.
    None,
    /// One sequence, retrieved right away.
    Single(SequenceEntry),
    /// Several sequences for the user to choose from.
    Many(Vec<SequenceEntry>),
}

impl From<Vec<SequenceEntry>> for SequenceSelection {
    fn from(mut entries: Vec<SequenceEntry>) -> Self {
        match entries.len() {
            0 => Self::None,
            1 => Self::Single(entries.remove(0)),
            _ => Self::Many(entries),
        }
    }
}

/// Reads the OTP sequences stored on the card.
///
/// # Errors
///
/// - [`Error::AppletNotFound`] if the OTP applet cannot be selected
/// - [`Error::LoginFailed`] if fingerprint login is refused (families T/D)
/// - [`Error::UnsupportedFamily`] for cards without OTP sequences
pub async fn list_sequences(engine: &Engine, session: &CardSession) -> Result<Vec<SequenceEntry>> {
    match session.family() {
        CardFamily::F => {
            let results = engine.run_checked(session, LIST_F, 2).await?;
            if !results.ok(0) {
                return Err(Error::AppletNotFound("BeCard".to_string()));
            }
            if !results.ok(1) {
                return Err(Error::CommandFailed("ReadSequenceInfo".to_string()));
            }
            Ok(results.parsed(1).map(hotp_sequences).unwrap_or_default())
        }
        CardFamily::T | CardFamily::D => {
            let results = engine.run_checked(session, LIST_TD, 3).await?;
            if !results.ok(0) {
                return Err(Error::AppletNotFound("BeCard".to_string()));
            }
            if !results.ok(2) {
                return Err(Error::LoginFailed);
            }
            Ok(results.parsed(2).map(accounts).unwrap_or_default())
        }
        other => Err(Error::UnsupportedFamily(other.to_string())),
    }
}

/// Lists the card's sequences and reports them.
///
/// A single sequence is retrieved immediately with `context`.
///
/// # Errors
///
/// Returns listing errors and, for a single sequence, retrieval errors.
pub async fn discover(
    engine: &Arc<Engine>,
    session: &CardSession,
    context: &OtpContext,
    refresher: &TotpRefresher,
) -> Result<SequenceSelection> {
    let selection = SequenceSelection::from(list_sequences(engine, session).await?);
    debug!(card_id = session.card_id(), ?selection, "sequences discovered");

    match &selection {
        SequenceSelection::None => {
            engine.emit(UiEvent::NoSequences);
            engine.emit(UiEvent::message(
                Level::Warning,
                "This card is not associated with any OTP sequence. \
                 Please contact the administrator to associate the card with an OTP sequence",
            ));
        }
        SequenceSelection::Single(entry) => {
            engine.emit(UiEvent::SequencesListed(vec![entry.clone()]));
            retrieve(engine, session, context, entry, refresher).await?;
        }
        SequenceSelection::Many(entries) => {
            engine.emit(UiEvent::SequencesListed(entries.clone()));
        }
    }
    Ok(selection)
}

/// Family F: `Sequence` lists HOTP sequence numbers.
fn hotp_sequences(data: &Map<String, Value>) -> Vec<SequenceEntry> {
    array(data, "Sequence")
        .iter()
        .map(|sequence| SequenceEntry::new(OtpType::Hotp, text(sequence)))
        .collect()
}

/// Families T/D: `Account` and `OTP_type` are parallel lists; a zero
/// `Account_len[0]` means the card is empty.
fn accounts(data: &Map<String, Value>) -> Vec<SequenceEntry> {
    let empty = array(data, "Account_len")
        .first()
        .is_none_or(|len| text(len).trim() == "0");
    if empty {
        return Vec::new();
    }

    let types = array(data, "OTP_type");
    array(data, "Account")
        .iter()
        .enumerate()
        .map(|(i, account)| {
            let otp_type = types
                .get(i)
                .map_or(OtpType::Hotp, |label| OtpType::from_label(&text(label)));
            SequenceEntry::new(otp_type, text(account))
        })
        .collect()
}

fn array<'a>(data: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    data.get(key)
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

/// A scalar as text: strings as-is, anything else as JSON.
pub(super) fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
