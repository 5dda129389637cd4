//! Reader capability.
//!
//! The engine never talks to a concrete reader. It goes through two traits:
//!
//! - [`ReaderSession`]: one reader slot with connect, transceive and
//!   disconnect.
//! - [`ReaderHost`]: the host environment that enumerates readers, encrypts
//!   dynamic-form payloads and hands out the API key.
//!
//! Reader and card changes are delivered as [`ReaderEvent`]s on a channel.
//!
//! Implementations:
//!
//! - [`crate::mock`]: scripted in-memory readers for tests and demos
//! - [`PcscReader`]: PC/SC hardware access (feature `pcsc`)

pub mod apdu;

#[cfg(feature = "pcsc")]
pub mod pcsc;

pub use apdu::{ApduResponse, ApduTemplate};

#[cfg(feature = "pcsc")]
pub use pcsc::{PcscHost, PcscReader};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::script::Params;

/// Name and ATR of a reader slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderInfo {
    /// Reader name as reported by the host.
    pub name: String,

    /// ATR of the inserted card as uppercase hex, `None` when the slot is
    /// empty.
    pub atr: Option<String>,
}

impl ReaderInfo {
    /// Creates reader info, normalizing an empty ATR to `None`.
    #[must_use]
    pub fn new(name: impl Into<String>, atr: Option<String>) -> Self {
        Self {
            name: name.into(),
            atr: atr
                .map(|atr| atr.replace([' ', ':', '-'], "").to_ascii_uppercase())
                .filter(|atr| !atr.is_empty()),
        }
    }
}

/// What a reader returns for one transceived command.
///
/// `response` is the decoded structured output, `raw` the bare status code
/// and `index` the position of the matching entry when the command is an
/// identity probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Structured response fields.
    #[serde(rename = "cmdRes", default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Map<String, Value>>,

    /// Raw status code, e.g. `"9000"`.
    #[serde(rename = "cmdRaw", default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,

    /// Index of the matching candidate for identity probes.
    #[serde(rename = "cmdIdx", default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl CommandOutcome {
    /// An outcome carrying structured fields.
    #[must_use]
    pub fn structured(response: Map<String, Value>) -> Self {
        Self {
            response: Some(response),
            ..Self::default()
        }
    }

    /// An outcome carrying only a raw status code.
    #[must_use]
    pub fn raw(code: impl Into<String>) -> Self {
        Self {
            raw: Some(code.into()),
            ..Self::default()
        }
    }

    /// Attaches a probe index.
    #[must_use]
    pub const fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    /// Returns the payload, preferring structured fields over the raw code.
    #[must_use]
    pub fn payload(&self) -> Option<Payload> {
        match (&self.response, &self.raw) {
            (Some(response), _) => Some(Payload::Structured(response.clone())),
            (None, Some(raw)) => Some(Payload::Raw(raw.clone())),
            (None, None) => None,
        }
    }
}

/// The payload of an executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Decoded response fields.
    Structured(Map<String, Value>),

    /// Bare status code.
    Raw(String),
}

/// A reader slot the engine can run commands against.
///
/// Implementations use interior mutability so a session can be shared
/// between the page controller and a running workflow.
#[async_trait]
pub trait ReaderSession: Send + Sync {
    /// Returns the reader's name and the card's ATR.
    fn info(&self) -> &ReaderInfo;

    /// Connects to the card. `exclusive` requests sole access for the
    /// duration of a script run.
    ///
    /// # Errors
    ///
    /// Returns an error if the card cannot be reached.
    async fn connect(&self, exclusive: bool) -> Result<()>;

    /// Sends one command template with its parameters.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure. The execution engine records
    /// such failures as incomplete results.
    async fn transceive(
        &self,
        template: &ApduTemplate,
        params: Option<&Params>,
    ) -> Result<CommandOutcome>;

    /// Releases the card.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader refuses to disconnect.
    async fn disconnect(&self) -> Result<()>;
}

/// The host environment providing readers and payload encryption.
#[async_trait]
pub trait ReaderHost: Send + Sync {
    /// Lists the attached readers.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader subsystem is unavailable.
    async fn readers(&self) -> Result<Vec<Arc<dyn ReaderSession>>>;

    /// Encrypts a dynamic-form payload before it is sent to the remote
    /// service.
    ///
    /// # Errors
    ///
    /// Returns an error if no encryption is available.
    async fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// Returns the API key for the remote service.
    ///
    /// # Errors
    ///
    /// Returns an error if the host has no key.
    async fn api_key(&self) -> Result<String>;
}

/// Reader and card changes reported by the host.
#[derive(Clone)]
pub enum ReaderEvent {
    /// A card was placed in a reader.
    CardInserted(Arc<dyn ReaderSession>),

    /// The card was taken out of the named reader.
    CardRemoved {
        /// Name of the reader.
        reader: String,
    },

    /// A reader was attached.
    ReadersConnected,

    /// A reader was detached.
    ReadersDisconnected,
}

impl fmt::Debug for ReaderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CardInserted(reader) => f
                .debug_tuple("CardInserted")
                .field(&reader.info().name)
                .finish(),
            Self::CardRemoved { reader } => {
                f.debug_struct("CardRemoved").field("reader", reader).finish()
            }
            Self::ReadersConnected => f.write_str("ReadersConnected"),
            Self::ReadersDisconnected => f.write_str("ReadersDisconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reader_info_normalizes_atr() {
        let info = ReaderInfo::new("ACS", Some("3b:8f-80 01".to_string()));
        assert_eq!(info.atr.as_deref(), Some("3B8F8001"));

        let empty = ReaderInfo::new("ACS", Some(String::new()));
        assert_eq!(empty.atr, None);
    }

    #[test]
    fn outcome_prefers_structured_payload() {
        let map = json!({"Otp": "123456"}).as_object().cloned().unwrap();
        let outcome = CommandOutcome {
            response: Some(map.clone()),
            raw: Some("9000".to_string()),
            index: None,
        };
        assert_eq!(outcome.payload(), Some(Payload::Structured(map)));
        assert_eq!(
            CommandOutcome::raw("6A82").payload(),
            Some(Payload::Raw("6A82".to_string()))
        );
        assert_eq!(CommandOutcome::default().payload(), None);
    }

    #[test]
    fn outcome_wire_names() {
        let outcome: CommandOutcome =
            serde_json::from_value(json!({"cmdRaw": "9000", "cmdIdx": 1})).unwrap();
        assert_eq!(outcome.raw.as_deref(), Some("9000"));
        assert_eq!(outcome.index, Some(1));
        assert!(outcome.response.is_none());
    }
}
