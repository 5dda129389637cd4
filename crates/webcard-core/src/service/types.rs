//! Wire types of the remote command-definition service.
//!
//! Field names follow the service's JSON (`Atr`, `Type`, `Response`,
//! `NeedGeneration`, ...). The service is loose about shapes, so flags accept
//! `1`, `"1"` and `true`, and identity lists accept a single string or an
//! array.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::reader::ApduTemplate;

/// Cache and lookup key of a command definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandKey {
    /// Identity of the recognized card.
    pub card_id: String,
    /// Lookup channel.
    pub channel: String,
    /// Command name.
    pub command: String,
}

impl CommandKey {
    /// Creates a key.
    #[must_use]
    pub fn new(
        card_id: impl Into<String>,
        channel: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            card_id: card_id.into(),
            channel: channel.into(),
            command: command.into(),
        }
    }
}

/// A card model the service supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedCard {
    /// ATR prefix, possibly written with `-` separators.
    #[serde(rename = "Atr")]
    pub atr: String,

    /// Card family.
    #[serde(rename = "Type", default)]
    pub family: String,
}

impl SupportedCard {
    /// Checks whether a reader's ATR belongs to this card model.
    #[must_use]
    pub fn matches(&self, atr: &str) -> bool {
        let prefix = self.atr.replace('-', "").to_ascii_uppercase();
        !prefix.is_empty() && atr.to_ascii_uppercase().starts_with(&prefix)
    }
}

/// A single value or a list of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single value.
    One(T),
    /// A list of values.
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Returns the values as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        }
    }
}

/// Candidate identities for an ATR.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AtrCandidates {
    /// Candidate card identifiers.
    #[serde(rename = "Id", default)]
    pub ids: Option<OneOrMany<String>>,

    /// Card family per candidate, or one family for all.
    #[serde(rename = "Type", default)]
    pub families: Option<OneOrMany<String>>,

    /// Identity-probe command that disambiguates candidates.
    #[serde(rename = "GetVersion", default)]
    pub probe: Option<ApduTemplate>,
}

impl AtrCandidates {
    /// Returns the candidate identifiers.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        self.ids.as_ref().map_or(&[], OneOrMany::as_slice)
    }

    /// Returns the family of the candidate at `index`. A single family
    /// applies to every candidate.
    #[must_use]
    pub fn family_at(&self, index: usize) -> Option<&str> {
        match self.families.as_ref()? {
            OneOrMany::One(family) => Some(family),
            OneOrMany::Many(families) => families.get(index).map(String::as_str),
        }
    }
}

/// A command definition as returned by `getCommand`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CommandDefinition {
    /// The command template.
    #[serde(rename = "Response", default)]
    pub template: Option<ApduTemplate>,

    /// Whether the template must be generated from form data first.
    #[serde(rename = "NeedGeneration", default, deserialize_with = "flag")]
    pub needs_generation: bool,

    /// Form describing the generation inputs.
    #[serde(rename = "Form", default)]
    pub form: Option<Value>,

    /// Whether the user must touch the sensor during transmission.
    #[serde(rename = "requireFingerPrint", default, deserialize_with = "flag")]
    pub presence_during: bool,

    /// Whether the user must touch the sensor before transmission.
    #[serde(rename = "requireFingerPrintBefore", default, deserialize_with = "flag")]
    pub presence_before: bool,
}

/// Session-specific fields sent with personalization lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalizationRequest {
    /// Enrollment token the card is personalized for.
    pub token: String,
    /// Realm of the token.
    pub realm: String,
}

/// Reads a service flag: `1`, `"1"`, `true` and `"true"` are set.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> core::result::Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(set) => set,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(s.trim(), "1" | "true"),
        _ => false,
    })
}

/// Fails on a `{Status: "error", Message}` envelope.
///
/// # Errors
///
/// Returns [`Error::Remote`] carrying the envelope's message.
pub fn check_envelope(operation: &str, body: &Value) -> Result<()> {
    if body.get("Status").and_then(Value::as_str) == Some("error") {
        let message = body
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(Error::Remote {
            operation: operation.to_string(),
            message: message.to_string(),
        });
    }
    Ok(())
}

/// Extracts the follow-up templates from a `generateCommand` response,
/// which is either one `{Response}` object or an array of them.
///
/// # Errors
///
/// Returns [`Error::Remote`] if the response holds no template.
pub fn generated_templates(body: Value) -> Result<Vec<ApduTemplate>> {
    let entries = match body {
        Value::Array(entries) => entries,
        single => vec![single],
    };
    let templates: Vec<ApduTemplate> = entries
        .into_iter()
        .filter_map(|mut entry| entry.get_mut("Response").map(Value::take))
        .map(serde_json::from_value)
        .collect::<core::result::Result<_, _>>()?;

    if templates.is_empty() || templates.iter().any(ApduTemplate::is_empty) {
        return Err(Error::Remote {
            operation: "generateCommand".to_string(),
            message: "response carries no command".to_string(),
        });
    }
    Ok(templates)
}

/// Extracts the supported cards from a `getSupportedCards` response.
///
/// # Errors
///
/// Returns [`Error::Remote`] for an error envelope and
/// [`Error::NoSupportedCards`] when the list is missing or empty.
pub fn supported_cards(mut body: Value) -> Result<Vec<SupportedCard>> {
    check_envelope("getSupportedCards", &body)?;
    let cards = body.get_mut("Cards").map(Value::take).unwrap_or_default();
    let cards: Vec<SupportedCard> = serde_json::from_value(cards).unwrap_or_default();
    if cards.is_empty() {
        return Err(Error::NoSupportedCards);
    }
    Ok(cards)
}

/// Extracts the user-data definitions from a `listUserData` response.
/// A missing or null `Uncrypted` field is an empty list.
///
/// # Errors
///
/// Returns [`Error::Remote`] for an error envelope and
/// [`Error::MalformedResponse`] when `Uncrypted` is not a list.
pub fn user_data(mut body: Value) -> Result<Vec<Value>> {
    check_envelope("listUserData", &body)?;
    match body.get_mut("Uncrypted").map(Value::take) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(entries)) => Ok(entries),
        Some(other) => Err(Error::MalformedResponse(format!(
            "listUserData: Uncrypted is not a list: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn supported_card_matching() {
        let card = SupportedCard {
            atr: "3B-8F-80-01".to_string(),
            family: "T".to_string(),
        };
        assert!(card.matches("3B8F8001804F0CA0000003"));
        assert!(card.matches("3b8f8001"));
        assert!(!card.matches("3B8E"));
    }

    #[test]
    fn atr_candidates_shapes() {
        let single: AtrCandidates =
            serde_json::from_value(json!({"Id": "card-1", "Type": "D"})).unwrap();
        assert_eq!(single.ids(), ["card-1"]);
        assert_eq!(single.family_at(0), Some("D"));
        assert!(single.probe.is_none());

        let many: AtrCandidates = serde_json::from_value(json!({
            "Id": ["card-1", "card-2"],
            "Type": ["F", "T"],
            "GetVersion": "80CA0000"
        }))
        .unwrap();
        assert_eq!(many.ids().len(), 2);
        assert_eq!(many.family_at(1), Some("T"));
        assert_eq!(many.family_at(2), None);
        assert_eq!(many.probe.unwrap().as_str(), "80CA0000");

        let none: AtrCandidates = serde_json::from_value(json!({})).unwrap();
        assert!(none.ids().is_empty());
    }

    #[test]
    fn definition_flags() {
        let definition: CommandDefinition = serde_json::from_value(json!({
            "Response": "00A4040000",
            "NeedGeneration": "1",
            "Form": "[]",
            "requireFingerPrint": 1,
            "requireFingerPrintBefore": 0
        }))
        .unwrap();
        assert!(definition.needs_generation);
        assert!(definition.presence_during);
        assert!(!definition.presence_before);

        let plain: CommandDefinition =
            serde_json::from_value(json!({"Response": "00A4", "NeedGeneration": 0})).unwrap();
        assert!(!plain.needs_generation);
        assert!(plain.form.is_none());
    }

    #[test]
    fn error_envelope() {
        let err = check_envelope("rollbackTokens", &json!({"Status": "error", "Message": "gone"}))
            .unwrap_err();
        assert_eq!(err.to_string(), "rollbackTokens failed: gone");
        assert!(check_envelope("rollbackTokens", &json!({"Status": "ok"})).is_ok());
    }

    #[test]
    fn generated_single_and_array() {
        let single = generated_templates(json!({"Response": "80A0"})).unwrap();
        assert_eq!(single, [ApduTemplate::new("80A0")]);

        let many =
            generated_templates(json!([{"Response": "01"}, {"Response": "02"}, {"Response": "03"}]))
                .unwrap();
        assert_eq!(many.len(), 3);
        assert_eq!(many[2].as_str(), "03");

        assert!(generated_templates(json!({"Status": "ok"})).is_err());
    }

    #[test]
    fn supported_cards_list() {
        let cards =
            supported_cards(json!({"Status": "ok", "Cards": [{"Atr": "3B-8F", "Type": "F"}]}))
                .unwrap();
        assert_eq!(cards[0].family, "F");

        assert!(matches!(
            supported_cards(json!({"Status": "ok", "Cards": []})).unwrap_err(),
            Error::NoSupportedCards
        ));
    }

    #[test]
    fn user_data_must_be_a_list() {
        let entries = user_data(json!({"Status": "ok", "Uncrypted": [{"id": 1}]})).unwrap();
        assert_eq!(entries, [json!({"id": 1})]);
        assert!(user_data(json!({"Status": "ok"})).unwrap().is_empty());

        let err = user_data(json!({"Status": "ok", "Uncrypted": "oops"})).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
        let err = user_data(json!({"Status": "error", "Message": "denied"})).unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));
    }
}
