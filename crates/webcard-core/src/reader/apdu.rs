//! APDU command templates and responses.
//!
//! The remote service hands out command templates. A template is opaque to
//! the engine and is passed to the reader together with the command's
//! parameters. Readers that speak raw ISO 7816-4 read the template as hex
//! with `{key}` placeholders:
//!
//! ```text
//! 80 CA 00 {slot} 00
//! ```
//!
//! # APDU Response Structure
//!
//! ```text
//! | Data | SW1 | SW2 |
//! |------|-----|-----|
//! | Var  | 1B  | 1B  |
//! ```
//!
//! # Example
//!
//! ```
//! use webcard_core::reader::{ApduResponse, ApduTemplate};
//! use webcard_core::script::Params;
//!
//! let template = ApduTemplate::new("00A40400{aid}");
//! let params = Params::from([("aid".to_string(), "A000".to_string())]);
//! assert_eq!(template.render(Some(&params)).unwrap(), vec![0x00, 0xA4, 0x04, 0x00, 0xA0, 0x00]);
//!
//! let response = ApduResponse::parse(&[0x01, 0x02, 0x90, 0x00]).unwrap();
//! assert_eq!(response.status_code(), "9000");
//! ```

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::script::Params;

/// A command template as delivered by the remote service.
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ApduTemplate(String);

impl ApduTemplate {
    /// Wraps template text.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Returns the template text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks whether the template is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Renders the template into APDU bytes.
    ///
    /// Each `{key}` placeholder is replaced by the hex value of the matching
    /// parameter, whitespace is ignored, and the result is hex-decoded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] for a placeholder without a
    /// parameter and [`Error::HexDecodeFailed`] if the result is not hex.
    pub fn render(&self, params: Option<&Params>) -> Result<Vec<u8>> {
        let mut hex_text = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();

        while let Some(start) = rest.find('{') {
            hex_text.push_str(&rest[..start]);
            let end = rest[start..].find('}').ok_or_else(|| {
                Error::MalformedResponse(format!("unterminated placeholder in {}", self.0))
            })? + start;
            let key = &rest[start + 1..end];
            let value = params.and_then(|p| p.get(key)).ok_or_else(|| {
                Error::MalformedResponse(format!("no value for placeholder {{{key}}}"))
            })?;
            hex_text.push_str(value);
            rest = &rest[end + 1..];
        }
        hex_text.push_str(rest);
        hex_text.retain(|c| !c.is_whitespace());

        Ok(hex::decode(hex_text)?)
    }
}

impl fmt::Debug for ApduTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ApduTemplate").field(&self.0).finish()
    }
}

impl fmt::Display for ApduTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ApduTemplate {
    /// Accepts a string as-is and any other JSON value as its compact text,
    /// since the service may describe a command as an object.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(text) => Self(text),
            Value::Null => Self(String::new()),
            other => Self(other.to_string()),
        })
    }
}

/// An APDU response from a smart card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    /// Response data.
    data: Vec<u8>,

    /// Status word 1.
    sw1: u8,

    /// Status word 2.
    sw2: u8,
}

impl ApduResponse {
    /// Success status word (0x9000).
    pub const SW_SUCCESS: u16 = 0x9000;

    /// Splits raw response bytes into data and status word.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] if fewer than two bytes arrived.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let [data @ .., sw1, sw2] = bytes else {
            return Err(Error::MalformedResponse("response too short".to_string()));
        };
        Ok(Self {
            data: data.to_vec(),
            sw1: *sw1,
            sw2: *sw2,
        })
    }

    /// Returns the response data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the full status word as a [`u16`].
    #[must_use]
    pub const fn status_word(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Returns the status word as uppercase hex, the form used as a raw
    /// status code.
    #[must_use]
    pub fn status_code(&self) -> String {
        format!("{:04X}", self.status_word())
    }

    /// Checks if the response indicates success (`SW = 0x9000`).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status_word() == Self::SW_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn render_without_placeholders() {
        let template = ApduTemplate::new("00 A4 04 00 02 A0 00");
        assert_eq!(
            template.render(None).unwrap(),
            vec![0x00, 0xA4, 0x04, 0x00, 0x02, 0xA0, 0x00]
        );
    }

    #[test]
    fn render_missing_parameter() {
        let template = ApduTemplate::new("80CA00{slot}00");
        let err = template.render(None).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn render_rejects_non_hex() {
        let template = ApduTemplate::new("ZZ");
        assert!(matches!(
            template.render(None).unwrap_err(),
            Error::HexDecodeFailed(_)
        ));
    }

    #[test]
    fn template_from_json_object() {
        let template: ApduTemplate = serde_json::from_value(json!({"apdu": "00A4"})).unwrap();
        assert_eq!(template.as_str(), r#"{"apdu":"00A4"}"#);

        let empty: ApduTemplate = serde_json::from_value(Value::Null).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn response_parse() {
        let response = ApduResponse::parse(&[0x6A, 0x82]).unwrap();
        assert!(response.data().is_empty());
        assert!(!response.is_success());
        assert_eq!(response.status_code(), "6A82");

        assert!(ApduResponse::parse(&[0x90]).is_err());
    }
}
