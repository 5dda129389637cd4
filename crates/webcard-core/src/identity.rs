//! Identity data stored on the card.
//!
//! The identity applet stores one text blob split over fixed-size chunks.
//! Categories are separated by `#`, items within a category by `>`, and an
//! item's label and value by `?`:
//!
//! ```text
//! #Personal>Name?Ada>Surname?Lovelace#Contact>Email?ada@example.com
//! ```

use serde::Serialize;
use serde_json::{Map, Value};

use crate::classify::{is_success_with, parse};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::session::CardSession;

/// One labelled value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityItem {
    /// Category the item belongs to.
    pub category: String,
    /// Field label.
    pub label: String,
    /// Field value.
    pub value: String,
}

/// Identity data read from a card.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityData {
    /// Field definitions from the remote service.
    pub definitions: Vec<Value>,
    /// Items stored on the card.
    pub items: Vec<IdentityItem>,
}

/// Reads the identity data of the session's card.
///
/// Chunks the card fails to return are skipped.
///
/// # Errors
///
/// Returns [`Error::AppletNotFound`] if the identity applet is missing.
pub async fn read_identity(engine: &Engine, session: &CardSession) -> Result<IdentityData> {
    let definitions = engine.service().list_user_data().await?;

    let select = engine.run_checked(session, "[SelectIdentityApp]", 1).await?;
    if !select.ok(0) {
        return Err(Error::AppletNotFound("Identity".to_string()));
    }

    let chunks = engine.config().identity_chunks;
    let script: String = (0..chunks)
        .map(|chunk| format!("[readAlldata {{chunk_id={chunk}}}]"))
        .collect();
    let results = engine.run_checked(session, &script, usize::from(chunks)).await?;

    let accept_code = &engine.config().accept_code;
    let text: String = (0..results.len())
        .filter(|&i| is_success_with(results.get(i), accept_code))
        .filter_map(|i| parse(results.get(i)).and_then(chunk_text))
        .collect();

    Ok(IdentityData {
        definitions,
        items: parse_identity_blob(&text),
    })
}

/// Decodes `Chunk[0]`, a list of byte values, into text.
fn chunk_text(data: &Map<String, Value>) -> Option<String> {
    let bytes = data.get("Chunk")?.as_array()?.first()?.as_array()?;
    Some(
        bytes
            .iter()
            .filter_map(Value::as_u64)
            .filter_map(|byte| u8::try_from(byte).ok())
            .map(char::from)
            .collect(),
    )
}

/// Splits an identity blob into items. NUL padding is dropped.
#[must_use]
pub fn parse_identity_blob(text: &str) -> Vec<IdentityItem> {
    let text = text.replace('\0', "");
    text.split('#')
        .filter(|category| !category.is_empty())
        .flat_map(|category| {
            let mut elements = category.split('>');
            let name = elements.next().unwrap_or_default();
            elements.map(move |element| {
                let (label, value) = element.split_once('?').unwrap_or((element, ""));
                IdentityItem {
                    category: name.to_string(),
                    label: label.to_string(),
                    value: value.to_string(),
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn blob_categories_and_items() {
        let items =
            parse_identity_blob("#Personal>Name?Ada>Surname?Lovelace#Contact>Email?ada@x.org\0\0");
        assert_eq!(items.len(), 3);
        assert_eq!(
            items[1],
            IdentityItem {
                category: "Personal".to_string(),
                label: "Surname".to_string(),
                value: "Lovelace".to_string(),
            }
        );
        assert_eq!(items[2].category, "Contact");
        assert_eq!(items[2].value, "ada@x.org");
    }

    #[test]
    fn item_without_value() {
        let items = parse_identity_blob("Notes>Empty");
        assert_eq!(items[0].label, "Empty");
        assert_eq!(items[0].value, "");
        assert!(parse_identity_blob("").is_empty());
    }

    #[test]
    fn chunk_bytes_to_text() {
        let data = json!({"Chunk": [[35, 65, 62, 66, 63, 67, 0]]});
        assert_eq!(
            chunk_text(data.as_object().unwrap()).as_deref(),
            Some("#A>B?C\0")
        );
    }
}
