//! Dynamic-form data for server-generated commands.
//!
//! Some commands cannot be sent as-is: the service describes a form, the
//! engine fills it and the service turns the filled form into one or more
//! concrete commands. A form field is filled from, in order:
//!
//! 1. a script parameter with the field's key (`timestamp` is replaced by
//!    the current TOTP epoch),
//! 2. the user, choosing among the values of the previous command's first
//!    output field.
//!
//! Fields that carry their own data and the `submit` button are skipped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::script::Params;

/// Key of the form's submit button.
const SUBMIT_KEY: &str = "submit";

/// Parameter key replaced by the current TOTP epoch.
const TIMESTAMP_KEY: &str = "timestamp";

/// A field the user must choose a value for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormChoice {
    /// Field key.
    pub key: String,
    /// Values to choose from.
    pub options: Vec<Value>,
    /// Preselected value.
    pub default: Option<Value>,
}

/// How a form is going to be filled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormPlan {
    /// Values taken from script parameters.
    pub fixed: Map<String, Value>,
    /// Fields left to the user.
    pub choices: Vec<FormChoice>,
}

impl FormPlan {
    /// Checks whether the user has to fill anything.
    #[must_use]
    pub fn needs_input(&self) -> bool {
        !self.choices.is_empty()
    }

    /// Combines the fixed values with the user's submission. Submitted
    /// values win and the submit button is dropped.
    #[must_use]
    pub fn merge(self, submission: Map<String, Value>) -> Map<String, Value> {
        let mut data = self.fixed;
        data.extend(
            submission
                .into_iter()
                .filter(|(key, _)| key != SUBMIT_KEY),
        );
        data
    }
}

/// Returns the TOTP epoch for `now`: whole periods since the Unix epoch.
#[must_use]
pub fn totp_epoch(now: DateTime<Utc>, period_secs: u64) -> i64 {
    let period = i64::try_from(period_secs).unwrap_or(i64::MAX).max(1);
    now.timestamp().div_euclid(period)
}

/// Plans how to fill `form`.
///
/// `form` is the service's form description, either a JSON array of field
/// objects or a string holding one. Anything else yields an empty plan.
///
/// # Errors
///
/// Returns [`crate::Error::JsonError`] if a string form is not valid JSON.
pub fn plan(
    form: Option<&Value>,
    previous: &Map<String, Value>,
    params: Option<&Params>,
    now: DateTime<Utc>,
    period_secs: u64,
) -> Result<FormPlan> {
    let parsed;
    let fields = match form {
        Some(Value::String(text)) => {
            parsed = serde_json::from_str::<Value>(text)?;
            parsed.as_array()
        }
        Some(value) => value.as_array(),
        None => None,
    };
    let Some(fields) = fields else {
        return Ok(FormPlan::default());
    };

    let mut plan = FormPlan::default();
    for field in fields {
        let Some(key) = field.get("key").and_then(Value::as_str) else {
            continue;
        };
        let has_data = field.get("data").is_some_and(|data| !data.is_null());
        let param = params.and_then(|p| p.get(key));

        match param {
            Some(_) if key == TIMESTAMP_KEY => {
                plan.fixed
                    .insert(key.to_string(), totp_epoch(now, period_secs).into());
            }
            Some(value) => {
                plan.fixed.insert(key.to_string(), Value::String(value.clone()));
            }
            None if !has_data && key != SUBMIT_KEY => {
                let options = choice_options(previous);
                plan.choices.push(FormChoice {
                    key: key.to_string(),
                    default: options.first().cloned(),
                    options,
                });
            }
            None => {}
        }
    }
    Ok(plan)
}

/// Options offered for a user choice: the values of the previous result's
/// first field.
fn choice_options(previous: &Map<String, Value>) -> Vec<Value> {
    match previous.values().next() {
        Some(Value::Array(values)) => values.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(value) => vec![value.clone()],
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_015, 0).single().unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn epoch_floors() {
        assert_eq!(totp_epoch(now(), 30), 56_666_667);
        let boundary = Utc.timestamp_opt(59, 0).single().unwrap();
        assert_eq!(totp_epoch(boundary, 30), 1);
    }

    #[test]
    fn timestamp_parameter_is_epoch() {
        let form = json!([{"key": "timestamp"}, {"key": "submit"}]);
        let plan = plan(
            Some(&form),
            &Map::new(),
            Some(&params(&[("timestamp", "")])),
            now(),
            30,
        )
        .unwrap();

        assert!(!plan.needs_input());
        assert_eq!(plan.fixed["timestamp"], json!(56_666_667));
    }

    #[test]
    fn string_form_and_fixed_params() {
        let form = json!(r#"[{"key": "serial_no"}, {"key": "label", "data": {"values": []}}]"#);
        let plan = plan(
            Some(&form),
            &Map::new(),
            Some(&params(&[("serial_no", "otp-7")])),
            now(),
            30,
        )
        .unwrap();

        assert_eq!(plan.fixed["serial_no"], json!("otp-7"));
        assert_eq!(plan.fixed.len(), 1);
        assert!(plan.choices.is_empty());
    }

    #[test]
    fn choices_from_previous_result() {
        let form = json!([{"key": "account"}, {"key": "submit"}]);
        let previous = json!({"Account": ["alice", "bob"], "Other": [1]})
            .as_object()
            .cloned()
            .unwrap();
        let plan = plan(Some(&form), &previous, None, now(), 30).unwrap();

        assert!(plan.needs_input());
        assert_eq!(plan.choices[0].key, "account");
        assert_eq!(plan.choices[0].options, [json!("alice"), json!("bob")]);
        assert_eq!(plan.choices[0].default, Some(json!("alice")));
    }

    #[test]
    fn choices_follow_the_card_field_order() {
        let form = json!([{"key": "serial_no"}, {"key": "submit"}]);
        let previous: Map<String, Value> =
            serde_json::from_str(r#"{"Serial_no": ["5", "6"], "Account_len": [1]}"#).unwrap();
        let plan = plan(Some(&form), &previous, None, now(), 30).unwrap();

        assert_eq!(plan.choices[0].options, [json!("5"), json!("6")]);
        assert_eq!(plan.choices[0].default, Some(json!("5")));
    }

    #[test]
    fn invalid_forms_yield_empty_plan() {
        assert_eq!(
            plan(Some(&json!("[]")), &Map::new(), None, now(), 30).unwrap(),
            FormPlan::default()
        );
        assert_eq!(
            plan(Some(&json!({"key": "x"})), &Map::new(), None, now(), 30).unwrap(),
            FormPlan::default()
        );
        assert!(plan(Some(&json!("not json")), &Map::new(), None, now(), 30).is_err());
    }

    #[test]
    fn merge_prefers_submission() {
        let mut fixed = Map::new();
        fixed.insert("serial_no".into(), json!("1"));
        let plan = FormPlan {
            fixed,
            choices: Vec::new(),
        };
        let submission = json!({"serial_no": "2", "account": "bob", "submit": true})
            .as_object()
            .cloned()
            .unwrap();

        let data = plan.merge(submission);
        assert_eq!(data["serial_no"], json!("2"));
        assert_eq!(data["account"], json!("bob"));
        assert!(!data.contains_key("submit"));
    }
}
