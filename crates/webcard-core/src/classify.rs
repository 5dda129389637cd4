//! Response classification.
//!
//! Three pure functions decide what an [`ExecutionResult`] means:
//!
//! - [`count`]: how many results a run produced
//! - [`is_success`]: whether a command succeeded
//! - [`parse`]: the structured output of a command, if any
//!
//! [`ScriptResults`] wraps a run's results for workflows that expect a fixed
//! script shape.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use webcard_core::classify::{is_success, parse};
//! use webcard_core::executor::{ExecutionResult, ExecutionStatus};
//! use webcard_core::reader::Payload;
//!
//! let result = ExecutionResult {
//!     name: "SelectBeCard".to_string(),
//!     status: ExecutionStatus::Ok,
//!     payload: Some(Payload::Raw("9000".to_string())),
//!     index: None,
//!     elapsed: Duration::from_millis(12),
//! };
//! assert!(is_success(Some(&result)));
//! assert!(parse(Some(&result)).is_none());
//! ```

use serde_json::{Map, Value};
use tracing::warn;

use crate::config::ACCEPT_CODE;
use crate::error::{Error, Result};
use crate::executor::{ExecutionResult, ExecutionStatus};
use crate::reader::Payload;

/// Number of results of a run, `0` when there is none.
#[must_use]
pub fn count(results: Option<&[ExecutionResult]>) -> usize {
    results.map_or(0, <[ExecutionResult]>::len)
}

/// Checks whether a command succeeded.
///
/// A result succeeds iff its status is [`ExecutionStatus::Ok`] and its
/// payload is structured, or a raw code equal to `9000`. Failures are
/// logged with the command name, code and elapsed time.
#[must_use]
pub fn is_success(result: Option<&ExecutionResult>) -> bool {
    is_success_with(result, ACCEPT_CODE)
}

/// [`is_success`] with a custom accept code.
#[must_use]
pub fn is_success_with(result: Option<&ExecutionResult>, accept_code: &str) -> bool {
    let Some(result) = result else {
        return false;
    };

    let accepted = result.status == ExecutionStatus::Ok
        && match &result.payload {
            Some(Payload::Structured(_)) => true,
            Some(Payload::Raw(code)) => code == accept_code,
            None => false,
        };

    if !accepted {
        let code = match &result.payload {
            Some(Payload::Raw(code)) => code.as_str(),
            Some(Payload::Structured(_)) => "structured",
            None => "none",
        };
        warn!(
            command = %result.name,
            code,
            elapsed_ms = result.elapsed.as_millis(),
            "command not successful"
        );
    }
    accepted
}

/// Returns the structured output of a command.
///
/// Empty objects and objects with an empty-string key count as absent.
#[must_use]
pub fn parse(result: Option<&ExecutionResult>) -> Option<&Map<String, Value>> {
    match &result?.payload {
        Some(Payload::Structured(map)) if !map.is_empty() && !map.contains_key("") => Some(map),
        _ => None,
    }
}

/// The results of one script run, checked against the shape a workflow
/// expects.
#[derive(Debug, Clone)]
pub struct ScriptResults {
    script: String,
    results: Vec<ExecutionResult>,
    accept_code: String,
}

impl ScriptResults {
    /// Wraps the results of `script`.
    #[must_use]
    pub fn new(script: impl Into<String>, results: Vec<ExecutionResult>) -> Self {
        Self {
            script: script.into(),
            results,
            accept_code: ACCEPT_CODE.to_string(),
        }
    }

    /// Replaces the raw code treated as success.
    #[must_use]
    pub fn with_accept_code(mut self, accept_code: impl Into<String>) -> Self {
        self.accept_code = accept_code.into();
        self
    }

    /// Requires exactly `expected` results.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScriptShape`] on any other count.
    pub fn expect_count(self, expected: usize) -> Result<Self> {
        let actual = count(Some(self.results.as_slice()));
        if actual == expected {
            Ok(self)
        } else {
            Err(Error::ScriptShape {
                script: self.script,
                expected,
                actual,
            })
        }
    }

    /// Checks whether the command at `index` succeeded.
    #[must_use]
    pub fn ok(&self, index: usize) -> bool {
        is_success_with(self.results.get(index), &self.accept_code)
    }

    /// Returns the structured output of the command at `index`.
    #[must_use]
    pub fn parsed(&self, index: usize) -> Option<&Map<String, Value>> {
        parse(self.results.get(index))
    }

    /// Returns the result at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ExecutionResult> {
        self.results.get(index)
    }

    /// Returns the number of results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Checks whether the run produced no results.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Returns the script that was run.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn result(status: ExecutionStatus, payload: Option<Payload>) -> ExecutionResult {
        ExecutionResult {
            name: "ReadSequenceInfo".to_string(),
            status,
            payload,
            index: None,
            elapsed: Duration::from_millis(5),
        }
    }

    fn structured(value: Value) -> Option<Payload> {
        Some(Payload::Structured(value.as_object().cloned().unwrap()))
    }

    #[test]
    fn count_results() {
        assert_eq!(count(None), 0);
        let results = vec![result(ExecutionStatus::Ok, None); 3];
        assert_eq!(count(Some(results.as_slice())), 3);
    }

    #[test]
    fn success_rules() {
        let ok_raw = result(ExecutionStatus::Ok, Some(Payload::Raw("9000".into())));
        let ok_structured = result(ExecutionStatus::Ok, structured(json!({"Otp": "1"})));
        let bad_raw = result(ExecutionStatus::Ok, Some(Payload::Raw("6A82".into())));
        let empty = result(ExecutionStatus::Ok, None);
        let incomplete = result(ExecutionStatus::Incomplete, Some(Payload::Raw("9000".into())));

        assert!(is_success(Some(&ok_raw)));
        assert!(is_success(Some(&ok_structured)));
        assert!(!is_success(Some(&bad_raw)));
        assert!(!is_success(Some(&empty)));
        assert!(!is_success(Some(&incomplete)));
        assert!(!is_success(None));
        assert!(is_success_with(Some(&bad_raw), "6A82"));
    }

    #[test]
    fn parse_rules() {
        let sequences = result(
            ExecutionStatus::Ok,
            structured(json!({"Sequence": ["otp-1", "otp-2"]})),
        );
        assert_eq!(
            parse(Some(&sequences)).unwrap()["Sequence"],
            json!(["otp-1", "otp-2"])
        );

        let blank_key = result(ExecutionStatus::Ok, structured(json!({"": "x"})));
        assert!(parse(Some(&blank_key)).is_none());

        let empty = result(ExecutionStatus::Ok, structured(json!({})));
        assert!(parse(Some(&empty)).is_none());

        let raw = result(ExecutionStatus::Ok, Some(Payload::Raw("9000".into())));
        assert!(parse(Some(&raw)).is_none());
    }

    #[test]
    fn script_shape() {
        let results = vec![result(ExecutionStatus::Ok, Some(Payload::Raw("9000".into())))];
        let checked = ScriptResults::new("[SelectBeCard]", results.clone())
            .expect_count(1)
            .unwrap();
        assert!(checked.ok(0));
        assert!(!checked.ok(1));

        let err = ScriptResults::new("[SelectBeCard][LoginBeCard]", results)
            .expect_count(2)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ScriptShape {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }
}
