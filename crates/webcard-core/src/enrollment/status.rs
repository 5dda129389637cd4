//! Enrollment status reads, one script per card family.

use serde_json::{Map, Value};

use super::EnrollmentProgress;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::session::{CardFamily, CardSession};

/// Touches a family-F finger needs.
pub const F_TOUCHES: u8 = 12;

/// Fingers a family-D card enrolls.
pub const D_FINGERS: u8 = 2;

/// State of one finger on a family-D card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerState {
    /// The stored template is corrupt; the card must be reset.
    Invalid,
    /// Touches are missing.
    Pending(EnrollmentProgress),
    /// Every touch was captured; the finger awaits finalization.
    TouchesReached,
    /// The finger is enrolled.
    Finalized,
    /// A status this engine does not know.
    Unknown(String),
}

/// What a status read reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReport {
    /// Nothing left to enroll.
    Enrolled,
    /// The status could not be read (families F/T).
    Unverified,
    /// A finger needs touches (families F/T).
    Pending {
        /// Progress of the finger.
        progress: EnrollmentProgress,
        /// Fingers the card wants enrolled.
        fingers_to_enroll: u8,
    },
    /// Biometric qualification failed (family T).
    Invalid(String),
    /// Per-finger state (family D), in finger order.
    Fingers(Vec<(u8, FingerState)>),
}

/// Reads the enrollment status of the session's card.
///
/// # Errors
///
/// - [`Error::AppletNotFound`] if the enrollment applet cannot be selected
///   (families T/D)
/// - [`Error::LoginFailed`] if the enrollment login is refused (family D)
/// - [`Error::EnrollmentIntegrity`] if a finger status cannot be read
///   (family D)
pub async fn read_status(engine: &Engine, session: &CardSession) -> Result<StatusReport> {
    match session.family() {
        CardFamily::F => {
            let results = engine
                .run_checked(session, "[SelectEnroll][GetEnrollStatus]", 2)
                .await?;
            if !results.ok(0) || !results.ok(1) {
                return Ok(StatusReport::Unverified);
            }
            Ok(results.parsed(1).map_or(StatusReport::Unverified, parse_f))
        }
        CardFamily::T => {
            let results = engine
                .run_checked(session, "[SelectEnroll][GetEnrollStatus]", 2)
                .await?;
            if !results.ok(0) {
                return Err(Error::AppletNotFound("Enroll".to_string()));
            }
            if !results.ok(1) {
                return Ok(StatusReport::Unverified);
            }
            Ok(results.parsed(1).map_or(StatusReport::Unverified, parse_t))
        }
        CardFamily::D => {
            let script = (0..D_FINGERS).fold(String::from("[SelectEnroll][LoginEnroll]"), |s, f| {
                s + &format!("[GetEnrollStatus {{finger_id={f:02X}}}]")
            });
            let results = engine
                .run_checked(session, &script, 2 + usize::from(D_FINGERS))
                .await?;
            if !results.ok(0) {
                return Err(Error::AppletNotFound("Enroll".to_string()));
            }
            if !results.ok(1) {
                return Err(Error::LoginFailed);
            }

            let mut fingers = Vec::with_capacity(usize::from(D_FINGERS));
            for finger in 0..D_FINGERS {
                let index = 2 + usize::from(finger);
                let data = results
                    .ok(index)
                    .then(|| results.parsed(index))
                    .flatten()
                    .ok_or_else(|| {
                        Error::EnrollmentIntegrity(format!("status of finger {finger} unreadable"))
                    })?;
                fingers.push((finger, parse_d_finger(finger, data)));
            }
            Ok(StatusReport::Fingers(fingers))
        }
        other => Err(Error::UnsupportedFamily(other.to_string())),
    }
}

/// Family F: `Status` is `complete`, `finger1` or `finger2`.
#[must_use]
pub fn parse_f(data: &Map<String, Value>) -> StatusReport {
    match data.get("Status").and_then(Value::as_str).map(str::trim) {
        Some("complete") => StatusReport::Enrolled,
        Some("finger1") => pending_f(0),
        Some("finger2") => pending_f(1),
        _ => StatusReport::Unverified,
    }
}

fn pending_f(finger: u8) -> StatusReport {
    StatusReport::Pending {
        progress: EnrollmentProgress::new(finger, F_TOUCHES, 0),
        fingers_to_enroll: 1,
    }
}

/// Family T: a failed qualification is fatal; the `enrollment`
/// verification status carries the touch counters. A response without a
/// verification status is unverified.
#[must_use]
pub fn parse_t(data: &Map<String, Value>) -> StatusReport {
    let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::trim);

    if text("BiometricMode") == Some("qualification failed") {
        return StatusReport::Invalid("biometric qualification failed".to_string());
    }
    match text("VerificationStatus") {
        None => return StatusReport::Unverified,
        Some("enrollment") => {}
        Some(_) => return StatusReport::Enrolled,
    }

    let done = small(data.get("TouchedEnrolled"));
    let remain = small(data.get("TouchedRemain"));
    StatusReport::Pending {
        progress: EnrollmentProgress::new(
            small(data.get("FingerToEnroll")),
            done.saturating_add(remain),
            done,
        ),
        fingers_to_enroll: small(data.get("FingerNumberToEnroll")).max(1),
    }
}

/// Family D: one `GetEnrollStatus` response.
#[must_use]
pub fn parse_d_finger(finger: u8, data: &Map<String, Value>) -> FingerState {
    let status = data
        .get("finger_status")
        .and_then(Value::as_str)
        .map_or("", str::trim);
    match status {
        "Finger invalid" => FingerState::Invalid,
        "Not enrolled" | "Enroll wip" => {
            let max = small(data.get("max_touches"));
            let details = data
                .get("touches_details")
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
                .and_then(Value::as_array);
            let halves = details.map_or((0, 0), |row| {
                (number(row.first()).unwrap_or(0), number(row.get(1)).unwrap_or(0))
            });
            FingerState::Pending(EnrollmentProgress::from_bits(
                finger,
                touch_bits(halves, max),
            ))
        }
        "Touches reached" => FingerState::TouchesReached,
        "Finalized" => FingerState::Finalized,
        other => FingerState::Unknown(other.to_string()),
    }
}

/// Expands the two touch bitmaps of a family-D finger.
///
/// Each half is written in binary, zero-padded to `max / 2` digits, and the
/// halves are concatenated; touch `i` is the `i`-th digit from the right.
#[must_use]
pub fn touch_bits((high, low): (u64, u64), max: u8) -> Vec<bool> {
    let half = usize::from(max / 2);
    let digits = format!("{high:0>half$b}{low:0>half$b}");
    let digits = digits.as_bytes();
    (0..usize::from(max))
        .map(|i| {
            digits
                .len()
                .checked_sub(i + 1)
                .is_some_and(|j| digits[j] == b'1')
        })
        .collect()
}

/// Reads a counter sent as a number, a numeric string or a one-element
/// list of either.
fn number(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(items) => number(items.first()),
        _ => None,
    }
}

fn small(value: Option<&Value>) -> u8 {
    number(value).map_or(0, |n| u8::try_from(n).unwrap_or(u8::MAX))
}
