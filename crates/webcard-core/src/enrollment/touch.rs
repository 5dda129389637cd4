//! Touch collection.
//!
//! Family D collects a finger's missing touches in one batch, each touch
//! sent with its own select and login, and finalizes the finger once.
//! Families F/T enroll one touch per user step.

use tracing::{debug, warn};

use super::EnrollmentProgress;
use crate::classify::is_success_with;
use crate::engine::Engine;
use crate::error::Result;
use crate::presenter::{Confirmation, Level, UiEvent};
use crate::session::{CardFamily, CardSession};

/// Sends one enrollment command per pending touch of a family-D finger.
///
/// Touches are sent strictly in order. A failed touch is retried at the
/// same index until it succeeds or the session is cancelled.
///
/// # Errors
///
/// Returns run errors, including [`crate::Error::Cancelled`] when the card
/// is removed.
pub async fn collect_touches(
    engine: &Engine,
    session: &CardSession,
    progress: &mut EnrollmentProgress,
) -> Result<()> {
    let finger = progress.finger;
    while let Some(touch) = progress.next_pending() {
        let script = format!(
            "[SelectEnroll][LoginEnroll][EnrollFingerprint {{finger_id={finger:02X}}} {{touch_id={:02X}}}]",
            touch + 1
        );
        let results = engine.run_script(session, &script).await?;
        let accepted =
            results.len() == 3 && is_success_with(results.get(2), &engine.config().accept_code);

        if accepted {
            progress.record_touch(touch);
            debug!(finger, touch, done = progress.touches_done, "touch captured");
            engine.emit(UiEvent::TouchCompleted { finger, touch });
        } else {
            warn!(finger, touch, "touch failed, retrying");
            engine.emit(UiEvent::TouchFailed { finger, touch });
        }
    }
    Ok(())
}

/// Enrolls the touches of a family-F/T finger one step at a time.
///
/// Returns `false` when the user stops before every touch is captured.
///
/// # Errors
///
/// Returns run errors, including [`crate::Error::Cancelled`] when the card
/// is removed.
pub async fn step_touches(
    engine: &Engine,
    session: &CardSession,
    progress: &mut EnrollmentProgress,
) -> Result<bool> {
    let finger = progress.finger;
    if !engine
        .presenter()
        .confirm(Confirmation::BeginEnrollment { finger })
        .await
    {
        return Ok(false);
    }

    while let Some(touch) = progress.next_pending() {
        let script = match session.family() {
            CardFamily::F => format!("[EnrollFingerprint {{finger_id={touch:02X}}}]"),
            _ => "[EnrollFingerprint]".to_string(),
        };
        let results = engine.run_script(session, &script).await?;
        let accepted =
            results.len() == 1 && is_success_with(results.first(), &engine.config().accept_code);

        if accepted {
            progress.record_touch(touch);
            engine.emit(UiEvent::TouchCompleted { finger, touch });
            continue;
        }

        engine.emit(UiEvent::TouchFailed { finger, touch });
        engine.emit(UiEvent::message(Level::Error, "Enroll error! Retry"));
        if !engine
            .presenter()
            .confirm(Confirmation::RetryTouch { finger, touch })
            .await
        {
            return Ok(false);
        }
    }
    Ok(true)
}
