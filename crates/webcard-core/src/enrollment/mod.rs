//! Fingerprint enrollment.
//!
//! Enrollment is an explicit state machine driven by one loop in
//! [`enroll`]. Every transition first checks the session's cancellation
//! token, so removing the card ends the machine from any state.
//!
//! ```text
//! Unselected ─► Selected ─┬─► Enrolled ─────────────────────────► done
//!                         ├─► Unverified ── confirmed ──► Enrolled
//!                         ├─► Invalid ── confirmed (D) ──► Resetting ─► done
//!                         ├─► InProgress ─► touches ─┬─► (F/T) reload
//!                         │                         └─► (D) Finalizing
//!                         └─► NextFinger (D) ─► InProgress | Finalizing
//!                                               | Finalized | Enrolled
//! Finalizing ─► Finalized ─► NextFinger
//! ```

mod status;
mod touch;

pub use status::{
    D_FINGERS, F_TOUCHES, FingerState, StatusReport, parse_d_finger, parse_f, parse_t,
    read_status, touch_bits,
};
pub use touch::{collect_touches, step_touches};

use std::collections::VecDeque;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::classify::parse;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::presenter::{Confirmation, Level, UiEvent};
use crate::session::{CardFamily, CardSession};

/// Touch progress of one finger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentProgress {
    /// Finger index.
    pub finger: u8,
    /// Touches captured so far.
    pub touches_done: u8,
    /// Touches the finger needs.
    pub touches_required: u8,
    /// Capture state per touch.
    pub touches: Vec<bool>,
}

impl EnrollmentProgress {
    /// Progress where the first `done` of `required` touches are captured.
    #[must_use]
    pub fn new(finger: u8, required: u8, done: u8) -> Self {
        let done = done.min(required);
        Self::from_bits(
            finger,
            (0..required).map(|touch| touch < done).collect(),
        )
    }

    /// Progress from per-touch capture state.
    #[must_use]
    pub fn from_bits(finger: u8, touches: Vec<bool>) -> Self {
        let count = |bits: &[bool]| {
            u8::try_from(bits.iter().filter(|&&done| done).count()).unwrap_or(u8::MAX)
        };
        Self {
            finger,
            touches_done: count(&touches),
            touches_required: u8::try_from(touches.len()).unwrap_or(u8::MAX),
            touches,
        }
    }

    /// Marks `touch` as captured. Out-of-range and repeated touches are
    /// ignored.
    pub fn record_touch(&mut self, touch: u8) {
        if let Some(slot) = self.touches.get_mut(usize::from(touch))
            && !*slot
        {
            *slot = true;
            self.touches_done = self.touches_done.saturating_add(1);
        }
    }

    /// Returns the first touch not captured yet.
    #[must_use]
    pub fn next_pending(&self) -> Option<u8> {
        self.touches
            .iter()
            .position(|done| !done)
            .and_then(|touch| u8::try_from(touch).ok())
    }

    /// Checks whether every touch is captured.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.touches_done >= self.touches_required
    }
}

/// How an enrollment run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentOutcome {
    /// The card is enrolled; OTP workflows may start.
    Enrolled,
    /// Touches were captured; the card state must be read again.
    ReloadRequired,
    /// The enrollment was reset; the card must be reinserted.
    ResetCompleted,
    /// The user stopped before the enrollment finished.
    Postponed,
}

/// States of the enrollment machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentState {
    /// Nothing read yet.
    Unselected,
    /// The status was read.
    Selected(StatusReport),
    /// The status could not be read.
    Unverified,
    /// A finger needs touches.
    InProgress {
        /// Progress of the finger.
        progress: EnrollmentProgress,
        /// Fingers the card wants enrolled.
        fingers_to_enroll: u8,
    },
    /// The card reports a corrupt enrollment.
    Invalid {
        /// What the card reported.
        reason: String,
        /// Whether the card accepts a reset.
        resettable: bool,
    },
    /// The enrollment is being reset.
    Resetting,
    /// The next family-D finger is examined.
    NextFinger,
    /// A finger is being finalized.
    Finalizing {
        /// Finger index.
        finger: u8,
        /// Check the status before and after finalizing.
        verify: bool,
    },
    /// A finger was finalized.
    Finalized {
        /// Finger index.
        finger: u8,
    },
    /// Every finger is enrolled.
    Enrolled,
    /// The machine stopped.
    Done(EnrollmentOutcome),
}

/// Runs the enrollment machine for the session's card.
///
/// # Errors
///
/// - [`Error::Cancelled`] when the card is removed
/// - [`Error::AppletNotFound`] and [`Error::LoginFailed`] from the status
///   read
/// - [`Error::EnrollmentIntegrity`] for a corrupt enrollment that is not
///   reset
/// - [`Error::EnrollmentUnverified`] when an unreadable status is not
///   confirmed
/// - [`Error::FinalizeFailed`] and [`Error::ResetFailed`]
pub async fn enroll(engine: &Engine, session: &CardSession) -> Result<EnrollmentOutcome> {
    let mut machine = Machine {
        engine,
        session,
        fingers: VecDeque::new(),
    };
    let mut state = EnrollmentState::Unselected;

    loop {
        if session.cancel_token().is_cancelled() {
            return Err(Error::Cancelled);
        }
        debug!(card_id = session.card_id(), ?state, "enrollment step");
        state = match state {
            EnrollmentState::Done(outcome) => {
                info!(card_id = session.card_id(), ?outcome, "enrollment finished");
                return Ok(outcome);
            }
            state => machine.step(state).await?,
        };
    }
}

struct Machine<'a> {
    engine: &'a Engine,
    session: &'a CardSession,
    fingers: VecDeque<(u8, FingerState)>,
}

impl Machine<'_> {
    async fn step(&mut self, state: EnrollmentState) -> Result<EnrollmentState> {
        let engine = self.engine;
        Ok(match state {
            EnrollmentState::Unselected => {
                EnrollmentState::Selected(read_status(engine, self.session).await?)
            }

            EnrollmentState::Selected(report) => self.classify(report),

            EnrollmentState::Unverified => {
                engine.emit(UiEvent::message(
                    Level::Warning,
                    "Unable to verify the enroll status",
                ));
                if engine.presenter().confirm(Confirmation::AssumeEnrolled).await {
                    EnrollmentState::Enrolled
                } else {
                    return Err(Error::EnrollmentUnverified);
                }
            }

            EnrollmentState::Invalid { reason, resettable } => {
                engine.emit(UiEvent::message(Level::Error, format!("Card reset required: {reason}")));
                if resettable && engine.presenter().confirm(Confirmation::ResetEnrollment).await {
                    EnrollmentState::Resetting
                } else {
                    return Err(Error::EnrollmentIntegrity(reason));
                }
            }

            EnrollmentState::Resetting => {
                let results = engine.run_checked(self.session, "[ResetEnroll]", 1).await?;
                if !results.ok(0) {
                    return Err(Error::ResetFailed);
                }
                engine.emit(UiEvent::message(
                    Level::Info,
                    "Card reset completed. Please reinsert the card to make the enrollment",
                ));
                EnrollmentState::Done(EnrollmentOutcome::ResetCompleted)
            }

            EnrollmentState::InProgress {
                mut progress,
                fingers_to_enroll,
            } => {
                engine.emit(UiEvent::EnrollmentGrid {
                    finger: progress.finger,
                    fingers_to_enroll,
                    touches: progress.touches.clone(),
                });
                self.collect(&mut progress).await?
            }

            EnrollmentState::NextFinger => match self.fingers.pop_front() {
                None => EnrollmentState::Enrolled,
                Some((finger, finger_state)) => Self::finger(finger, finger_state)?,
            },

            EnrollmentState::Finalizing { finger, verify } => {
                self.finalize(finger, verify).await?;
                EnrollmentState::Finalized { finger }
            }

            EnrollmentState::Finalized { finger } => {
                engine.emit(UiEvent::FingerFinalized { finger });
                EnrollmentState::NextFinger
            }

            EnrollmentState::Enrolled => {
                engine.emit(UiEvent::EnrollmentComplete);
                EnrollmentState::Done(EnrollmentOutcome::Enrolled)
            }

            done @ EnrollmentState::Done(_) => done,
        })
    }

    fn classify(&mut self, report: StatusReport) -> EnrollmentState {
        match report {
            StatusReport::Enrolled => EnrollmentState::Enrolled,
            StatusReport::Unverified => EnrollmentState::Unverified,
            StatusReport::Pending {
                progress,
                fingers_to_enroll,
            } => EnrollmentState::InProgress {
                progress,
                fingers_to_enroll,
            },
            StatusReport::Invalid(reason) => EnrollmentState::Invalid {
                reason,
                resettable: false,
            },
            StatusReport::Fingers(fingers) => {
                self.fingers = fingers.into();
                EnrollmentState::NextFinger
            }
        }
    }

    fn finger(finger: u8, state: FingerState) -> Result<EnrollmentState> {
        Ok(match state {
            FingerState::Invalid => EnrollmentState::Invalid {
                reason: format!("finger {finger} invalid"),
                resettable: true,
            },
            FingerState::Pending(progress) => EnrollmentState::InProgress {
                progress,
                fingers_to_enroll: D_FINGERS,
            },
            FingerState::TouchesReached => EnrollmentState::Finalizing {
                finger,
                verify: true,
            },
            FingerState::Finalized => EnrollmentState::Finalized { finger },
            FingerState::Unknown(status) => {
                return Err(Error::EnrollmentIntegrity(format!(
                    "finger {finger} reports '{status}'"
                )));
            }
        })
    }

    async fn collect(&self, progress: &mut EnrollmentProgress) -> Result<EnrollmentState> {
        let engine = self.engine;
        let finger = progress.finger;

        if *self.session.family() == CardFamily::D {
            if !engine
                .presenter()
                .confirm(Confirmation::BeginEnrollment { finger })
                .await
            {
                return Ok(EnrollmentState::Done(EnrollmentOutcome::Postponed));
            }
            collect_touches(engine, self.session, progress).await?;
            return Ok(EnrollmentState::Finalizing {
                finger,
                verify: false,
            });
        }

        if step_touches(engine, self.session, progress).await? {
            engine.emit(UiEvent::message(Level::Info, "Enroll completed"));
            engine.emit(UiEvent::ReloadRequested);
            Ok(EnrollmentState::Done(EnrollmentOutcome::ReloadRequired))
        } else {
            Ok(EnrollmentState::Done(EnrollmentOutcome::Postponed))
        }
    }

    /// Finalizes a family-D finger. With `verify`, the finger must report
    /// `Touches reached` before and `Enrolled not allowed` after.
    async fn finalize(&self, finger: u8, verify: bool) -> Result<()> {
        let finalized = if verify {
            let script = format!(
                "[GetEnrollStatus {{finger_id={finger:02X}}}]\
                 [FinalizeEnroll {{finger_id={finger:02X}}}]\
                 [GetEnrollStatus {{finger_id={finger:02X}}}]"
            );
            let results = self.engine.run_checked(self.session, &script, 3).await?;
            let status = |i: usize| {
                results
                    .ok(i)
                    .then(|| parse(results.get(i)))
                    .flatten()
                    .and_then(|data| data.get("finger_status"))
                    .and_then(Value::as_str)
                    .map(str::trim)
            };
            status(0) == Some("Touches reached")
                && results.ok(1)
                && status(2) == Some("Enrolled not allowed")
        } else {
            let script = format!("[FinalizeEnroll {{finger_id={finger:02X}}}]");
            self.engine
                .run_checked(self.session, &script, 1)
                .await?
                .ok(0)
        };

        if !finalized {
            warn!(finger, "finalize failed");
            return Err(Error::FinalizeFailed(finger));
        }
        info!(finger, "finger finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_counts_and_clamps() {
        let progress = EnrollmentProgress::new(0, 4, 6);
        assert_eq!(progress.touches_done, 4);
        assert!(progress.is_complete());
        assert_eq!(progress.next_pending(), None);

        let mut progress = EnrollmentProgress::new(1, 3, 1);
        assert_eq!(progress.next_pending(), Some(1));
        progress.record_touch(1);
        progress.record_touch(1);
        progress.record_touch(9);
        assert_eq!(progress.touches_done, 2);
        assert_eq!(progress.next_pending(), Some(2));
        progress.record_touch(2);
        assert!(progress.is_complete());
    }

    #[test]
    fn progress_from_bits_keeps_gaps() {
        let progress = EnrollmentProgress::from_bits(0, vec![true, false, true, false]);
        assert_eq!(progress.touches_done, 2);
        assert_eq!(progress.touches_required, 4);
        assert_eq!(progress.next_pending(), Some(1));
    }
}
