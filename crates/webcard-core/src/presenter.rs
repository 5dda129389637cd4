//! User-facing side effects.
//!
//! Workflows never render anything themselves. They report progress as
//! [`UiEvent`]s and ask the user through [`Presenter::confirm`] and
//! [`Presenter::fill_form`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::form::FormChoice;
use crate::otp::{OtpType, SequenceEntry};

/// Severity of a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Level {
    /// Informational.
    Info,
    /// Something the user should act on.
    Warning,
    /// A failed operation.
    Error,
}

/// Progress and state changes reported to the user interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum UiEvent {
    /// The reader is in use by a script run.
    ReaderBusy(bool),

    /// The user must keep a finger on the sensor.
    PresencePrompt(bool),

    /// A card was recognized.
    CardRecognized {
        /// Reader holding the card.
        reader: String,
        /// Card identity.
        card_id: String,
        /// Card family.
        family: String,
    },

    /// The card was removed.
    CardRemoved {
        /// Reader the card was removed from.
        reader: String,
    },

    /// A text message.
    Message {
        /// Severity.
        level: Level,
        /// Text shown to the user.
        text: String,
    },

    /// The touch grid of a finger to enroll.
    EnrollmentGrid {
        /// Finger index.
        finger: u8,
        /// Number of fingers the card wants enrolled.
        fingers_to_enroll: u8,
        /// Completion state of each touch.
        touches: Vec<bool>,
    },

    /// A touch was captured.
    TouchCompleted {
        /// Finger index.
        finger: u8,
        /// Touch index.
        touch: u8,
    },

    /// A touch failed and must be repeated.
    TouchFailed {
        /// Finger index.
        finger: u8,
        /// Touch index.
        touch: u8,
    },

    /// A finger's enrollment was finalized.
    FingerFinalized {
        /// Finger index.
        finger: u8,
    },

    /// All required fingers are enrolled.
    EnrollmentComplete,

    /// The interface must be reloaded to read the new card state.
    ReloadRequested,

    /// The card holds these OTP sequences.
    SequencesListed(Vec<SequenceEntry>),

    /// The card holds no OTP sequence.
    NoSequences,

    /// An OTP was read from the card.
    OtpAvailable {
        /// Sequence the OTP belongs to.
        sequence: String,
        /// Algorithm of the sequence.
        otp_type: OtpType,
        /// The one-time password.
        otp: String,
    },

    /// Seconds left before the TOTP is read again.
    OtpCountdown {
        /// Sequence being refreshed.
        sequence: String,
        /// Seconds remaining.
        remaining_secs: u64,
    },

    /// A sequence was deleted from the card.
    SequenceDeleted {
        /// The deleted sequence.
        sequence: String,
    },

    /// The card is ready to be personalized.
    PersonalizationReady,

    /// The card was personalized.
    PersonalizationComplete,
}

impl UiEvent {
    /// A message event.
    #[must_use]
    pub fn message(level: Level, text: impl Into<String>) -> Self {
        Self::Message {
            level,
            text: text.into(),
        }
    }
}

/// Questions that need an explicit answer from the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Confirmation {
    /// The enrollment status could not be read; treat the card as enrolled?
    AssumeEnrolled,
    /// The enrollment is invalid; reset it? The reset is irreversible.
    ResetEnrollment,
    /// Start collecting touches for a finger.
    BeginEnrollment {
        /// Finger index.
        finger: u8,
    },
    /// A touch failed; try it again.
    RetryTouch {
        /// Finger index.
        finger: u8,
        /// Touch index.
        touch: u8,
    },
    /// Delete a sequence from the card.
    DeleteSequence {
        /// The sequence to delete.
        sequence: String,
    },
    /// Write the enrollment token to the card.
    Personalize,
}

/// A dynamic form the user must complete before a command is generated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormRequest {
    /// Command the form belongs to.
    pub command: String,
    /// Fields the user has to choose.
    pub choices: Vec<FormChoice>,
    /// Values already fixed by the script.
    pub fixed: Map<String, Value>,
}

/// The user interface driven by the workflows.
#[async_trait]
pub trait Presenter: Send + Sync {
    /// Reports an event.
    fn emit(&self, event: UiEvent);

    /// Asks a yes/no question.
    async fn confirm(&self, prompt: Confirmation) -> bool;

    /// Lets the user complete a dynamic form and returns the submitted
    /// values.
    ///
    /// # Errors
    ///
    /// Returns an error if the user cancels the form.
    async fn fill_form(&self, request: &FormRequest) -> Result<Map<String, Value>>;
}
