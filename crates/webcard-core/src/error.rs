//! Error types for the webcard orchestration engine.
//!
//! This module provides the crate-wide [`enum@Error`] and the coarse
//! [`ErrorKind`] taxonomy callers use to decide how a failure propagates.
//!
//! # Error Categories
//!
//! - **Transport errors**: reader or network I/O. Inside a script run these
//!   are absorbed into [`ExecutionStatus::Incomplete`] results and never
//!   reach the caller as an `Err`.
//! - **Protocol errors**: applet-not-found, login-failed, card-id-mismatch.
//!   Fatal to the current workflow step.
//! - **Binding errors**: a sequence that is not associated with the user.
//!   Always raised before any hardware access for that sequence.
//! - **Cache errors**: a command definition that could not be fetched. The
//!   cache entry is evicted so the next attempt retries.
//! - **Enrollment integrity errors**: the card reports a corrupt fingerprint
//!   state and needs an explicit reset.
//!
//! [`ExecutionStatus::Incomplete`]: crate::executor::ExecutionStatus::Incomplete
//!
//! # Example
//!
//! ```
//! use webcard_core::{Error, ErrorKind};
//!
//! let err = Error::SequenceNotBound("otp-1".to_string());
//! assert_eq!(err.kind(), ErrorKind::Binding);
//! ```

use core::result::Result as CoreResult;
use hex::FromHexError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// The main error type for the webcard engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Reader Errors
    // =========================================================================
    /// No reader with the given name is attached.
    #[error("reader not found: {0}")]
    ReaderNotFound(String),

    /// Connecting to the card in the reader failed.
    #[error("failed to connect to reader: {0}")]
    ConnectionFailed(String),

    /// A single command exchange with the card failed.
    #[error("transceive failed: {0}")]
    Transceive(String),

    /// The card answered with bytes that could not be interpreted.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    // =========================================================================
    // Remote Service Errors
    // =========================================================================
    /// The remote service could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The remote service answered with an error envelope.
    #[error("{operation} failed: {message}")]
    Remote {
        /// Endpoint that reported the error.
        operation: String,
        /// Message carried in the error envelope.
        message: String,
    },

    /// A command definition could not be resolved.
    #[error("command not found: {command} ({reason})")]
    CommandNotFound {
        /// Name of the command being resolved.
        command: String,
        /// Underlying failure.
        reason: String,
    },

    /// The remote service returned no supported cards.
    #[error("unable to retrieve supported cards")]
    NoSupportedCards,

    // =========================================================================
    // Recognition Errors
    // =========================================================================
    /// No card identity matches the reader's ATR.
    #[error("card not found for ATR {0:?}")]
    CardNotFound(String),

    /// Several identities share the ATR and the identity probe did not
    /// single one out.
    #[error("ambiguous card could not be resolved: {0}")]
    AmbiguousCardUnresolved(String),

    /// The card was recognized but its family has no workflow.
    #[error("unsupported card family: {0}")]
    UnsupportedFamily(String),

    // =========================================================================
    // Workflow Errors
    // =========================================================================
    /// Selecting an applet on the card failed.
    #[error("applet not found: {0}")]
    AppletNotFound(String),

    /// Fingerprint login on the card failed.
    #[error("login failed, unable to verify fingerprint")]
    LoginFailed,

    /// The card reports a different identifier than the one expected.
    #[error("card id mismatch: expected {expected}, card reports {actual}")]
    CardIdMismatch {
        /// Identifier the workflow was started for.
        expected: String,
        /// Identifier read from the card.
        actual: String,
    },

    /// The card already carries OTP sequences.
    #[error("card already in use")]
    CardInUse,

    /// A workflow step's command did not succeed.
    #[error("command {0} failed")]
    CommandFailed(String),

    /// A script returned fewer or more results than the workflow expects.
    #[error("script {script} returned {actual} results, expected {expected}")]
    ScriptShape {
        /// The script that was run.
        script: String,
        /// Result count the workflow requires.
        expected: usize,
        /// Result count the engine returned.
        actual: usize,
    },

    /// The card did not produce an OTP for the requested sequence.
    #[error("no OTP available for sequence {0}")]
    OtpUnavailable(String),

    /// The sequence is not bound to the authenticated user.
    #[error("sequence {0} is not associated with this user")]
    SequenceNotBound(String),

    // =========================================================================
    // Enrollment Errors
    // =========================================================================
    /// The card reports an invalid fingerprint enrollment state.
    #[error("fingerprint enrollment is invalid: {0}")]
    EnrollmentIntegrity(String),

    /// The enrollment status could not be read and the user did not confirm
    /// that the card is already enrolled.
    #[error("enrollment status could not be verified")]
    EnrollmentUnverified,

    /// Finalizing a finger's enrollment failed.
    #[error("failed to finalize enrollment of finger {0}")]
    FinalizeFailed(u8),

    /// The enrollment reset command failed.
    #[error("failed to reset fingerprint enrollment")]
    ResetFailed,

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A configuration value is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// Failed to parse hex data.
    #[error("hex decoding failed: {0}")]
    HexDecodeFailed(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    JsonError(String),

    // =========================================================================
    // Cancellation
    // =========================================================================
    /// The card was removed or the session released while work was pending.
    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse error classes that decide how a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network or reader I/O failure.
    Transport,
    /// Card-side protocol failure fatal to the current step.
    Protocol,
    /// Sequence not associated with the user.
    Binding,
    /// Command definition lookup failure.
    Cache,
    /// Corrupt or unconfirmed fingerprint state.
    EnrollmentIntegrity,
    /// The card could not be identified.
    Recognition,
    /// A script returned an unexpected number of results.
    ScriptShape,
    /// Invalid settings or malformed data.
    Configuration,
    /// Work abandoned because the session ended.
    Cancelled,
}

impl Error {
    /// Returns the taxonomy class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ReaderNotFound(_)
            | Self::ConnectionFailed(_)
            | Self::Transceive(_)
            | Self::MalformedResponse(_)
            | Self::Network(_)
            | Self::Remote { .. } => ErrorKind::Transport,
            Self::CommandNotFound { .. } | Self::NoSupportedCards => ErrorKind::Cache,
            Self::CardNotFound(_)
            | Self::AmbiguousCardUnresolved(_)
            | Self::UnsupportedFamily(_) => ErrorKind::Recognition,
            Self::AppletNotFound(_)
            | Self::LoginFailed
            | Self::CardIdMismatch { .. }
            | Self::CardInUse
            | Self::CommandFailed(_)
            | Self::OtpUnavailable(_)
            | Self::FinalizeFailed(_)
            | Self::ResetFailed => ErrorKind::Protocol,
            Self::ScriptShape { .. } => ErrorKind::ScriptShape,
            Self::SequenceNotBound(_) => ErrorKind::Binding,
            Self::EnrollmentIntegrity(_) | Self::EnrollmentUnverified => {
                ErrorKind::EnrollmentIntegrity
            }
            Self::Config(_) | Self::HexDecodeFailed(_) | Self::JsonError(_) => {
                ErrorKind::Configuration
            }
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Checks whether the error is a transport failure.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport)
    }
}

impl From<FromHexError> for Error {
    fn from(err: FromHexError) -> Self {
        Error::HexDecodeFailed(err.to_string())
    }
}

impl From<SerdeJsonError> for Error {
    fn from(err: SerdeJsonError) -> Self {
        Error::JsonError(err.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

/// A specialized [`Result`] type for webcard operations.
pub type Result<T> = CoreResult<T, Error>;

#[cfg(test)]
mod tests {
    use serde_json::{Value, from_str};

    use super::*;

    #[test]
    fn error_display() {
        let err = Error::LoginFailed;
        assert_eq!(err.to_string(), "login failed, unable to verify fingerprint");

        let err = Error::ScriptShape {
            script: "[SelectBeCard][ReadSequenceInfo]".to_string(),
            expected: 2,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "script [SelectBeCard][ReadSequenceInfo] returned 1 results, expected 2"
        );

        let err = Error::FinalizeFailed(1);
        assert_eq!(err.to_string(), "failed to finalize enrollment of finger 1");
    }

    #[test]
    fn taxonomy() {
        assert_eq!(Error::Transceive("io".into()).kind(), ErrorKind::Transport);
        assert_eq!(Error::AppletNotFound("BeCard".into()).kind(), ErrorKind::Protocol);
        assert_eq!(
            Error::CardIdMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            Error::CommandNotFound {
                command: "X".into(),
                reason: "404".into()
            }
            .kind(),
            ErrorKind::Cache
        );
        assert_eq!(
            Error::EnrollmentIntegrity("Finger invalid".into()).kind(),
            ErrorKind::EnrollmentIntegrity
        );
        assert!(Error::Network("timeout".into()).is_transport());
        assert!(!Error::Cancelled.is_transport());
    }

    #[test]
    fn from_hex_error() {
        let hex_err = FromHexError::InvalidHexCharacter { c: 'g', index: 0 };
        let err: Error = hex_err.into();
        assert!(matches!(err, Error::HexDecodeFailed(_)));
    }

    #[test]
    fn from_json_error() {
        let json_err = from_str::<Value>("not valid json{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::JsonError(_)));
    }
}
