//! One-time password workflows.
//!
//! ```text
//! discover ─► list sequences ─► none:   NoSequences
//!                             ├► one:    retrieve immediately
//!                             └► many:   SequencesListed, wait for the user
//!
//! retrieve ─► binding check ─► HOTP:  read once, deliver
//!                            └► TOTP:  read, count down, read again
//! ```
//!
//! Every retrieval and deletion first checks with the remote service that
//! the sequence is bound to the user's email. An unbound sequence stops the
//! workflow before anything is sent to the card.
//!
//! OTPs are either shown to the user or, on the login page, relayed to the
//! server through an [`OtpRelay`].

mod refresh;
mod retrieval;
mod sequences;

pub use refresh::TotpRefresher;
pub use retrieval::{delete_sequence, ensure_bound, read_hotp, read_totp, retrieve, totp_for};
pub use sequences::{SequenceSelection, discover, list_sequences};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// OTP algorithm of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OtpType {
    /// Counter based.
    Hotp,
    /// Time based.
    Totp,
}

impl OtpType {
    /// Reads the card's type label. Anything but `TOTP` is counter based.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        if label.trim().eq_ignore_ascii_case("TOTP") {
            Self::Totp
        } else {
            Self::Hotp
        }
    }
}

impl fmt::Display for OtpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hotp => "HOTP",
            Self::Totp => "TOTP",
        })
    }
}

/// An OTP sequence stored on the card.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceEntry {
    /// Algorithm.
    pub otp_type: OtpType,
    /// Sequence identifier, also the token checked against the user.
    pub label: String,
}

impl SequenceEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(otp_type: OtpType, label: impl Into<String>) -> Self {
        Self {
            otp_type,
            label: label.into(),
        }
    }
}

impl fmt::Display for SequenceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.otp_type, self.label)
    }
}

/// An OTP handed to the login server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpSubmission {
    /// The one-time password.
    pub otp: String,
    /// Sequence it was generated from.
    pub sequence: String,
    /// Email of the user logging in.
    pub email: String,
}

/// Receives OTPs read during a login.
#[async_trait]
pub trait OtpRelay: Send + Sync {
    /// Forwards one OTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    async fn submit(&self, submission: OtpSubmission) -> Result<()>;
}

/// Where retrieved OTPs go.
#[derive(Clone)]
pub enum Delivery {
    /// Shown through the presenter.
    Display,
    /// Forwarded to the login server. TOTPs are read once.
    Relay(Arc<dyn OtpRelay>),
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Display => f.write_str("Display"),
            Self::Relay(_) => f.write_str("Relay"),
        }
    }
}

/// Who asks for OTPs and where they go.
#[derive(Debug, Clone)]
pub struct OtpContext {
    /// Email the sequences must be bound to.
    pub email: String,
    /// Delivery of retrieved OTPs.
    pub delivery: Delivery,
}

impl OtpContext {
    /// OTPs shown to the user.
    #[must_use]
    pub fn display(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            delivery: Delivery::Display,
        }
    }

    /// OTPs relayed to the login server.
    #[must_use]
    pub fn relay(email: impl Into<String>, relay: Arc<dyn OtpRelay>) -> Self {
        Self {
            email: email.into(),
            delivery: Delivery::Relay(relay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_labels() {
        assert_eq!(OtpType::from_label("TOTP"), OtpType::Totp);
        assert_eq!(OtpType::from_label("totp "), OtpType::Totp);
        assert_eq!(OtpType::from_label("HOTP"), OtpType::Hotp);
        assert_eq!(OtpType::from_label(""), OtpType::Hotp);
        assert_eq!(
            SequenceEntry::new(OtpType::Totp, "42").to_string(),
            "TOTP: 42"
        );
    }
}
