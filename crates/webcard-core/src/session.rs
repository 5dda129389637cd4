//! Card sessions and cancellation.
//!
//! A [`CardSession`] exists only while a recognized card sits in a reader.
//! The [`SessionContext`] owns the current session: recognition acquires
//! it, card removal releases it. Releasing cancels the session's
//! [`CancelToken`], which interrupts any script run or refresh cycle bound
//! to that card, and disconnects the reader.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::reader::ReaderSession;

/// Card hardware/firmware class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardFamily {
    /// Fingerprint card with a single enrollment slot and HOTP only.
    F,
    /// Fingerprint card with guided enrollment and HOTP/TOTP.
    T,
    /// Fingerprint card with per-finger, per-touch enrollment.
    D,
    /// Cloud card.
    C,
    /// A family this engine does not know.
    Other(String),
}

impl CardFamily {
    /// Returns the family code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::F => "F",
            Self::T => "T",
            Self::D => "D",
            Self::C => "C",
            Self::Other(code) => code,
        }
    }
}

impl From<&str> for CardFamily {
    fn from(code: &str) -> Self {
        match code.trim() {
            "F" => Self::F,
            "T" => Self::T,
            "D" => Self::D,
            "C" => Self::C,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for CardFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a recognized card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardIdentity {
    /// Identifier used for command lookups.
    pub card_id: String,
    /// Card family.
    pub family: CardFamily,
}

/// A cancellation flag that can be awaited.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Cancels the token. Idempotent.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    /// Checks whether the token was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = state.wait_for(|cancelled| *cancelled).await;
    }
}

/// A recognized card in a reader.
#[derive(Clone)]
pub struct CardSession {
    reader: Arc<dyn ReaderSession>,
    identity: CardIdentity,
    cancel: CancelToken,
}

impl fmt::Debug for CardSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardSession")
            .field("reader", &self.reader.info().name)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl CardSession {
    /// Creates a session with a fresh cancellation token.
    #[must_use]
    pub fn new(reader: Arc<dyn ReaderSession>, identity: CardIdentity) -> Self {
        Self {
            reader,
            identity,
            cancel: CancelToken::new(),
        }
    }

    /// Returns the reader.
    #[must_use]
    pub fn reader(&self) -> &Arc<dyn ReaderSession> {
        &self.reader
    }

    /// Returns the reader's name.
    #[must_use]
    pub fn reader_name(&self) -> &str {
        &self.reader.info().name
    }

    /// Returns the card identity.
    #[must_use]
    pub const fn identity(&self) -> &CardIdentity {
        &self.identity
    }

    /// Returns the card identifier.
    #[must_use]
    pub fn card_id(&self) -> &str {
        &self.identity.card_id
    }

    /// Returns the card family.
    #[must_use]
    pub const fn family(&self) -> &CardFamily {
        &self.identity.family
    }

    /// Returns the token cancelled when the session ends.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Owner of the current card session.
#[derive(Debug, Default)]
pub struct SessionContext {
    active: Mutex<Option<CardSession>>,
}

impl SessionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a session for a recognized card, ending any previous one.
    pub fn acquire(&self, reader: Arc<dyn ReaderSession>, identity: CardIdentity) -> CardSession {
        let session = CardSession::new(reader, identity);
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session.clone());
        if let Some(previous) = previous {
            debug!(reader = previous.reader_name(), "replacing card session");
            previous.cancel.cancel();
        }
        debug!(
            reader = session.reader_name(),
            card_id = session.card_id(),
            family = %session.family(),
            "card session acquired"
        );
        session
    }

    /// Ends the session if it belongs to `reader` (any reader when `None`):
    /// cancels its token and disconnects the reader.
    pub async fn release(&self, reader: Option<&str>) -> Option<CardSession> {
        let session = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            let owned = active.as_ref().is_some_and(|current| {
                reader.is_none_or(|name| current.reader_name() == name)
            });
            if owned { active.take() } else { None }
        }?;

        session.cancel.cancel();
        if let Err(e) = session.reader.disconnect().await {
            warn!(reader = session.reader_name(), error = %e, "disconnect on release failed");
        }
        debug!(reader = session.reader_name(), "card session released");
        Some(session)
    }

    /// Returns the current session.
    #[must_use]
    pub fn current(&self) -> Option<CardSession> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MockReader;

    fn identity(card_id: &str) -> CardIdentity {
        CardIdentity {
            card_id: card_id.to_string(),
            family: CardFamily::T,
        }
    }

    #[test]
    fn family_codes() {
        assert_eq!(CardFamily::from("D"), CardFamily::D);
        assert_eq!(CardFamily::from(" F "), CardFamily::F);
        assert_eq!(CardFamily::from("X9"), CardFamily::Other("X9".to_string()));
        assert_eq!(CardFamily::Other("X9".to_string()).to_string(), "X9");
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn release_cancels_and_disconnects() {
        let context = SessionContext::new();
        let reader = MockReader::new("reader-1", "3B8F");
        let session = context.acquire(reader.clone(), identity("card-1"));

        assert!(context.release(Some("other-reader")).await.is_none());
        assert!(context.current().is_some());

        let released = context.release(Some("reader-1")).await.unwrap();
        assert_eq!(released.card_id(), "card-1");
        assert!(session.cancel_token().is_cancelled());
        assert_eq!(reader.disconnects(), 1);
        assert!(context.current().is_none());
    }

    #[tokio::test]
    async fn acquire_replaces_previous_session() {
        let context = SessionContext::new();
        let first = context.acquire(MockReader::new("r1", "3B"), identity("a"));
        let second = context.acquire(MockReader::new("r2", "3B"), identity("b"));

        assert!(first.cancel_token().is_cancelled());
        assert!(!second.cancel_token().is_cancelled());
        assert_eq!(context.current().unwrap().card_id(), "b");
    }
}
