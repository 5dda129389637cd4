//! Page controller.
//!
//! [`PageController`] ties reader events to workflows for one page:
//!
//! ```text
//! CardInserted ─► recognize ─► acquire session ─► workflow task
//!                                                 ├─ Dashboard:   enroll, then OTP discovery
//!                                                 ├─ Login:       OTP discovery with relay
//!                                                 └─ Personalize: bind the card to a token
//! CardRemoved ──► stop TOTP refresh ─► release session (cancel, disconnect)
//! ReadersConnected / ReadersDisconnected ─► scan readers
//! ```
//!
//! Workflow failures are reported to the presenter; they never stop the
//! controller.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::enrollment::{EnrollmentOutcome, enroll};
use crate::error::{Error, Result};
use crate::identity::{IdentityData, read_identity};
use crate::otp::{self, OtpContext, OtpRelay, SequenceEntry, TotpRefresher, discover};
use crate::personalize::personalize;
use crate::presenter::{Confirmation, Level, UiEvent};
use crate::reader::{ReaderEvent, ReaderInfo, ReaderSession};
use crate::recognition::recognize;
use crate::service::{PersonalizationRequest, SupportedCard};
use crate::session::{CardFamily, CardSession, SessionContext};

/// What the page is for.
#[derive(Clone)]
pub enum PageMode {
    /// Enrollment and OTP management for a signed-in user.
    Dashboard {
        /// Email of the signed-in user.
        email: String,
    },
    /// OTP login; OTPs are relayed instead of shown.
    Login {
        /// Email of the user logging in.
        email: String,
        /// Receiver of the OTPs.
        relay: Arc<dyn OtpRelay>,
    },
    /// Personalization of a fresh card.
    Personalize(PersonalizationRequest),
}

impl fmt::Debug for PageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dashboard { email } => f.debug_struct("Dashboard").field("email", email).finish(),
            Self::Login { email, .. } => f
                .debug_struct("Login")
                .field("email", email)
                .finish_non_exhaustive(),
            Self::Personalize(request) => f.debug_tuple("Personalize").field(request).finish(),
        }
    }
}

/// Reader classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReaderStatus {
    /// No card.
    Empty,
    /// A card of a supported model.
    Supported,
    /// A card of an unknown model.
    Unsupported,
}

/// A reader and what it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderSlot {
    /// Reader name and ATR.
    pub info: ReaderInfo,
    /// Classification.
    pub status: ReaderStatus,
}

/// Classifies a reader against the supported-card list.
#[must_use]
pub fn classify_reader(info: &ReaderInfo, supported: &[SupportedCard]) -> ReaderStatus {
    match &info.atr {
        None => ReaderStatus::Empty,
        Some(atr) if supported.iter().any(|card| card.matches(atr)) => ReaderStatus::Supported,
        Some(_) => ReaderStatus::Unsupported,
    }
}

/// Drives the workflows of one page.
pub struct PageController {
    engine: Arc<Engine>,
    mode: PageMode,
    context: SessionContext,
    refresher: TotpRefresher,
    supported: OnceCell<Vec<SupportedCard>>,
    workflow: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PageController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageController")
            .field("mode", &self.mode)
            .field("session", &self.context.current())
            .finish_non_exhaustive()
    }
}

impl PageController {
    /// Creates a controller.
    #[must_use]
    pub fn new(engine: Arc<Engine>, mode: PageMode) -> Arc<Self> {
        Arc::new(Self {
            engine,
            mode,
            context: SessionContext::new(),
            refresher: TotpRefresher::new(),
            supported: OnceCell::new(),
            workflow: Mutex::new(None),
        })
    }

    /// Returns the engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Returns the current card session.
    #[must_use]
    pub fn session(&self) -> Option<CardSession> {
        self.context.current()
    }

    /// Returns the TOTP refresher.
    #[must_use]
    pub const fn refresher(&self) -> &TotpRefresher {
        &self.refresher
    }

    /// Returns the supported-card list, fetched once.
    ///
    /// # Errors
    ///
    /// Returns the service error; a failed fetch is retried on the next
    /// call.
    pub async fn supported_cards(&self) -> Result<&[SupportedCard]> {
        self.supported
            .get_or_try_init(|| self.engine.service().supported_cards())
            .await
            .map(Vec::as_slice)
    }

    /// Lists the attached readers with their classification.
    ///
    /// # Errors
    ///
    /// Returns reader-host and supported-card errors.
    pub async fn list_readers(&self) -> Result<Vec<ReaderSlot>> {
        Ok(self
            .classified()
            .await?
            .into_iter()
            .map(|(_, slot)| slot)
            .collect())
    }

    async fn classified(&self) -> Result<Vec<(Arc<dyn ReaderSession>, ReaderSlot)>> {
        let supported = self.supported_cards().await?;
        let readers = self.engine.host().readers().await?;
        Ok(readers
            .into_iter()
            .map(|reader| {
                let info = reader.info().clone();
                let status = classify_reader(&info, supported);
                (reader, ReaderSlot { info, status })
            })
            .collect())
    }

    /// Lists the readers and, when no card session is active, loads the
    /// first reader holding a supported card.
    ///
    /// # Errors
    ///
    /// Returns listing errors. Loading errors are reported to the
    /// presenter.
    pub async fn scan(self: &Arc<Self>) -> Result<Vec<ReaderSlot>> {
        let classified = self.classified().await?;
        debug!(readers = classified.len(), "readers scanned");

        if self.context.current().is_none()
            && let Some((reader, _)) = classified
                .iter()
                .find(|(_, slot)| slot.status == ReaderStatus::Supported)
        {
            self.load_reported(Arc::clone(reader)).await;
        }
        Ok(classified.into_iter().map(|(_, slot)| slot).collect())
    }

    /// Recognizes the card in `reader`, starts a session for it and spawns
    /// the page's workflow.
    ///
    /// # Errors
    ///
    /// Returns recognition errors; no session is started then.
    pub async fn load_interface(self: &Arc<Self>, reader: Arc<dyn ReaderSession>) -> Result<CardSession> {
        info!(reader = %reader.info().name, "card detected");
        let identity = recognize(&self.engine, &reader).await?;
        let session = self.context.acquire(reader, identity);
        self.engine.emit(UiEvent::CardRecognized {
            reader: session.reader_name().to_string(),
            card_id: session.card_id().to_string(),
            family: session.family().to_string(),
        });

        let this = Arc::clone(self);
        let task_session = session.clone();
        let task = tokio::spawn(async move { this.dispatch(task_session).await });
        let previous = self
            .workflow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(session)
    }

    async fn load_reported(self: &Arc<Self>, reader: Arc<dyn ReaderSession>) {
        if let Err(e) = self.load_interface(reader).await {
            warn!(error = %e, "card recognition failed");
            self.engine.emit(UiEvent::message(
                Level::Error,
                format!("An error occurred during card recognition: {e}"),
            ));
        }
    }

    /// Waits for the running workflow task, if any.
    pub async fn settle(&self) {
        let task = self
            .workflow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "workflow task panicked");
        }
    }

    /// Ends the session of `reader`: stops the TOTP refresh, cancels
    /// pending work and disconnects.
    pub async fn unload(&self, reader: &str) {
        if self.context.current().is_some_and(|s| s.reader_name() == reader) {
            self.refresher.stop();
        }
        if self.context.release(Some(reader)).await.is_some() {
            info!(reader, "card session ended");
        }
        self.engine.emit(UiEvent::CardRemoved {
            reader: reader.to_string(),
        });
    }

    /// Handles one reader event.
    pub async fn handle_event(self: &Arc<Self>, event: ReaderEvent) {
        debug!(?event, "reader event");
        match event {
            ReaderEvent::CardInserted(reader) => self.load_reported(reader).await,
            ReaderEvent::CardRemoved { reader } => self.unload(&reader).await,
            ReaderEvent::ReadersConnected | ReaderEvent::ReadersDisconnected => {
                if let Err(e) = self.scan().await {
                    warn!(error = %e, "reader scan failed");
                    self.engine.emit(UiEvent::message(
                        Level::Error,
                        format!("An error occurred during reader recognition: {e}"),
                    ));
                }
            }
        }
    }

    /// Consumes reader events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ReaderEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("reader event channel closed");
    }

    async fn dispatch(self: Arc<Self>, session: CardSession) {
        match self.workflow_for(&session).await {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(e) => {
                warn!(card_id = session.card_id(), error = %e, "workflow failed");
                self.engine.emit(UiEvent::message(Level::Error, e.to_string()));
            }
        }
    }

    async fn workflow_for(&self, session: &CardSession) -> Result<()> {
        let family = session.family();
        match (&self.mode, family) {
            (PageMode::Dashboard { email }, CardFamily::F | CardFamily::T | CardFamily::D) => {
                if enroll(&self.engine, session).await? == EnrollmentOutcome::Enrolled {
                    let context = OtpContext::display(email.clone());
                    discover(&self.engine, session, &context, &self.refresher).await?;
                }
                Ok(())
            }
            (PageMode::Dashboard { .. }, CardFamily::C) => {
                self.engine.emit(UiEvent::message(
                    Level::Error,
                    "Cloud card functionality is not available yet",
                ));
                Ok(())
            }
            (PageMode::Login { email, relay }, CardFamily::F | CardFamily::D) => {
                let context = OtpContext::relay(email.clone(), Arc::clone(relay));
                discover(&self.engine, session, &context, &self.refresher).await?;
                Ok(())
            }
            (PageMode::Personalize(request), CardFamily::F | CardFamily::T | CardFamily::D) => {
                personalize(&self.engine, session, request).await?;
                Ok(())
            }
            _ => Err(Error::UnsupportedFamily(family.to_string())),
        }
    }

    fn otp_context(&self) -> Result<OtpContext> {
        match &self.mode {
            PageMode::Dashboard { email } => Ok(OtpContext::display(email.clone())),
            PageMode::Login { email, relay } => {
                Ok(OtpContext::relay(email.clone(), Arc::clone(relay)))
            }
            PageMode::Personalize(_) => Err(Error::Config(
                "OTP retrieval is not available while personalizing".to_string(),
            )),
        }
    }

    fn active(&self) -> Result<CardSession> {
        self.context
            .current()
            .ok_or_else(|| Error::CardNotFound("no card session".to_string()))
    }

    /// Retrieves an OTP for a sequence the user picked.
    ///
    /// # Errors
    ///
    /// See [`otp::retrieve`]; [`Error::CardNotFound`] without a card.
    pub async fn retrieve_otp(&self, entry: &SequenceEntry) -> Result<()> {
        let session = self.active()?;
        let context = self.otp_context()?;
        otp::retrieve(&self.engine, &session, &context, entry, &self.refresher).await
    }

    /// Deletes a sequence after the user confirms. Returns `false` when
    /// the user declines.
    ///
    /// # Errors
    ///
    /// See [`otp::delete_sequence`]; [`Error::CardNotFound`] without a card.
    pub async fn delete_sequence(&self, sequence: &str) -> Result<bool> {
        let session = self.active()?;
        let context = self.otp_context()?;
        if !self
            .engine
            .presenter()
            .confirm(Confirmation::DeleteSequence {
                sequence: sequence.to_string(),
            })
            .await
        {
            return Ok(false);
        }
        self.refresher.stop();
        otp::delete_sequence(&self.engine, &session, &context.email, sequence).await?;
        Ok(true)
    }

    /// Reads the identity data of the current card.
    ///
    /// # Errors
    ///
    /// See [`read_identity`]; [`Error::CardNotFound`] without a card.
    pub async fn read_identity(&self) -> Result<IdentityData> {
        let session = self.active()?;
        read_identity(&self.engine, &session).await
    }
}
