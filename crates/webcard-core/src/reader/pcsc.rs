//! PC/SC reader access for native hosts.
//!
//! This module provides [`ReaderSession`] and [`ReaderHost`] implementations
//! on top of the system's PC/SC daemon, which works on macOS, Linux and
//! Windows. PC/SC calls block, so every card operation runs on tokio's
//! blocking pool.
//!
//! # Example
//!
//! ```ignore
//! use webcard_core::reader::{PcscHost, ReaderHost};
//!
//! let host = PcscHost::new("api-key")?;
//! for reader in host.readers().await? {
//!     println!("{} {:?}", reader.info().name, reader.info().atr);
//! }
//! ```

use std::ffi::CString;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pcsc::{Card, Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State};
use serde_json::{Map, Value};
use tokio::task;

use super::{ApduResponse, ApduTemplate, CommandOutcome, ReaderHost, ReaderInfo, ReaderSession};
use crate::error::{Error, Result};
use crate::script::Params;

/// Encrypts dynamic-form payloads on behalf of the host.
pub type PayloadEncryptor = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// A PC/SC reader slot.
pub struct PcscReader {
    ctx: Context,
    reader: CString,
    info: ReaderInfo,
    card: Arc<Mutex<Option<Card>>>,
}

impl fmt::Debug for PcscReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscReader")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl PcscReader {
    fn new(ctx: Context, reader: CString, atr: Option<String>) -> Self {
        let info = ReaderInfo::new(reader.to_string_lossy(), atr);
        Self {
            ctx,
            reader,
            info,
            card: Arc::new(Mutex::new(None)),
        }
    }

    async fn with_card<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Option<Card>) -> Result<T> + Send + 'static,
    {
        let card = Arc::clone(&self.card);
        task::spawn_blocking(move || {
            let mut guard = card
                .lock()
                .map_err(|_| Error::Transceive("card handle poisoned".to_string()))?;
            op(&mut *guard)
        })
        .await
        .map_err(|e| Error::Transceive(format!("reader task failed: {e}")))?
    }
}

#[async_trait]
impl ReaderSession for PcscReader {
    fn info(&self) -> &ReaderInfo {
        &self.info
    }

    async fn connect(&self, exclusive: bool) -> Result<()> {
        let ctx = self.ctx.clone();
        let reader = self.reader.clone();
        let mode = if exclusive {
            ShareMode::Exclusive
        } else {
            ShareMode::Shared
        };

        self.with_card(move |slot| {
            if slot.is_none() {
                let card = ctx
                    .connect(&reader, mode, Protocols::ANY)
                    .map_err(|e| Error::ConnectionFailed(format!("{reader:?}: {e}")))?;
                *slot = Some(card);
            }
            Ok(())
        })
        .await
    }

    async fn transceive(
        &self,
        template: &ApduTemplate,
        params: Option<&Params>,
    ) -> Result<CommandOutcome> {
        let command = template.render(params)?;

        let response = self
            .with_card(move |slot| {
                let card = slot
                    .as_ref()
                    .ok_or_else(|| Error::Transceive("reader is not connected".to_string()))?;
                let mut response_buf = vec![0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
                let response = card
                    .transmit(&command, &mut response_buf)
                    .map_err(|e| Error::Transceive(format!("transmit failed: {e}")))?;
                ApduResponse::parse(response)
            })
            .await?;

        let mut outcome = CommandOutcome::raw(response.status_code());
        if response.is_success() && !response.data().is_empty() {
            let mut fields = Map::new();
            fields.insert(
                "data".to_string(),
                Value::String(hex::encode_upper(response.data())),
            );
            outcome.response = Some(fields);
        }
        Ok(outcome)
    }

    async fn disconnect(&self) -> Result<()> {
        self.with_card(|slot| {
            if let Some(card) = slot.take() {
                card.disconnect(Disposition::LeaveCard)
                    .map_err(|(_, e)| Error::ConnectionFailed(format!("disconnect failed: {e}")))?;
            }
            Ok(())
        })
        .await
    }
}

/// The PC/SC host: enumerates readers and supplies the API key.
pub struct PcscHost {
    ctx: Context,
    api_key: String,
    encryptor: Option<PayloadEncryptor>,
}

impl fmt::Debug for PcscHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscHost").finish_non_exhaustive()
    }
}

impl PcscHost {
    /// Establishes a PC/SC context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] if the PC/SC daemon is not
    /// available.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let ctx = Context::establish(Scope::User).map_err(|e| {
            Error::ConnectionFailed(format!("failed to establish PC/SC context: {e}"))
        })?;
        Ok(Self {
            ctx,
            api_key: api_key.into(),
            encryptor: None,
        })
    }

    /// Installs the payload encryptor used for dynamic-form payloads.
    #[must_use]
    pub fn with_encryptor(mut self, encryptor: PayloadEncryptor) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    fn list(ctx: &Context) -> Result<Vec<PcscReader>> {
        let names = ctx
            .list_readers_owned()
            .map_err(|e| Error::ConnectionFailed(format!("failed to list readers: {e}")))?;

        let mut states: Vec<ReaderState> = names
            .iter()
            .map(|name| ReaderState::new(name.clone(), State::UNAWARE))
            .collect();
        if !states.is_empty() {
            ctx.get_status_change(Duration::ZERO, &mut states)
                .map_err(|e| Error::ConnectionFailed(format!("failed to read status: {e}")))?;
        }

        Ok(names
            .into_iter()
            .zip(&states)
            .map(|(name, state)| {
                let atr = state
                    .event_state()
                    .contains(State::PRESENT)
                    .then(|| hex::encode_upper(state.atr()));
                PcscReader::new(ctx.clone(), name, atr)
            })
            .collect())
    }
}

#[async_trait]
impl ReaderHost for PcscHost {
    async fn readers(&self) -> Result<Vec<Arc<dyn ReaderSession>>> {
        let ctx = self.ctx.clone();
        let readers = task::spawn_blocking(move || Self::list(&ctx))
            .await
            .map_err(|e| Error::ConnectionFailed(format!("reader task failed: {e}")))??;
        Ok(readers
            .into_iter()
            .map(|reader| Arc::new(reader) as Arc<dyn ReaderSession>)
            .collect())
    }

    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        let encryptor = self
            .encryptor
            .as_ref()
            .ok_or_else(|| Error::Config("no payload encryptor configured".to_string()))?;
        encryptor(plaintext)
    }

    async fn api_key(&self) -> Result<String> {
        Ok(self.api_key.clone())
    }
}
