use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{OtpType, read_totp};
use crate::engine::Engine;
use crate::error::Error;
use crate::presenter::{Level, UiEvent};
use crate::session::{CancelToken, CardSession};

struct Cycle {
    stop: CancelToken,
    sequence: String,
    task: JoinHandle<()>,
}

/// The self-refreshing TOTP display of one sequence.
///
/// At most one cycle runs at a time: starting a cycle stops the previous
/// one. A cycle also ends when its card session is cancelled.
#[derive(Default)]
pub struct TotpRefresher {
    current: Mutex<Option<Cycle>>,
}

impl std::fmt::Debug for TotpRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TotpRefresher")
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl TotpRefresher {
    /// Creates an idle refresher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts reading `sequence` every refresh period. A running cycle is
    /// stopped before the new one is spawned.
    pub fn start(&self, engine: Arc<Engine>, session: CardSession, sequence: String) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.take() {
            debug!(sequence = %previous.sequence, "TOTP refresh replaced");
            previous.stop.cancel();
        }

        let stop = CancelToken::new();
        let task = tokio::spawn(run(engine, session, sequence.clone(), stop.clone()));
        *current = Some(Cycle {
            stop,
            sequence,
            task,
        });
    }

    /// Stops the running cycle, if any.
    pub fn stop(&self) {
        let cycle = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cycle) = cycle {
            debug!(sequence = %cycle.sequence, "TOTP refresh stopped");
            cycle.stop.cancel();
        }
    }

    /// Returns the sequence being refreshed while the cycle is alive.
    #[must_use]
    pub fn sequence(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|cycle| !cycle.task.is_finished())
            .map(|cycle| cycle.sequence.clone())
    }

    /// Checks whether a cycle is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sequence().is_some()
    }
}

async fn run(engine: Arc<Engine>, session: CardSession, sequence: String, stop: CancelToken) {
    let refresh = engine.config().totp_refresh_secs.max(1);
    debug!(%sequence, refresh, "TOTP refresh started");

    loop {
        let read = tokio::select! {
            biased;
            () = stop.cancelled() => return,
            () = session.cancel_token().cancelled() => return,
            read = read_totp(&engine, &session, &sequence) => read,
        };
        match read {
            Ok(otp) => engine.emit(UiEvent::OtpAvailable {
                sequence: sequence.clone(),
                otp_type: OtpType::Totp,
                otp,
            }),
            Err(Error::Cancelled) => return,
            Err(e) => {
                warn!(%sequence, error = %e, "TOTP read failed");
                engine.emit(UiEvent::message(Level::Error, format!("TOTP not generated: {e}")));
                return;
            }
        }

        for remaining in (1..=refresh).rev() {
            engine.emit(UiEvent::OtpCountdown {
                sequence: sequence.clone(),
                remaining_secs: remaining,
            });
            tokio::select! {
                biased;
                () = stop.cancelled() => return,
                () = session.cancel_token().cancelled() => return,
                () = sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}
