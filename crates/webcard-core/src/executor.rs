//! Script execution against a reader.
//!
//! [`Executor::run`] owns the reader for the duration of one run:
//!
//! ```text
//! connect(exclusive) ─► dispatch queue ─► disconnect
//!                         │
//!                         ├─ needs form?   generate, splice follow-ups
//!                         ├─ presence?     prompt (and hold)
//!                         └─ transceive ─► Ok | Incomplete
//! ```
//!
//! A failing command does not abort the run: it is recorded as
//! [`ExecutionStatus::Incomplete`] and the next command is sent. Only
//! cancellation of the session ends a run early. The reader is disconnected
//! on every exit path, and the busy indicator and presence prompt are
//! cleared even when the run future is dropped.
//!
//! Runs against the same reader are serialized: a run holds the reader's
//! turn from connect until its disconnect has completed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::form;
use crate::presenter::{FormRequest, Presenter, UiEvent};
use crate::reader::{CommandOutcome, Payload, ReaderHost, ReaderSession};
use crate::resolver::ResolvedCommand;
use crate::service::{CommandKey, CommandService};
use crate::session::CancelToken;

/// Outcome class of one executed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    /// The reader answered.
    Ok,
    /// The command could not be completed.
    Incomplete,
}

/// The result of one executed command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// Command name.
    pub name: String,
    /// Outcome class.
    pub status: ExecutionStatus,
    /// What the reader returned.
    pub payload: Option<Payload>,
    /// Candidate index reported by an identity probe.
    pub index: Option<usize>,
    /// Time spent on the command.
    pub elapsed: Duration,
}

impl ExecutionResult {
    fn ok(name: &str, outcome: CommandOutcome, elapsed: Duration) -> Self {
        Self {
            name: name.to_string(),
            status: ExecutionStatus::Ok,
            payload: outcome.payload(),
            index: outcome.index,
            elapsed,
        }
    }

    fn incomplete(name: &str, elapsed: Duration) -> Self {
        Self {
            name: name.to_string(),
            status: ExecutionStatus::Incomplete,
            payload: None,
            index: None,
            elapsed,
        }
    }

    /// Elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u128 {
        self.elapsed.as_millis()
    }

    fn structured(&self) -> Option<&Map<String, Value>> {
        match &self.payload {
            Some(Payload::Structured(map)) => Some(map),
            _ => None,
        }
    }
}

/// Runs resolved commands against a reader.
pub struct Executor {
    config: Arc<Config>,
    service: Arc<dyn CommandService>,
    host: Arc<dyn ReaderHost>,
    presenter: Arc<dyn Presenter>,
    turns: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        service: Arc<dyn CommandService>,
        host: Arc<dyn ReaderHost>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        Self {
            config,
            service,
            host,
            presenter,
            turns: Mutex::new(HashMap::new()),
        }
    }

    /// The lock serializing runs on the reader called `name`.
    fn turn(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut turns = self.turns.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(turns.entry(name.to_string()).or_default())
    }

    /// Runs `commands` in order and returns one result per command sent,
    /// including generated follow-ups.
    ///
    /// `card_id` enables dynamic-form expansion; without it commands are
    /// sent with their unexpanded templates.
    ///
    /// # Errors
    ///
    /// Returns the connect error if the reader cannot be reached and
    /// [`Error::Cancelled`] if `cancel` fires before the run completes.
    /// Failures of individual commands are reported as
    /// [`ExecutionStatus::Incomplete`] results instead.
    pub async fn run(
        &self,
        reader: &Arc<dyn ReaderSession>,
        card_id: Option<&str>,
        commands: Vec<ResolvedCommand>,
        cancel: &CancelToken,
    ) -> Result<Vec<ExecutionResult>> {
        let turn = self.turn(&reader.info().name);
        let turn = tokio::select! {
            biased;
            guard = turn.lock_owned() => guard,
            () = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let _busy = Indicator::show(&self.presenter, UiEvent::ReaderBusy);
        let mut connection = Connection::new(reader, turn);

        debug!(reader = %reader.info().name, commands = commands.len(), "script run started");
        let outcome = match reader.connect(true).await {
            Ok(()) => self.dispatch(reader, card_id, commands, cancel).await,
            Err(e) => Err(e),
        };
        connection.close().await;

        if let Ok(results) = &outcome {
            debug!(reader = %reader.info().name, results = results.len(), "script run finished");
        }
        outcome
    }

    async fn dispatch(
        &self,
        reader: &Arc<dyn ReaderSession>,
        card_id: Option<&str>,
        commands: Vec<ResolvedCommand>,
        cancel: &CancelToken,
    ) -> Result<Vec<ExecutionResult>> {
        let mut queue = VecDeque::from(commands);
        let mut results = Vec::with_capacity(queue.len());

        while let Some(command) = queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(card_id) = card_id
                && command.needs_dynamic_form()
            {
                let started = Instant::now();
                match self.expand(card_id, &command, results.last()).await {
                    Ok(follow_ups) => {
                        debug!(command = command.name(), count = follow_ups.len(), "expanded");
                        for follow_up in follow_ups.into_iter().rev() {
                            queue.push_front(follow_up);
                        }
                    }
                    Err(e) => {
                        warn!(command = command.name(), error = %e, "command generation failed");
                        results.push(ExecutionResult::incomplete(command.name(), started.elapsed()));
                    }
                }
                continue;
            }

            let result = tokio::select! {
                result = self.transmit(reader, &command) => result,
                () = cancel.cancelled() => return Err(Error::Cancelled),
            };
            results.push(result);
        }

        Ok(results)
    }

    /// Fills the command's form, has the service generate the concrete
    /// commands and returns them as follow-ups.
    async fn expand(
        &self,
        card_id: &str,
        command: &ResolvedCommand,
        previous: Option<&ExecutionResult>,
    ) -> Result<Vec<ResolvedCommand>> {
        let previous = previous
            .and_then(ExecutionResult::structured)
            .cloned()
            .unwrap_or_default();
        let plan = form::plan(
            command.form.as_ref(),
            &previous,
            command.descriptor.params(),
            Utc::now(),
            self.config.totp_period_secs,
        )?;

        let data = if plan.needs_input() {
            let request = FormRequest {
                command: command.name().to_string(),
                choices: plan.choices.clone(),
                fixed: plan.fixed.clone(),
            };
            let submission = self.presenter.fill_form(&request).await?;
            plan.merge(submission)
        } else {
            plan.fixed
        };

        let payload = self
            .host
            .encrypt(&serde_json::to_string(&Value::Object(data))?)
            .await?;
        let key = CommandKey::new(card_id, &self.config.channel, command.name());
        let templates = self.service.generate_command(&key, &payload).await?;
        if templates.is_empty() {
            return Err(Error::CommandNotFound {
                command: command.name().to_string(),
                reason: "generation returned no command".to_string(),
            });
        }

        Ok(templates
            .into_iter()
            .map(|template| command.follow_up(template))
            .collect())
    }

    async fn transmit(&self, reader: &Arc<dyn ReaderSession>, command: &ResolvedCommand) -> ExecutionResult {
        let prompt = if command.presence.before {
            let prompt = Indicator::show(&self.presenter, UiEvent::PresencePrompt);
            sleep(self.config.presence_hold()).await;
            Some(prompt)
        } else if command.presence.during {
            let prompt = Indicator::show(&self.presenter, UiEvent::PresencePrompt);
            sleep(self.config.presence_settle()).await;
            Some(prompt)
        } else {
            None
        };

        let started = Instant::now();
        let outcome = reader
            .transceive(&command.template, command.descriptor.params())
            .await;
        let elapsed = started.elapsed();
        drop(prompt);

        match outcome {
            Ok(outcome) => ExecutionResult::ok(command.name(), outcome, elapsed),
            Err(e) => {
                warn!(command = command.name(), error = %e, "transceive failed");
                ExecutionResult::incomplete(command.name(), elapsed)
            }
        }
    }
}

/// A boolean UI indicator switched on for its lifetime.
struct Indicator {
    presenter: Arc<dyn Presenter>,
    event: fn(bool) -> UiEvent,
}

impl Indicator {
    fn show(presenter: &Arc<dyn Presenter>, event: fn(bool) -> UiEvent) -> Self {
        presenter.emit(event(true));
        Self {
            presenter: Arc::clone(presenter),
            event,
        }
    }
}

impl Drop for Indicator {
    fn drop(&mut self) {
        self.presenter.emit((self.event)(false));
    }
}

/// Disconnects the reader when the run ends, including when the run future
/// is dropped mid-flight. The reader's turn is released only after the
/// disconnect, so the next run never shares a connection with this one.
struct Connection {
    reader: Option<Arc<dyn ReaderSession>>,
    turn: Option<OwnedMutexGuard<()>>,
}

impl Connection {
    fn new(reader: &Arc<dyn ReaderSession>, turn: OwnedMutexGuard<()>) -> Self {
        Self {
            reader: Some(Arc::clone(reader)),
            turn: Some(turn),
        }
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take()
            && let Err(e) = reader.disconnect().await
        {
            warn!(reader = %reader.info().name, error = %e, "disconnect failed");
        }
        self.turn = None;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let turn = self.turn.take();
        let Some(reader) = self.reader.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = reader.disconnect().await {
                    warn!(reader = %reader.info().name, error = %e, "disconnect after abort failed");
                }
                drop(turn);
            });
        }
    }
}
