//! In-memory collaborators for tests and demos.
//!
//! - [`MockReader`]: a reader whose answers are scripted per template
//! - [`MockService`]: a command service whose definitions default to
//!   "template = command name"
//! - [`MockHost`]: a reader host with a fixed reader list
//! - [`RecordingPresenter`]: records events and answers prompts
//! - [`MockRelay`]: records relayed OTPs
//!
//! Since [`MockService`] hands out each command's name as its template,
//! a [`MockReader`] can be scripted by command name:
//!
//! ```
//! use serde_json::json;
//! use webcard_core::mock::{MockReader, structured};
//!
//! let reader = MockReader::new("reader-1", "3B8F8001");
//! reader.respond("ReadSequenceInfo", structured(json!({"Sequence": ["1"]})));
//! assert_eq!(reader.transceived("ReadSequenceInfo"), 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::form::FormChoice;
use crate::otp::{OtpRelay, OtpSubmission};
use crate::presenter::{Confirmation, FormRequest, Presenter, UiEvent};
use crate::reader::{ApduTemplate, CommandOutcome, ReaderHost, ReaderInfo, ReaderSession};
use crate::script::Params;
use crate::service::{
    AtrCandidates, CommandDefinition, CommandKey, CommandService, PersonalizationRequest,
    SupportedCard,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A structured outcome from a JSON object. Non-objects give an empty map.
#[must_use]
pub fn structured(value: Value) -> CommandOutcome {
    match value {
        Value::Object(map) => CommandOutcome::structured(map),
        _ => CommandOutcome::structured(Map::new()),
    }
}

// =============================================================================
// Reader
// =============================================================================

/// One command sent to a [`MockReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    /// Template as sent.
    pub template: String,
    /// Parameters as sent.
    pub params: Option<Params>,
}

#[derive(Debug, Clone)]
enum Reply {
    Outcome(CommandOutcome),
    Fail,
}

#[derive(Debug, Default)]
struct ReaderState {
    queued: HashMap<String, VecDeque<Reply>>,
    standing: HashMap<String, CommandOutcome>,
    transcript: Vec<Transmission>,
    latency: Option<Duration>,
}

/// A reader answering from scripted responses.
///
/// For each transmitted template the reader answers with, in order: the
/// next queued reply for that template, the standing response for it, or
/// a bare `9000`.
#[derive(Debug)]
pub struct MockReader {
    info: ReaderInfo,
    state: Mutex<ReaderState>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
    refuse_connect: AtomicBool,
}

impl MockReader {
    /// A reader holding a card with `atr`.
    #[must_use]
    pub fn new(name: &str, atr: &str) -> Arc<Self> {
        Self::with_info(ReaderInfo::new(name, Some(atr.to_string())))
    }

    /// A reader without a card.
    #[must_use]
    pub fn empty(name: &str) -> Arc<Self> {
        Self::with_info(ReaderInfo::new(name, None))
    }

    fn with_info(info: ReaderInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            state: Mutex::new(ReaderState::default()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            max_open: AtomicUsize::new(0),
            refuse_connect: AtomicBool::new(false),
        })
    }

    /// Sets the response returned every time `template` is sent.
    pub fn respond(&self, template: &str, outcome: CommandOutcome) {
        lock(&self.state)
            .standing
            .insert(template.to_string(), outcome);
    }

    /// Queues a one-shot response for `template`.
    pub fn push_response(&self, template: &str, outcome: CommandOutcome) {
        self.push(template, Reply::Outcome(outcome));
    }

    /// Queues a one-shot transport failure for `template`.
    pub fn push_failure(&self, template: &str) {
        self.push(template, Reply::Fail);
    }

    fn push(&self, template: &str, reply: Reply) {
        lock(&self.state)
            .queued
            .entry(template.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Makes every connect attempt fail.
    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Delays every transceive by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = Some(latency);
    }

    /// Returns every command sent so far.
    #[must_use]
    pub fn transcript(&self) -> Vec<Transmission> {
        lock(&self.state).transcript.clone()
    }

    /// Returns how often `template` was sent.
    #[must_use]
    pub fn transceived(&self, template: &str) -> usize {
        lock(&self.state)
            .transcript
            .iter()
            .filter(|sent| sent.template == template)
            .count()
    }

    /// Returns the number of connect calls.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Returns the number of disconnect calls.
    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Returns the highest number of connections that were open at once.
    #[must_use]
    pub fn max_open_connections(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReaderSession for MockReader {
    fn info(&self) -> &ReaderInfo {
        &self.info
    }

    async fn connect(&self, _exclusive: bool) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed(self.info.name.clone()));
        }
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(open, Ordering::SeqCst);
        Ok(())
    }

    async fn transceive(
        &self,
        template: &ApduTemplate,
        params: Option<&Params>,
    ) -> Result<CommandOutcome> {
        let (reply, latency) = {
            let mut state = lock(&self.state);
            state.transcript.push(Transmission {
                template: template.as_str().to_string(),
                params: params.cloned(),
            });
            let queued = state
                .queued
                .get_mut(template.as_str())
                .and_then(VecDeque::pop_front);
            let reply = queued.unwrap_or_else(|| {
                Reply::Outcome(
                    state
                        .standing
                        .get(template.as_str())
                        .cloned()
                        .unwrap_or_else(|| CommandOutcome::raw("9000")),
                )
            });
            (reply, state.latency)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match reply {
            Reply::Outcome(outcome) => Ok(outcome),
            Reply::Fail => Err(Error::Transceive(format!(
                "{}: scripted failure",
                template.as_str()
            ))),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        // Disconnecting an unopened reader is a no-op.
        let _ = self
            .open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| open.checked_sub(1));
        Ok(())
    }
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Default)]
struct ServiceState {
    definitions: HashMap<String, CommandDefinition>,
    get_calls: HashMap<String, usize>,
    get_failures: HashMap<String, usize>,
    personalization_calls: Vec<(CommandKey, PersonalizationRequest)>,
    candidates: HashMap<String, AtrCandidates>,
    atr_checks: usize,
    generated: HashMap<String, Vec<ApduTemplate>>,
    generate_calls: Vec<(CommandKey, String)>,
    bindings: HashMap<String, String>,
    verify_calls: Vec<(String, String)>,
    rollbacks: Vec<String>,
    supported: Vec<SupportedCard>,
    supported_calls: usize,
    user_data: Vec<Value>,
}

/// A command service answering from in-memory tables.
///
/// Unknown commands resolve to a definition whose template is the command
/// name. Unknown tokens are bound to every email.
#[derive(Debug, Default)]
pub struct MockService {
    state: Mutex<ServiceState>,
}

impl MockService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the definition of `name`.
    pub fn define(&self, name: &str, definition: CommandDefinition) {
        lock(&self.state)
            .definitions
            .insert(name.to_string(), definition);
    }

    /// Makes the next `times` lookups of `name` fail.
    pub fn fail_get_command(&self, name: &str, times: usize) {
        lock(&self.state)
            .get_failures
            .insert(name.to_string(), times);
    }

    /// Sets the candidates returned for `atr`.
    pub fn set_candidates(&self, atr: &str, candidates: AtrCandidates) {
        lock(&self.state)
            .candidates
            .insert(atr.to_string(), candidates);
    }

    /// Sets the templates generated for `name`.
    pub fn set_generated(&self, name: &str, templates: Vec<ApduTemplate>) {
        lock(&self.state)
            .generated
            .insert(name.to_string(), templates);
    }

    /// Sets the `verifyTokenByEmail` answer for `token`.
    pub fn set_binding(&self, token: &str, answer: &str) {
        lock(&self.state)
            .bindings
            .insert(token.to_string(), answer.to_string());
    }

    /// Sets the supported-card list.
    pub fn set_supported_cards(&self, cards: Vec<SupportedCard>) {
        lock(&self.state).supported = cards;
    }

    /// Sets the user-data definitions.
    pub fn set_user_data(&self, data: Vec<Value>) {
        lock(&self.state).user_data = data;
    }

    /// Returns how often `name` was looked up.
    #[must_use]
    pub fn get_command_calls(&self, name: &str) -> usize {
        lock(&self.state).get_calls.get(name).copied().unwrap_or(0)
    }

    /// Returns the number of personalization lookups.
    #[must_use]
    pub fn personalization_calls(&self) -> usize {
        lock(&self.state).personalization_calls.len()
    }

    /// Returns the number of ATR lookups.
    #[must_use]
    pub fn atr_checks(&self) -> usize {
        lock(&self.state).atr_checks
    }

    /// Returns every generation request with its payload.
    #[must_use]
    pub fn generate_calls(&self) -> Vec<(CommandKey, String)> {
        lock(&self.state).generate_calls.clone()
    }

    /// Returns every binding check as `(token, email)`.
    #[must_use]
    pub fn verify_calls(&self) -> Vec<(String, String)> {
        lock(&self.state).verify_calls.clone()
    }

    /// Returns the rolled-back tokens.
    #[must_use]
    pub fn rollbacks(&self) -> Vec<String> {
        lock(&self.state).rollbacks.clone()
    }

    /// Returns how often the supported-card list was fetched.
    #[must_use]
    pub fn supported_calls(&self) -> usize {
        lock(&self.state).supported_calls
    }

    fn definition(state: &ServiceState, name: &str) -> CommandDefinition {
        state
            .definitions
            .get(name)
            .cloned()
            .unwrap_or_else(|| CommandDefinition {
                template: Some(ApduTemplate::new(name)),
                ..CommandDefinition::default()
            })
    }
}

#[async_trait]
impl CommandService for MockService {
    async fn supported_cards(&self) -> Result<Vec<SupportedCard>> {
        let mut state = lock(&self.state);
        state.supported_calls += 1;
        if state.supported.is_empty() {
            return Err(Error::NoSupportedCards);
        }
        Ok(state.supported.clone())
    }

    async fn check_card_by_atr(&self, _channel: &str, atr: &str) -> Result<AtrCandidates> {
        let mut state = lock(&self.state);
        state.atr_checks += 1;
        Ok(state
            .candidates
            .get(atr)
            .cloned()
            .unwrap_or(AtrCandidates {
                ids: None,
                families: None,
                probe: None,
            }))
    }

    async fn get_command(&self, key: &CommandKey) -> Result<CommandDefinition> {
        let mut state = lock(&self.state);
        *state.get_calls.entry(key.command.clone()).or_default() += 1;
        if let Some(remaining) = state.get_failures.get_mut(&key.command)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::Network(format!("getCommand {} unavailable", key.command)));
        }
        Ok(Self::definition(&state, &key.command))
    }

    async fn personalization_command(
        &self,
        key: &CommandKey,
        request: &PersonalizationRequest,
    ) -> Result<CommandDefinition> {
        let mut state = lock(&self.state);
        state
            .personalization_calls
            .push((key.clone(), request.clone()));
        Ok(Self::definition(&state, &key.command))
    }

    async fn generate_command(&self, key: &CommandKey, data: &str) -> Result<Vec<ApduTemplate>> {
        let mut state = lock(&self.state);
        state.generate_calls.push((key.clone(), data.to_string()));
        state
            .generated
            .get(&key.command)
            .cloned()
            .ok_or_else(|| Error::Remote {
                operation: "generateCommand".to_string(),
                message: format!("nothing to generate for {}", key.command),
            })
    }

    async fn verify_token_by_email(&self, token: &str, email: &str) -> Result<String> {
        let mut state = lock(&self.state);
        state
            .verify_calls
            .push((token.to_string(), email.to_string()));
        Ok(state
            .bindings
            .get(token)
            .cloned()
            .unwrap_or_else(|| "1".to_string()))
    }

    async fn rollback_token(&self, token: &str) -> Result<()> {
        lock(&self.state).rollbacks.push(token.to_string());
        Ok(())
    }

    async fn list_user_data(&self) -> Result<Vec<Value>> {
        Ok(lock(&self.state).user_data.clone())
    }
}

// =============================================================================
// Host
// =============================================================================

/// A reader host with a fixed reader list. Encryption prefixes `enc:`.
pub struct MockHost {
    readers: Mutex<Vec<Arc<dyn ReaderSession>>>,
    encrypted: Mutex<Vec<String>>,
    api_key: String,
}

impl std::fmt::Debug for MockHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHost")
            .field("readers", &lock(&self.readers).len())
            .finish_non_exhaustive()
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// Creates a host without readers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            readers: Mutex::new(Vec::new()),
            encrypted: Mutex::new(Vec::new()),
            api_key: "test-api-key".to_string(),
        }
    }

    /// Attaches a reader.
    pub fn attach(&self, reader: Arc<dyn ReaderSession>) {
        lock(&self.readers).push(reader);
    }

    /// Returns every plaintext passed to [`ReaderHost::encrypt`].
    #[must_use]
    pub fn encrypted(&self) -> Vec<String> {
        lock(&self.encrypted).clone()
    }
}

#[async_trait]
impl ReaderHost for MockHost {
    async fn readers(&self) -> Result<Vec<Arc<dyn ReaderSession>>> {
        Ok(lock(&self.readers).clone())
    }

    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        lock(&self.encrypted).push(plaintext.to_string());
        Ok(format!("enc:{plaintext}"))
    }

    async fn api_key(&self) -> Result<String> {
        Ok(self.api_key.clone())
    }
}

// =============================================================================
// Presenter
// =============================================================================

#[derive(Debug)]
struct PresenterState {
    events: Vec<UiEvent>,
    answers: VecDeque<bool>,
    default_answer: bool,
    asked: Vec<Confirmation>,
    forms: Vec<FormRequest>,
    submissions: VecDeque<Map<String, Value>>,
}

/// A presenter that records everything it is shown.
///
/// Confirmations take queued answers first, then the default answer
/// (`true`). Forms take queued submissions first, then each choice's
/// default.
#[derive(Debug)]
pub struct RecordingPresenter {
    state: Mutex<PresenterState>,
}

impl Default for RecordingPresenter {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPresenter {
    /// Creates a presenter that confirms everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PresenterState {
                events: Vec::new(),
                answers: VecDeque::new(),
                default_answer: true,
                asked: Vec::new(),
                forms: Vec::new(),
                submissions: VecDeque::new(),
            }),
        }
    }

    /// Queues the answer to the next confirmation.
    pub fn answer(&self, answer: bool) {
        lock(&self.state).answers.push_back(answer);
    }

    /// Sets the answer used once the queue is empty.
    pub fn set_default_answer(&self, answer: bool) {
        lock(&self.state).default_answer = answer;
    }

    /// Queues the submission for the next form.
    pub fn submit(&self, submission: Map<String, Value>) {
        lock(&self.state).submissions.push_back(submission);
    }

    /// Returns the events emitted so far.
    #[must_use]
    pub fn events(&self) -> Vec<UiEvent> {
        lock(&self.state).events.clone()
    }

    /// Returns the events matching `predicate`.
    #[must_use]
    pub fn events_where(&self, predicate: impl Fn(&UiEvent) -> bool) -> Vec<UiEvent> {
        lock(&self.state)
            .events
            .iter()
            .filter(|event| predicate(event))
            .cloned()
            .collect()
    }

    /// Returns the confirmations asked so far.
    #[must_use]
    pub fn confirmations(&self) -> Vec<Confirmation> {
        lock(&self.state).asked.clone()
    }

    /// Returns the forms shown so far.
    #[must_use]
    pub fn forms(&self) -> Vec<FormRequest> {
        lock(&self.state).forms.clone()
    }
}

#[async_trait]
impl Presenter for RecordingPresenter {
    fn emit(&self, event: UiEvent) {
        lock(&self.state).events.push(event);
    }

    async fn confirm(&self, prompt: Confirmation) -> bool {
        let mut state = lock(&self.state);
        state.asked.push(prompt);
        let default = state.default_answer;
        state.answers.pop_front().unwrap_or(default)
    }

    async fn fill_form(&self, request: &FormRequest) -> Result<Map<String, Value>> {
        let mut state = lock(&self.state);
        state.forms.push(request.clone());
        Ok(state.submissions.pop_front().unwrap_or_else(|| {
            request
                .choices
                .iter()
                .filter_map(|FormChoice { key, default, .. }| {
                    default.clone().map(|value| (key.clone(), value))
                })
                .collect()
        }))
    }
}

// =============================================================================
// Relay
// =============================================================================

/// A relay that records submissions.
#[derive(Debug, Default)]
pub struct MockRelay {
    submissions: Mutex<Vec<OtpSubmission>>,
}

impl MockRelay {
    /// Creates an empty relay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the relayed submissions.
    #[must_use]
    pub fn submissions(&self) -> Vec<OtpSubmission> {
        lock(&self.submissions).clone()
    }
}

#[async_trait]
impl OtpRelay for MockRelay {
    async fn submit(&self, submission: OtpSubmission) -> Result<()> {
        lock(&self.submissions).push(submission);
        Ok(())
    }
}
