//! Funnel session driver.
//!
//! A session owns one answer store and walks the step graph: it reveals
//! messages with cooperative delays, applies skip and branch rules, holds a
//! single outstanding input at a time and triggers lead submission at the
//! designated step. Every delay and outbound call races the abandonment
//! signal; once abandoned, late results are dropped without touching state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::answers::AnswerStore;
use super::catalog::QUOTE_FALLBACK;
use super::graph::{ChoiceOption, DONE, InputKind, Step, StepGraph};
use super::state::{FunnelEvent, Progress, SessionPhase, TranscriptEntry};
use super::validate;
use super::verification::{CodeEntry, VerificationState, gate_code};
use crate::config::FunnelTiming;
use crate::error::{FunnelError, QuoteError, VerificationError};
use crate::lead::{Attribution, LeadDraft, LeadSubmitter};
use crate::services::{CarrierQuote, CodeCheck, QuoteLookup, QuoteRequest, VerificationService};

const EVENT_CAPACITY: usize = 64;

pub const CHOOSE_OPTION: &str = "Please choose one of the options.";
const CODE_TOO_SHORT: &str = "Please enter the code from your text message.";
const CODE_TOO_LONG: &str = "That code is too long. Please check your texts and try again.";
const CODE_MISMATCH: &str = "That code didn't match. Please try again.";
const CODE_CHECK_FAILED: &str = "I couldn't check that code right now. Please try again.";
const CODE_SEND_FAILED: &str =
    "I had trouble sending the code. Tap resend to try again, or use a different number.";
const CHANGE_CHANNEL: &str = "Use a different number";

/// Collaborators a session calls out to.
#[derive(Clone)]
pub struct FunnelDeps {
    pub quotes: Arc<dyn QuoteLookup>,
    pub verifier: Arc<dyn VerificationService>,
    pub submitter: Arc<dyn LeadSubmitter>,
}

/// Result of a user action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Accepted,
    /// Input failed validation; the session stays on the same step.
    Rejected { message: String },
    /// Wrong step, wrong phase or abandoned session. Nothing changed.
    Ignored,
}

/// Abandons a session from outside, without holding the session itself.
#[derive(Debug, Clone)]
pub struct SessionCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl SessionCloser {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub phase: SessionPhase,
    pub step_id: Option<String>,
    pub input: Option<InputKind>,
    pub options: Vec<ChoiceOption>,
    pub progress: Progress,
    pub verification: VerificationState,
    pub transcript: Vec<TranscriptEntry>,
    pub quotes: Vec<CarrierQuote>,
    pub lead_id: Option<Uuid>,
}

/// An answer that passed validation.
struct Accepted {
    /// Value recorded in the answer store.
    stored: String,
    /// Value handed to the step's `next` function.
    branch: String,
    /// Text shown as the user's message.
    display: String,
    /// Additional entries recorded alongside the answer.
    extra: Vec<(&'static str, String)>,
}

impl Accepted {
    fn plain(value: &str, display: impl Into<String>) -> Self {
        Self {
            stored: value.to_string(),
            branch: value.to_string(),
            display: display.into(),
            extra: Vec::new(),
        }
    }
}

pub struct FunnelSession {
    id: Uuid,
    graph: Arc<StepGraph>,
    deps: FunnelDeps,
    timing: FunnelTiming,
    attribution: Attribution,
    answers: AnswerStore,
    current: Option<String>,
    phase: SessionPhase,
    verification: VerificationState,
    quotes: Vec<CarrierQuote>,
    /// Successful answers so far. Skipped steps never count.
    completed: usize,
    transcript: Vec<TranscriptEntry>,
    /// Options shown for the step awaiting input.
    pending_options: Vec<ChoiceOption>,
    events: broadcast::Sender<FunnelEvent>,
    abandon_tx: Arc<watch::Sender<bool>>,
    abandon_rx: watch::Receiver<bool>,
    /// Latest snapshot, readable without holding the session.
    snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
    lead_id: Option<Uuid>,
}

impl FunnelSession {
    pub fn new(
        graph: Arc<StepGraph>,
        deps: FunnelDeps,
        timing: FunnelTiming,
        attribution: Attribution,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (abandon_tx, abandon_rx) = watch::channel(false);
        let id = Uuid::new_v4();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            id,
            phase: SessionPhase::NotStarted,
            step_id: None,
            input: None,
            options: Vec::new(),
            progress: Progress {
                completed: 0,
                total: graph.progress_total(),
            },
            verification: VerificationState::NotSent,
            transcript: Vec::new(),
            quotes: Vec::new(),
            lead_id: None,
        });
        Self {
            id,
            graph,
            deps,
            timing,
            attribution,
            answers: AnswerStore::new(),
            current: None,
            phase: SessionPhase::NotStarted,
            verification: VerificationState::NotSent,
            quotes: Vec::new(),
            completed: 0,
            transcript: Vec::new(),
            pending_options: Vec::new(),
            events,
            abandon_tx: Arc::new(abandon_tx),
            abandon_rx,
            snapshot_tx: Arc::new(snapshot_tx),
            lead_id: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Input kind of the step awaiting input, if any.
    pub fn current_input(&self) -> Option<&InputKind> {
        if self.phase != SessionPhase::AwaitingInput {
            return None;
        }
        self.current
            .as_deref()
            .and_then(|id| self.graph.step(id))
            .map(|s| &s.input)
    }

    pub fn pending_options(&self) -> &[ChoiceOption] {
        &self.pending_options
    }

    pub fn answers(&self) -> &AnswerStore {
        &self.answers
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn quotes(&self) -> &[CarrierQuote] {
        &self.quotes
    }

    pub fn verification(&self) -> VerificationState {
        self.verification
    }

    pub fn lead_id(&self) -> Option<Uuid> {
        self.lead_id
    }

    /// Number of accepted answers.
    pub fn completed_steps(&self) -> usize {
        self.completed
    }

    pub fn progress(&self) -> Progress {
        let total = self.graph.progress_total();
        Progress {
            completed: self.completed.min(total),
            total,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FunnelEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event stream, for subscribing without the session.
    pub fn event_sender(&self) -> broadcast::Sender<FunnelEvent> {
        self.events.clone()
    }

    /// Follows the session's snapshot as it changes.
    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn closer(&self) -> SessionCloser {
        SessionCloser {
            tx: Arc::clone(&self.abandon_tx),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            phase: self.phase,
            step_id: self.current.clone(),
            input: self.current_input().cloned(),
            options: self.pending_options.clone(),
            progress: self.progress(),
            verification: self.verification,
            transcript: self.transcript.clone(),
            quotes: self.quotes.clone(),
            lead_id: self.lead_id,
        }
    }

    // ── Session-facing operations ───────────────────────────────────

    /// Reveal the entry step. No-op once started.
    pub async fn start(&mut self) -> Result<(), FunnelError> {
        if self.phase != SessionPhase::NotStarted {
            return Ok(());
        }
        info!(session_id = %self.id, "Funnel session started");
        self.set_phase(SessionPhase::Revealing);
        let entry = self.graph.entry().to_string();
        self.advance(entry).await
    }

    /// Answer the step currently awaiting input.
    pub async fn submit_answer(
        &mut self,
        step_id: &str,
        raw: &str,
    ) -> Result<ActionOutcome, FunnelError> {
        let Some(step) = self.awaiting(step_id) else {
            return Ok(ActionOutcome::Ignored);
        };
        let raw = raw.trim();

        let accepted = match &step.input {
            InputKind::SingleChoice => {
                match self.pending_options.iter().find(|o| o.value == raw) {
                    Some(option) => Accepted::plain(raw, option.label.clone()),
                    None => return Ok(self.reject(&step, CHOOSE_OPTION)),
                }
            }
            InputKind::Consent { disclosure } => match raw {
                "true" | "accept" | "yes" => Accepted {
                    extra: vec![("consent_text", disclosure.clone())],
                    ..Accepted::plain("true", "I agree")
                },
                "decline" | "false" | "no" => Accepted {
                    stored: "false".to_string(),
                    ..Accepted::plain("decline", "No thanks")
                },
                _ => return Ok(self.reject(&step, CHOOSE_OPTION)),
            },
            InputKind::CodeVerification {
                contact_step,
                code_length,
                min_length,
            } => {
                let code = match gate_code(raw, *min_length, *code_length) {
                    CodeEntry::Ready(code) => code,
                    CodeEntry::TooShort => return Ok(self.reject(&step, CODE_TOO_SHORT)),
                    CodeEntry::TooLong => return Ok(self.reject(&step, CODE_TOO_LONG)),
                };
                let contact = validate::digits(self.answers.get(contact_step).unwrap_or_default());
                let verifier = Arc::clone(&self.deps.verifier);
                let timeout = self.timing.verify_timeout;
                let checked = {
                    let code = code.clone();
                    self.unless_abandoned(async move {
                        tokio::time::timeout(timeout, verifier.check(&contact, &code))
                            .await
                            .unwrap_or_else(|_| Err(VerificationError::Timeout(timeout)))
                    })
                    .await
                };
                match checked {
                    None => {
                        self.halt();
                        return Ok(ActionOutcome::Ignored);
                    }
                    Some(Ok(CodeCheck::Valid)) => {
                        self.set_verification(VerificationState::Verified);
                        Accepted {
                            stored: "verified".to_string(),
                            branch: "verified".to_string(),
                            ..Accepted::plain(&code, code.clone())
                        }
                    }
                    Some(Ok(CodeCheck::Invalid)) => return Ok(self.reject(&step, CODE_MISMATCH)),
                    Some(Err(e)) => {
                        warn!(session_id = %self.id, error = %e, "Verification check failed");
                        return Ok(self.reject(&step, CODE_CHECK_FAILED));
                    }
                }
            }
            InputKind::Text | InputKind::Number | InputKind::Email | InputKind::Phone => {
                if let Some(message) = step.check(raw, &self.answers) {
                    debug!(session_id = %self.id, step = %step.id, "Validation failed");
                    return Ok(self.reject(&step, &message));
                }
                Accepted::plain(raw, raw)
            }
            InputKind::Auto | InputKind::ResultDisplay | InputKind::ExternalAction { .. } => {
                return Ok(ActionOutcome::Ignored);
            }
        };

        self.accept(&step, &accepted);
        if !self.pause(self.timing.post_answer).await {
            self.halt();
            return Ok(ActionOutcome::Accepted);
        }
        let next = step.resolve_next(&self.answers, &accepted.branch);
        self.advance(next).await?;
        Ok(ActionOutcome::Accepted)
    }

    /// Issue a fresh verification code. State is unchanged.
    pub async fn resend_code(&mut self) -> Result<ActionOutcome, FunnelError> {
        let Some((step, contact_step)) = self.awaiting_verification() else {
            return Ok(ActionOutcome::Ignored);
        };
        let Some(sent) = self.issue_code(&contact_step).await else {
            self.halt();
            return Ok(ActionOutcome::Ignored);
        };

        if !sent {
            return Ok(self.reject(&step, CODE_SEND_FAILED));
        }
        let contact = validate::format_phone(self.answers.get(&contact_step).unwrap_or_default());
        self.say(
            TranscriptEntry::bot(format!("I sent a new code to {contact}."))
                .for_step(&step.id, step.input.tag()),
        );
        Ok(ActionOutcome::Accepted)
    }

    /// Go back to the contact step, discarding only the verification state.
    pub async fn change_channel(&mut self) -> Result<ActionOutcome, FunnelError> {
        let Some((step, contact_step)) = self.awaiting_verification() else {
            return Ok(ActionOutcome::Ignored);
        };
        info!(session_id = %self.id, from = %step.id, to = %contact_step, "Changing contact channel");

        self.say(TranscriptEntry::user(CHANGE_CHANNEL).for_step(&step.id, step.input.tag()));
        self.answers.reopen(&contact_step);
        self.set_verification(VerificationState::NotSent);
        self.pending_options.clear();
        self.set_phase(SessionPhase::Revealing);
        self.advance(contact_step).await?;
        Ok(ActionOutcome::Accepted)
    }

    /// Stop the session. Pending delays and calls are cut short.
    pub fn abandon(&mut self) {
        self.abandon_tx.send_replace(true);
        self.halt();
    }

    // ── Advance loop ────────────────────────────────────────────────

    /// Walk from `target` until a step awaits input or the session is done.
    async fn advance(&mut self, target: String) -> Result<(), FunnelError> {
        let limit = self.graph.hop_limit();
        let start = target.clone();
        let mut target = target;

        for _ in 0..limit {
            if self.is_abandoned() {
                self.halt();
                return Ok(());
            }
            if target == DONE {
                self.finish();
                return Ok(());
            }
            let Some(step) = self.graph.step(&target).cloned() else {
                warn!(session_id = %self.id, step = %target, "Unknown step, ending session");
                self.finish();
                return Ok(());
            };
            if step.should_skip(&self.answers) {
                debug!(session_id = %self.id, step = %step.id, "Skipping step");
                target = step.resolve_next(&self.answers, "");
                continue;
            }

            self.current = Some(step.id.clone());
            self.emit(FunnelEvent::Typing {
                step_id: step.id.clone(),
            });
            if !self.pause(self.timing.thinking).await {
                self.halt();
                return Ok(());
            }

            let message = step.resolve_message(&self.answers);
            let entry = TranscriptEntry::bot(message).for_step(&step.id, step.input.tag());

            match &step.input {
                InputKind::ResultDisplay => {
                    let Some(result) = self.lookup_quotes().await else {
                        self.halt();
                        return Ok(());
                    };
                    match result {
                        Ok(quotes) => {
                            info!(session_id = %self.id, count = quotes.len(), "Quotes shown");
                            self.quotes = quotes.clone();
                            self.say(entry.with_quotes(quotes));
                        }
                        Err(e) => {
                            warn!(session_id = %self.id, error = %e, "Quote lookup failed, deferring to agent");
                            self.say(
                                TranscriptEntry::bot(QUOTE_FALLBACK)
                                    .for_step(&step.id, step.input.tag()),
                            );
                        }
                    }
                    if !self.pause(self.timing.result_display).await {
                        self.halt();
                        return Ok(());
                    }
                    target = step.resolve_next(&self.answers, "");
                }
                InputKind::Auto => {
                    self.say(entry);
                    if self.graph.is_submission_trigger(&step.id) {
                        self.submit_lead().await;
                    }
                    if !self.pause(self.timing.auto_advance).await {
                        self.halt();
                        return Ok(());
                    }
                    target = step.resolve_next(&self.answers, "");
                }
                InputKind::ExternalAction { label, target: link } => {
                    self.say(entry.with_options(vec![ChoiceOption::new(label.clone(), link.clone())]));
                    target = step.resolve_next(&self.answers, "");
                }
                InputKind::CodeVerification { contact_step, .. } => {
                    let Some(sent) = self.issue_code(contact_step).await else {
                        self.halt();
                        return Ok(());
                    };
                    self.set_verification(VerificationState::AwaitingEntry);
                    self.say(entry);
                    if !sent {
                        self.say(
                            TranscriptEntry::bot(CODE_SEND_FAILED)
                                .for_step(&step.id, step.input.tag()),
                        );
                    }
                    self.await_input(&step, Vec::new());
                    return Ok(());
                }
                InputKind::Consent { disclosure } => {
                    let options = vec![
                        ChoiceOption::new("I agree", "true"),
                        ChoiceOption::new("No thanks", "decline"),
                    ];
                    self.say(entry);
                    self.say(
                        TranscriptEntry::bot(disclosure.clone())
                            .for_step(&step.id, step.input.tag())
                            .with_options(options.clone()),
                    );
                    self.await_input(&step, options);
                    return Ok(());
                }
                InputKind::SingleChoice
                | InputKind::Text
                | InputKind::Number
                | InputKind::Email
                | InputKind::Phone => {
                    let options = step.resolve_options(&self.answers);
                    if step.input == InputKind::SingleChoice && options.is_empty() {
                        error!(session_id = %self.id, step = %step.id, "Computed options are empty");
                        self.halt();
                        return Err(FunnelError::EmptyOptions(step.id.clone()));
                    }
                    self.say(entry.with_options(options.clone()));
                    self.await_input(&step, options);
                    return Ok(());
                }
            }
        }

        error!(session_id = %self.id, start = %start, limit, "Advance exceeded hop limit");
        self.halt();
        Err(FunnelError::HopLimitExceeded { start, limit })
    }

    // ── Outbound calls ──────────────────────────────────────────────

    /// `None` when the session was abandoned while the lookup was in flight.
    async fn lookup_quotes(&self) -> Option<Result<Vec<CarrierQuote>, QuoteError>> {
        let request = match QuoteRequest::from_answers(&self.answers) {
            Ok(request) => request,
            Err(e) => return Some(Err(e)),
        };
        let quotes = Arc::clone(&self.deps.quotes);
        let timeout = self.timing.quote_timeout;
        self.unless_abandoned(async move {
            match tokio::time::timeout(timeout, quotes.lookup(&request)).await {
                Ok(result) => result,
                Err(_) => Err(QuoteError::Timeout(timeout)),
            }
        })
        .await
    }

    /// Issue a code to the contact recorded at `contact_step`. Returns
    /// whether it was sent, or `None` when abandoned mid-call.
    async fn issue_code(&self, contact_step: &str) -> Option<bool> {
        let Some(contact) = self.answers.get(contact_step).map(validate::digits) else {
            let e = VerificationError::MissingContact(contact_step.to_string());
            warn!(session_id = %self.id, error = %e, "Cannot issue verification code");
            return Some(false);
        };
        let verifier = Arc::clone(&self.deps.verifier);
        let timeout = self.timing.verify_timeout;
        match self
            .unless_abandoned(async move {
                tokio::time::timeout(timeout, verifier.issue(&contact))
                    .await
                    .unwrap_or_else(|_| Err(VerificationError::Timeout(timeout)))
            })
            .await?
        {
            Ok(_) => Some(true),
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to issue verification code");
                Some(false)
            }
        }
    }

    /// Capture the lead. Awaited up to the durable create and enqueue, and
    /// never raced against abandonment: once started, capture finishes.
    async fn submit_lead(&mut self) {
        let draft = LeadDraft {
            session_id: self.id,
            answers: self.answers.clone(),
            attribution: self.attribution.clone(),
            quotes: self.quotes.clone(),
        };
        match self.deps.submitter.submit(&draft).await {
            Ok(lead_id) => {
                info!(session_id = %self.id, %lead_id, "Lead submitted");
                self.lead_id = Some(lead_id);
            }
            Err(e) => warn!(session_id = %self.id, error = %e, "Lead submission failed, continuing"),
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn is_abandoned(&self) -> bool {
        *self.abandon_rx.borrow()
    }

    /// Sleep for `duration` unless abandoned first. Returns `false` if the
    /// session was abandoned.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_abandoned();
        }
        let mut rx = self.abandon_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_abandoned(),
            _ = rx.wait_for(|closed| *closed) => false,
        }
    }

    /// Run `fut` unless the session is abandoned first; a result landing
    /// after abandonment is dropped.
    async fn unless_abandoned<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_abandoned() {
            return None;
        }
        let mut rx = self.abandon_rx.clone();
        tokio::select! {
            out = fut => (!self.is_abandoned()).then_some(out),
            _ = rx.wait_for(|closed| *closed) => None,
        }
    }

    /// The step awaiting input, if `step_id` names it and input is accepted.
    fn awaiting(&self, step_id: &str) -> Option<Step> {
        if self.phase != SessionPhase::AwaitingInput
            || self.is_abandoned()
            || self.current.as_deref() != Some(step_id)
        {
            debug!(
                session_id = %self.id,
                step = step_id,
                phase = %self.phase,
                current = ?self.current,
                "Ignoring action"
            );
            return None;
        }
        self.graph.step(step_id).cloned()
    }

    /// The verification step awaiting input and its contact step.
    fn awaiting_verification(&self) -> Option<(Step, String)> {
        let step = self.awaiting(self.current.as_deref()?)?;
        match &step.input {
            InputKind::CodeVerification { contact_step, .. } => {
                let contact_step = contact_step.clone();
                Some((step, contact_step))
            }
            _ => None,
        }
    }

    fn accept(&mut self, step: &Step, accepted: &Accepted) {
        if !self.answers.record(&step.id, accepted.stored.clone()) {
            warn!(session_id = %self.id, step = %step.id, "Step already answered, keeping first value");
        }
        for (key, value) in &accepted.extra {
            self.answers.record(key, value.clone());
        }
        self.say(TranscriptEntry::user(accepted.display.clone()).for_step(&step.id, step.input.tag()));
        self.completed += 1;
        self.pending_options.clear();
        self.set_phase(SessionPhase::Revealing);
    }

    fn reject(&mut self, step: &Step, message: &str) -> ActionOutcome {
        self.say(TranscriptEntry::bot(message).for_step(&step.id, step.input.tag()));
        ActionOutcome::Rejected {
            message: message.to_string(),
        }
    }

    fn await_input(&mut self, step: &Step, options: Vec<ChoiceOption>) {
        self.pending_options = options;
        self.set_phase(SessionPhase::AwaitingInput);
        self.emit(FunnelEvent::AwaitingInput {
            step_id: step.id.clone(),
            progress: self.progress(),
        });
    }

    fn say(&mut self, entry: TranscriptEntry) {
        self.transcript.push(entry.clone());
        self.emit(FunnelEvent::Message { entry });
    }

    fn emit(&self, event: FunnelEvent) {
        self.publish();
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn set_phase(&mut self, next: SessionPhase) {
        if self.phase == next {
            return;
        }
        if !self.phase.can_transition_to(next) {
            warn!(session_id = %self.id, from = %self.phase, to = %next, "Invalid phase transition ignored");
            return;
        }
        self.phase = next;
        self.publish();
    }

    fn set_verification(&mut self, next: VerificationState) {
        if self.verification.can_transition_to(next) {
            self.verification = next;
            self.publish();
        } else {
            debug!(session_id = %self.id, from = ?self.verification, to = ?next, "Verification state unchanged");
        }
    }

    /// Reached `done`.
    fn finish(&mut self) {
        self.current = None;
        self.pending_options.clear();
        self.set_phase(SessionPhase::Done);
        info!(session_id = %self.id, lead_id = ?self.lead_id, completed = self.completed, "Funnel session complete");
        self.emit(FunnelEvent::Completed {
            lead_id: self.lead_id,
        });
    }

    /// Stopped early: abandoned or faulted.
    fn halt(&mut self) {
        if !self.phase.is_terminal() {
            debug!(session_id = %self.id, step = ?self.current, "Session halted");
            self.pending_options.clear();
            self.set_phase(SessionPhase::Done);
        }
    }
}
