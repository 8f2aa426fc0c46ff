//! Session orchestrator: the single serialization point.
//!
//! ```text
//!  exchange channel ─┐
//!  speech stream ────┤
//!  visual samples ───┼──▸ mpsc<SessionInput> ──▸ SessionOrchestrator ──▸ SessionNotice ──▸ UI shell
//!  visibility/clip ──┤          ▲                     │
//!  candidate ────────┘          └── spawned waits ◂───┘   (connectivity, permission, hint)
//! ```
//!
//! Every mutation of session state happens on the task running
//! [`SessionOrchestrator::run`]. Long waits are spawned and report back
//! through the same input channel, so producers never observe a torn
//! state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::exchange::{
    wait_connected, ChannelEvent, ExchangeChannel, ExchangeCoordinator, PendingExchange,
    QuestionDelivery,
};
use crate::hint::{Hint, HintSource};
use crate::media::{MediaHandles, MediaLease};
use crate::model::{DraftSource, ExitReason, Question, TranscriptSegment, WarningStatus};
use crate::persistence::{KeyValueStore, PersistedSnapshot, PersistenceManager, Recovery};
use crate::policy::{ContentVerdict, PolicyDecision, PolicyEngine};
use crate::proctoring::{ProctoringAggregator, ProctoringCounters, RemoteCounterSync, VisualSample};
use crate::session::{ActiveStage, CompletionReason, Entry, Phase, Session, SessionMachine};
use crate::speech::{CaptureState, SegmentOutcome, SpeechCaptureManager, SpeechStream};

/// Cadence of timer checks, caption expiry and debounced writes.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Capacity of the input channel.
const INPUT_CAPACITY: usize = 256;

/// Generate a fresh session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Inputs and notices ───────────────────────────────────────────

/// Everything that can happen to a session.
#[derive(Debug)]
pub enum SessionInput {
    // Candidate actions
    Begin,
    AcknowledgeNotice,
    StartSpeech,
    StopSpeech,
    EditDraft(String),
    SubmitAnswer { question_id: String },
    RetryQuestion,
    RequestHint,
    EndInterview,

    // Producers
    Channel(ChannelEvent),
    Transcript(TranscriptSegment),
    ListeningChanged(bool),
    VisibilityChanged { hidden: bool },
    Clipboard,
    Visual(VisualSample),

    // Browser lifecycle
    PageHide,
    Shutdown,

    // Results of spawned waits
    ConnectivityResolved(Result<()>),
    SpeechPermission(Result<()>),
    HintFetched {
        question_id: String,
        result: Result<Hint>,
    },
}

/// Everything the UI shell is told.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    PhaseChanged(Phase),
    QuestionReady {
        question: Question,
        number: u32,
        audio: Option<Vec<u8>>,
    },
    DraftChanged(String),
    Caption(Option<String>),
    SpeechState(CaptureState),
    /// Shown once when speech is unavailable; typing still works.
    ManualEntryOnly { reason: String },
    /// Transient connecting/retrying indicator.
    Connecting,
    TabWarning { count: u32 },
    WarningIssued(WarningStatus),
    RemainingTime(i64),
    HintReady {
        question_id: String,
        expected_answer: String,
    },
    SessionExpired,
    Error { message: String, recoverable: bool },
    /// Final notice; sent exactly once.
    Exit(ExitReason),
}

/// Cloneable sender for [`SessionInput`]s.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionInput>,
}

impl SessionHandle {
    pub async fn send(&self, input: SessionInput) -> Result<()> {
        self.tx
            .send(input)
            .await
            .map_err(|_| SessionError::channel("session orchestrator has stopped"))
    }

    pub async fn submit_answer(&self, question_id: impl Into<String>) -> Result<()> {
        self.send(SessionInput::SubmitAnswer {
            question_id: question_id.into(),
        })
        .await
    }

    pub async fn end_interview(&self) -> Result<()> {
        self.send(SessionInput::EndInterview).await
    }

    pub async fn page_hide(&self) -> Result<()> {
        self.send(SessionInput::PageHide).await
    }

    /// Pump a channel's event receiver into the session.
    pub fn forward_channel_events(&self, mut events: mpsc::Receiver<ChannelEvent>) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(SessionInput::Channel(event)).await.is_err() {
                    break;
                }
            }
        })
    }
}

/// External collaborators of one session.
pub struct Collaborators {
    pub channel: Arc<dyn ExchangeChannel>,
    pub speech: Arc<dyn SpeechStream>,
    pub store: Arc<dyn KeyValueStore>,
    pub media: Arc<dyn MediaHandles>,
    pub hints: Option<Arc<dyn HintSource>>,
    pub clock: Arc<dyn Clock>,
}

// ── Orchestrator ─────────────────────────────────────────────────

pub struct SessionOrchestrator {
    clock: Arc<dyn Clock>,
    machine: SessionMachine,
    exchange: ExchangeCoordinator,
    speech: SpeechCaptureManager,
    proctoring: ProctoringAggregator,
    counter_sync: RemoteCounterSync,
    policy: PolicyEngine,
    persistence: PersistenceManager,
    hints: Option<Arc<dyn HintSource>>,
    media: MediaLease,
    inputs_tx: mpsc::Sender<SessionInput>,
    inputs_rx: Option<mpsc::Receiver<SessionInput>>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    cancel: CancellationToken,
    counters_requested: bool,
    last_remaining: Option<i64>,
    finished: bool,
}

impl SessionOrchestrator {
    /// Wire a session. Returns the orchestrator, a handle for producers and
    /// the notice stream for the UI shell.
    pub fn new(
        session_id: impl Into<String>,
        config: SessionConfig,
        collaborators: Collaborators,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionNotice>) {
        let session_id = session_id.into();
        let Collaborators {
            channel,
            speech,
            store,
            media,
            hints,
            clock,
        } = collaborators;

        let (inputs_tx, inputs_rx) = mpsc::channel(INPUT_CAPACITY);
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let now = clock.now();

        let orchestrator = Self {
            machine: SessionMachine::new(
                session_id.clone(),
                config.interview.interview_type.clone(),
                config.interview.duration_secs,
                config.interview.max_questions,
                now,
            ),
            exchange: ExchangeCoordinator::new(channel, config.exchange.clone(), session_id.clone()),
            speech: SpeechCaptureManager::new(speech, config.speech.clone()),
            proctoring: ProctoringAggregator::new(config.proctoring.violation_log_limit),
            counter_sync: RemoteCounterSync::new(config.proctoring.remote_sync_debounce()),
            policy: PolicyEngine::new(config.policy.clone()),
            persistence: PersistenceManager::new(
                store,
                session_id,
                config.persistence.snapshot_debounce(),
            ),
            hints,
            media: MediaLease::new(media),
            inputs_tx: inputs_tx.clone(),
            inputs_rx: Some(inputs_rx),
            notices,
            cancel: CancellationToken::new(),
            counters_requested: false,
            last_remaining: None,
            finished: false,
            clock,
        };
        (orchestrator, SessionHandle { tx: inputs_tx }, notices_rx)
    }

    // ── Read access ──────────────────────────────────────────────

    pub fn session(&self) -> &Session {
        self.machine.session()
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    pub fn speech_state(&self) -> CaptureState {
        self.speech.state()
    }

    pub fn counters(&self) -> ProctoringCounters {
        self.proctoring.counters()
    }

    pub fn exchange_pending(&self) -> Option<&PendingExchange> {
        self.exchange.pending()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Handle for producers; same as the one returned by [`new`](Self::new).
    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.inputs_tx.clone(),
        }
    }

    // ── Run loop ─────────────────────────────────────────────────

    /// Recover, then process inputs until the session ends or
    /// [`SessionInput::Shutdown`] arrives.
    pub async fn run(mut self) -> Result<()> {
        let mut inputs = self
            .inputs_rx
            .take()
            .ok_or_else(|| SessionError::channel("session orchestrator already running"))?;

        self.load().await;

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.finished {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(SessionInput::Shutdown) | None => break,
                    Some(input) => self.handle(input).await,
                },
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.teardown();
        Ok(())
    }

    /// Apply one input. Errors become notices; nothing escapes.
    pub async fn handle(&mut self, input: SessionInput) {
        if self.finished {
            tracing::trace!(input = ?input, "Input after session end ignored");
            return;
        }
        let now = self.clock.now();
        if !matches!(input, SessionInput::ConnectivityResolved(_)) {
            self.machine.touch(now);
        }

        let result = match input {
            SessionInput::Begin => self.begin().await,
            SessionInput::AcknowledgeNotice => self.acknowledge_notice().await,
            SessionInput::StartSpeech => self.start_speech(),
            SessionInput::StopSpeech => {
                self.stop_speech();
                Ok(())
            }
            SessionInput::EditDraft(text) => self.edit_draft(text),
            SessionInput::SubmitAnswer { question_id } => {
                self.submit_answer(&question_id).await.map(|_| ())
            }
            SessionInput::RetryQuestion => {
                self.request_question();
                Ok(())
            }
            SessionInput::RequestHint => self.request_hint(),
            SessionInput::EndInterview => self.end_interview().await,
            SessionInput::Channel(event) => self.on_channel_event(event).await,
            SessionInput::Transcript(segment) => self.on_transcript(segment),
            SessionInput::ListeningChanged(listening) => self.on_listening_changed(listening).await,
            SessionInput::VisibilityChanged { hidden } => self.on_visibility(hidden).await,
            SessionInput::Clipboard => {
                self.on_clipboard();
                Ok(())
            }
            SessionInput::Visual(sample) => {
                self.on_visual_sample(sample);
                Ok(())
            }
            SessionInput::PageHide => self.page_hide(),
            SessionInput::Shutdown => {
                self.teardown();
                Ok(())
            }
            SessionInput::ConnectivityResolved(result) => self.on_connectivity(result).await,
            SessionInput::SpeechPermission(result) => self.on_speech_permission(result).await,
            SessionInput::HintFetched {
                question_id,
                result,
            } => self.on_hint(&question_id, result),
        };

        if let Err(e) = result {
            self.report(e);
        }
    }

    // ── Recovery and entry ───────────────────────────────────────

    /// Look for a previous run and route accordingly.
    pub async fn load(&mut self) {
        let now = self.clock.now();
        let recovery = match self.persistence.recover(now) {
            Ok(recovery) => recovery,
            Err(e) => {
                tracing::warn!(error = %e, "Snapshot recovery failed; starting fresh");
                self.report(e);
                Recovery::Fresh
            }
        };

        match recovery {
            Recovery::Fresh => self.notify(SessionNotice::PhaseChanged(self.machine.phase())),
            Recovery::Terminated => {
                if self.machine.terminate(now).is_some() {
                    self.finish(Phase::Terminated, false).await;
                }
            }
            Recovery::Expired { snapshot } => {
                self.report(SessionError::ExpiredSession);
                self.notify(SessionNotice::SessionExpired);
                self.proctoring
                    .restore(snapshot.proctoring_counters, &snapshot.violations);
                if let Some(Entry::Terminal(phase)) =
                    self.machine.complete(CompletionReason::SnapshotExpired, now)
                {
                    self.finish(phase, false).await;
                }
            }
            Recovery::Resume {
                snapshot,
                remaining_secs,
            } => {
                self.proctoring
                    .restore(snapshot.proctoring_counters, &snapshot.violations);
                self.policy.restore_guard(snapshot.tab_switch_count);
                match self.machine.restore(&snapshot, remaining_secs, now) {
                    Ok(entry) => {
                        if let Some(question) = self.machine.session().current_question.clone() {
                            self.notify(SessionNotice::QuestionReady {
                                question,
                                number: self.machine.session().question_number,
                                audio: None,
                            });
                            self.notify(SessionNotice::DraftChanged(
                                self.machine.session().draft.text.clone(),
                            ));
                        }
                        self.on_entry(entry).await;
                    }
                    Err(e) => self.report(e),
                }
            }
        }
    }

    pub async fn begin(&mut self) -> Result<()> {
        let acknowledged = self.persistence.notice_acknowledged()?;
        match self.machine.begin(acknowledged, self.clock.now())? {
            Some(entry) => self.on_entry(entry).await,
            None => self.notify(SessionNotice::PhaseChanged(self.machine.phase())),
        }
        Ok(())
    }

    pub async fn acknowledge_notice(&mut self) -> Result<()> {
        let entry = self.machine.acknowledge_notice(self.clock.now())?;
        self.persistence.acknowledge_notice()?;
        self.on_entry(entry).await;
        Ok(())
    }

    async fn on_entry(&mut self, entry: Entry) {
        match entry {
            Entry::Active { request_question } => self.on_active(request_question),
            Entry::Terminal(phase) => {
                let remote_end = match phase {
                    Phase::Completed(reason) => reason.needs_remote_end(),
                    _ => true,
                };
                self.finish(phase, remote_end).await;
            }
        }
    }

    fn on_active(&mut self, request_question: bool) {
        self.proctoring.arm();
        self.persistence.mark_dirty(self.clock.monotonic_now());
        self.notify(SessionNotice::PhaseChanged(self.machine.phase()));
        self.notify_remaining();
        if request_question {
            self.request_question();
        }
    }

    // ── Exchange ─────────────────────────────────────────────────

    /// Reserve the exchange slot and wait for connectivity off-loop.
    fn request_question(&mut self) {
        if !self.machine.phase().is_active() || self.machine.session().is_terminated() {
            return;
        }
        if !self.exchange.begin_question_request() {
            return;
        }

        let channel = self.exchange.channel();
        let attempts = self.exchange.config().connect_attempts;
        let backoff = self.exchange.config().connect_backoff();
        let tx = self.inputs_tx.clone();
        let notices = self.notices.clone();
        let token = self.cancel.child_token();

        tokio::spawn(async move {
            let wait = wait_connected(channel, attempts, backoff, move || {
                let _ = notices.send(SessionNotice::Connecting);
            });
            tokio::select! {
                _ = token.cancelled() => {}
                result = wait => {
                    let _ = tx.send(SessionInput::ConnectivityResolved(result)).await;
                }
            }
        });
    }

    async fn on_connectivity(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            self.exchange.connectivity_failed();
            return Err(e);
        }
        // A question may have arrived while the wait was running.
        if self.exchange.pending() != Some(&PendingExchange::Question) {
            return Ok(());
        }
        if !self.counters_requested {
            self.counters_requested = true;
            self.counter_sync.begin_remote_load();
            if let Err(e) = self.exchange.fetch_proctoring_counters().await {
                tracing::debug!(error = %e, "Proctoring counter fetch failed");
                self.counter_sync.finish_remote_load(None);
            }
        }
        let interview_type = self.machine.session().interview_type.clone();
        self.exchange.send_question_request(&interview_type).await
    }

    /// Submit the current draft. Returns `Ok(false)` when another exchange
    /// is in flight (the call is a no-op).
    pub async fn submit_answer(&mut self, question_id: &str) -> Result<bool> {
        if self.exchange.is_busy() {
            tracing::debug!(question_id, "Submit ignored; exchange in flight");
            return Ok(false);
        }
        let now = self.clock.now();
        let text = self.machine.begin_submit(question_id, now)?;

        // Capture ends before anything goes on the wire.
        self.stop_speech();

        let metrics = self.proctoring.snapshot();
        match self.exchange.submit_answer(question_id, text.clone(), metrics).await {
            Ok(true) => {
                self.notify(SessionNotice::DraftChanged(String::new()));
                self.notify(SessionNotice::PhaseChanged(self.machine.phase()));
                self.persistence.mark_dirty(self.clock.monotonic_now());
                Ok(true)
            }
            Ok(false) => {
                self.machine.submit_failed(text);
                self.notify_draft_restored();
                Ok(false)
            }
            Err(e) => {
                self.machine.submit_failed(text);
                self.notify_draft_restored();
                Err(e)
            }
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Connected => {
                tracing::debug!(session_id = %self.machine.session().id, "Exchange channel connected");
                Ok(())
            }
            ChannelEvent::Disconnected { reason } => {
                self.release_pending();
                if self.counter_sync.is_loading() {
                    self.counter_sync.finish_remote_load(None);
                }
                self.counters_requested = false;
                Err(SessionError::channel(format!("disconnected: {reason}")))
            }
            ChannelEvent::QuestionReceived(delivery) => self.apply_question(delivery),
            ChannelEvent::AnswerSubmitted(outcome) => {
                // A response that no longer owns the exchange slot still
                // carries a verdict; only its bundled question is dropped.
                let settled = self.exchange.answer_settled(&outcome.question_id);
                self.record_verdict_message(&outcome.verdict);
                let decision = self.policy.on_content_verdict(
                    &outcome.verdict,
                    &self.machine.session().warning,
                    self.clock.now(),
                );
                // Warnings land before any bundled question.
                if self.apply_decision(decision).await {
                    return Ok(());
                }
                settled?;
                if let Some(next) = outcome.next {
                    self.apply_question(next)
                } else if self.machine.question_limit_reached() {
                    self.complete(CompletionReason::QuestionLimit).await;
                    Ok(())
                } else {
                    self.machine.submission_settled();
                    self.notify(SessionNotice::PhaseChanged(self.machine.phase()));
                    Ok(())
                }
            }
            ChannelEvent::WarningIssued(verdict) => {
                self.record_verdict_message(&verdict);
                let decision = self.policy.on_content_verdict(
                    &verdict,
                    &self.machine.session().warning,
                    self.clock.now(),
                );
                self.apply_decision(decision).await;
                Ok(())
            }
            ChannelEvent::InterviewComplete { message } => {
                tracing::info!(message = ?message, "Backend reported interview complete");
                self.complete(CompletionReason::RemoteComplete).await;
                Ok(())
            }
            ChannelEvent::ProctoringCounters(remote) => {
                if self.proctoring.merge_remote(&remote) {
                    self.persistence.mark_dirty(self.clock.monotonic_now());
                }
                self.policy.restore_guard(self.proctoring.counters().tab_switches);
                // The backend holds `remote`; anything counted locally on top
                // of it still has to be pushed.
                self.counter_sync.finish_remote_load(Some(remote));
                if self.proctoring.counters() != remote {
                    self.counter_sync.mark_dirty(self.clock.monotonic_now());
                }
                Ok(())
            }
            ChannelEvent::EndAcknowledged => Ok(()),
            ChannelEvent::Error { message } => {
                // An answer stays in flight until its response or a
                // disconnect; an error frame may be unrelated or unparseable.
                if self.exchange.pending() == Some(&PendingExchange::Question) {
                    self.exchange.fail_pending();
                }
                if self.counter_sync.is_loading() {
                    self.counter_sync.finish_remote_load(None);
                }
                Err(SessionError::channel(message))
            }
        }
    }

    /// A failed exchange leaves the session active; a failed answer goes
    /// back into the draft.
    fn release_pending(&mut self) {
        if let Some(PendingExchange::Answer { text, .. }) = self.exchange.fail_pending() {
            self.machine.submit_failed(text);
            self.notify_draft_restored();
        }
    }

    fn notify_draft_restored(&self) {
        self.notify(SessionNotice::DraftChanged(
            self.machine.session().draft.text.clone(),
        ));
        self.notify(SessionNotice::PhaseChanged(self.machine.phase()));
    }

    fn apply_question(&mut self, delivery: QuestionDelivery) -> Result<()> {
        if self.machine.session().is_terminated() {
            tracing::debug!(question_id = %delivery.question.id, "Question after termination dropped");
            return Ok(());
        }
        self.exchange.question_delivered();
        self.machine
            .advance_question(delivery.question, delivery.number, self.clock.now())?;
        if self.speech.is_listening() {
            self.speech.reset_transcript();
        }

        let session = self.machine.session();
        if let Some(question) = session.current_question.clone() {
            self.notify(SessionNotice::QuestionReady {
                question,
                number: session.question_number,
                audio: delivery.audio,
            });
        }
        self.notify(SessionNotice::PhaseChanged(self.machine.phase()));
        self.persistence.mark_dirty(self.clock.monotonic_now());
        Ok(())
    }

    // ── Policy ───────────────────────────────────────────────────

    /// Apply a policy decision. Returns `true` when the session is over.
    async fn apply_decision(&mut self, decision: PolicyDecision) -> bool {
        let now = self.clock.now();
        match decision {
            PolicyDecision::None => false,
            PolicyDecision::TabWarning { count } => {
                self.notify(SessionNotice::TabWarning { count });
                false
            }
            PolicyDecision::Warn(status) => {
                self.machine.apply_warning(&status, now);
                self.mirror_warning();
                self.notify(SessionNotice::WarningIssued(
                    self.machine.session().warning.clone(),
                ));
                false
            }
            PolicyDecision::Terminate(status) => {
                let entry = self.machine.apply_warning(&status, now);
                self.mirror_warning();
                self.notify(SessionNotice::WarningIssued(
                    self.machine.session().warning.clone(),
                ));
                if let Some(entry) = entry {
                    self.on_entry(entry).await;
                }
                true
            }
        }
    }

    /// Backend warning text goes into the transcript as a system line.
    fn record_verdict_message(&mut self, verdict: &ContentVerdict) {
        if !(verdict.warning_issued || verdict.interview_terminated) {
            return;
        }
        if let Some(message) = verdict.message.as_deref().filter(|m| !m.trim().is_empty()) {
            self.machine.push_system_message(message, self.clock.now());
        }
    }

    fn mirror_warning(&mut self) {
        let status = self.machine.session().warning.clone();
        if let Err(e) = self.persistence.mirror_warning(&status) {
            tracing::warn!(error = %e, "Failed to mirror warning status");
        }
    }

    // ── Proctoring ───────────────────────────────────────────────

    async fn on_visibility(&mut self, hidden: bool) -> Result<()> {
        let now = self.clock.now();
        if self.proctoring.record_visibility(hidden, now).is_none() {
            return Ok(());
        }
        self.counters_changed();
        let decision = self.policy.on_tab_switch_count(
            self.proctoring.counters().tab_switches,
            &self.machine.session().warning,
            now,
        );
        self.apply_decision(decision).await;
        Ok(())
    }

    fn on_clipboard(&mut self) {
        if self.proctoring.record_clipboard(self.clock.now()).is_some() {
            self.counters_changed();
        }
    }

    fn on_visual_sample(&mut self, sample: VisualSample) {
        let before = self.proctoring.counters();
        self.proctoring.ingest_sample(sample, self.clock.now());
        if self.proctoring.counters() != before {
            self.counters_changed();
        }
    }

    fn counters_changed(&mut self) {
        let mono = self.clock.monotonic_now();
        self.counter_sync.mark_dirty(mono);
        self.persistence.mark_dirty(mono);
    }

    // ── Speech ───────────────────────────────────────────────────

    /// Start capture. The permission prompt runs off-loop.
    pub fn start_speech(&mut self) -> Result<()> {
        match self.machine.phase() {
            Phase::Active(ActiveStage::Answering) | Phase::Active(ActiveStage::AwaitingQuestion) => {}
            phase => return Err(SessionError::invalid_phase("start speech", phase)),
        }
        if !self.speech.begin_start() {
            return Ok(());
        }
        self.notify(SessionNotice::SpeechState(self.speech.state()));

        let stream = self.speech.stream();
        let tx = self.inputs_tx.clone();
        let token = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = stream.request_permission() => {
                    let _ = tx.send(SessionInput::SpeechPermission(result)).await;
                }
            }
        });
        Ok(())
    }

    async fn on_speech_permission(&mut self, permission: Result<()>) -> Result<()> {
        let result = self.speech.complete_start(permission).await;
        self.notify(SessionNotice::SpeechState(self.speech.state()));
        if let Err(e) = &result {
            if self.speech.take_permission_notice() {
                self.notify(SessionNotice::ManualEntryOnly {
                    reason: e.to_string(),
                });
            }
        }
        result.map(|_| ())
    }

    /// Stop capture. Synchronous; late transcripts are dropped.
    pub fn stop_speech(&mut self) {
        let was = self.speech.state();
        self.speech.stop();
        if was != self.speech.state() {
            self.notify(SessionNotice::SpeechState(self.speech.state()));
            self.notify(SessionNotice::Caption(None));
        }
    }

    fn on_transcript(&mut self, segment: TranscriptSegment) -> Result<()> {
        match self.speech.on_segment(segment, self.clock.monotonic_now()) {
            SegmentOutcome::Ignored => Ok(()),
            SegmentOutcome::Caption => {
                let caption = self
                    .speech
                    .caption(self.clock.monotonic_now())
                    .map(str::to_string);
                self.notify(SessionNotice::Caption(caption));
                Ok(())
            }
            SegmentOutcome::FinalTranscript(text) => {
                self.notify(SessionNotice::Caption(None));
                self.machine.update_draft(text, DraftSource::Transcript)?;
                self.notify(SessionNotice::DraftChanged(
                    self.machine.session().draft.text.clone(),
                ));
                self.persistence.mark_dirty(self.clock.monotonic_now());
                Ok(())
            }
        }
    }

    async fn on_listening_changed(&mut self, listening: bool) -> Result<()> {
        if !self.speech.on_listening_changed(listening) {
            return Ok(());
        }
        if let Err(e) = self.speech.restart().await {
            self.notify(SessionNotice::SpeechState(self.speech.state()));
            if self.speech.take_permission_notice() {
                self.notify(SessionNotice::ManualEntryOnly {
                    reason: e.to_string(),
                });
            }
            return Err(e);
        }
        Ok(())
    }

    // ── Draft and hints ──────────────────────────────────────────

    pub fn edit_draft(&mut self, text: String) -> Result<()> {
        self.machine.update_draft(text, DraftSource::Manual)?;
        self.persistence.mark_dirty(self.clock.monotonic_now());
        Ok(())
    }

    pub fn request_hint(&mut self) -> Result<()> {
        let Some(source) = self.hints.clone() else {
            return Err(SessionError::Hint("hints are not configured".into()));
        };
        let Some(question_id) = self.machine.session().current_question_id().map(str::to_string)
        else {
            return Err(SessionError::invalid_phase("request hint", self.machine.phase()));
        };
        let interview_id = self.machine.session().id.clone();
        let tx = self.inputs_tx.clone();
        let token = self.cancel.child_token();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = source.fetch_hint(&interview_id, &question_id) => result,
            };
            let _ = tx.send(SessionInput::HintFetched { question_id, result }).await;
        });
        Ok(())
    }

    fn on_hint(&mut self, question_id: &str, result: Result<Hint>) -> Result<()> {
        let hint = result?;
        self.machine
            .attach_hint(question_id, hint.expected_answer.clone())?;
        self.notify(SessionNotice::HintReady {
            question_id: question_id.to_string(),
            expected_answer: hint.expected_answer,
        });
        Ok(())
    }

    // ── Time, persistence, teardown ──────────────────────────────

    /// Periodic check: countdown, caption expiry, debounced writes and
    /// counter sync.
    pub async fn tick(&mut self) {
        if self.finished {
            return;
        }
        let now = self.clock.now();
        let mono = self.clock.monotonic_now();

        if let Some(entry) = self.machine.tick(now) {
            self.on_entry(entry).await;
            return;
        }
        self.notify_remaining();

        if self.speech.expire_caption(mono) {
            self.notify(SessionNotice::Caption(None));
        }

        if self.persistence.is_due(mono) {
            if let Err(e) = self.flush_snapshot() {
                tracing::warn!(error = %e, "Snapshot write failed");
            }
        }

        if let Some(counters) = self.counter_sync.take_due(mono, self.proctoring.counters()) {
            if let Err(e) = self.exchange.update_proctoring_counters(counters).await {
                tracing::debug!(error = %e, "Proctoring counter push failed; retrying later");
                self.counter_sync.mark_dirty(mono);
            }
        }
    }

    fn notify_remaining(&mut self) {
        if !self.machine.phase().is_active() {
            return;
        }
        let remaining = self.machine.session().remaining_secs(self.clock.now());
        if self.last_remaining != Some(remaining) {
            self.last_remaining = Some(remaining);
            self.notify(SessionNotice::RemainingTime(remaining));
        }
    }

    fn capture_snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot::capture(
            self.machine.session(),
            self.proctoring.counters(),
            self.proctoring.violations().cloned().collect(),
            self.clock.now(),
        )
    }

    fn flush_snapshot(&mut self) -> Result<()> {
        if !self.machine.phase().is_active() {
            return Ok(());
        }
        let snapshot = self.capture_snapshot();
        self.persistence.write_snapshot(&snapshot)
    }

    /// Page is being hidden or unloaded: write the snapshot now.
    pub fn page_hide(&mut self) -> Result<()> {
        self.flush_snapshot()
    }

    pub async fn end_interview(&mut self) -> Result<()> {
        self.complete(CompletionReason::EndedByCandidate).await;
        Ok(())
    }

    async fn complete(&mut self, reason: CompletionReason) {
        if let Some(entry) = self.machine.complete(reason, self.clock.now()) {
            self.on_entry(entry).await;
        }
    }

    /// Terminal path. Runs once: stop producers, archive the final state,
    /// tell the backend (bounded), clear live markers, release media and
    /// notify the exit reason.
    async fn finish(&mut self, phase: Phase, remote_end: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.cancel.cancel();
        self.speech.stop();
        self.proctoring.disarm();

        let session_id = self.machine.session().id.clone();
        tracing::info!(session_id = %session_id, phase = %phase, "Session finishing");

        if phase == Phase::Terminated {
            if let Err(e) = self.persistence.mark_terminated(self.clock.now()) {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to write terminated marker");
            }
        }
        let snapshot = self.capture_snapshot();
        if let Err(e) = self.persistence.archive_result(&snapshot) {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to archive session result");
        }

        if remote_end {
            if let Err(e) = self.exchange.end_interview().await {
                tracing::warn!(session_id = %session_id, error = %e, "Remote end failed; cleaning up locally");
                self.report(e);
            }
        }

        if let Err(e) = self.persistence.clear_markers() {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to clear session markers");
        }
        self.media.release();

        self.notify(SessionNotice::PhaseChanged(phase));
        if let Some(reason) = phase.exit_reason() {
            tracing::info!(session_id = %session_id, reason = reason.as_str(), "Session exited");
            self.notify(SessionNotice::Exit(reason));
        }
    }

    /// Component teardown (navigation away, shell unmount). The session
    /// stays resumable: the snapshot is flushed, not cleared.
    pub fn teardown(&mut self) {
        self.cancel.cancel();
        self.speech.stop();
        if let Err(e) = self.flush_snapshot() {
            tracing::warn!(error = %e, "Snapshot flush on teardown failed");
        }
        self.media.release();
    }

    // ── Notices ──────────────────────────────────────────────────

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    fn report(&self, error: SessionError) {
        let recoverable = error.is_recoverable();
        tracing::warn!(
            session_id = %self.machine.session().id,
            error = %error,
            recoverable,
            "Session error"
        );
        self.notify(SessionNotice::Error {
            message: error.to_string(),
            recoverable,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exchange::testing::FakeChannel;
    use crate::exchange::AnswerOutcome;
    use crate::persistence::MemoryStore;
    use crate::speech::testing::FakeSpeechStream;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingMedia {
        releases: AtomicU32,
    }

    impl MediaHandles for CountingMedia {
        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Rig {
        orchestrator: SessionOrchestrator,
        notices: mpsc::UnboundedReceiver<SessionNotice>,
        channel: Arc<FakeChannel>,
        media: Arc<CountingMedia>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Rig {
        fn new() -> Self {
            let channel = Arc::new(FakeChannel::connected());
            let media = Arc::new(CountingMedia::default());
            let store = Arc::new(MemoryStore::new());
            store
                .set("interview-session:risk-notice-acknowledged", "true")
                .unwrap();
            let clock = Arc::new(ManualClock::new(
                chrono::Utc.with_ymd_and_hms(2026, 9, 1, 10, 0, 0).unwrap(),
            ));
            let (orchestrator, _handle, notices) = SessionOrchestrator::new(
                "iv-1",
                SessionConfig::default(),
                Collaborators {
                    channel: channel.clone(),
                    speech: Arc::new(FakeSpeechStream::default()),
                    store: store.clone(),
                    media: media.clone(),
                    hints: None,
                    clock: clock.clone(),
                },
            );
            Self {
                orchestrator,
                notices,
                channel,
                media,
                store,
                clock,
            }
        }

        fn drain(&mut self) -> Vec<SessionNotice> {
            let mut out = Vec::new();
            while let Ok(notice) = self.notices.try_recv() {
                out.push(notice);
            }
            out
        }

        async fn active_with_question(&mut self) {
            self.orchestrator.begin().await.unwrap();
            self.orchestrator
                .handle(SessionInput::Channel(ChannelEvent::QuestionReceived(
                    QuestionDelivery {
                        question: Question::new("q1", "What does Drop do?"),
                        number: 1,
                        audio: None,
                    },
                )))
                .await;
        }
    }

    #[tokio::test]
    async fn acknowledged_candidate_goes_straight_to_active() {
        let mut rig = Rig::new();
        rig.orchestrator.begin().await.unwrap();
        assert_eq!(
            rig.orchestrator.phase(),
            Phase::Active(ActiveStage::AwaitingQuestion)
        );
        assert!(rig
            .drain()
            .contains(&SessionNotice::PhaseChanged(Phase::Active(
                ActiveStage::AwaitingQuestion
            ))));
    }

    #[tokio::test]
    async fn answer_round_trip_advances_to_next_question() {
        let mut rig = Rig::new();
        rig.active_with_question().await;
        rig.orchestrator.edit_draft("Frees resources".into()).unwrap();

        assert!(rig.orchestrator.submit_answer("q1").await.unwrap());
        assert_eq!(
            rig.orchestrator.phase(),
            Phase::Active(ActiveStage::Submitting)
        );

        rig.orchestrator
            .handle(SessionInput::Channel(ChannelEvent::AnswerSubmitted(
                AnswerOutcome {
                    question_id: "q1".into(),
                    verdict: ContentVerdict::default(),
                    next: Some(QuestionDelivery {
                        question: Question::new("q2", "What is Send?"),
                        number: 2,
                        audio: None,
                    }),
                },
            )))
            .await;

        let session = rig.orchestrator.session();
        assert_eq!(session.current_question_id(), Some("q2"));
        assert_eq!(session.draft.question_id, "q2");
        assert!(rig.orchestrator.exchange_pending().is_none());
    }

    fn terminating_outcome(question_id: &str, next: &str) -> ChannelEvent {
        ChannelEvent::AnswerSubmitted(AnswerOutcome {
            question_id: question_id.into(),
            verdict: ContentVerdict {
                warning_issued: true,
                interview_terminated: true,
                warning_count: None,
                message: Some("abusive language".into()),
            },
            next: Some(QuestionDelivery {
                question: Question::new(next, "Never shown"),
                number: 2,
                audio: None,
            }),
        })
    }

    #[tokio::test]
    async fn disconnect_restores_draft_and_late_verdict_still_applies() {
        let mut rig = Rig::new();
        rig.active_with_question().await;
        rig.orchestrator.edit_draft("Runs destructors".into()).unwrap();
        rig.orchestrator.submit_answer("q1").await.unwrap();

        rig.orchestrator
            .handle(SessionInput::Channel(ChannelEvent::Disconnected {
                reason: "socket reset".into(),
            }))
            .await;

        assert_eq!(
            rig.orchestrator.phase(),
            Phase::Active(ActiveStage::Answering)
        );
        assert_eq!(rig.orchestrator.session().draft.text, "Runs destructors");
        assert!(rig.drain().iter().any(|n| matches!(
            n,
            SessionNotice::Error {
                recoverable: true,
                ..
            }
        )));

        rig.orchestrator
            .handle(SessionInput::Channel(terminating_outcome("q1", "q2")))
            .await;

        assert_eq!(rig.orchestrator.phase(), Phase::Terminated);
        assert!(rig.orchestrator.session().warning.is_terminated);
        assert_eq!(rig.orchestrator.session().current_question_id(), Some("q1"));
    }

    #[tokio::test]
    async fn error_frame_keeps_answer_in_flight() {
        let mut rig = Rig::new();
        rig.active_with_question().await;
        rig.orchestrator.edit_draft("Moves ownership".into()).unwrap();
        rig.orchestrator.submit_answer("q1").await.unwrap();

        rig.orchestrator
            .handle(SessionInput::Channel(crate::exchange::parse_server_frame(
                "garbage",
            )))
            .await;

        assert_eq!(
            rig.orchestrator.phase(),
            Phase::Active(ActiveStage::Submitting)
        );
        assert!(matches!(
            rig.orchestrator.exchange_pending(),
            Some(PendingExchange::Answer { .. })
        ));
        assert!(!rig.orchestrator.submit_answer("q1").await.unwrap());

        rig.orchestrator
            .handle(SessionInput::Channel(terminating_outcome("q1", "q2")))
            .await;

        assert_eq!(rig.orchestrator.phase(), Phase::Terminated);
        assert_eq!(rig.orchestrator.session().current_question_id(), Some("q1"));
        assert!(rig
            .drain()
            .contains(&SessionNotice::Exit(ExitReason::Terminated)));
    }

    #[tokio::test]
    async fn refused_submit_reports_restored_draft() {
        let mut rig = Rig::new();
        rig.active_with_question().await;
        rig.orchestrator.edit_draft("Pinned futures".into()).unwrap();
        // An end already sent to the backend closes the exchange.
        rig.orchestrator.exchange.end_interview().await.unwrap();
        rig.drain();

        assert!(!rig.orchestrator.submit_answer("q1").await.unwrap());

        assert_eq!(rig.orchestrator.session().draft.text, "Pinned futures");
        let notices = rig.drain();
        assert!(notices.contains(&SessionNotice::DraftChanged("Pinned futures".into())));
        assert!(notices.contains(&SessionNotice::PhaseChanged(Phase::Active(
            ActiveStage::Answering
        ))));
    }

    #[tokio::test]
    async fn counters_above_the_fetched_values_are_still_pushed() {
        let mut rig = Rig::new();
        rig.active_with_question().await;
        for _ in 0..2 {
            rig.orchestrator
                .handle(SessionInput::VisibilityChanged { hidden: true })
                .await;
            rig.orchestrator
                .handle(SessionInput::VisibilityChanged { hidden: false })
                .await;
        }
        rig.orchestrator
            .handle(SessionInput::Channel(ChannelEvent::ProctoringCounters(
                ProctoringCounters {
                    tab_switches: 1,
                    ..ProctoringCounters::default()
                },
            )))
            .await;
        assert_eq!(rig.orchestrator.counters().tab_switches, 2);

        rig.clock.advance(Duration::from_secs(5));
        rig.orchestrator.tick().await;

        assert!(rig.channel.sent_kinds().contains(&"update_proctoring"));
    }

    #[tokio::test]
    async fn end_interview_cleans_up_once() {
        let mut rig = Rig::new();
        rig.active_with_question().await;

        rig.orchestrator.end_interview().await.unwrap();
        rig.orchestrator.end_interview().await.unwrap();
        rig.orchestrator.teardown();

        assert_eq!(rig.channel.end_calls(), 1);
        assert_eq!(rig.media.releases.load(Ordering::SeqCst), 1);
        let exits: Vec<_> = rig
            .drain()
            .into_iter()
            .filter(|n| matches!(n, SessionNotice::Exit(_)))
            .collect();
        assert_eq!(exits, vec![SessionNotice::Exit(ExitReason::Completed)]);
        assert!(rig
            .store
            .get("interview-session:iv-1:result")
            .unwrap()
            .is_some());
        assert!(rig
            .store
            .get("interview-session:iv-1:snapshot")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn late_inputs_after_exit_are_ignored() {
        let mut rig = Rig::new();
        rig.active_with_question().await;
        rig.orchestrator.end_interview().await.unwrap();
        rig.drain();

        rig.orchestrator.handle(SessionInput::EditDraft("x".into())).await;
        rig.orchestrator.handle(SessionInput::VisibilityChanged { hidden: true }).await;
        assert!(rig.drain().is_empty());
        assert_eq!(rig.orchestrator.counters().tab_switches, 0);
    }

    #[tokio::test]
    async fn run_loop_exits_after_end_interview() {
        let rig = Rig::new();
        let Rig {
            orchestrator,
            mut notices,
            channel,
            media,
            ..
        } = rig;
        let handle = orchestrator.session_handle();
        let task = tokio::spawn(orchestrator.run());

        let (events_tx, events_rx) = mpsc::channel(4);
        let forward = handle.forward_channel_events(events_rx);

        handle.send(SessionInput::Begin).await.unwrap();
        events_tx
            .send(ChannelEvent::QuestionReceived(QuestionDelivery {
                question: Question::new("q1", "Explain Pin"),
                number: 1,
                audio: None,
            }))
            .await
            .unwrap();

        let ready = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(notice) = notices.recv().await {
                if matches!(notice, SessionNotice::QuestionReady { .. }) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(ready);

        handle.end_interview().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let mut exits = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            if let SessionNotice::Exit(reason) = notice {
                exits.push(reason);
            }
        }
        assert_eq!(exits, vec![ExitReason::Completed]);
        assert_eq!(channel.end_calls(), 1);
        assert_eq!(media.releases.load(Ordering::SeqCst), 1);
        assert!(handle.page_hide().await.is_err());
        drop(events_tx);
        forward.await.unwrap();
    }

    #[tokio::test]
    async fn clipboard_counts_only_while_active() {
        let mut rig = Rig::new();
        rig.orchestrator.handle(SessionInput::Clipboard).await;
        assert_eq!(rig.orchestrator.counters().copy_paste, 0);

        rig.orchestrator.begin().await.unwrap();
        rig.orchestrator.handle(SessionInput::Clipboard).await;
        assert_eq!(rig.orchestrator.counters().copy_paste, 1);
    }
}
