//! Session state machine.
//!
//! ```text
//! Guidelines ─▸ InitialWarning (first time only) ─▸ Active ─▸ Completed
//!      │                                              │
//!      └───────────────────────────────────────────▸  └─▸ Terminated
//!
//! Active: AwaitingQuestion ─▸ Answering ─▸ Submitting ─▸ (AwaitingQuestion | Answering)
//! ```
//!
//! [`SessionMachine`] is the only writer of [`Session`]. Every command checks
//! its own preconditions; callers get either an error or an [`Entry`] telling
//! them which side effects the transition requires.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::{Result, SessionError};
use crate::model::{
    AnswerDraft, ChatMessage, ChatRole, DraftSource, ExitReason, Question, WarningStatus,
};
use crate::persistence::PersistedSnapshot;
use crate::timer::Countdown;

// ── Phases ───────────────────────────────────────────────────────

/// Sub-state of an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveStage {
    /// Waiting for the backend to deliver a question.
    AwaitingQuestion,
    /// A question is on screen; the candidate types or speaks.
    Answering,
    /// An answer is in flight and being analyzed.
    Submitting,
}

/// Why a session completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// Explicit end action.
    EndedByCandidate,
    /// Countdown reached zero.
    TimeExpired,
    /// Maximum question count reached.
    QuestionLimit,
    /// Backend reported the interview as complete.
    RemoteComplete,
    /// A restored snapshot had no time left.
    SnapshotExpired,
}

impl CompletionReason {
    pub fn exit_reason(self) -> ExitReason {
        match self {
            Self::TimeExpired | Self::SnapshotExpired => ExitReason::Expired,
            Self::EndedByCandidate | Self::QuestionLimit | Self::RemoteComplete => {
                ExitReason::Completed
            }
        }
    }

    /// Whether the backend still has to be told the interview ended.
    pub fn needs_remote_end(self) -> bool {
        matches!(
            self,
            Self::EndedByCandidate | Self::TimeExpired | Self::QuestionLimit
        )
    }
}

/// Top-level session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Guidelines,
    InitialWarning,
    Active(ActiveStage),
    Completed(CompletionReason),
    Terminated,
}

impl Phase {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed(_) | Self::Terminated)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Guidelines => "guidelines",
            Self::InitialWarning => "initial-warning",
            Self::Active(ActiveStage::AwaitingQuestion) => "active/awaiting-question",
            Self::Active(ActiveStage::Answering) => "active/answering",
            Self::Active(ActiveStage::Submitting) => "active/submitting",
            Self::Completed(_) => "completed",
            Self::Terminated => "terminated",
        }
    }

    pub fn exit_reason(self) -> Option<ExitReason> {
        match self {
            Self::Completed(reason) => Some(reason.exit_reason()),
            Self::Terminated => Some(ExitReason::Terminated),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Side effects required by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// The session just became active: arm proctoring and the timer, and
    /// request a question when none is current.
    Active { request_question: bool },
    /// The session just ended: stop producers, flush, release media, notify.
    Terminal(Phase),
}

// ── Session aggregate ────────────────────────────────────────────

/// The root aggregate. Read it through [`SessionMachine::session`].
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub interview_type: String,
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_secs: u64,
    pub countdown: Option<Countdown>,
    pub question_number: u32,
    pub current_question: Option<Question>,
    pub draft: AnswerDraft,
    pub chat_history: Vec<ChatMessage>,
    pub warning: WarningStatus,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Seconds left at `now`. Before the countdown starts this is the full
    /// budget.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        match &self.countdown {
            Some(countdown) => countdown.remaining_secs(now),
            None => i64::try_from(self.duration_secs).unwrap_or(i64::MAX),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.warning.is_terminated || self.phase == Phase::Terminated
    }

    pub fn current_question_id(&self) -> Option<&str> {
        self.current_question.as_ref().map(|q| q.id.as_str())
    }
}

// ── Machine ──────────────────────────────────────────────────────

/// Single writer of the session aggregate.
#[derive(Debug)]
pub struct SessionMachine {
    session: Session,
    max_questions: u32,
}

impl SessionMachine {
    pub fn new(
        id: impl Into<String>,
        interview_type: impl Into<String>,
        duration_secs: u64,
        max_questions: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session: Session {
                id: id.into(),
                interview_type: interview_type.into(),
                phase: Phase::Guidelines,
                started_at: None,
                duration_secs,
                countdown: None,
                question_number: 0,
                current_question: None,
                draft: AnswerDraft::default(),
                chat_history: Vec::new(),
                warning: WarningStatus::default(),
                last_activity: now,
            },
            max_questions,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.session.phase
    }

    pub fn max_questions(&self) -> u32 {
        self.max_questions
    }

    pub fn question_limit_reached(&self) -> bool {
        self.session.question_number >= self.max_questions
    }

    /// Record candidate or producer activity.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.session.last_activity = now;
    }

    // ── Entry into the interview ─────────────────────────────────

    /// Leave the guidelines screen. Candidates who have never acknowledged
    /// the risk notice see it first.
    pub fn begin(&mut self, notice_acknowledged: bool, now: DateTime<Utc>) -> Result<Option<Entry>> {
        if self.session.phase != Phase::Guidelines {
            return Err(SessionError::invalid_phase("begin", self.session.phase));
        }
        if notice_acknowledged {
            Ok(Some(self.enter_active(now)))
        } else {
            self.session.phase = Phase::InitialWarning;
            tracing::info!(session_id = %self.session.id, "Showing initial risk notice");
            Ok(None)
        }
    }

    /// Candidate acknowledged the risk notice.
    pub fn acknowledge_notice(&mut self, now: DateTime<Utc>) -> Result<Entry> {
        if self.session.phase != Phase::InitialWarning {
            return Err(SessionError::invalid_phase(
                "acknowledge notice",
                self.session.phase,
            ));
        }
        Ok(self.enter_active(now))
    }

    fn enter_active(&mut self, now: DateTime<Utc>) -> Entry {
        self.session.phase = Phase::Active(ActiveStage::AwaitingQuestion);
        self.session.started_at = Some(now);
        self.session.countdown = Some(Countdown::start(now, self.session.duration_secs));
        self.session.last_activity = now;
        tracing::info!(
            session_id = %self.session.id,
            duration_secs = self.session.duration_secs,
            "Session active"
        );
        Entry::Active {
            request_question: true,
        }
    }

    /// Seed the session from a snapshot whose remaining time is positive.
    pub fn restore(
        &mut self,
        snapshot: &PersistedSnapshot,
        remaining_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<Entry> {
        if self.session.phase.is_terminal() {
            return Err(SessionError::invalid_phase("restore", self.session.phase));
        }
        if remaining_secs <= 0 {
            return Err(SessionError::ExpiredSession);
        }

        let session = &mut self.session;
        session.interview_type = snapshot.interview_type.clone();
        session.started_at = Some(snapshot.start_time);
        session.countdown = Some(Countdown::resume(now, remaining_secs));
        session.question_number = snapshot.question_number;
        session.current_question = snapshot.current_question.clone();
        session.chat_history = snapshot.chat_history.clone();
        session.warning = session.warning.merged(&snapshot.warning_status);
        session.last_activity = now;

        // Draft must stay bound to the current question; a draft for any
        // other question is dropped.
        session.draft = match &session.current_question {
            Some(q) if snapshot.answer_draft.question_id == q.id => snapshot.answer_draft.clone(),
            Some(q) => AnswerDraft::for_question(q.id.clone()),
            None => AnswerDraft::default(),
        };

        let stage = if session.current_question.is_some() {
            ActiveStage::Answering
        } else {
            ActiveStage::AwaitingQuestion
        };
        session.phase = Phase::Active(stage);

        tracing::info!(
            session_id = %session.id,
            remaining_secs,
            question_number = session.question_number,
            "Session restored from snapshot"
        );

        Ok(Entry::Active {
            request_question: session.current_question.is_none(),
        })
    }

    // ── Question / answer cycle ──────────────────────────────────

    /// Make `question` current. Clears the previous draft.
    pub fn advance_question(
        &mut self,
        question: Question,
        number: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.session.is_terminated() {
            return Err(SessionError::Terminated);
        }
        if !self.session.phase.is_active() {
            return Err(SessionError::invalid_phase(
                "advance question",
                self.session.phase,
            ));
        }

        let session = &mut self.session;
        session.chat_history.push(
            ChatMessage::new(ChatRole::Interviewer, question.prompt.clone(), now)
                .with_question(question.id.clone()),
        );
        session.draft = AnswerDraft::for_question(question.id.clone());
        session.question_number = number.max(session.question_number);
        tracing::info!(
            session_id = %session.id,
            question_id = %question.id,
            number = session.question_number,
            "Advanced to question"
        );
        session.current_question = Some(question);
        session.phase = Phase::Active(ActiveStage::Answering);
        session.last_activity = now;
        Ok(())
    }

    /// Replace the draft text for the current question.
    pub fn update_draft(&mut self, text: impl Into<String>, source: DraftSource) -> Result<()> {
        match self.session.phase {
            Phase::Active(ActiveStage::Answering) => {}
            phase => return Err(SessionError::invalid_phase("edit answer", phase)),
        }
        let Some(question_id) = self.session.current_question_id().map(str::to_string) else {
            return Err(SessionError::invalid_phase("edit answer", self.session.phase));
        };
        self.session.draft = AnswerDraft {
            question_id,
            text: text.into(),
            source,
        };
        Ok(())
    }

    /// Validate and take the draft for submission.
    ///
    /// Moves to `Submitting`, clears the draft and appends the answer to the
    /// chat history. Returns the answer text.
    pub fn begin_submit(&mut self, question_id: &str, now: DateTime<Utc>) -> Result<String> {
        if self.session.is_terminated() {
            return Err(SessionError::Terminated);
        }
        if self.session.phase != Phase::Active(ActiveStage::Answering) {
            return Err(SessionError::invalid_phase("submit answer", self.session.phase));
        }
        let current = self.session.current_question_id().unwrap_or_default();
        if current != question_id {
            return Err(SessionError::QuestionMismatch {
                current: current.to_string(),
                given: question_id.to_string(),
            });
        }
        if self.session.draft.is_blank() {
            return Err(SessionError::EmptyAnswer);
        }

        let session = &mut self.session;
        let text = std::mem::take(&mut session.draft.text);
        session.draft.source = DraftSource::Manual;
        session.chat_history.push(
            ChatMessage::new(ChatRole::Candidate, text.clone(), now).with_question(question_id),
        );
        session.phase = Phase::Active(ActiveStage::Submitting);
        session.last_activity = now;
        Ok(text)
    }

    /// The submission could not be sent: put the answer back so the
    /// candidate can retry.
    pub fn submit_failed(&mut self, text: String) {
        if self.session.phase != Phase::Active(ActiveStage::Submitting) {
            return;
        }
        let session = &mut self.session;
        if matches!(session.chat_history.last(), Some(m) if m.role == ChatRole::Candidate) {
            session.chat_history.pop();
        }
        session.draft.text = text;
        session.phase = Phase::Active(ActiveStage::Answering);
    }

    /// The answer was accepted and no question came with the response.
    pub fn submission_settled(&mut self) {
        if self.session.phase == Phase::Active(ActiveStage::Submitting) {
            self.session.phase = Phase::Active(ActiveStage::AwaitingQuestion);
        }
    }

    /// Append a system line (connection notices, hints) to the chat.
    pub fn push_system_message(&mut self, text: impl Into<String>, now: DateTime<Utc>) {
        self.session
            .chat_history
            .push(ChatMessage::new(ChatRole::System, text, now));
    }

    /// Attach a fetched expected answer to the current question.
    pub fn attach_hint(&mut self, question_id: &str, expected_answer: String) -> Result<()> {
        match self.session.current_question.as_mut() {
            Some(q) if q.id == question_id => {
                q.expected_answer = Some(expected_answer);
                Ok(())
            }
            current => Err(SessionError::StaleResponse {
                current: current.map(|q| q.id.clone()).unwrap_or_default(),
                received: question_id.to_string(),
            }),
        }
    }

    // ── Escalation ───────────────────────────────────────────────

    /// Apply a policy-engine status. Terminates when the status says so.
    pub fn apply_warning(&mut self, status: &WarningStatus, now: DateTime<Utc>) -> Option<Entry> {
        if self.session.phase.is_terminal() {
            return None;
        }
        let merged = self.session.warning.merged(status);
        if merged == self.session.warning {
            return None;
        }
        self.session.warning = merged;
        if self.session.warning.is_terminated {
            return self.terminate(now);
        }
        None
    }

    /// Enter `Terminated`. Idempotent; returns `None` when already terminal.
    pub fn terminate(&mut self, now: DateTime<Utc>) -> Option<Entry> {
        if self.session.phase.is_terminal() {
            return None;
        }
        self.session.warning.is_terminated = true;
        self.session.warning.can_continue = false;
        self.session.phase = Phase::Terminated;
        self.session.last_activity = now;
        tracing::warn!(session_id = %self.session.id, "Session terminated");
        Some(Entry::Terminal(Phase::Terminated))
    }

    /// Enter `Completed`. Idempotent; returns `None` when already terminal.
    pub fn complete(&mut self, reason: CompletionReason, now: DateTime<Utc>) -> Option<Entry> {
        if self.session.phase.is_terminal() {
            return None;
        }
        let phase = Phase::Completed(reason);
        self.session.phase = phase;
        self.session.last_activity = now;
        tracing::info!(
            session_id = %self.session.id,
            reason = ?reason,
            "Session completed"
        );
        Some(Entry::Terminal(phase))
    }

    /// Timer check. Completes the session once the countdown hits zero.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<Entry> {
        if !self.session.phase.is_active() {
            return None;
        }
        match &self.session.countdown {
            Some(countdown) if countdown.is_expired(now) => {
                self.complete(CompletionReason::TimeExpired, now)
            }
            _ => None,
        }
    }
}
