use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AnswerDraft, ChatMessage, Question, ViolationRecord, WarningStatus};
use crate::proctoring::ProctoringCounters;
use crate::session::Session;

/// Serialized projection of a session, written for reload recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub interview_id: String,
    pub interview_type: String,
    pub is_started: bool,
    pub start_time: DateTime<Utc>,
    pub duration_secs: u64,
    pub remaining_seconds: i64,
    #[serde(default)]
    pub current_question: Option<Question>,
    #[serde(default)]
    pub question_number: u32,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub answer_draft: AnswerDraft,
    #[serde(default)]
    pub warning_status: WarningStatus,
    #[serde(default)]
    pub tab_switch_count: u32,
    #[serde(default)]
    pub proctoring_counters: ProctoringCounters,
    #[serde(default)]
    pub violations: Vec<ViolationRecord>,
    pub written_at: DateTime<Utc>,
}

impl PersistedSnapshot {
    pub fn capture(
        session: &Session,
        counters: ProctoringCounters,
        violations: Vec<ViolationRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            interview_id: session.id.clone(),
            interview_type: session.interview_type.clone(),
            is_started: session.started_at.is_some(),
            start_time: session.started_at.unwrap_or(now),
            duration_secs: session.duration_secs,
            remaining_seconds: session.remaining_secs(now),
            current_question: session.current_question.clone(),
            question_number: session.question_number,
            chat_history: session.chat_history.clone(),
            answer_draft: session.draft.clone(),
            warning_status: session.warning.clone(),
            tab_switch_count: counters.tab_switches,
            proctoring_counters: counters,
            violations,
            written_at: now,
        }
    }

    /// Seconds left at `now`.
    ///
    /// The stored remaining value, aged by the time since the write, must
    /// agree with the absolute deadline (`start_time + duration`); the
    /// smaller of the two wins.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> i64 {
        let since_write = (now - self.written_at).num_seconds().max(0);
        let by_snapshot = self.remaining_seconds.saturating_sub(since_write);

        let duration = i64::try_from(self.duration_secs).unwrap_or(i64::MAX);
        let since_start = (now - self.start_time).num_seconds();
        let by_deadline = duration.saturating_sub(since_start);

        by_snapshot.min(by_deadline)
    }
}
