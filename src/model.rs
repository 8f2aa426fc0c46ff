//! Session data model: questions, drafts, transcripts, violations and
//! escalation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Question ─────────────────────────────────────────────────────

/// Difficulty label attached to a question by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

/// A question delivered over the exchange channel. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    /// Filled in only by an explicit hint fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_answer: Option<String>,
}

impl Question {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            category: String::new(),
            difficulty: Difficulty::default(),
            expected_answer: None,
        }
    }
}

// ── Answer draft ─────────────────────────────────────────────────

/// Where the current draft text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DraftSource {
    #[default]
    Manual,
    Transcript,
}

/// Mutable answer buffer bound to one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnswerDraft {
    /// Id of the question this draft answers; empty before the first question.
    pub question_id: String,
    pub text: String,
    pub source: DraftSource,
}

impl AnswerDraft {
    pub fn for_question(question_id: impl Into<String>) -> Self {
        Self {
            question_id: question_id.into(),
            ..Self::default()
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

// ── Transcript ───────────────────────────────────────────────────

/// One recognizer result. Interim segments are display-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptSegment {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

// ── Chat history ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Interviewer,
    Candidate,
    System,
}

/// One entry in the conversation log shown to the candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            question_id: None,
            at,
        }
    }

    pub fn with_question(mut self, question_id: impl Into<String>) -> Self {
        self.question_id = Some(question_id.into());
        self
    }
}

// ── Violations ───────────────────────────────────────────────────

/// Category of proctoring anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    TabSwitch,
    CopyPaste,
    MultiplePerson,
    DeviceDetected,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TabSwitch => "tab-switch",
            Self::CopyPaste => "copy-paste",
            Self::MultiplePerson => "multiple-person",
            Self::DeviceDetected => "device-detected",
        }
    }
}

/// An appended violation. `count` is the running counter for `kind` after
/// this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub timestamp: DateTime<Utc>,
    pub count: u32,
}

// ── Warning status ───────────────────────────────────────────────

/// Escalation state. Only the policy engine produces new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningStatus {
    pub warning_count: u32,
    pub is_terminated: bool,
    pub can_continue: bool,
    #[serde(default)]
    pub last_warning_at: Option<DateTime<Utc>>,
}

impl Default for WarningStatus {
    fn default() -> Self {
        Self {
            warning_count: 0,
            is_terminated: false,
            can_continue: true,
            last_warning_at: None,
        }
    }
}

impl WarningStatus {
    /// Merge a newer status without ever lowering the count or clearing
    /// termination.
    pub fn merged(&self, next: &WarningStatus) -> WarningStatus {
        let is_terminated = self.is_terminated || next.is_terminated;
        WarningStatus {
            warning_count: self.warning_count.max(next.warning_count),
            is_terminated,
            can_continue: !is_terminated && next.can_continue,
            last_warning_at: match (self.last_warning_at, next.last_warning_at) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

// ── Exit reason ──────────────────────────────────────────────────

/// Why the session ended, as consumed by the UI shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitReason {
    Completed,
    Terminated,
    Expired,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Expired => "expired",
        }
    }
}
