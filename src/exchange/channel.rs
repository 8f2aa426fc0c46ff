//! Duplex exchange channel seam.

use async_trait::async_trait;

use super::protocol::ClientMessage;
use crate::error::Result;
use crate::model::Question;
use crate::policy::ContentVerdict;
use crate::proctoring::ProctoringCounters;

/// A question as delivered by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionDelivery {
    pub question: Question,
    pub number: u32,
    /// Decoded spoken prompt, if the backend sent one.
    pub audio: Option<Vec<u8>>,
}

/// Backend response to a submitted answer.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerOutcome {
    pub question_id: String,
    pub verdict: ContentVerdict,
    /// Follow-up question bundled in the same response.
    pub next: Option<QuestionDelivery>,
}

/// Inbound events, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { reason: String },
    QuestionReceived(QuestionDelivery),
    AnswerSubmitted(AnswerOutcome),
    WarningIssued(ContentVerdict),
    InterviewComplete { message: Option<String> },
    ProctoringCounters(ProctoringCounters),
    EndAcknowledged,
    Error { message: String },
}

/// Transport to the interview backend.
///
/// Implementations deliver inbound traffic as [`ChannelEvent`]s on the
/// receiver handed out at construction.
#[async_trait]
pub trait ExchangeChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Open (or re-open) the connection.
    async fn connect(&self) -> Result<()>;

    /// Queue one outbound message.
    async fn send(&self, message: ClientMessage) -> Result<()>;

    /// Send `end_interview` and resolve once the backend acknowledges it.
    /// Callers bound this with their own timeout.
    async fn end_interview(&self, interview_id: &str) -> Result<()>;
}
