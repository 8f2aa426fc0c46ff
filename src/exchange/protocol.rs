//! Wire schema for the interview exchange channel.
//!
//! ```text
//! Session orchestrator ──WebSocket──▸ Interview backend
//!        ◂── questions / verdicts / counters ──◂
//! ```
//!
//! All messages are JSON text frames tagged by `type`. Question audio is
//! base64 inside the JSON payload.

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::channel::{AnswerOutcome, ChannelEvent, QuestionDelivery};
use crate::model::Question;
use crate::policy::ContentVerdict;
use crate::proctoring::{ProctoringCounters, ProctoringSnapshot};

// ── Client → Server ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Ask the backend for the first (or next pending) question.
    #[serde(rename = "request_first_question")]
    RequestFirstQuestion {
        #[serde(rename = "interviewId")]
        interview_id: String,
        #[serde(rename = "interviewType")]
        interview_type: String,
    },

    /// Candidate's answer plus the proctoring metrics at submit time.
    #[serde(rename = "submit_answer")]
    SubmitAnswer {
        #[serde(rename = "interviewId")]
        interview_id: String,
        #[serde(rename = "questionId")]
        question_id: String,
        answer: String,
        proctoring: ProctoringSnapshot,
    },

    #[serde(rename = "update_proctoring")]
    UpdateProctoring {
        #[serde(rename = "interviewId")]
        interview_id: String,
        counters: ProctoringCounters,
    },

    #[serde(rename = "fetch_proctoring")]
    FetchProctoring {
        #[serde(rename = "interviewId")]
        interview_id: String,
    },

    #[serde(rename = "end_interview")]
    EndInterview {
        #[serde(rename = "interviewId")]
        interview_id: String,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestFirstQuestion { .. } => "request_first_question",
            Self::SubmitAnswer { .. } => "submit_answer",
            Self::UpdateProctoring { .. } => "update_proctoring",
            Self::FetchProctoring { .. } => "fetch_proctoring",
            Self::EndInterview { .. } => "end_interview",
        }
    }
}

// ── Server → Client ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "question")]
    Question {
        question: Question,
        #[serde(rename = "questionNumber")]
        question_number: u32,
        /// Base64-encoded spoken prompt.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
    },

    /// Result of a submitted answer. The verdict fields sit at the top
    /// level; a follow-up question may be bundled.
    #[serde(rename = "answer_submitted")]
    AnswerSubmitted {
        #[serde(rename = "questionId")]
        question_id: String,
        #[serde(flatten)]
        verdict: ContentVerdict,
        #[serde(rename = "nextQuestion", default, skip_serializing_if = "Option::is_none")]
        next_question: Option<Question>,
        #[serde(rename = "questionNumber", default, skip_serializing_if = "Option::is_none")]
        question_number: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
    },

    /// Out-of-band warning issued by the backend.
    #[serde(rename = "warning")]
    Warning {
        #[serde(rename = "warningCount")]
        warning_count: u32,
        #[serde(rename = "isTerminated", default)]
        is_terminated: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "interview_complete")]
    InterviewComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "proctoring_counters")]
    ProctoringCounters { counters: ProctoringCounters },

    /// Acknowledges `end_interview`.
    #[serde(rename = "end_ack")]
    EndAck,

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// Convert into the channel-level event, decoding audio payloads.
    pub fn into_event(self) -> ChannelEvent {
        match self {
            Self::Question {
                question,
                question_number,
                audio,
            } => ChannelEvent::QuestionReceived(QuestionDelivery {
                question,
                number: question_number,
                audio: audio.as_deref().and_then(decode_audio),
            }),
            Self::AnswerSubmitted {
                question_id,
                verdict,
                next_question,
                question_number,
                audio,
            } => {
                let next = next_question.map(|question| QuestionDelivery {
                    question,
                    number: question_number.unwrap_or_default(),
                    audio: audio.as_deref().and_then(decode_audio),
                });
                ChannelEvent::AnswerSubmitted(AnswerOutcome {
                    question_id,
                    verdict,
                    next,
                })
            }
            Self::Warning {
                warning_count,
                is_terminated,
                message,
            } => ChannelEvent::WarningIssued(ContentVerdict {
                warning_issued: true,
                interview_terminated: is_terminated,
                warning_count: Some(warning_count),
                message,
            }),
            Self::InterviewComplete { message } => ChannelEvent::InterviewComplete { message },
            Self::ProctoringCounters { counters } => ChannelEvent::ProctoringCounters(counters),
            Self::EndAck => ChannelEvent::EndAcknowledged,
            Self::Error { message } => ChannelEvent::Error { message },
        }
    }
}

/// Parse one text frame. Malformed frames become an error event rather
/// than tearing down the connection.
pub fn parse_server_frame(text: &str) -> ChannelEvent {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => message.into_event(),
        Err(e) => ChannelEvent::Error {
            message: format!("Failed to parse server message: {e}"),
        },
    }
}

fn decode_audio(data: &str) -> Option<Vec<u8>> {
    match base64::engine::general_purpose::STANDARD.decode(data) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping undecodable question audio");
            None
        }
    }
}
