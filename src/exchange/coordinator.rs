//! Question/answer exchange coordinator.
//!
//! Owns the single in-flight slot: at most one question request or answer
//! submission is outstanding per session, and a second request while one
//! is pending is a no-op. The coordinator does not touch session state;
//! it reports what was pending so the orchestrator can react.

use std::sync::Arc;
use std::time::Duration;

use super::channel::ExchangeChannel;
use super::protocol::ClientMessage;
use crate::config::ExchangeConfig;
use crate::error::{Result, SessionError};
use crate::proctoring::{ProctoringCounters, ProctoringSnapshot};

/// The outstanding exchange, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingExchange {
    /// Waiting for connectivity and then for a question.
    Question,
    /// An answer was sent; `text` is kept so a failure can restore it.
    Answer { question_id: String, text: String },
}

pub struct ExchangeCoordinator {
    channel: Arc<dyn ExchangeChannel>,
    config: ExchangeConfig,
    interview_id: String,
    pending: Option<PendingExchange>,
    end_requested: bool,
}

impl std::fmt::Debug for ExchangeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCoordinator")
            .field("interview_id", &self.interview_id)
            .field("pending", &self.pending)
            .field("end_requested", &self.end_requested)
            .finish_non_exhaustive()
    }
}

impl ExchangeCoordinator {
    pub fn new(
        channel: Arc<dyn ExchangeChannel>,
        config: ExchangeConfig,
        interview_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            config,
            interview_id: interview_id.into(),
            pending: None,
            end_requested: false,
        }
    }

    pub fn channel(&self) -> Arc<dyn ExchangeChannel> {
        Arc::clone(&self.channel)
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn pending(&self) -> Option<&PendingExchange> {
        self.pending.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.end_requested
    }

    /// Reserve the slot for a question request. Returns `false` when an
    /// exchange is already in flight or the interview was ended.
    pub fn begin_question_request(&mut self) -> bool {
        if self.end_requested || self.pending.is_some() {
            tracing::debug!(pending = ?self.pending, "Question request ignored; exchange in flight");
            return false;
        }
        self.pending = Some(PendingExchange::Question);
        true
    }

    /// Connectivity is up: issue the reserved question request.
    pub async fn send_question_request(&mut self, interview_type: &str) -> Result<()> {
        if self.pending != Some(PendingExchange::Question) {
            return Ok(());
        }
        let message = ClientMessage::RequestFirstQuestion {
            interview_id: self.interview_id.clone(),
            interview_type: interview_type.to_string(),
        };
        if let Err(e) = self.channel.send(message).await {
            self.pending = None;
            return Err(e);
        }
        tracing::info!(interview_id = %self.interview_id, "Question requested");
        Ok(())
    }

    /// The connectivity wait gave up.
    pub fn connectivity_failed(&mut self) {
        if self.pending == Some(PendingExchange::Question) {
            self.pending = None;
        }
    }

    /// Send an answer. Returns `Ok(false)` without sending when another
    /// exchange is in flight.
    pub async fn submit_answer(
        &mut self,
        question_id: &str,
        text: String,
        metrics: ProctoringSnapshot,
    ) -> Result<bool> {
        if self.end_requested || self.pending.is_some() {
            tracing::debug!(pending = ?self.pending, "Submit ignored; exchange in flight");
            return Ok(false);
        }
        self.pending = Some(PendingExchange::Answer {
            question_id: question_id.to_string(),
            text: text.clone(),
        });
        let message = ClientMessage::SubmitAnswer {
            interview_id: self.interview_id.clone(),
            question_id: question_id.to_string(),
            answer: text,
            proctoring: metrics,
        };
        if let Err(e) = self.channel.send(message).await {
            self.pending = None;
            return Err(e);
        }
        tracing::info!(
            interview_id = %self.interview_id,
            question_id,
            "Answer submitted"
        );
        Ok(true)
    }

    /// A question arrived. Settles a pending question request; an answer
    /// in flight stays pending until its own response.
    pub fn question_delivered(&mut self) {
        if self.pending == Some(PendingExchange::Question) {
            self.pending = None;
        }
    }

    /// An answer response arrived for `question_id`.
    pub fn answer_settled(&mut self, question_id: &str) -> Result<()> {
        match &self.pending {
            Some(PendingExchange::Answer {
                question_id: pending, ..
            }) if pending == question_id => {
                self.pending = None;
                Ok(())
            }
            Some(PendingExchange::Answer {
                question_id: pending, ..
            }) => Err(SessionError::StaleResponse {
                current: pending.clone(),
                received: question_id.to_string(),
            }),
            _ => Err(SessionError::StaleResponse {
                current: String::new(),
                received: question_id.to_string(),
            }),
        }
    }

    /// The channel reported an error or dropped. Releases the slot and
    /// returns what was pending.
    pub fn fail_pending(&mut self) -> Option<PendingExchange> {
        self.pending.take()
    }

    pub async fn update_proctoring_counters(&self, counters: ProctoringCounters) -> Result<()> {
        if !self.channel.is_connected() {
            return Err(SessionError::channel("exchange channel is not connected"));
        }
        self.channel
            .send(ClientMessage::UpdateProctoring {
                interview_id: self.interview_id.clone(),
                counters,
            })
            .await
    }

    /// Ask the backend for its counters; they arrive as a channel event.
    pub async fn fetch_proctoring_counters(&self) -> Result<()> {
        self.channel
            .send(ClientMessage::FetchProctoring {
                interview_id: self.interview_id.clone(),
            })
            .await
    }

    /// Tell the backend the interview is over. Idempotent: only the first
    /// call reaches the channel. Bounded by `end_ack_timeout`; every
    /// failure maps to [`SessionError::RemoteEndFailure`].
    pub async fn end_interview(&mut self) -> Result<()> {
        if self.end_requested {
            return Ok(());
        }
        self.end_requested = true;
        self.pending = None;

        let timeout = self.config.end_ack_timeout();
        match tokio::time::timeout(timeout, self.channel.end_interview(&self.interview_id)).await {
            Ok(Ok(())) => {
                tracing::info!(interview_id = %self.interview_id, "Backend acknowledged interview end");
                Ok(())
            }
            Ok(Err(e)) => Err(SessionError::RemoteEndFailure(e.to_string())),
            Err(_) => Err(SessionError::RemoteEndFailure(format!(
                "no acknowledgment within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

/// Wait for the channel to come up, reconnecting on each attempt.
///
/// `on_connecting` runs once, after the first attempt fails, so the
/// candidate sees a connecting notice.
pub async fn wait_connected(
    channel: Arc<dyn ExchangeChannel>,
    attempts: u32,
    backoff: Duration,
    on_connecting: impl FnOnce() + Send,
) -> Result<()> {
    let mut on_connecting = Some(on_connecting);
    for attempt in 1..=attempts {
        if channel.is_connected() {
            return Ok(());
        }
        if let Err(e) = channel.connect().await {
            tracing::debug!(attempt, error = %e, "Exchange connect attempt failed");
        }
        if channel.is_connected() {
            return Ok(());
        }
        if let Some(notify) = on_connecting.take() {
            notify();
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }
    tracing::warn!(attempts, "Exchange channel unreachable");
    Err(SessionError::Connection { attempts })
}
