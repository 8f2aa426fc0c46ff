//! Speech capture lifecycle.
//!
//! ```text
//! Idle ─▸ Initializing ─▸ Listening ⟲ (auto-restart) ─▸ Stopped
//!              │                                          ▲
//!              └──── permission / start failure ──────────┘  (manual entry mode)
//! ```
//!
//! Interim segments only drive the live caption. A final segment carries the
//! recognizer's cumulative transcript and replaces the answer draft. Once
//! [`SpeechCaptureManager::stop`] returns, no further segment is applied even
//! if the recognizer delivers one late.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::SpeechConfig;
use crate::error::Result;
use crate::model::TranscriptSegment;

/// Speech-to-text recognizer collaborator.
#[async_trait]
pub trait SpeechStream: Send + Sync {
    /// Ask for microphone access. User-mediated; may take a while.
    async fn request_permission(&self) -> Result<()>;

    /// Begin recognition.
    async fn start(&self) -> Result<()>;

    /// Stop recognition. Must not block.
    fn stop(&self);

    /// Drop the recognizer's accumulated transcript.
    fn reset(&self);

    /// Restart after the recognizer ended on its own.
    async fn retry(&self) -> Result<()>;
}

/// Lifecycle state of the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Initializing,
    Listening,
    Stopped,
}

/// Effect of one transcript segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Arrived while stopped; dropped.
    Ignored,
    /// Interim text; caption updated.
    Caption,
    /// Final text; replaces the answer draft.
    FinalTranscript(String),
}

pub struct SpeechCaptureManager {
    stream: Arc<dyn SpeechStream>,
    config: SpeechConfig,
    state: CaptureState,
    disabled: bool,
    caption: Option<String>,
    caption_deadline: Option<Instant>,
    manual_only: bool,
    permission_notice_shown: bool,
}

impl std::fmt::Debug for SpeechCaptureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechCaptureManager")
            .field("state", &self.state)
            .field("disabled", &self.disabled)
            .field("manual_only", &self.manual_only)
            .finish_non_exhaustive()
    }
}

impl SpeechCaptureManager {
    pub fn new(stream: Arc<dyn SpeechStream>, config: SpeechConfig) -> Self {
        Self {
            stream,
            config,
            state: CaptureState::Idle,
            disabled: true,
            caption: None,
            caption_deadline: None,
            manual_only: false,
            permission_notice_shown: false,
        }
    }

    pub fn stream(&self) -> Arc<dyn SpeechStream> {
        Arc::clone(&self.stream)
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_listening(&self) -> bool {
        self.state == CaptureState::Listening
    }

    /// Speech failed to start at some point; the candidate types instead.
    pub fn is_manual_only(&self) -> bool {
        self.manual_only
    }

    /// Start capture after a permission grant.
    ///
    /// On failure the manager ends in `Stopped` with manual entry enabled;
    /// the error is returned for the caller to surface.
    pub async fn start(&mut self) -> Result<CaptureState> {
        if !self.begin_start() {
            return Ok(self.state);
        }
        let permission = self.stream.request_permission().await;
        self.complete_start(permission).await
    }

    /// First half of [`start`](Self::start): enter `Initializing`. Returns
    /// `false` when capture is already starting or running.
    ///
    /// The caller then obtains the permission through
    /// [`SpeechStream::request_permission`] (possibly on another task) and
    /// hands the outcome to [`complete_start`](Self::complete_start).
    pub fn begin_start(&mut self) -> bool {
        if matches!(self.state, CaptureState::Listening | CaptureState::Initializing) {
            return false;
        }
        self.state = CaptureState::Initializing;
        self.disabled = false;
        true
    }

    /// Second half of [`start`](Self::start).
    pub async fn complete_start(&mut self, permission: Result<()>) -> Result<CaptureState> {
        if self.state != CaptureState::Initializing {
            // stop() ran while the prompt was open.
            return Ok(self.state);
        }
        let started = match permission {
            Ok(()) => self.stream.start().await,
            Err(e) => Err(e),
        };

        match started {
            Ok(()) => {
                // stop() may have run while the permission prompt was open.
                if self.disabled {
                    self.stream.stop();
                    self.state = CaptureState::Stopped;
                } else {
                    self.state = CaptureState::Listening;
                    self.manual_only = false;
                    tracing::info!("Speech capture listening");
                }
                Ok(self.state)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Speech capture unavailable; falling back to manual entry");
                self.disabled = true;
                self.state = CaptureState::Stopped;
                self.manual_only = true;
                Err(e)
            }
        }
    }

    /// Stop capture. Synchronous: any segment delivered after this call is
    /// dropped.
    pub fn stop(&mut self) {
        self.disabled = true;
        if matches!(self.state, CaptureState::Listening | CaptureState::Initializing) {
            self.stream.stop();
            tracing::debug!("Speech capture stopped");
        }
        if self.state != CaptureState::Idle {
            self.state = CaptureState::Stopped;
        }
        self.caption = None;
        self.caption_deadline = None;
    }

    /// Clear the recognizer's running transcript (new question).
    pub fn reset_transcript(&mut self) {
        self.stream.reset();
        self.caption = None;
        self.caption_deadline = None;
    }

    /// Apply one recognizer segment.
    pub fn on_segment(&mut self, segment: TranscriptSegment, now: Instant) -> SegmentOutcome {
        if self.disabled || self.state != CaptureState::Listening {
            tracing::trace!(is_final = segment.is_final, "Dropping transcript after stop");
            return SegmentOutcome::Ignored;
        }
        if segment.is_final {
            self.caption = None;
            self.caption_deadline = None;
            SegmentOutcome::FinalTranscript(segment.text)
        } else {
            self.caption = Some(segment.text);
            self.caption_deadline = Some(now + self.config.caption_hide());
            SegmentOutcome::Caption
        }
    }

    /// The recognizer reported a listening-state change. Returns `true`
    /// when it ended on its own and should be restarted.
    pub fn on_listening_changed(&mut self, listening: bool) -> bool {
        !listening && self.state == CaptureState::Listening && !self.disabled && self.config.auto_restart
    }

    /// Restart after an unexpected end.
    pub async fn restart(&mut self) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        tracing::debug!("Restarting speech recognizer");
        if let Err(e) = self.stream.retry().await {
            tracing::warn!(error = %e, "Speech recognizer restart failed");
            self.stop();
            self.manual_only = true;
            return Err(e);
        }
        Ok(())
    }

    /// Live caption, hidden after a short silence.
    pub fn caption(&self, now: Instant) -> Option<&str> {
        match self.caption_deadline {
            Some(deadline) if deadline > now => self.caption.as_deref(),
            _ => None,
        }
    }

    /// Drop an expired caption. Returns `true` if one was hidden.
    pub fn expire_caption(&mut self, now: Instant) -> bool {
        match self.caption_deadline {
            Some(deadline) if deadline <= now => {
                self.caption = None;
                self.caption_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Returns `true` the first time only, so the permission notice is
    /// shown once.
    pub fn take_permission_notice(&mut self) -> bool {
        !std::mem::replace(&mut self.permission_notice_shown, true)
    }
}
