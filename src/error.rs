//! Error taxonomy for the session orchestrator.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Device behind a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDevice {
    Microphone,
    Camera,
}

impl std::fmt::Display for MediaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Microphone => f.write_str("microphone"),
            Self::Camera => f.write_str("camera"),
        }
    }
}

/// Every failure the orchestrator can observe.
///
/// Component boundaries turn these into session-visible notices; none of
/// them terminates a session on its own.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Exchange channel unreachable after the bounded connectivity wait.
    #[error("exchange channel unreachable after {attempts} attempts")]
    Connection { attempts: u32 },

    /// Transport-level failure while talking to the exchange channel.
    #[error("exchange channel error: {0}")]
    Channel(String),

    /// The candidate (or platform) refused a media permission.
    #[error("{device} permission denied: {reason}")]
    PermissionDenied { device: MediaDevice, reason: String },

    /// A response referred to a question that is no longer current.
    #[error("stale response for question '{received}' (current: '{current}')")]
    StaleResponse { current: String, received: String },

    /// The remote end-interview call failed or timed out.
    #[error("remote end-interview failed: {0}")]
    RemoteEndFailure(String),

    /// A restored snapshot had no time left.
    #[error("session expired before it could be restored")]
    ExpiredSession,

    /// The session has been terminated; no further exchange is allowed.
    #[error("session is terminated")]
    Terminated,

    /// A command was issued in a phase that does not accept it.
    #[error("cannot {action} while session is {phase}")]
    InvalidPhase { action: &'static str, phase: String },

    /// Submitting an empty answer.
    #[error("answer text is empty")]
    EmptyAnswer,

    /// The caller referenced a question other than the current one.
    #[error("question '{given}' is not the current question ('{current}')")]
    QuestionMismatch { current: String, given: String },

    /// The hint endpoint could not be reached or answered badly.
    #[error("hint request failed: {0}")]
    Hint(String),

    /// Local key-value storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Creates a channel error
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel(message.into())
    }

    /// Creates a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Creates an invalid-phase error
    pub fn invalid_phase(action: &'static str, phase: impl std::fmt::Display) -> Self {
        Self::InvalidPhase {
            action,
            phase: phase.to_string(),
        }
    }

    /// Whether the candidate can keep going (retry, type manually, etc.)
    /// after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Terminated | Self::ExpiredSession)
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
