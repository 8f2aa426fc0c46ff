//! Session orchestrator configuration.
//!
//! Loaded from TOML; every section and field has a default so an empty file
//! (or no file) yields a working configuration.

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name looked up under the platform config directory.
const CONFIG_FILE_NAME: &str = "session.toml";

/// Longest accepted interview.
const MAX_DURATION_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionConfig {
    pub interview: InterviewConfig,
    pub exchange: ExchangeConfig,
    pub policy: PolicyConfig,
    pub proctoring: ProctoringConfig,
    pub speech: SpeechConfig,
    pub hint: HintConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

/// Interview budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct InterviewConfig {
    /// Free-form interview type label (e.g. "technical", "behavioral").
    pub interview_type: String,
    /// Total time budget in seconds.
    pub duration_secs: u64,
    /// Maximum number of questions before the session completes.
    pub max_questions: u32,
}

impl Default for InterviewConfig {
    fn default() -> Self {
        Self {
            interview_type: "technical".to_string(),
            duration_secs: 30 * 60,
            max_questions: 10,
        }
    }
}

/// Duplex exchange channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ExchangeConfig {
    /// WebSocket endpoint of the interview backend.
    pub ws_url: Option<String>,
    /// Connectivity polls before a question request fails.
    pub connect_attempts: u32,
    /// Delay between connectivity polls, in milliseconds.
    pub connect_backoff_ms: u64,
    /// Upper bound on waiting for the end-interview acknowledgment.
    pub end_ack_timeout_ms: u64,
    /// Buffer size of the inbound/outbound message channels.
    pub channel_capacity: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            connect_attempts: 10,
            connect_backoff_ms: 500,
            end_ack_timeout_ms: 5_000,
            channel_capacity: 256,
        }
    }
}

impl ExchangeConfig {
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn end_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.end_ack_timeout_ms)
    }
}

/// Warning and termination thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PolicyConfig {
    /// Tab-switch count at which the candidate is warned.
    pub tab_warning_threshold: u32,
    /// Tab-switch count at which termination would apply.
    pub tab_terminate_threshold: u32,
    /// When false, reaching `tab_terminate_threshold` is only logged.
    pub enforce_tab_termination: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            tab_warning_threshold: 1,
            tab_terminate_threshold: 3,
            enforce_tab_termination: false,
        }
    }
}

/// Proctoring aggregation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProctoringConfig {
    /// Most recent violation records kept in memory and in snapshots.
    pub violation_log_limit: usize,
    /// Debounce before counters are pushed to the backend, in milliseconds.
    pub remote_sync_debounce_ms: u64,
}

impl Default for ProctoringConfig {
    fn default() -> Self {
        Self {
            violation_log_limit: 100,
            remote_sync_debounce_ms: 2_000,
        }
    }
}

impl ProctoringConfig {
    pub fn remote_sync_debounce(&self) -> Duration {
        Duration::from_millis(self.remote_sync_debounce_ms)
    }
}

/// Speech capture settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SpeechConfig {
    /// Silence after which the live caption is hidden, in milliseconds.
    pub caption_hide_ms: u64,
    /// Restart the recognizer when it stops on its own while listening.
    pub auto_restart: bool,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            caption_hide_ms: 2_000,
            auto_restart: true,
        }
    }
}

impl SpeechConfig {
    pub fn caption_hide(&self) -> Duration {
        Duration::from_millis(self.caption_hide_ms)
    }
}

/// Hint endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HintConfig {
    /// Base URL of the interview REST API; hints are disabled when unset.
    pub base_url: Option<String>,
    /// Request timeout, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 10_000,
        }
    }
}

impl HintConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Snapshot persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Debounce between a state change and the snapshot write, in milliseconds.
    pub snapshot_debounce_ms: u64,
    /// SQLite database for snapshots; in-memory storage when unset.
    pub db_path: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_debounce_ms: 1_000,
            db_path: None,
        }
    }
}

impl PersistenceConfig {
    pub fn snapshot_debounce(&self) -> Duration {
        Duration::from_millis(self.snapshot_debounce_ms)
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit ANSI colors.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl SessionConfig {
    /// Default config file location (`<config dir>/session.toml`).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "mock-interview", "interview-session")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse session config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session config: {}", path.display()))?;
        Self::from_toml(&text)
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Reject values that would make the orchestrator hang or spin.
    pub fn validate(&self) -> Result<()> {
        if self.interview.duration_secs == 0 {
            anyhow::bail!("interview.duration_secs must be greater than zero");
        }
        if self.interview.duration_secs > MAX_DURATION_SECS {
            anyhow::bail!(
                "interview.duration_secs must be at most {MAX_DURATION_SECS} (24 hours)"
            );
        }
        if self.interview.max_questions == 0 {
            anyhow::bail!("interview.max_questions must be greater than zero");
        }
        if self.exchange.connect_attempts == 0 {
            anyhow::bail!("exchange.connect_attempts must be greater than zero");
        }
        if self.exchange.channel_capacity == 0 {
            anyhow::bail!("exchange.channel_capacity must be greater than zero");
        }
        if self.proctoring.violation_log_limit == 0 {
            anyhow::bail!("proctoring.violation_log_limit must be greater than zero");
        }
        if self.policy.tab_warning_threshold == 0 {
            anyhow::bail!("policy.tab_warning_threshold must be greater than zero");
        }
        Ok(())
    }

    /// JSON schema of the config file, for editors and docs.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(SessionConfig)).unwrap_or_default()
    }
}
