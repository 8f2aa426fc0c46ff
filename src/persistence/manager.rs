//! Snapshot scheduling, recovery and one-time flags.
//!
//! Keys, per session id:
//!
//! | key suffix   | lifecycle |
//! |--------------|-----------|
//! | `snapshot`   | debounced + page-hide writes; cleared on session end |
//! | `warning`    | written immediately on every warning change; cleared on session end |
//! | `terminated` | sticky; never cleared |
//! | `result`     | final snapshot archived on session end |
//!
//! plus one global flag recording that the risk notice was acknowledged.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::snapshot::PersistedSnapshot;
use super::store::KeyValueStore;
use crate::error::Result;
use crate::model::WarningStatus;

const KEY_PREFIX: &str = "interview-session";
const NOTICE_ACKNOWLEDGED_KEY: &str = "interview-session:risk-notice-acknowledged";

/// Outcome of looking for a previous run on load.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Nothing to restore.
    Fresh,
    /// Resume with this much time left.
    Resume {
        snapshot: Box<PersistedSnapshot>,
        remaining_secs: i64,
    },
    /// A snapshot exists but its time ran out.
    Expired { snapshot: Box<PersistedSnapshot> },
    /// The session was terminated earlier; do not re-enter it.
    Terminated,
}

pub struct PersistenceManager {
    store: Arc<dyn KeyValueStore>,
    session_id: String,
    debounce: Duration,
    due_at: Option<Instant>,
    last_warning: Option<WarningStatus>,
    finalized: bool,
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("session_id", &self.session_id)
            .field("due_at", &self.due_at)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl PersistenceManager {
    pub fn new(store: Arc<dyn KeyValueStore>, session_id: impl Into<String>, debounce: Duration) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            debounce,
            due_at: None,
            last_warning: None,
            finalized: false,
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{KEY_PREFIX}:{}:{suffix}", self.session_id)
    }

    // ── Recovery ─────────────────────────────────────────────────

    /// Decide how a freshly loaded session should start.
    pub fn recover(&mut self, now: DateTime<Utc>) -> Result<Recovery> {
        if self.store.get(&self.key("terminated"))?.is_some() {
            tracing::info!(session_id = %self.session_id, "Terminated marker found; skipping restore");
            return Ok(Recovery::Terminated);
        }

        let mirrored = self.load_warning()?;
        if mirrored.as_ref().is_some_and(|w| w.is_terminated) {
            tracing::info!(session_id = %self.session_id, "Mirrored warning status is terminal");
            return Ok(Recovery::Terminated);
        }

        let Some(raw) = self.store.get(&self.key("snapshot"))? else {
            return Ok(Recovery::Fresh);
        };
        let mut snapshot: PersistedSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Discarding unreadable snapshot");
                self.store.remove(&self.key("snapshot"))?;
                return Ok(Recovery::Fresh);
            }
        };
        if !snapshot.is_started {
            return Ok(Recovery::Fresh);
        }
        if let Some(mirrored) = mirrored {
            snapshot.warning_status = snapshot.warning_status.merged(&mirrored);
        }
        self.last_warning = Some(snapshot.warning_status.clone());

        let remaining_secs = snapshot.remaining_at(now);
        if remaining_secs > 0 {
            Ok(Recovery::Resume {
                snapshot: Box::new(snapshot),
                remaining_secs,
            })
        } else {
            tracing::info!(
                session_id = %self.session_id,
                remaining_secs,
                "Snapshot expired before reload"
            );
            Ok(Recovery::Expired {
                snapshot: Box::new(snapshot),
            })
        }
    }

    fn load_warning(&self) -> Result<Option<WarningStatus>> {
        match self.store.get(&self.key("warning"))? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Something snapshotted changed; (re)arm the debounce.
    pub fn mark_dirty(&mut self, now: Instant) {
        if !self.finalized {
            self.due_at = Some(now + self.debounce);
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.due_at.is_some_and(|due| due <= now)
    }

    pub fn is_pending(&self) -> bool {
        self.due_at.is_some()
    }

    /// Write the snapshot now. No-op once the session was finalized.
    pub fn write_snapshot(&mut self, snapshot: &PersistedSnapshot) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.due_at = None;
        let json = serde_json::to_string(snapshot)?;
        self.store.set(&self.key("snapshot"), &json)?;
        self.mirror_warning(&snapshot.warning_status)?;
        tracing::trace!(session_id = %self.session_id, "Snapshot written");
        Ok(())
    }

    /// Mirror the warning status immediately, outside the debounce.
    pub fn mirror_warning(&mut self, status: &WarningStatus) -> Result<()> {
        if self.finalized || self.last_warning.as_ref() == Some(status) {
            return Ok(());
        }
        let json = serde_json::to_string(status)?;
        self.store.set(&self.key("warning"), &json)?;
        self.last_warning = Some(status.clone());
        tracing::debug!(
            session_id = %self.session_id,
            warning_count = status.warning_count,
            is_terminated = status.is_terminated,
            "Warning status mirrored"
        );
        Ok(())
    }

    /// Sticky marker consulted before any restore.
    pub fn mark_terminated(&self, now: DateTime<Utc>) -> Result<()> {
        self.store
            .set(&self.key("terminated"), &now.to_rfc3339())
    }

    /// Keep the final state for the result screen.
    pub fn archive_result(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.store.set(&self.key("result"), &json)
    }

    pub fn load_result(&self) -> Result<Option<PersistedSnapshot>> {
        match self.store.get(&self.key("result"))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drop the live markers and stop accepting snapshot writes.
    pub fn clear_markers(&mut self) -> Result<()> {
        self.finalized = true;
        self.due_at = None;
        self.store.remove(&self.key("snapshot"))?;
        self.store.remove(&self.key("warning"))?;
        tracing::debug!(session_id = %self.session_id, "Session markers cleared");
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    // ── One-time flags ───────────────────────────────────────────

    pub fn notice_acknowledged(&self) -> Result<bool> {
        Ok(self.store.get(NOTICE_ACKNOWLEDGED_KEY)?.is_some())
    }

    /// Set once; never cleared.
    pub fn acknowledge_notice(&self) -> Result<()> {
        self.store.set(NOTICE_ACKNOWLEDGED_KEY, "true")
    }
}
