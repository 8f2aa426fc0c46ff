//! Warning and termination policy.
//!
//! Escalation inputs:
//! - tab-switch count crossing the warning threshold → one modal per count
//! - tab-switch count crossing the terminate threshold → logged; terminates
//!   only when `enforce_tab_termination` is set
//! - backend content verdicts on submitted answers → warning count bump,
//!   or termination when the backend says so
//!
//! The engine is the only producer of new [`WarningStatus`] values and the
//! only source of termination decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::model::WarningStatus;

/// Content/sentiment verdict the backend attaches to an answer response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentVerdict {
    pub warning_issued: bool,
    pub interview_terminated: bool,
    /// Backend's own count, when it tracks one.
    pub warning_count: Option<u32>,
    pub message: Option<String>,
}

/// What the orchestrator must do after a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Nothing to surface.
    None,
    /// Show the tab-switch warning modal for this count.
    TabWarning { count: u32 },
    /// Apply an escalated status (warning only).
    Warn(WarningStatus),
    /// Apply a terminating status.
    Terminate(WarningStatus),
}

#[derive(Debug)]
pub struct PolicyEngine {
    config: PolicyConfig,
    warning_shown_for_count: Option<u32>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            warning_shown_for_count: None,
        }
    }

    /// Whether the modal was already shown for `count`.
    pub fn warning_shown_for_current_count(&self, count: u32) -> bool {
        self.warning_shown_for_count == Some(count)
    }

    /// Counts at or below `count` were already seen before a reload.
    pub fn restore_guard(&mut self, count: u32) {
        if count >= self.config.tab_warning_threshold {
            self.warning_shown_for_count = Some(count);
        }
    }

    /// Evaluate the current tab-switch count.
    pub fn on_tab_switch_count(
        &mut self,
        count: u32,
        current: &WarningStatus,
        now: DateTime<Utc>,
    ) -> PolicyDecision {
        if current.is_terminated {
            return PolicyDecision::None;
        }

        if count >= self.config.tab_terminate_threshold {
            if self.config.enforce_tab_termination {
                tracing::warn!(count, "Tab-switch terminate threshold reached; terminating");
                return PolicyDecision::Terminate(Self::terminated(current, now));
            }
            tracing::info!(
                count,
                threshold = self.config.tab_terminate_threshold,
                "Tab-switch terminate threshold reached; termination not enforced"
            );
        }

        if count >= self.config.tab_warning_threshold && !self.warning_shown_for_current_count(count)
        {
            self.warning_shown_for_count = Some(count);
            return PolicyDecision::TabWarning { count };
        }
        PolicyDecision::None
    }

    /// Evaluate the backend's verdict on a submitted answer.
    pub fn on_content_verdict(
        &self,
        verdict: &ContentVerdict,
        current: &WarningStatus,
        now: DateTime<Utc>,
    ) -> PolicyDecision {
        if current.is_terminated {
            return PolicyDecision::None;
        }
        if verdict.interview_terminated {
            let mut status = Self::terminated(current, now);
            if verdict.warning_issued {
                status.warning_count = Self::next_count(current, verdict);
            }
            return PolicyDecision::Terminate(status);
        }
        if verdict.warning_issued {
            return PolicyDecision::Warn(WarningStatus {
                warning_count: Self::next_count(current, verdict),
                is_terminated: false,
                can_continue: true,
                last_warning_at: Some(now),
            });
        }
        PolicyDecision::None
    }

    fn next_count(current: &WarningStatus, verdict: &ContentVerdict) -> u32 {
        let bumped = current.warning_count.saturating_add(1);
        verdict.warning_count.map_or(bumped, |remote| remote.max(bumped))
    }

    fn terminated(current: &WarningStatus, now: DateTime<Utc>) -> WarningStatus {
        WarningStatus {
            warning_count: current.warning_count,
            is_terminated: true,
            can_continue: false,
            last_warning_at: Some(now),
        }
    }
}
