//! Proctoring signal aggregation.
//!
//! Folds visibility changes, clipboard events and computer-vision samples
//! into running counters and a bounded violation log. The aggregator only
//! counts; deciding what a count means is the policy engine's job.

pub mod sync;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::model::{ViolationKind, ViolationRecord};

pub use sync::RemoteCounterSync;

/// One computer-vision sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualSample {
    pub people_count: u32,
    pub device_count: u32,
}

impl VisualSample {
    pub fn is_violation(&self) -> bool {
        self.people_count > 1 || self.device_count > 0
    }
}

/// Running counters, mirrored to the backend and into snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProctoringCounters {
    pub tab_switches: u32,
    pub copy_paste: u32,
    pub multiple_person: u32,
    pub device_detected: u32,
    /// Sticky: once set for a session it never clears.
    pub cheating_detected: bool,
}

impl ProctoringCounters {
    /// Per-field maximum; counters never move backwards.
    pub fn merged(&self, other: &ProctoringCounters) -> ProctoringCounters {
        ProctoringCounters {
            tab_switches: self.tab_switches.max(other.tab_switches),
            copy_paste: self.copy_paste.max(other.copy_paste),
            multiple_person: self.multiple_person.max(other.multiple_person),
            device_detected: self.device_detected.max(other.device_detected),
            cheating_detected: self.cheating_detected || other.cheating_detected,
        }
    }

    pub fn count_for(&self, kind: ViolationKind) -> u32 {
        match kind {
            ViolationKind::TabSwitch => self.tab_switches,
            ViolationKind::CopyPaste => self.copy_paste,
            ViolationKind::MultiplePerson => self.multiple_person,
            ViolationKind::DeviceDetected => self.device_detected,
        }
    }

    fn bump(&mut self, kind: ViolationKind) -> u32 {
        let slot = match kind {
            ViolationKind::TabSwitch => &mut self.tab_switches,
            ViolationKind::CopyPaste => &mut self.copy_paste,
            ViolationKind::MultiplePerson => &mut self.multiple_person,
            ViolationKind::DeviceDetected => &mut self.device_detected,
        };
        *slot = slot.saturating_add(1);
        *slot
    }
}

/// Metrics attached to every answer submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctoringSnapshot {
    pub counters: ProctoringCounters,
    pub last_sample: Option<VisualSample>,
}

/// Consumes proctoring signals while armed.
#[derive(Debug)]
pub struct ProctoringAggregator {
    counters: ProctoringCounters,
    violations: VecDeque<ViolationRecord>,
    log_limit: usize,
    armed: bool,
    hidden: bool,
    last_sample: Option<VisualSample>,
}

impl ProctoringAggregator {
    pub fn new(log_limit: usize) -> Self {
        Self {
            counters: ProctoringCounters::default(),
            violations: VecDeque::new(),
            log_limit: log_limit.max(1),
            armed: false,
            hidden: false,
            last_sample: None,
        }
    }

    /// Start counting. Signals before this are ignored.
    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// Stop counting (session ended).
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn counters(&self) -> ProctoringCounters {
        self.counters
    }

    pub fn violations(&self) -> impl Iterator<Item = &ViolationRecord> {
        self.violations.iter()
    }

    pub fn snapshot(&self) -> ProctoringSnapshot {
        ProctoringSnapshot {
            counters: self.counters,
            last_sample: self.last_sample,
        }
    }

    /// Visibility change. Only a visible → hidden transition counts as a
    /// tab switch; repeated hidden events do not.
    pub fn record_visibility(&mut self, hidden: bool, at: DateTime<Utc>) -> Option<ViolationRecord> {
        let was_hidden = std::mem::replace(&mut self.hidden, hidden);
        if !self.armed || !hidden || was_hidden {
            return None;
        }
        Some(self.record(ViolationKind::TabSwitch, at))
    }

    /// Copy, cut or paste detected in the answer area.
    pub fn record_clipboard(&mut self, at: DateTime<Utc>) -> Option<ViolationRecord> {
        if !self.armed {
            return None;
        }
        Some(self.record(ViolationKind::CopyPaste, at))
    }

    /// Classify a vision sample. Extra people and visible devices are each
    /// recorded; a clean sample changes nothing (the cheating flag stays).
    pub fn ingest_sample(&mut self, sample: VisualSample, at: DateTime<Utc>) -> Vec<ViolationRecord> {
        if !self.armed {
            return Vec::new();
        }
        self.last_sample = Some(sample);
        let mut records = Vec::new();
        if sample.people_count > 1 {
            records.push(self.record(ViolationKind::MultiplePerson, at));
        }
        if sample.device_count > 0 {
            records.push(self.record(ViolationKind::DeviceDetected, at));
        }
        if sample.is_violation() && !self.counters.cheating_detected {
            self.counters.cheating_detected = true;
            tracing::warn!(
                people = sample.people_count,
                devices = sample.device_count,
                "Cheating detected by visual proctoring"
            );
        }
        records
    }

    /// Seed from a snapshot or a backend fetch. Counters merge by maximum.
    pub fn restore(&mut self, counters: ProctoringCounters, violations: &[ViolationRecord]) {
        self.counters = self.counters.merged(&counters);
        for record in violations {
            self.push_violation(record.clone());
        }
    }

    /// Merge counters fetched from the backend.
    pub fn merge_remote(&mut self, remote: &ProctoringCounters) -> bool {
        let merged = self.counters.merged(remote);
        let changed = merged != self.counters;
        self.counters = merged;
        changed
    }

    fn record(&mut self, kind: ViolationKind, at: DateTime<Utc>) -> ViolationRecord {
        let count = self.counters.bump(kind);
        let record = ViolationRecord {
            kind,
            timestamp: at,
            count,
        };
        tracing::info!(kind = kind.as_str(), count, "Proctoring violation recorded");
        self.push_violation(record.clone());
        record
    }

    fn push_violation(&mut self, record: ViolationRecord) {
        if self.violations.len() == self.log_limit {
            self.violations.pop_front();
        }
        self.violations.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 8, 30, 0).unwrap()
    }

    fn armed() -> ProctoringAggregator {
        let mut agg = ProctoringAggregator::new(100);
        agg.arm();
        agg
    }

    #[test]
    fn only_hidden_transitions_count() {
        let mut agg = armed();
        assert!(agg.record_visibility(true, at()).is_some());
        assert!(agg.record_visibility(true, at()).is_none());
        assert!(agg.record_visibility(false, at()).is_none());
        let second = agg.record_visibility(true, at()).unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(agg.counters().tab_switches, 2);
    }

    #[test]
    fn disarmed_aggregator_ignores_signals() {
        let mut agg = ProctoringAggregator::new(100);
        assert!(agg.record_visibility(true, at()).is_none());
        assert!(agg.record_clipboard(at()).is_none());
        assert!(agg
            .ingest_sample(
                VisualSample {
                    people_count: 3,
                    device_count: 1
                },
                at()
            )
            .is_empty());
        assert_eq!(agg.counters(), ProctoringCounters::default());
    }

    #[test]
    fn cheating_flag_is_sticky() {
        let mut agg = armed();
        let records = agg.ingest_sample(
            VisualSample {
                people_count: 2,
                device_count: 1,
            },
            at(),
        );
        assert_eq!(records.len(), 2);
        assert!(agg.counters().cheating_detected);

        let clean = agg.ingest_sample(
            VisualSample {
                people_count: 1,
                device_count: 0,
            },
            at(),
        );
        assert!(clean.is_empty());
        assert!(agg.counters().cheating_detected);
        assert_eq!(agg.counters().multiple_person, 1);
        assert_eq!(agg.counters().device_detected, 1);
    }

    #[test]
    fn violation_log_is_bounded() {
        let mut agg = ProctoringAggregator::new(100);
        agg.arm();
        for _ in 0..150 {
            agg.ingest_sample(
                VisualSample {
                    people_count: 2,
                    device_count: 0,
                },
                at(),
            );
        }
        assert_eq!(agg.violations().count(), 100);
        assert_eq!(agg.violations().next().unwrap().count, 51);
        assert_eq!(agg.counters().multiple_person, 150);
    }

    #[test]
    fn remote_merge_never_lowers_counters() {
        let mut agg = armed();
        agg.record_clipboard(at());
        agg.record_clipboard(at());

        let remote = ProctoringCounters {
            copy_paste: 1,
            tab_switches: 4,
            ..ProctoringCounters::default()
        };
        assert!(agg.merge_remote(&remote));
        assert_eq!(agg.counters().copy_paste, 2);
        assert_eq!(agg.counters().tab_switches, 4);
        assert!(!agg.merge_remote(&remote));
    }

    #[test]
    fn counters_serialize_camel_case() {
        let json = serde_json::to_string(&ProctoringCounters::default()).unwrap();
        assert!(json.contains("tabSwitches"));
        assert!(json.contains("cheatingDetected"));
    }
}
