//! Debounced push of proctoring counters to the backend.
//!
//! While counters are being fetched from the backend the push is held back;
//! otherwise a push scheduled before the fetch could overwrite the fresh
//! remote values with stale local ones.

use std::time::Duration;
use tokio::time::Instant;

use super::ProctoringCounters;

#[derive(Debug)]
pub struct RemoteCounterSync {
    debounce: Duration,
    due_at: Option<Instant>,
    loading_from_backend: bool,
    last_pushed: Option<ProctoringCounters>,
}

impl RemoteCounterSync {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            due_at: None,
            loading_from_backend: false,
            last_pushed: None,
        }
    }

    /// Counters changed; (re)arm the debounce.
    pub fn mark_dirty(&mut self, now: Instant) {
        self.due_at = Some(now + self.debounce);
    }

    /// A backend fetch is about to run.
    pub fn begin_remote_load(&mut self) {
        self.loading_from_backend = true;
    }

    /// The fetch finished (or failed). Fetched values count as already
    /// pushed so they are not echoed back unchanged.
    pub fn finish_remote_load(&mut self, fetched: Option<ProctoringCounters>) {
        self.loading_from_backend = false;
        if let Some(counters) = fetched {
            self.last_pushed = Some(counters);
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading_from_backend
    }

    pub fn is_pending(&self) -> bool {
        self.due_at.is_some()
    }

    /// Counters to push now, if the debounce elapsed and nothing is loading.
    pub fn take_due(&mut self, now: Instant, counters: ProctoringCounters) -> Option<ProctoringCounters> {
        if self.loading_from_backend {
            tracing::debug!("Skipping proctoring sync while loading from backend");
            return None;
        }
        match self.due_at {
            Some(due) if due <= now => {
                self.due_at = None;
                if self.last_pushed == Some(counters) {
                    return None;
                }
                self.last_pushed = Some(counters);
                Some(counters)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(tabs: u32) -> ProctoringCounters {
        ProctoringCounters {
            tab_switches: tabs,
            ..ProctoringCounters::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn push_waits_for_debounce() {
        let mut sync = RemoteCounterSync::new(Duration::from_secs(2));
        let start = Instant::now();
        sync.mark_dirty(start);

        assert!(sync.take_due(start + Duration::from_secs(1), counters(1)).is_none());
        assert_eq!(
            sync.take_due(start + Duration::from_secs(2), counters(1)),
            Some(counters(1))
        );
        assert!(!sync.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn push_is_held_while_loading() {
        let mut sync = RemoteCounterSync::new(Duration::from_millis(500));
        let start = Instant::now();
        sync.mark_dirty(start);
        sync.begin_remote_load();

        let later = start + Duration::from_secs(5);
        assert!(sync.take_due(later, counters(1)).is_none());
        assert!(sync.is_pending());

        sync.finish_remote_load(Some(counters(3)));
        assert_eq!(sync.take_due(later, counters(3)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn held_push_fires_after_load_with_merged_values() {
        let mut sync = RemoteCounterSync::new(Duration::from_millis(500));
        let start = Instant::now();
        sync.mark_dirty(start);
        sync.begin_remote_load();
        sync.finish_remote_load(Some(counters(2)));

        let later = start + Duration::from_secs(1);
        assert_eq!(sync.take_due(later, counters(4)), Some(counters(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn local_counts_above_fetched_values_are_pushed() {
        let mut sync = RemoteCounterSync::new(Duration::from_millis(500));
        let start = Instant::now();
        sync.mark_dirty(start);
        sync.begin_remote_load();
        sync.finish_remote_load(Some(counters(1)));

        let later = start + Duration::from_secs(1);
        assert_eq!(sync.take_due(later, counters(2)), Some(counters(2)));
        sync.mark_dirty(later);
        assert_eq!(sync.take_due(later + Duration::from_secs(1), counters(2)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_counters_are_not_pushed_twice() {
        let mut sync = RemoteCounterSync::new(Duration::ZERO);
        let now = Instant::now();
        sync.mark_dirty(now);
        assert!(sync.take_due(now, counters(1)).is_some());
        sync.mark_dirty(now);
        assert!(sync.take_due(now, counters(1)).is_none());
    }
}
