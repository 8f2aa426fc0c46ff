//! Scoped ownership of the camera and microphone handles.
//!
//! The handles themselves belong to the UI shell; the orchestrator only
//! guarantees they are released exactly once, whichever path ends the
//! session (end, termination, expiry or teardown).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Camera/microphone owner.
pub trait MediaHandles: Send + Sync {
    /// Stop every track. Called at most once per lease.
    fn release(&self);
}

/// Releases the handles on the first `release` call or on drop.
pub struct MediaLease {
    handles: Arc<dyn MediaHandles>,
    released: AtomicBool,
}

impl MediaLease {
    pub fn new(handles: Arc<dyn MediaHandles>) -> Self {
        Self {
            handles,
            released: AtomicBool::new(false),
        }
    }

    /// Returns `true` only for the call that actually released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.handles.release();
        tracing::debug!("Media handles released");
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for MediaLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MediaLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaLease")
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingHandles {
        releases: AtomicU32,
    }

    impl MediaHandles for CountingHandles {
        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_happens_once() {
        let handles = Arc::new(CountingHandles::default());
        let lease = MediaLease::new(handles.clone());
        assert!(lease.release());
        assert!(!lease.release());
        drop(lease);
        assert_eq!(handles.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_unreleased_lease() {
        let handles = Arc::new(CountingHandles::default());
        {
            let _lease = MediaLease::new(handles.clone());
        }
        assert_eq!(handles.releases.load(Ordering::SeqCst), 1);
    }
}
