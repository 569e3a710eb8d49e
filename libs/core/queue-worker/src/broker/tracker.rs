//! Publish confirmation tracking
//!
//! Each adapter owns one tracker. Publishes register as pending; the
//! broker's acknowledgement marks them delivered or failed. Settled entries
//! are garbage collected after a minute.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed(String),
}

#[derive(Debug)]
struct Entry {
    status: DeliveryStatus,
    updated_at: Instant,
}

/// Per-adapter record of in-flight publishes
#[derive(Debug)]
pub struct DeliveryTracker {
    entries: Mutex<HashMap<String, Entry>>,
    settled: Notify,
    stale_after: Duration,
    last_gc: Mutex<Instant>,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::with_stale_after(STALE_AFTER)
    }

    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            settled: Notify::new(),
            stale_after,
            last_gc: Mutex::new(Instant::now()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track(&self, id: &str) {
        self.entries().insert(
            id.to_string(),
            Entry {
                status: DeliveryStatus::Pending,
                updated_at: Instant::now(),
            },
        );
    }

    pub fn mark_delivered(&self, id: &str) {
        self.settle(id, DeliveryStatus::Delivered);
    }

    pub fn mark_failed(&self, id: &str, reason: impl Into<String>) {
        self.settle(id, DeliveryStatus::Failed(reason.into()));
    }

    fn settle(&self, id: &str, status: DeliveryStatus) {
        if let Some(entry) = self.entries().get_mut(id) {
            entry.status = status;
            entry.updated_at = Instant::now();
        }
        self.settled.notify_waiters();
    }

    pub fn status(&self, id: &str) -> Option<DeliveryStatus> {
        self.entries().get(id).map(|entry| entry.status.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.entries()
            .values()
            .filter(|entry| entry.status == DeliveryStatus::Pending)
            .count()
    }

    /// Wait until the publish settles or `timeout` passes; returns the
    /// status at that point.
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> Option<DeliveryStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            match self.status(id) {
                Some(DeliveryStatus::Pending) => {}
                other => return other,
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.status(id);
            }
        }
    }

    /// Wait until fewer than `threshold` publishes are pending or `timeout`
    /// passes. Returns the pending count at that point.
    pub async fn wait_below(&self, threshold: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            let pending = self.pending_count();
            if pending < threshold {
                return pending;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending_count();
            }
        }
    }

    /// Drop settled entries older than the stale window. Runs at most once
    /// per second.
    pub fn gc(&self) -> usize {
        {
            let mut last = self.last_gc.lock().unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() < Duration::from_secs(1) {
                return 0;
            }
            *last = Instant::now();
        }
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.status == DeliveryStatus::Pending
                || now.duration_since(entry.updated_at) < self.stale_after
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_returns_on_settle() {
        let tracker = Arc::new(DeliveryTracker::new());
        tracker.track("m1");

        let settler = Arc::clone(&tracker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            settler.mark_delivered("m1");
        });

        let status = tracker.wait_for("m1", Duration::from_secs(1)).await;
        assert_eq!(status, Some(DeliveryStatus::Delivered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out_pending() {
        let tracker = DeliveryTracker::new();
        tracker.track("m1");
        let status = tracker.wait_for("m1", Duration::from_millis(100)).await;
        assert_eq!(status, Some(DeliveryStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_drops_only_stale_settled_entries() {
        let tracker = DeliveryTracker::new();
        tracker.track("old");
        tracker.track("pending");
        tracker.mark_failed("old", "nack");

        tokio::time::advance(Duration::from_secs(61)).await;
        tracker.track("fresh");
        tracker.mark_delivered("fresh");

        assert_eq!(tracker.gc(), 1);
        assert_eq!(tracker.status("old"), None);
        assert_eq!(tracker.status("pending"), Some(DeliveryStatus::Pending));
        assert_eq!(tracker.status("fresh"), Some(DeliveryStatus::Delivered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_below_drains() {
        let tracker = Arc::new(DeliveryTracker::new());
        for id in ["a", "b", "c"] {
            tracker.track(id);
        }
        let settler = Arc::clone(&tracker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            settler.mark_delivered("a");
            settler.mark_delivered("b");
        });

        assert_eq!(tracker.wait_below(2, Duration::from_secs(1)).await, 1);
        assert_eq!(tracker.wait_below(0, Duration::from_millis(50)).await, 1);
    }
}
