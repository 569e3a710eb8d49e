//! Job cancellation flags
//!
//! A cancelled job is acknowledged without running the next time a worker
//! picks it up. Flags live in the lock store so every worker sees them.

use crate::error::QueueError;
use crate::lock::LockStore;
use std::sync::Arc;
use std::time::Duration;

const CANCEL_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct CancellationRegistry {
    locks: Arc<dyn LockStore>,
    ttl: Duration,
}

impl CancellationRegistry {
    pub fn new(locks: Arc<dyn LockStore>) -> Self {
        Self {
            locks,
            ttl: CANCEL_TTL,
        }
    }

    fn key(job_id: &str) -> String {
        format!("cancelled:{job_id}")
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
        self.locks.put(&Self::key(job_id), "1", self.ttl).await
    }

    pub async fn is_cancelled(&self, job_id: &str) -> Result<bool, QueueError> {
        Ok(self.locks.get(&Self::key(job_id)).await?.is_some())
    }

    /// Clear the flag. Returns true if the job was marked cancelled.
    pub async fn restore(&self, job_id: &str) -> Result<bool, QueueError> {
        self.locks.forget(&Self::key(job_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flag_expires_after_a_day() {
        let registry = CancellationRegistry::new(Arc::new(MemoryLockStore::new()));
        registry.cancel("job-1").await.unwrap();
        assert!(registry.is_cancelled("job-1").await.unwrap());
        assert!(!registry.is_cancelled("job-2").await.unwrap());

        tokio::time::advance(CANCEL_TTL + Duration::from_secs(1)).await;
        assert!(!registry.is_cancelled("job-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_clears_flag() {
        let registry = CancellationRegistry::new(Arc::new(MemoryLockStore::new()));
        registry.cancel("job-1").await.unwrap();
        assert!(registry.restore("job-1").await.unwrap());
        assert!(!registry.is_cancelled("job-1").await.unwrap());
    }
}
