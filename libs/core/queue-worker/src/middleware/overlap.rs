use super::{Middleware, Next};
use crate::error::JobError;
use crate::job::Job;
use crate::lock::LockStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Prevents two jobs with the same key from running at once.
///
/// A job that finds the lock taken is released back to the queue after
/// `release_after` without consuming an attempt. The lock is always removed
/// when the body finishes, including on failure, panic or timeout.
pub struct WithoutOverlapping {
    locks: Arc<dyn LockStore>,
    key: String,
    release_after: Duration,
    expire_after: Duration,
}

impl WithoutOverlapping {
    pub fn new(locks: Arc<dyn LockStore>, key: impl Into<String>) -> Self {
        Self {
            locks,
            key: key.into(),
            release_after: Duration::ZERO,
            expire_after: Duration::ZERO,
        }
    }

    pub fn release_after(mut self, delay: Duration) -> Self {
        self.release_after = delay;
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.expire_after = ttl;
        self
    }

    fn lock_key(&self, job: &Job) -> String {
        format!("overlap:{}:{}", job.job_type, self.key)
    }
}

#[async_trait]
impl Middleware for WithoutOverlapping {
    fn name(&self) -> &'static str {
        "without_overlapping"
    }

    async fn handle(&self, job: &Job, next: Next<'_>) -> Result<(), JobError> {
        let key = self.lock_key(job);
        let acquired = self
            .locks
            .add(&key, &job.id, self.expire_after)
            .await
            .map_err(|e| JobError::from_error("LockStoreError", e))?;

        if !acquired {
            debug!(job_id = %job.id, lock = %key, "Overlap lock held, releasing job");
            return Err(JobError::AlreadyRunning {
                key,
                retry_after: self.release_after,
            });
        }

        let result = next.run().await;

        if let Err(e) = self.locks.forget(&key).await {
            warn!(job_id = %job.id, lock = %key, error = %e, "Failed to release overlap lock");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;
    use crate::middleware::Pipeline;
    use crate::registry::JobHandler;

    struct Failing;

    #[async_trait]
    impl JobHandler for Failing {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            Err(JobError::failed("downstream unavailable"))
        }
    }

    #[tokio::test]
    async fn test_lock_released_after_failure() {
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let layer: Arc<dyn Middleware> =
            Arc::new(WithoutOverlapping::new(locks.clone(), "account-7"));
        let pipeline = Pipeline::new(vec![layer]);
        let handler: Arc<dyn JobHandler> = Arc::new(Failing);
        let job = Job::raw("accounts.sync", serde_json::json!({}));

        assert!(pipeline.run(&job, &handler, None).await.is_err());
        assert_eq!(locks.get("overlap:accounts.sync:account-7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_held_lock_yields_control_error() {
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        locks
            .add("overlap:accounts.sync:account-7", "other", Duration::ZERO)
            .await
            .unwrap();
        let layer: Arc<dyn Middleware> = Arc::new(
            WithoutOverlapping::new(locks.clone(), "account-7")
                .release_after(Duration::from_secs(5)),
        );
        let pipeline = Pipeline::new(vec![layer]);
        let handler: Arc<dyn JobHandler> = Arc::new(Failing);
        let job = Job::raw("accounts.sync", serde_json::json!({}));

        let err = pipeline.run(&job, &handler, None).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        // the other holder's lock is untouched
        assert_eq!(
            locks.get("overlap:accounts.sync:account-7").await.unwrap().as_deref(),
            Some("other")
        );
    }
}
