use super::{Middleware, Next};
use crate::error::JobError;
use crate::job::Job;
use crate::lock::LockStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fixed-window rate limit shared across workers through the lock store.
///
/// Over-limit jobs are released until the window resets; they never fail.
pub struct RateLimited {
    locks: Arc<dyn LockStore>,
    key: String,
    max_attempts: u64,
    decay: Duration,
}

impl RateLimited {
    pub fn new(
        locks: Arc<dyn LockStore>,
        key: impl Into<String>,
        max_attempts: u64,
        decay: Duration,
    ) -> Self {
        Self {
            locks,
            key: key.into(),
            max_attempts,
            decay,
        }
    }
}

#[async_trait]
impl Middleware for RateLimited {
    fn name(&self) -> &'static str {
        "rate_limited"
    }

    async fn handle(&self, job: &Job, next: Next<'_>) -> Result<(), JobError> {
        let key = format!("rate:{}", self.key);
        let hits = self
            .locks
            .increment(&key, self.decay)
            .await
            .map_err(|e| JobError::from_error("LockStoreError", e))?;

        if hits > self.max_attempts {
            let retry_after = self
                .locks
                .ttl(&key)
                .await
                .ok()
                .flatten()
                .unwrap_or(self.decay);
            debug!(job_id = %job.id, limiter = %self.key, hits, "Rate limit hit");
            return Err(JobError::RateLimited {
                key: self.key.clone(),
                retry_after,
            });
        }

        next.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::lock::MemoryLockStore;
    use crate::middleware::Pipeline;
    use crate::registry::JobHandler;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_limits_within_window() {
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let layer: Arc<dyn Middleware> = Arc::new(RateLimited::new(
            locks,
            "mailgun",
            2,
            Duration::from_secs(60),
        ));
        let pipeline = Pipeline::new(vec![layer]);
        let handler: Arc<dyn JobHandler> = Arc::new(Noop);
        let job = Job::raw("mail.send", serde_json::json!({}));

        assert!(pipeline.run(&job, &handler, None).await.is_ok());
        assert!(pipeline.run(&job, &handler, None).await.is_ok());

        let err = pipeline.run(&job, &handler, None).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Control);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(pipeline.run(&job, &handler, None).await.is_ok());
    }
}
