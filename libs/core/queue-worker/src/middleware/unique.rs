//! Unique job locks
//!
//! The lock is taken at dispatch time and held until the job reaches a
//! terminal state: released after a successful run here, and by the worker
//! when the job fails permanently.

use super::{Middleware, Next};
use crate::error::{JobError, QueueError};
use crate::job::Job;
use crate::lock::LockStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub fn lock_key(job: &Job) -> Option<String> {
    job.unique_id
        .as_ref()
        .map(|id| format!("unique:{}:{}", job.job_type, id))
}

/// Take the unique lock for a job about to be dispatched.
///
/// Returns false when another pending or running job holds the lock.
/// Jobs without a unique id always succeed.
pub async fn acquire(locks: &dyn LockStore, job: &Job) -> Result<bool, QueueError> {
    match lock_key(job) {
        Some(key) => {
            locks
                .add(&key, &job.id, Duration::from_secs(job.unique_for))
                .await
        }
        None => Ok(true),
    }
}

pub async fn release(locks: &dyn LockStore, job: &Job) -> Result<(), QueueError> {
    if let Some(key) = lock_key(job) {
        locks.forget(&key).await?;
    }
    Ok(())
}

/// Releases the unique lock once the job completes successfully
pub struct UniqueJob {
    locks: Arc<dyn LockStore>,
}

impl UniqueJob {
    pub fn new(locks: Arc<dyn LockStore>) -> Self {
        Self { locks }
    }
}

#[async_trait]
impl Middleware for UniqueJob {
    fn name(&self) -> &'static str {
        "unique"
    }

    async fn handle(&self, job: &Job, next: Next<'_>) -> Result<(), JobError> {
        let result = next.run().await;
        if result.is_ok()
            && let Err(e) = release(self.locks.as_ref(), job).await
        {
            warn!(job_id = %job.id, error = %e, "Failed to release unique lock");
        }
        result
    }
}
