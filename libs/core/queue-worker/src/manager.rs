//! Named queue connections for producers

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::event::{EventSink, JobEvent, TracingEventSink};
use crate::job::Job;
use crate::lock::{LockStore, MemoryLockStore};
use crate::middleware::unique;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Registry of backends by connection name, with a default connection.
///
/// Built once at startup and passed to whatever dispatches jobs.
pub struct QueueManager {
    connections: HashMap<String, Arc<dyn QueueBackend>>,
    default: String,
    locks: Arc<dyn LockStore>,
    events: Arc<dyn EventSink>,
}

impl QueueManager {
    /// Create a manager whose default connection is `backend`.
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        let default = backend.name().to_string();
        let mut connections = HashMap::new();
        connections.insert(default.clone(), backend);
        Self {
            connections,
            default,
            locks: Arc::new(MemoryLockStore::new()),
            events: Arc::new(TracingEventSink),
        }
    }

    /// Add a connection under its own name, replacing one with the same name.
    pub fn with_connection(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.connections.insert(backend.name().to_string(), backend);
        self
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into();
        if !self.connections.contains_key(&name) {
            return Err(QueueError::UnknownConnection(name));
        }
        self.default = name;
        Ok(self)
    }

    /// Lock store holding unique-job locks; share it with the workers.
    pub fn with_lock_store(mut self, locks: Arc<dyn LockStore>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn connection(&self, name: Option<&str>) -> Result<Arc<dyn QueueBackend>, QueueError> {
        let name = name.unwrap_or(&self.default);
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownConnection(name.to_string()))
    }

    pub fn default_connection(&self) -> &str {
        &self.default
    }

    pub fn connection_names(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    /// Push a job on the default connection.
    ///
    /// A unique job whose lock is already held is not pushed and `None` is
    /// returned. A job with a delay is pushed for later.
    pub async fn dispatch(&self, job: &Job) -> Result<Option<String>, QueueError> {
        self.dispatch_to(None, job).await
    }

    pub async fn dispatch_to(&self, connection: Option<&str>, job: &Job) -> Result<Option<String>, QueueError> {
        let backend = self.connection(connection)?;
        if !unique::acquire(self.locks.as_ref(), job).await? {
            info!(job_id = %job.id, unique_id = ?job.unique_id, "Unique job already queued, skipping dispatch");
            return Ok(None);
        }

        let id = if job.delay > 0 {
            backend.later(job, Duration::from_secs(job.delay), None).await?
        } else {
            backend.push(job, None).await?
        };

        let queue = job.queue.as_deref().unwrap_or(backend.default_queue()).to_string();
        debug!(job_id = %id, queue = %queue, connection = backend.name(), "Job queued");
        self.events.dispatch(&JobEvent::JobQueued {
            connection: backend.name().to_string(),
            queue,
            job_id: id.clone(),
            job_type: job.job_type.clone(),
        });
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryQueue;
    use serde_json::json;

    #[tokio::test]
    async fn test_connection_lookup() {
        let manager = QueueManager::new(Arc::new(MemoryQueue::new()))
            .with_connection(Arc::new(MemoryQueue::new().with_name("sync")));
        assert_eq!(manager.default_connection(), "memory");
        assert_eq!(manager.connection(Some("sync")).unwrap().name(), "sync");
        assert!(matches!(
            manager.connection(Some("sqs")),
            Err(QueueError::UnknownConnection(_))
        ));
        assert!(manager.with_default("sqs").is_err());
    }

    #[tokio::test]
    async fn test_unique_job_dispatched_once() {
        let backend = Arc::new(MemoryQueue::new());
        let manager = QueueManager::new(backend.clone());

        let first = Job::raw("report", json!({})).unique("daily", 60);
        let second = Job::raw("report", json!({})).unique("daily", 60);
        assert!(manager.dispatch(&first).await.unwrap().is_some());
        assert!(manager.dispatch(&second).await.unwrap().is_none());
        assert_eq!(backend.size(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delayed_job_is_not_immediately_available() {
        let backend = Arc::new(MemoryQueue::new());
        let manager = QueueManager::new(backend.clone());

        let job = Job::raw("reminder", json!({})).delay(30);
        manager.dispatch(&job).await.unwrap();
        assert_eq!(backend.size(None).await.unwrap(), 1);
        assert!(backend.pop(None).await.unwrap().is_none());
    }
}
