//! Job handlers and the type registry
//!
//! The worker never instantiates code from payload data: the envelope's
//! `job_type` is looked up here and anything unregistered is rejected.

use crate::error::JobError;
use crate::job::{Job, JobPayload};
use crate::middleware::Middleware;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Executes jobs of one type.
///
/// # Example
///
/// ```ignore
/// struct SendEmailHandler { mailer: Mailer }
///
/// #[async_trait]
/// impl JobHandler for SendEmailHandler {
///     async fn handle(&self, job: &Job) -> Result<(), JobError> {
///         let email: SendEmail = job.decode()?;
///         self.mailer.send(email).await.map_err(|e| JobError::from_error("MailerError", e))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Run the job body.
    async fn handle(&self, job: &Job) -> Result<(), JobError>;

    /// Called exactly once when the job fails permanently.
    async fn on_failure(&self, _job: &Job, _error: &JobError) {}

    /// Called when an execution exceeds its timeout, before retry or failure.
    async fn on_timeout(&self, _job: &Job) {}

    /// Extra middleware wrapped around this handler, outermost first.
    fn middleware(&self, _job: &Job) -> Vec<Arc<dyn Middleware>> {
        Vec::new()
    }
}

/// Handler built from an async closure over a typed payload
pub struct FnHandler<T, F> {
    f: F,
    _payload: PhantomData<fn(T)>,
}

/// Build a handler from an async function taking the decoded payload.
pub fn handler_fn<T, F, Fut>(f: F) -> FnHandler<T, F>
where
    T: JobPayload + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    FnHandler {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> JobHandler for FnHandler<T, F>
where
    T: JobPayload + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload = job.decode::<T>()?;
        (self.f)(payload).await
    }
}

/// Registered handlers keyed by job type
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler) -> &mut Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    /// Register a handler under the payload type's `JOB_TYPE`.
    pub fn register_payload<T: JobPayload>(&mut self, handler: impl JobHandler) -> &mut Self {
        self.register(T::JOB_TYPE, handler)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    impl JobPayload for Resize {
        const JOB_TYPE: &'static str = "images.resize";
    }

    #[tokio::test]
    async fn test_fn_handler_decodes_payload() {
        let handler = handler_fn(|resize: Resize| async move {
            if resize.width == 0 {
                return Err(JobError::failed("zero width"));
            }
            Ok(())
        });

        let ok = Job::new(&Resize { width: 10 }).unwrap();
        assert!(handler.handle(&ok).await.is_ok());

        let bad = Job::new(&Resize { width: 0 }).unwrap();
        assert!(handler.handle(&bad).await.is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register_payload::<Resize>(handler_fn(|_: Resize| async { Ok(()) }));

        assert!(registry.contains("images.resize"));
        assert!(registry.get("images.resize").is_some());
        assert!(registry.get("App\\Jobs\\Anything").is_none());
    }
}
