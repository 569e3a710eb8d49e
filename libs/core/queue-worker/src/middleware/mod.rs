//! Job middleware pipeline
//!
//! Middleware wrap the job body in order: the first layer is outermost.
//! The innermost step runs the handler in its own task under the job
//! timeout, so a panic or timeout in the body still unwinds through every
//! layer and their cleanup runs.

mod overlap;
mod rate_limit;
pub mod unique;

pub use overlap::WithoutOverlapping;
pub use rate_limit::RateLimited;
pub use unique::UniqueJob;

use crate::error::JobError;
use crate::job::Job;
use crate::lock::LockStore;
use crate::registry::JobHandler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;

/// A layer around job execution
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run this layer; call `next.run()` to continue down the pipeline.
    async fn handle(&self, job: &Job, next: Next<'_>) -> Result<(), JobError>;
}

/// Serializable middleware declared on the job itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MiddlewareSpec {
    /// Only one job with this key runs at a time; others are released
    /// after `release_after` seconds. The lock expires after
    /// `expire_after` seconds (0 = never).
    WithoutOverlapping {
        key: String,
        release_after: u64,
        expire_after: u64,
    },
    /// At most `max_attempts` executions per `decay_secs` window.
    RateLimited {
        key: String,
        max_attempts: u64,
        decay_secs: u64,
    },
}

impl MiddlewareSpec {
    pub fn without_overlapping(key: impl Into<String>) -> Self {
        MiddlewareSpec::WithoutOverlapping {
            key: key.into(),
            release_after: 5,
            expire_after: 0,
        }
    }

    pub fn rate_limited(key: impl Into<String>, max_attempts: u64, decay_secs: u64) -> Self {
        MiddlewareSpec::RateLimited {
            key: key.into(),
            max_attempts,
            decay_secs,
        }
    }

    pub fn build(&self, locks: Arc<dyn LockStore>) -> Arc<dyn Middleware> {
        match self {
            MiddlewareSpec::WithoutOverlapping {
                key,
                release_after,
                expire_after,
            } => Arc::new(
                WithoutOverlapping::new(locks, key.clone())
                    .release_after(Duration::from_secs(*release_after))
                    .expire_after(Duration::from_secs(*expire_after)),
            ),
            MiddlewareSpec::RateLimited {
                key,
                max_attempts,
                decay_secs,
            } => Arc::new(RateLimited::new(
                locks,
                key.clone(),
                *max_attempts,
                Duration::from_secs(*decay_secs),
            )),
        }
    }
}

/// The remainder of the pipeline
pub struct Next<'a> {
    job: &'a Job,
    remaining: &'a [Arc<dyn Middleware>],
    handler: &'a Arc<dyn JobHandler>,
    timeout: Option<Duration>,
}

impl Next<'_> {
    pub async fn run(self) -> Result<(), JobError> {
        match self.remaining.split_first() {
            Some((layer, rest)) => {
                let job = self.job;
                let next = Next {
                    job,
                    remaining: rest,
                    handler: self.handler,
                    timeout: self.timeout,
                };
                layer.handle(job, next).await
            }
            None => run_body(Arc::clone(self.handler), self.job.clone(), self.timeout).await,
        }
    }
}

/// Run the handler in its own task so panics are contained and the body can
/// be aborted on timeout.
async fn run_body(
    handler: Arc<dyn JobHandler>,
    job: Job,
    timeout: Option<Duration>,
) -> Result<(), JobError> {
    let mut task = tokio::spawn(async move { handler.handle(&job).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(JobError::TimedOut(limit));
            }
        },
        None => task.await,
    };

    joined.unwrap_or_else(|e| Err(join_error(e)))
}

fn join_error(err: JoinError) -> JobError {
    if err.is_panic() {
        JobError::Panicked(panic_message(err.into_panic()))
    } else {
        JobError::Panicked("job task was cancelled".to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Ordered middleware stack for one job
pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Uniqueness (if declared) first, then the job's own middleware, then
    /// the handler's.
    pub fn for_job(job: &Job, handler: &dyn JobHandler, locks: &Arc<dyn LockStore>) -> Self {
        let mut layers: Vec<Arc<dyn Middleware>> = Vec::new();
        if job.unique_id.is_some() {
            layers.push(Arc::new(UniqueJob::new(Arc::clone(locks))));
        }
        layers.extend(job.middleware.iter().map(|spec| spec.build(Arc::clone(locks))));
        layers.extend(handler.middleware(job));
        Self { layers }
    }

    pub fn new(layers: Vec<Arc<dyn Middleware>>) -> Self {
        Self { layers }
    }

    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    pub async fn run(
        &self,
        job: &Job,
        handler: &Arc<dyn JobHandler>,
        timeout: Option<Duration>,
    ) -> Result<(), JobError> {
        Next {
            job,
            remaining: &self.layers,
            handler,
            timeout,
        }
        .run()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn handle(&self, _job: &Job, next: Next<'_>) -> Result<(), JobError> {
            self.log.lock().unwrap().push(format!("{}:before", self.label));
            let result = next.run().await;
            self.log.lock().unwrap().push(format!("{}:after", self.label));
            result
        }
    }

    struct Body {
        log: Arc<Mutex<Vec<String>>>,
        behaviour: &'static str,
    }

    #[async_trait]
    impl JobHandler for Body {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            self.log.lock().unwrap().push("body".to_string());
            match self.behaviour {
                "panic" => panic!("exploded"),
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    fn setup(behaviour: &'static str) -> (Arc<Mutex<Vec<String>>>, Pipeline, Arc<dyn JobHandler>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let layers: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder {
                label: "outer",
                log: log.clone(),
            }),
            Arc::new(Recorder {
                label: "inner",
                log: log.clone(),
            }),
        ];
        let handler: Arc<dyn JobHandler> = Arc::new(Body {
            log: log.clone(),
            behaviour,
        });
        (log, Pipeline::new(layers), handler)
    }

    #[tokio::test]
    async fn test_first_layer_is_outermost() {
        let (log, pipeline, handler) = setup("ok");
        let job = Job::raw("noop", serde_json::json!({}));
        pipeline.run(&job, &handler, None).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "body", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_error_and_layers_unwind() {
        let (log, pipeline, handler) = setup("panic");
        let job = Job::raw("noop", serde_json::json!({}));
        let err = pipeline.run(&job, &handler, None).await.unwrap_err();

        assert!(matches!(err, JobError::Panicked(ref msg) if msg == "exploded"));
        assert_eq!(log.lock().unwrap().last().unwrap(), "outer:after");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_body() {
        let (log, pipeline, handler) = setup("sleep");
        let job = Job::raw("noop", serde_json::json!({}));
        let err = pipeline
            .run(&job, &handler, Some(Duration::from_secs(2)))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::TimedOut(d) if d == Duration::from_secs(2)));
        assert_eq!(log.lock().unwrap().last().unwrap(), "outer:after");
    }

    #[test]
    fn test_pipeline_order_for_job() {
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let job = Job::raw("noop", serde_json::json!({}))
            .unique("order-1", 60)
            .through(MiddlewareSpec::without_overlapping("order-1"))
            .through(MiddlewareSpec::rate_limited("api", 10, 60));
        let handler = Body {
            log: Arc::new(Mutex::new(Vec::new())),
            behaviour: "ok",
        };

        let pipeline = Pipeline::for_job(&job, &handler, &locks);
        assert_eq!(
            pipeline.layer_names(),
            vec!["unique", "without_overlapping", "rate_limited"]
        );
    }
}
