//! Jobs this binary knows how to run
//!
//! Services that need their own jobs build a [`HandlerRegistry`] and call
//! [`crate::work`] with it.

use queue_worker::{HandlerRegistry, JobError, JobPayload, handler_fn};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Writes a message to the log. Handy for checking a deployment end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub message: String,
}

impl JobPayload for LogMessage {
    const JOB_TYPE: &'static str = "queue.log_message";
}

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_payload::<LogMessage>(handler_fn(|job: LogMessage| async move {
        if job.message.is_empty() {
            return Err(JobError::InvalidPayload("message must not be empty".to_string()));
        }
        info!(message = %job.message, "Log message job");
        Ok(())
    }));
    registry
}
