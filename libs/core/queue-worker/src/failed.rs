//! Failed job records
//!
//! Jobs that exhaust their attempts are written to a failed-job store
//! together with the full error chain, so they can be inspected, retried or
//! forgotten later.

use crate::error::{Failure, JobError, QueueError, capture_trace};
use crate::job::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// One error in a failure chain, outermost first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionFrame {
    pub class: String,
    pub message: String,
    pub code: i64,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub trace: String,
}

impl ExceptionFrame {
    /// Flatten an error and its sources into frames.
    ///
    /// Errors that carry no trace of their own get the trace of the caller.
    pub fn chain(error: &JobError) -> Vec<ExceptionFrame> {
        let top = Self::top(error);
        let trace = top.trace.clone();
        let mut frames = vec![top];
        let mut source = error.source();
        // JobError::Failed is transparent, so its first source is the wrapped cause
        while let Some(cause) = source {
            frames.push(match cause.downcast_ref::<Failure>() {
                Some(failure) => Self::from_failure(failure),
                None => ExceptionFrame {
                    class: "Error".to_string(),
                    message: cause.to_string(),
                    code: 0,
                    file: None,
                    line: None,
                    trace: trace.clone(),
                },
            });
            source = cause.source();
        }
        frames
    }

    fn top(error: &JobError) -> Self {
        match error {
            JobError::Failed(failure) => Self::from_failure(failure),
            other => ExceptionFrame {
                class: other.class().to_string(),
                message: other.to_string(),
                code: 0,
                file: None,
                line: None,
                trace: capture_trace(),
            },
        }
    }

    fn from_failure(failure: &Failure) -> Self {
        ExceptionFrame {
            class: failure.class.clone(),
            message: failure.message.clone(),
            code: failure.code,
            file: Some(failure.file.to_string()),
            line: Some(failure.line),
            trace: failure.trace(),
        }
    }
}

/// A job that exhausted its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    /// Failed-record id (distinct from the job id)
    pub id: String,
    pub job_id: String,
    pub connection: String,
    pub queue: String,
    /// The job envelope as JSON
    pub payload: String,
    pub exception: Vec<ExceptionFrame>,
    pub failed_at: DateTime<Utc>,
}

impl FailedJob {
    pub fn new(connection: &str, queue: &str, payload: String, job_id: &str, error: &JobError) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            job_id: job_id.to_string(),
            connection: connection.to_string(),
            queue: queue.to_string(),
            payload,
            exception: ExceptionFrame::chain(error),
            failed_at: Utc::now(),
        }
    }

    /// Decode the stored envelope with attempts reset, ready to be pushed again.
    pub fn retryable_job(&self) -> Result<Job, QueueError> {
        let mut job = Job::from_json(&self.payload)?;
        job.attempts = 0;
        Ok(job)
    }

    /// Message of the outermost error.
    pub fn summary(&self) -> &str {
        self.exception
            .first()
            .map(|frame| frame.message.as_str())
            .unwrap_or("")
    }
}

/// Storage for failed-job records
#[async_trait]
pub trait FailedJobStore: Send + Sync {
    async fn log(&self, record: FailedJob) -> Result<String, QueueError>;

    /// All records, newest first.
    async fn all(&self) -> Result<Vec<FailedJob>, QueueError>;

    async fn find(&self, id: &str) -> Result<Option<FailedJob>, QueueError>;

    async fn forget(&self, id: &str) -> Result<bool, QueueError>;

    /// Remove every record, returning how many were removed.
    async fn flush(&self) -> Result<u64, QueueError>;
}

/// In-process failed-job store
#[derive(Debug, Default)]
pub struct MemoryFailedJobStore {
    records: Mutex<Vec<FailedJob>>,
}

impl MemoryFailedJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Vec<FailedJob>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FailedJobStore for MemoryFailedJobStore {
    async fn log(&self, record: FailedJob) -> Result<String, QueueError> {
        let id = record.id.clone();
        self.records().push(record);
        Ok(id)
    }

    async fn all(&self) -> Result<Vec<FailedJob>, QueueError> {
        Ok(self.records().iter().rev().cloned().collect())
    }

    async fn find(&self, id: &str) -> Result<Option<FailedJob>, QueueError> {
        Ok(self.records().iter().find(|r| r.id == id).cloned())
    }

    async fn forget(&self, id: &str) -> Result<bool, QueueError> {
        let mut records = self.records();
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    async fn flush(&self) -> Result<u64, QueueError> {
        let mut records = self.records();
        let count = records.len() as u64;
        records.clear();
        Ok(count)
    }
}

/// Failed jobs kept in a Redis hash with a time-ordered index
pub struct RedisFailedJobStore {
    conn: ConnectionManager,
    key: String,
    max_length: i64,
}

impl RedisFailedJobStore {
    pub fn new(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
            max_length: 10_000,
        }
    }

    /// Set the maximum number of retained records
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.key)
    }
}

const TRIM_SCRIPT: &str = r#"
local overflow = redis.call('zcard', KEYS[2]) - tonumber(ARGV[1])
if overflow > 0 then
    local ids = redis.call('zrange', KEYS[2], 0, overflow - 1)
    for _, id in ipairs(ids) do
        redis.call('hdel', KEYS[1], id)
    end
    redis.call('zremrangebyrank', KEYS[2], 0, overflow - 1)
end
return overflow
"#;

#[async_trait]
impl FailedJobStore for RedisFailedJobStore {
    async fn log(&self, record: FailedJob) -> Result<String, QueueError> {
        let data = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&self.key)
            .arg(&record.id)
            .arg(&data)
            .ignore()
            .cmd("ZADD")
            .arg(self.index_key())
            .arg(record.failed_at.timestamp_millis())
            .arg(&record.id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        let _: i64 = redis::Script::new(TRIM_SCRIPT)
            .key(&self.key)
            .key(self.index_key())
            .arg(self.max_length)
            .invoke_async(&mut conn)
            .await?;

        info!(
            failed_id = %record.id,
            job_id = %record.job_id,
            queue = %record.queue,
            "Recorded failed job"
        );
        Ok(record.id)
    }

    async fn all(&self) -> Result<Vec<FailedJob>, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.index_key())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.key)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        values
            .into_iter()
            .flatten()
            .map(|data| serde_json::from_str(&data).map_err(QueueError::from))
            .collect()
    }

    async fn find(&self, id: &str) -> Result<Option<FailedJob>, QueueError> {
        let mut conn = self.conn.clone();
        let data: Option<String> = redis::cmd("HGET")
            .arg(&self.key)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        data.map(|d| serde_json::from_str(&d).map_err(QueueError::from))
            .transpose()
    }

    async fn forget(&self, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(&self.key)
            .arg(id)
            .cmd("ZREM")
            .arg(self.index_key())
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn flush(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let (count, _): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("HLEN")
            .arg(&self.key)
            .cmd("DEL")
            .arg(&self.key)
            .arg(self.index_key())
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}
