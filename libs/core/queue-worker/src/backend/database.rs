//! Relational queue on PostgreSQL or SQLite
//!
//! Jobs live in one table. A claim runs in a transaction: select the best
//! candidate (priority, then id), then delete it by id and require exactly
//! one affected row. On PostgreSQL the select uses `FOR UPDATE SKIP LOCKED`
//! so concurrent workers skip each other's candidates instead of blocking;
//! SQLite serializes writers, and the conditional delete catches any claim
//! that lost the race.

use super::{QueueBackend, ReservedJob, Receipt, decode_or_reject, resolve_queue, with_reconnect};
use crate::error::QueueError;
use crate::failed::{ExceptionFrame, FailedJob, FailedJobStore};
use crate::job::Job;
use crate::time::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Database flavour, detected from the connection URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Postgres,
    Sqlite,
}

impl DbKind {
    pub fn from_url(url: &str) -> Result<Self, QueueError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(DbKind::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(DbKind::Sqlite)
        } else {
            Err(QueueError::Config(format!(
                "unsupported database url scheme: {}",
                url.split(':').next().unwrap_or_default()
            )))
        }
    }

    /// Row locking used for the claim select by default.
    pub fn default_lock_strategy(&self) -> LockStrategy {
        match self {
            DbKind::Postgres => LockStrategy::SkipLocked,
            DbKind::Sqlite => LockStrategy::None,
        }
    }
}

/// Row locking applied to the claim select
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// `FOR UPDATE SKIP LOCKED`
    SkipLocked,
    /// `FOR UPDATE`, for servers without SKIP LOCKED
    ForUpdate,
    /// No row locks; rely on the conditional delete
    None,
}

impl LockStrategy {
    fn clause(&self) -> &'static str {
        match self {
            LockStrategy::SkipLocked => " FOR UPDATE SKIP LOCKED",
            LockStrategy::ForUpdate => " FOR UPDATE",
            LockStrategy::None => "",
        }
    }
}

/// Table names and claim behaviour
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub connection: String,
    pub table: String,
    pub failed_table: String,
    pub default_queue: String,
    pub lock_strategy: Option<LockStrategy>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection: "database".to_string(),
            table: "jobs".to_string(),
            failed_table: "failed_jobs".to_string(),
            default_queue: "default".to_string(),
            lock_strategy: None,
        }
    }
}

impl DatabaseConfig {
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_failed_table(mut self, table: impl Into<String>) -> Self {
        self.failed_table = table.into();
        self
    }

    pub fn with_lock_strategy(mut self, strategy: LockStrategy) -> Self {
        self.lock_strategy = Some(strategy);
        self
    }
}

/// Queue stored in a relational table
pub struct DatabaseQueue {
    pool: AnyPool,
    kind: DbKind,
    config: DatabaseConfig,
    lock_strategy: LockStrategy,
    clock: Arc<dyn Clock>,
    failed: Arc<dyn FailedJobStore>,
}

impl DatabaseQueue {
    /// Connect and create the tables if needed.
    pub async fn connect(url: &str, config: DatabaseConfig) -> Result<Self, QueueError> {
        sqlx::any::install_default_drivers();
        let kind = DbKind::from_url(url)?;
        let mut options = AnyPoolOptions::new();
        if kind == DbKind::Sqlite {
            // an in-memory database lives as long as its only connection
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = options.connect(url).await?;
        let queue = Self::from_pool(pool, kind, config);
        queue.migrate().await?;
        info!(kind = ?kind, table = %queue.config.table, "Database queue ready");
        Ok(queue)
    }

    pub fn from_pool(pool: AnyPool, kind: DbKind, config: DatabaseConfig) -> Self {
        let lock_strategy = config
            .lock_strategy
            .unwrap_or_else(|| kind.default_lock_strategy());
        let failed = Arc::new(DatabaseFailedJobStore {
            pool: pool.clone(),
            table: config.failed_table.clone(),
        });
        Self {
            pool,
            kind,
            config,
            lock_strategy,
            clock: Arc::new(SystemClock),
            failed,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failed_store(mut self, failed: Arc<dyn FailedJobStore>) -> Self {
        self.failed = failed;
        self
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Create the jobs and failed-jobs tables and the claim index.
    pub async fn migrate(&self) -> Result<(), QueueError> {
        let id_column = match self.kind {
            DbKind::Postgres => "id BIGSERIAL PRIMARY KEY",
            DbKind::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        };
        let table = &self.config.table;
        let failed = &self.config.failed_table;

        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 {id_column}, \
                 queue VARCHAR(255) NOT NULL, \
                 payload TEXT NOT NULL, \
                 attempts BIGINT NOT NULL DEFAULT 0, \
                 priority BIGINT NOT NULL DEFAULT 0, \
                 available_at BIGINT NOT NULL, \
                 created_at BIGINT NOT NULL)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_claim_idx ON {table} (queue, priority, available_at)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {failed} (\
                 {id_column}, \
                 uuid VARCHAR(255) NOT NULL UNIQUE, \
                 job_id VARCHAR(255) NOT NULL, \
                 connection TEXT NOT NULL, \
                 queue TEXT NOT NULL, \
                 payload TEXT NOT NULL, \
                 exception TEXT NOT NULL, \
                 failed_at BIGINT NOT NULL)"
            ),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert(&self, job: &Job, queue: &str, available_at: i64) -> Result<String, QueueError> {
        let payload = job.encode()?;
        let sql = format!(
            "INSERT INTO {} (queue, payload, attempts, priority, available_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.config.table
        );
        let now = self.clock.now();
        let payload = payload.as_str();
        let sql = sql.as_str();

        with_reconnect(
            "push",
            move || async move {
                sqlx::query(sql)
                    .bind(queue)
                    .bind(payload)
                    .bind(job.attempts as i64)
                    .bind(job.priority as i64)
                    .bind(available_at)
                    .bind(now)
                    .execute(&self.pool)
                    .await
                    .map_err(QueueError::from)
            },
            || self.reconnect(),
        )
        .await?;

        debug!(job_id = %job.id, queue, available_at, "Inserted job");
        Ok(job.id.clone())
    }

    /// The pool drops broken connections and dials new ones on its own, so
    /// reconnecting means checking out a fresh connection and proving it
    /// answers before the operation is retried.
    async fn reconnect(&self) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT 1").execute(&mut *conn).await?;
        info!(kind = ?self.kind, "Database connection re-established");
        Ok(())
    }

    async fn try_size(&self, queue: &str) -> Result<u64, QueueError> {
        let sql = format!("SELECT COUNT(*) AS total FROM {} WHERE queue = $1", self.config.table);
        let row = sqlx::query(&sql).bind(queue).fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn try_clear(&self, queue: &str) -> Result<u64, QueueError> {
        let sql = format!("DELETE FROM {} WHERE queue = $1", self.config.table);
        let result = sqlx::query(&sql).bind(queue).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn claim(&self, queue: &str) -> Result<Option<(i64, String, i64)>, QueueError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT id, payload, attempts FROM {} \
             WHERE queue = $1 AND available_at <= $2 \
             ORDER BY priority DESC, id ASC LIMIT 1{}",
            self.config.table,
            self.lock_strategy.clause()
        );
        let row: Option<AnyRow> = sqlx::query(&select)
            .bind(queue)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let payload: String = row.try_get("payload")?;
        let attempts: i64 = row.try_get("attempts")?;

        let delete = format!("DELETE FROM {} WHERE id = $1", self.config.table);
        let affected = sqlx::query(&delete)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if affected != 1 {
            // another worker claimed it between our select and delete
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some((id, payload, attempts)))
    }
}

#[async_trait]
impl QueueBackend for DatabaseQueue {
    fn name(&self) -> &str {
        &self.config.connection
    }

    fn default_queue(&self) -> &str {
        &self.config.default_queue
    }

    async fn push(&self, job: &Job, queue: Option<&str>) -> Result<String, QueueError> {
        let queue = resolve_queue(queue, Some(job), &self.config.default_queue);
        self.insert(job, queue, self.clock.now()).await
    }

    async fn later(&self, job: &Job, delay: Duration, queue: Option<&str>) -> Result<String, QueueError> {
        let queue = resolve_queue(queue, Some(job), &self.config.default_queue);
        self.insert(job, queue, self.clock.now() + delay.as_secs() as i64)
            .await
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<ReservedJob>, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        let claimed = with_reconnect("pop", move || self.claim(queue), || self.reconnect()).await?;

        let Some((id, raw, attempts)) = claimed else {
            return Ok(None);
        };

        let Some(mut job) =
            decode_or_reject(self.failed.as_ref(), self.name(), queue, &raw).await?
        else {
            return Ok(None);
        };
        job.attempts = attempts.max(0) as u32;
        debug!(row_id = id, job_id = %job.id, queue, "Claimed job");

        Ok(Some(ReservedJob {
            job,
            connection: self.config.connection.clone(),
            queue: queue.to_string(),
            raw,
            receipt: Receipt::None,
        }))
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        with_reconnect("size", move || self.try_size(queue), || self.reconnect()).await
    }

    async fn clear(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let queue = resolve_queue(queue, None, &self.config.default_queue);
        let cleared = with_reconnect("clear", move || self.try_clear(queue), || self.reconnect()).await?;
        info!(queue, cleared, "Cleared queue");
        Ok(cleared)
    }

    async fn ack(&self, _reserved: &ReservedJob) -> Result<(), QueueError> {
        // the claim already deleted the row
        Ok(())
    }

    fn failed_store(&self) -> Arc<dyn FailedJobStore> {
        Arc::clone(&self.failed)
    }
}

/// Failed jobs kept in a relational table
pub struct DatabaseFailedJobStore {
    pool: AnyPool,
    table: String,
}

impl DatabaseFailedJobStore {
    pub fn new(pool: AnyPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    fn columns(&self) -> String {
        format!(
            "SELECT uuid, job_id, connection, queue, payload, exception, failed_at FROM {}",
            self.table
        )
    }
}

fn failed_from_row(row: &AnyRow) -> Result<FailedJob, QueueError> {
    let exception: String = row.try_get("exception")?;
    let frames: Vec<ExceptionFrame> = serde_json::from_str(&exception)?;
    let failed_at: i64 = row.try_get("failed_at")?;
    Ok(FailedJob {
        id: row.try_get("uuid")?,
        job_id: row.try_get("job_id")?,
        connection: row.try_get("connection")?,
        queue: row.try_get("queue")?,
        payload: row.try_get("payload")?,
        exception: frames,
        failed_at: Utc
            .timestamp_millis_opt(failed_at)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl FailedJobStore for DatabaseFailedJobStore {
    async fn log(&self, record: FailedJob) -> Result<String, QueueError> {
        let sql = format!(
            "INSERT INTO {} (uuid, job_id, connection, queue, payload, exception, failed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.table
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.job_id)
            .bind(&record.connection)
            .bind(&record.queue)
            .bind(&record.payload)
            .bind(serde_json::to_string(&record.exception)?)
            .bind(record.failed_at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        info!(failed_id = %record.id, job_id = %record.job_id, "Recorded failed job");
        Ok(record.id)
    }

    async fn all(&self) -> Result<Vec<FailedJob>, QueueError> {
        let sql = format!("{} ORDER BY id DESC", self.columns());
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(failed_from_row).collect()
    }

    async fn find(&self, id: &str) -> Result<Option<FailedJob>, QueueError> {
        let sql = format!("{} WHERE uuid = $1", self.columns());
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(failed_from_row).transpose()
    }

    async fn forget(&self, id: &str) -> Result<bool, QueueError> {
        let sql = format!("DELETE FROM {} WHERE uuid = $1", self.table);
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn flush(&self) -> Result<u64, QueueError> {
        let sql = format!("DELETE FROM {}", self.table);
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
