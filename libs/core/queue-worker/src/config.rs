//! Worker and connection configuration
//!
//! Builder-style structs with environment loading through
//! [`core_config::FromEnv`].

use crate::backend::{
    AmqpConfig, AmqpQueue, DatabaseConfig, DatabaseQueue, MemoryQueue, QueueBackend, RedisQueue,
    RedisQueueConfig,
};
use crate::broker::{BrokerPool, JetStreamConfig, JetStreamQueue};
use crate::error::QueueError;
use crate::lock::{LockStore, MemoryLockStore, RedisLockStore};
use core_config::{ConfigError, FromEnv, env_flag, env_list, env_or_default, env_parse, env_required};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Settings for one worker loop
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Worker name used in logs and events
    pub name: String,
    /// Queues to poll, highest priority first
    pub queues: Vec<String>,
    /// Idle sleep when every queue is empty
    pub sleep: Duration,
    /// Pause after each job
    pub rest: Duration,
    /// Stop after this many jobs (0 = unlimited)
    pub max_jobs: u64,
    /// Stop after running this long (zero = unlimited)
    pub max_time: Duration,
    /// Stop when resident memory reaches this many megabytes (0 = unlimited)
    pub memory_limit_mb: u64,
    /// Attempts for jobs that do not set their own
    pub default_tries: u32,
    /// Constant backoff for jobs without a retry policy
    pub default_backoff: u64,
    /// Timeout for jobs that do not set their own (0 = none)
    pub default_timeout: u64,
    pub stop_when_empty: bool,
    /// Reschedule delay for an already-running job whose lock gives none
    pub overlap_release_after: Duration,
    /// Keep polling while paused
    pub force: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            queues: vec!["default".to_string()],
            sleep: Duration::from_secs(3),
            rest: Duration::ZERO,
            max_jobs: 0,
            max_time: Duration::ZERO,
            memory_limit_mb: 128,
            default_tries: 1,
            default_backoff: 0,
            default_timeout: 60,
            stop_when_empty: false,
            overlap_release_after: Duration::from_secs(5),
            force: false,
        }
    }
}

impl WorkerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the queues, first = highest priority. An empty list keeps the
    /// current queues.
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queues: Vec<String> = queues.into_iter().map(Into::into).collect();
        if !queues.is_empty() {
            self.queues = queues;
        }
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_rest(mut self, rest: Duration) -> Self {
        self.rest = rest;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    pub fn with_memory_limit_mb(mut self, megabytes: u64) -> Self {
        self.memory_limit_mb = megabytes;
        self
    }

    pub fn with_default_tries(mut self, tries: u32) -> Self {
        self.default_tries = tries;
        self
    }

    pub fn with_default_backoff(mut self, secs: u64) -> Self {
        self.default_backoff = secs;
        self
    }

    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout = secs;
        self
    }

    pub fn with_stop_when_empty(mut self, stop: bool) -> Self {
        self.stop_when_empty = stop;
        self
    }

    pub fn with_overlap_release_after(mut self, delay: Duration) -> Self {
        self.overlap_release_after = delay;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

impl FromEnv for WorkerOptions {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            name: env_or_default("QUEUE_WORKER_NAME", &defaults.name),
            queues: env_list("QUEUE_NAMES", &["default"]),
            sleep: Duration::from_secs(env_parse("QUEUE_SLEEP_SECS", defaults.sleep.as_secs())?),
            rest: defaults.rest,
            max_jobs: env_parse("QUEUE_MAX_JOBS", defaults.max_jobs)?,
            max_time: Duration::from_secs(env_parse("QUEUE_MAX_TIME_SECS", 0)?),
            memory_limit_mb: env_parse("QUEUE_MEMORY_LIMIT_MB", defaults.memory_limit_mb)?,
            default_tries: env_parse("QUEUE_TRIES", defaults.default_tries)?,
            default_backoff: env_parse("QUEUE_BACKOFF_SECS", defaults.default_backoff)?,
            default_timeout: env_parse("QUEUE_TIMEOUT_SECS", defaults.default_timeout)?,
            stop_when_empty: env_flag("QUEUE_STOP_WHEN_EMPTY", false)?,
            overlap_release_after: defaults.overlap_release_after,
            force: defaults.force,
        })
    }
}

/// Which backend to connect and how
#[derive(Debug, Clone)]
pub enum QueueConnectionConfig {
    Memory,
    Database {
        url: String,
        config: DatabaseConfig,
    },
    Redis {
        url: String,
        config: RedisQueueConfig,
    },
    Amqp(AmqpConfig),
    JetStream(JetStreamConfig),
}

impl QueueConnectionConfig {
    pub fn driver(&self) -> &'static str {
        match self {
            QueueConnectionConfig::Memory => "memory",
            QueueConnectionConfig::Database { .. } => "database",
            QueueConnectionConfig::Redis { .. } => "redis",
            QueueConnectionConfig::Amqp(_) => "amqp",
            QueueConnectionConfig::JetStream(_) => "jetstream",
        }
    }

    /// Open the backend. Broker backends share connections through `pool`.
    pub async fn connect(&self, pool: &BrokerPool) -> Result<Arc<dyn QueueBackend>, QueueError> {
        let backend: Arc<dyn QueueBackend> = match self {
            QueueConnectionConfig::Memory => Arc::new(MemoryQueue::new()),
            QueueConnectionConfig::Database { url, config } => {
                Arc::new(DatabaseQueue::connect(url, config.clone()).await?)
            }
            QueueConnectionConfig::Redis { url, config } => {
                Arc::new(RedisQueue::connect(url, config.clone()).await?)
            }
            QueueConnectionConfig::Amqp(config) => {
                Arc::new(AmqpQueue::connect(config.clone(), pool.clone()).await?)
            }
            QueueConnectionConfig::JetStream(config) => {
                Arc::new(JetStreamQueue::connect(config.clone(), pool).await?)
            }
        };
        Ok(backend)
    }
}

impl FromEnv for QueueConnectionConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let driver = env_or_default("QUEUE_CONNECTION", "memory").to_ascii_lowercase();
        match driver.as_str() {
            "memory" | "sync" => Ok(QueueConnectionConfig::Memory),
            "database" => {
                let config = DatabaseConfig::default()
                    .with_table(env_or_default("QUEUE_TABLE", "jobs"))
                    .with_failed_table(env_or_default("QUEUE_FAILED_TABLE", "failed_jobs"));
                Ok(QueueConnectionConfig::Database {
                    url: env_required("QUEUE_DATABASE_URL")?,
                    config,
                })
            }
            "redis" => {
                let mut config = RedisQueueConfig::default()
                    .with_prefix(env_or_default("QUEUE_REDIS_PREFIX", "queues:"))
                    .with_retry_after(Duration::from_secs(env_parse("QUEUE_RETRY_AFTER_SECS", 3600)?));
                let block_for: u64 = env_parse("QUEUE_BLOCK_FOR_SECS", 1)?;
                config = config.with_block_for(Duration::from_secs(block_for));
                Ok(QueueConnectionConfig::Redis {
                    url: env_required("REDIS_URL")?,
                    config,
                })
            }
            "amqp" | "rabbitmq" => {
                let mut config = AmqpConfig::new(env_required("AMQP_URL")?)
                    .with_exchange(env_or_default("AMQP_EXCHANGE", "queues"));
                if let Ok(delayed) = env_required("AMQP_DELAYED_EXCHANGE") {
                    config = config.with_delayed_exchange(delayed);
                }
                Ok(QueueConnectionConfig::Amqp(config))
            }
            "jetstream" | "nats" => Ok(QueueConnectionConfig::JetStream(
                JetStreamConfig::new(env_or_default("NATS_URL", "nats://127.0.0.1:4222"))
                    .with_stream(env_or_default("NATS_STREAM", "QUEUES")),
            )),
            other => Err(ConfigError::ParseError {
                key: "QUEUE_CONNECTION".to_string(),
                details: format!("unknown driver '{other}'"),
            }),
        }
    }
}

/// Where unique-job locks, overlap locks, rate-limit counters and
/// cancellation flags live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStoreConfig {
    /// Process-local. Locks are not seen by workers in other processes.
    Memory,
    Redis { url: String, prefix: String },
}

impl LockStoreConfig {
    pub fn driver(&self) -> &'static str {
        match self {
            LockStoreConfig::Memory => "memory",
            LockStoreConfig::Redis { .. } => "redis",
        }
    }

    /// Whether every worker process connecting with this config sees the
    /// same locks.
    pub fn is_shared(&self) -> bool {
        !matches!(self, LockStoreConfig::Memory)
    }

    /// Open the store. Pass the result to every worker and queue manager of
    /// the process.
    pub async fn connect(&self) -> Result<Arc<dyn LockStore>, QueueError> {
        match self {
            LockStoreConfig::Memory => Ok(Arc::new(MemoryLockStore::new())),
            LockStoreConfig::Redis { url, prefix } => {
                let client = redis::Client::open(url.as_str())?;
                let conn = ConnectionManager::new(client).await?;
                info!(prefix = %prefix, "Redis lock store connected");
                Ok(Arc::new(RedisLockStore::with_prefix(conn, prefix.clone())))
            }
        }
    }
}

impl FromEnv for LockStoreConfig {
    /// `QUEUE_LOCK_STORE` picks the store; without it Redis is used whenever
    /// `REDIS_URL` is set.
    fn from_env() -> Result<Self, ConfigError> {
        let redis_url = env_required("REDIS_URL").ok();
        let default = if redis_url.is_some() { "redis" } else { "memory" };
        let driver = env_or_default("QUEUE_LOCK_STORE", default).to_ascii_lowercase();
        match driver.as_str() {
            "memory" => Ok(LockStoreConfig::Memory),
            "redis" => Ok(LockStoreConfig::Redis {
                url: redis_url.ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?,
                prefix: env_or_default("QUEUE_LOCK_PREFIX", "queue:locks:"),
            }),
            other => Err(ConfigError::ParseError {
                key: "QUEUE_LOCK_STORE".to_string(),
                details: format!("unknown lock store '{other}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_options_builder() {
        let options = WorkerOptions::new("emails")
            .with_queues(["high", "default"])
            .with_max_jobs(10)
            .with_stop_when_empty(true);
        assert_eq!(options.name, "emails");
        assert_eq!(options.queues, vec!["high", "default"]);
        assert_eq!(options.max_jobs, 10);
        assert!(options.stop_when_empty);
        assert_eq!(options.sleep, Duration::from_secs(3));

        let unchanged = WorkerOptions::default().with_queues(Vec::<String>::new());
        assert_eq!(unchanged.queues, vec!["default"]);
    }

    #[test]
    fn test_worker_options_from_env() {
        temp_env::with_vars(
            [
                ("QUEUE_WORKER_NAME", Some("reports")),
                ("QUEUE_NAMES", Some("high,low")),
                ("QUEUE_TRIES", Some("3")),
                ("QUEUE_TIMEOUT_SECS", Some("0")),
                ("QUEUE_STOP_WHEN_EMPTY", Some("true")),
                ("QUEUE_MAX_JOBS", None),
            ],
            || {
                let options = WorkerOptions::from_env().unwrap();
                assert_eq!(options.name, "reports");
                assert_eq!(options.queues, vec!["high", "low"]);
                assert_eq!(options.default_tries, 3);
                assert_eq!(options.default_timeout, 0);
                assert!(options.stop_when_empty);
                assert_eq!(options.max_jobs, 0);
            },
        );
    }

    #[test]
    fn test_worker_options_invalid_value_names_variable() {
        temp_env::with_var("QUEUE_TRIES", Some("many"), || {
            let err = WorkerOptions::from_env().unwrap_err();
            assert!(err.to_string().contains("QUEUE_TRIES"));
        });
    }

    #[test]
    fn test_connection_config_from_env() {
        temp_env::with_vars(
            [
                ("QUEUE_CONNECTION", Some("redis")),
                ("REDIS_URL", Some("redis://127.0.0.1:6379")),
                ("QUEUE_REDIS_PREFIX", None),
                ("QUEUE_RETRY_AFTER_SECS", Some("90")),
                ("QUEUE_BLOCK_FOR_SECS", Some("2")),
            ],
            || match QueueConnectionConfig::from_env().unwrap() {
                QueueConnectionConfig::Redis { url, config } => {
                    assert_eq!(url, "redis://127.0.0.1:6379");
                    assert_eq!(config.prefix, "queues:");
                    assert_eq!(config.retry_after, Duration::from_secs(90));
                    assert_eq!(config.block_for, Some(Duration::from_secs(2)));
                }
                other => panic!("unexpected driver {}", other.driver()),
            },
        );
    }

    #[test]
    fn test_redis_pop_blocks_by_default() {
        temp_env::with_vars(
            [
                ("QUEUE_CONNECTION", Some("redis")),
                ("REDIS_URL", Some("redis://127.0.0.1:6379")),
                ("QUEUE_BLOCK_FOR_SECS", None),
            ],
            || match QueueConnectionConfig::from_env().unwrap() {
                QueueConnectionConfig::Redis { config, .. } => {
                    assert_eq!(config.block_for, Some(Duration::from_secs(1)));
                }
                other => panic!("unexpected driver {}", other.driver()),
            },
        );
        temp_env::with_vars(
            [
                ("QUEUE_CONNECTION", Some("redis")),
                ("REDIS_URL", Some("redis://127.0.0.1:6379")),
                ("QUEUE_BLOCK_FOR_SECS", Some("0")),
            ],
            || match QueueConnectionConfig::from_env().unwrap() {
                QueueConnectionConfig::Redis { config, .. } => assert_eq!(config.block_for, None),
                other => panic!("unexpected driver {}", other.driver()),
            },
        );
    }

    #[test]
    fn test_lock_store_follows_redis_url() {
        temp_env::with_vars(
            [
                ("QUEUE_LOCK_STORE", None),
                ("QUEUE_LOCK_PREFIX", None),
                ("REDIS_URL", Some("redis://cache:6379")),
            ],
            || {
                let config = LockStoreConfig::from_env().unwrap();
                assert!(config.is_shared());
                assert_eq!(
                    config,
                    LockStoreConfig::Redis {
                        url: "redis://cache:6379".to_string(),
                        prefix: "queue:locks:".to_string(),
                    }
                );
            },
        );
        temp_env::with_vars([("QUEUE_LOCK_STORE", None::<&str>), ("REDIS_URL", None)], || {
            let config = LockStoreConfig::from_env().unwrap();
            assert_eq!(config, LockStoreConfig::Memory);
            assert!(!config.is_shared());
        });
    }

    #[test]
    fn test_lock_store_redis_requires_url() {
        temp_env::with_vars(
            [("QUEUE_LOCK_STORE", Some("redis")), ("REDIS_URL", None)],
            || {
                let err = LockStoreConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("REDIS_URL"));
            },
        );
        temp_env::with_vars(
            [("QUEUE_LOCK_STORE", Some("memcached")), ("REDIS_URL", None)],
            || {
                let err = LockStoreConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("QUEUE_LOCK_STORE"));
            },
        );
    }

    #[tokio::test]
    async fn test_memory_lock_store_connects_without_a_server() {
        let locks = LockStoreConfig::Memory.connect().await.unwrap();
        assert!(locks.add("report", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!locks.add("report", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[test]
    fn test_connection_config_requires_url_and_known_driver() {
        temp_env::with_vars(
            [("QUEUE_CONNECTION", Some("database")), ("QUEUE_DATABASE_URL", None)],
            || {
                let err = QueueConnectionConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("QUEUE_DATABASE_URL"));
            },
        );
        temp_env::with_var("QUEUE_CONNECTION", Some("carrier-pigeon"), || {
            let err = QueueConnectionConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("QUEUE_CONNECTION"));
        });
        temp_env::with_var_unset("QUEUE_CONNECTION", || {
            let config = QueueConnectionConfig::from_env().unwrap();
            assert_eq!(config.driver(), "memory");
        });
    }
}
