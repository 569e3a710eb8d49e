//! Database queue tests on an in-memory SQLite database
//!
//! The same SQL runs against PostgreSQL in `containers_test.rs`.

use queue_worker::time::ManualClock;
use queue_worker::{
    DatabaseConfig, DatabaseQueue, HandlerRegistry, Job, JobError, QueueBackend, StopReason, Worker,
    WorkerOptions, handler_fn,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const START: i64 = 1_700_000_000;

async fn queue() -> DatabaseQueue {
    DatabaseQueue::connect("sqlite::memory:", DatabaseConfig::default())
        .await
        .expect("Failed to open in-memory database")
}

async fn queue_with_clock() -> (DatabaseQueue, ManualClock) {
    let clock = ManualClock::new(START);
    let queue = queue().await.with_clock(Arc::new(clock.clone()));
    (queue, clock)
}

fn numbered(n: u64) -> Job {
    Job::raw("orders.sync", json!({ "n": n }))
}

fn number(job: &Job) -> u64 {
    job.payload["n"].as_u64().unwrap_or_default()
}

#[tokio::test]
async fn test_each_job_is_claimed_by_exactly_one_consumer() {
    let queue = Arc::new(queue().await);
    for n in 0..5 {
        queue.push(&numbered(n), None).await.unwrap();
    }

    let pops = (0..10).map(|_| {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.pop(None).await })
    });
    let results = futures::future::join_all(pops).await;

    let claimed: Vec<String> = results
        .into_iter()
        .filter_map(|joined| joined.unwrap().unwrap())
        .map(|reserved| reserved.job.id)
        .collect();
    let unique: HashSet<&String> = claimed.iter().collect();

    assert_eq!(claimed.len(), 5);
    assert_eq!(unique.len(), 5);
    assert_eq!(queue.size(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_higher_priority_first_then_insertion_order() {
    let queue = queue().await;
    for (n, priority) in [5, 1, 5, 3].into_iter().enumerate() {
        queue
            .push(&numbered(n as u64).priority(priority), None)
            .await
            .unwrap();
    }

    let mut order = Vec::new();
    while let Some(reserved) = queue.pop(None).await.unwrap() {
        order.push(number(&reserved.job));
    }
    assert_eq!(order, vec![0, 2, 3, 1]);
}

#[tokio::test]
async fn test_delayed_job_becomes_available_after_delay() {
    let (queue, clock) = queue_with_clock().await;
    queue
        .later(&numbered(1), Duration::from_secs(30), None)
        .await
        .unwrap();

    assert_eq!(queue.size(None).await.unwrap(), 1);
    assert!(queue.pop(None).await.unwrap().is_none());

    clock.advance(29);
    assert!(queue.pop(None).await.unwrap().is_none());

    clock.advance(1);
    let reserved = queue.pop(None).await.unwrap().expect("job should be due");
    assert_eq!(number(&reserved.job), 1);
}

#[tokio::test]
async fn test_release_keeps_attempt_count() {
    let (queue, clock) = queue_with_clock().await;
    queue.push(&numbered(1).tries(5), None).await.unwrap();

    let mut reserved = queue.pop(None).await.unwrap().unwrap();
    assert_eq!(reserved.job.attempts(), 0);
    reserved.job.increment_attempts();
    queue
        .release(&reserved, Duration::from_secs(10))
        .await
        .unwrap();

    assert!(queue.pop(None).await.unwrap().is_none());
    clock.advance(10);
    let again = queue.pop(None).await.unwrap().unwrap();
    assert_eq!(again.job.id, reserved.job.id);
    assert_eq!(again.job.attempts(), 1);
}

#[tokio::test]
async fn test_queues_are_isolated_and_clear_is_idempotent() {
    let queue = queue().await;
    for n in 0..3 {
        queue.push(&numbered(n), Some("emails")).await.unwrap();
    }
    queue.push(&numbered(9).on_queue("reports"), None).await.unwrap();

    assert_eq!(queue.size(Some("emails")).await.unwrap(), 3);
    assert_eq!(queue.size(Some("reports")).await.unwrap(), 1);
    assert_eq!(queue.size(None).await.unwrap(), 0);

    assert_eq!(queue.clear(Some("emails")).await.unwrap(), 3);
    assert_eq!(queue.clear(Some("emails")).await.unwrap(), 0);
    assert_eq!(queue.size(Some("reports")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_undecodable_row_is_moved_to_failed_store() {
    let queue = queue().await;
    sqlx::query(
        "INSERT INTO jobs (queue, payload, attempts, priority, available_at, created_at) \
         VALUES ('default', '{\"not\":\"a job\"}', 0, 0, 0, 0)",
    )
    .execute(queue.pool())
    .await
    .unwrap();

    assert!(queue.pop(None).await.unwrap().is_none());
    assert_eq!(queue.size(None).await.unwrap(), 0);

    let failed = queue.failed_store().all().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload, "{\"not\":\"a job\"}");
}

#[tokio::test]
async fn test_failed_store_lifecycle() {
    let queue = queue().await;
    queue.push(&numbered(1), None).await.unwrap();
    queue.push(&numbered(2), None).await.unwrap();

    for _ in 0..2 {
        let reserved = queue.pop(None).await.unwrap().unwrap();
        let error = JobError::failed(format!("order {} rejected", number(&reserved.job)));
        queue.store_failed(&reserved, &error).await.unwrap();
    }

    let store = queue.failed_store();
    let records = store.all().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].summary(), "order 2 rejected", "newest first");
    assert_eq!(records[0].connection, "database");

    let found = store.find(&records[1].id).await.unwrap().expect("record should exist");
    assert_eq!(found.job_id, records[1].job_id);
    assert_eq!(number(&found.retryable_job().unwrap()), 1);

    assert!(store.forget(&records[1].id).await.unwrap());
    assert!(!store.forget(&records[1].id).await.unwrap());
    assert_eq!(store.flush().await.unwrap(), 1);
    assert!(store.all().await.unwrap().is_empty());
}

#[derive(Serialize, Deserialize)]
struct SyncOrder {
    order_id: u64,
}

impl queue_worker::JobPayload for SyncOrder {
    const JOB_TYPE: &'static str = "orders.sync_order";
}

#[tokio::test]
async fn test_worker_drains_database_queue() {
    let queue = Arc::new(queue().await);
    for order_id in [10, 11] {
        queue
            .push(&Job::new(&SyncOrder { order_id }).unwrap(), None)
            .await
            .unwrap();
    }
    queue
        .push(&Job::new(&SyncOrder { order_id: 0 }).unwrap().tries(2), None)
        .await
        .unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register_payload::<SyncOrder>(handler_fn(|order: SyncOrder| async move {
        if order.order_id == 0 {
            return Err(JobError::failed("order 0 does not exist"));
        }
        Ok(())
    }));

    let options = WorkerOptions::new("orders")
        .with_memory_limit_mb(0)
        .with_stop_when_empty(true);
    let worker = Worker::new(queue.clone(), registry, options);

    assert_eq!(worker.run().await, StopReason::Empty);
    assert_eq!(worker.processed(), 4);
    assert_eq!(queue.size(None).await.unwrap(), 0);

    let failed = queue.failed_store().all().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retryable_job().unwrap().decode::<SyncOrder>().unwrap().order_id, 0);
}
