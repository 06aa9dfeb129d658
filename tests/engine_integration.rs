//! End-to-end tests for the queue engine.
//!
//! These tests run against a real Redis instance.
//! Run with: REDIS_HOST=127.0.0.1 cargo test --test engine_integration -- --ignored
//!
//! Each test uses its own logical database and flushes it first, so tests
//! can run concurrently without interfering.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use taskforge::{
    HandlerError, QueueConfig, StreamEmitter, TaskContext, TaskOptions, TaskQueue, TaskStatus,
};

fn test_config(db: i64) -> QueueConfig {
    let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("REDIS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(6379);

    QueueConfig::new()
        .with_host(host)
        .with_port(port)
        .with_db(db)
        .with_worker_id(format!("test-worker-{db}"))
}

async fn fresh_engine(db: i64) -> TaskQueue {
    let config = test_config(db);

    let client = redis::Client::open(config.redis_url()).expect("redis client");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("redis connection (is Redis running?)");
    redis::cmd("FLUSHDB")
        .query_async::<_, ()>(&mut conn)
        .await
        .expect("flush test database");

    TaskQueue::connect(config).await.expect("engine connect")
}

async fn add_handler(_ctx: TaskContext, data: Value) -> Result<Value, HandlerError> {
    let a = data["a"]
        .as_i64()
        .ok_or_else(|| HandlerError::failed("missing a"))?;
    let b = data["b"]
        .as_i64()
        .ok_or_else(|| HandlerError::failed("missing b"))?;
    Ok(json!({ "sum": a + b }))
}

async fn stream_words_handler(
    _ctx: TaskContext,
    data: Value,
    emitter: StreamEmitter,
) -> Result<(), HandlerError> {
    let text = data["text"].as_str().unwrap_or_default().to_string();
    for word in text.split_whitespace() {
        emitter.emit(json!(word)).await?;
    }
    Ok(())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test engine_integration -- --ignored
async fn test_arithmetic_round_trip() {
    let engine = fresh_engine(15).await;

    engine
        .register_task("add", Arc::new(add_handler), TaskOptions::new())
        .await
        .expect("register add");

    let handle = engine.start_workers(1);

    let task = engine
        .enqueue("add", json!({ "a": 5, "b": 3 }))
        .await
        .expect("enqueue");

    let result = engine
        .wait_result(&task.task_id, Duration::from_secs(10))
        .await
        .expect("result within 10s");
    assert_eq!(result, json!({ "sum": 8 }));

    let status = engine.status(&task.task_id).await.expect("status");
    assert_eq!(status, Some(TaskStatus::Completed));

    handle.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_streaming_words_in_order() {
    let engine = fresh_engine(14).await;

    engine
        .register_streaming_task(
            "stream_words",
            Arc::new(stream_words_handler),
            TaskOptions::new(),
        )
        .await
        .expect("register stream_words");

    let handle = engine.start_workers(1);

    let task = engine
        .enqueue("stream_words", json!({ "text": "The quick brown fox" }))
        .await
        .expect("enqueue");
    assert!(task.stream, "streaming registration marks the task");

    let mut reader = engine.stream_results(&task.task_id, Duration::from_secs(10));
    let mut words = Vec::new();
    while let Some(value) = reader.next().await.expect("stream read") {
        words.push(value.as_str().expect("string entry").to_string());
    }

    assert_eq!(words, vec!["The", "quick", "brown", "fox"]);
    assert_eq!(reader.combined_result(), "Thequickbrownfox");

    let status = engine.status(&task.task_id).await.expect("status");
    assert_eq!(status, Some(TaskStatus::Completed));

    handle.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_retry_budget_until_success() {
    let config = test_config(13).with_delay_seconds(1);
    let engine = {
        // Flush first via a throwaway engine on the same db.
        fresh_engine(13).await;
        TaskQueue::connect(config).await.expect("engine connect")
    };

    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    engine
        .register_task(
            "flaky",
            Arc::new(move |_ctx: TaskContext, _data: Value| {
                let attempts = Arc::clone(&seen);
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt < 3 {
                        Err(HandlerError::failed(format!("attempt {attempt} failed")))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            }),
            TaskOptions::new().with_retries(2),
        )
        .await
        .expect("register flaky");

    let handle = engine.start_workers(1);

    let task = engine.enqueue("flaky", json!({})).await.expect("enqueue");

    // Two failures each schedule a delayed re-enqueue before the third
    // attempt succeeds.
    let mut delayed_seen = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let result = loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "task did not complete within the test window"
        );
        match engine
            .wait_result(&task.task_id, Duration::from_millis(200))
            .await
        {
            Ok(value) => break value,
            Err(taskforge::WaitError::Timeout { .. })
            | Err(taskforge::WaitError::Failed { .. }) => {
                // Failures are transient here: each schedules a delayed
                // re-enqueue that overwrites the terminal record on re-run.
                let pending = engine.store().delayed_len().await.expect("delayed len");
                delayed_seen = delayed_seen.max(pending);
            }
            Err(e) => panic!("unexpected wait error: {e}"),
        }
    };

    assert_eq!(result, json!("ok"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(delayed_seen >= 1, "delayed re-enqueues were observable");

    let status = engine.status(&task.task_id).await.expect("status");
    assert_eq!(status, Some(TaskStatus::Completed));

    handle.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_cancel_queued_task() {
    // No worker runs here: the task stays queued until cancelled.
    let engine = fresh_engine(12).await;

    let task = engine
        .enqueue("slow", json!({ "payload": "never runs" }))
        .await
        .expect("enqueue");

    let found = engine.cancel(&task.task_id).await.expect("cancel");
    assert!(found);

    let status = engine.status(&task.task_id).await.expect("status");
    assert_eq!(status, Some(TaskStatus::Cancelled));

    let queued = engine.all_queued().await.expect("queue snapshot");
    assert!(
        queued.iter().all(|t| t.task_id != task.task_id),
        "cancelled task must leave the queue"
    );

    // Cancel is idempotent.
    assert!(engine.cancel(&task.task_id).await.expect("second cancel"));
}

#[tokio::test]
#[ignore]
async fn test_reaper_requeues_stuck_task() {
    let engine = fresh_engine(11).await;

    // Simulate a crashed worker: a processing-set member whose record
    // started five minutes ago.
    let mut task = engine
        .enqueue("stuck", json!({ "n": 1 }))
        .await
        .expect("enqueue");
    engine
        .remove_from_queue(&task.task_id)
        .await
        .expect("pop simulation");

    task.status = TaskStatus::Processing;
    task.started_at = Some(taskforge::task::epoch_seconds() - 300.0);
    let json = task.to_json().expect("serialize");
    engine
        .store()
        .set_task(&task.task_id, &json, 3_600)
        .await
        .expect("persist stuck record");
    assert!(engine
        .store()
        .processing_add(&task.task_id)
        .await
        .expect("claim"));

    // An orphaned member (no record at all) should be dropped too.
    assert!(engine
        .store()
        .processing_add("orphan-task-id")
        .await
        .expect("orphan member"));

    let report = engine.run_reaper().await.expect("reaper run");
    assert_eq!(report.requeued_tasks, 1);

    let members = engine
        .store()
        .processing_members()
        .await
        .expect("members");
    assert!(members.is_empty(), "processing set must be drained");

    let queued = engine.all_queued().await.expect("queue snapshot");
    let requeued = queued
        .iter()
        .find(|t| t.task_id == task.task_id)
        .expect("stuck task back in the queue");
    assert_eq!(requeued.status, TaskStatus::Queued);

    let status = engine.status(&task.task_id).await.expect("status");
    assert_eq!(status, Some(TaskStatus::Queued));
}

#[tokio::test]
#[ignore]
async fn test_unknown_task_is_pushed_back() {
    let engine = fresh_engine(10).await;

    // The worker has no handlers, so anything popped must be pushed back
    // with status unchanged.
    let handle = engine.start_workers(1);

    let task = engine
        .enqueue("nobody_serves_this", json!({}))
        .await
        .expect("enqueue");

    tokio::time::sleep(Duration::from_secs(3)).await;

    let queued = engine.all_queued().await.expect("queue snapshot");
    let still_there = queued
        .iter()
        .find(|t| t.task_id == task.task_id)
        .expect("task must not be dropped");
    assert_eq!(still_there.status, TaskStatus::Queued);

    handle.shutdown().await;
}
