//! Redis backend tests.
//!
//! These need a Docker daemon for the Redis testcontainer and are ignored
//! by default. Run with `cargo test -- --ignored`.

mod common;

use common::{data, drain, CallCounter, TestRedis};
use meetsync_jobs::{
    Backoff, JobOptions, JobState, ProcessorError, ProcessorRegistry, QueueRuntime, RepeatOptions,
};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_runtime_connects() {
    let redis = TestRedis::new().await;
    let runtime = QueueRuntime::connect(redis.config.clone()).await;

    assert_eq!(runtime.backend_name(), "redis");
    assert!(runtime.degraded_reason().is_none());
    assert!(runtime.ping().await);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_idempotent_enqueue_and_completion() {
    let redis = TestRedis::new().await;
    let runtime = QueueRuntime::connect(redis.config.clone()).await;
    let email = runtime.email().unwrap();

    let counter = CallCounter::new();
    let calls = counter.clone();
    let worker = runtime
        .worker(
            "email",
            ProcessorRegistry::new().handle("send_verification_email", move |_ctx, _data| {
                let calls = calls.clone();
                async move {
                    calls.hit();
                    Ok(json!({ "messageId": "m-1" }))
                }
            }),
        )
        .unwrap();

    let first = email.send_verification_email("a@x.com", "123456").await.unwrap();
    let second = email.send_verification_email("a@x.com", "123456").await.unwrap();
    let handle = first.unwrap();
    assert!(second.is_none());

    let details = email.queue().get_job(&handle.id).await.unwrap().unwrap();
    assert_eq!(details.state, JobState::Waiting);
    assert_eq!(details.priority, 10);

    let results = drain(&worker).await;
    assert_eq!(results.len(), 1);
    assert_eq!(counter.count(), 1);

    let details = email.queue().get_job(&handle.id).await.unwrap().unwrap();
    assert_eq!(details.state, JobState::Completed);
    assert_eq!(details.return_value, Some(json!({ "messageId": "m-1" })));

    assert!(email
        .send_verification_email("a@x.com", "123456")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_retry_then_fail() {
    let redis = TestRedis::new().await;
    let runtime = QueueRuntime::connect(redis.config.clone()).await;
    let queue = runtime.queue("external-api").unwrap();

    let worker = runtime
        .worker(
            "external-api",
            ProcessorRegistry::new().handle("openai", |_ctx, _data| async move {
                Err(ProcessorError::recoverable("upstream timeout"))
            }),
        )
        .unwrap();

    let handle = queue
        .add_job(
            "openai",
            data("summary-1"),
            JobOptions::new()
                .attempts(2)
                .backoff(Backoff::fixed(Duration::from_millis(50))),
        )
        .await
        .unwrap()
        .unwrap();

    assert!(!worker.process_next().await.unwrap().unwrap().success);
    let details = queue.get_job(&handle.id).await.unwrap().unwrap();
    assert_eq!(details.state, JobState::Delayed);
    assert_eq!(details.attempts_made, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!worker.process_next().await.unwrap().unwrap().success);

    let details = queue.get_job(&handle.id).await.unwrap().unwrap();
    assert_eq!(details.state, JobState::Failed);
    assert_eq!(details.attempts_made, 2);
    assert_eq!(details.failed_reason.as_deref(), Some("upstream timeout"));

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_pause_resume_and_priority() {
    let redis = TestRedis::new().await;
    let runtime = QueueRuntime::connect(redis.config.clone()).await;
    let queue = runtime.queue("meeting").unwrap();

    queue.pause_queue().await.unwrap();
    queue
        .add_job("sync_record", data("low"), JobOptions::new().with_priority(1))
        .await
        .unwrap();
    queue
        .add_job("sync_record", data("high"), JobOptions::new().with_priority(10))
        .await
        .unwrap();

    assert!(queue.is_paused().await);
    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.paused, 2);
    assert_eq!(stats.waiting, 0);

    let worker = runtime
        .worker(
            "meeting",
            ProcessorRegistry::new().handle("sync_record", |_ctx, data| async move {
                Ok(json!({ "key": data.idempotency_key }))
            }),
        )
        .unwrap();
    assert!(worker.process_next().await.unwrap().is_none());

    queue.resume_queue().await.unwrap();
    let results = drain(&worker).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].data, Some(json!({ "key": "high" })));
    assert_eq!(results[1].data, Some(json!({ "key": "low" })));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_repeatable_registration() {
    let redis = TestRedis::new().await;
    let runtime = QueueRuntime::connect(redis.config.clone()).await;
    let queue = runtime.queue("external-api").unwrap();

    let key = queue
        .add_repeatable_job(
            "lark",
            data("lark-sync"),
            RepeatOptions::cron("0 * * * *").in_timezone("Asia/Shanghai"),
            JobOptions::new(),
        )
        .await
        .unwrap()
        .unwrap();

    let listed = queue.list_repeatable().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, key);
    assert_eq!(listed[0].timezone.as_deref(), Some("Asia/Shanghai"));

    assert!(queue.remove_repeatable(&key).await.unwrap());
    assert!(queue.list_repeatable().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_monitor_health() {
    let redis = TestRedis::new().await;
    let runtime = QueueRuntime::connect(redis.config.clone()).await;
    let queue = runtime.queue("email").unwrap();

    queue.add_job("send_email", data("e1"), JobOptions::new()).await.unwrap();

    let health = runtime.monitor().get_queue_health("email").await;
    assert!(!health.healthy);
    assert!(health
        .issues
        .iter()
        .any(|issue| issue.contains("workers may be down")));

    let system = runtime.monitor().get_system_health().await;
    assert!(!system.healthy);
    assert_eq!(system.queues.len(), 3);
    assert_eq!(system.totals.waiting, 1);
}
