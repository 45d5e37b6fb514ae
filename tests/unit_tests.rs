//! Cross-module behavior tests for the queue engine
//!
//! Exercises the engine surface against the in-memory store: state-machine
//! rejection, capacity handling, cancellation, load accounting, option
//! defaulting, and introspection.

use std::sync::{Arc, Mutex};

use relay_core::{
    EnqueueOptions, EventType, MemoryStore, Priority, QueueConfig, QueueError, TaskQueue,
    TaskStatus, WorkerOptions,
};

async fn default_queue() -> Arc<TaskQueue> {
    let store = Arc::new(MemoryStore::new());
    Arc::new(
        TaskQueue::new(store, QueueConfig::default())
            .await
            .unwrap(),
    )
}

fn worker(id: &str, capacity: u32) -> WorkerOptions {
    WorkerOptions {
        id: Some(id.to_string()),
        skills: vec![],
        capacity: Some(capacity),
        metadata: Default::default(),
    }
}

#[tokio::test]
async fn test_illegal_request_leaves_stored_record_untouched() {
    let queue = default_queue().await;
    let enqueued = queue.enqueue(EnqueueOptions::default()).await.unwrap();

    let before = queue.get_task(&enqueued.id).await.unwrap();
    // A pending task cannot complete or start.
    assert!(matches!(
        queue.complete(&enqueued.id, None).await.unwrap_err(),
        QueueError::IllegalTransition { .. }
    ));
    assert!(matches!(
        queue.start(&enqueued.id).await.unwrap_err(),
        QueueError::IllegalTransition { .. }
    ));

    let after = queue.get_task(&enqueued.id).await.unwrap();
    assert_eq!(
        serde_json::to_string(&before).unwrap(),
        serde_json::to_string(&after).unwrap()
    );
}

#[tokio::test]
async fn test_unknown_ids_surface_not_found() {
    let queue = default_queue().await;
    assert!(matches!(
        queue.get_task("ghost").await.unwrap_err(),
        QueueError::TaskNotFound(_)
    ));
    assert!(matches!(
        queue.claim(Some("ghost")).await.unwrap_err(),
        QueueError::WorkerNotFound(_)
    ));
}

#[tokio::test]
async fn test_directed_claim_against_full_worker_returns_none() {
    let queue = default_queue().await;
    queue.register_worker(worker("w1", 1)).await.unwrap();
    queue.enqueue(EnqueueOptions::default()).await.unwrap();
    queue.enqueue(EnqueueOptions::default()).await.unwrap();

    assert!(queue.claim(Some("w1")).await.unwrap().is_some());
    // At capacity: a null return, not an error.
    assert!(queue.claim(Some("w1")).await.unwrap().is_none());
    assert_eq!(queue.queue_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn test_arbitrated_claim_with_no_workers_keeps_task_pending() {
    let queue = default_queue().await;
    let enqueued = queue.enqueue(EnqueueOptions::default()).await.unwrap();

    assert!(queue.claim(None).await.unwrap().is_none());
    assert_eq!(
        queue.get_task(&enqueued.id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(queue.queue_depth().await.unwrap(), 1);
    assert_eq!(queue.stats().await.unwrap().processing, 0);
}

#[tokio::test]
async fn test_cancel_from_every_claimable_position() {
    let queue = default_queue().await;
    queue.register_worker(worker("w1", 4)).await.unwrap();

    // Pending.
    let pending = queue.enqueue(EnqueueOptions::default()).await.unwrap();
    let cancelled = queue.cancel(&pending.id, Some("no longer needed")).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(queue.queue_depth().await.unwrap(), 0);

    // Scheduled.
    let delayed = queue
        .enqueue(EnqueueOptions {
            delay_ms: Some(60_000),
            ..Default::default()
        })
        .await
        .unwrap();
    queue.cancel(&delayed.id, None).await.unwrap();
    assert_eq!(queue.stats().await.unwrap().scheduled, 0);

    // Held by a worker: cancellation releases the load.
    let held = queue.enqueue(EnqueueOptions::default()).await.unwrap();
    queue.claim(Some("w1")).await.unwrap().unwrap();
    queue.start(&held.id).await.unwrap();
    queue.cancel(&held.id, None).await.unwrap();
    assert_eq!(queue.get_worker("w1").await.unwrap().current_load, 0);
    assert_eq!(queue.stats().await.unwrap().processing, 0);

    // Terminal states reject cancellation.
    assert!(matches!(
        queue.cancel(&held.id, None).await.unwrap_err(),
        QueueError::IllegalTransition { .. }
    ));
}

#[tokio::test]
async fn test_cancelled_scheduled_task_is_not_promoted() {
    let queue = default_queue().await;
    let scheduler = relay_core::QueueScheduler::new(Arc::clone(&queue));

    let delayed = queue
        .enqueue(EnqueueOptions {
            delay_ms: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    queue.cancel(&delayed.id, None).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert_eq!(scheduler.promote_due().await.unwrap(), 0);
    assert_eq!(queue.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_load_matches_held_tasks_at_quiescence() {
    let queue = default_queue().await;
    queue.register_worker(worker("w1", 2)).await.unwrap();
    queue.register_worker(worker("w2", 2)).await.unwrap();

    for _ in 0..4 {
        queue.enqueue(EnqueueOptions::default()).await.unwrap();
    }
    let mut claimed = Vec::new();
    while let Some(task) = queue.claim(None).await.unwrap() {
        claimed.push(task);
    }
    assert_eq!(claimed.len(), 4);

    for worker in queue.list_workers().await.unwrap() {
        let held = claimed
            .iter()
            .filter(|t| t.assigned_to.as_deref() == Some(worker.id.as_str()))
            .count() as u32;
        assert_eq!(worker.current_load, held);
    }

    // Completing everything drains every load counter.
    for task in &claimed {
        queue.start(&task.id).await.unwrap();
        queue.complete(&task.id, None).await.unwrap();
    }
    for worker in queue.list_workers().await.unwrap() {
        assert_eq!(worker.current_load, 0);
    }
}

#[tokio::test]
async fn test_progress_clamps_and_never_regresses() {
    let queue = default_queue().await;
    queue.register_worker(worker("w1", 1)).await.unwrap();

    let enqueued = queue.enqueue(EnqueueOptions::default()).await.unwrap();
    queue.claim(Some("w1")).await.unwrap().unwrap();
    queue.start(&enqueued.id).await.unwrap();

    let updated = queue
        .progress(&enqueued.id, 50, Some(serde_json::json!({"stage": "render"})))
        .await
        .unwrap();
    assert_eq!(updated.progress, 50);
    assert_eq!(
        updated.progress_data.get("stage"),
        Some(&serde_json::json!("render"))
    );

    // Lower reports do not move the needle backwards.
    let updated = queue.progress(&enqueued.id, 30, None).await.unwrap();
    assert_eq!(updated.progress, 50);

    let updated = queue.progress(&enqueued.id, 120, None).await.unwrap();
    assert_eq!(updated.progress, 100);

    queue.complete(&enqueued.id, None).await.unwrap();
    assert!(queue.progress(&enqueued.id, 10, None).await.is_err());
}

#[tokio::test]
async fn test_enqueue_fills_defaults_and_keeps_unknown_fields() {
    let queue = default_queue().await;

    let options: EnqueueOptions = serde_json::from_value(serde_json::json!({
        "type": "report",
        "tenant": "acme",
        "batch": 7
    }))
    .unwrap();
    let enqueued = queue.enqueue(options).await.unwrap();

    assert_eq!(enqueued.priority, Priority::Medium);
    assert_eq!(enqueued.max_retries, 3);
    assert_eq!(enqueued.retry_delay_ms, 1_000);
    assert_eq!(enqueued.task_type, "report");
    assert!(!enqueued.id.is_empty());
    assert_eq!(enqueued.metadata.get("tenant"), Some(&serde_json::json!("acme")));
    assert_eq!(enqueued.metadata.get("batch"), Some(&serde_json::json!(7)));
}

#[tokio::test]
async fn test_permanent_failure_without_dead_letter_queue() {
    let store = Arc::new(MemoryStore::new());
    let queue = TaskQueue::new(
        store,
        QueueConfig {
            max_retries: 0,
            dead_letter_enabled: false,
            ..QueueConfig::default()
        },
    )
    .await
    .unwrap();

    queue.register_worker(worker("w1", 1)).await.unwrap();
    let enqueued = queue.enqueue(EnqueueOptions::default()).await.unwrap();
    queue.claim(Some("w1")).await.unwrap().unwrap();
    queue.start(&enqueued.id).await.unwrap();

    let failed = queue.fail(&enqueued.id, "boom").await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(queue.dead_letter_entries(10).await.unwrap().is_empty());
    assert_eq!(queue.get_worker("w1").await.unwrap().current_load, 0);
}

#[tokio::test]
async fn test_round_robin_hint_rotates_across_workers() {
    let queue = default_queue().await;
    queue.register_worker(worker("w1", 4)).await.unwrap();
    queue.register_worker(worker("w2", 4)).await.unwrap();

    let mut assignees = Vec::new();
    for _ in 0..4 {
        queue
            .enqueue(EnqueueOptions {
                routing_hint: Some(relay_core::RoutingStrategy::RoundRobin),
                ..Default::default()
            })
            .await
            .unwrap();
        let claimed = queue.claim(None).await.unwrap().unwrap();
        assignees.push(claimed.assigned_to.unwrap());
    }
    assert_eq!(assignees, vec!["w1", "w2", "w1", "w2"]);
}

#[tokio::test]
async fn test_heartbeat_revives_an_offline_worker() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(
        TaskQueue::new(
            store,
            QueueConfig {
                heartbeat_timeout_ms: 50,
                ..QueueConfig::default()
            },
        )
        .await
        .unwrap(),
    );
    let scheduler = relay_core::QueueScheduler::new(Arc::clone(&queue));

    queue.register_worker(worker("w1", 1)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    scheduler.expire_workers().await.unwrap();
    assert_eq!(
        queue.get_worker("w1").await.unwrap().status,
        relay_core::WorkerStatus::Offline
    );

    let revived = queue.heartbeat("w1").await.unwrap();
    assert_eq!(revived.status, relay_core::WorkerStatus::Idle);
}

#[tokio::test]
async fn test_subscription_handle_unsubscribes() {
    let queue = default_queue().await;

    let seen = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&seen);
    let subscription = queue.on_event(move |event| {
        if event.event_type == EventType::TaskEnqueued {
            *counter.lock().unwrap() += 1;
        }
    });

    queue.enqueue(EnqueueOptions::default()).await.unwrap();
    queue.off_event(subscription);
    queue.enqueue(EnqueueOptions::default()).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_stats_reflect_every_position_structure() {
    let queue = default_queue().await;
    queue.register_worker(worker("w1", 4)).await.unwrap();

    queue.enqueue(EnqueueOptions::default()).await.unwrap();
    queue
        .enqueue(EnqueueOptions {
            delay_ms: Some(60_000),
            ..Default::default()
        })
        .await
        .unwrap();
    queue.enqueue(EnqueueOptions::default()).await.unwrap();
    queue.claim(Some("w1")).await.unwrap().unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.scheduled, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(stats.workers, 1);

    let metrics = queue.metrics().export();
    assert!(metrics.contains("relay_tasks_enqueued_total 3"));
    assert!(metrics.contains("relay_claims_total 1"));
}
