//! End-to-end scenarios for the queue core
//!
//! Every test runs against the in-memory store and ticks the scheduler
//! sweeps directly, so the suite is deterministic and hermetic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_core::{
    EnqueueOptions, EventType, KvStore, MemoryStore, Priority, QueueConfig, QueueScheduler,
    TaskQueue, TaskStatus, WorkerOptions, WorkerStatus,
};

async fn queue_with(config: QueueConfig) -> (Arc<TaskQueue>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let queue = TaskQueue::new(Arc::clone(&store) as Arc<dyn KvStore>, config)
        .await
        .unwrap();
    (Arc::new(queue), store)
}

async fn default_queue() -> (Arc<TaskQueue>, Arc<MemoryStore>) {
    queue_with(QueueConfig::default()).await
}

fn worker(id: &str, capacity: u32, skills: &[&str]) -> WorkerOptions {
    WorkerOptions {
        id: Some(id.to_string()),
        skills: skills.iter().map(|s| s.to_string()).collect(),
        capacity: Some(capacity),
        metadata: Default::default(),
    }
}

fn task() -> EnqueueOptions {
    EnqueueOptions::default()
}

#[tokio::test]
async fn test_happy_path_lifecycle_and_event_order() {
    let (queue, store) = default_queue().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    queue.on_event(move |event| {
        if event.task_id.is_some() {
            sink.lock().unwrap().push(event.event_type);
        }
    });

    queue.register_worker(worker("w1", 3, &[])).await.unwrap();

    let enqueued = queue
        .enqueue(EnqueueOptions {
            payload: Some(serde_json::json!({"x": 1})),
            ..task()
        })
        .await
        .unwrap();
    assert_eq!(enqueued.status, TaskStatus::Pending);

    let claimed = queue.claim(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, enqueued.id);
    assert_eq!(claimed.status, TaskStatus::Assigned);
    assert_eq!(claimed.assigned_to.as_deref(), Some("w1"));

    let started = queue.start(&claimed.id).await.unwrap();
    assert_eq!(started.status, TaskStatus::Processing);
    assert!(started.started_at_ms.is_some());

    let completed = queue
        .complete(&claimed.id, Some(serde_json::json!("ok")))
        .await
        .unwrap();
    assert_eq!(completed.status, TaskStatus::Completed);
    assert_eq!(completed.assigned_to, None);

    assert_eq!(queue.get_worker("w1").await.unwrap().current_load, 0);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            EventType::TaskEnqueued,
            EventType::TaskAssigned,
            EventType::TaskStarted,
            EventType::TaskCompleted,
        ]
    );

    // Every emitted event also landed on the shared stream.
    assert!(!store.stream_entries("queue:stream").is_empty());
}

#[tokio::test]
async fn test_retry_backoff_then_dead_letter() {
    let (queue, _) = queue_with(QueueConfig {
        max_retries: 2,
        base_retry_delay_ms: 10,
        ..QueueConfig::default()
    })
    .await;
    let scheduler = QueueScheduler::new(Arc::clone(&queue));

    let delays = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delays);
    queue.on_event(move |event| {
        if event.event_type == EventType::TaskRetried {
            sink.lock()
                .unwrap()
                .push(event.payload["delay_ms"].as_u64().unwrap());
        }
    });

    queue.register_worker(worker("w1", 1, &[])).await.unwrap();
    let enqueued = queue.enqueue(task()).await.unwrap();

    // First two failures reschedule with doubling delays.
    for wait_ms in [15u64, 25] {
        let claimed = queue.claim(None).await.unwrap().unwrap();
        queue.start(&claimed.id).await.unwrap();
        let failed = queue.fail(&claimed.id, "boom").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Scheduled);

        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        assert_eq!(scheduler.promote_due().await.unwrap(), 1);
    }

    // The third failure exhausts the budget.
    let claimed = queue.claim(None).await.unwrap().unwrap();
    queue.start(&claimed.id).await.unwrap();
    let dead = queue.fail(&claimed.id, "boom").await.unwrap();
    assert_eq!(dead.status, TaskStatus::Dead);
    assert_eq!(dead.retry_count, 3);
    assert_eq!(dead.dead_letter_reason.as_deref(), Some("boom"));

    assert_eq!(*delays.lock().unwrap(), vec![10, 20]);

    let entries = queue.dead_letter_entries(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task.id, enqueued.id);
    assert_eq!(entries[0].error_history.len(), 3);
    assert_eq!(entries[0].reason, "boom");

    // Exhausted tasks release their worker.
    assert_eq!(queue.get_worker("w1").await.unwrap().current_load, 0);
    assert_eq!(queue.stats().await.unwrap().processing, 0);
}

#[tokio::test]
async fn test_critical_task_claimed_before_earlier_low_task() {
    let (queue, _) = default_queue().await;
    queue.register_worker(worker("w1", 4, &[])).await.unwrap();

    let low = queue
        .enqueue(EnqueueOptions {
            priority: Some(Priority::Low),
            ..task()
        })
        .await
        .unwrap();
    let critical = queue
        .enqueue(EnqueueOptions {
            priority: Some(Priority::Critical),
            ..task()
        })
        .await
        .unwrap();

    let first = queue.claim(None).await.unwrap().unwrap();
    assert_eq!(first.id, critical.id);
    let second = queue.claim(None).await.unwrap().unwrap();
    assert_eq!(second.id, low.id);
}

#[tokio::test]
async fn test_fifo_within_a_priority_band() {
    let (queue, _) = default_queue().await;
    queue.register_worker(worker("w1", 4, &[])).await.unwrap();

    let first = queue.enqueue(task()).await.unwrap();
    let second = queue.enqueue(task()).await.unwrap();

    assert_eq!(queue.claim(None).await.unwrap().unwrap().id, first.id);
    assert_eq!(queue.claim(None).await.unwrap().unwrap().id, second.id);
}

#[tokio::test]
async fn test_sticky_tasks_share_a_worker_and_fail_over() {
    let (queue, store) = default_queue().await;
    queue.register_worker(worker("w1", 3, &[])).await.unwrap();
    queue.register_worker(worker("w2", 3, &[])).await.unwrap();

    let sticky = || EnqueueOptions {
        sticky_key: Some("K".to_string()),
        ..task()
    };

    queue.enqueue(sticky()).await.unwrap();
    let first = queue.claim(None).await.unwrap().unwrap();
    let winner = first.assigned_to.clone().unwrap();
    queue.start(&first.id).await.unwrap();
    queue.complete(&first.id, None).await.unwrap();

    // Same key, same worker while it remains eligible.
    queue.enqueue(sticky()).await.unwrap();
    let second = queue.claim(None).await.unwrap().unwrap();
    assert_eq!(second.assigned_to.as_deref(), Some(winner.as_str()));
    queue.start(&second.id).await.unwrap();
    queue.complete(&second.id, None).await.unwrap();

    // The bound worker disappears; the key rebinds to the survivor.
    queue.unregister_worker(&winner).await.unwrap();
    let survivor = if winner == "w1" { "w2" } else { "w1" };

    queue.enqueue(sticky()).await.unwrap();
    let third = queue.claim(None).await.unwrap().unwrap();
    assert_eq!(third.assigned_to.as_deref(), Some(survivor));

    let bound = store.hash_get("queue:sticky:map", "K").await.unwrap();
    assert_eq!(bound.as_deref(), Some(survivor));
}

#[tokio::test]
async fn test_skill_routing_matches_and_gates() {
    let (queue, _) = default_queue().await;
    queue
        .register_worker(worker("w_ts", 2, &["typescript"]))
        .await
        .unwrap();
    queue
        .register_worker(worker("w_py", 2, &["python"]))
        .await
        .unwrap();

    queue
        .enqueue(EnqueueOptions {
            required_skills: vec!["typescript".to_string()],
            ..task()
        })
        .await
        .unwrap();
    let claimed = queue.claim(None).await.unwrap().unwrap();
    assert_eq!(claimed.assigned_to.as_deref(), Some("w_ts"));

    // Nobody holds the skill: the task waits rather than landing on an
    // unskilled worker.
    let unroutable = queue
        .enqueue(EnqueueOptions {
            required_skills: vec!["ml".to_string()],
            ..task()
        })
        .await
        .unwrap();
    assert!(queue.claim(None).await.unwrap().is_none());
    assert_eq!(
        queue.get_task(&unroutable.id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(queue.queue_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn test_dead_worker_tasks_are_reassigned() {
    let (queue, _) = queue_with(QueueConfig {
        heartbeat_timeout_ms: 100,
        ..QueueConfig::default()
    })
    .await;
    let scheduler = QueueScheduler::new(Arc::clone(&queue));

    queue.register_worker(worker("w1", 1, &[])).await.unwrap();
    let enqueued = queue.enqueue(task()).await.unwrap();
    let claimed = queue.claim(Some("w1")).await.unwrap().unwrap();
    assert_eq!(claimed.id, enqueued.id);
    queue.start(&claimed.id).await.unwrap();

    // The worker goes silent past the liveness window.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(scheduler.expire_workers().await.unwrap(), 1);

    assert_eq!(queue.get_worker("w1").await.unwrap().status, WorkerStatus::Offline);
    let reassigned = queue.get_task(&enqueued.id).await.unwrap();
    assert_eq!(reassigned.status, TaskStatus::Scheduled);
    assert_eq!(reassigned.assigned_to, None);
    assert_eq!(
        reassigned.last_error.as_deref(),
        Some("worker heartbeat timeout")
    );
}

#[tokio::test]
async fn test_dead_worker_with_no_budget_dead_letters() {
    let (queue, _) = queue_with(QueueConfig {
        heartbeat_timeout_ms: 100,
        max_retries: 0,
        ..QueueConfig::default()
    })
    .await;
    let scheduler = QueueScheduler::new(Arc::clone(&queue));

    queue.register_worker(worker("w1", 1, &[])).await.unwrap();
    let enqueued = queue.enqueue(task()).await.unwrap();
    let claimed = queue.claim(Some("w1")).await.unwrap().unwrap();
    queue.start(&claimed.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    scheduler.expire_workers().await.unwrap();

    assert_eq!(
        queue.get_task(&enqueued.id).await.unwrap().status,
        TaskStatus::Dead
    );
    let entries = queue.dead_letter_entries(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "worker heartbeat timeout");
}

#[tokio::test]
async fn test_unregister_requeues_held_tasks() {
    let (queue, _) = default_queue().await;
    queue.register_worker(worker("w1", 2, &[])).await.unwrap();

    let enqueued = queue.enqueue(task()).await.unwrap();
    queue.claim(Some("w1")).await.unwrap().unwrap();

    queue.unregister_worker("w1").await.unwrap();

    let requeued = queue.get_task(&enqueued.id).await.unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.assigned_to, None);
    assert_eq!(queue.queue_depth().await.unwrap(), 1);
    assert!(queue.get_worker("w1").await.is_err());
    assert!(queue.list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replayed_dead_letter_behaves_like_fresh_task() {
    let (queue, _) = queue_with(QueueConfig {
        max_retries: 0,
        base_retry_delay_ms: 1,
        ..QueueConfig::default()
    })
    .await;

    queue.register_worker(worker("w1", 1, &[])).await.unwrap();
    let enqueued = queue.enqueue(task()).await.unwrap();

    let claimed = queue.claim(None).await.unwrap().unwrap();
    queue.start(&claimed.id).await.unwrap();
    queue.fail(&claimed.id, "boom").await.unwrap();
    assert_eq!(
        queue.get_task(&enqueued.id).await.unwrap().status,
        TaskStatus::Dead
    );

    let replayed = queue.replay_dead_letter(&enqueued.id).await.unwrap();
    assert_eq!(replayed.status, TaskStatus::Pending);
    assert_eq!(replayed.retry_count, 0);
    assert_eq!(replayed.last_error, None);
    assert!(replayed.error_history.is_empty());
    assert!(queue.dead_letter_entries(10).await.unwrap().is_empty());

    // The replayed task claims and completes like a fresh one.
    let reclaimed = queue.claim(None).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, enqueued.id);
    queue.start(&reclaimed.id).await.unwrap();
    let done = queue.complete(&reclaimed.id, None).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    // Replaying an id that is not on the list fails.
    assert!(queue.replay_dead_letter(&enqueued.id).await.is_err());
}

#[tokio::test]
async fn test_scheduler_loops_promote_in_background() {
    let (queue, _) = queue_with(QueueConfig {
        poll_interval_ms: 10,
        ..QueueConfig::default()
    })
    .await;
    let scheduler = QueueScheduler::new(Arc::clone(&queue));
    scheduler.start();

    let delayed = queue
        .enqueue(EnqueueOptions {
            delay_ms: Some(20),
            ..task()
        })
        .await
        .unwrap();
    assert_eq!(delayed.status, TaskStatus::Scheduled);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        queue.get_task(&delayed.id).await.unwrap().status,
        TaskStatus::Pending
    );

    scheduler.shutdown().await;
}
