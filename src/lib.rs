//! # Relay - Distributed Task Queue Core
//!
//! Relay is a distributed task queue with pluggable work-distribution
//! policies, backed by a shared key/value and sorted-set store. Producers
//! submit typed task descriptors, long-lived workers register skills and
//! capacity, and the queue assigns each task to exactly one healthy worker,
//! tracks lifecycle progress, retries failures with exponential backoff,
//! and parks permanently failed tasks on a dead-letter list for inspection
//! or replay.
//!
//! ## Components
//!
//! - **KV adapter** ([`kv`]): the primitive contract with the backing
//!   store, with Redis and in-memory implementations
//! - **Task state machine** ([`lifecycle`]): the legal-transition table and
//!   durable task storage
//! - **Worker registry** ([`registry`]): registration, heartbeats,
//!   liveness, load accounting
//! - **Distribution policies** ([`distribution`]): round-robin, load-based,
//!   skill-based, and sticky routing
//! - **Queue engine** ([`engine`]): the handle exposing enqueue, claim,
//!   completion, failure, and cancellation
//! - **Scheduler loops** ([`scheduler`]): due-task promotion and worker
//!   expiry
//! - **Event fan-out** ([`events`]): in-process subscribers plus the shared
//!   event stream
//!
//! ## Delivery guarantee
//!
//! At-least-once. A worker crash mid-execution reassigns the task after the
//! heartbeat timeout; duplicate suppression is the task handler's business.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_core::{EnqueueOptions, MemoryStore, QueueConfig, TaskQueue, WorkerOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let queue = TaskQueue::new(store, QueueConfig::default()).await?;
//!
//!     queue.register_worker(WorkerOptions {
//!         id: Some("w1".into()),
//!         capacity: Some(4),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//!     let task = queue.enqueue(EnqueueOptions {
//!         task_type: Some("render".into()),
//!         payload: Some(serde_json::json!({"frame": 1})),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//!     if let Some(claimed) = queue.claim(None).await? {
//!         queue.start(&claimed.id).await?;
//!         queue.complete(&claimed.id, Some(serde_json::json!("ok"))).await?;
//!     }
//!     println!("done: {}", task.id);
//!     Ok(())
//! }
//! ```

pub mod distribution;
pub mod engine;
pub mod events;
pub mod kv;
pub mod lifecycle;
pub mod memory_store;
pub mod metrics;
pub mod redis_store;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod utils;

pub use engine::TaskQueue;
pub use events::{EventBus, EventType, QueueEvent, Subscription};
pub use kv::{Keyspace, KvError, KvStore};
pub use memory_store::MemoryStore;
pub use metrics::QueueMetrics;
pub use redis_store::RedisStore;
pub use registry::WorkerRegistry;
pub use scheduler::QueueScheduler;
pub use types::{
    DeadLetterEntry, EnqueueOptions, Priority, QueueConfig, QueueError, QueueResult, QueueStats,
    RoutingStrategy, TaskRecord, TaskStatus, WorkerOptions, WorkerRecord, WorkerStatus,
};
