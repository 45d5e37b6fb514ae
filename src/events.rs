//! Event fan-out - In-process subscribers and the shared event stream
//!
//! Every state-changing queue operation emits exactly one typed event. Two
//! delivery paths run in order: registered in-process handlers are invoked
//! synchronously (a panicking handler is logged and swallowed, it never
//! fails the operation that produced the event), then the event is appended
//! to the shared log on the store for cross-process consumers. Stream
//! append failures are likewise logged and swallowed because the state
//! change they describe has already committed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::kv::KvStore;
use crate::utils::now_ms;

/// Closed set of event types emitted by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "task.enqueued")]
    TaskEnqueued,
    #[serde(rename = "task.assigned")]
    TaskAssigned,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.progress")]
    TaskProgress,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.retried")]
    TaskRetried,
    #[serde(rename = "task.dead_lettered")]
    TaskDeadLettered,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
    #[serde(rename = "task.promoted")]
    TaskPromoted,
    #[serde(rename = "task.requeued")]
    TaskRequeued,
    #[serde(rename = "worker.registered")]
    WorkerRegistered,
    #[serde(rename = "worker.unregistered")]
    WorkerUnregistered,
    #[serde(rename = "worker.offline")]
    WorkerOffline,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskEnqueued => "task.enqueued",
            EventType::TaskAssigned => "task.assigned",
            EventType::TaskStarted => "task.started",
            EventType::TaskProgress => "task.progress",
            EventType::TaskCompleted => "task.completed",
            EventType::TaskFailed => "task.failed",
            EventType::TaskRetried => "task.retried",
            EventType::TaskDeadLettered => "task.dead_lettered",
            EventType::TaskCancelled => "task.cancelled",
            EventType::TaskPromoted => "task.promoted",
            EventType::TaskRequeued => "task.requeued",
            EventType::WorkerRegistered => "worker.registered",
            EventType::WorkerUnregistered => "worker.unregistered",
            EventType::WorkerOffline => "worker.offline",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event envelope delivered to subscribers and appended to the stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Emission time (epoch milliseconds)
    pub timestamp_ms: u64,

    #[serde(default)]
    pub task_id: Option<String>,

    #[serde(default)]
    pub worker_id: Option<String>,

    /// Type-specific details, shaped by `event_type`
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl QueueEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp_ms: now_ms(),
            task_id: None,
            worker_id: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn for_task(event_type: EventType, task_id: &str) -> Self {
        let mut event = Self::new(event_type);
        event.task_id = Some(task_id.to_string());
        event
    }

    pub fn for_worker(event_type: EventType, worker_id: &str) -> Self {
        let mut event = Self::new(event_type);
        event.worker_id = Some(worker_id.to_string());
        event
    }

    pub fn with_worker(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

type Handler = Box<dyn Fn(&QueueEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

/// Synchronous fan-out plus the append-only stream tail
pub struct EventBus {
    store: Arc<dyn KvStore>,
    stream_key: String,
    handlers: Mutex<Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(store: Arc<dyn KvStore>, stream_key: String) -> Self {
        Self {
            store,
            stream_key,
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler, invoked synchronously in registration order.
    /// Handlers must not call back into the bus.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap()
            .push((id, Box::new(handler)));
        Subscription(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.handlers
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != subscription.0);
    }

    /// Deliver an event to every subscriber, then append it to the stream
    pub async fn publish(&self, event: QueueEvent) {
        debug!(event = %event.event_type, task_id = ?event.task_id, "emitting event");

        {
            let handlers = self.handlers.lock().unwrap();
            for (id, handler) in handlers.iter() {
                if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                    warn!(subscription = id, event = %event.event_type, "event handler panicked");
                }
            }
        }

        match serde_json::to_string(&event) {
            Ok(encoded) => {
                if let Err(e) = self
                    .store
                    .stream_append(&self.stream_key, &[("event", &encoded)])
                    .await
                {
                    warn!(error = %e, event = %event.event_type, "failed to append event to stream");
                }
            }
            Err(e) => {
                warn!(error = %e, event = %event.event_type, "failed to encode event");
            }
        }
    }
}
