//! Core type definitions for the Relay queue core
//!
//! This module defines the durable entities of the task queue: task records,
//! worker records, dead-letter envelopes, routing enumerations, configuration,
//! and the error taxonomy shared by every component.
//!
//! All durable records serialize to JSON and carry a single integer `schema`
//! field at the top level so future migrations stay mechanical.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Schema version stamped into every serialized task, worker, and
/// dead-letter record.
pub const SCHEMA_VERSION: u32 = 1;

/// Priority bands for task scheduling
///
/// Higher values indicate higher priority. A critical task that is pending
/// at the moment of a claim is always returned before a lower-priority one.
///
/// # Examples
/// ```
/// use relay_core::Priority;
///
/// assert!(Priority::Critical > Priority::Low);
/// assert_eq!(Priority::Critical.score(), 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work that can wait behind everything else
    Low = 1,
    /// Standard priority for regular tasks
    Medium = 2,
    /// Important work claimed ahead of the medium band
    High = 3,
    /// Mission-critical work claimed before anything else
    Critical = 4,
}

impl Priority {
    /// All bands in claim order, highest first
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Numeric score used in the per-priority sorted sets
    pub fn score(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of a task
///
/// The legal transitions between these states are owned by the
/// [`lifecycle`](crate::lifecycle) module; every mutation goes through its
/// transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued and claimable
    Pending,
    /// Waiting for its due time before becoming claimable
    Scheduled,
    /// Handed to a worker, execution not yet started
    Assigned,
    /// Actively being executed by a worker
    Processing,
    /// Finished successfully (terminal)
    Completed,
    /// Permanently failed with the dead-letter queue disabled (terminal)
    Failed,
    /// Cancelled before completion (terminal)
    Cancelled,
    /// Retry budget exhausted, parked on the dead-letter list (terminal)
    Dead,
}

impl TaskStatus {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Dead
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Lifecycle states of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Registered and below capacity
    Idle,
    /// At or above capacity
    Busy,
    /// Heartbeat lapsed beyond the liveness window
    Offline,
}

/// Work-distribution policies
///
/// Selected per task from its routing fields: an explicit `routing_hint`
/// wins, then a `sticky_key` selects [`Sticky`](RoutingStrategy::Sticky),
/// then non-empty `required_skills` select
/// [`SkillBased`](RoutingStrategy::SkillBased), and otherwise the queue's
/// configured default applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingStrategy {
    /// Rotate fairly through the available workers
    #[serde(rename = "round-robin")]
    RoundRobin,
    /// Prefer the worker with the lowest load ratio
    #[serde(rename = "load-based")]
    LoadBased,
    /// Score workers by skill overlap blended with load
    #[serde(rename = "skill-based")]
    SkillBased,
    /// Pin all tasks sharing a sticky key to one worker
    #[serde(rename = "sticky")]
    Sticky,
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::LoadBased => "load-based",
            RoutingStrategy::SkillBased => "skill-based",
            RoutingStrategy::Sticky => "sticky",
        };
        f.write_str(s)
    }
}

/// Durable task record
///
/// The canonical representation of a unit of deferred work. Stored as JSON
/// under `task:<id>` with a seven-day TTL refreshed on every write.
///
/// Invariants maintained by the engine:
/// - `assigned_to` is non-empty exactly while status is assigned or processing
/// - `started_at_ms` is set once the task first reaches processing and is
///   never unset on retry
/// - `retry_count` exceeds `max_retries` only on the transition to dead
/// - `progress` is monotone non-decreasing within a single processing attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Serialization schema version
    pub schema: u32,

    /// Unique opaque identifier
    pub id: String,

    /// Free-form task type, used for routing hints and metrics only
    #[serde(default)]
    pub task_type: String,

    /// Opaque payload handed to the executing worker
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Scheduling priority band
    pub priority: Priority,

    /// Current lifecycle state
    pub status: TaskStatus,

    /// Worker currently holding the task, if any
    #[serde(default)]
    pub assigned_to: Option<String>,

    /// Creation timestamp (epoch milliseconds)
    pub created_at_ms: u64,

    /// Due time for delayed or retrying tasks (epoch milliseconds)
    #[serde(default)]
    pub scheduled_for_ms: Option<u64>,

    /// First moment the task reached processing (epoch milliseconds)
    #[serde(default)]
    pub started_at_ms: Option<u64>,

    /// Completion timestamp (epoch milliseconds)
    #[serde(default)]
    pub completed_at_ms: Option<u64>,

    /// Failed attempts so far
    #[serde(default)]
    pub retry_count: u32,

    /// Retry budget before the task is dead-lettered
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries
    pub retry_delay_ms: u64,

    /// Skills a worker must hold for skill-based routing
    #[serde(default)]
    pub required_skills: Vec<String>,

    /// Producer-supplied affinity key for sticky routing
    #[serde(default)]
    pub sticky_key: Option<String>,

    /// Explicit routing policy override
    #[serde(default)]
    pub routing_hint: Option<RoutingStrategy>,

    /// Completion percentage reported by the worker (0 to 100)
    #[serde(default)]
    pub progress: u8,

    /// Opaque progress details merged across progress reports
    #[serde(default)]
    pub progress_data: HashMap<String, serde_json::Value>,

    /// Most recent failure message
    #[serde(default)]
    pub last_error: Option<String>,

    /// Every failure message accumulated across attempts
    #[serde(default)]
    pub error_history: Vec<String>,

    /// Why the task was dead-lettered, when it was
    #[serde(default)]
    pub dead_letter_reason: Option<String>,

    /// Opaque producer metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Durable worker record
///
/// Stored as JSON under `agent:<id>` with a TTL of twice the heartbeat
/// timeout, refreshed on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Serialization schema version
    pub schema: u32,

    /// Unique worker identifier
    pub id: String,

    /// Skills this worker advertises
    #[serde(default)]
    pub skills: Vec<String>,

    /// Maximum concurrent tasks
    pub capacity: u32,

    /// Tasks currently assigned or processing on this worker
    #[serde(default)]
    pub current_load: u32,

    /// Liveness state derived from heartbeats and load
    pub status: WorkerStatus,

    /// Registration timestamp (epoch milliseconds)
    pub registered_at_ms: u64,

    /// Most recent heartbeat (epoch milliseconds)
    pub last_heartbeat_ms: u64,

    /// Opaque operator metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkerRecord {
    /// Fraction of capacity currently in use
    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.capacity)
    }

    /// Unused capacity slots
    pub fn free_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.current_load)
    }

    pub fn has_free_capacity(&self) -> bool {
        self.current_load < self.capacity
    }

    /// Whether the last heartbeat falls within the liveness window
    pub fn is_heartbeat_fresh(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_ms) <= timeout_ms
    }
}

/// Options accepted by [`TaskQueue::enqueue`](crate::engine::TaskQueue::enqueue)
///
/// Every field is optional; unset fields take the configured defaults.
/// Unknown fields arriving through deserialization are preserved in
/// `metadata` rather than rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnqueueOptions {
    /// Explicit task id; minted when absent
    pub id: Option<String>,

    /// Free-form task type
    #[serde(rename = "type")]
    pub task_type: Option<String>,

    /// Opaque payload
    pub payload: Option<serde_json::Value>,

    /// Priority band, defaulting to medium
    pub priority: Option<Priority>,

    /// Delay before the task becomes claimable
    pub delay_ms: Option<u64>,

    /// Absolute due time (epoch milliseconds); wins over `delay_ms`
    pub scheduled_for: Option<u64>,

    /// Retry budget override
    pub max_retries: Option<u32>,

    /// Base backoff delay override
    pub retry_delay_ms: Option<u64>,

    /// Skills required of the executing worker
    #[serde(default)]
    pub required_skills: Vec<String>,

    /// Affinity key for sticky routing
    pub sticky_key: Option<String>,

    /// Explicit routing policy
    pub routing_hint: Option<RoutingStrategy>,

    /// Producer metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Unrecognized fields, folded into metadata at enqueue time
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Options accepted by worker registration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerOptions {
    /// Explicit worker id; minted when absent
    pub id: Option<String>,

    /// Skills the worker advertises
    #[serde(default)]
    pub skills: Vec<String>,

    /// Maximum concurrent tasks, defaulting to 1
    pub capacity: Option<u32>,

    /// Opaque operator metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Dead-letter envelope
///
/// Serialized whole into the dead-letter sorted set, scored by death time,
/// so entries survive the task record's TTL and carry everything a human
/// needs for inspection or replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Serialization schema version
    pub schema: u32,

    /// The task as it looked at death
    pub task: TaskRecord,

    /// When the retry budget ran out (epoch milliseconds)
    pub died_at_ms: u64,

    /// The final failure message
    pub reason: String,

    /// Every failure message accumulated across attempts
    pub error_history: Vec<String>,
}

/// Queue-wide counters returned by
/// [`TaskQueue::stats`](crate::engine::TaskQueue::stats)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Claimable tasks across all priority bands
    pub pending: u64,
    /// Tasks waiting on their due time
    pub scheduled: u64,
    /// Tasks held by workers
    pub processing: u64,
    /// Entries parked on the dead-letter list
    pub dead_lettered: u64,
    /// Registered workers
    pub workers: u64,
}

/// Configuration for the queue engine and scheduler loops
///
/// Plain data with sensible defaults; binaries layer CLI flags and
/// environment on top.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retry budget before a task is dead-lettered
    pub max_retries: u32,

    /// First retry delay; doubles on each subsequent retry
    pub base_retry_delay_ms: u64,

    /// Upper bound on the exponential backoff
    pub max_retry_delay_ms: u64,

    /// Worker liveness window; missing heartbeats beyond this mark the
    /// worker offline and reassign its tasks
    pub heartbeat_timeout_ms: u64,

    /// Cadence of the due-task promotion sweep
    pub poll_interval_ms: u64,

    /// When false, permanently failed tasks rest at terminal `failed`
    /// instead of entering the dead-letter list
    pub dead_letter_enabled: bool,

    /// Routing policy applied when a task carries no routing fields
    pub default_strategy: RoutingStrategy,

    /// Namespace prefix prepended to every key on the store
    pub key_prefix: String,

    /// TTL on stored task records, refreshed on every write
    pub task_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 300_000, // 5 minutes
            heartbeat_timeout_ms: 30_000,
            poll_interval_ms: 100,
            dead_letter_enabled: true,
            default_strategy: RoutingStrategy::LoadBased,
            key_prefix: "queue".to_string(),
            task_ttl_secs: 7 * 24 * 60 * 60, // 7 days
        }
    }
}

impl QueueConfig {
    /// Worker record TTL, twice the heartbeat timeout and never below one
    /// second
    pub fn worker_ttl_secs(&self) -> u64 {
        (self.heartbeat_timeout_ms * 2 / 1_000).max(1)
    }
}

/// Error types for queue operations
///
/// Operational conditions (no routable worker, a directed claim against a
/// full worker) are reported as `None` returns rather than errors; this enum
/// covers the structural failures surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The task id does not resolve to a stored record
    ///
    /// Also returned when a stored record fails to decode; the decode
    /// failure is logged with the offending key so upstream logic can
    /// proceed as if the record were absent.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The worker id does not resolve to a stored record
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// The state machine rejected the requested change
    #[error("illegal transition for task {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// The underlying store call failed; propagated as-is with no retry
    /// at this layer
    #[error("kv store error: {0}")]
    Kv(#[from] crate::kv::KvError),

    /// A record could not be encoded for storage
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics registration failed at engine construction
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
