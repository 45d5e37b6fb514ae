//! Task state machine and durable task storage
//!
//! This module owns the legal-transition table. Every component that mutates
//! a task does it by applying a [`Transition`] here, so an illegal request
//! fails before anything is written and the stored record stays untouched.
//!
//! Legal transitions:
//!
//! ```text
//! pending    -> assigned | cancelled
//! scheduled  -> pending | cancelled
//! assigned   -> processing | pending | failed | cancelled
//! processing -> completed | failed | cancelled | pending
//! failed     -> scheduled | dead          (engine-internal only)
//! completed, cancelled, dead: terminal
//! ```
//!
//! The pending arrows out of assigned and processing cover requeue on worker
//! loss; they are never requested by external callers.

use std::sync::Arc;
use tracing::warn;

use crate::kv::{Keyspace, KvStore};
use crate::types::{QueueError, QueueResult, TaskRecord, TaskStatus};
use crate::utils::now_ms;

/// A requested state change plus the fields it carries
#[derive(Debug, Clone)]
pub enum Transition {
    /// pending -> assigned
    Assign { worker_id: String },
    /// assigned -> processing
    Start,
    /// processing -> completed
    Complete,
    /// assigned | processing -> pending, on worker loss
    Requeue,
    /// scheduled -> pending, when the due time arrives
    Promote,
    /// assigned | processing -> failed
    Fail { error: String },
    /// failed -> scheduled, for a backoff retry
    Retry { due_ms: u64 },
    /// failed -> dead, when the retry budget is exhausted
    MarkDead { reason: String },
    /// any non-terminal state -> cancelled
    Cancel,
}

impl Transition {
    /// The state this transition lands in
    pub fn target(&self) -> TaskStatus {
        match self {
            Transition::Assign { .. } => TaskStatus::Assigned,
            Transition::Start => TaskStatus::Processing,
            Transition::Complete => TaskStatus::Completed,
            Transition::Requeue | Transition::Promote => TaskStatus::Pending,
            Transition::Fail { .. } => TaskStatus::Failed,
            Transition::Retry { .. } => TaskStatus::Scheduled,
            Transition::MarkDead { .. } => TaskStatus::Dead,
            Transition::Cancel => TaskStatus::Cancelled,
        }
    }
}

/// Whether the table allows moving from `from` to `to`
pub fn is_legal(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    match from {
        Pending => matches!(to, Assigned | Cancelled),
        Scheduled => matches!(to, Pending | Cancelled),
        Assigned => matches!(to, Processing | Pending | Failed | Cancelled),
        Processing => matches!(to, Completed | Failed | Cancelled | Pending),
        Failed => matches!(to, Scheduled | Dead),
        Completed | Cancelled | Dead => false,
    }
}

/// Durable storage for task records
///
/// Loads and saves JSON records under `task:<id>`, refreshing the TTL on
/// every write, and applies transitions against the legal table.
pub struct TaskStore {
    store: Arc<dyn KvStore>,
    keys: Arc<Keyspace>,
    ttl_secs: u64,
}

impl TaskStore {
    pub fn new(store: Arc<dyn KvStore>, keys: Arc<Keyspace>, ttl_secs: u64) -> Self {
        Self { store, keys, ttl_secs }
    }

    /// Fetch a task record
    ///
    /// A record that fails to decode is logged with its key and reported as
    /// not found, so upstream logic can treat it like an expired entry.
    pub async fn load(&self, id: &str) -> QueueResult<TaskRecord> {
        let key = self.keys.task(id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| QueueError::TaskNotFound(id.to_string()))?;
        match serde_json::from_str(&raw) {
            Ok(task) => Ok(task),
            Err(e) => {
                warn!(key = %key, error = %e, "stored task record failed to decode");
                Err(QueueError::TaskNotFound(id.to_string()))
            }
        }
    }

    /// Write a task record back with a refreshed TTL
    pub async fn save(&self, task: &TaskRecord) -> QueueResult<()> {
        let encoded = serde_json::to_string(task)?;
        self.store
            .set_ex(&self.keys.task(&task.id), &encoded, self.ttl_secs)
            .await?;
        Ok(())
    }

    /// Apply a transition in memory, without touching the store
    ///
    /// Verifies the request against the table, then applies the field
    /// updates the transition carries: timestamps, assignee, due time,
    /// progress reset, error bookkeeping. The caller persists the record
    /// afterwards with [`save`](TaskStore::save), which lets a compound
    /// operation (fail then retry) apply several steps and write once.
    pub fn apply(&self, task: &mut TaskRecord, transition: Transition) -> QueueResult<()> {
        let from = task.status;
        let to = transition.target();
        if !is_legal(from, to) {
            return Err(QueueError::IllegalTransition {
                task_id: task.id.clone(),
                from,
                to,
            });
        }

        match transition {
            Transition::Assign { worker_id } => {
                task.assigned_to = Some(worker_id);
            }
            Transition::Start => {
                task.started_at_ms = Some(now_ms());
            }
            Transition::Complete => {
                task.completed_at_ms = Some(now_ms());
            }
            Transition::Requeue => {
                task.progress = 0;
            }
            Transition::Promote => {
                task.scheduled_for_ms = None;
            }
            Transition::Fail { error } => {
                task.last_error = Some(error.clone());
                task.error_history.push(error);
            }
            Transition::Retry { due_ms } => {
                task.scheduled_for_ms = Some(due_ms);
                task.progress = 0;
            }
            Transition::MarkDead { reason } => {
                task.dead_letter_reason = Some(reason);
            }
            Transition::Cancel => {}
        }

        task.status = to;
        // An assignee exists exactly while the task is held by a worker.
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing) {
            task.assigned_to = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::types::{Priority, SCHEMA_VERSION};
    use std::collections::HashMap;

    fn task(status: TaskStatus) -> TaskRecord {
        TaskRecord {
            schema: SCHEMA_VERSION,
            id: "t1".to_string(),
            task_type: "test".to_string(),
            payload: serde_json::Value::Null,
            priority: Priority::Medium,
            status,
            assigned_to: match status {
                TaskStatus::Assigned | TaskStatus::Processing => Some("w1".to_string()),
                _ => None,
            },
            created_at_ms: now_ms(),
            scheduled_for_ms: None,
            started_at_ms: None,
            completed_at_ms: None,
            retry_count: 0,
            max_retries: 3,
            retry_delay_ms: 1_000,
            required_skills: vec![],
            sticky_key: None,
            routing_hint: None,
            progress: 0,
            progress_data: HashMap::new(),
            last_error: None,
            error_history: vec![],
            dead_letter_reason: None,
            metadata: HashMap::new(),
        }
    }

    fn store() -> TaskStore {
        TaskStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Keyspace::new("test")),
            60,
        )
    }

    #[test]
    fn test_transition_table_is_closed() {
        use TaskStatus::*;
        let all = [
            Pending, Scheduled, Assigned, Processing, Completed, Failed, Cancelled, Dead,
        ];
        let legal: Vec<(TaskStatus, TaskStatus)> = vec![
            (Pending, Assigned),
            (Pending, Cancelled),
            (Scheduled, Pending),
            (Scheduled, Cancelled),
            (Assigned, Processing),
            (Assigned, Pending),
            (Assigned, Failed),
            (Assigned, Cancelled),
            (Processing, Completed),
            (Processing, Failed),
            (Processing, Cancelled),
            (Processing, Pending),
            (Failed, Scheduled),
            (Failed, Dead),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    is_legal(from, to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        use TaskStatus::*;
        for from in [Completed, Cancelled, Dead] {
            for to in [Pending, Scheduled, Assigned, Processing, Completed, Failed, Cancelled, Dead] {
                assert!(!is_legal(from, to));
            }
        }
    }

    #[test]
    fn test_illegal_apply_leaves_record_untouched() {
        let tasks = store();
        let mut t = task(TaskStatus::Pending);
        let before = serde_json::to_string(&t).unwrap();

        let err = tasks.apply(&mut t, Transition::Complete).unwrap_err();
        assert!(matches!(err, QueueError::IllegalTransition { .. }));
        assert_eq!(serde_json::to_string(&t).unwrap(), before);
    }

    #[test]
    fn test_assign_then_start_sets_fields() {
        let tasks = store();
        let mut t = task(TaskStatus::Pending);

        tasks
            .apply(&mut t, Transition::Assign { worker_id: "w1".to_string() })
            .unwrap();
        assert_eq!(t.status, TaskStatus::Assigned);
        assert_eq!(t.assigned_to.as_deref(), Some("w1"));

        tasks.apply(&mut t, Transition::Start).unwrap();
        assert_eq!(t.status, TaskStatus::Processing);
        assert!(t.started_at_ms.is_some());
    }

    #[test]
    fn test_assignee_cleared_on_leaving_held_states() {
        let tasks = store();

        let mut t = task(TaskStatus::Processing);
        tasks.apply(&mut t, Transition::Complete).unwrap();
        assert_eq!(t.assigned_to, None);
        assert!(t.completed_at_ms.is_some());

        let mut t = task(TaskStatus::Processing);
        tasks
            .apply(&mut t, Transition::Fail { error: "boom".to_string() })
            .unwrap();
        assert_eq!(t.assigned_to, None);
        assert_eq!(t.last_error.as_deref(), Some("boom"));
        assert_eq!(t.error_history, vec!["boom".to_string()]);
    }

    #[test]
    fn test_retry_sets_due_time_and_resets_progress() {
        let tasks = store();
        let mut t = task(TaskStatus::Processing);
        t.progress = 80;

        tasks
            .apply(&mut t, Transition::Fail { error: "boom".to_string() })
            .unwrap();
        tasks.apply(&mut t, Transition::Retry { due_ms: 12345 }).unwrap();
        assert_eq!(t.status, TaskStatus::Scheduled);
        assert_eq!(t.scheduled_for_ms, Some(12345));
        assert_eq!(t.progress, 0);
    }

    #[tokio::test]
    async fn test_load_reports_undecodable_record_as_missing() {
        let kv = Arc::new(MemoryStore::new());
        let keys = Arc::new(Keyspace::new("test"));
        kv.set_ex(&keys.task("broken"), "not json", 60).await.unwrap();

        let tasks = TaskStore::new(kv, keys, 60);
        let err = tasks.load("broken").await.unwrap_err();
        assert!(matches!(err, QueueError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let tasks = store();
        let t = task(TaskStatus::Pending);
        tasks.save(&t).await.unwrap();

        let loaded = tasks.load("t1").await.unwrap();
        assert_eq!(loaded.id, t.id);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.schema, SCHEMA_VERSION);
    }
}
