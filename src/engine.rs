//! Queue engine - Enqueue, claim, progress, and failure handling
//!
//! The engine orchestrates the store adapter, the task state machine, the
//! worker registry, and the distribution policies behind one handle the
//! caller owns. It is safe to run any number of engine instances against
//! one store; the only in-memory state is the round-robin cursor and the
//! sticky-map mirror, both protected by short-lived locks that are never
//! held across a store call.
//!
//! ## Claim path
//!
//! A claim pops the oldest id from the highest non-empty priority band and
//! immediately parks it in the processing set before anything else happens.
//! The pop and the assignment are not transactional; the early park keeps
//! the id reachable, so a crash mid-claim leaves an orphan the scheduler
//! sweep can recover instead of a silently dropped task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::distribution::{
    load_based, round_robin, select_strategy, skill_based, sticky_bound, DistributionContext,
    DistributionResult,
};
use crate::events::{EventBus, EventType, QueueEvent, Subscription};
use crate::kv::{Keyspace, KvStore};
use crate::lifecycle::{TaskStore, Transition};
use crate::metrics::QueueMetrics;
use crate::registry::WorkerRegistry;
use crate::types::{
    DeadLetterEntry, EnqueueOptions, Priority, QueueConfig, QueueError, QueueResult, QueueStats,
    RoutingStrategy, TaskRecord, TaskStatus, WorkerOptions, WorkerRecord, WorkerStatus,
    SCHEMA_VERSION,
};
use crate::utils::{generate_task_id, now_ms};

/// Exponential backoff for the k-th retry: `min(base * 2^(k-1), max)`
pub(crate) fn retry_backoff_ms(retry_count: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = retry_count.saturating_sub(1).min(63);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

/// The task queue handle
///
/// Owns the store connection for the duration of its lifetime; dropping the
/// handle releases everything. Construct one per process and share it
/// behind an `Arc`.
pub struct TaskQueue {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) config: QueueConfig,
    pub(crate) keys: Arc<Keyspace>,
    pub(crate) tasks: TaskStore,
    pub(crate) registry: WorkerRegistry,
    pub(crate) events: EventBus,
    pub(crate) metrics: Arc<QueueMetrics>,
    rr_cursor: Mutex<usize>,
    sticky: Mutex<HashMap<String, String>>,
}

impl TaskQueue {
    /// Build an engine with a fresh metrics collector and reload the sticky
    /// map from the store
    pub async fn new(store: Arc<dyn KvStore>, config: QueueConfig) -> QueueResult<Self> {
        let metrics = Arc::new(QueueMetrics::new()?);
        Self::with_metrics(store, config, metrics).await
    }

    /// Build an engine around an injected metrics collector
    pub async fn with_metrics(
        store: Arc<dyn KvStore>,
        config: QueueConfig,
        metrics: Arc<QueueMetrics>,
    ) -> QueueResult<Self> {
        let keys = Arc::new(Keyspace::new(&config.key_prefix));
        let tasks = TaskStore::new(Arc::clone(&store), Arc::clone(&keys), config.task_ttl_secs);
        let registry = WorkerRegistry::new(Arc::clone(&store), Arc::clone(&keys), &config);
        let events = EventBus::new(Arc::clone(&store), keys.stream());

        let sticky = store.hash_get_all(&keys.sticky()).await?;
        if !sticky.is_empty() {
            info!(bindings = sticky.len(), "reloaded sticky map");
        }

        Ok(Self {
            store,
            config,
            keys,
            tasks,
            registry,
            events,
            metrics,
            rr_cursor: Mutex::new(usize::MAX),
            sticky: Mutex::new(sticky.into_iter().collect()),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Register an in-process event handler
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn off_event(&self, subscription: Subscription) {
        self.events.unsubscribe(subscription)
    }

    // ------------------------------------------------------------------
    // Producer surface
    // ------------------------------------------------------------------

    /// Accept a task, filling defaults for everything the caller left unset
    ///
    /// Delayed tasks land in the scheduled set and become claimable when
    /// their due time arrives; everything else is immediately claimable in
    /// its priority band. Unknown option fields are preserved in metadata.
    pub async fn enqueue(&self, options: EnqueueOptions) -> QueueResult<TaskRecord> {
        let now = now_ms();
        let scheduled_for = options
            .scheduled_for
            .or_else(|| options.delay_ms.map(|delay| now + delay));
        let delayed = scheduled_for.map(|due| due > now).unwrap_or(false);

        let mut metadata = options.metadata;
        for (key, value) in options.extra {
            metadata.entry(key).or_insert(value);
        }

        let task = TaskRecord {
            schema: SCHEMA_VERSION,
            id: options.id.unwrap_or_else(generate_task_id),
            task_type: options.task_type.unwrap_or_default(),
            payload: options.payload.unwrap_or(serde_json::Value::Null),
            priority: options.priority.unwrap_or(Priority::Medium),
            status: if delayed {
                TaskStatus::Scheduled
            } else {
                TaskStatus::Pending
            },
            assigned_to: None,
            created_at_ms: now,
            scheduled_for_ms: scheduled_for,
            started_at_ms: None,
            completed_at_ms: None,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.config.max_retries),
            retry_delay_ms: options
                .retry_delay_ms
                .unwrap_or(self.config.base_retry_delay_ms),
            required_skills: options.required_skills,
            sticky_key: options.sticky_key,
            routing_hint: options.routing_hint,
            progress: 0,
            progress_data: HashMap::new(),
            last_error: None,
            error_history: Vec::new(),
            dead_letter_reason: None,
            metadata,
        };

        self.tasks.save(&task).await?;
        if task.status == TaskStatus::Scheduled {
            self.store
                .zset_add(&self.keys.scheduled(), &task.id, scheduled_for.unwrap_or(now) as f64)
                .await?;
        } else {
            self.push_pending(&task).await?;
        }

        self.metrics.tasks_enqueued.inc();
        debug!(task_id = %task.id, priority = %task.priority, delayed, "task enqueued");
        self.events
            .publish(
                QueueEvent::for_task(EventType::TaskEnqueued, &task.id).with_payload(
                    serde_json::json!({
                        "type": task.task_type,
                        "priority": task.priority,
                    }),
                ),
            )
            .await;
        Ok(task)
    }

    // ------------------------------------------------------------------
    // Worker surface
    // ------------------------------------------------------------------

    /// Claim the next pending task
    ///
    /// With a worker id the claim is directed: the worker is verified and
    /// receives the task if it has free capacity (`None` when it is full or
    /// offline). Without one the claim is arbitrated: the routing policy
    /// picks a worker from the available snapshot, and when no worker is
    /// routable the task returns to the head of its band and the claim
    /// yields `None`.
    pub async fn claim(&self, worker_id: Option<&str>) -> QueueResult<Option<TaskRecord>> {
        self.metrics.claims_total.inc();
        match worker_id {
            Some(worker_id) => self.claim_directed(worker_id).await,
            None => self.claim_arbitrated().await,
        }
    }

    async fn claim_directed(&self, worker_id: &str) -> QueueResult<Option<TaskRecord>> {
        let worker = self.registry.get(worker_id).await?;
        if worker.status == WorkerStatus::Offline {
            debug!(worker_id, "directed claim against offline worker");
            return Ok(None);
        }
        if !worker.has_free_capacity() {
            debug!(worker_id, "directed claim against full worker");
            return Ok(None);
        }

        let Some(mut task) = self.next_pending().await? else {
            return Ok(None);
        };
        self.finish_assign(&mut task, &worker.id, "directed claim".to_string())
            .await?;
        Ok(Some(task))
    }

    async fn claim_arbitrated(&self) -> QueueResult<Option<TaskRecord>> {
        let Some(mut task) = self.next_pending().await? else {
            return Ok(None);
        };

        let workers = self.registry.available().await?;
        match self.route(&task, &workers).await? {
            Some(choice) => {
                self.finish_assign(&mut task, &choice.worker_id, choice.reason)
                    .await?;
                Ok(Some(task))
            }
            None => {
                // No routable worker; the task goes back to the head of its
                // band and later claims retry it after the queue drains.
                self.store
                    .list_push_head(&self.keys.pending(task.priority), &task.id)
                    .await?;
                self.store
                    .zset_remove(&self.keys.processing(), &task.id)
                    .await?;
                self.metrics.claims_unrouted.inc();
                debug!(task_id = %task.id, "no routable worker, task stays pending");
                Ok(None)
            }
        }
    }

    /// Pop the next claimable task, draining bands highest first
    ///
    /// Each popped id is parked in the processing set before its record is
    /// read, so an interrupted claim is recoverable. Stale ids (cancelled
    /// or expired records) are dropped along with their cross-check
    /// entries.
    async fn next_pending(&self) -> QueueResult<Option<TaskRecord>> {
        for band in Priority::DESCENDING {
            loop {
                let Some(id) = self.store.list_pop_tail(&self.keys.pending(band)).await? else {
                    break;
                };
                self.store
                    .zset_add(&self.keys.processing(), &id, now_ms() as f64)
                    .await?;
                match self.tasks.load(&id).await {
                    Ok(task) if task.status == TaskStatus::Pending => return Ok(Some(task)),
                    Ok(task) => {
                        debug!(task_id = %id, status = %task.status, "skipping stale queue entry");
                        self.release_stale(&id, band).await?;
                    }
                    Err(QueueError::TaskNotFound(_)) => {
                        debug!(task_id = %id, "skipping vanished queue entry");
                        self.release_stale(&id, band).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }

    async fn release_stale(&self, id: &str, band: Priority) -> QueueResult<()> {
        self.store.zset_remove(&self.keys.processing(), id).await?;
        self.store.zset_remove(&self.keys.priority(band), id).await?;
        Ok(())
    }

    async fn finish_assign(
        &self,
        task: &mut TaskRecord,
        worker_id: &str,
        reason: String,
    ) -> QueueResult<()> {
        self.tasks.apply(
            task,
            Transition::Assign {
                worker_id: worker_id.to_string(),
            },
        )?;
        self.tasks.save(task).await?;
        self.store
            .zset_remove(&self.keys.priority(task.priority), &task.id)
            .await?;
        self.registry.adjust_load(worker_id, 1).await?;

        info!(task_id = %task.id, worker_id, %reason, "task assigned");
        self.events
            .publish(
                QueueEvent::for_task(EventType::TaskAssigned, &task.id)
                    .with_worker(worker_id)
                    .with_payload(serde_json::json!({ "reason": reason })),
            )
            .await;
        Ok(())
    }

    /// Run the routing policy for a task against the candidate snapshot
    async fn route(
        &self,
        task: &TaskRecord,
        workers: &[WorkerRecord],
    ) -> QueueResult<Option<DistributionResult>> {
        let ctx = DistributionContext { task, workers };
        let strategy = select_strategy(task, self.config.default_strategy);
        let choice = match strategy {
            RoutingStrategy::RoundRobin => {
                let mut cursor = self.rr_cursor.lock().unwrap();
                round_robin(&ctx, &mut cursor)
            }
            RoutingStrategy::LoadBased => load_based(&ctx),
            RoutingStrategy::SkillBased => match skill_based(&ctx) {
                Some(choice) => Some(choice),
                // A skill-hinted task with nothing required falls back to
                // placement quality; a gated task waits instead.
                None if task.required_skills.is_empty() => load_based(&ctx),
                None => None,
            },
            RoutingStrategy::Sticky => return self.route_sticky(task, &ctx).await,
        };
        Ok(choice)
    }

    /// Sticky routing: an eligible bound worker wins, anything else falls
    /// back to load-based and rebinds the key
    async fn route_sticky(
        &self,
        task: &TaskRecord,
        ctx: &DistributionContext<'_>,
    ) -> QueueResult<Option<DistributionResult>> {
        let Some(key) = task.sticky_key.clone() else {
            // A sticky hint without a key has no affinity to honor.
            return Ok(load_based(ctx));
        };

        let mut bound = { self.sticky.lock().unwrap().get(&key).cloned() };
        if bound.is_none() {
            // Another engine instance may have bound the key since this
            // mirror was loaded; re-read the shared map before rebinding.
            bound = self.store.hash_get(&self.keys.sticky(), &key).await?;
            if let Some(worker_id) = &bound {
                self.sticky
                    .lock()
                    .unwrap()
                    .insert(key.clone(), worker_id.clone());
            }
        }

        if let Some(worker_id) = &bound {
            if let Some(worker) = sticky_bound(ctx, worker_id) {
                return Ok(Some(DistributionResult {
                    worker_id: worker.id.clone(),
                    reason: format!("sticky key {:?} bound to {}", key, worker.id),
                }));
            }
        }

        let Some(mut choice) = load_based(ctx) else {
            return Ok(None);
        };
        choice.reason = format!("sticky key {:?} rebound to {}", key, choice.worker_id);
        self.sticky
            .lock()
            .unwrap()
            .insert(key.clone(), choice.worker_id.clone());
        self.store
            .hash_set(&self.keys.sticky(), &key, &choice.worker_id)
            .await?;
        Ok(Some(choice))
    }

    /// Mark an assigned task as actively processing
    pub async fn start(&self, id: &str) -> QueueResult<TaskRecord> {
        let mut task = self.tasks.load(id).await?;
        self.tasks.apply(&mut task, Transition::Start)?;
        self.tasks.save(&task).await?;

        let worker_id = task.assigned_to.clone().unwrap_or_default();
        debug!(task_id = %id, worker_id = %worker_id, "task started");
        self.events
            .publish(QueueEvent::for_task(EventType::TaskStarted, id).with_worker(&worker_id))
            .await;
        Ok(task)
    }

    /// Finish a task successfully
    ///
    /// The optional output travels on the completion event; the queue does
    /// not persist business results.
    pub async fn complete(
        &self,
        id: &str,
        output: Option<serde_json::Value>,
    ) -> QueueResult<TaskRecord> {
        let mut task = self.tasks.load(id).await?;
        let assignee = task.assigned_to.clone();
        self.tasks.apply(&mut task, Transition::Complete)?;
        self.tasks.save(&task).await?;
        self.store
            .zset_remove(&self.keys.processing(), &task.id)
            .await?;
        if let Some(worker_id) = &assignee {
            self.registry.adjust_load(worker_id, -1).await?;
        }

        self.metrics.tasks_completed.inc();
        info!(task_id = %id, "task completed");
        self.events
            .publish(
                QueueEvent::for_task(EventType::TaskCompleted, id)
                    .with_worker(assignee.as_deref().unwrap_or_default())
                    .with_payload(serde_json::json!({ "output": output })),
            )
            .await;
        Ok(task)
    }

    /// Record progress on a held task without changing its status
    ///
    /// The percentage is clamped to 100 and never moves backwards within an
    /// attempt; the data dictionary merges over previous reports.
    pub async fn progress(
        &self,
        id: &str,
        pct: u8,
        data: Option<serde_json::Value>,
    ) -> QueueResult<TaskRecord> {
        let mut task = self.tasks.load(id).await?;
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing) {
            return Err(QueueError::IllegalTransition {
                task_id: task.id,
                from: task.status,
                to: task.status,
            });
        }

        task.progress = task.progress.max(pct.min(100));
        if let Some(serde_json::Value::Object(incoming)) = data.clone() {
            for (key, value) in incoming {
                task.progress_data.insert(key, value);
            }
        }
        self.tasks.save(&task).await?;

        self.events
            .publish(
                QueueEvent::for_task(EventType::TaskProgress, id)
                    .with_worker(task.assigned_to.as_deref().unwrap_or_default())
                    .with_payload(serde_json::json!({
                        "progress": task.progress,
                        "data": data,
                    })),
            )
            .await;
        Ok(task)
    }

    /// Record a failure, retrying with backoff while budget remains
    ///
    /// Within budget the task is rescheduled at
    /// `min(base * 2^(attempt-1), max_delay)`. Beyond it the task is
    /// dead-lettered: the envelope is written before the processing-set
    /// removal so a crash mid-operation still shows the task as dead.
    pub async fn fail(&self, id: &str, error: &str) -> QueueResult<TaskRecord> {
        let mut task = self.tasks.load(id).await?;
        let assignee = task.assigned_to.clone();
        self.tasks.apply(
            &mut task,
            Transition::Fail {
                error: error.to_string(),
            },
        )?;
        task.retry_count += 1;

        if task.retry_count <= task.max_retries {
            let delay_ms = retry_backoff_ms(
                task.retry_count,
                task.retry_delay_ms,
                self.config.max_retry_delay_ms,
            );
            let due_ms = now_ms() + delay_ms;
            self.tasks.apply(&mut task, Transition::Retry { due_ms })?;
            self.tasks.save(&task).await?;
            self.store
                .zset_add(&self.keys.scheduled(), &task.id, due_ms as f64)
                .await?;
            self.store
                .zset_remove(&self.keys.processing(), &task.id)
                .await?;
            if let Some(worker_id) = &assignee {
                self.registry.adjust_load(worker_id, -1).await?;
            }

            self.metrics.tasks_retried.inc();
            info!(
                task_id = %id,
                retry = task.retry_count,
                delay_ms,
                error,
                "task failed, retry scheduled"
            );
            self.events
                .publish(
                    QueueEvent::for_task(EventType::TaskRetried, id)
                        .with_worker(assignee.as_deref().unwrap_or_default())
                        .with_payload(serde_json::json!({
                            "retry_count": task.retry_count,
                            "max_retries": task.max_retries,
                            "delay_ms": delay_ms,
                            "error": error,
                        })),
                )
                .await;
        } else if self.config.dead_letter_enabled {
            self.tasks.apply(
                &mut task,
                Transition::MarkDead {
                    reason: error.to_string(),
                },
            )?;
            self.tasks.save(&task).await?;

            let died_at_ms = now_ms();
            let entry = DeadLetterEntry {
                schema: SCHEMA_VERSION,
                task: task.clone(),
                died_at_ms,
                reason: error.to_string(),
                error_history: task.error_history.clone(),
            };
            self.store
                .zset_add(&self.keys.dead(), &serde_json::to_string(&entry)?, died_at_ms as f64)
                .await?;
            self.store
                .zset_remove(&self.keys.processing(), &task.id)
                .await?;
            if let Some(worker_id) = &assignee {
                self.registry.adjust_load(worker_id, -1).await?;
            }

            self.metrics.tasks_dead_lettered.inc();
            warn!(task_id = %id, retries = task.retry_count - 1, error, "task dead-lettered");
            self.events
                .publish(
                    QueueEvent::for_task(EventType::TaskDeadLettered, id)
                        .with_worker(assignee.as_deref().unwrap_or_default())
                        .with_payload(serde_json::json!({
                            "reason": error,
                            "retry_count": task.retry_count,
                        })),
                )
                .await;
        } else {
            // Dead-lettering disabled: the exhausted task rests at failed.
            self.tasks.save(&task).await?;
            self.store
                .zset_remove(&self.keys.processing(), &task.id)
                .await?;
            if let Some(worker_id) = &assignee {
                self.registry.adjust_load(worker_id, -1).await?;
            }

            self.metrics.tasks_failed.inc();
            warn!(task_id = %id, error, "task permanently failed");
            self.events
                .publish(
                    QueueEvent::for_task(EventType::TaskFailed, id)
                        .with_worker(assignee.as_deref().unwrap_or_default())
                        .with_payload(serde_json::json!({
                            "error": error,
                            "retry_count": task.retry_count,
                        })),
                )
                .await;
        }
        Ok(task)
    }

    /// Cancel a task from any non-terminal state
    ///
    /// Only one of the position structures actually holds the id, but all
    /// removals are issued; the extra calls are no-ops.
    pub async fn cancel(&self, id: &str, reason: Option<&str>) -> QueueResult<TaskRecord> {
        let mut task = self.tasks.load(id).await?;
        let assignee = task.assigned_to.clone();
        let was_held = matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing);
        self.tasks.apply(&mut task, Transition::Cancel)?;
        self.tasks.save(&task).await?;

        self.store
            .list_remove(&self.keys.pending(task.priority), &task.id)
            .await?;
        self.store
            .zset_remove(&self.keys.priority(task.priority), &task.id)
            .await?;
        self.store
            .zset_remove(&self.keys.scheduled(), &task.id)
            .await?;
        self.store
            .zset_remove(&self.keys.processing(), &task.id)
            .await?;
        if was_held {
            if let Some(worker_id) = &assignee {
                self.registry.adjust_load(worker_id, -1).await?;
            }
        }

        self.metrics.tasks_cancelled.inc();
        info!(task_id = %id, reason = ?reason, "task cancelled");
        self.events
            .publish(
                QueueEvent::for_task(EventType::TaskCancelled, id)
                    .with_payload(serde_json::json!({ "reason": reason })),
            )
            .await;
        Ok(task)
    }

    // ------------------------------------------------------------------
    // Dead-letter surface
    // ------------------------------------------------------------------

    /// The oldest dead-letter envelopes, up to `limit`
    pub async fn dead_letter_entries(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let members = self
            .store
            .zset_range(&self.keys.dead(), 0, limit as isize - 1)
            .await?;
        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str(&member) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "dead-letter entry failed to decode"),
            }
        }
        Ok(entries)
    }

    /// Pull a task off the dead-letter list and re-enqueue it as pending
    /// with a fresh retry budget
    pub async fn replay_dead_letter(&self, id: &str) -> QueueResult<TaskRecord> {
        let members = self.store.zset_range(&self.keys.dead(), 0, -1).await?;
        for member in members {
            let entry: DeadLetterEntry = match serde_json::from_str(&member) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "dead-letter entry failed to decode");
                    continue;
                }
            };
            if entry.task.id != id {
                continue;
            }
            if self.store.zset_remove(&self.keys.dead(), &member).await? == 0 {
                // Another engine instance replayed it first.
                continue;
            }

            let mut task = entry.task;
            task.status = TaskStatus::Pending;
            task.assigned_to = None;
            task.scheduled_for_ms = None;
            task.retry_count = 0;
            task.progress = 0;
            task.last_error = None;
            task.error_history.clear();
            task.dead_letter_reason = None;

            self.tasks.save(&task).await?;
            self.push_pending(&task).await?;

            info!(task_id = %id, "dead-letter entry replayed");
            self.events
                .publish(
                    QueueEvent::for_task(EventType::TaskEnqueued, id).with_payload(
                        serde_json::json!({
                            "type": task.task_type,
                            "priority": task.priority,
                            "replayed": true,
                        }),
                    ),
                )
                .await;
            return Ok(task);
        }
        Err(QueueError::TaskNotFound(id.to_string()))
    }

    // ------------------------------------------------------------------
    // Registry surface
    // ------------------------------------------------------------------

    pub async fn register_worker(&self, options: WorkerOptions) -> QueueResult<WorkerRecord> {
        let record = self.registry.register(options).await?;
        self.metrics.workers_registered.inc();
        self.events
            .publish(
                QueueEvent::for_worker(EventType::WorkerRegistered, &record.id).with_payload(
                    serde_json::json!({
                        "skills": record.skills,
                        "capacity": record.capacity,
                    }),
                ),
            )
            .await;
        Ok(record)
    }

    /// Remove a worker, requeueing everything it still holds
    ///
    /// The writes are a best-effort sequence; if interrupted, the expiry
    /// sweep finishes the cleanup once the record's TTL lapses.
    pub async fn unregister_worker(&self, id: &str) -> QueueResult<()> {
        self.registry.get(id).await?;

        let held = self.store.zset_range(&self.keys.processing(), 0, -1).await?;
        for task_id in held {
            let mut task = match self.tasks.load(&task_id).await {
                Ok(task) => task,
                Err(QueueError::TaskNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if task.assigned_to.as_deref() != Some(id)
                || !matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing)
            {
                continue;
            }
            self.requeue(&mut task).await?;
        }

        self.registry.remove(id).await?;
        self.events
            .publish(QueueEvent::for_worker(EventType::WorkerUnregistered, id))
            .await;
        Ok(())
    }

    /// Return a held task to the pending queue after worker loss
    pub(crate) async fn requeue(&self, task: &mut TaskRecord) -> QueueResult<()> {
        self.tasks.apply(task, Transition::Requeue)?;
        self.tasks.save(task).await?;
        self.push_pending(task).await?;
        self.store
            .zset_remove(&self.keys.processing(), &task.id)
            .await?;

        info!(task_id = %task.id, "task requeued");
        self.events
            .publish(QueueEvent::for_task(EventType::TaskRequeued, &task.id))
            .await;
        Ok(())
    }

    pub async fn heartbeat(&self, id: &str) -> QueueResult<WorkerRecord> {
        self.registry.heartbeat(id).await
    }

    pub async fn get_task(&self, id: &str) -> QueueResult<TaskRecord> {
        self.tasks.load(id).await
    }

    pub async fn get_worker(&self, id: &str) -> QueueResult<WorkerRecord> {
        self.registry.get(id).await
    }

    pub async fn list_workers(&self) -> QueueResult<Vec<WorkerRecord>> {
        self.registry.list().await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Claimable tasks across every priority band
    pub async fn queue_depth(&self) -> QueueResult<u64> {
        let mut depth = 0;
        for band in Priority::DESCENDING {
            depth += self.store.list_len(&self.keys.pending(band)).await?;
        }
        Ok(depth)
    }

    /// Queue-wide counters for monitoring and capacity planning
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(QueueStats {
            pending: self.queue_depth().await?,
            scheduled: self.store.zset_len(&self.keys.scheduled()).await?,
            processing: self.store.zset_len(&self.keys.processing()).await?,
            dead_lettered: self.store.zset_len(&self.keys.dead()).await?,
            workers: self.store.set_members(&self.keys.workers()).await?.len() as u64,
        })
    }

    /// Persist the sticky-map mirror; call before dropping the handle
    pub async fn shutdown(&self) -> QueueResult<()> {
        let bindings: Vec<(String, String)> = {
            let sticky = self.sticky.lock().unwrap();
            sticky.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (key, worker_id) in &bindings {
            self.store
                .hash_set(&self.keys.sticky(), key, worker_id)
                .await?;
        }
        info!(bindings = bindings.len(), "sticky map persisted");
        Ok(())
    }

    /// Push a pending task into its band, newest at the head
    pub(crate) async fn push_pending(&self, task: &TaskRecord) -> QueueResult<()> {
        self.store
            .list_push_head(&self.keys.pending(task.priority), &task.id)
            .await?;
        self.store
            .zset_add(&self.keys.priority(task.priority), &task.id, now_ms() as f64)
            .await?;
        Ok(())
    }
}
