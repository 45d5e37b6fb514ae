//! Scheduler loops - Due-task promotion and worker expiry
//!
//! Two periodic sweeps keep the queue healthy: promotion moves scheduled
//! tasks whose due time has arrived into their pending band, and expiry
//! marks silent workers offline and fail-reassigns everything they held.
//! The expiry pass also recovers orphans: processing-set entries whose
//! claim was interrupted or whose worker record has vanished entirely.
//!
//! Both sweeps are idempotent under concurrent scheduler instances. The
//! races all resolve through single-winner store primitives: a sorted-set
//! remove that returns zero means another instance already took the entry.
//! Each sweep is also callable directly, which is how tests tick the
//! scheduler deterministically.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::engine::TaskQueue;
use crate::events::{EventType, QueueEvent};
use crate::kv::KvStore;
use crate::lifecycle::Transition;
use crate::types::{QueueError, QueueResult, TaskStatus, WorkerStatus};
use crate::utils::now_ms;

/// Driver for the periodic queue sweeps
#[derive(Clone)]
pub struct QueueScheduler {
    queue: Arc<TaskQueue>,
    shutdown: Arc<RwLock<bool>>,
}

impl QueueScheduler {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            queue,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Spawn both sweep loops; they run until [`shutdown`](Self::shutdown)
    pub fn start(&self) {
        let promoter = self.clone();
        tokio::spawn(async move {
            let cadence = promoter.queue.config().poll_interval_ms.max(1);
            let mut ticker = interval(Duration::from_millis(cadence));
            loop {
                ticker.tick().await;
                if *promoter.shutdown.read().await {
                    break;
                }
                if let Err(e) = promoter.promote_due().await {
                    warn!(error = %e, "promotion sweep failed");
                }
            }
            info!("promotion loop stopped");
        });

        let expirer = self.clone();
        tokio::spawn(async move {
            let cadence = expirer.queue.config().heartbeat_timeout_ms.max(1);
            let mut ticker = interval(Duration::from_millis(cadence));
            loop {
                ticker.tick().await;
                if *expirer.shutdown.read().await {
                    break;
                }
                if let Err(e) = expirer.expire_workers().await {
                    warn!(error = %e, "worker expiry sweep failed");
                }
            }
            info!("expiry loop stopped");
        });

        info!("scheduler loops started");
    }

    /// Signal both loops to stop after their current tick
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
    }

    /// Move every scheduled task whose due time has arrived into its
    /// pending band, returning how many were promoted
    pub async fn promote_due(&self) -> QueueResult<usize> {
        let queue = &self.queue;
        let now = now_ms();
        let due = queue
            .store
            .zset_range_by_score(&queue.keys.scheduled(), f64::NEG_INFINITY, now as f64)
            .await?;

        let mut promoted = 0;
        for id in due {
            // Single winner: a zero remove count means another scheduler
            // instance already promoted this id.
            if queue
                .store
                .zset_remove(&queue.keys.scheduled(), &id)
                .await?
                == 0
            {
                continue;
            }
            let mut task = match queue.tasks.load(&id).await {
                Ok(task) => task,
                Err(QueueError::TaskNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if task.status != TaskStatus::Scheduled {
                continue;
            }

            queue.tasks.apply(&mut task, Transition::Promote)?;
            queue.tasks.save(&task).await?;
            queue.push_pending(&task).await?;
            promoted += 1;

            debug!(task_id = %id, "scheduled task promoted");
            queue
                .events
                .publish(QueueEvent::for_task(EventType::TaskPromoted, &id))
                .await;
        }
        Ok(promoted)
    }

    /// Mark silent workers offline and recover everything in the
    /// processing set that no live worker holds, returning how many
    /// workers were expired
    pub async fn expire_workers(&self) -> QueueResult<usize> {
        let queue = &self.queue;
        let now = now_ms();
        let timeout = queue.config().heartbeat_timeout_ms;

        let mut expired = 0;
        let mut online = 0;
        for worker in queue.registry.list().await? {
            if worker.status == WorkerStatus::Offline {
                continue;
            }
            if worker.is_heartbeat_fresh(now, timeout) {
                online += 1;
                continue;
            }

            queue.registry.mark_offline(&worker.id).await?;
            expired += 1;
            warn!(worker_id = %worker.id, "worker heartbeat timed out, marked offline");
            queue
                .events
                .publish(QueueEvent::for_worker(EventType::WorkerOffline, &worker.id))
                .await;
        }
        queue.metrics.workers_online.set(online);

        self.sweep_processing(now, timeout).await?;
        Ok(expired)
    }

    /// Walk the processing set and resolve every entry whose holder is
    /// gone: interrupted claims go back to their band, tasks held by dead
    /// workers take the failure path, stale guard entries are dropped
    async fn sweep_processing(&self, now: u64, timeout: u64) -> QueueResult<()> {
        let queue = &self.queue;
        let held = queue.store.zset_range(&queue.keys.processing(), 0, -1).await?;

        for id in held {
            let task = match queue.tasks.load(&id).await {
                Ok(task) => task,
                Err(QueueError::TaskNotFound(_)) => {
                    queue.store.zset_remove(&queue.keys.processing(), &id).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match task.status {
                TaskStatus::Pending => {
                    // A claim parked the id and died before assigning.
                    // Return it to its band, deduplicating first in case
                    // the push already happened.
                    let pending_key = queue.keys.pending(task.priority);
                    queue.store.list_remove(&pending_key, &id).await?;
                    queue.store.list_push_head(&pending_key, &id).await?;
                    queue.store.zset_remove(&queue.keys.processing(), &id).await?;
                    debug!(task_id = %id, "recovered interrupted claim");
                }
                TaskStatus::Assigned | TaskStatus::Processing => {
                    let holder_alive = match task.assigned_to.as_deref() {
                        None => false,
                        Some(worker_id) => match queue.registry.get(worker_id).await {
                            Ok(worker) => {
                                worker.status != WorkerStatus::Offline
                                    && worker.is_heartbeat_fresh(now, timeout)
                            }
                            Err(QueueError::WorkerNotFound(_)) => false,
                            Err(e) => return Err(e),
                        },
                    };
                    if !holder_alive {
                        queue.fail(&id, "worker heartbeat timeout").await?;
                    }
                }
                _ => {
                    // Completed, cancelled, dead, or already rescheduled:
                    // the guard entry is stale.
                    queue.store.zset_remove(&queue.keys.processing(), &id).await?;
                }
            }
        }
        Ok(())
    }
}
