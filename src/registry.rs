//! Worker registry - Registration, heartbeats, liveness, load accounting
//!
//! Worker records live on the store with a TTL of twice the heartbeat
//! timeout, so a worker that stops heartbeating disappears on its own even
//! if no scheduler instance is around to mark it offline. The registry keeps
//! a short-lived snapshot cache of available workers so the availability
//! query stays cheap enough to run on every claim.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::kv::{Keyspace, KvStore};
use crate::types::{
    QueueConfig, QueueError, QueueResult, WorkerOptions, WorkerRecord, WorkerStatus,
    SCHEMA_VERSION,
};
use crate::utils::{generate_worker_id, now_ms};

/// Registry over the worker records and the worker id set
pub struct WorkerRegistry {
    store: Arc<dyn KvStore>,
    keys: Arc<Keyspace>,
    heartbeat_timeout_ms: u64,
    worker_ttl_secs: u64,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<WorkerRecord>)>>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn KvStore>, keys: Arc<Keyspace>, config: &QueueConfig) -> Self {
        Self {
            store,
            keys,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            worker_ttl_secs: config.worker_ttl_secs(),
            cache_ttl: Duration::from_millis(config.poll_interval_ms),
            cache: Mutex::new(None),
        }
    }

    /// Register a worker, replacing any previous record under the same id
    pub async fn register(&self, options: WorkerOptions) -> QueueResult<WorkerRecord> {
        let now = now_ms();
        let record = WorkerRecord {
            schema: SCHEMA_VERSION,
            id: options.id.unwrap_or_else(generate_worker_id),
            skills: options.skills,
            capacity: options.capacity.unwrap_or(1).max(1),
            current_load: 0,
            status: WorkerStatus::Idle,
            registered_at_ms: now,
            last_heartbeat_ms: now,
            metadata: options.metadata,
        };

        self.save(&record).await?;
        self.store
            .set_add(&self.keys.workers(), &record.id)
            .await?;
        self.invalidate();
        info!(worker_id = %record.id, capacity = record.capacity, "worker registered");
        Ok(record)
    }

    /// Fetch a worker record
    pub async fn get(&self, id: &str) -> QueueResult<WorkerRecord> {
        let key = self.keys.worker(id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| QueueError::WorkerNotFound(id.to_string()))?;
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(key = %key, error = %e, "stored worker record failed to decode");
                Err(QueueError::WorkerNotFound(id.to_string()))
            }
        }
    }

    /// Every registered worker whose record is still live
    pub async fn list(&self) -> QueueResult<Vec<WorkerRecord>> {
        let ids = self.store.set_members(&self.keys.workers()).await?;
        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(record) => workers.push(record),
                // Record expired or unreadable; the id set entry is stale.
                Err(QueueError::WorkerNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(workers)
    }

    /// Record a liveness ping, recomputing idle/busy from load
    pub async fn heartbeat(&self, id: &str) -> QueueResult<WorkerRecord> {
        let mut record = self.get(id).await?;
        record.last_heartbeat_ms = now_ms();
        record.status = if record.current_load >= record.capacity {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        };
        self.save(&record).await?;
        self.invalidate();
        debug!(worker_id = %id, status = ?record.status, "heartbeat");
        Ok(record)
    }

    /// Adjust a worker's load by `delta`, clamped at zero
    ///
    /// A missing worker is logged and ignored; load accounting is
    /// best-effort around unregister and expiry races.
    pub async fn adjust_load(&self, id: &str, delta: i64) -> QueueResult<()> {
        let mut record = match self.get(id).await {
            Ok(record) => record,
            Err(QueueError::WorkerNotFound(_)) => {
                warn!(worker_id = %id, delta, "load adjustment for unknown worker");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let adjusted = i64::from(record.current_load) + delta;
        // The clamp is a safety belt; a negative result means double
        // accounting upstream.
        if adjusted < 0 {
            warn!(worker_id = %id, delta, "worker load would go negative, clamping");
        }
        record.current_load = adjusted.max(0) as u32;
        if record.status != WorkerStatus::Offline {
            record.status = if record.current_load >= record.capacity {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Idle
            };
        }
        self.save(&record).await?;
        self.invalidate();
        Ok(())
    }

    /// Mark a worker offline, shortening its record TTL so the stale entry
    /// disappears soon after
    pub async fn mark_offline(&self, id: &str) -> QueueResult<WorkerRecord> {
        let mut record = self.get(id).await?;
        record.status = WorkerStatus::Offline;
        let encoded = serde_json::to_string(&record)?;
        let short_ttl = (self.heartbeat_timeout_ms / 1_000).max(1);
        self.store
            .set_ex(&self.keys.worker(id), &encoded, short_ttl)
            .await?;
        self.invalidate();
        Ok(record)
    }

    /// Drop a worker's record and its id set entry
    pub async fn remove(&self, id: &str) -> QueueResult<()> {
        self.store.delete(&self.keys.worker(id)).await?;
        self.store.set_remove(&self.keys.workers(), id).await?;
        self.invalidate();
        info!(worker_id = %id, "worker removed");
        Ok(())
    }

    /// Snapshot of workers eligible to receive a task: fresh heartbeat,
    /// not offline, free capacity. Sorted by id so policies see a stable
    /// order. Cached for at most one scheduler tick and invalidated on any
    /// registry write.
    pub async fn available(&self) -> QueueResult<Vec<WorkerRecord>> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some((at, snapshot)) = cache.as_ref() {
                if at.elapsed() <= self.cache_ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let now = now_ms();
        let mut workers: Vec<WorkerRecord> = self
            .list()
            .await?
            .into_iter()
            .filter(|w| {
                w.status != WorkerStatus::Offline
                    && w.is_heartbeat_fresh(now, self.heartbeat_timeout_ms)
                    && w.has_free_capacity()
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        *self.cache.lock().unwrap() = Some((Instant::now(), workers.clone()));
        Ok(workers)
    }

    fn invalidate(&self) {
        *self.cache.lock().unwrap() = None;
    }

    async fn save(&self, record: &WorkerRecord) -> QueueResult<()> {
        let encoded = serde_json::to_string(record)?;
        self.store
            .set_ex(&self.keys.worker(&record.id), &encoded, self.worker_ttl_secs)
            .await?;
        Ok(())
    }
}
