//! KV adapter - Primitive operations over the shared store
//!
//! The queue relies on a small set of atomic primitives from its backing
//! store: string values with TTLs, ordered lists, sorted sets, unordered
//! sets, hashmaps, and an append-only log. This module defines that contract
//! as a trait; it carries no queue semantics of its own, callers compose the
//! primitives.
//!
//! Two implementations ship with the crate: [`RedisStore`](crate::redis_store::RedisStore)
//! for production deployments and [`MemoryStore`](crate::memory_store::MemoryStore)
//! for tests and embedded use.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::types::Priority;

/// Errors raised by a KV store implementation
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Redis backend errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for store operations
pub type KvResult<T> = Result<T, KvError>;

/// Atomic primitives required of the backing store
///
/// Every method maps to a single atomic call on the store; no multi-key
/// transactions and no scripting are required. Lists are oriented so that
/// values are pushed at the head and popped at the tail.
#[async_trait]
pub trait KvStore: Send + Sync {
    // String values

    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Set a value with a TTL in seconds
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> KvResult<()>;

    async fn delete(&self, key: &str) -> KvResult<()>;

    // Ordered lists

    async fn list_push_head(&self, key: &str, value: &str) -> KvResult<()>;

    async fn list_push_tail(&self, key: &str, value: &str) -> KvResult<()>;

    /// Pop the oldest value; single-winner under concurrent callers
    async fn list_pop_tail(&self, key: &str) -> KvResult<Option<String>>;

    /// Remove every occurrence of `value`, returning how many were removed
    async fn list_remove(&self, key: &str, value: &str) -> KvResult<u64>;

    async fn list_len(&self, key: &str) -> KvResult<u64>;

    // Sorted sets

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> KvResult<()>;

    /// Remove a member, returning how many were removed; a zero return means
    /// another caller won the race
    async fn zset_remove(&self, key: &str, member: &str) -> KvResult<u64>;

    /// Members with scores in `[min, max]`, ascending
    async fn zset_range_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<Vec<String>>;

    /// Members by rank, ascending; negative indices count from the end
    async fn zset_range(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>>;

    async fn zset_len(&self, key: &str) -> KvResult<u64>;

    // Unordered sets

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()>;

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<()>;

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>>;

    async fn set_contains(&self, key: &str, member: &str) -> KvResult<bool>;

    // Hashmaps

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> KvResult<()>;

    async fn hash_get(&self, key: &str, field: &str) -> KvResult<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, String>>;

    async fn hash_delete(&self, key: &str, field: &str) -> KvResult<()>;

    // Append-only log

    /// Append an entry, returning the server-assigned sequence id
    async fn stream_append(&self, key: &str, fields: &[(&str, &str)]) -> KvResult<String>;
}

/// Key layout on the store
///
/// Every key is namespaced under the configured prefix so multiple queues
/// can share one store.
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// FIFO list of claimable task ids for one priority band
    pub fn pending(&self, priority: Priority) -> String {
        format!("{}:queue:pending:{}", self.prefix, priority.as_str())
    }

    /// Cross-check sorted set of queued ids at one priority band
    pub fn priority(&self, priority: Priority) -> String {
        format!("{}:queue:priority:{}", self.prefix, priority.as_str())
    }

    /// Sorted set of delayed task ids scored by due time
    pub fn scheduled(&self) -> String {
        format!("{}:queue:scheduled", self.prefix)
    }

    /// Sorted set of held task ids scored by claim time
    pub fn processing(&self) -> String {
        format!("{}:tasks:processing", self.prefix)
    }

    /// Sorted set of dead-letter envelopes scored by death time
    pub fn dead(&self) -> String {
        format!("{}:queue:dead", self.prefix)
    }

    /// JSON task record
    pub fn task(&self, id: &str) -> String {
        format!("{}:task:{}", self.prefix, id)
    }

    /// JSON worker record
    pub fn worker(&self, id: &str) -> String {
        format!("{}:agent:{}", self.prefix, id)
    }

    /// Set of registered worker ids
    pub fn workers(&self) -> String {
        format!("{}:agents", self.prefix)
    }

    /// Hashmap of sticky-key to worker-id bindings
    pub fn sticky(&self) -> String {
        format!("{}:sticky:map", self.prefix)
    }

    /// Append-only event log for cross-process consumers
    pub fn stream(&self) -> String {
        format!("{}:stream", self.prefix)
    }
}
