//! In-memory KV store
//!
//! Test and embedded implementation of [`KvStore`]. Keeps the same primitive
//! semantics as the Redis backend: head-push tail-pop lists, score-ordered
//! sorted sets, lazy TTL expiry on string values, and a monotonically
//! sequenced append-only log.
//!
//! All state lives behind one mutex; no lock is ever held across an await
//! point because every operation is synchronous under the hood.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::kv::{KvResult, KvStore};

#[derive(Default)]
struct Inner {
    strings: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    streams: HashMap<String, (u64, Vec<(String, Vec<(String, String)>)>)>,
}

impl Inner {
    fn live_string(&mut self, key: &str) -> Option<&String> {
        if let Some((_, Some(deadline))) = self.strings.get(key) {
            if Instant::now() >= *deadline {
                self.strings.remove(key);
                return None;
            }
        }
        self.strings.get(key).map(|(v, _)| v)
    }

    /// Members of a sorted set ordered by (score, member)
    fn sorted_members(&self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        members
    }
}

/// Mutex-guarded in-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of an append-only log, for assertions in tests
    pub fn stream_entries(&self, key: &str) -> Vec<(String, Vec<(String, String)>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .streams
            .get(key)
            .map(|(_, entries)| entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.live_string(key).cloned())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> KvResult<()> {
        let deadline = Instant::now() + Duration::from_secs(ttl_secs);
        let mut inner = self.inner.lock().unwrap();
        inner
            .strings
            .insert(key.to_string(), (value.to_string(), Some(deadline)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.remove(key);
        Ok(())
    }

    async fn list_push_head(&self, key: &str, value: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn list_push_tail(&self, key: &str, value: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_pop_tail(&self, key: &str) -> KvResult<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.lists.get_mut(key).and_then(|l| l.pop_back()))
    }

    async fn list_remove(&self, key: &str, value: &str) -> KvResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        Ok((before - list.len()) as u64)
    }

    async fn list_len(&self, key: &str) -> KvResult<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> KvResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner
            .zsets
            .get_mut(key)
            .map(|m| m.remove(member).is_some())
            .unwrap_or(false);
        Ok(removed as u64)
    }

    async fn zset_range_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sorted_members(key)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zset_range(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let members = inner.sorted_members(key);
        let len = members.len() as isize;
        let clamp = |idx: isize| -> isize {
            if idx < 0 {
                (len + idx).max(0)
            } else {
                idx.min(len)
            }
        };
        let from = clamp(start);
        let to = clamp(stop);
        if from >= len || to < from {
            return Ok(Vec::new());
        }
        Ok(members[from as usize..=(to.min(len - 1)) as usize]
            .iter()
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn zset_len(&self, key: &str) -> KvResult<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.zsets.get(key).map(|m| m.len() as u64).unwrap_or(0))
    }

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_contains(&self, key: &str, member: &str) -> KvResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sets.get(key).map(|s| s.contains(member)).unwrap_or(false))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(hash) = inner.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn stream_append(&self, key: &str, fields: &[(&str, &str)]) -> KvResult<String> {
        let mut inner = self.inner.lock().unwrap();
        let (seq, entries) = inner.streams.entry(key.to_string()).or_default();
        *seq += 1;
        let id = format!("{}-0", seq);
        entries.push((
            id.clone(),
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        Ok(id)
    }
}
