//! Redis-backed KV store
//!
//! Production implementation of [`KvStore`] over a multiplexed tokio
//! connection. Lists, sorted sets, sets, hashes, key TTLs, and streams all
//! map one-to-one onto Redis commands, so every trait method is a single
//! atomic call.

use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use tracing::info;

use crate::kv::{KvResult, KvStore};

/// Redis implementation of the queue's store contract
///
/// The multiplexed connection is cheap to clone, so the store itself is
/// `Clone` and every call pipelines onto the shared connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING
    pub async fn connect(redis_url: &str) -> KvResult<Self> {
        let client = Client::open(redis_url).map_err(crate::kv::KvError::Redis)?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(crate::kv::KvError::Redis)?;
        let _: () = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(crate::kv::KvError::Redis)?;
        info!("connected to redis backend");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> KvResult<()> {
        let mut conn = self.conn.clone();
        Ok(conn.set_ex(key, value, ttl_secs).await?)
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        Ok(conn.del(key).await?)
    }

    async fn list_push_head(&self, key: &str, value: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        Ok(conn.lpush(key, value).await?)
    }

    async fn list_push_tail(&self, key: &str, value: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        Ok(conn.rpush(key, value).await?)
    }

    async fn list_pop_tail(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.rpop(key, None::<NonZeroUsize>).await?)
    }

    async fn list_remove(&self, key: &str, value: &str) -> KvResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.lrem(key, 0, value).await?)
    }

    async fn list_len(&self, key: &str) -> KvResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> KvResult<()> {
        let mut conn = self.conn.clone();
        Ok(conn.zadd(key, member, score).await?)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> KvResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zrem(key, member).await?)
    }

    async fn zset_range_by_score(&self, key: &str, min: f64, max: f64) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrangebyscore(key, min, max).await?)
    }

    async fn zset_range(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrange(key, start, stop).await?)
    }

    async fn zset_len(&self, key: &str) -> KvResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        Ok(conn.sadd(key, member).await?)
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        Ok(conn.srem(key, member).await?)
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn set_contains(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        Ok(conn.hset(key, field, value).await?)
    }

    async fn hash_get(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        Ok(conn.hdel(key, field).await?)
    }

    async fn stream_append(&self, key: &str, fields: &[(&str, &str)]) -> KvResult<String> {
        let mut conn = self.conn.clone();
        Ok(conn.xadd(key, "*", fields).await?)
    }
}
