use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::heartbeat::{HeartbeatKey, HeartbeatStore};
use crate::identifier::Identifier;
use crate::store::{frame_key, FrameSource, MemoryStore, StoreResult};

/// Heartbeats, frames and interactant hashes kept in Redis.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl HeartbeatStore for RedisStore {
    async fn beat(&self, key: &HeartbeatKey, timestamp: f64) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.zadd(&key.collection, &key.member, timestamp).await?;
        Ok(())
    }

    async fn last_beat(&self, key: &HeartbeatKey) -> StoreResult<Option<f64>> {
        let mut conn = self.redis.clone();
        let score: Option<f64> = conn.zscore(&key.collection, &key.member).await?;
        Ok(score)
    }
}

#[async_trait]
impl FrameSource for RedisStore {
    async fn latest_frame(&self, identifier: &Identifier) -> StoreResult<Option<Bytes>> {
        let mut conn = self.redis.clone();
        let frame: Option<Vec<u8>> = conn.get(frame_key(identifier)).await?;
        Ok(frame.map(Bytes::from))
    }
}

#[async_trait]
impl MemoryStore for RedisStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn increment(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        let mut conn = self.redis.clone();
        let value: i64 = conn.hincr(key, field, by).await?;
        Ok(value)
    }

    async fn write_hash(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn get_field(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn record_interaction(&self, key: &str, timestamp: &str) -> StoreResult<i64> {
        let mut conn = self.redis.clone();
        let (session,): (i64,) = redis::pipe()
            .atomic()
            .hincr(key, "session_number", 1)
            .hset(key, "last_interaction", timestamp)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(session)
    }
}
