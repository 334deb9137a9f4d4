use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

use crate::heartbeat::{HeartbeatKey, HeartbeatStore};
use crate::identifier::Identifier;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("value at `{key}` is not usable: {reason}")]
    Corrupt { key: String, reason: String },
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Latest camera frame a device has written for its identifier.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn latest_frame(&self, identifier: &Identifier) -> StoreResult<Option<Bytes>>;
}

/// Hash-shaped records backing the robot memory capability.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn exists(&self, key: &str) -> StoreResult<bool>;
    async fn increment(&self, key: &str, field: &str, by: i64) -> StoreResult<i64>;
    async fn write_hash(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;
    async fn get_field(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    /// Bumps `session_number` and stamps `last_interaction` as one step,
    /// returning the new session number.
    async fn record_interaction(&self, key: &str, timestamp: &str) -> StoreResult<i64>;
}

/// Key under which a device's producer stores its newest frame.
pub fn frame_key(identifier: &Identifier) -> String {
    identifier.channel("image_stream")
}

#[derive(Default)]
struct State {
    scores: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
    blobs: HashMap<String, Bytes>,
}

/// Process-local stand-in for Redis, used by tests and local wiring.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    unreachable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail, as if the server went away.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn put_frame(&self, identifier: &Identifier, frame: impl Into<Bytes>) {
        self.state
            .lock()
            .blobs
            .insert(frame_key(identifier), frame.into());
    }

    pub fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        self.state.lock().hashes.get(key).cloned()
    }

    fn check(&self) -> StoreResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unreachable".into()));
        }
        Ok(())
    }

    fn increment_locked(state: &mut State, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::Corrupt {
                key: format!("{key}.{field}"),
                reason: "hash value is not an integer".into(),
            })?,
            None => 0,
        };
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }
}

#[async_trait]
impl HeartbeatStore for InMemoryStore {
    async fn beat(&self, key: &HeartbeatKey, timestamp: f64) -> StoreResult<()> {
        self.check()?;
        self.state
            .lock()
            .scores
            .entry(key.collection.clone())
            .or_default()
            .insert(key.member.clone(), timestamp);
        Ok(())
    }

    async fn last_beat(&self, key: &HeartbeatKey) -> StoreResult<Option<f64>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .scores
            .get(&key.collection)
            .and_then(|members| members.get(&key.member))
            .copied())
    }
}

#[async_trait]
impl FrameSource for InMemoryStore {
    async fn latest_frame(&self, identifier: &Identifier) -> StoreResult<Option<Bytes>> {
        self.check()?;
        Ok(self.state.lock().blobs.get(&frame_key(identifier)).cloned())
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let state = self.state.lock();
        Ok(state.hashes.contains_key(key) || state.blobs.contains_key(key))
    }

    async fn increment(&self, key: &str, field: &str, by: i64) -> StoreResult<i64> {
        self.check()?;
        Self::increment_locked(&mut self.state.lock(), key, field, by)
    }

    async fn write_hash(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn get_field(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn record_interaction(&self, key: &str, timestamp: &str) -> StoreResult<i64> {
        self.check()?;
        let mut state = self.state.lock();
        let session = Self::increment_locked(&mut state, key, "session_number", 1)?;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert("last_interaction".into(), timestamp.to_string());
        Ok(session)
    }
}
