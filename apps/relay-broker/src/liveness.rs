use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::heartbeat::{unix_now, HeartbeatKey, HeartbeatStore};

#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// Heartbeats older than this mark the device as gone.
    pub stale_after: Duration,
    /// Delay between checks; slightly longer than the announce interval.
    pub poll_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            poll_interval: Duration::from_millis(60_100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Alive,
    Stale { age: Duration },
    Missing,
    Unreachable(String),
}

impl Verdict {
    pub fn is_alive(&self) -> bool {
        matches!(self, Verdict::Alive)
    }
}

/// Watches one device's heartbeat entry for the lifetime of a session.
pub struct LivenessMonitor {
    key: HeartbeatKey,
    store: Arc<dyn HeartbeatStore>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(key: HeartbeatKey, store: Arc<dyn HeartbeatStore>, config: LivenessConfig) -> Self {
        Self { key, store, config }
    }

    pub fn key(&self) -> &HeartbeatKey {
        &self.key
    }

    pub async fn check(&self) -> Verdict {
        self.check_at(unix_now()).await
    }

    async fn check_at(&self, now: f64) -> Verdict {
        match self.store.last_beat(&self.key).await {
            Ok(Some(beat)) => match Duration::try_from_secs_f64((now - beat).max(0.0)) {
                Ok(age) if age <= self.config.stale_after => Verdict::Alive,
                Ok(age) => Verdict::Stale { age },
                // -inf or a score too far in the past for a Duration
                Err(_) => Verdict::Stale { age: Duration::MAX },
            },
            Ok(None) => Verdict::Missing,
            Err(err) => Verdict::Unreachable(err.to_string()),
        }
    }

    /// Checks until the device is judged gone or `cancel` fires. Returns the
    /// failing verdict, or `None` when cancelled first.
    pub async fn run(&self, cancel: CancellationToken) -> Option<Verdict> {
        loop {
            let verdict = tokio::select! {
                _ = cancel.cancelled() => return None,
                verdict = self.check() => verdict,
            };
            if !verdict.is_alive() {
                info!(
                    collection = %self.key.collection,
                    member = %self.key.member,
                    ?verdict,
                    "device heartbeat lost"
                );
                return Some(verdict);
            }
            debug!(collection = %self.key.collection, member = %self.key.member, "heartbeat fresh");
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}
