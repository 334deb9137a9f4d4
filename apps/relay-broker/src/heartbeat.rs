use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::identifier::Identifier;
use crate::store::StoreResult;

/// How often device producers refresh their heartbeat entry.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(59_900);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cam,
    Mic,
    Robot,
    Speaker,
    Tablet,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Cam => "cam",
            DeviceType::Mic => "mic",
            DeviceType::Robot => "robot",
            DeviceType::Speaker => "speaker",
            DeviceType::Tablet => "tablet",
        }
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cam" => Ok(DeviceType::Cam),
            "mic" => Ok(DeviceType::Mic),
            "robot" => Ok(DeviceType::Robot),
            "speaker" => Ok(DeviceType::Speaker),
            "tablet" => Ok(DeviceType::Tablet),
            other => Err(format!("unknown device type `{other}`")),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of one device's heartbeat: member `<device>:<type>` of the
/// sorted collection `user:<user>`, scored by unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeartbeatKey {
    pub collection: String,
    pub member: String,
}

impl HeartbeatKey {
    pub fn for_device(identifier: &Identifier, device_type: DeviceType) -> Self {
        Self {
            collection: format!("user:{}", identifier.user()),
            member: format!("{}:{}", identifier.device(), device_type),
        }
    }
}

#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    async fn beat(&self, key: &HeartbeatKey, timestamp: f64) -> StoreResult<()>;
    async fn last_beat(&self, key: &HeartbeatKey) -> StoreResult<Option<f64>>;
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Device-side producer: refreshes `key` every `interval` until cancelled.
pub fn spawn_announcer(
    store: Arc<dyn HeartbeatStore>,
    key: HeartbeatKey,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match store.beat(&key, unix_now()).await {
                        Ok(()) => debug!(collection = %key.collection, member = %key.member, "heartbeat written"),
                        Err(err) => warn!(collection = %key.collection, member = %key.member, error = %err, "heartbeat write failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test_timeout::timeout]
    fn key_layout() {
        let id = Identifier::parse("alice-AA-BB").unwrap();
        let key = HeartbeatKey::for_device(&id, DeviceType::Cam);
        assert_eq!(key.collection, "user:alice");
        assert_eq!(key.member, "AA-BB:cam");
    }

    #[test_timeout::timeout]
    fn device_types_parse() {
        for ty in [
            DeviceType::Cam,
            DeviceType::Mic,
            DeviceType::Robot,
            DeviceType::Speaker,
            DeviceType::Tablet,
        ] {
            assert_eq!(ty.as_str().parse::<DeviceType>(), Ok(ty));
        }
        assert!("laptop".parse::<DeviceType>().is_err());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn announcer_refreshes_until_cancelled() {
        let store = Arc::new(InMemoryStore::new());
        let bob = Identifier::parse("bob-112233").unwrap();
        let key = HeartbeatKey::for_device(&bob, DeviceType::Mic);
        let cancel = CancellationToken::new();
        let handle = spawn_announcer(
            store.clone(),
            key.clone(),
            Duration::from_millis(20),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        let first = store.last_beat(&key).await.unwrap().expect("beat written");
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = store.last_beat(&key).await.unwrap().unwrap();
        assert!(second >= first);

        cancel.cancel();
        handle.await.expect("announcer exits");
    }
}
