use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use relay_bus::{Bus, BusError, BusMessage, BusResult, ChannelFilter, Connector, Subscription};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

fn transport(err: redis::RedisError) -> BusError {
    BusError::Transport(err.to_string())
}

/// Opens Redis pub/sub connections; every `connect` is an independent
/// connection with its own subscriptions.
#[derive(Clone)]
pub struct RedisConnector {
    client: Client,
}

impl RedisConnector {
    pub fn open(redis_url: &str) -> BusResult<Self> {
        let client = Client::open(redis_url).map_err(|err| BusError::Connect(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> BusResult<Arc<dyn Bus>> {
        let publisher = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|err| BusError::Connect(err.to_string()))?;
        Ok(Arc::new(RedisBus {
            client: self.client.clone(),
            publisher,
            pumps: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisBus {
    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()> {
        self.ensure_open()?;
        let mut conn = self.publisher.clone();
        let _: i64 = conn
            .publish(channel, &payload[..])
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn subscribe(&self, filters: Vec<ChannelFilter>) -> BusResult<Subscription> {
        self.ensure_open()?;
        let mut pubsub = self.client.get_async_pubsub().await.map_err(transport)?;
        for filter in &filters {
            match filter {
                ChannelFilter::Exact(name) => pubsub.subscribe(name).await.map_err(transport)?,
                ChannelFilter::Pattern(pattern) => {
                    pubsub.psubscribe(pattern).await.map_err(transport)?
                }
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let message = BusMessage::new(
                    msg.get_channel_name(),
                    Bytes::copy_from_slice(msg.get_payload_bytes()),
                );
                if sender.send(message).is_err() {
                    break;
                }
            }
            debug!(filters = filters.len(), "redis subscription pump stopped");
        });

        let mut pumps = self.pumps.lock();
        if self.closed.load(Ordering::Acquire) {
            pump.abort();
            return Err(BusError::Closed);
        }
        pumps.push(pump);
        Ok(Subscription::new(receiver))
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pumps = std::mem::take(&mut *self.pumps.lock());
        for pump in pumps {
            pump.abort();
        }
        Ok(())
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        for pump in self.pumps.get_mut().drain(..) {
            pump.abort();
        }
    }
}
