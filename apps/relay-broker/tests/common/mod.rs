#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_broker::capability::{Capability, Topic};
use relay_broker::heartbeat::{unix_now, DeviceType, HeartbeatKey, HeartbeatStore};
use relay_broker::store::InMemoryStore;
use relay_broker::{Identifier, SessionContext};
use relay_bus::{Bus, BusMessage, BusResult, ChannelFilter, Connector, Subscription};
use tokio::sync::mpsc;

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receives until a message arrives on `channel`, skipping everything else.
pub async fn next_on(subscription: &mut Subscription, channel: &str) -> BusMessage {
    loop {
        let message = subscription.recv().await.expect("subscription open");
        if message.channel == channel {
            return message;
        }
    }
}

pub async fn fresh_beat(store: &InMemoryStore, raw: &str, device_type: DeviceType) -> Identifier {
    let identifier = Identifier::parse(raw).unwrap();
    store
        .beat(&HeartbeatKey::for_device(&identifier, device_type), unix_now())
        .await
        .unwrap();
    identifier
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeTopic {
    Events,
    Work,
}

impl Topic for ProbeTopic {
    const ALL: &'static [Self] = &[ProbeTopic::Events, ProbeTopic::Work];

    fn as_str(self) -> &'static str {
        match self {
            ProbeTopic::Events => "events",
            ProbeTopic::Work => "work",
        }
    }

    fn is_control(self) -> bool {
        matches!(self, ProbeTopic::Events)
    }
}

/// Minimal capability: `work` payload `block` never finishes, anything else
/// is echoed on `done`; `events` payload `stop` flips a flag and answers
/// `Stopped`.
#[derive(Default)]
pub struct Probe {
    pub stopped: AtomicBool,
    pub torn_down: AtomicBool,
}

#[async_trait]
impl Capability for Probe {
    type Topic = ProbeTopic;

    fn device_type(&self) -> DeviceType {
        DeviceType::Cam
    }

    async fn handle(
        self: Arc<Self>,
        ctx: SessionContext,
        topic: ProbeTopic,
        payload: Bytes,
    ) -> anyhow::Result<()> {
        match (topic, &payload[..]) {
            (ProbeTopic::Work, b"block") => std::future::pending::<()>().await,
            (ProbeTopic::Work, _) => ctx.publish("done", payload).await?,
            (ProbeTopic::Events, b"stop") => {
                self.stopped.store(true, Ordering::SeqCst);
                ctx.produce_event("Stopped").await?;
            }
            (ProbeTopic::Events, _) => {}
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }
}

type Feed = (Vec<ChannelFilter>, mpsc::UnboundedSender<BusMessage>);

/// Bus whose subscriptions the test can end at will, as when the
/// connection to the server drops. Publishing goes nowhere.
#[derive(Clone, Default)]
pub struct SeveredBus {
    feeds: Arc<Mutex<Vec<Feed>>>,
}

impl SeveredBus {
    /// Ends every subscription listening on `channel`.
    pub fn sever(&self, channel: &str) -> usize {
        let mut feeds = self.feeds.lock();
        let before = feeds.len();
        feeds.retain(|(filters, _)| !filters.iter().any(|filter| filter.matches(channel)));
        before - feeds.len()
    }
}

#[async_trait]
impl Connector for SeveredBus {
    async fn connect(&self) -> BusResult<Arc<dyn Bus>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Bus for SeveredBus {
    async fn publish(&self, _channel: &str, _payload: Bytes) -> BusResult<()> {
        Ok(())
    }

    async fn subscribe(&self, filters: Vec<ChannelFilter>) -> BusResult<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.feeds.lock().push((filters, sender));
        Ok(Subscription::new(receiver))
    }

    async fn close(&self) -> BusResult<()> {
        Ok(())
    }
}
