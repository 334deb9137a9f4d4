use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use relay_bus::{Bus, BusResult, Connector, Subscription};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{Capability, Topic};
use crate::error::BrokerError;
use crate::heartbeat::{HeartbeatKey, HeartbeatStore};
use crate::identifier::Identifier;
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::router::ChannelRouter;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Invoked once when a session finishes cleanup.
pub type DisconnectFn = Box<dyn FnOnce(&Identifier) + Send + 'static>;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub liveness: LivenessConfig,
    /// Cap on concurrently running handlers for non-control topics.
    pub max_in_flight: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Constructing = 0,
    Running = 1,
    ShuttingDown = 2,
    Terminated = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Constructing,
            1 => SessionState::Running,
            2 => SessionState::ShuttingDown,
            _ => SessionState::Terminated,
        }
    }
}

/// What a handler sees of its session: the identifier, the session's own
/// bus connection, and its cancellation.
#[derive(Clone)]
pub struct SessionContext {
    identifier: Identifier,
    bus: Arc<dyn Bus>,
    cancel: CancellationToken,
    end: CancellationToken,
}

impl SessionContext {
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Publishes on `<identifier>_<topic>`.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes> + Send) -> BusResult<()> {
        self.bus
            .publish(&self.identifier.channel(topic), payload.into())
            .await
    }

    pub async fn produce_event(&self, event: &str) -> BusResult<()> {
        self.publish("events", Bytes::copy_from_slice(event.as_bytes()))
            .await
    }

    /// Resolves once the session starts shutting down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Asks the session to clean itself up, as on a terminal control message.
    pub fn end_session(&self) {
        self.end.cancel();
    }
}

/// The working unit of one device: owns its subscriptions, its liveness
/// monitor and its capability, and unwinds them exactly once.
pub struct Session<C: Capability> {
    identifier: Identifier,
    capability: Arc<C>,
    ctx: SessionContext,
    state: AtomicU8,
    permits: Arc<Semaphore>,
    disconnect: Mutex<Option<DisconnectFn>>,
    terminated: CancellationToken,
}

impl<C: Capability> Session<C> {
    /// Connects, subscribes to the capability's channels and starts the
    /// listener and liveness tasks. On error nothing is left running and
    /// `disconnect` is not called.
    pub async fn start(
        identifier: Identifier,
        connector: &dyn Connector,
        capability: C,
        heartbeat: Arc<dyn HeartbeatStore>,
        config: SessionConfig,
        disconnect: DisconnectFn,
    ) -> Result<Arc<Self>, BrokerError> {
        let bus = connector.connect().await?;
        let router = ChannelRouter::<C::Topic>::new(&identifier);
        let subscription = match bus.subscribe(router.filters()).await {
            Ok(subscription) => subscription,
            Err(err) => {
                if let Err(close_err) = bus.close().await {
                    warn!(identifier = %identifier, error = %close_err, "closing bus after failed subscribe");
                }
                return Err(err.into());
            }
        };

        let monitor = LivenessMonitor::new(
            HeartbeatKey::for_device(&identifier, capability.device_type()),
            heartbeat,
            config.liveness,
        );
        let session = Arc::new(Self {
            ctx: SessionContext {
                identifier: identifier.clone(),
                bus,
                cancel: CancellationToken::new(),
                end: CancellationToken::new(),
            },
            identifier,
            capability: Arc::new(capability),
            state: AtomicU8::new(SessionState::Constructing as u8),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            disconnect: Mutex::new(Some(disconnect)),
            terminated: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&session).listen(router, subscription));
        let watched = Arc::clone(&session);
        tokio::spawn(async move {
            if monitor.run(watched.ctx.cancel.clone()).await.is_some() {
                watched.cleanup().await;
            }
        });

        let _ = session.state.compare_exchange(
            SessionState::Constructing as u8,
            SessionState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(identifier = %session.identifier, "session running");
        Ok(session)
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn capability(&self) -> &Arc<C> {
        &self.capability
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Resolves once cleanup has fully completed.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await
    }

    async fn listen(
        self: Arc<Self>,
        router: ChannelRouter<C::Topic>,
        mut subscription: Subscription,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => break,
                _ = self.ctx.end.cancelled() => {
                    info!(identifier = %self.identifier, "session end requested");
                    self.cleanup().await;
                    break;
                }
                message = subscription.recv() => message,
            };
            let Some(message) = message else {
                if !self.ctx.is_cancelled() {
                    warn!(identifier = %self.identifier, "subscription ended; cleaning up session");
                    self.cleanup().await;
                }
                break;
            };
            match router.resolve(&message.channel) {
                Some(topic) => self.dispatch(topic, message.payload),
                None => debug!(identifier = %self.identifier, channel = %message.channel, "unrouted message dropped"),
            }
        }
        debug!(identifier = %self.identifier, "session listener stopped");
    }

    /// Runs the handler on its own task so the listener never waits on it.
    fn dispatch(&self, topic: C::Topic, payload: Bytes) {
        let capability = Arc::clone(&self.capability);
        let ctx = self.ctx.clone();
        let permits = (!topic.is_control()).then(|| Arc::clone(&self.permits));
        tokio::spawn(async move {
            let _permit = match permits {
                Some(permits) => {
                    let acquired = tokio::select! {
                        _ = ctx.cancelled() => return,
                        acquired = permits.acquire_owned() => acquired,
                    };
                    match acquired {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    }
                }
                None => None,
            };
            let identifier = ctx.identifier.clone();
            if let Err(err) = capability.handle(ctx, topic, payload).await {
                warn!(identifier = %identifier, topic = topic.as_str(), error = %err, "handler failed");
            }
        });
    }

    /// Stops the capability, the listener and the liveness monitor, closes
    /// the session's bus connection and reports the exit. Only the first
    /// call does anything.
    pub async fn cleanup(&self) {
        let claimed = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match SessionState::from_u8(raw) {
                    SessionState::Constructing | SessionState::Running => {
                        Some(SessionState::ShuttingDown as u8)
                    }
                    _ => None,
                }
            })
            .is_ok();
        if !claimed {
            debug!(identifier = %self.identifier, "cleanup already in progress");
            return;
        }

        info!(identifier = %self.identifier, "session shutting down");
        self.ctx.cancel.cancel();
        self.permits.close();
        self.capability.teardown().await;
        if let Err(err) = self.ctx.bus.close().await {
            warn!(identifier = %self.identifier, error = %err, "closing session bus failed");
        }
        self.state
            .store(SessionState::Terminated as u8, Ordering::Release);

        let disconnect = self.disconnect.lock().take();
        if let Some(disconnect) = disconnect {
            disconnect(&self.identifier);
        }
        self.terminated.cancel();
        info!(identifier = %self.identifier, "session terminated");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use relay_bus::LocalBus;

    use super::*;
    use crate::heartbeat::{unix_now, DeviceType};
    use crate::store::InMemoryStore;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum EchoTopic {
        Ping,
        Quit,
    }

    impl Topic for EchoTopic {
        const ALL: &'static [Self] = &[EchoTopic::Ping, EchoTopic::Quit];

        fn as_str(self) -> &'static str {
            match self {
                EchoTopic::Ping => "ping",
                EchoTopic::Quit => "quit",
            }
        }

        fn is_control(self) -> bool {
            matches!(self, EchoTopic::Quit)
        }
    }

    #[derive(Default)]
    struct Echo {
        torn_down: AtomicUsize,
    }

    #[async_trait]
    impl Capability for Echo {
        type Topic = EchoTopic;

        fn device_type(&self) -> DeviceType {
            DeviceType::Mic
        }

        async fn handle(
            self: Arc<Self>,
            ctx: SessionContext,
            topic: EchoTopic,
            payload: Bytes,
        ) -> anyhow::Result<()> {
            match topic {
                EchoTopic::Ping => ctx.publish("pong", payload).await?,
                EchoTopic::Quit => ctx.end_session(),
            }
            Ok(())
        }

        async fn teardown(&self) {
            self.torn_down.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn start_echo(
        bus: &LocalBus,
        store: Arc<InMemoryStore>,
        exits: Arc<AtomicUsize>,
    ) -> Arc<Session<Echo>> {
        let id = Identifier::parse("dana-778899").unwrap();
        store
            .beat(&HeartbeatKey::for_device(&id, DeviceType::Mic), unix_now())
            .await
            .unwrap();
        Session::start(
            id,
            bus,
            Echo::default(),
            store,
            SessionConfig::default(),
            Box::new(move |_: &Identifier| {
                exits.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .expect("session starts")
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn routes_messages_and_publishes_replies() {
        let bus = LocalBus::new();
        let observer = bus.connection();
        let mut replies = observer
            .subscribe(vec![relay_bus::ChannelFilter::Exact("dana-778899_pong".into())])
            .await
            .unwrap();
        let session = start_echo(&bus, Arc::new(InMemoryStore::new()), Arc::default()).await;
        assert_eq!(session.state(), SessionState::Running);

        bus.deliver("dana-778899_ping", "hello");
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.text(), "hello");
        session.cleanup().await;
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn cleanup_twice_disconnects_once() {
        let bus = LocalBus::new();
        let exits = Arc::new(AtomicUsize::new(0));
        let session = start_echo(&bus, Arc::new(InMemoryStore::new()), exits.clone()).await;
        assert_eq!(bus.subscriber_count(), 1);

        tokio::join!(session.cleanup(), session.cleanup());
        session.cleanup().await;
        session.terminated().await;

        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(session.capability().torn_down.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn terminal_message_ends_session() {
        let bus = LocalBus::new();
        let exits = Arc::new(AtomicUsize::new(0));
        let session = start_echo(&bus, Arc::new(InMemoryStore::new()), exits.clone()).await;

        bus.deliver("dana-778899_quit", "");
        session.terminated().await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn missing_heartbeat_ends_session() {
        let bus = LocalBus::new();
        let exits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&exits);
        let config = SessionConfig {
            liveness: LivenessConfig {
                stale_after: Duration::from_secs(60),
                poll_interval: Duration::from_millis(20),
            },
            ..SessionConfig::default()
        };
        let session = Session::start(
            Identifier::parse("erin-001122").unwrap(),
            &bus,
            Echo::default(),
            Arc::new(InMemoryStore::new()),
            config,
            Box::new(move |_: &Identifier| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
        session.terminated().await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
