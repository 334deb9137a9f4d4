use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::Mutex;
use relay_bus::{Bus, ChannelFilter, Connector, Subscription};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capability::{Capability, CapabilityFactory};
use crate::error::BrokerError;
use crate::heartbeat::HeartbeatStore;
use crate::identifier::Identifier;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionConfig};

pub type SessionOf<F> = Session<<F as CapabilityFactory>::Capability>;

/// What became of one registration message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Started(Identifier),
    AlreadyActive(Identifier),
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Exact name or glob pattern carrying device identifiers.
    pub registration_channel: String,
    pub session: SessionConfig,
}

/// Admits one session per announced identifier and coordinates shutdown.
pub struct Broker<F: CapabilityFactory> {
    inner: Arc<BrokerInner<F>>,
}

impl<F: CapabilityFactory> Clone for Broker<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct BrokerInner<F: CapabilityFactory> {
    factory: F,
    connector: Arc<dyn Connector>,
    heartbeat: Arc<dyn HeartbeatStore>,
    registry: SessionRegistry<F::Capability>,
    settings: BrokerSettings,
    bus: Arc<dyn Bus>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    registration_lost: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<F: CapabilityFactory> Broker<F> {
    /// Connects and subscribes to the registration channel. Any failure here
    /// is fatal to the caller.
    pub async fn start(
        factory: F,
        connector: Arc<dyn Connector>,
        heartbeat: Arc<dyn HeartbeatStore>,
        settings: BrokerSettings,
    ) -> Result<Self, BrokerError> {
        let bus = connector.connect().await?;
        let filter = ChannelFilter::parse(&settings.registration_channel);
        let subscription = bus.subscribe(vec![filter]).await?;
        info!(channel = %settings.registration_channel, "listening for registrations");

        let broker = Self {
            inner: Arc::new(BrokerInner {
                factory,
                connector,
                heartbeat,
                registry: SessionRegistry::new(),
                settings,
                bus,
                cancel: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
                registration_lost: CancellationToken::new(),
                listener: Mutex::new(None),
            }),
        };
        let handle = tokio::spawn(broker.clone().listen(subscription));
        *broker.inner.listener.lock() = Some(handle);
        Ok(broker)
    }

    async fn listen(self, mut subscription: Subscription) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                message = subscription.recv() => message,
            };
            let Some(message) = message else {
                if !self.is_shut_down() {
                    error!(channel = %self.inner.settings.registration_channel, "registration subscription ended");
                    self.inner.registration_lost.cancel();
                }
                break;
            };
            let broker = self.clone();
            tokio::spawn(async move {
                match broker.on_registration(message.payload).await {
                    Ok(_) | Err(BrokerError::ShutDown) => {}
                    Err(err) => warn!(error = %err, "registration rejected"),
                }
            });
        }
        debug!("registration listener stopped");
    }

    /// Admits `payload` as a new session unless its identifier is already
    /// live, which is not an error. Errors leave no session or slot behind.
    pub async fn on_registration(&self, payload: Bytes) -> Result<Admission, BrokerError> {
        let identifier = Identifier::from_payload(&payload)?;
        if self.is_shut_down() {
            debug!(identifier = %identifier, "registration after shutdown ignored");
            return Err(BrokerError::ShutDown);
        }
        let Some(generation) = self.inner.registry.reserve(&identifier) else {
            info!(identifier = %identifier, "session already active; registration ignored");
            return Ok(Admission::AlreadyActive(identifier));
        };

        let capability = match self.inner.factory.create(&identifier) {
            Ok(capability) => capability,
            Err(err) => {
                warn!(identifier = %identifier, error = %err, "capability setup failed");
                self.inner.registry.release(&identifier, generation);
                return Err(err);
            }
        };

        let registry = self.inner.registry.clone();
        let disconnect = Box::new(move |identifier: &Identifier| {
            release_slot(&registry, identifier, generation);
        });
        let session = match Session::start(
            identifier.clone(),
            self.inner.connector.as_ref(),
            capability,
            Arc::clone(&self.inner.heartbeat),
            self.inner.settings.session,
            disconnect,
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                warn!(identifier = %identifier, error = %err, "session failed to start");
                self.inner.registry.release(&identifier, generation);
                return Err(err);
            }
        };

        if !self.inner.registry.activate(&identifier, generation, Arc::clone(&session)) {
            debug!(identifier = %identifier, "slot gone before activation; cleaning up");
            session.cleanup().await;
            return Err(BrokerError::ShutDown);
        }
        Ok(Admission::Started(identifier))
    }

    /// Removes the slot `generation` of `identifier` from the registry.
    /// Repeat calls, and calls for a superseded generation, are no-ops.
    pub fn on_session_exit(&self, identifier: &Identifier, generation: u64) -> bool {
        release_slot(&self.inner.registry, identifier, generation)
    }

    /// Stops admitting sessions, closes the registration connection and
    /// cleans up every live session. Idempotent; errors are only logged.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            debug!("broker shutdown already ran");
            return;
        }
        info!(sessions = self.inner.registry.len(), "broker shutting down");
        self.inner.cancel.cancel();
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(err) = listener.await {
                warn!(error = %err, "registration listener ended abnormally");
            }
        }
        if let Err(err) = self.inner.bus.close().await {
            warn!(error = %err, "closing registration bus failed");
        }

        let sessions = self.inner.registry.drain();
        join_all(sessions.iter().map(|session| session.cleanup())).await;
        info!("broker shut down");
    }

    /// Resolves if the registration subscription ends while the broker is
    /// still running; no further devices can be admitted after that.
    pub async fn registration_lost(&self) {
        self.inner.registration_lost.cancelled().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub fn is_active(&self, identifier: &Identifier) -> bool {
        self.inner.registry.contains(identifier)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn session(&self, identifier: &Identifier) -> Option<Arc<SessionOf<F>>> {
        self.inner.registry.get(identifier)
    }
}

fn release_slot<C: Capability>(
    registry: &SessionRegistry<C>,
    identifier: &Identifier,
    generation: u64,
) -> bool {
    let released = registry.release(identifier, generation);
    if released {
        info!(identifier = %identifier, "session removed from registry");
    } else {
        debug!(identifier = %identifier, generation, "session already removed");
    }
    released
}
