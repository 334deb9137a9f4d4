use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BrokerError;
use crate::heartbeat::DeviceType;
use crate::identifier::Identifier;
use crate::session::SessionContext;

/// Closed set of per-device topics one capability listens on.
pub trait Topic: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn as_str(self) -> &'static str;

    /// Control topics drive start/stop transitions and are never queued
    /// behind ordinary work.
    fn is_control(self) -> bool {
        false
    }
}

/// One feature of a session: its topics, how each is handled, and what to
/// release on teardown.
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    type Topic: Topic;

    /// Device whose heartbeat decides whether this session stays alive.
    fn device_type(&self) -> DeviceType;

    async fn handle(
        self: Arc<Self>,
        ctx: SessionContext,
        topic: Self::Topic,
        payload: Bytes,
    ) -> anyhow::Result<()>;

    /// Stops capability loops and releases their waits. Called once from
    /// session cleanup.
    async fn teardown(&self) {}
}

/// Builds a fresh capability for each admitted identifier.
pub trait CapabilityFactory: Send + Sync + 'static {
    type Capability: Capability;

    fn create(&self, identifier: &Identifier) -> Result<Self::Capability, BrokerError>;
}

impl<C, F> CapabilityFactory for F
where
    C: Capability,
    F: Fn(&Identifier) -> Result<C, BrokerError> + Send + Sync + 'static,
{
    type Capability = C;

    fn create(&self, identifier: &Identifier) -> Result<C, BrokerError> {
        self(identifier)
    }
}
