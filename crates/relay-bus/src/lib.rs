use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection closed")]
    Closed,
    #[error("bus connect failed: {0}")]
    Connect(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Which channels a subscription receives.
///
/// Patterns follow the Redis `PSUBSCRIBE` glob rules for `*` and `?`;
/// a backslash escapes the next byte. Character classes are not supported.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelFilter {
    Exact(String),
    Pattern(String),
}

impl ChannelFilter {
    /// Treats any name containing a glob metacharacter as a pattern.
    pub fn parse(raw: &str) -> Self {
        if raw.contains(['*', '?']) {
            ChannelFilter::Pattern(raw.to_string())
        } else {
            ChannelFilter::Exact(raw.to_string())
        }
    }

    pub fn matches(&self, channel: &str) -> bool {
        match self {
            ChannelFilter::Exact(name) => name == channel,
            ChannelFilter::Pattern(pattern) => glob_match(pattern.as_bytes(), channel.as_bytes()),
        }
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
                continue;
            }
            Some(b'?') => {
                p += 1;
                t += 1;
                continue;
            }
            Some(b'\\') if pattern.get(p + 1) == Some(&text[t]) => {
                p += 2;
                t += 1;
                continue;
            }
            Some(&c) if c != b'\\' && c == text[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star, consumed)) => {
                p = star + 1;
                t = consumed + 1;
                backtrack = Some((star, consumed + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Receiving end of a subscription. Yields `None` once the owning
/// connection is closed or the transport gives up.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

/// One connection to the message bus.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()>;
    async fn subscribe(&self, filters: Vec<ChannelFilter>) -> BusResult<Subscription>;
    /// Drops every subscription made through this connection. Idempotent.
    async fn close(&self) -> BusResult<()>;
}

/// Opens fresh bus connections, so each session can own its own.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> BusResult<Arc<dyn Bus>>;
}

/// In-memory bus for tests and single-process wiring.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    hub: Arc<Hub>,
}

#[derive(Debug, Default)]
struct Hub {
    subscribers: RwLock<HashMap<u64, LocalSubscriber>>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct LocalSubscriber {
    filters: Vec<ChannelFilter>,
    sender: mpsc::UnboundedSender<BusMessage>,
}

impl Hub {
    fn add(&self, filters: Vec<ChannelFilter>) -> (u64, mpsc::UnboundedReceiver<BusMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .insert(id, LocalSubscriber { filters, sender });
        (id, receiver)
    }

    fn remove(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }

    fn deliver(&self, message: BusMessage) -> usize {
        let mut delivered = 0usize;
        let mut dead = Vec::new();
        {
            let guard = self.subscribers.read();
            for (id, subscriber) in guard.iter() {
                if !subscriber
                    .filters
                    .iter()
                    .any(|filter| filter.matches(&message.channel))
                {
                    continue;
                }
                if subscriber.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut guard = self.subscribers.write();
            for id in dead {
                guard.remove(&id);
            }
        }
        delivered
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> LocalConnection {
        LocalConnection {
            hub: Arc::clone(&self.hub),
            owned: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Publishes outside of any connection, returning the number of receivers.
    pub fn deliver(&self, channel: &str, payload: impl Into<Bytes>) -> usize {
        self.hub.deliver(BusMessage::new(channel, payload))
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscribers.read().len()
    }
}

#[async_trait]
impl Connector for LocalBus {
    async fn connect(&self) -> BusResult<Arc<dyn Bus>> {
        Ok(Arc::new(self.connection()))
    }
}

pub struct LocalConnection {
    hub: Arc<Hub>,
    owned: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

impl LocalConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Bus for LocalConnection {
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.hub.deliver(BusMessage::new(channel, payload));
        Ok(())
    }

    async fn subscribe(&self, filters: Vec<ChannelFilter>) -> BusResult<Subscription> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let (id, receiver) = self.hub.add(filters);
        self.owned.lock().push(id);
        Ok(Subscription::new(receiver))
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let owned = std::mem::take(&mut *self.owned.lock());
        for id in owned {
            self.hub.remove(id);
        }
        Ok(())
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        for id in self.owned.get_mut().drain(..) {
            self.hub.remove(id);
        }
    }
}
