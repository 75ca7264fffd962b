//! Backing store capabilities.
//!
//! The coordination client talks to its store through three narrow traits:
//! [`KvStore`] for binary get/set, [`QueueStore`] for named FIFO lists, and
//! [`PubSubStore`] for fan-out channels. [`Backend`] is the union every
//! concrete store implements.
//!
//! Blocking pops and subscriptions each get a dedicated handle
//! ([`QueueReceiver`], [`Subscription`]) so a parked wait never holds up
//! traffic on the shared connection.

pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Binary key-value operations. Exactly the five the client forwards.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set every pair in one round trip. Callers never pass an empty slice.
    async fn mset(&self, items: &[(String, Vec<u8>)]) -> Result<()>;

    /// Values aligned with `keys`; `None` where a key is absent.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    async fn flush_all(&self) -> Result<()>;
}

/// Named FIFO queues.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a message. Returns once the store has accepted it.
    async fn push(&self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Open a receiver that pops from the head of `queue`.
    async fn receiver(&self, queue: &str) -> Result<Box<dyn QueueReceiver>>;
}

/// A dedicated blocking-pop handle bound to one queue.
#[async_trait]
pub trait QueueReceiver: Send {
    /// Suspend until a message is available, then remove and return it.
    ///
    /// Not cancel-safe: dropping the future mid-wait may lose the message
    /// the store was about to hand over.
    async fn pop(&mut self) -> Result<Vec<u8>>;
}

/// Fan-out channels.
#[async_trait]
pub trait PubSubStore: Send + Sync {
    /// Deliver to every current subscriber. Returns how many received it.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize>;

    /// Open a dedicated subscription to a channel or pattern.
    async fn subscribe(&self, topic: &Topic) -> Result<Box<dyn Subscription>>;
}

/// A live subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next inbound item. `Ok(None)` means the subscription
    /// was closed by the store. Cancel-safe.
    async fn next_inbound(&mut self) -> Result<Option<Inbound>>;
}

/// Everything the client needs from a store.
pub trait Backend: KvStore + QueueStore + PubSubStore {}

impl<T: KvStore + QueueStore + PubSubStore> Backend for T {}

/// What a listener is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Channel(String),
    Pattern(String),
}

impl Topic {
    pub fn name(&self) -> &str {
        match self {
            Topic::Channel(name) | Topic::Pattern(name) => name,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Topic::Pattern(_))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Channel(name) => write!(f, "channel:{name}"),
            Topic::Pattern(pattern) => write!(f, "pattern:{pattern}"),
        }
    }
}

/// Kind of an inbound pub/sub item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    SubscribeAck,
    UnsubscribeAck,
    Message,
    PatternMessage,
}

impl InboundKind {
    /// Control-plane acks are consumed by the listener, never handed on.
    pub fn carries_payload(self) -> bool {
        matches!(self, InboundKind::Message | InboundKind::PatternMessage)
    }
}

/// An item read from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub kind: InboundKind,
    /// Channel the item concerns (for pattern messages, the concrete channel).
    pub channel: String,
    /// Matching pattern; only set for pattern subscriptions.
    pub pattern: Option<String>,
    /// Message body. Empty for acks.
    pub payload: Vec<u8>,
}

impl Inbound {
    pub(crate) fn ack(kind: InboundKind, topic: &Topic) -> Self {
        let pattern = topic.is_pattern().then(|| topic.name().to_string());
        Self {
            kind,
            channel: topic.name().to_string(),
            pattern,
            payload: Vec::new(),
        }
    }
}
