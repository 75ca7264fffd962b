//! In-process backend.
//!
//! Same observable semantics as the Redis backend: FIFO queues with
//! blocking pops, fan-out channels without backlog, glob pattern
//! subscriptions. Used by tests and by `CoordinationClient::in_memory()`.
//!
//! Each subscription has its own unbounded inbox, so traffic on one
//! channel never displaces messages queued for another.
//!
//! Patterns follow Redis syntax for `*`, `?`, `[...]`, `[^...]` and `\`
//! escapes. One divergence: an unterminated `[` (e.g. `params.[`) is
//! rejected with `Error::Other`, where Redis would accept it.
//!
//! [`MemoryStore::set_available`] simulates an unreachable store; every
//! operation then fails with `Error::Connection`.

use super::{Inbound, InboundKind, KvStore, PubSubStore, QueueReceiver, QueueStore, Subscription, Topic};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, mpsc};

#[derive(Default)]
struct Queue {
    items: VecDeque<Vec<u8>>,
    ready: Arc<Notify>,
}

struct Published {
    channel: String,
    payload: Vec<u8>,
}

/// Compiled form of a subscription topic.
enum Matcher {
    Exact(String),
    Glob(glob::Pattern),
}

impl Matcher {
    fn compile(topic: &Topic) -> Result<Self> {
        match topic {
            Topic::Channel(name) => Ok(Matcher::Exact(name.clone())),
            Topic::Pattern(pattern) => redis_glob(pattern).map(Matcher::Glob),
        }
    }

    fn matches(&self, channel: &str) -> bool {
        match self {
            Matcher::Exact(name) => name == channel,
            Matcher::Glob(pattern) => pattern.matches(channel),
        }
    }
}

struct Subscriber {
    matcher: Matcher,
    inbox: mpsc::UnboundedSender<Arc<Published>>,
}

struct Inner {
    available: AtomicBool,
    kv: Mutex<HashMap<String, Vec<u8>>>,
    queues: Mutex<HashMap<String, Queue>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
}

/// In-memory store. Clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                available: AtomicBool::new(true),
                kv: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Toggle simulated reachability.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of messages waiting in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        lock(&self.inner.queues)
            .get(queue)
            .map_or(0, |q| q.items.len())
    }

    fn check(&self) -> Result<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Connection("memory store marked unavailable".to_string()))
        }
    }
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
/// Every critical section here leaves the map consistent.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check()?;
        lock(&self.inner.kv).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(lock(&self.inner.kv).get(key).cloned())
    }

    async fn mset(&self, items: &[(String, Vec<u8>)]) -> Result<()> {
        self.check()?;
        let mut kv = lock(&self.inner.kv);
        for (key, value) in items {
            kv.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check()?;
        let kv = lock(&self.inner.kv);
        Ok(keys.iter().map(|k| kv.get(k).cloned()).collect())
    }

    async fn flush_all(&self) -> Result<()> {
        self.check()?;
        lock(&self.inner.kv).clear();
        // Waiting receivers keep their Notify handles; only the backlog goes.
        for queue in lock(&self.inner.queues).values_mut() {
            queue.items.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.check()?;
        let mut queues = lock(&self.inner.queues);
        let q = queues.entry(queue.to_string()).or_default();
        q.items.push_back(payload.to_vec());
        q.ready.notify_one();
        Ok(())
    }

    async fn receiver(&self, queue: &str) -> Result<Box<dyn QueueReceiver>> {
        self.check()?;
        Ok(Box::new(MemoryReceiver {
            store: self.clone(),
            queue: queue.to_string(),
        }))
    }
}

struct MemoryReceiver {
    store: MemoryStore,
    queue: String,
}

#[async_trait]
impl QueueReceiver for MemoryReceiver {
    async fn pop(&mut self) -> Result<Vec<u8>> {
        loop {
            self.store.check()?;
            let ready = {
                let mut queues = lock(&self.store.inner.queues);
                let q = queues.entry(self.queue.clone()).or_default();
                if let Some(item) = q.items.pop_front() {
                    return Ok(item);
                }
                Arc::clone(&q.ready)
            };
            // notify_one stores a permit when nobody is waiting yet, so a push
            // landing between the unlock above and this await is not missed.
            ready.notified().await;
        }
    }
}

#[async_trait]
impl PubSubStore for MemoryStore {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize> {
        self.check()?;
        let message = Arc::new(Published {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
        let receivers = lock(&self.inner.subscribers)
            .values()
            .filter(|sub| sub.matcher.matches(channel))
            .filter(|sub| sub.inbox.send(Arc::clone(&message)).is_ok())
            .count();
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Box<dyn Subscription>> {
        self.check()?;
        let matcher = Matcher::compile(topic)?;
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (inbox, rx) = mpsc::unbounded_channel();
        // Visible to publish from here on; nothing published earlier is seen.
        lock(&self.inner.subscribers).insert(id, Subscriber { matcher, inbox });
        Ok(Box::new(MemorySubscription {
            store: self.clone(),
            id,
            topic: topic.clone(),
            rx,
            pending_ack: true,
        }))
    }
}

struct MemorySubscription {
    store: MemoryStore,
    id: u64,
    topic: Topic,
    rx: mpsc::UnboundedReceiver<Arc<Published>>,
    pending_ack: bool,
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        lock(&self.store.inner.subscribers).remove(&self.id);
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_inbound(&mut self) -> Result<Option<Inbound>> {
        if self.pending_ack {
            self.pending_ack = false;
            return Ok(Some(Inbound::ack(InboundKind::SubscribeAck, &self.topic)));
        }
        let Some(published) = self.rx.recv().await else {
            return Ok(None);
        };
        let (kind, pattern) = match &self.topic {
            Topic::Channel(_) => (InboundKind::Message, None),
            Topic::Pattern(p) => (InboundKind::PatternMessage, Some(p.clone())),
        };
        Ok(Some(Inbound {
            kind,
            channel: published.channel.clone(),
            pattern,
            payload: published.payload.clone(),
        }))
    }
}

/// Compile a Redis-style glob. `\x` becomes a literal `x` and `[^` a negated
/// class; the rest is shared syntax.
fn redis_glob(pattern: &str) -> Result<glob::Pattern> {
    let mut translated = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => translated.push_str(&glob::Pattern::escape(&escaped.to_string())),
                None => translated.push('\\'),
            },
            '[' if chars.peek() == Some(&'^') => {
                chars.next();
                translated.push_str("[!");
            }
            _ => translated.push(c),
        }
    }
    glob::Pattern::new(&translated)
        .map_err(|e| Error::Other(format!("invalid pattern {pattern}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pop_waits_for_push() {
        let store = MemoryStore::new();
        let mut rx = store.receiver("q").await.unwrap();

        let producer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push("q", b"late").await.unwrap();
        });

        let item = tokio::time::timeout(Duration::from_secs(2), rx.pop())
            .await
            .expect("pop should complete after push")
            .unwrap();
        assert_eq!(item, b"late");
        assert_eq!(store.queue_len("q"), 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(store.set("k", b"v").await, Err(Error::Connection(_))));
        assert!(matches!(store.push("q", b"v").await, Err(Error::Connection(_))));
        assert!(matches!(store.publish("c", b"v").await, Err(Error::Connection(_))));

        store.set_available(true);
        assert!(store.set("k", b"v").await.is_ok());
    }

    fn matcher(topic: Topic) -> Matcher {
        Matcher::compile(&topic).unwrap()
    }

    #[test]
    fn pattern_matching_uses_glob_rules() {
        let glob = matcher(Topic::Pattern("params.*".to_string()));
        assert!(glob.matches("params.policy"));
        assert!(!glob.matches("experience.0"));
        assert!(matcher(Topic::Channel("a".into())).matches("a"));
        assert!(!matcher(Topic::Channel("a".into())).matches("ab"));
    }

    #[test]
    fn redis_escapes_and_negated_classes_translate() {
        let escaped = matcher(Topic::Pattern(r"step\*".to_string()));
        assert!(escaped.matches("step*"));
        assert!(!escaped.matches("step10"));

        let negated = matcher(Topic::Pattern("shard[^0]".to_string()));
        assert!(negated.matches("shard1"));
        assert!(!negated.matches("shard0"));

        let single = matcher(Topic::Pattern("actor.?".to_string()));
        assert!(single.matches("actor.3"));
        assert!(!single.matches("actor.12"));
    }

    #[tokio::test]
    async fn flood_on_another_channel_does_not_displace_messages() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&Topic::Channel("params".into())).await.unwrap();
        let _noise = store.subscribe(&Topic::Channel("noise".into())).await.unwrap();

        store.publish("params", b"before").await.unwrap();
        for _ in 0..5000 {
            assert_eq!(store.publish("noise", b"n").await.unwrap(), 1);
        }
        store.publish("params", b"after").await.unwrap();

        let ack = sub.next_inbound().await.unwrap().unwrap();
        assert_eq!(ack.kind, InboundKind::SubscribeAck);
        let first = sub.next_inbound().await.unwrap().unwrap();
        let second = sub.next_inbound().await.unwrap().unwrap();
        assert_eq!(first.payload, b"before");
        assert_eq!(second.payload, b"after");
    }

    #[tokio::test]
    async fn slow_subscriber_keeps_a_deep_backlog() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&Topic::Pattern("exp.*".into())).await.unwrap();
        for i in 0..3000_u32 {
            store.publish("exp.0", &i.to_be_bytes()).await.unwrap();
        }

        sub.next_inbound().await.unwrap();
        for i in 0..3000_u32 {
            let msg = sub.next_inbound().await.unwrap().unwrap();
            assert_eq!(msg.kind, InboundKind::PatternMessage);
            assert_eq!(msg.payload, i.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn dropped_subscription_stops_counting() {
        let store = MemoryStore::new();
        let sub = store.subscribe(&Topic::Channel("c".into())).await.unwrap();
        assert_eq!(store.publish("c", b"x").await.unwrap(), 1);
        drop(sub);
        assert_eq!(store.publish("c", b"y").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected() {
        let store = MemoryStore::new();
        let result = store.subscribe(&Topic::Pattern("[".into())).await;
        assert!(matches!(result, Err(Error::Other(_))));
    }
}
