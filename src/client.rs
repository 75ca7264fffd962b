//! Coordination client. The public API for queues, channels and KV access.
//!
//! The client owns one backend handle and two registries: dequeue workers
//! keyed by queue name, subscription listeners keyed by topic. Each
//! registry is guarded by an async mutex held across the duplicate check,
//! the backend connect and the spawn, so concurrent starts on one name
//! cannot both succeed. An entry lives exactly as long as its task: stop
//! only signals, and the task removes its own entry when it exits.

use crate::config::Config;
use crate::config::secrets::redacted_url;
use crate::error::{Error, Result};
use crate::store::{
    Backend, Inbound, KvStore, MemoryStore, PubSubStore, QueueStore, RedisStore, Topic,
};
use crate::telemetry::metrics;
use crate::worker::dequeue::DequeueTask;
use crate::worker::listener::ListenerTask;
use crate::worker::listener::InboundHandler;
use crate::worker::{
    HandlerResult, Reaper, Registration, Registry, WorkerHandle, WorkerInfo, WorkerState,
};
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Process-wide coordination handle. Construct once, hold for the
/// process lifetime.
pub struct CoordinationClient {
    store: Arc<dyn Backend>,
    workers: Registry<String>,
    listeners: Registry<Topic>,
    poll_interval: Duration,
}

impl CoordinationClient {
    /// Wrap an existing backend.
    pub fn new(store: Arc<dyn Backend>) -> Self {
        Self {
            store,
            workers: Arc::new(Mutex::new(HashMap::new())),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            poll_interval: crate::config::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Client over a fresh in-process store (for testing).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Connect to the Redis instance described by `config`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let url = config.store.connection_url();
        info!(url = %redacted_url(&url), "connecting coordination client");
        let store = RedisStore::connect(&url, config.block_timeout).await?;
        Ok(Self::new(Arc::new(store)).with_poll_interval(config.poll_interval))
    }

    /// Default poll interval for listeners started without one.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn store(&self) -> &Arc<dyn Backend> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Key-value
    // -----------------------------------------------------------------------

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        observe_kv("set", self.store.set(key, value)).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        observe_kv("get", self.store.get(key)).await
    }

    /// Set every pair in one round trip.
    ///
    /// Returns `Ok(false)` without touching the store when `items` is
    /// empty, `Ok(true)` once the store accepted a non-empty batch.
    pub async fn mset<I, K, V>(&self, items: I) -> Result<bool>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<[u8]>,
    {
        let items: Vec<(String, Vec<u8>)> = items
            .into_iter()
            .map(|(k, v)| (k.into(), v.as_ref().to_vec()))
            .collect();
        if items.is_empty() {
            return Ok(false);
        }
        observe_kv("mset", self.store.mset(&items)).await?;
        Ok(true)
    }

    /// Values aligned with `keys`, `None` for absent keys. An empty key
    /// list returns an empty vec without a round trip.
    pub async fn mget<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        observe_kv("mget", self.store.mget(&keys)).await
    }

    pub async fn flush_all(&self) -> Result<()> {
        observe_kv("flush_all", self.store.flush_all()).await
    }

    // -----------------------------------------------------------------------
    // Work queues
    // -----------------------------------------------------------------------

    /// Push a message onto `queue`. Fire-and-forget: nothing reports
    /// whether or when it is consumed.
    pub async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.store.push(queue, payload).await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", "enqueue"),
            ],
        );
        debug!(queue, bytes = payload.len(), "enqueued");
        Ok(())
    }

    /// Spawn a worker that pops from `queue` and calls
    /// `handler(payload, index)` for each message, index counting from 0.
    ///
    /// A handler error terminates the worker; it is logged and visible
    /// through the returned handle, and the registry entry is released so
    /// the queue can be started again.
    pub async fn start_dequeue_worker<F>(&self, queue: &str, handler: F) -> Result<WorkerHandle>
    where
        F: FnMut(Vec<u8>, u64) -> HandlerResult + Send + 'static,
    {
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get(queue) {
            warn!(queue, state = %existing.state.get(), "dequeue worker already registered");
            return Err(Error::DuplicateWorker(queue.to_string()));
        }

        let receiver = self.store.receiver(queue).await?;
        let reg = Registration::new();
        reg.state.set(WorkerState::Running);

        let task = DequeueTask {
            queue: queue.to_string(),
            receiver,
            handler: Box::new(handler),
            reg: reg.clone(),
            reaper: Reaper::new(Arc::clone(&self.workers), queue.to_string(), reg.id),
        }
        .spawn();

        workers.insert(queue.to_string(), reg.clone());
        Ok(WorkerHandle::new(queue.to_string(), &reg, task))
    }

    /// Ask the worker on `queue` to exit.
    ///
    /// Returns immediately. The worker exits before its next pop; one
    /// already blocked keeps waiting until a message arrives, and handles
    /// that message first. The queue stays registered (state Stopping)
    /// until the task has exited, so no second consumer can start beside
    /// it. Use [`WorkerHandle::abort`] to give up on a parked worker.
    pub async fn stop_dequeue_worker(&self, queue: &str) -> Result<()> {
        let workers = self.workers.lock().await;
        let reg = workers
            .get(queue)
            .filter(|reg| reg.signal_stop())
            .ok_or_else(|| Error::NotFound(queue.to_string()))?;
        info!(queue, id = %reg.id, "dequeue worker stop requested");
        Ok(())
    }

    /// Pop exactly `count` messages from `queue` on a dedicated receiver,
    /// calling `handler(payload, index)` after each one. Nothing beyond
    /// `count` is taken from the queue. Returns how many were handled.
    ///
    /// Runs on the caller's task and bypasses the worker registry; a
    /// registered worker on the same queue competes for messages.
    pub async fn dequeue_n<F>(&self, queue: &str, count: u64, mut handler: F) -> Result<u64>
    where
        F: FnMut(Vec<u8>, u64) -> HandlerResult,
    {
        if count == 0 {
            return Ok(0);
        }
        let mut receiver = self.store.receiver(queue).await?;
        for index in 0..count {
            let payload = receiver.pop().await?;
            metrics::queue_operations().add(
                1,
                &[
                    KeyValue::new("queue", queue.to_string()),
                    KeyValue::new("operation", "dequeue"),
                ],
            );
            handler(payload, index).map_err(|source| Error::Handler {
                name: queue.to_string(),
                source,
            })?;
        }
        Ok(count)
    }

    /// Snapshot of registered dequeue workers, sorted by queue name.
    /// Includes workers still Stopping.
    pub async fn dequeue_workers(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .workers
            .lock()
            .await
            .iter()
            .map(|(name, reg)| reg.info(name))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    // -----------------------------------------------------------------------
    // Pub/sub
    // -----------------------------------------------------------------------

    /// Deliver to every current subscriber of `channel`. Returns how many
    /// received it; zero subscribers is not an error.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize> {
        let receivers = self.store.publish(channel, payload).await?;
        metrics::pubsub_operations().add(
            1,
            &[
                KeyValue::new("channel", channel.to_string()),
                KeyValue::new("operation", "publish"),
            ],
        );
        debug!(channel, receivers, "published");
        Ok(receivers)
    }

    /// Subscribe to `channel` and call `handler(payload)` per message.
    ///
    /// `poll_interval` bounds each wait between stop checks; `None` uses
    /// the client default.
    pub async fn start_subscribe_listener<F>(
        &self,
        channel: &str,
        mut handler: F,
        poll_interval: Option<Duration>,
    ) -> Result<WorkerHandle>
    where
        F: FnMut(Vec<u8>) -> HandlerResult + Send + 'static,
    {
        self.start_listener(
            Topic::Channel(channel.to_string()),
            Box::new(move |inbound: Inbound| handler(inbound.payload)),
            poll_interval,
        )
        .await
    }

    /// Subscribe to every channel matching the glob `pattern` and call
    /// `handler(channel, payload)` per message.
    pub async fn start_psubscribe_listener<F>(
        &self,
        pattern: &str,
        mut handler: F,
        poll_interval: Option<Duration>,
    ) -> Result<WorkerHandle>
    where
        F: FnMut(String, Vec<u8>) -> HandlerResult + Send + 'static,
    {
        self.start_listener(
            Topic::Pattern(pattern.to_string()),
            Box::new(move |inbound: Inbound| handler(inbound.channel, inbound.payload)),
            poll_interval,
        )
        .await
    }

    pub async fn stop_subscribe_listener(&self, channel: &str) -> Result<()> {
        self.stop_listener(&Topic::Channel(channel.to_string())).await
    }

    pub async fn stop_psubscribe_listener(&self, pattern: &str) -> Result<()> {
        self.stop_listener(&Topic::Pattern(pattern.to_string())).await
    }

    /// Snapshot of registered listeners; `name` is the topic's display form.
    pub async fn subscribe_listeners(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .listeners
            .lock()
            .await
            .iter()
            .map(|(topic, reg)| reg.info(&topic.to_string()))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    async fn start_listener(
        &self,
        topic: Topic,
        handler: InboundHandler,
        poll_interval: Option<Duration>,
    ) -> Result<WorkerHandle> {
        let poll_interval = poll_interval.unwrap_or(self.poll_interval);
        if poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }

        let mut listeners = self.listeners.lock().await;
        if let Some(existing) = listeners.get(&topic) {
            warn!(%topic, state = %existing.state.get(), "listener already registered");
            return Err(Error::DuplicateListener(topic.to_string()));
        }

        let subscription = self.store.subscribe(&topic).await?;
        let reg = Registration::new();
        reg.state.set(WorkerState::Running);

        let task = ListenerTask {
            topic: topic.clone(),
            subscription,
            handler,
            poll_interval,
            reg: reg.clone(),
            reaper: Reaper::new(Arc::clone(&self.listeners), topic.clone(), reg.id),
        }
        .spawn();

        let name = topic.to_string();
        listeners.insert(topic, reg.clone());
        Ok(WorkerHandle::new(name, &reg, task))
    }

    /// The topic stays registered until the listener exits, at most one
    /// poll interval later.
    async fn stop_listener(&self, topic: &Topic) -> Result<()> {
        let listeners = self.listeners.lock().await;
        let reg = listeners
            .get(topic)
            .filter(|reg| reg.signal_stop())
            .ok_or_else(|| Error::NotFound(topic.to_string()))?;
        info!(%topic, id = %reg.id, "listener stop requested");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Request a stop of every registered worker and listener. Returns how
    /// many had not been asked to stop before. Entries leave the registries
    /// as their tasks exit.
    pub async fn shutdown(&self) -> usize {
        let workers = signal_all(&self.workers).await;
        let listeners = signal_all(&self.listeners).await;
        info!(workers, listeners, "coordination client shut down");
        workers + listeners
    }
}

async fn signal_all<K>(registry: &Registry<K>) -> usize {
    registry
        .lock()
        .await
        .values()
        .filter(|reg| reg.signal_stop())
        .count()
}

impl Drop for CoordinationClient {
    fn drop(&mut self) {
        // Best effort. The only other lock holder at this point is an
        // exiting task releasing its own entry.
        if let Ok(workers) = self.workers.try_lock() {
            workers.values().for_each(|reg| {
                reg.signal_stop();
            });
        }
        if let Ok(listeners) = self.listeners.try_lock() {
            listeners.values().for_each(|reg| {
                reg.signal_stop();
            });
        }
    }
}

/// Time a KV round trip and count its outcome.
async fn observe_kv<T>(operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    let start = Instant::now();
    let result = fut.await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    metrics::operation_duration_ms().record(elapsed_ms, &[KeyValue::new("operation", operation)]);
    metrics::kv_operations().add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
        ],
    );
    result
}
