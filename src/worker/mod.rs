//! Background workers: the dequeue loop and the subscription listener.
//!
//! Both run as tokio tasks with a cooperative stop signal that is only
//! checked at the top of each loop iteration. A stop never interrupts a
//! wait already in progress.

pub mod dequeue;
pub mod listener;

use crate::error::{BoxError, Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Outcome of one handler invocation.
pub type HandlerResult = std::result::Result<(), BoxError>;

/// Name-keyed registry of live workers, shared with the tasks so a failed
/// task can remove itself.
pub(crate) type Registry<K> = Arc<Mutex<HashMap<K, Registration>>>;

/// Remove `key` only if it still belongs to worker `id`. A newer worker
/// registered under the same name is left alone.
pub(crate) async fn reap<K: Eq + Hash>(registry: &Registry<K>, key: &K, id: Uuid) -> bool {
    remove_if_owned(&mut *registry.lock().await, key, id)
}

fn remove_if_owned<K: Eq + Hash>(map: &mut HashMap<K, Registration>, key: &K, id: Uuid) -> bool {
    if map.get(key).is_some_and(|reg| reg.id == id) {
        map.remove(key);
        true
    } else {
        false
    }
}

/// Owns a task's registry entry for the task's whole lifetime.
///
/// The entry is released by [`Reaper::release`] when the task exits on its
/// own. If the task is cancelled instead (aborted, or the runtime shuts
/// down) the drop releases it.
pub(crate) struct Reaper<K: Eq + Hash + Clone + Send + Sync + 'static> {
    registry: Registry<K>,
    key: K,
    id: Uuid,
    released: bool,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> Reaper<K> {
    pub(crate) fn new(registry: Registry<K>, key: K, id: Uuid) -> Self {
        Self {
            registry,
            key,
            id,
            released: false,
        }
    }

    pub(crate) async fn release(&mut self) -> bool {
        self.released = true;
        reap(&self.registry, &self.key, self.id).await
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> Drop for Reaper<K> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(mut map) = self.registry.try_lock() {
            remove_if_owned(&mut map, &self.key, self.id);
            return;
        }
        // Lock contended: finish the removal on the runtime.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = Arc::clone(&self.registry);
            let key = self.key.clone();
            let id = self.id;
            handle.spawn(async move {
                reap(&registry, &key, id).await;
            });
        }
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Lifecycle state of a worker or listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Stopping,
    Stopped,
    /// Terminated by a handler error, store error, or panic.
    Failed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Created => 0,
            WorkerState::Running => 1,
            WorkerState::Stopping => 2,
            WorkerState::Stopped => 3,
            WorkerState::Failed => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Created,
            1 => WorkerState::Running,
            2 => WorkerState::Stopping,
            3 => WorkerState::Stopped,
            _ => WorkerState::Failed,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Created => "created",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(WorkerState::Created),
            "running" => Ok(WorkerState::Running),
            "stopping" => Ok(WorkerState::Stopping),
            "stopped" => Ok(WorkerState::Stopped),
            "failed" => Ok(WorkerState::Failed),
            other => Err(Error::Other(format!("unknown worker state: {other}"))),
        }
    }
}

/// Shared, lock-free cell holding a [`WorkerState`].
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Created.as_u8())))
    }

    pub(crate) fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: WorkerState) -> WorkerState {
        WorkerState::from_u8(self.0.swap(state.as_u8(), Ordering::AcqRel))
    }

    /// Move to Stopping unless the worker already finished.
    pub(crate) fn begin_stopping(&self) {
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            (!WorkerState::from_u8(cur).is_terminal()).then_some(WorkerState::Stopping.as_u8())
        });
    }
}

/// Cooperative stop flag observed at loop top.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Registry entry for a live worker or listener. It stays in place while
/// the task is Stopping and is removed only when the task exits.
#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub(crate) id: Uuid,
    pub(crate) stop: StopSignal,
    pub(crate) state: StateCell,
    pub(crate) started_at: DateTime<Utc>,
}

impl Registration {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            stop: StopSignal::new(),
            state: StateCell::new(),
            started_at: Utc::now(),
        }
    }

    pub(crate) fn info(&self, name: &str) -> WorkerInfo {
        WorkerInfo {
            name: name.to_string(),
            id: self.id,
            state: self.state.get(),
            started_at: self.started_at,
        }
    }

    /// Signal the task and mark it Stopping. Returns false if a stop was
    /// already requested.
    pub(crate) fn signal_stop(&self) -> bool {
        if self.stop.is_stopped() {
            return false;
        }
        self.stop.stop();
        self.state.begin_stopping();
        true
    }
}

/// Snapshot of a registered worker or listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Queue name, or the topic for listeners.
    pub name: String,
    pub id: Uuid,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
}

/// Handle to a spawned worker or listener task.
///
/// Dropping the handle detaches the task; it keeps running until stopped
/// through the client.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    id: Uuid,
    state: StateCell,
    task: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: String, reg: &Registration, task: JoinHandle<Result<()>>) -> Self {
        Self {
            name,
            id: reg.id,
            state: reg.state.clone(),
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit and return how it ended.
    ///
    /// A dequeue worker blocked on an empty queue does not exit until a
    /// message arrives, so this may wait indefinitely after a stop.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                self.state.set(WorkerState::Failed);
                Err(Error::Other(format!("{} panicked", self.name)))
            }
            Err(e) => {
                self.state.set(WorkerState::Stopped);
                Err(Error::Other(format!("{} was cancelled: {e}", self.name)))
            }
        }
    }

    /// Cancel the task at its current suspension point and release its
    /// registry entry.
    ///
    /// Not a graceful stop: a message being popped may be lost. Meant for
    /// teardown of a worker parked on an empty queue after a stop.
    pub fn abort(&self) {
        self.task.abort();
    }
}
