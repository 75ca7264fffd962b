//! Dequeue worker: pop, hand to the handler, repeat.

use super::{HandlerResult, Reaper, Registration, WorkerState, panic_message};
use crate::error::{Error, Result};
use crate::store::QueueReceiver;
use crate::telemetry::metrics;
use crate::telemetry::worker::{record_state_transition, start_worker_span};
use futures::FutureExt;
use opentelemetry::KeyValue;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, error, info};

/// Handler invoked with each payload and its per-worker sequence index.
pub type DequeueHandler = Box<dyn FnMut(Vec<u8>, u64) -> HandlerResult + Send>;

pub(crate) struct DequeueTask {
    pub(crate) queue: String,
    pub(crate) receiver: Box<dyn QueueReceiver>,
    pub(crate) handler: DequeueHandler,
    pub(crate) reg: Registration,
    pub(crate) reaper: Reaper<String>,
}

impl DequeueTask {
    pub(crate) fn spawn(self) -> JoinHandle<Result<()>> {
        let span = start_worker_span("dequeue", &self.queue, &self.reg.id);
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(mut self) -> Result<()> {
        let span = Span::current();
        info!(queue = %self.queue, "dequeue worker started");

        let result = match AssertUnwindSafe(self.pump()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(Error::Other(format!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            ))),
        };

        let from = self.reg.state.get();
        match &result {
            Ok(()) => {
                self.reg.state.set(WorkerState::Stopped);
                record_state_transition(&span, &from.to_string(), "stopped");
                info!(queue = %self.queue, "dequeue worker stopped");
            }
            Err(e) => {
                self.reg.state.set(WorkerState::Failed);
                record_state_transition(&span, &from.to_string(), "failed");
                error!(queue = %self.queue, error = %e, "dequeue worker terminated");
                metrics::worker_failures().add(
                    1,
                    &[
                        KeyValue::new("kind", "dequeue"),
                        KeyValue::new("name", self.queue.clone()),
                    ],
                );
            }
        }
        let DequeueTask {
            receiver,
            mut reaper,
            ..
        } = self;
        drop(receiver);
        reaper.release().await;
        result
    }

    /// The receive-handle loop. Stop is checked only before each pop.
    async fn pump(&mut self) -> Result<()> {
        let mut seq: u64 = 0;
        loop {
            if self.reg.stop.is_stopped() {
                return Ok(());
            }
            let payload = self.receiver.pop().await?;
            metrics::queue_operations().add(
                1,
                &[
                    KeyValue::new("queue", self.queue.clone()),
                    KeyValue::new("operation", "dequeue"),
                ],
            );
            (self.handler)(payload, seq).map_err(|source| Error::Handler {
                name: self.queue.clone(),
                source,
            })?;
            seq += 1;
        }
    }
}
