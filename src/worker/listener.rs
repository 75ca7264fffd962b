//! Subscription listener: poll the subscription, hand messages on.

use super::{HandlerResult, Reaper, Registration, WorkerState, panic_message};
use crate::error::{Error, Result};
use crate::store::{Inbound, Subscription, Topic};
use crate::telemetry::metrics;
use crate::telemetry::worker::{record_state_transition, start_worker_span};
use futures::FutureExt;
use opentelemetry::KeyValue;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info};

/// Handler invoked with each message-kind inbound item.
pub type InboundHandler = Box<dyn FnMut(Inbound) -> HandlerResult + Send>;

pub(crate) struct ListenerTask {
    pub(crate) topic: Topic,
    pub(crate) subscription: Box<dyn Subscription>,
    pub(crate) handler: InboundHandler,
    pub(crate) poll_interval: Duration,
    pub(crate) reg: Registration,
    pub(crate) reaper: Reaper<Topic>,
}

impl ListenerTask {
    pub(crate) fn spawn(self) -> JoinHandle<Result<()>> {
        let span = start_worker_span("subscribe", &self.topic.to_string(), &self.reg.id);
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(mut self) -> Result<()> {
        let span = Span::current();
        info!(topic = %self.topic, poll_ms = self.poll_interval.as_millis() as u64, "listener started");

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
                info!(topic = %self.topic, "listener stopped");
            }
            Err(e) => {
                self.reg.state.set(WorkerState::Failed);
                record_state_transition(&span, &from.to_string(), "failed");
                error!(topic = %self.topic, error = %e, "listener terminated");
                metrics::worker_failures().add(
                    1,
                    &[
                        KeyValue::new("kind", "subscribe"),
                        KeyValue::new("name", self.topic.to_string()),
                    ],
                );
            }
        }
        // Unsubscribe before the topic is released for a new listener.
        // Dropping the subscription closes its connection.
        let ListenerTask {
            subscription,
            mut reaper,
            ..
        } = self;
        drop(subscription);
        reaper.release().await;
        result
    }

    /// Each poll waits at most `poll_interval`, then the stop signal is
    /// checked again. Stop never interrupts a handler call.
    async fn pump(&mut self) -> Result<()> {
        loop {
            if self.reg.stop.is_stopped() {
                return Ok(());
            }
            let inbound =
                match tokio::time::timeout(self.poll_interval, self.subscription.next_inbound()).await
                {
                    Err(_elapsed) => continue,
                    Ok(Ok(Some(inbound))) => inbound,
                    Ok(Ok(None)) => {
                        return Err(Error::Connection(format!(
                            "subscription to {} closed by store",
                            self.topic
                        )));
                    }
                    Ok(Err(e)) => return Err(e),
                };

            if !inbound.kind.carries_payload() {
                debug!(topic = %self.topic, kind = ?inbound.kind, "control message consumed");
                continue;
            }

            metrics::pubsub_operations().add(
                1,
                &[
                    KeyValue::new("channel", inbound.channel.clone()),
                    KeyValue::new("operation", "deliver"),
                ],
            );
            (self.handler)(inbound).map_err(|source| Error::Handler {
                name: self.topic.to_string(),
                source,
            })?;
        }
    }
}
