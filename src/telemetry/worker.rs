//! Worker span helpers.
//!
//! Every dequeue worker and subscription listener runs inside one span for
//! its whole lifetime; state transitions are recorded as events on it.

use tracing::Span;
use uuid::Uuid;

/// Start a span for a worker or listener task.
///
/// `kind` is "dequeue" or "subscribe"; `name` the queue or topic.
pub fn start_worker_span(kind: &str, name: &str, id: &Uuid) -> Span {
    tracing::info_span!(
        "worker.run",
        "worker.kind" = kind,
        "worker.name" = name,
        "worker.id" = %id,
        "worker.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit it as an event.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("worker.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
