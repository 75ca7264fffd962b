//! Metric instrument factories for relaybus.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter(super::INSTRUMENTATION_NAME)
}

/// Counter: work queue operations.
/// Labels: `queue`, `operation` ("enqueue" | "dequeue").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("relaybus.queue.operations")
        .with_description("Number of work queue operations")
        .build()
}

/// Counter: pub/sub operations.
/// Labels: `channel`, `operation` ("publish" | "deliver").
pub fn pubsub_operations() -> Counter<u64> {
    meter()
        .u64_counter("relaybus.pubsub.operations")
        .with_description("Number of publish and delivery operations")
        .build()
}

/// Counter: key-value operations.
/// Labels: `operation` ("set" | "get" | "mset" | "mget" | "flush_all"), `result`.
pub fn kv_operations() -> Counter<u64> {
    meter()
        .u64_counter("relaybus.kv.operations")
        .with_description("Number of key-value store operations")
        .build()
}

/// Counter: workers and listeners that terminated abnormally.
/// Labels: `kind` ("dequeue" | "subscribe"), `name`.
pub fn worker_failures() -> Counter<u64> {
    meter()
        .u64_counter("relaybus.worker.failures")
        .with_description("Workers and listeners terminated by an error")
        .build()
}

/// Histogram: store round-trip duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("relaybus.operation.duration_ms")
        .with_description("Store operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
