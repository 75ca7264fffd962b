//! # relaybus
//!
//! Queue and pub/sub coordination client for distributed RL pipelines.
//!
//! Actors, learners and parameter servers exchange opaque binary payloads
//! through one backing store (Redis): reliable FIFO work queues drained by
//! background dequeue workers, and fan-out channels drained by background
//! subscription listeners. [`CoordinationClient`] owns the store handle and
//! the registries that start, track and stop those tasks.

pub mod client;
pub mod config;
pub mod error;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use client::CoordinationClient;
pub use error::{BoxError, Error, Result};
pub use store::{Inbound, InboundKind, Topic};
pub use worker::{HandlerResult, WorkerHandle, WorkerInfo, WorkerState};
