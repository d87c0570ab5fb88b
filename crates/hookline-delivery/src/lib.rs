//! Webhook delivery pipeline: dispatch, classification, retries, and
//! circuit breaking.
//!
//! The delivery engine drives one webhook attempt per invocation through
//! the pipeline below. Scheduling between attempts is handled by the job
//! queue and the retry sweep.
//!
//! ```text
//!  enqueue ──> JobQueue ──> DeliveryEngine::process
//!                               │
//!                 CircuitBreaker│gate (per endpoint)
//!                               │
//!                           Dispatcher ──> destination
//!                               │
//!                     classify outcome
//!                      │              │
//!                  delivered     RetryScheduler ──> scheduled_at
//!                                     │
//!                                RetrySweep ──> JobQueue (again)
//! ```
//!
//! Persistence sits behind the [`store::DeliveryStore`] trait so the whole
//! pipeline runs against an in-memory store in tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod classify;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod store;
pub mod sweep;
pub mod worker;

pub use circuit::{CircuitBreaker, CircuitConfig};
pub use dispatch::{DispatchConfig, DispatchOutcome, Dispatcher, TransportError};
pub use engine::{DeliveryEngine, NewWebhook};
pub use error::{DeliveryError, Result};
pub use queue::JobQueue;
pub use retry::RetryPolicy;
pub use schedule::RetryScheduler;
pub use store::DeliveryStore;
pub use sweep::RetrySweep;
pub use worker::WorkerPool;

/// Default number of delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default batch size for the retry sweep.
pub const DEFAULT_SWEEP_BATCH_SIZE: i64 = 100;
