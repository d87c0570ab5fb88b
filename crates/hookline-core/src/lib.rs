//! Core domain layer for the hookline webhook delivery service.
//!
//! Provides the domain models, state machines, configuration, and
//! PostgreSQL persistence shared by the delivery pipeline. Higher-level
//! crates build on these primitives: `hookline-delivery` implements the
//! dispatch and retry machinery, the `hookline` binary wires everything
//! together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use config::WebhookConfig;
pub use error::{CoreError, Result};
pub use models::{
    CircuitState, EndpointId, FailureKind, Webhook, WebhookAttempt, WebhookEndpoint, WebhookId,
    WebhookStatus,
};
pub use storage::endpoints::CircuitUpdate;
pub use time::{Clock, RealClock, TestClock};
