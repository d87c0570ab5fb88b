//! Immutable delivery configuration.
//!
//! A `WebhookConfig` is built once at startup and passed by value to the
//! components that need it. There is no global configuration state; two
//! engines in the same process can run with different settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Configuration for webhook delivery behavior.
///
/// Durations are stored as whole seconds for straightforward serialization
/// from TOML and environment variables. Accessor methods expose them as
/// `Duration` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// TCP connect timeout in seconds for outbound requests.
    pub connect_timeout_secs: u64,

    /// Overall request timeout in seconds (connect plus response).
    pub read_timeout_secs: u64,

    /// Default delivery attempt budget for new webhooks.
    pub default_max_attempts: i32,

    /// HTTP status codes treated as successful delivery.
    pub success_codes: Vec<u16>,

    /// Base delay in seconds for exponential backoff.
    pub retry_base_delay_secs: u64,

    /// Upper bound in seconds for the backoff component of a retry delay.
    pub max_retry_delay_secs: u64,

    /// Jitter factor in `[0.0, 1.0]` added on top of the capped delay.
    pub retry_jitter_factor: f64,

    /// Consecutive failures before an endpoint circuit opens.
    pub circuit_breaker_threshold: i64,

    /// Cooldown in seconds before an open circuit admits a probe request.
    pub circuit_breaker_cooldown_secs: u64,

    /// Whether circuit breaking is enforced at all.
    pub circuit_breaker_enabled: bool,

    /// Maximum response body bytes stored on attempt records.
    pub response_body_limit: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            read_timeout_secs: 30,
            default_max_attempts: 5,
            success_codes: (200..=299).collect(),
            retry_base_delay_secs: 60,
            max_retry_delay_secs: 3600,
            retry_jitter_factor: 0.5,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_secs: 300,
            circuit_breaker_enabled: true,
            response_body_limit: 64 * 1024,
        }
    }
}

impl WebhookConfig {
    /// Validates configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` describing the first violated
    /// constraint.
    pub fn validate(&self) -> Result<()> {
        if self.default_max_attempts < 1 {
            return Err(CoreError::InvalidInput(
                "default_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.success_codes.is_empty() {
            return Err(CoreError::InvalidInput("success_codes must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(CoreError::InvalidInput(
                "retry_jitter_factor must be within [0.0, 1.0]".to_string(),
            ));
        }
        if self.retry_base_delay_secs == 0 {
            return Err(CoreError::InvalidInput(
                "retry_base_delay_secs must be positive".to_string(),
            ));
        }
        if self.max_retry_delay_secs < self.retry_base_delay_secs {
            return Err(CoreError::InvalidInput(
                "max_retry_delay_secs must be >= retry_base_delay_secs".to_string(),
            ));
        }
        if self.circuit_breaker_threshold < 1 {
            return Err(CoreError::InvalidInput(
                "circuit_breaker_threshold must be at least 1".to_string(),
            ));
        }
        if self.read_timeout_secs == 0 {
            return Err(CoreError::InvalidInput("read_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// TCP connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Overall request timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Base backoff delay.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    /// Backoff delay cap.
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    /// Circuit breaker cooldown window.
    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_secs)
    }

    /// Whether the status code counts as successful delivery.
    pub fn is_success_code(&self, status: u16) -> bool {
        self.success_codes.contains(&status)
    }
}
