//! Per-endpoint circuit breaker over persisted state.
//!
//! Circuit state lives on the endpoint row, not in process memory, so
//! every worker sees the same view and state survives restarts. The
//! breaker is the only component that mutates circuit fields; it applies
//! the transition to the in-memory entity and persists it through the
//! store in the same call.
//!
//! Half-open admits every request rather than limiting probes. A burst of
//! in-flight webhooks after cooldown all get through; the first failure
//! re-opens the circuit.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookline_core::{
    models::{CircuitState, WebhookEndpoint},
    CircuitUpdate, WebhookConfig,
};
use tracing::{info, warn};

use crate::{error::Result, store::DeliveryStore};

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Whether circuit state gates admission.
    ///
    /// State transitions are recorded either way; disabling only stops
    /// the breaker from refusing requests.
    pub enabled: bool,

    /// Consecutive failures before the circuit opens.
    pub failure_threshold: i64,

    /// Wait after opening before a probe request is admitted.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::from_config(&WebhookConfig::default())
    }
}

impl CircuitConfig {
    /// Derives breaker settings from the delivery configuration.
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            enabled: config.circuit_breaker_enabled,
            failure_threshold: config.circuit_breaker_threshold,
            cooldown: config.circuit_breaker_cooldown(),
        }
    }
}

/// Circuit breaker guarding delivery to one endpoint at a time.
///
/// Stateless itself; all state is on the endpoint entity passed in.
pub struct CircuitBreaker {
    store: Arc<dyn DeliveryStore>,
    config: CircuitConfig,
}

impl CircuitBreaker {
    /// Creates a breaker persisting through the given store.
    pub fn new(store: Arc<dyn DeliveryStore>, config: CircuitConfig) -> Self {
        Self { store, config }
    }

    /// Decides whether a request to the endpoint may proceed.
    ///
    /// Closed and half-open circuits admit. An open circuit admits once the
    /// cooldown has elapsed (or no open time was recorded), transitioning
    /// to half-open; otherwise the request is refused.
    pub async fn allow_request(
        &self,
        endpoint: &mut WebhookEndpoint,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !self.config.enabled {
            return Ok(true);
        }

        match endpoint.circuit_state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(true),
            CircuitState::Open => {
                if endpoint.cooldown_elapsed(now, self.config.cooldown) {
                    endpoint.half_open_circuit(now);
                    self.store
                        .update_circuit(endpoint.id, CircuitUpdate::half_open(), now)
                        .await?;
                    info!(endpoint_id = %endpoint.id, "circuit half-open, admitting probe");
                    Ok(true)
                } else {
                    Ok(false)
                }
            },
        }
    }

    /// Records a successful delivery.
    ///
    /// The success counter always increments. A half-open circuit closes,
    /// resetting the failure streak.
    pub async fn record_success(
        &self,
        endpoint: &mut WebhookEndpoint,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.record_endpoint_success(endpoint.id, now).await?;
        endpoint.record_success(now);

        if endpoint.circuit_state == CircuitState::HalfOpen {
            endpoint.close_circuit(now);
            self.store.update_circuit(endpoint.id, CircuitUpdate::close(), now).await?;
            info!(endpoint_id = %endpoint.id, "circuit closed after successful probe");
        }

        Ok(())
    }

    /// Records a failed delivery.
    ///
    /// The failure counter always increments, atomically in the store. A
    /// closed circuit opens when the streak reaches the threshold; a
    /// half-open circuit re-opens immediately with a fresh open time.
    pub async fn record_failure(
        &self,
        endpoint: &mut WebhookEndpoint,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let streak = self.store.record_endpoint_failure(endpoint.id, now).await?;
        endpoint.failure_count = streak;
        endpoint.last_failure_at = Some(now);
        endpoint.updated_at = now;

        let should_open = match endpoint.circuit_state {
            CircuitState::Closed => streak >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            endpoint.open_circuit(now);
            self.store.update_circuit(endpoint.id, CircuitUpdate::open(now), now).await?;
            warn!(
                endpoint_id = %endpoint.id,
                failure_count = streak,
                "circuit opened"
            );
        }

        Ok(())
    }

    /// Read-only check: is the circuit currently refusing requests?
    ///
    /// Unlike [`CircuitBreaker::allow_request`] this never transitions
    /// state. A disabled breaker is never open.
    pub fn is_open(&self, endpoint: &WebhookEndpoint, now: DateTime<Utc>) -> bool {
        self.config.enabled
            && endpoint.circuit_state == CircuitState::Open
            && !endpoint.cooldown_elapsed(now, self.config.cooldown)
    }

    /// Cooldown window applied when refusing requests.
    pub fn cooldown(&self) -> Duration {
        self.config.cooldown
    }
}
