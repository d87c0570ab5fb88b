//! Domain models and strongly-typed identifiers.
//!
//! Defines webhooks, endpoints, delivery attempt records, and newtype ID
//! wrappers for compile-time type safety. State transitions are explicit
//! methods on the entities; callers mutate in memory and persist the result
//! through the storage layer, so every transition is visible at the call
//! site.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed webhook identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. The ID follows the
/// webhook through its entire delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookId(pub Uuid);

impl WebhookId {
    /// Creates a new random webhook ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WebhookId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for WebhookId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for WebhookId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WebhookId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for WebhookId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed endpoint identifier.
///
/// Each endpoint represents a unique destination URL carrying its own
/// delivery statistics and circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub Uuid);

impl EndpointId {
    /// Creates a new random endpoint ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EndpointId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EndpointId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EndpointId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EndpointId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Webhook lifecycle status.
///
/// Webhooks progress through these states during delivery:
///
/// ```text
/// Pending -> Processing -> Delivered
///                       -> Failed -> Processing (retry)
///                       -> Dead
/// ```
///
/// `Delivered` and `Dead` are terminal; a webhook in either state is never
/// picked up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    /// Created and waiting for the first delivery attempt.
    Pending,

    /// A worker is actively attempting delivery.
    Processing,

    /// Successfully delivered. Terminal.
    Delivered,

    /// Last attempt failed but retries remain.
    Failed,

    /// Permanently failed. Terminal.
    ///
    /// Reached after exhausting the attempt budget or hitting a
    /// non-retryable response.
    Dead,
}

impl WebhookStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Dead)
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

impl sqlx::Type<PgDb> for WebhookStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WebhookStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("invalid webhook status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for WebhookStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Circuit breaker state machine for an endpoint.
///
/// Prevents hammering destinations that are persistently failing:
///
/// ```text
/// Closed -> Open (threshold consecutive failures)
/// Open -> HalfOpen (cooldown elapsed)
/// HalfOpen -> Closed (on success)
/// HalfOpen -> Open (on failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    Closed,

    /// Endpoint is failing, requests refused until cooldown elapses.
    Open,

    /// Testing whether the endpoint recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl sqlx::Type<PgDb> for CircuitState {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for CircuitState {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            _ => Err(format!("invalid circuit state: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for CircuitState {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Classification of a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Request timed out before a response arrived.
    Timeout,
    /// TCP connection could not be established.
    ConnectionFailed,
    /// TLS handshake or certificate failure.
    Tls,
    /// HTTP 429 from the destination.
    RateLimited,
    /// HTTP 4xx client error response.
    ClientError,
    /// HTTP 5xx server error response.
    ServerError,
    /// Unexpected status or transport condition outside the taxonomy.
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::Tls => write!(f, "tls"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::ClientError => write!(f, "client_error"),
            Self::ServerError => write!(f, "server_error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl sqlx::Type<PgDb> for FailureKind {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for FailureKind {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "timeout" => Ok(Self::Timeout),
            "connection_failed" => Ok(Self::ConnectionFailed),
            "tls" => Ok(Self::Tls),
            "rate_limited" => Ok(Self::RateLimited),
            "client_error" => Ok(Self::ClientError),
            "server_error" => Ok(Self::ServerError),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("invalid failure kind: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for FailureKind {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Core webhook entity.
///
/// Represents one outbound notification that must be delivered reliably to
/// a destination URL. Tracks the attempt budget and retry schedule from
/// creation to a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Webhook {
    /// Unique identifier for this webhook.
    pub id: WebhookId,

    /// Destination endpoint (shared circuit breaker scope).
    pub endpoint_id: EndpointId,

    /// Target URL for delivery.
    pub url: String,

    /// JSON payload posted to the destination.
    pub payload: serde_json::Value,

    /// Custom HTTP headers merged over the defaults at dispatch time.
    pub headers: sqlx::types::Json<HashMap<String, String>>,

    /// Current lifecycle status.
    pub status: WebhookStatus,

    /// Delivery attempts consumed so far.
    ///
    /// Incremented atomically before each dispatch. Never exceeds
    /// `max_attempts`.
    pub attempt_count: i32,

    /// Total attempt budget, including the first attempt.
    pub max_attempts: i32,

    /// When the next delivery attempt should run.
    ///
    /// Set by the retry scheduler or by a circuit breaker refusal. None
    /// while an attempt is in flight or after a terminal state.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// When delivery succeeded (terminal).
    pub delivered_at: Option<DateTime<Utc>>,

    /// When the most recent failure was recorded.
    pub failed_at: Option<DateTime<Utc>>,

    /// Client-supplied deduplication key.
    ///
    /// Enqueueing twice with the same key returns the original webhook.
    pub idempotency_key: Option<String>,

    /// Caller-defined metadata carried alongside the webhook.
    pub metadata: serde_json::Value,

    /// When this webhook was created.
    pub created_at: DateTime<Utc>,

    /// When this webhook was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Creates a new pending webhook.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint_id: EndpointId,
        url: String,
        payload: serde_json::Value,
        headers: HashMap<String, String>,
        max_attempts: i32,
        idempotency_key: Option<String>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WebhookId::new(),
            endpoint_id,
            url,
            payload,
            headers: sqlx::types::Json(headers),
            status: WebhookStatus::Pending,
            attempt_count: 0,
            max_attempts,
            scheduled_at: None,
            delivered_at: None,
            failed_at: None,
            idempotency_key,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Headers as a plain map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers.0
    }

    /// Whether a delivery attempt may run for this webhook.
    ///
    /// Terminal webhooks and webhooks with an exhausted attempt budget are
    /// not deliverable.
    pub fn is_deliverable(&self) -> bool {
        !self.status.is_terminal() && !self.attempts_exhausted()
    }

    /// Whether the attempt budget is used up.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Transitions to `Processing` for an in-flight attempt.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = WebhookStatus::Processing;
        self.updated_at = now;
    }

    /// Transitions to the terminal `Delivered` state.
    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.status = WebhookStatus::Delivered;
        self.delivered_at = Some(now);
        self.scheduled_at = None;
        self.updated_at = now;
    }

    /// Records a retryable failure.
    ///
    /// Transitions to `Dead` when the attempt budget is exhausted,
    /// otherwise to `Failed`.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status =
            if self.attempts_exhausted() { WebhookStatus::Dead } else { WebhookStatus::Failed };
        self.failed_at = Some(now);
        self.updated_at = now;
    }

    /// Transitions straight to the terminal `Dead` state.
    ///
    /// Used for permanent failures where retrying cannot help, regardless
    /// of remaining budget.
    pub fn mark_dead(&mut self, now: DateTime<Utc>) {
        self.status = WebhookStatus::Dead;
        self.failed_at = Some(now);
        self.scheduled_at = None;
        self.updated_at = now;
    }
}

/// Destination endpoint with shared delivery statistics.
///
/// Webhooks targeting the same URL share an endpoint record, which carries
/// the circuit breaker state protecting that destination.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEndpoint {
    /// Unique identifier for this endpoint.
    pub id: EndpointId,

    /// Full destination URL.
    pub url: String,

    /// Hostname extracted from the URL, kept for reporting queries.
    pub host: String,

    /// Total successful deliveries to this endpoint.
    pub success_count: i64,

    /// Consecutive failures since the last success.
    ///
    /// Reset to zero when the circuit closes.
    pub failure_count: i64,

    /// Circuit breaker state for this destination.
    pub circuit_state: CircuitState,

    /// When the circuit last opened.
    ///
    /// Some exactly when `circuit_state` is `Open`; cleared on the
    /// transition to half-open or closed.
    pub circuit_opened_at: Option<DateTime<Utc>>,

    /// Most recent successful delivery.
    pub last_success_at: Option<DateTime<Utc>>,

    /// Most recent failed delivery.
    pub last_failure_at: Option<DateTime<Utc>>,

    /// When this endpoint was first seen.
    pub created_at: DateTime<Utc>,

    /// When this endpoint was last modified.
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// Creates a closed-circuit endpoint for the given URL.
    pub fn new(url: String, host: String, now: DateTime<Utc>) -> Self {
        Self {
            id: EndpointId::new(),
            url,
            host,
            success_count: 0,
            failure_count: 0,
            circuit_state: CircuitState::Closed,
            circuit_opened_at: None,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Records a successful delivery (counter and timestamp only).
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.success_count += 1;
        self.last_success_at = Some(now);
        self.updated_at = now;
    }

    /// Records a failed delivery (counter and timestamp only).
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count += 1;
        self.last_failure_at = Some(now);
        self.updated_at = now;
    }

    /// Opens the circuit, stamping the open time.
    pub fn open_circuit(&mut self, now: DateTime<Utc>) {
        self.circuit_state = CircuitState::Open;
        self.circuit_opened_at = Some(now);
        self.updated_at = now;
    }

    /// Closes the circuit and resets the failure streak.
    pub fn close_circuit(&mut self, now: DateTime<Utc>) {
        self.circuit_state = CircuitState::Closed;
        self.circuit_opened_at = None;
        self.failure_count = 0;
        self.updated_at = now;
    }

    /// Moves an open circuit to half-open for a probe attempt.
    pub fn half_open_circuit(&mut self, now: DateTime<Utc>) {
        self.circuit_state = CircuitState::HalfOpen;
        self.circuit_opened_at = None;
        self.updated_at = now;
    }

    /// Whether the open-circuit cooldown has elapsed.
    ///
    /// An open circuit with no recorded open time is treated as expired so
    /// it can recover instead of refusing forever.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>, cooldown: std::time::Duration) -> bool {
        match self.circuit_opened_at {
            None => true,
            Some(opened_at) => {
                let elapsed = now.signed_duration_since(opened_at);
                elapsed >= chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX)
            },
        }
    }
}

/// Immutable audit record of a single delivery attempt.
///
/// One row per dispatch, including attempts that never reached the
/// destination. Never modified once written.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookAttempt {
    /// Unique identifier for this attempt.
    pub id: Uuid,

    /// Webhook being delivered.
    pub webhook_id: WebhookId,

    /// Sequential attempt number, starting at 1.
    pub attempt_number: i32,

    /// Whether the destination acknowledged delivery.
    pub success: bool,

    /// HTTP status code received.
    ///
    /// None when the request failed before a response arrived.
    pub response_status: Option<i32>,

    /// Response body, truncated to the configured limit.
    pub response_body: Option<String>,

    /// Response headers with lowercase names.
    pub response_headers: sqlx::types::Json<HashMap<String, String>>,

    /// Failure classification when the attempt did not succeed.
    pub error_kind: Option<FailureKind>,

    /// Human-readable error description.
    pub error_message: Option<String>,

    /// Wall-clock request duration in whole milliseconds.
    pub duration_ms: i64,

    /// When this attempt ran.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_webhook(max_attempts: i32) -> Webhook {
        Webhook::new(
            EndpointId::new(),
            "https://example.com/hooks".to_string(),
            serde_json::json!({"event": "order.created"}),
            HashMap::new(),
            max_attempts,
            None,
            serde_json::Value::Null,
            Utc::now(),
        )
    }

    #[test]
    fn status_display_matches_storage_format() {
        assert_eq!(WebhookStatus::Pending.to_string(), "pending");
        assert_eq!(WebhookStatus::Processing.to_string(), "processing");
        assert_eq!(WebhookStatus::Delivered.to_string(), "delivered");
        assert_eq!(WebhookStatus::Failed.to_string(), "failed");
        assert_eq!(WebhookStatus::Dead.to_string(), "dead");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn delivered_and_dead_are_terminal() {
        assert!(WebhookStatus::Delivered.is_terminal());
        assert!(WebhookStatus::Dead.is_terminal());
        assert!(!WebhookStatus::Pending.is_terminal());
        assert!(!WebhookStatus::Processing.is_terminal());
        assert!(!WebhookStatus::Failed.is_terminal());
    }

    #[test]
    fn new_webhook_is_deliverable() {
        let webhook = pending_webhook(5);
        assert_eq!(webhook.status, WebhookStatus::Pending);
        assert!(webhook.is_deliverable());
    }

    #[test]
    fn delivered_webhook_is_not_deliverable() {
        let mut webhook = pending_webhook(5);
        let now = Utc::now();
        webhook.mark_delivered(now);
        assert!(!webhook.is_deliverable());
        assert_eq!(webhook.delivered_at, Some(now));
        assert_eq!(webhook.scheduled_at, None);
    }

    #[test]
    fn failure_with_budget_remaining_stays_retryable() {
        let mut webhook = pending_webhook(5);
        webhook.attempt_count = 2;
        webhook.mark_failed(Utc::now());
        assert_eq!(webhook.status, WebhookStatus::Failed);
        assert!(webhook.is_deliverable());
    }

    #[test]
    fn failure_at_budget_goes_dead() {
        let mut webhook = pending_webhook(3);
        webhook.attempt_count = 3;
        webhook.mark_failed(Utc::now());
        assert_eq!(webhook.status, WebhookStatus::Dead);
        assert!(!webhook.is_deliverable());
    }

    #[test]
    fn mark_dead_ignores_remaining_budget() {
        let mut webhook = pending_webhook(5);
        webhook.attempt_count = 1;
        webhook.mark_dead(Utc::now());
        assert_eq!(webhook.status, WebhookStatus::Dead);
        assert!(webhook.failed_at.is_some());
    }

    #[test]
    fn circuit_transitions_maintain_opened_at_invariant() {
        let now = Utc::now();
        let mut endpoint =
            WebhookEndpoint::new("https://example.com/x".to_string(), "example.com".to_string(), now);
        assert_eq!(endpoint.circuit_state, CircuitState::Closed);
        assert_eq!(endpoint.circuit_opened_at, None);

        endpoint.open_circuit(now);
        assert_eq!(endpoint.circuit_state, CircuitState::Open);
        assert_eq!(endpoint.circuit_opened_at, Some(now));

        endpoint.half_open_circuit(now);
        assert_eq!(endpoint.circuit_state, CircuitState::HalfOpen);
        assert_eq!(endpoint.circuit_opened_at, None);

        endpoint.failure_count = 7;
        endpoint.close_circuit(now);
        assert_eq!(endpoint.circuit_state, CircuitState::Closed);
        assert_eq!(endpoint.circuit_opened_at, None);
        assert_eq!(endpoint.failure_count, 0);
    }

    #[test]
    fn cooldown_with_missing_open_time_counts_as_elapsed() {
        let now = Utc::now();
        let mut endpoint =
            WebhookEndpoint::new("https://example.com/x".to_string(), "example.com".to_string(), now);
        endpoint.circuit_state = CircuitState::Open;
        endpoint.circuit_opened_at = None;
        assert!(endpoint.cooldown_elapsed(now, std::time::Duration::from_secs(300)));
    }

    #[test]
    fn cooldown_elapses_after_window() {
        let now = Utc::now();
        let mut endpoint =
            WebhookEndpoint::new("https://example.com/x".to_string(), "example.com".to_string(), now);
        endpoint.open_circuit(now);

        let cooldown = std::time::Duration::from_secs(300);
        assert!(!endpoint.cooldown_elapsed(now + chrono::Duration::seconds(299), cooldown));
        assert!(endpoint.cooldown_elapsed(now + chrono::Duration::seconds(300), cooldown));
    }
}
