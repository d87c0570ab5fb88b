//! HTTP dispatch of webhook payloads.
//!
//! The dispatcher performs exactly one POST per call and normalizes
//! whatever happened into a [`DispatchOutcome`]. Receiving an error status
//! or losing the connection is a delivery result, not a pipeline error, so
//! `dispatch` is infallible by design of its signature.

use std::{collections::HashMap, fmt, time::Instant};

use hookline_core::{models::Webhook, WebhookConfig};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Configuration for outbound webhook requests.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// TCP connect timeout.
    pub connect_timeout: std::time::Duration,

    /// Overall request timeout.
    pub read_timeout: std::time::Duration,

    /// Status codes counted as successful delivery.
    pub success_codes: Vec<u16>,

    /// User-Agent header for outbound requests.
    pub user_agent: String,

    /// Maximum response body bytes retained on the outcome.
    pub response_body_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from_config(&WebhookConfig::default())
    }
}

impl DispatchConfig {
    /// Derives dispatch settings from the delivery configuration.
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            success_codes: config.success_codes.clone(),
            user_agent: format!("hookline/{}", env!("CARGO_PKG_VERSION")),
            response_body_limit: config.response_body_limit,
        }
    }
}

/// Transport-level failure preventing any HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Request timed out before a response arrived.
    Timeout,
    /// TCP connection could not be established.
    ConnectionFailed,
    /// TLS handshake or certificate failure.
    Tls,
    /// Any other transport condition.
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::ConnectionFailed => write!(f, "connection failed"),
            Self::Tls => write!(f, "tls handshake failed"),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

/// Normalized result of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The destination produced an HTTP response.
    Completed {
        /// HTTP status code received.
        status: u16,
        /// Whether the status is in the configured success set.
        success: bool,
        /// Response body, truncated to the configured limit.
        body: String,
        /// Response headers with lowercase names.
        headers: HashMap<String, String>,
        /// Wall-clock request duration in whole milliseconds.
        duration_ms: i64,
    },
    /// The request never produced a response.
    TransportFailed {
        /// What went wrong on the wire.
        error: TransportError,
        /// Wall-clock duration until the failure in whole milliseconds.
        duration_ms: i64,
    },
}

impl DispatchOutcome {
    /// Whether the delivery succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { success: true, .. })
    }

    /// HTTP status code, when a response arrived.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Completed { status, .. } => Some(*status),
            Self::TransportFailed { .. } => None,
        }
    }

    /// Wall-clock duration of the attempt in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::Completed { duration_ms, .. } | Self::TransportFailed { duration_ms, .. } => {
                *duration_ms
            },
        }
    }
}

/// HTTP dispatcher for webhook payloads.
pub struct Dispatcher {
    client: reqwest::Client,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Creates a dispatcher with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// constructed.
    pub fn new(config: DispatchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::Configuration(format!("http client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Posts the webhook payload to its destination.
    ///
    /// The payload is JSON-encoded. `Content-Type: application/json` is the
    /// default; the webhook's custom headers are applied on top and win on
    /// collision. Redirects are not followed.
    pub async fn dispatch(&self, webhook: &Webhook) -> DispatchOutcome {
        let started = Instant::now();

        let response = self
            .client
            .post(&webhook.url)
            .header(CONTENT_TYPE, "application/json")
            .headers(custom_headers(webhook.headers()))
            .json(&webhook.payload)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = extract_headers(response.headers());
                let body = match response.text().await {
                    Ok(body) => truncate_body(body, self.config.response_body_limit),
                    Err(e) => {
                        return DispatchOutcome::TransportFailed {
                            error: map_transport_error(&e),
                            duration_ms: elapsed_ms(started),
                        };
                    },
                };
                // Reading the body is part of the attempt; time it too.
                let duration_ms = elapsed_ms(started);
                let success = self.config.success_codes.contains(&status);

                debug!(
                    webhook_id = %webhook.id,
                    status,
                    success,
                    duration_ms,
                    "dispatch completed"
                );

                DispatchOutcome::Completed { status, success, body, headers, duration_ms }
            },
            Err(e) => {
                let error = map_transport_error(&e);
                let duration_ms = elapsed_ms(started);

                debug!(
                    webhook_id = %webhook.id,
                    error = %error,
                    duration_ms,
                    "dispatch failed in transport"
                );

                DispatchOutcome::TransportFailed { error, duration_ms }
            },
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Builds a header map from the webhook's custom headers.
///
/// Invalid header names or values are skipped with a warning rather than
/// failing the whole dispatch.
fn custom_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            },
            _ => {
                warn!(header = %name, "skipping invalid custom header");
            },
        }
    }
    map
}

/// Normalizes response headers to a lowercase-keyed map.
fn extract_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Truncates a body to `limit` bytes without splitting a UTF-8 sequence.
fn truncate_body(mut body: String, limit: usize) -> String {
    if body.len() > limit {
        let mut end = limit;
        while end > 0 && !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

fn map_transport_error(error: &reqwest::Error) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout;
    }
    if error.is_connect() {
        // TLS problems surface as connect errors; the source chain tells
        // them apart from plain refused connections.
        if chain_mentions_tls(error) {
            return TransportError::Tls;
        }
        return TransportError::ConnectionFailed;
    }
    TransportError::Other(error.to_string())
}

fn chain_mentions_tls(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(current) = source {
        let message = current.to_string().to_lowercase();
        if message.contains("tls") || message.contains("certificate") || message.contains("handshake")
        {
            return true;
        }
        source = current.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hookline_core::models::EndpointId;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn webhook_for(url: String, headers: HashMap<String, String>) -> Webhook {
        Webhook::new(
            EndpointId::new(),
            url,
            serde_json::json!({"event": "invoice.paid", "amount": 1299}),
            headers,
            5,
            None,
            serde_json::Value::Null,
            Utc::now(),
        )
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            connect_timeout: std::time::Duration::from_secs(1),
            read_timeout: std::time::Duration::from_secs(1),
            ..DispatchConfig::default()
        }
    }

    #[tokio::test]
    async fn successful_delivery_reports_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(fast_config()).unwrap();
        let webhook = webhook_for(format!("{}/hooks", server.uri()), HashMap::new());

        match dispatcher.dispatch(&webhook).await {
            DispatchOutcome::Completed { status, success, body, .. } => {
                assert_eq!(status, 200);
                assert!(success);
                assert_eq!(body, "ok");
            },
            other => unreachable!("expected completed outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_completed_but_not_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(fast_config()).unwrap();
        let webhook = webhook_for(server.uri(), HashMap::new());

        let outcome = dispatcher.dispatch(&webhook).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.status(), Some(503));
    }

    #[tokio::test]
    async fn custom_headers_override_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/vnd.custom+json"))
            .and(header("x-signature", "abc123"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/vnd.custom+json".to_string());
        headers.insert("X-Signature".to_string(), "abc123".to_string());

        let dispatcher = Dispatcher::new(fast_config()).unwrap();
        let webhook = webhook_for(server.uri(), headers);

        assert_eq!(dispatcher.dispatch(&webhook).await.status(), Some(204));
    }

    #[tokio::test]
    async fn response_headers_are_lowercased() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).insert_header("X-Request-Id", "r-42"))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(fast_config()).unwrap();
        let webhook = webhook_for(server.uri(), HashMap::new());

        match dispatcher.dispatch(&webhook).await {
            DispatchOutcome::Completed { headers, .. } => {
                assert_eq!(headers.get("x-request-id").map(String::as_str), Some("r-42"));
            },
            other => unreachable!("expected completed outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_transport_failure() {
        let dispatcher = Dispatcher::new(fast_config()).unwrap();
        // Port 1 is essentially never listening on loopback.
        let webhook = webhook_for("http://127.0.0.1:1/hooks".to_string(), HashMap::new());

        match dispatcher.dispatch(&webhook).await {
            DispatchOutcome::TransportFailed { error, .. } => {
                assert!(matches!(
                    error,
                    TransportError::ConnectionFailed | TransportError::Other(_)
                ));
            },
            other => unreachable!("expected transport failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let config = DispatchConfig {
            read_timeout: std::time::Duration::from_millis(100),
            ..fast_config()
        };
        let dispatcher = Dispatcher::new(config).unwrap();
        let webhook = webhook_for(server.uri(), HashMap::new());

        match dispatcher.dispatch(&webhook).await {
            DispatchOutcome::TransportFailed { error, .. } => {
                assert_eq!(error, TransportError::Timeout);
            },
            other => unreachable!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_body_is_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(1000)))
            .mount(&server)
            .await;

        let config = DispatchConfig { response_body_limit: 100, ..fast_config() };
        let dispatcher = Dispatcher::new(config).unwrap();
        let webhook = webhook_for(server.uri(), HashMap::new());

        match dispatcher.dispatch(&webhook).await {
            DispatchOutcome::Completed { body, .. } => assert_eq!(body.len(), 100),
            other => unreachable!("expected completed outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duration_includes_body_read_time() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Send the headers promptly, then stall before the body so the
        // body read dominates the wall-clock time of the attempt.
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\n")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            socket.write_all(b"done").await.unwrap();
        });

        let dispatcher = Dispatcher::new(fast_config()).unwrap();
        let webhook = webhook_for(format!("http://{addr}/hooks"), HashMap::new());

        match dispatcher.dispatch(&webhook).await {
            DispatchOutcome::Completed { status, body, duration_ms, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body, "done");
                assert!(duration_ms >= 200, "body read time missing from {duration_ms}ms");
            },
            other => unreachable!("expected completed outcome, got {other:?}"),
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = "héllo".to_string();
        // Byte 2 lands inside the two-byte 'é'.
        let truncated = truncate_body(body, 2);
        assert_eq!(truncated, "h");
    }
}
