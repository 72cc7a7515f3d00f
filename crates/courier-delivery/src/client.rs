//! HTTP client for delivery attempts.
//!
//! Sends the stored envelope bytes as a POST, classifies transport failures
//! into `Network` and `Timeout`, and captures a truncated, redacted copy of
//! the response for the delivery record.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use bytes::Bytes;
use courier_core::{DeliveryId, DestinationId, EventId};
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Suffix appended to truncated response bodies.
pub const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Replacement value for sensitive response headers.
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_HEADER_PATTERNS: &[&str] =
    &["authorization", "cookie", "api-key", "api_key", "apikey"];

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client-wide timeout ceiling. Each request also carries its own.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Bytes of response body kept for the delivery record.
    pub max_response_body_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: format!("Courier-Webhook-Delivery/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
            max_response_body_bytes: crate::DEFAULT_MAX_RESPONSE_BODY_BYTES,
        }
    }
}

/// One outbound attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery being attempted.
    pub delivery_id: DeliveryId,
    /// Destination receiving the request.
    pub destination_id: DestinationId,
    /// Producer event id.
    pub event_id: EventId,
    /// Event type.
    pub event_type: String,
    /// Destination URL.
    pub url: String,
    /// Signed envelope bytes.
    pub body: Bytes,
    /// `sha256=<hex>` signature of `body`.
    pub signature: String,
    /// Attempt number, 1-based.
    pub attempt_number: u32,
    /// Destination-defined headers.
    pub headers: HashMap<String, String>,
    /// Timeout for this attempt.
    pub timeout: Duration,
}

/// What the destination answered.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers with sensitive values redacted.
    pub headers: HashMap<String, String>,
    /// Response body, truncated to the configured size.
    pub body: String,
    /// Time from send to the end of body capture.
    pub duration: Duration,
    /// True for any 2xx status.
    pub is_success: bool,
}

/// Pooled HTTP client shared by all attempts.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the underlying client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends one attempt.
    ///
    /// Any HTTP response, including 4xx and 5xx, is returned as `Ok`. Only
    /// failures to obtain a response are errors.
    ///
    /// # Errors
    ///
    /// - `Timeout` when no response arrives within `request.timeout`
    /// - `Network` for connection, DNS, TLS and reset failures
    /// - `InvalidRequest` when the URL or a header cannot be encoded
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            destination_id = %request.destination_id,
            event_id = %request.event_id,
            attempt = request.attempt_number
        );

        async move {
            let start = Instant::now();
            let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);

            let mut http_request =
                self.client.post(&request.url).timeout(request.timeout).body(request.body);

            for (name, value) in &request.headers {
                if !is_managed_header(name) {
                    http_request = http_request.header(name, value);
                }
            }

            http_request = http_request
                .header("Content-Type", "application/json")
                .header("X-Webhook-Signature", &request.signature)
                .header("X-Webhook-ID", request.destination_id.to_string())
                .header("X-Event-ID", request.event_id.as_str())
                .header("X-Event-Type", &request.event_type)
                .header("X-Delivery-ID", request.delivery_id.to_string())
                .header("X-Delivery-Attempt", request.attempt_number.to_string());

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(duration_ms = start.elapsed().as_millis(), error = %e, "request failed");
                    return Err(classify(&e, timeout_ms));
                },
            };

            let status_code = response.status().as_u16();
            debug!(status = status_code, "received response");

            let delivery_response = self.capture_response(response, start).await;
            if !delivery_response.is_success {
                warn!(status = status_code, "destination returned non-success status");
            }
            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    async fn capture_response(&self, mut response: Response, start: Instant) -> DeliveryResponse {
        let status_code = response.status().as_u16();
        let is_success = response.status().is_success();
        let headers = redact_headers(response.headers());
        let limit = self.config.max_response_body_bytes;

        let mut buffer: Vec<u8> = Vec::new();
        let mut overflowed = false;
        let body = loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() > limit {
                        overflowed = true;
                        break truncate_body(&buffer, limit, overflowed);
                    }
                },
                Ok(None) => break truncate_body(&buffer, limit, overflowed),
                Err(e) => {
                    warn!(error = %e, "failed to read response body");
                    break format!("[failed to read response body: {e}]");
                },
            }
        };

        DeliveryResponse { status_code, headers, body, duration: start.elapsed(), is_success }
    }
}

fn classify(error: &reqwest::Error, timeout_ms: u64) -> DeliveryError {
    if error.is_timeout() {
        DeliveryError::timeout(timeout_ms)
    } else if error.is_builder() {
        DeliveryError::invalid_request(error.to_string())
    } else if error.is_connect() {
        DeliveryError::network(format!("connection failed: {error}"))
    } else {
        DeliveryError::network(error.to_string())
    }
}

/// Keeps at most `limit` bytes, marking overflow with [`TRUNCATION_SUFFIX`].
pub fn truncate_body(bytes: &[u8], limit: usize, overflowed: bool) -> String {
    if !overflowed && bytes.len() <= limit {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let keep = limit.saturating_sub(TRUNCATION_SUFFIX.len()).min(bytes.len());
    format!("{}{TRUNCATION_SUFFIX}", String::from_utf8_lossy(&bytes[..keep]))
}

/// Copies response headers, replacing sensitive values with [`REDACTED`].
pub fn redact_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_string();
            if is_sensitive_header(&name) {
                Some((name, REDACTED.to_string()))
            } else {
                value.to_str().ok().map(|value| (name, value.to_string()))
            }
        })
        .collect()
}

fn is_sensitive_header(name: &str) -> bool {
    let lowercase = name.to_ascii_lowercase();
    SENSITIVE_HEADER_PATTERNS.iter().any(|pattern| lowercase.contains(pattern))
}

/// Headers set by the client itself that destination configuration may not
/// override.
fn is_managed_header(name: &str) -> bool {
    let lowercase = name.to_ascii_lowercase();
    matches!(
        lowercase.as_str(),
        "content-type"
            | "content-length"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "x-webhook-signature"
            | "x-webhook-id"
            | "x-event-id"
            | "x-event-type"
            | "x-delivery-id"
            | "x-delivery-attempt"
    )
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request(url: String) -> DeliveryRequest {
        let mut headers = HashMap::new();
        headers.insert("X-Tenant".to_string(), "acme".to_string());
        headers.insert("Content-Type".to_string(), "text/plain".to_string());

        DeliveryRequest {
            delivery_id: DeliveryId::new(),
            destination_id: DestinationId::new(),
            event_id: EventId::from("evt_1"),
            event_type: "user.created".to_string(),
            url,
            body: Bytes::from_static(br#"{"id":"evt_1"}"#),
            signature: "sha256=abc".to_string(),
            attempt_number: 2,
            headers,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn successful_delivery_sends_system_and_custom_headers() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .and(matchers::header("Content-Type", "application/json"))
            .and(matchers::header("X-Webhook-Signature", "sha256=abc"))
            .and(matchers::header("X-Event-ID", "evt_1"))
            .and(matchers::header("X-Event-Type", "user.created"))
            .and(matchers::header("X-Delivery-Attempt", "2"))
            .and(matchers::header("X-Tenant", "acme"))
            .and(matchers::header_exists("X-Webhook-ID"))
            .and(matchers::header_exists("X-Delivery-ID"))
            .and(matchers::body_string(r#"{"id":"evt_1"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request(format!("{}/webhook", server.uri()))).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
        assert_eq!(response.body, "OK");
    }

    #[tokio::test]
    async fn error_status_is_a_response_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request(server.uri())).await.unwrap();

        assert_eq!(response.status_code, 404);
        assert!(!response.is_success);
        assert_eq!(response.body, "Not Found");
    }

    #[tokio::test]
    async fn slow_destination_times_out() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let mut slow = request(server.uri());
        slow.timeout = Duration::from_millis(100);

        let error = client.deliver(slow).await.unwrap_err();

        assert!(matches!(error, DeliveryError::Timeout { timeout_ms: 100 }));
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let client = DeliveryClient::with_defaults().unwrap();

        let error = client.deliver(request("http://127.0.0.1:1/webhook".to_string())).await;

        assert!(matches!(error, Err(DeliveryError::Network { .. })));
    }

    #[tokio::test]
    async fn long_bodies_are_truncated_and_secrets_redacted() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string("x".repeat(4096))
                    .append_header("Set-Cookie", "session=abc")
                    .append_header("X-Api-Key", "k")
                    .append_header("X-Request-Id", "req_1"),
            )
            .mount(&server)
            .await;

        let config = ClientConfig { max_response_body_bytes: 64, ..ClientConfig::default() };
        let client = DeliveryClient::new(config).unwrap();
        let response = client.deliver(request(server.uri())).await.unwrap();

        assert_eq!(response.body.len(), 64);
        assert!(response.body.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(response.headers.get("set-cookie").map(String::as_str), Some(REDACTED));
        assert_eq!(response.headers.get("x-api-key").map(String::as_str), Some(REDACTED));
        assert_eq!(response.headers.get("x-request-id").map(String::as_str), Some("req_1"));
    }

    #[test]
    fn short_body_is_kept_verbatim() {
        assert_eq!(truncate_body(b"hello", 10, false), "hello");
        assert_eq!(truncate_body(b"", 10, false), "");
    }

    #[test]
    fn managed_headers_identified() {
        assert!(is_managed_header("Content-Length"));
        assert!(is_managed_header("x-webhook-signature"));
        assert!(is_managed_header("X-DELIVERY-ATTEMPT"));
        assert!(!is_managed_header("X-Custom-Header"));
        assert!(!is_managed_header("Authorization"));
    }

    #[test]
    fn sensitive_header_patterns() {
        assert!(is_sensitive_header("Authorization"));
        assert!(!is_sensitive_header("www-authenticate"));
        assert!(is_sensitive_header("x-apikey"));
        assert!(is_sensitive_header("X-API_KEY"));
        assert!(!is_sensitive_header("content-type"));
    }
}
