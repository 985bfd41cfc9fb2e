//! Generic webhook target adapter.
//!
//! POSTs a JSON envelope to the target endpoint with optional bearer
//! auth and an optional HMAC-SHA256 payload signature, and maps the
//! HTTP outcome into the engine's delivery error taxonomy. Resolved
//! alerts go through the same envelope, so `resolve` is just `deliver`
//! with the alert's resolved status.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::debug;

use ac_common::{Alert, AlertStatus, DeliveryError, Target, TargetAdapter};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-AlertCast-Signature";

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            user_agent: "alertcast/0.1".to_string(),
        }
    }
}

/// Envelope POSTed to webhook endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookEnvelope<'a> {
    alert_name: &'a str,
    fingerprint: &'a str,
    severity: &'a str,
    status: AlertStatus,
    starts_at: DateTime<Utc>,
    payload: &'a serde_json::Value,
}

impl<'a> WebhookEnvelope<'a> {
    fn from_alert(alert: &'a Alert) -> Self {
        Self {
            alert_name: &alert.name,
            fingerprint: &alert.fingerprint,
            severity: &alert.severity,
            status: alert.status,
            starts_at: alert.starts_at,
            payload: &alert.payload,
        }
    }
}

/// Hex HMAC-SHA256 of the request body, as carried in the signature
/// header (prefixed `sha256=`).
pub fn signature(secret: &str, body: &[u8]) -> String {
    // HMAC accepts any key length, so new_from_slice cannot fail
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub struct WebhookAdapter {
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(config: WebhookConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| DeliveryError::Configuration(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    async fn post(&self, target: &Target, alert: &Alert) -> Result<(), DeliveryError> {
        let endpoint = target.endpoint.as_deref().ok_or_else(|| {
            DeliveryError::Configuration(format!("target '{}' has no endpoint", target.name))
        })?;

        let body = serde_json::to_vec(&WebhookEnvelope::from_alert(alert))
            .map_err(|e| DeliveryError::Adapter(format!("envelope serialization: {}", e)))?;

        let mut request = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json");

        if let Some(token) = &target.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(secret) = &target.signing_secret {
            request = request.header(
                SIGNATURE_HEADER,
                format!("sha256={}", signature(secret, &body)),
            );
        }

        debug!(target = %target.name, endpoint, alert = %alert.name, "posting webhook");
        let response = request.body(body).send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut message = response.text().await.unwrap_or_default();
        message.truncate(512);
        Err(DeliveryError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout(e.to_string())
    } else if e.is_connect() {
        let msg = e.to_string();
        if msg.contains("dns") {
            DeliveryError::Dns(msg)
        } else {
            DeliveryError::Connect(msg)
        }
    } else {
        DeliveryError::Adapter(e.to_string())
    }
}

#[async_trait]
impl TargetAdapter for WebhookAdapter {
    async fn deliver(&self, target: &Target, alert: &Alert) -> Result<(), DeliveryError> {
        self.post(target, alert).await
    }

    async fn resolve(&self, target: &Target, alert: &Alert) -> Result<(), DeliveryError> {
        self.post(target, alert).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> Alert {
        Alert {
            fingerprint: "abc123".into(),
            name: "HighErrorRate".into(),
            severity: "critical".into(),
            status: AlertStatus::Firing,
            payload: serde_json::json!({"service": "checkout"}),
            starts_at: Utc::now(),
        }
    }

    fn target(endpoint: &str) -> Target {
        Target {
            name: "ops-hook".into(),
            kind: "webhook".into(),
            endpoint: Some(endpoint.into()),
            auth_token: None,
            signing_secret: None,
            rate_limit_per_minute: None,
        }
    }

    #[test]
    fn test_signature_shape_and_determinism() {
        let sig = signature("secret", b"payload");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, signature("secret", b"payload"));
        assert_ne!(sig, signature("other", b"payload"));
        assert_ne!(sig, signature("secret", b"different"));
    }

    #[tokio::test]
    async fn test_successful_delivery_posts_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "alertName": "HighErrorRate",
                "severity": "critical",
                "status": "firing",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = WebhookAdapter::new(WebhookConfig::default()).unwrap();
        let t = target(&format!("{}/hook", server.uri()));
        adapter.deliver(&t, &alert()).await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_and_signature_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "Bearer tok-1"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = WebhookAdapter::new(WebhookConfig::default()).unwrap();
        let mut t = target(&server.uri());
        t.auth_token = Some("tok-1".into());
        t.signing_secret = Some("hush".into());
        adapter.deliver(&t, &alert()).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_signature_without_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let adapter = WebhookAdapter::new(WebhookConfig::default()).unwrap();
        adapter.deliver(&target(&server.uri()), &alert()).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_failure_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let adapter = WebhookAdapter::new(WebhookConfig::default()).unwrap();
        let err = adapter
            .deliver(&target(&server.uri()), &alert())
            .await
            .unwrap_err();
        match err {
            DeliveryError::Http { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("expected http error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_configuration_error() {
        let adapter = WebhookAdapter::new(WebhookConfig::default()).unwrap();
        let mut t = target("http://unused");
        t.endpoint = None;
        let err = adapter.deliver(&t, &alert()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_maps_to_connect() {
        let adapter = WebhookAdapter::new(WebhookConfig {
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap();
        // Reserved port with nothing listening
        let err = adapter
            .deliver(&target("http://127.0.0.1:9"), &alert())
            .await
            .unwrap_err();
        assert!(
            matches!(err, DeliveryError::Connect(_) | DeliveryError::Timeout(_)),
            "got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_acknowledge_unsupported() {
        let adapter = WebhookAdapter::new(WebhookConfig::default()).unwrap();
        let err = adapter
            .acknowledge(&target("http://unused"), &alert())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Unsupported("acknowledge")));
    }
}
