//! HTTP upload transport for the collection API.
//!
//! Events go to `POST {base}/track/v2/projects/{token}/customers/events`,
//! customer updates to `POST {base}/track/v2/projects/{token}/customers`.

use crate::error::ConfigError;
use crate::record::{fields, payload_to_json, CustomerIds, Payload, PropertyValue};
use crate::transport::{UploadOutcome, UploadTransport};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// API base URL, e.g. `https://collector.example.com`
    pub base_url: String,
    /// Value for the `Authorization: Token …` header
    pub auth_token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn project_url(&self, project_token: &str) -> String {
        format!(
            "{}/track/v2/projects/{}",
            self.base_url.trim_end_matches('/'),
            project_token
        )
    }

    /// Event ingest endpoint for a project.
    pub fn events_url(&self, project_token: &str) -> String {
        format!("{}/customers/events", self.project_url(project_token))
    }

    /// Customer update endpoint for a project.
    pub fn customers_url(&self, project_token: &str) -> String {
        format!("{}/customers", self.project_url(project_token))
    }
}

#[derive(Debug, Serialize)]
struct EventBody {
    customer_ids: serde_json::Value,
    event_type: serde_json::Value,
    timestamp: serde_json::Value,
    properties: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct CustomerBody {
    customer_ids: serde_json::Value,
    properties: serde_json::Value,
}

/// Map an HTTP status to an upload outcome.
///
/// Throttling and gateway errors carry no information about the record
/// itself, so they are treated like a connectivity failure.
pub fn classify(status: u16, body: &str) -> UploadOutcome {
    match status {
        200..=299 => UploadOutcome::Success,
        429 | 502 | 503 | 504 => UploadOutcome::unavailable(format!("HTTP {status}")),
        _ => UploadOutcome::rejected(format!("HTTP {status}: {}", body.trim())),
    }
}

/// Uploads records with `reqwest`.
pub struct HttpTransport {
    config: TransportConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "upload_timeout".to_string(),
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    async fn post<B: Serialize>(&self, url: &str, body: &B) -> UploadOutcome {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(ref token) = self.config.auth_token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return UploadOutcome::unavailable(e.to_string()),
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            return UploadOutcome::Success;
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        classify(status, &body)
    }
}

fn project_token(payload: &Payload) -> Option<&str> {
    payload
        .get(fields::PROJECT_TOKEN)
        .and_then(PropertyValue::as_str)
}

fn field_json(payload: &Payload, key: &str) -> serde_json::Value {
    payload
        .get(key)
        .map(PropertyValue::to_json)
        .unwrap_or(serde_json::Value::Null)
}

fn properties_json(payload: &Payload) -> serde_json::Value {
    match payload.get(fields::PROPERTIES) {
        Some(PropertyValue::Object(props)) => payload_to_json(props),
        _ => serde_json::json!({}),
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn upload_customer(&self, payload: &Payload, ids: &CustomerIds) -> UploadOutcome {
        let Some(token) = project_token(payload) else {
            return UploadOutcome::rejected("customer update without project token");
        };

        // Identifiers recorded with the update win over the current snapshot.
        let mut customer_ids = ids.clone();
        if let Some(PropertyValue::Object(record_ids)) = payload.get(fields::IDS) {
            customer_ids.merge(&CustomerIds::from_payload(record_ids));
        }

        let body = CustomerBody {
            customer_ids: customer_ids.to_json(),
            properties: properties_json(payload),
        };
        self.post(&self.config.customers_url(token), &body).await
    }

    async fn upload_event(&self, payload: &Payload, ids: &CustomerIds) -> UploadOutcome {
        let Some(token) = project_token(payload) else {
            return UploadOutcome::rejected("event without project token");
        };

        let body = EventBody {
            customer_ids: ids.to_json(),
            event_type: field_json(payload, fields::EVENT_TYPE),
            timestamp: field_json(payload, fields::TIMESTAMP),
            properties: properties_json(payload),
        };
        self.post(&self.config.events_url(token), &body).await
    }
}
