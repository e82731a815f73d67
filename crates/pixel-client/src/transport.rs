//! Network transport for the collection endpoint.

use std::time::Duration;

use async_trait::async_trait;
use pixel_core::{PixelError, Result};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::trace;

/// One POST to the collection endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectRequest {
    /// Collection URL.
    pub url: String,
    /// Serialized envelope.
    pub body: String,
    /// The request should outlive the page that issued it.
    pub keepalive: bool,
}

/// Whatever the endpoint answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

impl CollectResponse {
    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as an identity reconciliation.
    ///
    /// Only a body that is not JSON at all is an error. Each identifier is
    /// read on its own: a string or number is taken, anything else leaves
    /// that side unset without affecting the other.
    pub fn try_reconciliation(&self) -> Result<Reconciliation> {
        let body: Value = serde_json::from_str(&self.body)
            .map_err(|e| PixelError::MalformedResponse(e.to_string()))?;
        Ok(Reconciliation {
            visitor_id: identifier(&body, "visitorId"),
            session_id: identifier(&body, "sessionId"),
        })
    }

    /// Server-side identity reconciliation, if the body carries any.
    ///
    /// Non-JSON or unrelated bodies yield the empty reconciliation.
    pub fn reconciliation(&self) -> Reconciliation {
        self.try_reconciliation().unwrap_or_else(|e| {
            if !self.body.is_empty() {
                trace!(error = %e, "ignoring response body");
            }
            Reconciliation::default()
        })
    }
}

/// Identifiers the server wants the client to adopt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Server-assigned visitor ID.
    pub visitor_id: Option<String>,
    /// Server-assigned session ID.
    pub session_id: Option<String>,
}

fn identifier(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        Value::Null => None,
        other => {
            trace!(key, value = %other, "ignoring unusable identifier");
            None
        }
    }
}

/// Delivery primitive used by the queue.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST the request and return the response.
    ///
    /// `Err(PixelError::Network)` means no response was received.
    async fn post(&self, request: &CollectRequest) -> Result<CollectResponse>;

    /// Fire-and-forget transmission during page teardown.
    ///
    /// `Ok` means the payload was handed off; the caller never learns more.
    /// Transports without such a primitive keep the default.
    fn send_beacon(&self, _request: &CollectRequest) -> Result<()> {
        Err(PixelError::BeaconUnavailable)
    }
}

/// HTTP transport backed by `reqwest`.
///
/// No cookie store is configured, so requests never carry credentials.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport. `timeout` of `None` keeps the client defaults.
    pub fn new(timeout: Option<Duration>) -> Self {
        let mut builder = reqwest::Client::builder().user_agent(concat!(
            "pixel-client/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Self {
            client: builder.build().unwrap_or_default(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(&self, request: &CollectRequest) -> Result<CollectResponse> {
        trace!(
            url = %request.url,
            keepalive = request.keepalive,
            bytes = request.body.len(),
            "posting envelope"
        );
        let response = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| PixelError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        // A body that fails mid-read still means the endpoint answered.
        let body = response.text().await.unwrap_or_default();
        Ok(CollectResponse { status, body })
    }
}
