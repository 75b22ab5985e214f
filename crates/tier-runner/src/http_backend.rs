//! JSON-over-HTTP backend.
//!
//! POSTs `{task_id, payload, estimated_units}` to a fixed URL and maps the
//! HTTP status onto [`ErrorKind`] so retries and breakers see typed failures.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use coordination::{Backend, BackendError, BackendResult, ErrorKind, Task};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest response excerpt kept in an error message.
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    task_id: &'a str,
    payload: &'a serde_json::Value,
    estimated_units: f64,
}

/// Envelope a service may use to report its own cost.
#[derive(Debug, Deserialize)]
struct RunResponse {
    payload: serde_json::Value,
    #[serde(default)]
    cost: Option<f64>,
}

pub struct HttpBackend {
    id: String,
    url: String,
    api_key: Option<String>,
    cost_per_call: f64,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        api_key: Option<String>,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            id: id.into(),
            url: url.into(),
            api_key,
            cost_per_call: 0.0,
            client,
        })
    }

    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Body is either `{"payload": ..., "cost": ...}` or the bare payload.
    fn parse_body(&self, body: &str) -> Result<(serde_json::Value, f64), BackendError> {
        let value: serde_json::Value = serde_json::from_str(body).map_err(|e| {
            BackendError::new(
                ErrorKind::ServerError,
                format!("invalid JSON from {}: {e}", self.id),
            )
        })?;
        if value.get("payload").is_some() {
            if let Ok(envelope) = serde_json::from_value::<RunResponse>(value.clone()) {
                return Ok((
                    envelope.payload,
                    envelope.cost.unwrap_or(self.cost_per_call),
                ));
            }
        }
        Ok((value, self.cost_per_call))
    }
}

/// Error kind for a non-success HTTP status.
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Timeout,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimit,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::AuthError,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorKind::ValidationError,
        s if s.is_server_error() => ErrorKind::ServerError,
        // remaining 4xx will not improve on retry
        _ => ErrorKind::ValidationError,
    }
}

fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        ErrorKind::ConnectionError
    } else if err.is_decode() || err.is_body() {
        ErrorKind::ServerError
    } else {
        ErrorKind::ConnectionError
    }
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(&self, task: &Task, timeout: Duration) -> Result<BackendResult, BackendError> {
        let started = Instant::now();
        let mut request = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&RunRequest {
                task_id: &task.id,
                payload: &task.payload,
                estimated_units: task.estimated_units,
            });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::new(classify_transport(&e), e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::new(classify_transport(&e), e.to_string()))?;

        debug!(backend = %self.id, status = status.as_u16(), "HTTP backend responded");

        if !status.is_success() {
            return Err(BackendError::new(
                classify_status(status),
                format!("{status}: {}", excerpt(&body)),
            ));
        }

        let (payload, cost) = self.parse_body(&body)?;
        Ok(BackendResult::ok(payload, cost).with_latency(started.elapsed()))
    }
}
