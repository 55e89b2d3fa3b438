//! Outbound HTTP — bounded timeouts and a single retry for transient failures.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::error::ServiceError;

/// Shared `reqwest` client for collaborator services.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: Client,
    timeout: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl RemoteClient {
    pub fn new(timeout: Duration, retry_backoff: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Network {
                operation: "build_http_client".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            timeout,
            retry_attempts: 1,
            retry_backoff,
        })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Send a request built by `build`, retrying once on transient failure.
    ///
    /// The JSON body is returned on success. A body carrying
    /// `"success": false` is treated as a rejection even with a 2xx status.
    pub async fn send_json<F>(&self, op: &str, build: F) -> Result<Value, ServiceError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        for attempt in 0..=self.retry_attempts {
            match self.send_once(op, build(&self.client)).await {
                Ok(body) => return Ok(body),
                Err(err) => {
                    if attempt == self.retry_attempts || !err.is_transient() {
                        error!(operation = op, attempts = attempt + 1, error = %err, "Remote call failed");
                        return Err(err);
                    }
                    let backoff = self.retry_backoff * (attempt + 1);
                    warn!(
                        operation = op,
                        attempt = attempt + 1,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transient failure, retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }

        Err(ServiceError::Network {
            operation: op.to_string(),
            reason: "retries exhausted".into(),
        })
    }

    async fn send_once(&self, op: &str, request: RequestBuilder) -> Result<Value, ServiceError> {
        let response = request.send().await.map_err(|e| self.classify(op, e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.classify(op, e))?;

        if !status.is_success() {
            return Err(ServiceError::Status {
                operation: op.to_string(),
                status: status.as_u16(),
                body: truncate(&text, 512),
            });
        }

        let body: Value = if text.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&text).map_err(|e| ServiceError::InvalidResponse {
                operation: op.to_string(),
                reason: e.to_string(),
            })?
        };

        if body.get("success").and_then(Value::as_bool) == Some(false) {
            let reason = body
                .get("message")
                .or_else(|| body.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("service reported failure")
                .to_string();
            return Err(ServiceError::Rejected {
                operation: op.to_string(),
                reason,
            });
        }

        Ok(body)
    }

    fn classify(&self, op: &str, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::Timeout {
                operation: op.to_string(),
                timeout: self.timeout,
            }
        } else {
            ServiceError::Network {
                operation: op.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
