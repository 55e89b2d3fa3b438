//! Hand-off of one-time codes to the notification service.
//!
//! Delivery itself (email/SMS) belongs to that service; this module only
//! forwards the code.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ServiceError;
use crate::http::RemoteClient;

/// Delivers a verification code out of band.
#[async_trait]
pub trait CodeNotifier: Send + Sync {
    async fn send_code(&self, email: &str, code: &str) -> Result<(), ServiceError>;
}

/// Posts codes to a notification-service webhook.
pub struct WebhookNotifier {
    http: RemoteClient,
    url: String,
}

impl WebhookNotifier {
    pub fn new(http: RemoteClient, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CodeNotifier for WebhookNotifier {
    async fn send_code(&self, email: &str, code: &str) -> Result<(), ServiceError> {
        let body = serde_json::json!({
            "email": email,
            "code": code,
            "purpose": "registration",
        });
        self.http
            .send_json("notify_code", |c| c.post(&self.url).json(&body))
            .await?;
        info!(email = %email, "Verification code handed to notification service");
        Ok(())
    }
}

/// Development notifier: no delivery, the code is only written to the
/// debug log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl CodeNotifier for LogNotifier {
    async fn send_code(&self, email: &str, code: &str) -> Result<(), ServiceError> {
        info!(email = %email, "No notification service configured, code not delivered");
        debug!(email = %email, code = %code, "Development verification code");
        Ok(())
    }
}

/// Test notifier that keeps every code it is handed.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CapturingNotifier {
    sent: std::sync::Mutex<Vec<(String, String)>>,
    pub fail: bool,
}

#[cfg(test)]
impl CapturingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Latest code sent to `email`.
    pub fn last_code(&self, email: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, code)| code.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl CodeNotifier for CapturingNotifier {
    async fn send_code(&self, email: &str, code: &str) -> Result<(), ServiceError> {
        if self.fail {
            return Err(ServiceError::Network {
                operation: "notify_code".into(),
                reason: "connection refused".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((email.to_string(), code.to_string()));
        Ok(())
    }
}
