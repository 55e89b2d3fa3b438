//! HTTP client for the business-profile service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConfigError, ServiceError};
use crate::http::RemoteClient;
use crate::identity::Credential;

use super::service::{BusinessProfile, ProfileService};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Talks to the profile service over REST with the owner's bearer token.
pub struct HttpProfileService {
    http: RemoteClient,
    base_url: Url,
}

impl HttpProfileService {
    /// Fails when `base_url` is not an absolute http(s) URL.
    pub fn new(http: RemoteClient, base_url: &str) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: "PROFILE_SERVICE_URL".into(),
            message,
        };
        let base_url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(invalid(format!("{base_url} is not an http(s) base URL")));
        }
        Ok(Self { http, base_url })
    }

    /// Base URL plus one path segment per element, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

/// Pull the gym id out of `{ gym: { id } }`, accepting `_id` as well.
fn gym_id_from(body: &Value) -> Option<String> {
    let gym = body.get("gym")?;
    gym.get("id")
        .or_else(|| gym.get("_id"))
        .and_then(|id| match id {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[async_trait]
impl ProfileService for HttpProfileService {
    async fn create_business_profile(
        &self,
        credential: &Credential,
        profile: &BusinessProfile,
        idempotency_key: &str,
    ) -> Result<String, ServiceError> {
        let url = self.url(&["gym", "register"]);
        let body = self
            .http
            .send_json("create_business_profile", |c| {
                c.post(url.clone())
                    .bearer_auth(credential.bearer())
                    .header(IDEMPOTENCY_HEADER, idempotency_key)
                    .json(profile)
            })
            .await?;

        let gym_id = gym_id_from(&body).ok_or_else(|| ServiceError::InvalidResponse {
            operation: "create_business_profile".into(),
            reason: "response has no gym id".into(),
        })?;
        debug!(gym_id = %gym_id, "Business profile created");
        Ok(gym_id)
    }

    async fn attach_media(
        &self,
        credential: &Credential,
        gym_id: &str,
        media: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        let url = self.url(&["gym", gym_id, "media"]);
        self.http
            .send_json("attach_media", |c| {
                c.post(url.clone()).bearer_auth(credential.bearer()).json(media)
            })
            .await?;
        Ok(())
    }

    async fn attach_compliance_documents(
        &self,
        credential: &Credential,
        owner_id: Uuid,
        documents: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        let url = self.url(&["gyms", "verification"]);
        let body = json!({
            "ownerId": owner_id,
            "documents": documents,
        });
        self.http
            .send_json("attach_compliance_documents", |c| {
                c.put(url.clone()).bearer_auth(credential.bearer()).json(&body)
            })
            .await?;
        Ok(())
    }

    async fn finalize(&self, credential: &Credential, gym_id: &str) -> Result<(), ServiceError> {
        let url = self.url(&["gym", gym_id]);
        let body = json!({
            "onboardingStep": 5,
            "onboardingStatus": "completed",
        });
        self.http
            .send_json("finalize", |c| {
                c.put(url.clone()).bearer_auth(credential.bearer()).json(&body)
            })
            .await?;
        Ok(())
    }
}
