//! The business-profile service seam used by the provisioning pipeline.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::identity::Credential;
use crate::wizard::RegistrationDraft;

/// Remote calls the pipeline makes, in the order it makes them.
///
/// Every call is scoped by the credential minted at verification.
#[async_trait]
pub trait ProfileService: Send + Sync {
    /// Create (or, for a repeated idempotency key, return) the business
    /// profile. Returns the gym id.
    async fn create_business_profile(
        &self,
        credential: &Credential,
        profile: &BusinessProfile,
        idempotency_key: &str,
    ) -> Result<String, ServiceError>;

    async fn attach_media(
        &self,
        credential: &Credential,
        gym_id: &str,
        media: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError>;

    async fn attach_compliance_documents(
        &self,
        credential: &Credential,
        owner_id: Uuid,
        documents: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError>;

    /// Mark onboarding complete (`onboardingStep: 5`, status `completed`).
    async fn finalize(&self, credential: &Credential, gym_id: &str) -> Result<(), ServiceError>;
}

/// GeoJSON point, `[longitude, latitude]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoPoint {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub coordinates: [f64; 2],
}

/// Core profile fields sent with `create_business_profile`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessProfile {
    pub owner_id: Uuid,
    pub registration_session_id: Uuid,
    pub name: String,
    pub owner_name: String,
    pub email: String,
    pub phone: String,
    pub description: String,
    pub slogan: String,
    pub capacity: Option<u32>,
    pub open_time: String,
    pub close_time: String,
    pub address: String,
    pub location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub facilities: Vec<String>,
    pub onboarding_step: u8,
}

impl BusinessProfile {
    /// Build the profile from a validated draft. Identity fields come from
    /// the credential, not the draft.
    pub fn from_draft(credential: &Credential, draft: &RegistrationDraft) -> Self {
        let location = draft.has_valid_coordinates().then(|| GeoPoint {
            kind: "Point",
            coordinates: [draft.coordinates[0], draft.coordinates[1]],
        });
        Self {
            owner_id: credential.user.id,
            registration_session_id: credential.session_id,
            name: draft.business_name.trim().to_string(),
            owner_name: credential.user.name.clone(),
            email: credential.user.email.clone(),
            phone: credential.user.phone.clone(),
            description: draft.description.trim().to_string(),
            slogan: draft.slogan.trim().to_string(),
            capacity: draft.capacity,
            open_time: draft.open_time.trim().to_string(),
            close_time: draft.close_time.trim().to_string(),
            address: draft.address.trim().to_string(),
            location,
            category: draft.category.clone(),
            facilities: draft.facilities.iter().cloned().collect(),
            onboarding_step: 1,
        }
    }
}
