//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use partner_onboarding::error::ServiceError;
use partner_onboarding::identity::{CodeNotifier, Credential};
use partner_onboarding::pipeline::{BusinessProfile, PipelineStep, ProfileService};
use partner_onboarding::wizard::{
    DraftPatch, OWNER_ID_DOCUMENT_SLOT, PAN_DOCUMENT_SLOT,
};

/// Keeps every code instead of delivering it.
#[derive(Default)]
pub struct InboxNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl InboxNotifier {
    pub fn last_code(&self, email: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, code)| code.clone())
    }
}

#[async_trait]
impl CodeNotifier for InboxNotifier {
    async fn send_code(&self, email: &str, code: &str) -> Result<(), ServiceError> {
        self.sent
            .lock()
            .unwrap()
            .push((email.to_string(), code.to_string()));
        Ok(())
    }
}

/// In-process profile service that records calls.
#[derive(Default)]
pub struct FakeProfileService {
    calls: Mutex<Vec<PipelineStep>>,
    profiles: Mutex<Vec<BusinessProfile>>,
    fail_on: Mutex<Option<PipelineStep>>,
    /// When set, `create_business_profile` signals `entered` and waits for
    /// `release`.
    hold: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeProfileService {
    pub fn failing(step: PipelineStep) -> Self {
        let fake = Self::default();
        fake.fail_on(Some(step));
        fake
    }

    pub fn holding(entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            hold: Some((entered, release)),
            ..Self::default()
        }
    }

    pub fn fail_on(&self, step: Option<PipelineStep>) {
        *self.fail_on.lock().unwrap() = step;
    }

    pub fn calls(&self) -> Vec<PipelineStep> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, step: PipelineStep) -> usize {
        self.calls().iter().filter(|s| **s == step).count()
    }

    pub fn last_profile(&self) -> Option<BusinessProfile> {
        self.profiles.lock().unwrap().last().cloned()
    }

    fn record(&self, step: PipelineStep) -> Result<(), ServiceError> {
        self.calls.lock().unwrap().push(step);
        if *self.fail_on.lock().unwrap() == Some(step) {
            return Err(ServiceError::Status {
                operation: step.to_string(),
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileService for FakeProfileService {
    async fn create_business_profile(
        &self,
        _credential: &Credential,
        profile: &BusinessProfile,
        idempotency_key: &str,
    ) -> Result<String, ServiceError> {
        if let Some((entered, release)) = &self.hold {
            entered.notify_one();
            release.notified().await;
        }
        self.record(PipelineStep::CreateProfile)?;
        self.profiles.lock().unwrap().push(profile.clone());
        Ok(format!("gym-{}", &idempotency_key[..8]))
    }

    async fn attach_media(
        &self,
        _credential: &Credential,
        _gym_id: &str,
        _media: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        self.record(PipelineStep::AttachMedia)
    }

    async fn attach_compliance_documents(
        &self,
        _credential: &Credential,
        _owner_id: Uuid,
        _documents: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        self.record(PipelineStep::AttachDocuments)
    }

    async fn finalize(&self, _credential: &Credential, _gym_id: &str) -> Result<(), ServiceError> {
        self.record(PipelineStep::Finalize)
    }
}

pub const OWNER_EMAIL: &str = "ravi@irontemple.test";

/// Every step-1 field, two facilities, five photos and both documents.
pub fn complete_draft() -> DraftPatch {
    DraftPatch::default()
        .business_name("Iron Temple")
        .owner_name("Ravi Kumar")
        .email(OWNER_EMAIL)
        .phone("+91 98765 43210")
        .password("correct-horse")
        .description("Strength and conditioning gym")
        .slogan("Lift more")
        .capacity(120)
        .hours("06:00", "22:00")
        .address("Sector 7, Dwarka, New Delhi")
        .coordinates(vec![77.10, 28.60])
        .category("strength")
        .facilities(["sauna", "free_weights"])
        .media("cover", "https://cdn.test/cover.jpg")
        .media("front", "https://cdn.test/front.jpg")
        .media("floor", "https://cdn.test/floor.jpg")
        .media("lockers", "https://cdn.test/lockers.jpg")
        .media("cardio", "https://cdn.test/cardio.jpg")
        .document(PAN_DOCUMENT_SLOT, "https://cdn.test/pan.pdf")
        .document(OWNER_ID_DOCUMENT_SLOT, "https://cdn.test/aadhaar.pdf")
}
