//! ProvisioningPipeline — runs the ordered profile-building calls under a
//! verified credential, resuming from the persisted cursor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, PipelineError, ServiceError};
use crate::identity::Credential;
use crate::store::Database;
use crate::wizard::{RegistrationDraft, WizardStateManager};

use super::cursor::{PipelineCursor, PipelineStep, ProvisioningRecord, idempotency_key};
use super::service::{BusinessProfile, ProfileService};

/// Where a run left the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningOutcome {
    pub state: PipelineCursor,
    pub gym_id: Option<String>,
    pub verified: bool,
}

impl From<&ProvisioningRecord> for ProvisioningOutcome {
    fn from(record: &ProvisioningRecord) -> Self {
        Self {
            state: record.state,
            gym_id: record.gym_id.clone(),
            verified: record.verified,
        }
    }
}

pub struct ProvisioningPipeline {
    db: Arc<dyn Database>,
    profiles: Arc<dyn ProfileService>,
    lease_ttl: TimeDelta,
}

impl ProvisioningPipeline {
    pub fn new(db: Arc<dyn Database>, profiles: Arc<dyn ProfileService>, lease_ttl: Duration) -> Self {
        Self {
            db,
            profiles,
            lease_ttl: TimeDelta::from_std(lease_ttl).unwrap_or(TimeDelta::minutes(2)),
        }
    }

    /// Refuse a credential that was not minted from `session_id`.
    pub fn check_session(credential: &Credential, session_id: Uuid) -> Result<(), PipelineError> {
        if credential.session_id != session_id {
            return Err(PipelineError::CredentialMismatch {
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Run every step not yet completed for this credential's session.
    ///
    /// A failing step ends the run with the cursor at the last success;
    /// calling `run` again resumes from there. A finalized record is
    /// returned as-is.
    pub async fn run(
        &self,
        credential: &Credential,
        draft: &RegistrationDraft,
    ) -> Result<ProvisioningOutcome, PipelineError> {
        WizardStateManager::from_draft(draft.clone()).provisioning_readiness()?;

        let key = idempotency_key(credential.user.id, credential.session_id);
        let holder = Uuid::new_v4().to_string();
        let now = Utc::now();
        if !self
            .db
            .try_acquire_lease(&key, &holder, now, now + self.lease_ttl)
            .await?
        {
            warn!(key = %key, "Provisioning run already in progress");
            return Err(PipelineError::AlreadyRunning { key });
        }

        let result = self.run_locked(credential, draft, &key).await;

        if let Err(e) = self.db.release_lease(&key, &holder).await {
            warn!(key = %key, error = %e, "Failed to release provisioning lease");
        }
        result
    }

    /// Re-run from the inputs stored by an earlier `run` for this
    /// credential's session. Lets any client holding the credential pick
    /// provisioning back up without the original draft.
    pub async fn resume(&self, credential: &Credential) -> Result<ProvisioningOutcome, PipelineError> {
        let key = idempotency_key(credential.user.id, credential.session_id);
        let value = self
            .db
            .get_provisioning_inputs(credential.user.id, credential.session_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "provisioning inputs".into(),
                id: key.clone(),
            })?;
        let draft: RegistrationDraft = serde_json::from_value(value)
            .map_err(|e| DatabaseError::Serialization(format!("provisioning inputs: {e}")))?;
        info!(key = %key, "Resuming provisioning from stored inputs");
        self.run(credential, &draft).await
    }

    /// Persisted record for (owner, session), if a run ever started.
    pub async fn status(
        &self,
        owner_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<ProvisioningRecord>, PipelineError> {
        Ok(self.db.get_provisioning_record(owner_id, session_id).await?)
    }

    async fn run_locked(
        &self,
        credential: &Credential,
        draft: &RegistrationDraft,
        key: &str,
    ) -> Result<ProvisioningOutcome, PipelineError> {
        let mut record = match self
            .db
            .get_provisioning_record(credential.user.id, credential.session_id)
            .await?
        {
            Some(record) => record,
            None => ProvisioningRecord::new(credential.user.id, credential.session_id),
        };

        if record.state.is_terminal() {
            info!(key = %key, "Provisioning already finalized");
            return Ok(ProvisioningOutcome::from(&record));
        }

        let inputs = serde_json::to_value(draft.snapshot())
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.db
            .save_provisioning_inputs(credential.user.id, credential.session_id, &inputs)
            .await?;

        record.attempts += 1;
        record.updated_at = Utc::now();
        self.db.save_provisioning_record(&record).await?;
        info!(key = %key, state = %record.state, attempt = record.attempts, "Provisioning run started");

        while let Some(step) = record.state.next_step() {
            info!(key = %key, step = %step, "Provisioning step started");
            match self.execute(step, credential, draft, &record, key).await {
                Ok(gym_id) => {
                    if let Some(gym_id) = gym_id {
                        record.gym_id = Some(gym_id);
                    }
                    record
                        .advance(step)
                        .map_err(|e| PipelineError::Store(DatabaseError::Constraint(e)))?;
                    self.db.save_provisioning_record(&record).await?;
                    info!(
                        key = %key,
                        step = %step,
                        gym_id = record.gym_id.as_deref().unwrap_or(""),
                        "Provisioning step completed"
                    );
                }
                Err(PipelineError::Step { step, source }) => {
                    record.record_failure(step, source.to_string());
                    self.db.save_provisioning_record(&record).await?;
                    error!(key = %key, step = %step, state = %record.state, error = %source, "Provisioning step failed");
                    return Err(PipelineError::Step { step, source });
                }
                Err(other) => return Err(other),
            }
        }

        info!(key = %key, gym_id = record.gym_id.as_deref().unwrap_or(""), "Provisioning finalized");
        Ok(ProvisioningOutcome::from(&record))
    }

    /// Execute one step. Returns the gym id for `CreateProfile`.
    async fn execute(
        &self,
        step: PipelineStep,
        credential: &Credential,
        draft: &RegistrationDraft,
        record: &ProvisioningRecord,
        key: &str,
    ) -> Result<Option<String>, PipelineError> {
        let gym_id = || {
            record.gym_id.clone().ok_or_else(|| {
                PipelineError::Store(DatabaseError::NotFound {
                    entity: "gym".into(),
                    id: key.to_string(),
                })
            })
        };

        let outcome: Result<Option<String>, ServiceError> = match step {
            PipelineStep::CreateProfile => {
                let profile = BusinessProfile::from_draft(credential, draft);
                self.profiles
                    .create_business_profile(credential, &profile, key)
                    .await
                    .map(Some)
            }
            PipelineStep::AttachMedia => {
                if draft.media.is_empty() {
                    info!(key = %key, "No media to attach");
                    Ok(None)
                } else {
                    self.profiles
                        .attach_media(credential, &gym_id()?, &draft.media)
                        .await
                        .map(|_| None)
                }
            }
            PipelineStep::AttachDocuments => self
                .profiles
                .attach_compliance_documents(credential, credential.user.id, &draft.documents)
                .await
                .map(|_| None),
            PipelineStep::Finalize => self
                .profiles
                .finalize(credential, &gym_id()?)
                .await
                .map(|_| None),
        };

        outcome.map_err(|source| PipelineError::Step { step, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use secrecy::SecretString;

    use crate::identity::{Role, UserRecord};
    use crate::store::LibSqlBackend;
    use crate::wizard::{DraftPatch, OWNER_ID_DOCUMENT_SLOT, PAN_DOCUMENT_SLOT};

    /// Records calls and fails the configured step.
    #[derive(Default)]
    struct FakeProfiles {
        calls: Mutex<Vec<PipelineStep>>,
        fail_on: Mutex<Option<PipelineStep>>,
    }

    impl FakeProfiles {
        fn failing(step: PipelineStep) -> Self {
            let fake = Self::default();
            *fake.fail_on.lock().unwrap() = Some(step);
            fake
        }

        fn heal(&self) {
            *self.fail_on.lock().unwrap() = None;
        }

        fn calls(&self) -> Vec<PipelineStep> {
            self.calls.lock().unwrap().clone()
        }

        fn call(&self, step: PipelineStep) -> Result<(), ServiceError> {
            self.calls.lock().unwrap().push(step);
            if *self.fail_on.lock().unwrap() == Some(step) {
                return Err(ServiceError::Status {
                    operation: step.to_string(),
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ProfileService for FakeProfiles {
        async fn create_business_profile(
            &self,
            _credential: &Credential,
            _profile: &BusinessProfile,
            _key: &str,
        ) -> Result<String, ServiceError> {
            self.call(PipelineStep::CreateProfile)?;
            Ok("gym-1".into())
        }

        async fn attach_media(
            &self,
            _credential: &Credential,
            gym_id: &str,
            _media: &BTreeMap<String, String>,
        ) -> Result<(), ServiceError> {
            assert_eq!(gym_id, "gym-1");
            self.call(PipelineStep::AttachMedia)
        }

        async fn attach_compliance_documents(
            &self,
            _credential: &Credential,
            _owner_id: Uuid,
            _documents: &BTreeMap<String, String>,
        ) -> Result<(), ServiceError> {
            self.call(PipelineStep::AttachDocuments)
        }

        async fn finalize(&self, _credential: &Credential, gym_id: &str) -> Result<(), ServiceError> {
            assert_eq!(gym_id, "gym-1");
            self.call(PipelineStep::Finalize)
        }
    }

    fn credential() -> Credential {
        Credential {
            token: SecretString::from("tok".to_string()),
            user: UserRecord {
                id: Uuid::new_v4(),
                name: "Ravi Kumar".into(),
                email: "ravi@irontemple.test".into(),
                phone: "+919876543210".into(),
                role: Role::Gym,
                created_at: Utc::now(),
            },
            session_id: Uuid::new_v4(),
        }
    }

    fn draft(with_media: bool) -> RegistrationDraft {
        let mut patch = DraftPatch::default()
            .business_name("Iron Temple")
            .owner_name("Ravi Kumar")
            .email("ravi@irontemple.test")
            .phone("+91 98765 43210")
            .description("Strength gym")
            .slogan("Lift more")
            .capacity(120)
            .hours("06:00", "22:00")
            .address("Sector 7, Dwarka")
            .coordinates(vec![77.10, 28.60])
            .document(PAN_DOCUMENT_SLOT, "https://cdn/pan.pdf")
            .document(OWNER_ID_DOCUMENT_SLOT, "https://cdn/id.pdf");
        if with_media {
            patch = patch.media("cover", "https://cdn/cover.jpg");
        }
        let mut draft = RegistrationDraft::default();
        patch.apply(&mut draft);
        draft
    }

    async fn pipeline(profiles: Arc<FakeProfiles>) -> (ProvisioningPipeline, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let pipeline = ProvisioningPipeline::new(db.clone(), profiles, Duration::from_secs(60));
        (pipeline, db)
    }

    #[tokio::test]
    async fn full_run_finalizes_unverified() {
        let profiles = Arc::new(FakeProfiles::default());
        let (pipeline, db) = pipeline(profiles.clone()).await;
        let credential = credential();

        let outcome = pipeline.run(&credential, &draft(true)).await.unwrap();
        assert_eq!(outcome.state, PipelineCursor::Finalized);
        assert_eq!(outcome.gym_id.as_deref(), Some("gym-1"));
        assert!(!outcome.verified);
        assert_eq!(profiles.calls().len(), 4);
        assert_eq!(db.list_unverified_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_failure_stops_everything() {
        let profiles = Arc::new(FakeProfiles::failing(PipelineStep::CreateProfile));
        let (pipeline, _db) = pipeline(profiles.clone()).await;
        let credential = credential();

        let err = pipeline.run(&credential, &draft(true)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Step { step: PipelineStep::CreateProfile, .. }));
        assert_eq!(profiles.calls(), vec![PipelineStep::CreateProfile]);

        let record = pipeline
            .status(credential.user.id, credential.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, PipelineCursor::Absent);
        assert!(record.gym_id.is_none());
        assert_eq!(record.failed_step, Some(PipelineStep::CreateProfile));
    }

    #[tokio::test]
    async fn retry_resumes_without_recreating() {
        let profiles = Arc::new(FakeProfiles::failing(PipelineStep::AttachMedia));
        let (pipeline, db) = pipeline(profiles.clone()).await;
        let credential = credential();

        pipeline.run(&credential, &draft(true)).await.unwrap_err();
        let record = pipeline
            .status(credential.user.id, credential.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, PipelineCursor::Created);
        assert!(db.list_unverified_records().await.unwrap().is_empty());

        profiles.heal();
        let outcome = pipeline.run(&credential, &draft(true)).await.unwrap();
        assert_eq!(outcome.state, PipelineCursor::Finalized);

        let creates = profiles
            .calls()
            .iter()
            .filter(|s| **s == PipelineStep::CreateProfile)
            .count();
        assert_eq!(creates, 1);

        let record = pipeline
            .status(credential.user.id, credential.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.attempts, 2);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn empty_media_skips_the_remote_call() {
        let profiles = Arc::new(FakeProfiles::default());
        let (pipeline, _db) = pipeline(profiles.clone()).await;

        let outcome = pipeline.run(&credential(), &draft(false)).await.unwrap();
        assert_eq!(outcome.state, PipelineCursor::Finalized);
        assert!(!profiles.calls().contains(&PipelineStep::AttachMedia));
    }

    #[tokio::test]
    async fn held_lease_rejects_a_second_run() {
        let profiles = Arc::new(FakeProfiles::default());
        let (pipeline, db) = pipeline(profiles.clone()).await;
        let credential = credential();

        let key = idempotency_key(credential.user.id, credential.session_id);
        let now = Utc::now();
        assert!(db
            .try_acquire_lease(&key, "other-run", now, now + TimeDelta::seconds(60))
            .await
            .unwrap());

        let err = pipeline.run(&credential, &draft(true)).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning { .. }));
        assert!(profiles.calls().is_empty());
    }

    #[tokio::test]
    async fn finalized_run_is_not_repeated() {
        let profiles = Arc::new(FakeProfiles::default());
        let (pipeline, _db) = pipeline(profiles.clone()).await;
        let credential = credential();

        pipeline.run(&credential, &draft(true)).await.unwrap();
        let again = pipeline.run(&credential, &draft(true)).await.unwrap();
        assert_eq!(again.state, PipelineCursor::Finalized);
        assert_eq!(profiles.calls().len(), 4);
    }

    #[tokio::test]
    async fn incomplete_draft_is_refused_before_any_call() {
        let profiles = Arc::new(FakeProfiles::default());
        let (pipeline, _db) = pipeline(profiles.clone()).await;

        let mut incomplete = draft(true);
        incomplete.documents.clear();
        let err = pipeline.run(&credential(), &incomplete).await.unwrap_err();
        match err {
            PipelineError::Incomplete(e) => assert_eq!(e.step, 5),
            other => panic!("expected incomplete draft, got {other:?}"),
        }
        assert!(profiles.calls().is_empty());
    }

    #[tokio::test]
    async fn resume_runs_from_stored_inputs() {
        let profiles = Arc::new(FakeProfiles::failing(PipelineStep::AttachDocuments));
        let (pipeline, _db) = pipeline(profiles.clone()).await;
        let credential = credential();

        pipeline.run(&credential, &draft(true)).await.unwrap_err();

        profiles.heal();
        let outcome = pipeline.resume(&credential).await.unwrap();
        assert_eq!(outcome.state, PipelineCursor::Finalized);
        assert_eq!(
            profiles.calls(),
            vec![
                PipelineStep::CreateProfile,
                PipelineStep::AttachMedia,
                PipelineStep::AttachDocuments,
                PipelineStep::AttachDocuments,
                PipelineStep::Finalize,
            ]
        );
    }

    #[tokio::test]
    async fn resume_without_a_prior_run_is_not_found() {
        let profiles = Arc::new(FakeProfiles::default());
        let (pipeline, _db) = pipeline(profiles.clone()).await;

        let err = pipeline.resume(&credential()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(DatabaseError::NotFound { .. })));
        assert!(profiles.calls().is_empty());
    }

    #[test]
    fn check_session_rejects_foreign_sessions() {
        let credential = credential();
        assert!(ProvisioningPipeline::check_session(&credential, credential.session_id).is_ok());
        assert!(matches!(
            ProvisioningPipeline::check_session(&credential, Uuid::new_v4()),
            Err(PipelineError::CredentialMismatch { .. })
        ));
    }
}
