//! End-to-end onboarding tests: wizard → register → verify → provision,
//! against an in-memory store and an in-process profile service.

mod common;

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::sync::Notify;
use tokio::time::timeout;

use partner_onboarding::config::OnboardingConfig;
use partner_onboarding::error::{Error, PipelineError, VerificationError};
use partner_onboarding::flow::{FlowStage, OnboardingFlow};
use partner_onboarding::identity::{Credential, RegistrationRequest, Role};
use partner_onboarding::pipeline::{PipelineCursor, PipelineStep};
use partner_onboarding::recovery::SessionRecoveryStore;
use partner_onboarding::review::ReviewQueue;
use partner_onboarding::routes::OnboardingRouteState;
use partner_onboarding::store::{Database, LibSqlBackend};
use partner_onboarding::wizard::{RegistrationDraft, WizardStateManager, WizardStep};

use common::{FakeProfileService, InboxNotifier, OWNER_EMAIL, complete_draft};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Env {
    db: Arc<dyn Database>,
    notifier: Arc<InboxNotifier>,
    profiles: Arc<FakeProfileService>,
    state: OnboardingRouteState,
}

impl Env {
    async fn new(profiles: FakeProfileService) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let notifier = Arc::new(InboxNotifier::default());
        let profiles = Arc::new(profiles);
        let state = OnboardingRouteState::new(
            &OnboardingConfig::default(),
            Arc::clone(&db),
            notifier.clone(),
            profiles.clone(),
        );
        Self {
            db,
            notifier,
            profiles,
            state,
        }
    }

    fn flow(&self, client_id: &str) -> OnboardingFlow {
        OnboardingFlow::new(
            Arc::clone(&self.state.provisioner),
            Arc::clone(&self.state.gate),
            Arc::clone(&self.state.pipeline),
            SessionRecoveryStore::new(Arc::clone(&self.db), client_id),
        )
    }

    fn code(&self) -> String {
        self.notifier.last_code(OWNER_EMAIL).unwrap()
    }

    /// Register and verify directly through the identity layer.
    async fn credential(&self) -> Credential {
        let session_id = self
            .state
            .provisioner
            .begin_registration(RegistrationRequest::new(
                OWNER_EMAIL,
                "correct-horse",
                "9876543210",
                "Ravi Kumar",
                Role::Gym,
            ))
            .await
            .unwrap();
        self.state
            .gate
            .verify(session_id, OWNER_EMAIL, Role::Gym, &self.code())
            .await
            .unwrap()
    }
}

fn filled_flow(env: &Env, client_id: &str) -> OnboardingFlow {
    let mut flow = env.flow(client_id);
    flow.wizard_mut().update_field(complete_draft());
    flow.wizard_mut().go_to(WizardStep::Documents).unwrap();
    flow
}

fn full_draft() -> RegistrationDraft {
    let mut wizard = WizardStateManager::new();
    wizard.update_field(complete_draft());
    wizard.draft().clone()
}

fn wrong(code: &str) -> String {
    if code == "000000" { "111111".into() } else { "000000".into() }
}

#[tokio::test]
async fn full_flow_finalizes_an_unverified_gym() {
    timeout(TEST_TIMEOUT, async {
        let env = Env::new(FakeProfileService::default()).await;
        let mut flow = filled_flow(&env, "device-1");

        let session_id = flow.submit().await.unwrap();
        assert!(matches!(flow.stage(), FlowStage::AwaitingCode { .. }));

        let credential = flow.verify(&env.code()).await.unwrap();
        assert_eq!(credential.session_id, session_id);
        assert_eq!(credential.user.email, OWNER_EMAIL);

        let outcome = flow.provision().await.unwrap();
        assert_eq!(outcome.state, PipelineCursor::Finalized);
        assert!(outcome.gym_id.is_some());
        assert!(!outcome.verified);

        assert_eq!(
            env.profiles.calls(),
            vec![
                PipelineStep::CreateProfile,
                PipelineStep::AttachMedia,
                PipelineStep::AttachDocuments,
                PipelineStep::Finalize,
            ]
        );
        let profile = env.profiles.last_profile().unwrap();
        assert_eq!(profile.facilities.len(), 2);
        assert_eq!(profile.location.unwrap().coordinates, [77.10, 28.60]);

        let unverified = env.state.review.list_unverified().await.unwrap();
        assert_eq!(unverified.len(), 1);
        assert_eq!(unverified[0].gym_id, outcome.gym_id);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn consumed_session_rejects_the_original_code() {
    let env = Env::new(FakeProfileService::default()).await;
    let mut flow = filled_flow(&env, "device-1");
    let session_id = flow.submit().await.unwrap();
    let code = env.code();
    flow.verify(&code).await.unwrap();

    let err = env
        .state
        .gate
        .verify(session_id, OWNER_EMAIL, Role::Gym, &code)
        .await
        .unwrap_err();
    assert_eq!(err, VerificationError::AlreadyConsumed);
}

#[tokio::test]
async fn restart_between_register_and_verify_resumes_at_code_entry() {
    let env = Env::new(FakeProfileService::default()).await;
    let session_id = {
        let mut flow = filled_flow(&env, "device-1");
        flow.submit().await.unwrap()
    };

    // New process, same device.
    let mut flow = env.flow("device-1");
    assert_eq!(flow.resume().await.unwrap(), Some(session_id));
    assert_eq!(
        flow.stage(),
        &FlowStage::AwaitingCode {
            session_id,
            email: OWNER_EMAIL.to_string(),
            role: Role::Gym,
        }
    );
    assert_eq!(flow.wizard().draft().business_name, "Iron Temple");
    assert!(flow.wizard().draft().password.expose_secret().is_empty());

    flow.verify(&env.code()).await.unwrap();
    let outcome = flow.provision().await.unwrap();
    assert_eq!(outcome.state, PipelineCursor::Finalized);

    // The snapshot is gone once the gym is finalized.
    assert_eq!(env.flow("device-1").resume().await.unwrap(), None);
}

#[tokio::test]
async fn restart_between_verify_and_provision_resumes_with_the_credential() {
    let env = Env::new(FakeProfileService::default()).await;
    let (session_id, token) = {
        let mut flow = filled_flow(&env, "device-1");
        let session_id = flow.submit().await.unwrap();
        let credential = flow.verify(&env.code()).await.unwrap();
        (session_id, credential.bearer().to_string())
    };

    // New process, same device: the code is spent, the credential is not.
    let mut flow = env.flow("device-1");
    assert_eq!(flow.resume().await.unwrap(), Some(session_id));
    assert_eq!(flow.stage(), &FlowStage::Verified);
    assert_eq!(flow.credential().unwrap().bearer(), token);
    assert_eq!(flow.wizard().draft().business_name, "Iron Temple");

    let outcome = flow.provision().await.unwrap();
    assert_eq!(outcome.state, PipelineCursor::Finalized);
    assert_eq!(env.profiles.count(PipelineStep::CreateProfile), 1);
    assert_eq!(env.flow("device-1").resume().await.unwrap(), None);
}

#[tokio::test]
async fn failed_provisioning_keeps_the_snapshot_for_a_later_process() {
    let env = Env::new(FakeProfileService::failing(PipelineStep::AttachDocuments)).await;
    let session_id = {
        let mut flow = filled_flow(&env, "device-1");
        flow.submit().await.unwrap();
        flow.verify(&env.code()).await.unwrap();
        assert!(flow.provision().await.is_err());
        flow.credential().unwrap().session_id
    };

    env.profiles.fail_on(None);
    let mut flow = env.flow("device-1");
    assert_eq!(flow.resume().await.unwrap(), Some(session_id));
    let outcome = flow.provision().await.unwrap();
    assert_eq!(outcome.state, PipelineCursor::Finalized);
    assert_eq!(env.profiles.count(PipelineStep::CreateProfile), 1);
}

#[tokio::test]
async fn concurrent_submits_share_one_session() {
    timeout(TEST_TIMEOUT, async {
        let env = Env::new(FakeProfileService::default()).await;
        let request = || {
            RegistrationRequest::new(
                OWNER_EMAIL,
                "correct-horse",
                "9876543210",
                "Ravi Kumar",
                Role::Gym,
            )
        };

        let (first, second) = tokio::join!(
            env.state.provisioner.begin_registration(request()),
            env.state.provisioner.begin_registration(request()),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first, second);

        let pending = env
            .db
            .find_pending_registration(OWNER_EMAIL, Role::Gym, chrono::Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.id, first);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn pipeline_resumes_from_server_held_inputs() {
    let env = Env::new(FakeProfileService::failing(PipelineStep::AttachMedia)).await;
    let credential = env.credential().await;
    env.state
        .pipeline
        .run(&credential, &full_draft())
        .await
        .unwrap_err();

    env.profiles.fail_on(None);
    let outcome = env.state.pipeline.resume(&credential).await.unwrap();
    assert_eq!(outcome.state, PipelineCursor::Finalized);
    assert_eq!(env.profiles.count(PipelineStep::CreateProfile), 1);
    assert_eq!(env.profiles.last_profile().unwrap().facilities.len(), 2);
}

#[tokio::test]
async fn rapid_duplicate_submits_share_one_session() {
    let env = Env::new(FakeProfileService::default()).await;
    let mut flow = filled_flow(&env, "device-1");

    let first = flow.submit().await.unwrap();
    let first_code = env.code();
    let second = flow.submit().await.unwrap();
    let second_code = env.code();
    assert_eq!(first, second);

    if first_code != second_code {
        let err = env
            .state
            .gate
            .verify(first, OWNER_EMAIL, Role::Gym, &first_code)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::CodeMismatch { .. }));
    }
    flow.verify(&second_code).await.unwrap();
}

#[tokio::test]
async fn exhausted_attempts_send_the_flow_back_to_editing() {
    let env = Env::new(FakeProfileService::default()).await;
    let mut flow = filled_flow(&env, "device-1");
    flow.submit().await.unwrap();
    let bad = wrong(&env.code());

    for remaining in (1..5).rev() {
        match flow.verify(&bad).await {
            Err(Error::Verification(VerificationError::CodeMismatch { attempts_remaining })) => {
                assert_eq!(attempts_remaining, remaining)
            }
            other => panic!("expected mismatch, got {:?}", other.map(|c| c.session_id)),
        }
    }
    assert!(matches!(
        flow.verify(&bad).await,
        Err(Error::Verification(VerificationError::TooManyAttempts))
    ));
    assert_eq!(flow.stage(), &FlowStage::Editing);
    assert_eq!(env.flow("device-1").resume().await.unwrap(), None);
}

#[tokio::test]
async fn create_failure_invokes_no_later_step() {
    let env = Env::new(FakeProfileService::failing(PipelineStep::CreateProfile)).await;
    let credential = env.credential().await;

    let err = env
        .state
        .pipeline
        .run(&credential, &full_draft())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Step {
            step: PipelineStep::CreateProfile,
            ..
        }
    ));
    assert_eq!(env.profiles.calls(), vec![PipelineStep::CreateProfile]);
}

#[tokio::test]
async fn media_failure_leaves_a_stuck_gym_and_retry_resumes() {
    let env = Env::new(FakeProfileService::failing(PipelineStep::AttachMedia)).await;
    let credential = env.credential().await;
    let draft = full_draft();

    env.state.pipeline.run(&credential, &draft).await.unwrap_err();

    let record = env
        .state
        .pipeline
        .status(credential.user.id, credential.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, PipelineCursor::Created);
    assert_eq!(record.failed_step, Some(PipelineStep::AttachMedia));
    assert!(env.state.review.list_unverified().await.unwrap().is_empty());

    let impatient = ReviewQueue::new(Arc::clone(&env.db), Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(impatient.list_stuck().await.unwrap().len(), 1);

    env.profiles.fail_on(None);
    let outcome = env.state.pipeline.run(&credential, &draft).await.unwrap();
    assert_eq!(outcome.state, PipelineCursor::Finalized);
    assert_eq!(outcome.gym_id, record.gym_id);
    assert_eq!(env.profiles.count(PipelineStep::CreateProfile), 1);
    assert!(impatient.list_stuck().await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_run_fails_fast() {
    timeout(TEST_TIMEOUT, async {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let env = Env::new(FakeProfileService::holding(
            Arc::clone(&entered),
            Arc::clone(&release),
        ))
        .await;

        let credential = env.credential().await;
        let second = env
            .state
            .gate
            .authenticate(credential.bearer())
            .await
            .unwrap()
            .unwrap();

        let pipeline = Arc::clone(&env.state.pipeline);
        let first_run = tokio::spawn(async move { pipeline.run(&credential, &full_draft()).await });

        entered.notified().await;
        let err = env
            .state
            .pipeline
            .run(&second, &full_draft())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning { .. }));

        release.notify_one();
        let outcome = first_run.await.unwrap().unwrap();
        assert_eq!(outcome.state, PipelineCursor::Finalized);
        assert_eq!(env.profiles.count(PipelineStep::CreateProfile), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn provisioning_before_verification_is_out_of_order() {
    let env = Env::new(FakeProfileService::default()).await;
    let mut flow = filled_flow(&env, "device-1");
    assert!(matches!(
        flow.provision().await,
        Err(Error::OutOfOrder { .. })
    ));
    assert!(matches!(
        flow.verify("123456").await,
        Err(Error::OutOfOrder { .. })
    ));
}
