//! OnboardingFlow — client-side driver for one registration attempt.
//!
//! ```text
//! Editing --submit--> AwaitingCode --verify--> Verified --provision--> Provisioned
//!    ^                     |
//!    +--session dead-------+
//! ```
//!
//! The recovery snapshot lives from submit until provisioning finalizes.
//! Before verification it holds the session id; afterwards it also holds the
//! credential, while the server keeps the provisioning inputs and cursor.

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result, VerificationError};
use crate::identity::{Credential, IdentityProvisioner, Role, VerificationGate};
use crate::pipeline::{ProvisioningOutcome, ProvisioningPipeline};
use crate::recovery::SessionRecoveryStore;
use crate::wizard::WizardStateManager;

/// Where the flow currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStage {
    Editing,
    AwaitingCode {
        session_id: Uuid,
        email: String,
        role: Role,
    },
    Verified,
    Provisioned(ProvisioningOutcome),
}

pub struct OnboardingFlow {
    wizard: WizardStateManager,
    provisioner: Arc<IdentityProvisioner>,
    gate: Arc<VerificationGate>,
    pipeline: Arc<ProvisioningPipeline>,
    recovery: SessionRecoveryStore,
    stage: FlowStage,
    credential: Option<Credential>,
}

impl OnboardingFlow {
    pub fn new(
        provisioner: Arc<IdentityProvisioner>,
        gate: Arc<VerificationGate>,
        pipeline: Arc<ProvisioningPipeline>,
        recovery: SessionRecoveryStore,
    ) -> Self {
        Self {
            wizard: WizardStateManager::new(),
            provisioner,
            gate,
            pipeline,
            recovery,
            stage: FlowStage::Editing,
            credential: None,
        }
    }

    pub fn wizard(&self) -> &WizardStateManager {
        &self.wizard
    }

    /// Mutable wizard access. Edits are only meaningful while editing.
    pub fn wizard_mut(&mut self) -> &mut WizardStateManager {
        &mut self.wizard
    }

    pub fn stage(&self) -> &FlowStage {
        &self.stage
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Pick up a snapshot left by an earlier process. Returns the session id
    /// when the flow was put back at code entry, or at provisioning when the
    /// snapshot carries a credential that still authenticates.
    pub async fn resume(&mut self) -> Result<Option<Uuid>> {
        let Some(snapshot) = self.recovery.restore().await? else {
            return Ok(None);
        };

        if let Some(token) = &snapshot.token {
            let credential = self
                .gate
                .authenticate(token.expose_secret())
                .await?
                .filter(|c| c.session_id == snapshot.session_id);
            let Some(credential) = credential else {
                warn!(session_id = %snapshot.session_id, "Stored credential no longer authenticates, dropping snapshot");
                self.recovery.clear().await?;
                return Ok(None);
            };
            info!(session_id = %snapshot.session_id, "Resuming verified registration at provisioning");
            self.wizard = WizardStateManager::from_draft(snapshot.draft);
            self.stage = FlowStage::Verified;
            self.credential = Some(credential);
            return Ok(Some(snapshot.session_id));
        }

        info!(session_id = %snapshot.session_id, "Resuming registration at code entry");
        self.wizard = WizardStateManager::from_draft(snapshot.draft);
        self.stage = FlowStage::AwaitingCode {
            session_id: snapshot.session_id,
            email: snapshot.email,
            role: snapshot.role,
        };
        self.credential = None;
        Ok(Some(snapshot.session_id))
    }

    /// Final submit: validate every gated step, stage the identity and save
    /// the recovery snapshot.
    pub async fn submit(&mut self) -> Result<Uuid> {
        if !matches!(self.stage, FlowStage::Editing | FlowStage::AwaitingCode { .. }) {
            return Err(Error::OutOfOrder { expected: "editing" });
        }
        let submission = self.wizard.submission()?;
        let role = submission.request.role;
        let session_id = self
            .provisioner
            .begin_registration(submission.request)
            .await?;

        let snapshot = self
            .recovery
            .persist(session_id, role, self.wizard.current_step(), &submission.draft)
            .await?;
        self.stage = FlowStage::AwaitingCode {
            session_id,
            email: snapshot.email,
            role,
        };
        Ok(session_id)
    }

    /// Exchange the code for a credential. A dead session (expired, consumed
    /// or out of attempts) sends the flow back to editing.
    pub async fn verify(&mut self, code: &str) -> Result<&Credential> {
        let (session_id, email, role) = match &self.stage {
            FlowStage::AwaitingCode {
                session_id,
                email,
                role,
            } => (*session_id, email.clone(), *role),
            _ => {
                return Err(Error::OutOfOrder {
                    expected: "awaiting a verification code",
                });
            }
        };

        match self.gate.verify(session_id, &email, role, code).await {
            Ok(credential) => {
                self.recovery.record_credential(&credential).await?;
                self.stage = FlowStage::Verified;
                Ok(&*self.credential.insert(credential))
            }
            Err(e @ VerificationError::CodeMismatch { .. }) | Err(e @ VerificationError::Unavailable(_)) => {
                Err(e.into())
            }
            Err(e) => {
                info!(session_id = %session_id, error = %e, "Registration session unusable, back to editing");
                self.recovery.clear().await?;
                self.stage = FlowStage::Editing;
                Err(e.into())
            }
        }
    }

    /// Run (or resume) provisioning under the credential from `verify`. The
    /// snapshot is dropped once the gym is finalized.
    pub async fn provision(&mut self) -> Result<ProvisioningOutcome> {
        if !matches!(self.stage, FlowStage::Verified | FlowStage::Provisioned(_)) {
            return Err(Error::OutOfOrder { expected: "verified" });
        }
        let Some(credential) = self.credential.as_ref() else {
            return Err(Error::OutOfOrder { expected: "verified" });
        };
        let outcome = self.pipeline.run(credential, self.wizard.draft()).await?;
        if outcome.state.is_terminal() {
            self.recovery.clear().await?;
        }
        self.stage = FlowStage::Provisioned(outcome.clone());
        Ok(outcome)
    }
}
