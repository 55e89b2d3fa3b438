//! SessionRecoveryStore — client-side snapshot that lets an interrupted
//! registration resume after a restart: at code entry before verification,
//! or with its credential once verified and until provisioning finalizes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::{Credential, Role};
use crate::store::Database;
use crate::wizard::{RegistrationDraft, WizardStep};

/// Settings key the snapshot is stored under.
pub const RECOVERY_KEY: &str = "registration_recovery";

/// What the client needs to get back to code entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySnapshot {
    pub session_id: Uuid,
    pub email: String,
    pub role: Role,
    pub step: WizardStep,
    /// Draft without the password.
    pub draft: RegistrationDraft,
    /// Bearer minted by verification; absent while awaiting the code.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_token"
    )]
    pub token: Option<SecretString>,
    pub saved_at: DateTime<Utc>,
}

fn serialize_token<S: Serializer>(token: &Option<SecretString>, s: S) -> Result<S::Ok, S::Error> {
    token.as_ref().map(|t| t.expose_secret()).serialize(s)
}

/// Snapshot persistence for one client id.
pub struct SessionRecoveryStore {
    db: Arc<dyn Database>,
    client_id: String,
}

impl SessionRecoveryStore {
    pub fn new(db: Arc<dyn Database>, client_id: impl Into<String>) -> Self {
        Self {
            db,
            client_id: client_id.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Save the snapshot, replacing any earlier one.
    pub async fn persist(
        &self,
        session_id: Uuid,
        role: Role,
        step: WizardStep,
        draft: &RegistrationDraft,
    ) -> Result<RecoverySnapshot, DatabaseError> {
        let snapshot = RecoverySnapshot {
            session_id,
            email: draft.email.trim().to_lowercase(),
            role,
            step,
            draft: draft.snapshot(),
            token: None,
            saved_at: Utc::now(),
        };
        self.save(&snapshot).await?;
        Ok(snapshot)
    }

    /// Attach the verified credential to the current snapshot so a restart
    /// before provisioning finishes can pick it back up. Without a snapshot
    /// there is nothing to attach to and this is a no-op.
    pub async fn record_credential(&self, credential: &Credential) -> Result<(), DatabaseError> {
        let Some(mut snapshot) = self.restore().await? else {
            return Ok(());
        };
        snapshot.session_id = credential.session_id;
        snapshot.token = Some(SecretString::from(credential.bearer().to_string()));
        snapshot.saved_at = Utc::now();
        self.save(&snapshot).await
    }

    async fn save(&self, snapshot: &RecoverySnapshot) -> Result<(), DatabaseError> {
        let value = serde_json::to_value(snapshot)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.db.set_setting(&self.client_id, RECOVERY_KEY, &value).await?;
        debug!(
            client_id = %self.client_id,
            session_id = %snapshot.session_id,
            verified = snapshot.token.is_some(),
            "Recovery snapshot saved"
        );
        Ok(())
    }

    /// Load the snapshot. An unreadable snapshot is dropped and reported as
    /// absent.
    pub async fn restore(&self) -> Result<Option<RecoverySnapshot>, DatabaseError> {
        let Some(value) = self.db.get_setting(&self.client_id, RECOVERY_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<RecoverySnapshot>(value) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "Discarding unreadable recovery snapshot");
                self.clear().await?;
                Ok(None)
            }
        }
    }

    pub async fn clear(&self) -> Result<(), DatabaseError> {
        if self.db.delete_setting(&self.client_id, RECOVERY_KEY).await? {
            debug!(client_id = %self.client_id, "Recovery snapshot cleared");
        }
        Ok(())
    }
}
