//! VerificationGate — exchanges a one-time code for a durable credential.
//!
//! State machine over a registration session:
//!
//! ```text
//! Pending --code matches-------------> Consumed   (credential minted once)
//! Pending --code mismatches----------> Pending    (attempt recorded)
//! Pending --last allowed mismatch----> Expired    (TooManyAttempts)
//! Pending --expiry elapses-----------> Expired
//! Consumed / Expired --verify(any)---> error
//! ```

use std::sync::Arc;

use chrono::Utc;
use secrecy::SecretString;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, VerificationError};
use crate::store::Database;

use super::model::{Credential, CredentialRecord, RegistrationSession, Role, SessionState, UserRecord};
use super::secrets;

fn unavailable(e: DatabaseError) -> VerificationError {
    VerificationError::Unavailable(e.to_string())
}

pub struct VerificationGate {
    db: Arc<dyn Database>,
    max_attempts: u32,
}

impl VerificationGate {
    pub fn new(db: Arc<dyn Database>, max_attempts: u32) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Verify `code` against a pending session and mint a credential.
    ///
    /// The session's email and role must match; a mismatch is reported as
    /// `SessionNotFound` so session ids cannot be discovered across identities.
    pub async fn verify(
        &self,
        session_id: Uuid,
        email: &str,
        role: Role,
        code: &str,
    ) -> Result<Credential, VerificationError> {
        let session = self
            .db
            .get_registration_session(session_id)
            .await
            .map_err(unavailable)?
            .ok_or(VerificationError::SessionNotFound)?;

        if session.email != email.trim().to_lowercase() || session.role != role {
            return Err(VerificationError::SessionNotFound);
        }

        let now = Utc::now();
        match session.state_at(now) {
            SessionState::Consumed => return Err(VerificationError::AlreadyConsumed),
            SessionState::Expired => {
                if session.state == SessionState::Pending
                    && self
                        .db
                        .expire_registration_session(session.id)
                        .await
                        .map_err(unavailable)?
                {
                    info!(session_id = %session.id, "Registration session expired");
                }
                return Err(VerificationError::SessionExpired);
            }
            SessionState::Pending => {}
        }

        let scope = secrets::code_scope(&session.email, session.role);
        if secrets::hash_code(&scope, code) != session.code_hash {
            return Err(self.reject(&session).await?);
        }

        let user = UserRecord {
            id: Uuid::new_v4(),
            name: session.display_name.clone(),
            email: session.email.clone(),
            phone: session.phone.clone(),
            role: session.role,
            created_at: now,
        };
        let token = secrets::mint_token();
        let record = CredentialRecord {
            token_hash: secrets::hash_token(&token),
            user_id: user.id,
            session_id: session.id,
            issued_at: now,
        };

        let completed = self
            .db
            .complete_registration(session.id, now, &user, &session.password_hash, &record)
            .await
            .map_err(|e| {
                warn!(session_id = %session.id, error = %e, "Registration not completed, session left pending");
                unavailable(e)
            })?;
        if !completed {
            // Lost a race with another verify, or expired in between.
            return Err(self.terminal_error(session.id).await?);
        }

        info!(session_id = %session.id, user_id = %user.id, role = %user.role, "Registration verified, credential issued");

        Ok(Credential {
            token: SecretString::from(token),
            user,
            session_id: session.id,
        })
    }

    /// Resolve a bearer token to its credential. `None` for unknown tokens.
    pub async fn authenticate(&self, token: &str) -> Result<Option<Credential>, VerificationError> {
        let Some(record) = self
            .db
            .find_credential(&secrets::hash_token(token))
            .await
            .map_err(unavailable)?
        else {
            return Ok(None);
        };

        let Some(user) = self.db.get_account(record.user_id).await.map_err(unavailable)? else {
            return Ok(None);
        };

        Ok(Some(Credential {
            token: SecretString::from(token.to_string()),
            user,
            session_id: record.session_id,
        }))
    }

    /// Count a wrong code; the mismatch that exhausts the budget closes the
    /// session.
    async fn reject(&self, session: &RegistrationSession) -> Result<VerificationError, VerificationError> {
        let Some(failed) = self
            .db
            .record_failed_attempt(session.id)
            .await
            .map_err(unavailable)?
        else {
            return self.terminal_error(session.id).await;
        };

        if failed >= self.max_attempts {
            self.db
                .expire_registration_session(session.id)
                .await
                .map_err(unavailable)?;
            warn!(session_id = %session.id, attempts = failed, "Verification attempts exhausted, session closed");
            return Ok(VerificationError::TooManyAttempts);
        }

        let attempts_remaining = self.max_attempts - failed;
        info!(session_id = %session.id, attempts_remaining, "Verification code mismatch");
        Ok(VerificationError::CodeMismatch { attempts_remaining })
    }

    /// Error for a session that left `Pending` under us.
    async fn terminal_error(&self, id: Uuid) -> Result<VerificationError, VerificationError> {
        let session = self.db.get_registration_session(id).await.map_err(unavailable)?;
        Ok(match session.map(|s| s.state) {
            Some(SessionState::Consumed) => VerificationError::AlreadyConsumed,
            Some(_) => VerificationError::SessionExpired,
            None => VerificationError::SessionNotFound,
        })
    }
}
