//! IdentityProvisioner — stages a pending identity and a single-use
//! verification session.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::IdentityError;
use crate::store::Database;

use super::model::{
    RegistrationRequest, RegistrationSession, Role, SessionState, StagedRegistration,
};
use super::notify::CodeNotifier;
use super::secrets;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
        .expect("email pattern compiles")
});

const MIN_PASSWORD_LEN: usize = 8;
const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;

/// Identity fields after validation and normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NormalizedIdentity {
    email: String,
    phone: String,
    display_name: String,
}

fn invalid(field: &str, reason: impl Into<String>) -> IdentityError {
    IdentityError::InvalidInput {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn normalize_email(raw: &str) -> Result<String, IdentityError> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err(invalid("email", "must not be empty"));
    }
    if !EMAIL_PATTERN.is_match(&email) {
        return Err(invalid("email", "is not a valid address"));
    }
    Ok(email)
}

/// Accepts an optional leading `+`; spaces and dashes are dropped.
fn normalize_phone(raw: &str) -> Result<String, IdentityError> {
    let trimmed = raw.trim();
    let (plus, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => ("+", rest),
        None => ("", trimmed),
    };
    let digits: String = rest.chars().filter(|c| !matches!(c, ' ' | '-')).collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid("phone", "must contain only digits"));
    }
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return Err(invalid(
            "phone",
            format!("must have {MIN_PHONE_DIGITS} to {MAX_PHONE_DIGITS} digits"),
        ));
    }
    Ok(format!("{plus}{digits}"))
}

fn validate(request: &RegistrationRequest) -> Result<NormalizedIdentity, IdentityError> {
    let display_name = request.display_name.trim();
    if display_name.is_empty() {
        return Err(invalid("name", "must not be empty"));
    }
    let email = normalize_email(&request.email)?;
    let phone = normalize_phone(&request.phone)?;
    if request.password().chars().count() < MIN_PASSWORD_LEN {
        return Err(invalid(
            "password",
            format!("must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    Ok(NormalizedIdentity {
        email,
        phone,
        display_name: display_name.to_string(),
    })
}

/// Creates pending identities. Never produces a usable credential.
pub struct IdentityProvisioner {
    db: Arc<dyn Database>,
    notifier: Arc<dyn CodeNotifier>,
    otp_ttl: TimeDelta,
    admin_emails: Vec<String>,
}

impl IdentityProvisioner {
    pub fn new(db: Arc<dyn Database>, notifier: Arc<dyn CodeNotifier>, otp_ttl: Duration) -> Self {
        Self {
            db,
            notifier,
            otp_ttl: TimeDelta::from_std(otp_ttl).unwrap_or(TimeDelta::minutes(10)),
            admin_emails: Vec::new(),
        }
    }

    /// Addresses allowed to register as [`Role::Admin`]. Empty by default,
    /// which closes admin registration entirely.
    pub fn with_admin_emails(mut self, emails: &[String]) -> Self {
        self.admin_emails = emails.iter().map(|e| e.trim().to_lowercase()).collect();
        self
    }

    /// Stage a registration and hand a fresh code to the notifier.
    ///
    /// A second call for an (email, role) with a live pending session reuses
    /// that session (same id, new code, re-armed expiry) when it carries the
    /// staged password; otherwise it fails with `RegistrationPending`.
    pub async fn begin_registration(
        &self,
        request: RegistrationRequest,
    ) -> Result<Uuid, IdentityError> {
        let staged = self.stage(request).await?;
        Ok(staged.session.id)
    }

    /// Like [`begin_registration`](Self::begin_registration), but also
    /// reports whether an existing session was reused.
    pub async fn stage(
        &self,
        request: RegistrationRequest,
    ) -> Result<StagedRegistration, IdentityError> {
        let identity = validate(&request)?;
        let role = request.role;

        if role == Role::Admin && !self.admin_emails.contains(&identity.email) {
            warn!(role = %role, "Refused self-registration for a restricted role");
            return Err(IdentityError::RoleNotAllowed {
                role: role.to_string(),
            });
        }

        let exists = self
            .db
            .account_exists(&identity.email, role)
            .await
            .map_err(|e| IdentityError::ServiceUnavailable(e.to_string()))?;
        if exists {
            return Err(IdentityError::DuplicateAccount {
                email: identity.email,
                role: role.to_string(),
            });
        }

        let now = Utc::now();
        let code = secrets::generate_code();
        let code_hash = secrets::hash_code(&secrets::code_scope(&identity.email, role), &code);

        // A concurrent caller may stage the session between our lookup and
        // our insert; the second round then reuses it like any other.
        let mut staged = None;
        for _ in 0..2 {
            let pending = self
                .db
                .find_pending_registration(&identity.email, role, now)
                .await
                .map_err(|e| IdentityError::ServiceUnavailable(e.to_string()))?;
            let password_hash = self.password_hash_for(request.password(), pending).await?;

            let candidate = RegistrationSession {
                id: Uuid::new_v4(),
                code_hash: code_hash.clone(),
                email: identity.email.clone(),
                role,
                display_name: identity.display_name.clone(),
                phone: identity.phone.clone(),
                password_hash,
                state: SessionState::Pending,
                failed_attempts: 0,
                created_at: now,
                expires_at: now + self.otp_ttl,
                consumed_at: None,
            };
            staged = self
                .db
                .stage_registration(&candidate, now)
                .await
                .map_err(|e| IdentityError::ServiceUnavailable(e.to_string()))?;
            if staged.is_some() {
                break;
            }
        }
        let Some(staged) = staged else {
            info!(role = %role, "Pending registration held under other credentials");
            return Err(IdentityError::RegistrationPending {
                email: identity.email,
                role: role.to_string(),
            });
        };

        info!(
            session_id = %staged.session.id,
            role = %role,
            reused = staged.reused,
            expires_at = %staged.session.expires_at,
            "Registration session staged"
        );

        if let Err(e) = self.notifier.send_code(&staged.session.email, &code).await {
            warn!(session_id = %staged.session.id, error = %e, "Failed to hand off verification code");
            return Err(IdentityError::ServiceUnavailable(e.to_string()));
        }

        Ok(staged)
    }

    /// Hash for the candidate session. Reusing a pending session keeps its
    /// staged hash, and only a caller holding that password may reuse it.
    async fn password_hash_for(
        &self,
        password: &str,
        pending: Option<RegistrationSession>,
    ) -> Result<String, IdentityError> {
        let password = password.to_string();
        match pending {
            Some(session) => {
                let staged_hash = session.password_hash.clone();
                let matches = tokio::task::spawn_blocking(move || {
                    secrets::verify_password(&password, &staged_hash)
                })
                .await
                .map_err(|e| IdentityError::ServiceUnavailable(format!("password check: {e}")))?;
                if !matches {
                    info!(session_id = %session.id, role = %session.role, "Pending registration held under other credentials");
                    return Err(IdentityError::RegistrationPending {
                        email: session.email,
                        role: session.role.to_string(),
                    });
                }
                Ok(session.password_hash)
            }
            None => tokio::task::spawn_blocking(move || secrets::hash_password(&password))
                .await
                .map_err(|e| IdentityError::ServiceUnavailable(format!("password hashing: {e}")))?
                .map_err(|e| IdentityError::ServiceUnavailable(format!("password hashing: {e}"))),
        }
    }
}
