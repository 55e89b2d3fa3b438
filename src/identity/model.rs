//! Identity data models — roles, registration sessions, accounts, credentials.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role an identity registers as. Uniqueness is per (email, role).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Gym,
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gym => "gym",
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gym" => Ok(Self::Gym),
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Lifecycle of a registration session.
///
/// `Pending → Consumed` on a correct code, `Pending → Expired` on timeout or
/// attempt exhaustion. Both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Consumed,
    Expired,
}

impl SessionState {
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!((self, target), (Pending, Consumed) | (Pending, Expired))
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Consumed => "consumed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "consumed" => Ok(Self::Consumed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

/// Input to [`IdentityProvisioner::begin_registration`](super::IdentityProvisioner::begin_registration).
#[derive(Debug)]
pub struct RegistrationRequest {
    pub email: String,
    pub password: SecretString,
    pub phone: String,
    pub display_name: String,
    pub role: Role,
}

impl RegistrationRequest {
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        phone: impl Into<String>,
        display_name: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            email: email.into(),
            password: SecretString::from(password.into()),
            phone: phone.into(),
            display_name: display_name.into(),
            role,
        }
    }

    pub(crate) fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

/// A server-held, single-use registration session.
///
/// Carries the staged identity until verification turns it into an account.
#[derive(Debug, Clone)]
pub struct RegistrationSession {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub display_name: String,
    pub phone: String,
    /// Argon2 PHC string of the staged password.
    pub password_hash: String,
    /// SHA-256 of the current one-time code.
    pub code_hash: String,
    pub state: SessionState,
    pub failed_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl RegistrationSession {
    /// State as seen at `now`: a pending session past its expiry is expired
    /// even before the store has recorded it.
    pub fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        if self.state == SessionState::Pending && now >= self.expires_at {
            SessionState::Expired
        } else {
            self.state
        }
    }
}

/// Result of staging a registration.
#[derive(Debug, Clone)]
pub struct StagedRegistration {
    pub session: RegistrationSession,
    /// `true` when an existing pending session was reused.
    pub reused: bool,
}

/// A verified account identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Authenticated identity minted by the verification gate.
///
/// Threaded explicitly through every provisioning call.
#[derive(Debug)]
pub struct Credential {
    pub token: SecretString,
    pub user: UserRecord,
    /// The registration session this credential was minted from.
    pub session_id: Uuid,
}

impl Credential {
    pub fn bearer(&self) -> &str {
        self.token.expose_secret()
    }
}

/// Server-side credential row. Only the token hash is kept.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub token_hash: String,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub issued_at: DateTime<Utc>,
}
