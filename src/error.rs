//! Error types for partner onboarding.

use std::time::Duration;

use crate::pipeline::cursor::PipelineStep;
use crate::wizard::draft::DraftField;

/// Top-level error type for the onboarding workflow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Onboarding flow is not {expected}")]
    OutOfOrder { expected: &'static str },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A wizard step refused to validate.
///
/// Always carries the exact set of fields that blocked it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Step {step} is incomplete, missing: {}", format_fields(.missing))]
pub struct ValidationError {
    pub step: u8,
    pub missing: Vec<DraftField>,
}

fn format_fields(fields: &[DraftField]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while staging a pending identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("An account already exists for {email} as {role}")]
    DuplicateAccount { email: String, role: String },

    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("A registration for {email} as {role} is already pending under different credentials")]
    RegistrationPending { email: String, role: String },

    #[error("Registering as {role} is not permitted for this address")]
    RoleNotAllowed { role: String },

    #[error("Identity service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Errors raised by the verification gate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("Registration session not found")]
    SessionNotFound,

    #[error("Registration session expired")]
    SessionExpired,

    #[error("Registration session already consumed")]
    AlreadyConsumed,

    #[error("Verification code does not match ({attempts_remaining} attempts remaining)")]
    CodeMismatch { attempts_remaining: u32 },

    #[error("Too many verification attempts, session closed")]
    TooManyAttempts,

    #[error("Verification store unavailable: {0}")]
    Unavailable(String),
}

/// Failures of a call to an external collaborator service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("{operation} network failure: {reason}")]
    Network { operation: String, reason: String },

    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{operation} was rejected: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("{operation} returned an invalid response: {reason}")]
    InvalidResponse { operation: String, reason: String },
}

impl ServiceError {
    /// Whether a single automatic retry is allowed for this failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Rejected { .. } | Self::InvalidResponse { .. } => false,
        }
    }
}

/// Provisioning pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Provisioning step {step} failed: {source}")]
    Step {
        step: PipelineStep,
        #[source]
        source: ServiceError,
    },

    #[error("A provisioning run is already in progress for {key}")]
    AlreadyRunning { key: String },

    #[error("Credential does not own registration session {session_id}")]
    CredentialMismatch { session_id: String },

    #[error("Draft is not ready for provisioning: {0}")]
    Incomplete(#[from] ValidationError),

    #[error("Pipeline store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias for the onboarding workflow.
pub type Result<T> = std::result::Result<T, Error>;
