//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::PipelineStep;

/// Onboarding service configuration.
#[derive(Debug, Clone)]
pub struct OnboardingConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Port the HTTP surface listens on.
    pub port: u16,
    /// Base URL of the business-profile service (`/gym/...` endpoints).
    pub profile_service_url: String,
    /// Notification service endpoint for one-time codes. `None` logs instead.
    pub notify_url: Option<String>,
    /// Lifetime of a registration session before it expires.
    pub otp_ttl: Duration,
    /// Wrong codes allowed before a session is closed.
    pub max_verify_attempts: u32,
    /// Upper bound on each remote call.
    pub request_timeout: Duration,
    /// Delay before the single retry of a transient failure.
    pub retry_backoff: Duration,
    /// How long a pipeline run holds its session-scoped lease.
    pub lease_ttl: Duration,
    /// Non-finalized records older than this are reported as stuck.
    pub stuck_grace: Duration,
    /// Addresses allowed to register as admin reviewers.
    pub admin_emails: Vec<String>,
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/onboarding.db"),
            port: 8080,
            profile_service_url: "http://localhost:5000/api".to_string(),
            notify_url: None,
            otp_ttl: Duration::from_secs(600), // 10 minutes
            max_verify_attempts: 5,
            request_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(500),
            lease_ttl: Duration::from_secs(120),
            stuck_grace: Duration::from_secs(900), // 15 minutes
            admin_emails: Vec::new(),
        }
    }
}

impl OnboardingConfig {
    /// Build the configuration from environment variables.
    ///
    /// `PROFILE_SERVICE_URL` is required; everything else falls back to
    /// [`OnboardingConfig::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let profile_service_url = std::env::var("PROFILE_SERVICE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("PROFILE_SERVICE_URL".to_string()))?;

        let db_path = std::env::var("ONBOARDING_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let notify_url = std::env::var("NOTIFY_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let admin_emails = std::env::var("ADMIN_EMAILS")
            .map(|raw| {
                raw.split(',')
                    .map(|e| e.trim().to_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            db_path,
            port: env_parse("ONBOARDING_PORT", defaults.port)?,
            profile_service_url: profile_service_url.trim_end_matches('/').to_string(),
            notify_url,
            otp_ttl: Duration::from_secs(env_parse("OTP_TTL_SECS", defaults.otp_ttl.as_secs())?),
            max_verify_attempts: env_parse("OTP_MAX_ATTEMPTS", defaults.max_verify_attempts)?,
            request_timeout: Duration::from_secs(env_parse(
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            retry_backoff: Duration::from_millis(env_parse(
                "REQUEST_RETRY_BACKOFF_MS",
                defaults.retry_backoff.as_millis() as u64,
            )?),
            lease_ttl: Duration::from_secs(env_parse(
                "PIPELINE_LEASE_SECS",
                defaults.lease_ttl.as_secs(),
            )?),
            stuck_grace: Duration::from_secs(env_parse(
                "STUCK_GRACE_SECS",
                defaults.stuck_grace.as_secs(),
            )?),
            admin_emails,
        }
        .validated()
    }

    /// Longest a single pipeline run can take: every step timing out twice
    /// with the retry backoff in between.
    pub fn worst_case_run(&self) -> Duration {
        let per_step = self.request_timeout * 2 + self.retry_backoff;
        per_step * PipelineStep::ALL.len() as u32
    }

    /// Cross-field checks. The pipeline lease is never renewed, so it must
    /// outlive the slowest possible run.
    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.lease_ttl <= self.worst_case_run() {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_LEASE_SECS".to_string(),
                message: format!(
                    "lease of {:?} does not outlive a worst-case run of {:?}",
                    self.lease_ttl,
                    self.worst_case_run()
                ),
            });
        }
        if self.max_verify_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OTP_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(self)
    }
}

/// Parse an optional environment variable, keeping `default` when unset.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
