//! REST endpoints for registration, verification, provisioning and the
//! admin review queue.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OnboardingConfig;
use crate::error::{DatabaseError, Error, IdentityError, PipelineError, VerificationError};
use crate::identity::{
    CodeNotifier, Credential, IdentityProvisioner, RegistrationRequest, Role, VerificationGate,
};
use crate::pipeline::{ProfileService, ProvisioningPipeline};
use crate::review::ReviewQueue;
use crate::store::Database;
use crate::wizard::RegistrationDraft;

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub provisioner: Arc<IdentityProvisioner>,
    pub gate: Arc<VerificationGate>,
    pub pipeline: Arc<ProvisioningPipeline>,
    pub review: Arc<ReviewQueue>,
}

impl OnboardingRouteState {
    /// Wire every component over one store.
    pub fn new(
        config: &OnboardingConfig,
        db: Arc<dyn Database>,
        notifier: Arc<dyn CodeNotifier>,
        profiles: Arc<dyn ProfileService>,
    ) -> Self {
        Self {
            provisioner: Arc::new(
                IdentityProvisioner::new(Arc::clone(&db), notifier, config.otp_ttl)
                    .with_admin_emails(&config.admin_emails),
            ),
            gate: Arc::new(VerificationGate::new(
                Arc::clone(&db),
                config.max_verify_attempts,
            )),
            pipeline: Arc::new(ProvisioningPipeline::new(
                Arc::clone(&db),
                profiles,
                config.lease_ttl,
            )),
            review: Arc::new(ReviewQueue::new(db, config.stuck_grace)),
        }
    }
}

/// Error response: `{ success: false, error, code }`.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden,
    Workflow(Error),
}

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self::Workflow(e.into())
    }
}

/// Status code and machine-readable code for a workflow error.
fn classify(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
        Error::Database(DatabaseError::NotFound { .. }) => (StatusCode::NOT_FOUND, "not_found"),
        Error::Database(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
        Error::Validation(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
        Error::Identity(e) => match e {
            IdentityError::DuplicateAccount { .. } => (StatusCode::CONFLICT, "duplicate_account"),
            IdentityError::RegistrationPending { .. } => {
                (StatusCode::CONFLICT, "registration_pending")
            }
            IdentityError::RoleNotAllowed { .. } => (StatusCode::FORBIDDEN, "role_not_allowed"),
            IdentityError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, "invalid_input"),
            IdentityError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
        },
        Error::Verification(e) => match e {
            VerificationError::SessionNotFound => (StatusCode::NOT_FOUND, "session_not_found"),
            VerificationError::SessionExpired => (StatusCode::GONE, "session_expired"),
            VerificationError::AlreadyConsumed => (StatusCode::CONFLICT, "already_consumed"),
            VerificationError::CodeMismatch { .. } => (StatusCode::BAD_REQUEST, "code_mismatch"),
            VerificationError::TooManyAttempts => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_attempts")
            }
            VerificationError::Unavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
        },
        Error::Pipeline(e) => match e {
            PipelineError::Step { .. } => (StatusCode::BAD_GATEWAY, "provisioning_step_failed"),
            PipelineError::AlreadyRunning { .. } => (StatusCode::CONFLICT, "already_running"),
            PipelineError::CredentialMismatch { .. } => {
                (StatusCode::FORBIDDEN, "credential_mismatch")
            }
            PipelineError::Incomplete(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
            PipelineError::Store(DatabaseError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            PipelineError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
        },
        Error::Service(_) => (StatusCode::BAD_GATEWAY, "upstream_failed"),
        Error::OutOfOrder { .. } => (StatusCode::CONFLICT, "out_of_order"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Missing or invalid bearer token".to_string(),
            ),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                "forbidden",
                "Admin role required".to_string(),
            ),
            Self::Workflow(err) => {
                let (status, code) = classify(err);
                (status, code, err.to_string())
            }
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), code, error = %message, "Request failed");
        }
        (
            status,
            Json(json!({"success": false, "error": message, "code": code})),
        )
            .into_response()
    }
}

/// Resolve the `Authorization: Bearer` header to a credential.
async fn authenticate(
    state: &OnboardingRouteState,
    headers: &HeaderMap,
) -> Result<Credential, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized)?;

    state
        .gate
        .authenticate(token)
        .await?
        .ok_or(ApiError::Unauthorized)
}

/// Like [`authenticate`], but only admin credentials pass.
async fn require_admin(
    state: &OnboardingRouteState,
    headers: &HeaderMap,
) -> Result<Credential, ApiError> {
    let credential = authenticate(state, headers).await?;
    if credential.user.role != Role::Admin {
        warn!(user_id = %credential.user.id, role = %credential.user.role, "Admin route refused");
        return Err(ApiError::Forbidden);
    }
    Ok(credential)
}

fn default_role() -> Role {
    Role::Gym
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    name: String,
    email: String,
    password: String,
    phone: String,
    #[serde(default = "default_role")]
    role: Role,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyBody {
    email: String,
    otp: String,
    registration_session_id: Uuid,
    #[serde(default = "default_role")]
    role: Role,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionBody {
    registration_session_id: Uuid,
    /// Omitted on retry: the inputs stored by the first run are used.
    #[serde(default)]
    draft: Option<RegistrationDraft>,
}

#[derive(Debug, Deserialize)]
struct ToggleVerifyBody {
    verified: bool,
}

/// POST /auth/register
async fn register(
    State(state): State<OnboardingRouteState>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request =
        RegistrationRequest::new(body.email, body.password, body.phone, body.name, body.role);
    let session_id = state.provisioner.begin_registration(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "registrationSessionId": session_id})),
    ))
}

/// POST /auth/verify-otp
async fn verify_otp(
    State(state): State<OnboardingRouteState>,
    Json(body): Json<VerifyBody>,
) -> Result<impl IntoResponse, ApiError> {
    let credential = state
        .gate
        .verify(body.registration_session_id, &body.email, body.role, &body.otp)
        .await?;
    Ok(Json(json!({
        "success": true,
        "token": credential.bearer(),
        "user": credential.user,
    })))
}

/// POST /onboarding/provision
async fn provision(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Json(body): Json<ProvisionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let credential = authenticate(&state, &headers).await?;
    ProvisioningPipeline::check_session(&credential, body.registration_session_id)?;
    let outcome = match &body.draft {
        Some(draft) => state.pipeline.run(&credential, draft).await?,
        None => state.pipeline.resume(&credential).await?,
    };
    Ok(Json(json!({
        "success": true,
        "state": outcome.state,
        "gymId": outcome.gym_id,
        "verified": outcome.verified,
    })))
}

/// GET /onboarding/provision/{session_id}
async fn provision_status(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let credential = authenticate(&state, &headers).await?;
    ProvisioningPipeline::check_session(&credential, session_id)?;
    let record = state
        .pipeline
        .status(credential.user.id, session_id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "provisioning record".into(),
            id: session_id.to_string(),
        })?;
    Ok(Json(json!({"success": true, "record": record})))
}

/// GET /admin/gyms/unverified
async fn list_unverified(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers).await?;
    let gyms = state.review.list_unverified().await?;
    Ok(Json(json!({"success": true, "gyms": gyms})))
}

/// GET /admin/gyms/stuck
async fn list_stuck(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers).await?;
    let gyms = state.review.list_stuck().await?;
    Ok(Json(json!({"success": true, "gyms": gyms})))
}

/// PUT /admin/gym/{id}/toggle-verify
async fn toggle_verify(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    Path(gym_id): Path<String>,
    Json(body): Json<ToggleVerifyBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers).await?;
    info!(admin_id = %admin.user.id, gym_id = %gym_id, verified = body.verified, "Gym verification toggled");
    let gym = state.review.set_verified(&gym_id, body.verified).await?;
    Ok(Json(json!({"success": true, "gym": gym})))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "partner-onboarding"
    }))
}

/// Build the onboarding REST routes.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(register))
        .route("/auth/verify-otp", post(verify_otp))
        .route("/onboarding/provision", post(provision))
        .route("/onboarding/provision/{session_id}", get(provision_status))
        .route("/admin/gyms/unverified", get(list_unverified))
        .route("/admin/gyms/stuck", get(list_stuck))
        .route("/admin/gym/{id}/toggle-verify", put(toggle_verify))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
