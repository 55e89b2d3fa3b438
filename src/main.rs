use std::sync::Arc;

use partner_onboarding::config::OnboardingConfig;
use partner_onboarding::http::RemoteClient;
use partner_onboarding::identity::{CodeNotifier, LogNotifier, WebhookNotifier};
use partner_onboarding::pipeline::{HttpProfileService, ProfileService};
use partner_onboarding::routes::{OnboardingRouteState, onboarding_routes};
use partner_onboarding::store::{Database, LibSqlBackend};
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OnboardingConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export PROFILE_SERVICE_URL=https://profiles.example.com/api");
        std::process::exit(1);
    });

    eprintln!("🏋️ Partner Onboarding v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Profile service: {}", config.profile_service_url);
    eprintln!("   API: http://0.0.0.0:{}/auth/register", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Collaborator services ───────────────────────────────────────────
    let http = RemoteClient::new(config.request_timeout, config.retry_backoff)?;

    let notifier: Arc<dyn CodeNotifier> = match &config.notify_url {
        Some(url) => {
            eprintln!("   Notifications: {url}");
            Arc::new(WebhookNotifier::new(http.clone(), url.clone()))
        }
        None => {
            eprintln!("   Notifications: disabled (codes written to the debug log)");
            Arc::new(LogNotifier)
        }
    };

    let profiles: Arc<dyn ProfileService> = Arc::new(HttpProfileService::new(
        http,
        &config.profile_service_url,
    )?);

    // ── HTTP surface ────────────────────────────────────────────────────
    let state = OnboardingRouteState::new(&config, db, notifier, profiles);
    // The registration wizard is served from a different origin.
    let app = onboarding_routes(state).layer(CorsLayer::permissive());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Onboarding API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
