//! HTTP API: shared state, router and server loop

pub mod extract;
pub mod response;
pub mod routes;

use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use google_gmail1::yup_oauth2::ApplicationSecret;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::accounts::{Accounts, JwtKeys};
use crate::analysis::EmailAnalyzer;
use crate::attachments::AttachmentAnalyzer;
use crate::classifier::ContentClassifier;
use crate::client::{GmailConnector, MailboxConnector};
use crate::config::Config;
use crate::error::{PhishError, Result};
use crate::intel::{HttpThreatIntel, ThreatIntel};
use crate::ip::IpAnalyzer;
use crate::oauth::{
    load_application_secret, GoogleTokenEndpoint, TokenEndpoint, TokenManager, UnconfiguredEndpoint,
};
use crate::sandbox::Sandbox;
use crate::store::Database;
use crate::sync::MailboxSync;

/// External collaborators, swapped for fakes in tests
pub struct Services {
    pub intel: Arc<dyn ThreatIntel>,
    pub token_endpoint: Arc<dyn TokenEndpoint>,
    pub connector: Arc<dyn MailboxConnector>,
    /// `None` when no Google OAuth client is configured
    pub oauth_secret: Option<ApplicationSecret>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub accounts: Accounts,
    pub tokens: TokenManager,
    pub oauth_secret: Option<Arc<ApplicationSecret>>,
    pub sync: Arc<MailboxSync>,
    pub analyzer: EmailAnalyzer,
    pub ip: IpAnalyzer,
    pub attachments: AttachmentAnalyzer,
    pub sandbox: Sandbox,
}

impl AppState {
    /// Wire the services together and start the sandbox worker.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn new(config: Config, db: Database, services: Services) -> Self {
        let scoring = config.scoring.clone();
        let tokens = TokenManager::new(db.clone(), services.token_endpoint, &config.gmail);
        let analyzer = EmailAnalyzer::new(
            db.clone(),
            services.intel.clone(),
            scoring.clone(),
            config.intel.max_concurrent_lookups,
            config.analysis.batch_size,
        );
        let (sandbox, _worker) = Sandbox::spawn(
            db.clone(),
            analyzer.url_analyzer().clone(),
            config.analysis.sandbox_queue,
            Duration::from_secs(config.analysis.sandbox_timeout_secs),
        );
        let attachments = AttachmentAnalyzer::new(
            services.intel.clone(),
            Arc::new(ContentClassifier::new(scoring.content.clone())),
            scoring.content.risky_attachment,
        );
        let sync = MailboxSync::new(
            db.clone(),
            tokens.clone(),
            services.connector,
            scoring,
            config.gmail.max_results,
        );

        Self {
            accounts: Accounts::new(db.clone(), JwtKeys::new(&config.auth)),
            tokens,
            oauth_secret: services.oauth_secret.map(Arc::new),
            sync: Arc::new(sync),
            analyzer,
            ip: IpAnalyzer::new(services.intel),
            attachments,
            sandbox,
            db,
            config: Arc::new(config),
        }
    }

    /// Production wiring: SQLite file, live intel providers and Google OAuth
    pub async fn from_config(config: Config) -> Result<Self> {
        let db = Database::open(&config.database.path)?;

        let (oauth_secret, token_endpoint): (_, Arc<dyn TokenEndpoint>) =
            match load_application_secret(&config.gmail).await {
                Ok(secret) => {
                    let endpoint =
                        GoogleTokenEndpoint::new(secret.clone(), config.gmail.redirect_uri.clone())?;
                    (Some(secret), Arc::new(endpoint))
                }
                Err(e) => {
                    warn!("Gmail integration disabled: {}", e);
                    (None, Arc::new(UnconfiguredEndpoint))
                }
            };

        let intel = HttpThreatIntel::new(config.intel.clone(), config.circuit_breaker.clone())?;

        Ok(Self::new(
            config,
            db,
            Services {
                intel: Arc::new(intel),
                token_endpoint,
                connector: Arc::new(GmailConnector),
                oauth_secret,
            },
        ))
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "phishguard",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "message": "Route not found" })),
    )
}

pub fn router(state: AppState) -> Router {
    response::expose_error_detail(!state.config.server.is_production());
    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/health", get(health))
        .nest("/api/auth", routes::auth::router())
        .nest("/api/user", routes::user::router())
        .nest("/api/dashboard", routes::dashboard::router())
        .nest("/api/gmail", routes::gmail::router())
        .nest("/api/analysis", routes::analysis::router())
        .nest("/api/sandbox", routes::sandbox::router())
        .nest("/api/ip", routes::ip::router())
        .nest("/api/attachments", routes::attachments::router())
        .nest("/api/admin", routes::admin::router())
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Bind and serve until Ctrl-C
pub async fn serve(state: AppState, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let local = listener.local_addr()?;
    info!(address = %local, environment = %state.config.server.environment, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| PhishError::Unknown(format!("server error: {}", e)))?;

    info!("HTTP server stopped");
    Ok(())
}
