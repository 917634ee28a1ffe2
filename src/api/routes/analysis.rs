use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};

use crate::api::extract::AuthUser;
use crate::api::response::ApiResult;
use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/analyze/:email_id", get(analyze))
        .route("/analyze-all", post(analyze_all))
        .route("/results/:email_id", get(results))
}

async fn analyze(
    State(state): State<AppState>,
    user: AuthUser,
    Path(email_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let analysis = state.analyzer.analyze_email(&email_id, user.owner()).await?;
    Ok(Json(json!({ "success": true, "analysis": analysis })))
}

/// Runs in the background; the caller polls the per-email results
async fn analyze_all(State(state): State<AppState>, user: AuthUser) -> impl IntoResponse {
    let analyzer = state.analyzer.clone();
    let user_id = user.id().to_string();
    info!(%user_id, "Starting batch analysis");

    tokio::spawn(async move {
        if let Err(e) = analyzer.analyze_all(&user_id).await {
            error!(%user_id, error = %e, "Batch analysis aborted");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "message": "Analysis started" })),
    )
}

async fn results(
    State(state): State<AppState>,
    user: AuthUser,
    Path(email_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let analysis = state.analyzer.analysis_results(&email_id, user.owner()).await?;
    Ok(Json(json!({ "success": true, "analysis": analysis })))
}
