use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::extract::AuthUser;
use crate::api::response::ApiResult;
use crate::api::AppState;
use crate::error::PhishError;
use crate::models::RiskLevel;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/scan", post(scan))
}

async fn stats(State(state): State<AppState>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let account = state.accounts.profile(&user.0).await?;
    // Administrators see the whole corpus
    let stats = state.db.email_stats(user.owner().map(str::to_string)).await?;
    let high_risk = [RiskLevel::High, RiskLevel::Critical]
        .iter()
        .filter_map(|level| stats.by_risk.get(level.as_str()))
        .sum::<u64>();

    Ok(Json(json!({
        "success": true,
        "name": account.username,
        "email": account.email,
        "emailsScanned": stats.total,
        "threatsDetected": stats.flagged,
        "highRisk": high_risk,
        "gmailConnected": account.gmail_connected.unwrap_or(false),
        "lastSync": account.last_email_sync,
        "stats": stats,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct ScanRequest {
    #[serde(default)]
    content: String,
}

/// Score pasted message text (optionally with headers) without storing it
async fn scan(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(request): Json<ScanRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.content.trim().is_empty() {
        return Err(PhishError::BadRequest("Email content is required".to_string()).into());
    }

    let report = state.analyzer.analyze_message(&request.content).await;
    let is_threat = report.analysis.flagged;
    Ok(Json(json!({
        "success": true,
        "isThreat": is_threat,
        "message": if is_threat { "Potential threat detected" } else { "No threats detected" },
        "report": report,
    })))
}
