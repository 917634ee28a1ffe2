use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::extract::AuthUser;
use crate::api::response::ApiResult;
use crate::api::AppState;
use crate::error::PhishError;
use crate::store::EmailFilter;

const DEFAULT_RECENT_EMAILS: u32 = 10;
const MAX_RECENT_EMAILS: u32 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/profile", get(profile))
        .route("/me", get(me))
        .route("/emails", get(emails))
        .route("/gmail-status", get(gmail_status))
        .route("/stats", get(stats))
}

async fn profile(State(state): State<AppState>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let account = state.accounts.profile(&user.0).await?;
    Ok(Json(json!({ "success": true, "user": account })))
}

/// Token identity only, no database round trip
async fn me(user: AuthUser) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "user": { "id": user.0.id, "role": user.0.role },
    }))
}

#[derive(Debug, Default, Deserialize)]
struct RecentQuery {
    limit: Option<u32>,
}

async fn emails(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<RecentQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_EMAILS)
        .clamp(1, MAX_RECENT_EMAILS);
    let page = state
        .db
        .list_emails(EmailFilter {
            user_id: Some(user.id().to_string()),
            limit,
            ..Default::default()
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "total": page.total,
        "emails": page.items,
    })))
}

async fn gmail_status(State(state): State<AppState>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let account = state
        .db
        .find_user(user.id())
        .await?
        .ok_or_else(|| PhishError::NotFound("User".to_string()))?;

    Ok(Json(json!({
        "success": true,
        "connected": account.gmail_connected,
        "status": account.gmail_status,
        "lastSync": account.last_email_sync,
    })))
}

async fn stats(State(state): State<AppState>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let stats = state.db.email_stats(Some(user.id().to_string())).await?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}
