use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use url::form_urlencoded;

use crate::api::extract::AuthUser;
use crate::api::response::ApiResult;
use crate::api::AppState;
use crate::error::PhishError;
use crate::oauth::authorization_url;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth-url", get(auth_url))
        .route("/callback", get(callback))
        .route("/status", get(status))
        .route("/fetch-emails", get(fetch_emails))
        .route("/disconnect", post(disconnect))
}

fn not_configured() -> PhishError {
    PhishError::ServerError {
        status: 503,
        message: "Gmail integration is not configured".to_string(),
    }
}

async fn auth_url(State(state): State<AppState>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let secret = state.oauth_secret.as_ref().ok_or_else(not_configured)?;
    let url = authorization_url(secret, &state.config.gmail.redirect_uri, user.id())?;
    Ok(Json(json!({ "success": true, "url": url })))
}

#[derive(Debug, Default, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Where the browser lands after the consent page
fn dashboard_redirect(frontend_url: &str, query: &str) -> Redirect {
    Redirect::to(&format!(
        "{}/dashboard?{}",
        frontend_url.trim_end_matches('/'),
        query
    ))
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

async fn callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> Redirect {
    let frontend = state.config.gmail.frontend_url.as_str();

    if let Some(error) = query.error {
        warn!(%error, "Google consent was not granted");
        return dashboard_redirect(frontend, &format!("error={}", encode(&error)));
    }
    let Some(code) = query.code.filter(|c| !c.is_empty()) else {
        return dashboard_redirect(frontend, "error=missing_code");
    };
    let Some(user_id) = query.state.filter(|s| !s.is_empty()) else {
        return dashboard_redirect(frontend, "error=missing_state");
    };

    match state.db.find_user(&user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return dashboard_redirect(frontend, "error=invalid_user"),
        Err(e) => {
            warn!(%user_id, error = %e, "User lookup failed during Gmail callback");
            return dashboard_redirect(
                frontend,
                &format!("error=auth_error&message={}", encode(&e.to_string())),
            );
        }
    }

    match state.tokens.connect(&user_id, &code).await {
        Ok(_) => dashboard_redirect(frontend, "connected=true"),
        Err(e) => {
            warn!(%user_id, error = %e, "Gmail code exchange failed");
            dashboard_redirect(
                frontend,
                &format!("error=auth_error&message={}", encode(&e.to_string())),
            )
        }
    }
}

async fn status(State(state): State<AppState>, user: AuthUser) -> ApiResult<impl IntoResponse> {
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
        "configured": state.oauth_secret.is_some(),
    })))
}

async fn fetch_emails(State(state): State<AppState>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let report = state.sync.fetch_for_user(user.id()).await?;
    info!(
        user_id = user.id(),
        stored = report.emails.len(),
        skipped = report.skipped,
        failed = report.failed,
        "Mailbox fetch finished"
    );

    Ok(Json(json!({
        "success": true,
        "message": format!("{} emails processed", report.emails.len()),
        "skipped": report.skipped,
        "failed": report.failed,
        "emails": report.emails,
    })))
}

async fn disconnect(State(state): State<AppState>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    state.tokens.disconnect(user.id()).await?;
    Ok(Json(json!({ "success": true, "message": "Gmail disconnected" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::LOCATION;

    #[test]
    fn test_dashboard_redirect_target() {
        let response = dashboard_redirect("http://localhost:3000/", "connected=true").into_response();
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "http://localhost:3000/dashboard?connected=true"
        );
    }

    #[test]
    fn test_error_message_is_query_encoded() {
        assert_eq!(encode("bad code & more"), "bad+code+%26+more");
    }
}
