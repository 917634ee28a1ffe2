use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::accounts::{Session, SignupRequest};
use crate::api::extract::AuthUser;
use crate::api::response::{clear_session_cookie, session_cookie, ApiResult};
use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/check", get(check))
}

/// Accepts the identifier under any of the names older clients send
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    email_or_username: Option<String>,
    email: Option<String>,
    username: Option<String>,
    #[serde(default)]
    password: String,
}

impl LoginRequest {
    fn login(&self) -> &str {
        self.email_or_username
            .as_deref()
            .or(self.email.as_deref())
            .or(self.username.as_deref())
            .unwrap_or_default()
    }
}

fn session_response(state: &AppState, status: StatusCode, message: &str, session: Session) -> impl IntoResponse {
    let cookie = session_cookie(
        &state.config.auth.cookie_name,
        &session.token,
        state.accounts.keys().ttl().to_std().unwrap_or_default(),
        state.config.server.is_production(),
    );
    (
        status,
        cookie,
        Json(json!({
            "success": true,
            "message": message,
            "token": session.token,
            "user": session.account,
        })),
    )
}

async fn signup(
    State(state): State<AppState>,
    Json(request): Json<SignupRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = state.accounts.signup(request).await?;
    Ok(session_response(&state, StatusCode::CREATED, "Account created", session))
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = state.accounts.login(request.login(), &request.password).await?;
    Ok(session_response(&state, StatusCode::OK, "Login successful", session))
}

async fn logout(State(state): State<AppState>) -> impl IntoResponse {
    (
        clear_session_cookie(&state.config.auth.cookie_name, state.config.server.is_production()),
        Json(json!({ "success": true, "message": "Logged out" })),
    )
}

async fn check(State(state): State<AppState>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let account = state.accounts.profile(&user.0).await?;
    Ok(Json(json!({ "success": true, "authenticated": true, "user": account })))
}
