use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::extract::AuthUser;
use crate::api::response::ApiResult;
use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/urls", post(submit_url).get(list))
        .route("/urls/:id", get(get_one))
        .route("/emails/:email_id", post(submit_email))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitUrl {
    #[serde(default)]
    url: String,
    email_id: Option<String>,
}

async fn submit_url(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<SubmitUrl>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .sandbox
        .submit_url(&request.url, user.id(), request.email_id)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "analysis": record })),
    ))
}

async fn submit_email(
    State(state): State<AppState>,
    user: AuthUser,
    Path(email_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let records = state
        .sandbox
        .submit_email(&email_id, user.owner(), user.id())
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": format!("{} URLs queued", records.len()),
            "analyses": records,
        })),
    ))
}

async fn get_one(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state.sandbox.get(&id, user.owner()).await?;
    Ok(Json(json!({ "success": true, "analysis": record })))
}

async fn list(State(state): State<AppState>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let records = state.sandbox.list(user.owner().map(str::to_string)).await?;
    Ok(Json(json!({ "success": true, "analyses": records })))
}
