use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::api::extract::AuthUser;
use crate::api::response::ApiResult;
use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/details/:target", get(details))
}

/// `target` is an IPv4 address, hostname or URL
async fn details(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(target): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let report = state.ip.details(&target).await?;
    Ok(Json(json!({ "success": true, "data": report })))
}
