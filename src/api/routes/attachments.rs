use axum::extract::{DefaultBodyLimit, State};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use crate::api::extract::AuthUser;
use crate::api::response::ApiResult;
use crate::api::AppState;
use crate::attachments::AttachmentUpload;

/// Base64 inflates by a third; this admits roughly 18 MB of file data
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/analyze", post(analyze))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

async fn analyze(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(upload): Json<AttachmentUpload>,
) -> ApiResult<impl IntoResponse> {
    let report = state.attachments.analyze(upload).await?;
    Ok(Json(json!({ "success": true, "analysis": report })))
}
