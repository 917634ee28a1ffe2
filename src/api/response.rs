//! JSON error envelope and session cookie helpers

use axum::http::header::{HeaderValue, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::PhishError;

/// Whether 5xx responses carry the underlying error text
static EXPOSE_ERROR_DETAIL: AtomicBool = AtomicBool::new(true);

pub fn expose_error_detail(enabled: bool) {
    EXPOSE_ERROR_DETAIL.store(enabled, Ordering::Relaxed);
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Handler error rendered as `{success: false, message}`
#[derive(Debug)]
pub struct ApiError(pub PhishError);

impl From<PhishError> for ApiError {
    fn from(err: PhishError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PhishError::BadRequest(_) | PhishError::InvalidMessageFormat(_) => StatusCode::BAD_REQUEST,
            PhishError::NotConnected => StatusCode::BAD_REQUEST,
            PhishError::AuthError(_) | PhishError::ReconnectRequired => StatusCode::UNAUTHORIZED,
            PhishError::Forbidden(_) => StatusCode::FORBIDDEN,
            PhishError::NotFound(_) => StatusCode::NOT_FOUND,
            PhishError::Conflict(_) => StatusCode::CONFLICT,
            PhishError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            PhishError::ServerError { status: 503, .. } | PhishError::CircuitBreakerOpen { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PhishError::ApiError(_) | PhishError::NetworkError(_) | PhishError::ServerError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            PhishError::ConfigError(_)
            | PhishError::StorageError(_)
            | PhishError::IoError(_)
            | PhishError::SerializationError(_)
            | PhishError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match &self.0 {
            PhishError::BadRequest(m)
            | PhishError::AuthError(m)
            | PhishError::Forbidden(m)
            | PhishError::Conflict(m) => m.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({ "success": false });

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "Request failed");
        }
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            body["message"] = json!("Internal server error");
            if EXPOSE_ERROR_DETAIL.load(Ordering::Relaxed) {
                body["error"] = json!(self.0.to_string());
            }
        } else {
            body["message"] = json!(self.message());
        }
        if matches!(self.0, PhishError::ReconnectRequired) {
            body["reconnectRequired"] = json!(true);
        }

        let mut response = (status, Json(body)).into_response();
        if let PhishError::RateLimitExceeded { retry_after } = self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

/// `Set-Cookie` header carrying the session token
pub fn session_cookie(name: &str, token: &str, max_age: Duration, secure: bool) -> HeaderMap {
    cookie_header(format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}{}",
        name,
        token,
        max_age.as_secs(),
        if secure { "; Secure" } else { "" }
    ))
}

/// `Set-Cookie` header that expires the session cookie
pub fn clear_session_cookie(name: &str, secure: bool) -> HeaderMap {
    cookie_header(format!(
        "{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0{}",
        name,
        if secure { "; Secure" } else { "" }
    ))
}

fn cookie_header(value: String) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(SET_COOKIE, value);
    }
    headers
}

/// Value of one cookie from the request's `Cookie` headers
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}
