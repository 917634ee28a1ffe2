use thiserror::Error;

/// Type alias for Result with PhishError
pub type Result<T> = std::result::Result<T, PhishError>;

/// Error types for the phishing analysis service
#[derive(Error, Debug)]
pub enum PhishError {
    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Account or OAuth authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Caller is authenticated but lacks the required role
    #[error("Access denied: {0}")]
    Forbidden(String),

    /// Stored Gmail grant was revoked or expired; the user must reconnect
    #[error("Gmail connection expired, reconnect required")]
    ReconnectRequired,

    /// Gmail is not connected for this account
    #[error("Gmail not connected")]
    NotConnected,

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Upstream server returned a 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Bad request or invalid input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Uniqueness violation (duplicate username, email, message id)
    #[error("{0}")]
    Conflict(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Database errors
    #[error("Storage error: {0}")]
    StorageError(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Circuit breaker is open (rejecting requests)
    #[error("Circuit breaker open: {message}. Will retry after {retry_after_secs} seconds")]
    CircuitBreakerOpen {
        message: String,
        retry_after_secs: u64,
    },

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl PhishError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PhishError::RateLimitExceeded { .. }
                | PhishError::ServerError { .. }
                | PhishError::NetworkError(_)
                | PhishError::CircuitBreakerOpen { .. }
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns the number of seconds to wait. If the header is missing or invalid,
/// returns a default of 5 seconds.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    if let Some(retry_after_value) = response.headers().get("retry-after") {
        if let Ok(retry_after_str) = retry_after_value.to_str() {
            if let Ok(seconds) = retry_after_str.parse::<u64>() {
                return seconds;
            }

            if let Ok(http_date) = httpdate::parse_http_date(retry_after_str) {
                let now = std::time::SystemTime::now();
                if let Ok(duration) = http_date.duration_since(now) {
                    return duration.as_secs();
                }
            }
        }
    }

    DEFAULT_RETRY_AFTER
}

impl From<google_gmail1::Error> for PhishError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    429 => {
                        let retry_after = parse_retry_after_header(response);
                        PhishError::RateLimitExceeded { retry_after }
                    }
                    401 => PhishError::AuthError(message),
                    404 => PhishError::NotFound("Gmail message".to_string()),
                    400 => PhishError::BadRequest(message),
                    403 => PhishError::Forbidden(message),
                    500..=599 => PhishError::ServerError {
                        status: status_code,
                        message,
                    },
                    _ => PhishError::ApiError(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => PhishError::BadRequest(format!("{}", err)),
            google_gmail1::Error::HttpError(ref err) => {
                PhishError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => PhishError::NetworkError(err.to_string()),
            _ => PhishError::ApiError(error.to_string()),
        }
    }
}

impl From<rusqlite::Error> for PhishError {
    fn from(error: rusqlite::Error) -> Self {
        match error {
            rusqlite::Error::QueryReturnedNoRows => PhishError::NotFound("Record".to_string()),
            rusqlite::Error::SqliteFailure(ref failure, ref message)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                PhishError::Conflict(
                    message
                        .clone()
                        .unwrap_or_else(|| "Record already exists".to_string()),
                )
            }
            other => PhishError::StorageError(other.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for PhishError {
    fn from(error: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match error.kind() {
            ErrorKind::ExpiredSignature => PhishError::AuthError("Token expired".to_string()),
            _ => PhishError::AuthError("Invalid token".to_string()),
        }
    }
}

impl From<reqwest::Error> for PhishError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            let code = status.as_u16();
            return match code {
                429 => PhishError::RateLimitExceeded { retry_after: 5 },
                500..=599 => PhishError::ServerError {
                    status: code,
                    message: error.to_string(),
                },
                _ => PhishError::ApiError(error.to_string()),
            };
        }
        PhishError::NetworkError(error.to_string())
    }
}
