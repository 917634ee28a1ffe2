//! Gmail OAuth2 web flow and access-token refresh.
//!
//! Users grant read-only Gmail access through Google's consent page; the
//! callback exchanges the code for tokens which are stored on the user row.
//! Before each Gmail call [`TokenManager::ensure_fresh`] refreshes the access
//! token once it is within the refresh buffer of expiry.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use google_gmail1::yup_oauth2::{self, ApplicationSecret};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::GmailConfig;
use crate::error::{PhishError, Result};
use crate::models::{GmailStatus, GmailTokens, User};
use crate::store::Database;

/// Read-only access is all the scorer needs
pub const GMAIL_SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.readonly"];

/// Assumed lifetime when the token endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// OAuth client credentials from the config or a Google `credentials.json`
pub async fn load_application_secret(config: &GmailConfig) -> Result<ApplicationSecret> {
    if let Some(path) = &config.credentials_file {
        let mut secret = yup_oauth2::read_application_secret(path)
            .await
            .map_err(|e| PhishError::ConfigError(format!("Failed to read credentials: {}", e)))?;
        if secret.redirect_uris.is_empty() {
            secret.redirect_uris.push(config.redirect_uri.clone());
        }
        return Ok(secret);
    }

    if config.client_id.is_empty() || config.client_secret.is_empty() {
        return Err(PhishError::ConfigError(
            "Gmail client_id and client_secret are not configured".to_string(),
        ));
    }

    Ok(ApplicationSecret {
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone(),
        auth_uri: config.auth_uri.clone(),
        token_uri: config.token_uri.clone(),
        redirect_uris: vec![config.redirect_uri.clone()],
        ..Default::default()
    })
}

/// Consent-page URL; `state` carries the user id back to the callback
pub fn authorization_url(secret: &ApplicationSecret, redirect_uri: &str, state: &str) -> Result<String> {
    let scope = GMAIL_SCOPES.join(" ");
    let url = url::Url::parse_with_params(
        &secret.auth_uri,
        &[
            ("client_id", secret.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("include_granted_scopes", "true"),
            ("state", state),
        ],
    )
    .map_err(|e| PhishError::ConfigError(format!("Invalid auth_uri: {}", e)))?;
    Ok(url.into())
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Convert to stored tokens, keeping `previous_refresh` when none was returned
    pub fn into_tokens(self, previous_refresh: Option<String>) -> GmailTokens {
        let lifetime = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        GmailTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: Utc::now() + Duration::seconds(lifetime),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Google's token endpoint, abstracted for tests
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse>;

    /// `invalid_grant` must surface as [`PhishError::ReconnectRequired`]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

pub struct GoogleTokenEndpoint {
    http: reqwest::Client,
    secret: ApplicationSecret,
    redirect_uri: String,
}

impl GoogleTokenEndpoint {
    pub fn new(secret: ApplicationSecret, redirect_uri: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| PhishError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            secret,
            redirect_uri: redirect_uri.into(),
        })
    }

    pub fn secret(&self) -> &ApplicationSecret {
        &self.secret
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    async fn post(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self.http.post(&self.secret.token_uri).form(form).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<TokenErrorBody>(&body) {
            Ok(err) if err.error == "invalid_grant" => {
                debug!(description = ?err.error_description, "Refresh token rejected");
                Err(PhishError::ReconnectRequired)
            }
            Ok(err) if code < 500 && code != 429 => Err(PhishError::AuthError(format!(
                "{}: {}",
                err.error,
                err.error_description.unwrap_or_default()
            ))),
            _ if code == 429 => Err(PhishError::RateLimitExceeded { retry_after: 5 }),
            _ if code >= 500 => Err(PhishError::ServerError {
                status: code,
                message: body,
            }),
            _ => Err(PhishError::AuthError(format!("token endpoint returned HTTP {}", code))),
        }
    }
}

#[async_trait]
impl TokenEndpoint for GoogleTokenEndpoint {
    async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        self.post(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &self.secret.client_id),
            ("client_secret", &self.secret.client_secret),
            ("redirect_uri", &self.redirect_uri),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.post(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.secret.client_id),
            ("client_secret", &self.secret.client_secret),
        ])
        .await
    }
}

/// Used when no OAuth client is configured; every call fails with a config error
pub struct UnconfiguredEndpoint;

#[async_trait]
impl TokenEndpoint for UnconfiguredEndpoint {
    async fn exchange_code(&self, _code: &str) -> Result<TokenResponse> {
        Err(PhishError::ConfigError("Gmail OAuth client is not configured".to_string()))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
        Err(PhishError::ConfigError("Gmail OAuth client is not configured".to_string()))
    }
}

/// Keeps stored Gmail access tokens valid
#[derive(Clone)]
pub struct TokenManager {
    db: Database,
    endpoint: Arc<dyn TokenEndpoint>,
    buffer: Duration,
    max_retries: u32,
    backoff: std::time::Duration,
}

impl TokenManager {
    pub fn new(db: Database, endpoint: Arc<dyn TokenEndpoint>, config: &GmailConfig) -> Self {
        Self {
            db,
            endpoint,
            buffer: Duration::seconds(config.refresh_buffer_secs),
            max_retries: config.refresh_max_retries.max(1),
            backoff: std::time::Duration::from_millis(config.refresh_backoff_ms),
        }
    }

    /// Finish the consent flow for `user_id`
    pub async fn connect(&self, user_id: &str, code: &str) -> Result<GmailTokens> {
        let response = self.endpoint.exchange_code(code).await?;
        let tokens = response.into_tokens(None);
        if tokens.refresh_token.is_none() {
            warn!(user_id, "Google returned no refresh token; access will lapse in an hour");
        }
        self.db.save_gmail_tokens(user_id, tokens.clone()).await?;
        info!(user_id, "Gmail connected");
        Ok(tokens)
    }

    pub async fn disconnect(&self, user_id: &str) -> Result<()> {
        self.db
            .clear_gmail_tokens(user_id, GmailStatus::Disconnected)
            .await?;
        info!(user_id, "Gmail disconnected");
        Ok(())
    }

    /// A usable access token for `user`, refreshing it when close to expiry
    pub async fn ensure_fresh(&self, user: &User) -> Result<String> {
        let tokens = user.gmail_tokens.as_ref().ok_or(PhishError::NotConnected)?;

        if tokens.expires_at - Utc::now() > self.buffer {
            return Ok(tokens.access_token.clone());
        }

        let Some(refresh_token) = tokens.refresh_token.clone() else {
            warn!(user_id = %user.id, "Access token expired and no refresh token stored");
            self.db
                .clear_gmail_tokens(&user.id, GmailStatus::Disconnected)
                .await?;
            return Err(PhishError::ReconnectRequired);
        };

        debug!(user_id = %user.id, "Refreshing Gmail access token");
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.endpoint.refresh(&refresh_token).await {
                Ok(response) => {
                    let refreshed = response.into_tokens(Some(refresh_token));
                    self.db.save_gmail_tokens(&user.id, refreshed.clone()).await?;
                    info!(user_id = %user.id, attempt, "Gmail access token refreshed");
                    return Ok(refreshed.access_token);
                }
                Err(PhishError::ReconnectRequired) => {
                    warn!(user_id = %user.id, "Gmail grant revoked; clearing stored tokens");
                    self.db
                        .clear_gmail_tokens(&user.id, GmailStatus::Disconnected)
                        .await?;
                    return Err(PhishError::ReconnectRequired);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff * attempt;
                    warn!(
                        user_id = %user.id,
                        attempt,
                        "Token refresh failed: {}. Retrying in {:?}",
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(user_id = %user.id, attempt, "Token refresh failed: {}", e);
                    self.db.set_gmail_status(&user.id, GmailStatus::Failed).await?;
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Plays back a fixed sequence of refresh outcomes
    struct ScriptedEndpoint {
        outcomes: Mutex<Vec<Result<TokenResponse>>>,
        calls: AtomicU32,
    }

    impl ScriptedEndpoint {
        fn new(mut outcomes: Vec<Result<TokenResponse>>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TokenEndpoint for ScriptedEndpoint {
        async fn exchange_code(&self, _code: &str) -> Result<TokenResponse> {
            Ok(token("exchanged", Some("fresh-refresh")))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(PhishError::NetworkError("script exhausted".to_string())))
        }
    }

    fn token(access: &str, refresh: Option<&str>) -> TokenResponse {
        TokenResponse {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_in: Some(3600),
        }
    }

    fn config() -> GmailConfig {
        GmailConfig {
            refresh_backoff_ms: 1,
            ..GmailConfig::default()
        }
    }

    async fn user_with_tokens(db: &Database, expires_in: Duration, refresh: Option<&str>) -> User {
        let user = User {
            id: "u1".to_string(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "x".to_string(),
            role: Role::User,
            gmail_connected: false,
            gmail_status: GmailStatus::Disconnected,
            gmail_tokens: None,
            last_email_sync: None,
            created_at: Utc::now(),
        };
        db.create_user(user).await.unwrap();
        db.save_gmail_tokens(
            "u1",
            GmailTokens {
                access_token: "old-access".to_string(),
                refresh_token: refresh.map(str::to_string),
                expires_at: Utc::now() + expires_in,
            },
        )
        .await
        .unwrap();
        db.find_user("u1").await.unwrap().unwrap()
    }

    #[test]
    fn test_authorization_url_parameters() {
        let secret = ApplicationSecret {
            client_id: "cid".to_string(),
            auth_uri: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            ..Default::default()
        };
        let url = authorization_url(&secret, "http://localhost:5000/api/gmail/callback", "user-42").unwrap();
        let parsed = url::Url::parse(&url).unwrap();
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["prompt"], "consent");
        assert_eq!(params["include_granted_scopes"], "true");
        assert_eq!(params["state"], "user-42");
        assert_eq!(params["scope"], GMAIL_SCOPES[0]);
    }

    #[test]
    fn test_missing_refresh_token_keeps_previous() {
        let tokens = token("a", None).into_tokens(Some("keep-me".to_string()));
        assert_eq!(tokens.refresh_token.as_deref(), Some("keep-me"));
        let tokens = token("a", Some("new")).into_tokens(Some("keep-me".to_string()));
        assert_eq!(tokens.refresh_token.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_valid_token_is_not_refreshed() {
        let db = Database::open_in_memory().unwrap();
        let user = user_with_tokens(&db, Duration::hours(1), Some("rt")).await;
        let endpoint = ScriptedEndpoint::new(vec![]);
        let manager = TokenManager::new(db, endpoint.clone(), &config());

        assert_eq!(manager.ensure_fresh(&user).await.unwrap(), "old-access");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_token_inside_buffer_is_refreshed() {
        let db = Database::open_in_memory().unwrap();
        let user = user_with_tokens(&db, Duration::minutes(2), Some("rt")).await;
        let endpoint = ScriptedEndpoint::new(vec![Ok(token("new-access", None))]);
        let manager = TokenManager::new(db.clone(), endpoint, &config());

        assert_eq!(manager.ensure_fresh(&user).await.unwrap(), "new-access");
        let stored = db.find_user("u1").await.unwrap().unwrap().gmail_tokens.unwrap();
        assert_eq!(stored.access_token, "new-access");
        assert_eq!(stored.refresh_token.as_deref(), Some("rt"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let db = Database::open_in_memory().unwrap();
        let user = user_with_tokens(&db, Duration::seconds(-10), Some("rt")).await;
        let endpoint = ScriptedEndpoint::new(vec![
            Err(PhishError::NetworkError("reset".to_string())),
            Err(PhishError::ServerError {
                status: 503,
                message: "busy".to_string(),
            }),
            Ok(token("third-time", None)),
        ]);
        let manager = TokenManager::new(db, endpoint.clone(), &config());

        assert_eq!(manager.ensure_fresh(&user).await.unwrap(), "third-time");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failed() {
        let db = Database::open_in_memory().unwrap();
        let user = user_with_tokens(&db, Duration::seconds(-10), Some("rt")).await;
        let endpoint = ScriptedEndpoint::new(vec![]);
        let manager = TokenManager::new(db.clone(), endpoint.clone(), &config());

        assert!(manager.ensure_fresh(&user).await.is_err());
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);
        let stored = db.find_user("u1").await.unwrap().unwrap();
        assert_eq!(stored.gmail_status, GmailStatus::Failed);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let db = Database::open_in_memory().unwrap();
        let user = user_with_tokens(&db, Duration::seconds(-10), Some("rt")).await;
        let endpoint = ScriptedEndpoint::new(vec![
            Err(PhishError::AuthError("invalid_client: Unauthorized".to_string())),
            Ok(token("never-reached", None)),
        ]);
        let manager = TokenManager::new(db.clone(), endpoint.clone(), &config());

        assert!(matches!(
            manager.ensure_fresh(&user).await,
            Err(PhishError::AuthError(_))
        ));
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        let stored = db.find_user("u1").await.unwrap().unwrap();
        assert_eq!(stored.gmail_status, GmailStatus::Failed);
        assert_eq!(stored.gmail_tokens.unwrap().refresh_token.as_deref(), Some("rt"));
    }

    #[tokio::test]
    async fn test_unconfigured_client_fails_once() {
        let db = Database::open_in_memory().unwrap();
        let user = user_with_tokens(&db, Duration::seconds(-10), Some("rt")).await;
        let endpoint = ScriptedEndpoint::new(vec![Err(PhishError::ConfigError(
            "Gmail OAuth client is not configured".to_string(),
        ))]);
        let manager = TokenManager::new(db, endpoint.clone(), &config());

        assert!(matches!(
            manager.ensure_fresh(&user).await,
            Err(PhishError::ConfigError(_))
        ));
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_grant_clears_tokens() {
        let db = Database::open_in_memory().unwrap();
        let user = user_with_tokens(&db, Duration::seconds(-10), Some("rt")).await;
        let endpoint = ScriptedEndpoint::new(vec![Err(PhishError::ReconnectRequired)]);
        let manager = TokenManager::new(db.clone(), endpoint.clone(), &config());

        let err = manager.ensure_fresh(&user).await.unwrap_err();
        assert_eq!(err.to_string(), "Gmail connection expired, reconnect required");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);

        let stored = db.find_user("u1").await.unwrap().unwrap();
        assert!(!stored.gmail_connected);
        assert!(stored.gmail_tokens.is_none());
        assert_eq!(stored.gmail_status, GmailStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let db = Database::open_in_memory().unwrap();
        let manager = TokenManager::new(db, ScriptedEndpoint::new(vec![]), &config());
        let user = User {
            id: "nobody".to_string(),
            username: "n".to_string(),
            email: "n@example.com".to_string(),
            password_hash: String::new(),
            role: Role::User,
            gmail_connected: false,
            gmail_status: GmailStatus::Disconnected,
            gmail_tokens: None,
            last_email_sync: None,
            created_at: Utc::now(),
        };
        assert!(matches!(
            manager.ensure_fresh(&user).await,
            Err(PhishError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_stores_tokens() {
        let db = Database::open_in_memory().unwrap();
        user_with_tokens(&db, Duration::hours(1), None).await;
        db.clear_gmail_tokens("u1", GmailStatus::Pending).await.unwrap();

        let manager = TokenManager::new(db.clone(), ScriptedEndpoint::new(vec![]), &config());
        manager.connect("u1", "auth-code").await.unwrap();

        let stored = db.find_user("u1").await.unwrap().unwrap();
        assert!(stored.gmail_connected);
        assert_eq!(stored.gmail_tokens.unwrap().access_token, "exchanged");
    }
}
