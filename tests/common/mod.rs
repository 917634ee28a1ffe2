//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mockall::mock;
use phishguard::api::{self, AppState, Services};
use phishguard::client::{FetchedMessage, MailboxClient, MailboxConnector};
use phishguard::config::Config;
use phishguard::error::Result;
use phishguard::headers::HeaderField;
use phishguard::intel::OfflineIntel;
use phishguard::models::{AttachmentInfo, GmailStatus, GmailTokens, Role, User};
use phishguard::oauth::{TokenEndpoint, TokenResponse};
use phishguard::store::Database;
use std::sync::{Arc, Mutex};

// Mock implementation of MailboxClient for testing
mock! {
    pub Mailbox {}

    #[async_trait::async_trait]
    impl MailboxClient for Mailbox {
        async fn list_message_ids(&self, max_results: u32) -> Result<Vec<String>>;
        async fn get_message(&self, id: &str) -> Result<FetchedMessage>;
    }
}

/// Hands out one prepared mailbox and records the access token it was given
pub struct FakeConnector {
    mailbox: Arc<dyn MailboxClient>,
    pub tokens_seen: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(mailbox: impl MailboxClient + 'static) -> Arc<Self> {
        Arc::new(Self {
            mailbox: Arc::new(mailbox),
            tokens_seen: Mutex::new(Vec::new()),
        })
    }

    /// A mailbox that must never be contacted
    pub fn unused() -> Arc<Self> {
        Self::new(MockMailbox::new())
    }
}

impl MailboxConnector for FakeConnector {
    fn connect(&self, access_token: String) -> Result<Arc<dyn MailboxClient>> {
        self.tokens_seen.lock().unwrap().push(access_token);
        Ok(Arc::clone(&self.mailbox))
    }
}

/// Token endpoint answering every call with the same fresh token
pub struct StaticTokenEndpoint;

#[async_trait]
impl TokenEndpoint for StaticTokenEndpoint {
    async fn exchange_code(&self, _code: &str) -> Result<TokenResponse> {
        Ok(TokenResponse {
            access_token: "exchanged-access".to_string(),
            refresh_token: Some("exchanged-refresh".to_string()),
            expires_in: Some(3600),
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
        Ok(TokenResponse {
            access_token: "refreshed-access".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.jwt_secret = "integration-test-secret".to_string();
    config.gmail.frontend_url = "http://frontend.test".to_string();
    config
}

/// Application state over an in-memory database and offline intel
pub fn test_state(db: Database, connector: Arc<dyn MailboxConnector>) -> AppState {
    AppState::new(
        test_config(),
        db,
        Services {
            intel: Arc::new(OfflineIntel),
            token_endpoint: Arc::new(StaticTokenEndpoint),
            connector,
            oauth_secret: None,
        },
    )
}

pub fn test_app(db: Database) -> axum::Router {
    api::router(test_state(db, FakeConnector::unused()))
}

/// Stored user with a Gmail grant that is still valid for an hour
pub async fn connected_user(db: &Database, id: &str) -> User {
    let user = db
        .create_user(User {
            id: id.to_string(),
            username: format!("user-{}", id),
            email: format!("{}@example.com", id),
            password_hash: String::new(),
            role: Role::User,
            gmail_connected: false,
            gmail_status: GmailStatus::Disconnected,
            gmail_tokens: None,
            last_email_sync: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    db.save_gmail_tokens(
        &user.id,
        GmailTokens {
            access_token: format!("access-{}", id),
            refresh_token: Some(format!("refresh-{}", id)),
            expires_at: Utc::now() + Duration::hours(1),
        },
    )
    .await
    .unwrap();

    db.find_user(&user.id).await.unwrap().unwrap()
}

/// Create a fetched message with default values
pub fn fetched_message(id: &str, from: &str, subject: &str, body: &str) -> FetchedMessage {
    FetchedMessage {
        id: id.to_string(),
        headers: vec![
            HeaderField {
                name: "From".to_string(),
                value: from.to_string(),
            },
            HeaderField {
                name: "Subject".to_string(),
                value: subject.to_string(),
            },
        ],
        from: from.to_string(),
        to: "me@example.com".to_string(),
        subject: subject.to_string(),
        date: Some(Utc::now()),
        body: body.to_string(),
        attachments: Vec::new(),
    }
}

/// A message that trips most content heuristics
pub fn phishing_message(id: &str) -> FetchedMessage {
    let mut message = fetched_message(
        id,
        "Security Team <noreply@secure-bank-login.com>",
        "URGENT: verify your account",
        "Your account has been suspended. Confirm your bank password immediately at https://bit.ly/verify-now",
    );
    message.attachments.push(AttachmentInfo {
        name: "invoice.exe".to_string(),
        content_type: "application/octet-stream".to_string(),
        size: 2048,
    });
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetched_message_defaults() {
        let message = fetched_message("m1", "a@example.com", "Hello", "Body");
        assert_eq!(message.id, "m1");
        assert_eq!(message.headers.len(), 2);
        assert!(message.attachments.is_empty());
    }

    #[test]
    fn test_phishing_message_has_risky_attachment() {
        let message = phishing_message("m2");
        assert_eq!(message.attachments[0].name, "invoice.exe");
    }
}
