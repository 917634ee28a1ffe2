//! Google token endpoint and refresh policy against a mock OAuth server

mod common;

use chrono::{Duration, Utc};
use google_gmail1::yup_oauth2::ApplicationSecret;
use phishguard::error::PhishError;
use phishguard::models::{GmailStatus, GmailTokens};
use phishguard::oauth::{GoogleTokenEndpoint, TokenEndpoint, TokenManager};
use phishguard::store::Database;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint(server: &MockServer) -> GoogleTokenEndpoint {
    let secret = ApplicationSecret {
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        token_uri: format!("{}/token", server.uri()),
        auth_uri: format!("{}/auth", server.uri()),
        ..Default::default()
    };
    GoogleTokenEndpoint::new(secret, "http://localhost:5000/api/gmail/callback").unwrap()
}

/// A connected user whose access token has already expired
async fn expired_user(db: &Database) -> phishguard::models::User {
    common::connected_user(db, "u1").await;
    db.save_gmail_tokens(
        "u1",
        GmailTokens {
            access_token: "expired".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Utc::now() - Duration::minutes(5),
        },
    )
    .await
    .unwrap();
    db.find_user("u1").await.unwrap().unwrap()
}

fn manager(db: &Database, server: &MockServer) -> TokenManager {
    let mut config = common::test_config().gmail;
    config.refresh_max_retries = 3;
    config.refresh_backoff_ms = 1;
    TokenManager::new(db.clone(), Arc::new(endpoint(server)), &config)
}

#[tokio::test]
async fn test_exchange_code_posts_authorization_grant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=the-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-1",
            "refresh_token": "refresh-1",
            "expires_in": 3599,
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = endpoint(&server).exchange_code("the-code").await.unwrap();
    assert_eq!(response.access_token, "access-1");
    assert_eq!(response.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(response.expires_in, Some(3599));
}

#[tokio::test]
async fn test_refresh_keeps_previous_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-2",
            "expires_in": 3599
        })))
        .expect(1)
        .mount(&server)
        .await;

    let db = Database::open_in_memory().unwrap();
    let user = expired_user(&db).await;

    let access = manager(&db, &server).ensure_fresh(&user).await.unwrap();
    assert_eq!(access, "access-2");

    let stored = db.find_user("u1").await.unwrap().unwrap().gmail_tokens.unwrap();
    assert_eq!(stored.access_token, "access-2");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
    assert!(stored.expires_at > Utc::now() + Duration::minutes(50));
}

#[tokio::test]
async fn test_fresh_token_skips_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let db = Database::open_in_memory().unwrap();
    let user = common::connected_user(&db, "u1").await;
    let access = manager(&db, &server).ensure_fresh(&user).await.unwrap();
    assert_eq!(access, "access-u1");
}

#[tokio::test]
async fn test_invalid_grant_requires_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        // Revocation is final; no retries
        .expect(1)
        .mount(&server)
        .await;

    let db = Database::open_in_memory().unwrap();
    let user = expired_user(&db).await;

    let result = manager(&db, &server).ensure_fresh(&user).await;
    assert!(matches!(result, Err(PhishError::ReconnectRequired)));

    let user = db.find_user("u1").await.unwrap().unwrap();
    assert!(!user.gmail_connected);
    assert_eq!(user.gmail_status, GmailStatus::Disconnected);
    assert!(user.gmail_tokens.is_none());
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "after-retry",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let db = Database::open_in_memory().unwrap();
    let user = expired_user(&db).await;

    let access = manager(&db, &server).ensure_fresh(&user).await.unwrap();
    assert_eq!(access, "after-retry");
}

#[tokio::test]
async fn test_retries_exhausted_marks_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(3)
        .mount(&server)
        .await;

    let db = Database::open_in_memory().unwrap();
    let user = expired_user(&db).await;

    let result = manager(&db, &server).ensure_fresh(&user).await;
    assert!(matches!(result, Err(PhishError::ServerError { status: 500, .. })));
    assert_eq!(
        db.find_user("u1").await.unwrap().unwrap().gmail_status,
        GmailStatus::Failed
    );
}
