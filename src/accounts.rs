//! Account registration, password hashing and JWT session tokens.
//!
//! Users and administrators live in separate tables but share one login:
//! administrators are matched first, then users. A successful login issues
//! a JWT carrying `{id, role, iat, exp}`.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{PhishError, Result};
use crate::models::{Admin, GmailStatus, Role, User};
use crate::store::Database;

pub const MIN_PASSWORD_LEN: usize = 6;

static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("Invalid email regex"));

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PhishError::Unknown(format!("password hashing failed: {}", e)))
}

/// False for a wrong password or an unparseable stored hash
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash is malformed: {}", e);
            false
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub id: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies session tokens (HS256)
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl JwtKeys {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::hours(config.token_ttl_hours),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, id: &str, role: Role) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            id: id.to_string(),
            role,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())?;
        Ok(data.claims)
    }
}

/// Public view of a user or administrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountProfile {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gmail_connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gmail_status: Option<GmailStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_email_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
}

impl From<&User> for AccountProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            gmail_connected: Some(user.gmail_connected),
            gmail_status: Some(user.gmail_status),
            last_email_sync: user.last_email_sync,
            last_login: None,
        }
    }
}

impl From<&Admin> for AccountProfile {
    fn from(admin: &Admin) -> Self {
        Self {
            id: admin.id.clone(),
            username: admin.username.clone(),
            email: admin.email.clone(),
            role: admin.role,
            gmail_connected: None,
            gmail_status: None,
            last_email_sync: None,
            last_login: admin.last_login,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub account: AccountProfile,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignupRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

impl SignupRequest {
    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() || self.email.trim().is_empty() || self.password.is_empty() {
            return Err(PhishError::BadRequest("All fields are required".to_string()));
        }
        if !EMAIL_REGEX.is_match(self.email.trim()) {
            return Err(PhishError::BadRequest("Invalid email address".to_string()));
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(PhishError::BadRequest(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        Ok(())
    }
}

/// Registration and login against the account tables
#[derive(Clone)]
pub struct Accounts {
    db: Database,
    keys: JwtKeys,
}

impl Accounts {
    pub fn new(db: Database, keys: JwtKeys) -> Self {
        Self { db, keys }
    }

    pub fn keys(&self) -> &JwtKeys {
        &self.keys
    }

    pub async fn signup(&self, request: SignupRequest) -> Result<Session> {
        request.validate()?;

        let password = request.password;
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| PhishError::Unknown(format!("hashing task failed: {}", e)))??;

        let user = self
            .db
            .create_user(User {
                id: Uuid::new_v4().to_string(),
                username: request.username.trim().to_string(),
                email: request.email.trim().to_lowercase(),
                password_hash,
                role: Role::User,
                gmail_connected: false,
                gmail_status: GmailStatus::Disconnected,
                gmail_tokens: None,
                last_email_sync: None,
                created_at: Utc::now(),
            })
            .await?;

        info!(user_id = %user.id, "Registered new user");
        Ok(Session {
            token: self.keys.issue(&user.id, user.role)?,
            account: AccountProfile::from(&user),
        })
    }

    /// Administrators are matched first, then users
    pub async fn login(&self, login: &str, password: &str) -> Result<Session> {
        if login.trim().is_empty() || password.is_empty() {
            return Err(PhishError::BadRequest(
                "Email/username and password are required".to_string(),
            ));
        }
        let login = login.trim();

        if let Some(admin) = self.db.find_admin_by_login(login).await? {
            if !admin.is_active {
                return Err(PhishError::Forbidden("Account is disabled".to_string()));
            }
            check_password(password, &admin.password_hash).await?;
            self.db.record_admin_login(&admin.id, Utc::now()).await?;
            info!(admin_id = %admin.id, "Administrator logged in");
            return Ok(Session {
                token: self.keys.issue(&admin.id, admin.role)?,
                account: AccountProfile::from(&admin),
            });
        }

        let user = self
            .db
            .find_user_by_login(login)
            .await?
            .ok_or_else(|| PhishError::NotFound("Account".to_string()))?;
        check_password(password, &user.password_hash).await?;
        info!(user_id = %user.id, "User logged in");
        Ok(Session {
            token: self.keys.issue(&user.id, user.role)?,
            account: AccountProfile::from(&user),
        })
    }

    /// Resolve token claims back to the stored account
    pub async fn profile(&self, claims: &Claims) -> Result<AccountProfile> {
        if claims.role.is_admin() {
            let admin = self
                .db
                .find_admin(&claims.id)
                .await?
                .ok_or_else(|| PhishError::NotFound("Admin".to_string()))?;
            return Ok(AccountProfile::from(&admin));
        }
        let user = self
            .db
            .find_user(&claims.id)
            .await?
            .ok_or_else(|| PhishError::NotFound("User".to_string()))?;
        Ok(AccountProfile::from(&user))
    }

    pub async fn create_admin(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<Admin> {
        SignupRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        }
        .validate()?;
        if !role.is_admin() {
            return Err(PhishError::BadRequest("Administrator role required".to_string()));
        }

        let admin = Admin {
            id: Uuid::new_v4().to_string(),
            username: username.trim().to_string(),
            email: email.trim().to_lowercase(),
            password_hash: hash_password(password)?,
            role,
            is_active: true,
            last_login: None,
            created_at: Utc::now(),
        };
        self.db.create_admin(admin).await
    }
}

async fn check_password(password: &str, stored_hash: &str) -> Result<()> {
    let password = password.to_string();
    let stored_hash = stored_hash.to_string();
    let valid = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
        .await
        .map_err(|e| PhishError::Unknown(format!("verification task failed: {}", e)))?;
    if valid {
        Ok(())
    } else {
        Err(PhishError::AuthError("Invalid credentials".to_string()))
    }
}
