//! SQLite persistence for accounts, fetched emails and sandbox URL jobs.
//!
//! One connection behind a mutex; every query runs on the blocking pool.
//! Timestamps are stored as fixed-width RFC 3339 text so they sort lexically,
//! structured fields (scores, attachments, analysis output) as JSON text.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{PhishError, Result};
use crate::models::{
    Admin, AnalysisStatus, EmailRecord, EmailStatus, GmailStatus, GmailTokens, RiskLevel, Scores,
    UrlAnalysis, User,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL,
    gmail_connected INTEGER NOT NULL DEFAULT 0,
    gmail_status TEXT NOT NULL DEFAULT 'disconnected',
    gmail_access_token TEXT,
    gmail_refresh_token TEXT,
    gmail_token_expiry TEXT,
    last_email_sync TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS admins (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_login TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS emails (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    message_id TEXT NOT NULL UNIQUE,
    sender TEXT NOT NULL,
    recipient TEXT NOT NULL,
    subject TEXT NOT NULL,
    date TEXT,
    body TEXT NOT NULL,
    raw_headers TEXT NOT NULL,
    attachments TEXT NOT NULL,
    urls TEXT NOT NULL,
    scores TEXT NOT NULL,
    total_score INTEGER NOT NULL,
    phishing_risk TEXT NOT NULL,
    flagged INTEGER NOT NULL,
    status TEXT NOT NULL,
    admin_note TEXT,
    actioned_by TEXT,
    analyzed_at TEXT NOT NULL,
    detailed_analysis TEXT
);

CREATE INDEX IF NOT EXISTS idx_emails_user ON emails(user_id);
CREATE INDEX IF NOT EXISTS idx_emails_analyzed ON emails(analyzed_at);

CREATE TABLE IF NOT EXISTS url_analyses (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    email_id TEXT,
    submitted_by TEXT NOT NULL,
    status TEXT NOT NULL,
    risk_score INTEGER NOT NULL DEFAULT 0,
    reasons TEXT NOT NULL,
    processing_started TEXT,
    completed_at TEXT,
    failed_at TEXT,
    error TEXT,
    analysis_result TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const USER_COLUMNS: &str = "id, username, email, password_hash, role, gmail_connected, \
     gmail_status, gmail_access_token, gmail_refresh_token, gmail_token_expiry, \
     last_email_sync, created_at";

const ADMIN_COLUMNS: &str =
    "id, username, email, password_hash, role, is_active, last_login, created_at";

const EMAIL_COLUMNS: &str = "id, user_id, message_id, sender, recipient, subject, date, body, \
     raw_headers, attachments, urls, scores, phishing_risk, flagged, status, admin_note, \
     actioned_by, analyzed_at, detailed_analysis";

const URL_ANALYSIS_COLUMNS: &str = "id, url, email_id, submitted_by, status, risk_score, reasons, \
     processing_started, completed_at, failed_at, error, analysis_result, created_at, updated_at";

pub fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn enum_col<T: FromStr<Err = PhishError>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let access_token: Option<String> = row.get(7)?;
    let expires_at = opt_time_col(row, 9)?;
    let gmail_tokens = match (access_token, expires_at) {
        (Some(access_token), Some(expires_at)) => Some(GmailTokens {
            access_token,
            refresh_token: row.get(8)?,
            expires_at,
        }),
        _ => None,
    };

    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        role: enum_col(row, 4)?,
        gmail_connected: row.get(5)?,
        gmail_status: enum_col(row, 6)?,
        gmail_tokens,
        last_email_sync: opt_time_col(row, 10)?,
        created_at: time_col(row, 11)?,
    })
}

fn admin_from_row(row: &Row<'_>) -> rusqlite::Result<Admin> {
    Ok(Admin {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        role: enum_col(row, 4)?,
        is_active: row.get(5)?,
        last_login: opt_time_col(row, 6)?,
        created_at: time_col(row, 7)?,
    })
}

fn email_from_row(row: &Row<'_>) -> rusqlite::Result<EmailRecord> {
    Ok(EmailRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        message_id: row.get(2)?,
        from: row.get(3)?,
        to: row.get(4)?,
        subject: row.get(5)?,
        date: opt_time_col(row, 6)?,
        body: row.get(7)?,
        raw_headers: row.get(8)?,
        attachments: json_col(row, 9)?,
        urls: json_col(row, 10)?,
        scores: json_col(row, 11)?,
        phishing_risk: enum_col(row, 12)?,
        flagged: row.get(13)?,
        status: enum_col(row, 14)?,
        admin_note: row.get(15)?,
        actioned_by: row.get(16)?,
        analyzed_at: time_col(row, 17)?,
        detailed_analysis: opt_json_col(row, 18)?,
    })
}

fn url_analysis_from_row(row: &Row<'_>) -> rusqlite::Result<UrlAnalysis> {
    let risk_score: i64 = row.get(5)?;
    Ok(UrlAnalysis {
        id: row.get(0)?,
        url: row.get(1)?,
        email_id: row.get(2)?,
        submitted_by: row.get(3)?,
        status: enum_col(row, 4)?,
        risk_score: risk_score.clamp(0, 100) as u32,
        reasons: json_col(row, 6)?,
        processing_started: opt_time_col(row, 7)?,
        completed_at: opt_time_col(row, 8)?,
        failed_at: opt_time_col(row, 9)?,
        error: row.get(10)?,
        analysis_result: opt_json_col(row, 11)?,
        created_at: time_col(row, 12)?,
        updated_at: time_col(row, 13)?,
    })
}

/// Sortable email columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailSortField {
    AnalyzedAt,
    Date,
    Score,
}

impl EmailSortField {
    fn column(&self) -> &'static str {
        match self {
            EmailSortField::AnalyzedAt => "analyzed_at",
            EmailSortField::Date => "date",
            EmailSortField::Score => "total_score",
        }
    }
}

/// Parsed `sort` query value such as `-analyzedAt` (leading `-` = descending)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmailSort {
    pub field: EmailSortField,
    pub descending: bool,
}

impl Default for EmailSort {
    fn default() -> Self {
        Self {
            field: EmailSortField::AnalyzedAt,
            descending: true,
        }
    }
}

impl FromStr for EmailSort {
    type Err = PhishError;

    fn from_str(s: &str) -> Result<Self> {
        let (descending, name) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let field = match name {
            "analyzedAt" | "analyzed_at" => EmailSortField::AnalyzedAt,
            "date" => EmailSortField::Date,
            "score" | "scores.total" => EmailSortField::Score,
            other => return Err(PhishError::BadRequest(format!("Invalid sort field '{}'", other))),
        };
        Ok(Self { field, descending })
    }
}

#[derive(Debug, Clone)]
pub struct EmailFilter {
    pub user_id: Option<String>,
    pub risk: Option<RiskLevel>,
    pub status: Option<EmailStatus>,
    pub flagged_only: bool,
    pub sort: EmailSort,
    pub page: u32,
    pub limit: u32,
}

impl Default for EmailFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            risk: None,
            status: None,
            flagged_only: false,
            sort: EmailSort::default(),
            page: 1,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub pages: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmailStats {
    pub total: u64,
    pub flagged: u64,
    pub by_risk: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserEmailCount {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub count: u64,
}

/// Shared handle to the SQLite database
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening database at {}", path.display());
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| PhishError::StorageError("database lock poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| PhishError::StorageError(format!("database task failed: {}", e)))?
    }

    // ---- users ----

    /// Insert a new user; duplicate username or email is a conflict
    pub async fn create_user(&self, user: User) -> Result<User> {
        self.run(move |conn| {
            let clash: Option<(String, String)> = conn
                .query_row(
                    "SELECT username, email FROM users WHERE username = ?1 OR email = ?2",
                    params![user.username, user.email],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((username, _)) = clash {
                return Err(PhishError::Conflict(if username == user.username {
                    "Username already taken.".to_string()
                } else {
                    "Email already registered.".to_string()
                }));
            }

            conn.execute(
                &format!("INSERT INTO users ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)", USER_COLUMNS),
                params![
                    user.id,
                    user.username,
                    user.email,
                    user.password_hash,
                    user.role.as_str(),
                    user.gmail_connected,
                    user.gmail_status.as_str(),
                    user.gmail_tokens.as_ref().map(|t| t.access_token.clone()),
                    user.gmail_tokens.as_ref().and_then(|t| t.refresh_token.clone()),
                    user.gmail_tokens.as_ref().map(|t| timestamp(&t.expires_at)),
                    user.last_email_sync.as_ref().map(timestamp),
                    timestamp(&user.created_at),
                ],
            )?;
            debug!(user_id = %user.id, "Created user");
            Ok(user)
        })
        .await
    }

    pub async fn find_user(&self, id: &str) -> Result<Option<User>> {
        let id = id.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                    [id],
                    user_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Look up by email (case-insensitive) or exact username
    pub async fn find_user_by_login(&self, login: &str) -> Result<Option<User>> {
        let login = login.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM users WHERE lower(email) = lower(?1) OR username = ?1",
                        USER_COLUMNS
                    ),
                    [login],
                    user_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM users ORDER BY created_at DESC",
                USER_COLUMNS
            ))?;
            let users = stmt
                .query_map([], user_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }

    /// Store a fresh grant and mark the account connected
    pub async fn save_gmail_tokens(&self, user_id: &str, tokens: GmailTokens) -> Result<()> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE users SET gmail_access_token = ?2, gmail_refresh_token = ?3, \
                 gmail_token_expiry = ?4, gmail_connected = 1, gmail_status = ?5 WHERE id = ?1",
                params![
                    user_id,
                    tokens.access_token,
                    tokens.refresh_token,
                    timestamp(&tokens.expires_at),
                    GmailStatus::Connected.as_str(),
                ],
            )?;
            if updated == 0 {
                return Err(PhishError::NotFound("User".to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Drop the stored grant and record why
    pub async fn clear_gmail_tokens(&self, user_id: &str, status: GmailStatus) -> Result<()> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE users SET gmail_access_token = NULL, gmail_refresh_token = NULL, \
                 gmail_token_expiry = NULL, gmail_connected = 0, gmail_status = ?2 WHERE id = ?1",
                params![user_id, status.as_str()],
            )?;
            if updated == 0 {
                return Err(PhishError::NotFound("User".to_string()));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_gmail_status(&self, user_id: &str, status: GmailStatus) -> Result<()> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE users SET gmail_status = ?2 WHERE id = ?1",
                params![user_id, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn touch_last_sync(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE users SET last_email_sync = ?2 WHERE id = ?1",
                params![user_id, timestamp(&at)],
            )?;
            Ok(())
        })
        .await
    }

    // ---- admins ----

    pub async fn create_admin(&self, admin: Admin) -> Result<Admin> {
        self.run(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM admins WHERE username = ?1 OR email = ?2)",
                params![admin.username, admin.email],
                |row| row.get(0),
            )?;
            if exists {
                return Err(PhishError::Conflict("Admin already exists".to_string()));
            }

            conn.execute(
                &format!("INSERT INTO admins ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", ADMIN_COLUMNS),
                params![
                    admin.id,
                    admin.username,
                    admin.email,
                    admin.password_hash,
                    admin.role.as_str(),
                    admin.is_active,
                    admin.last_login.as_ref().map(timestamp),
                    timestamp(&admin.created_at),
                ],
            )?;
            Ok(admin)
        })
        .await
    }

    pub async fn find_admin(&self, id: &str) -> Result<Option<Admin>> {
        let id = id.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM admins WHERE id = ?1", ADMIN_COLUMNS),
                    [id],
                    admin_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn find_admin_by_login(&self, login: &str) -> Result<Option<Admin>> {
        let login = login.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM admins WHERE lower(email) = lower(?1) OR username = ?1",
                        ADMIN_COLUMNS
                    ),
                    [login],
                    admin_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn record_admin_login(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE admins SET last_login = ?2 WHERE id = ?1",
                params![id, timestamp(&at)],
            )?;
            Ok(())
        })
        .await
    }

    // ---- emails ----

    pub async fn insert_email(&self, email: EmailRecord) -> Result<EmailRecord> {
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO emails ({}, total_score) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                    EMAIL_COLUMNS
                ),
                params![
                    email.id,
                    email.user_id,
                    email.message_id,
                    email.from,
                    email.to,
                    email.subject,
                    email.date.as_ref().map(timestamp),
                    email.body,
                    email.raw_headers,
                    serde_json::to_string(&email.attachments)?,
                    serde_json::to_string(&email.urls)?,
                    serde_json::to_string(&email.scores)?,
                    email.phishing_risk.as_str(),
                    email.flagged,
                    email.status.as_str(),
                    email.admin_note,
                    email.actioned_by,
                    timestamp(&email.analyzed_at),
                    email
                        .detailed_analysis
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    email.scores.total as i64,
                ],
            )?;
            Ok(email)
        })
        .await
    }

    pub async fn find_email(&self, id: &str) -> Result<Option<EmailRecord>> {
        let id = id.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM emails WHERE id = ?1", EMAIL_COLUMNS),
                    [id],
                    email_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Which of `message_ids` are already stored
    pub async fn existing_message_ids(&self, message_ids: Vec<String>) -> Result<HashSet<String>> {
        if message_ids.is_empty() {
            return Ok(HashSet::new());
        }
        self.run(move |conn| {
            let placeholders = vec!["?"; message_ids.len()].join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT message_id FROM emails WHERE message_id IN ({})",
                placeholders
            ))?;
            let found = stmt
                .query_map(params_from_iter(message_ids.iter()), |row| row.get(0))?
                .collect::<rusqlite::Result<HashSet<String>>>()?;
            Ok(found)
        })
        .await
    }

    pub async fn list_emails(&self, filter: EmailFilter) -> Result<Page<EmailRecord>> {
        self.run(move |conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<Value> = Vec::new();

            if let Some(user_id) = &filter.user_id {
                clauses.push("user_id = ?");
                values.push(Value::Text(user_id.clone()));
            }
            if let Some(risk) = filter.risk {
                clauses.push("phishing_risk = ?");
                values.push(Value::Text(risk.as_str().to_string()));
            }
            if let Some(status) = filter.status {
                clauses.push("status = ?");
                values.push(Value::Text(status.as_str().to_string()));
            }
            if filter.flagged_only {
                clauses.push("flagged = 1");
            }

            let where_sql = if clauses.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", clauses.join(" AND "))
            };

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM emails{}", where_sql),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )?;

            let page = filter.page.max(1);
            let limit = filter.limit.clamp(1, 100);
            let order = if filter.sort.descending { "DESC" } else { "ASC" };
            let sql = format!(
                "SELECT {} FROM emails{} ORDER BY {} {}, id LIMIT ? OFFSET ?",
                EMAIL_COLUMNS,
                where_sql,
                filter.sort.field.column(),
                order
            );
            values.push(Value::Integer(limit as i64));
            values.push(Value::Integer(((page - 1) as i64) * limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(params_from_iter(values.iter()), email_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let total = total.max(0) as u64;
            Ok(Page {
                items,
                total,
                page,
                pages: total.div_ceil(limit as u64),
            })
        })
        .await
    }

    /// Every stored email, oldest first
    pub async fn all_emails(&self) -> Result<Vec<EmailRecord>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM emails ORDER BY analyzed_at ASC",
                EMAIL_COLUMNS
            ))?;
            let emails = stmt
                .query_map([], email_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(emails)
        })
        .await
    }

    pub async fn emails_for_user(&self, user_id: &str) -> Result<Vec<EmailRecord>> {
        let user_id = user_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM emails WHERE user_id = ?1 ORDER BY analyzed_at DESC",
                EMAIL_COLUMNS
            ))?;
            let emails = stmt
                .query_map([user_id], email_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(emails)
        })
        .await
    }

    pub async fn update_email_status(
        &self,
        id: &str,
        status: EmailStatus,
        admin_note: Option<String>,
        actioned_by: &str,
    ) -> Result<EmailRecord> {
        let id = id.to_string();
        let actioned_by = actioned_by.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE emails SET status = ?2, admin_note = ?3, actioned_by = ?4 WHERE id = ?1",
                params![id, status.as_str(), admin_note, actioned_by],
            )?;
            if updated == 0 {
                return Err(PhishError::NotFound("Email".to_string()));
            }
            Ok(conn.query_row(
                &format!("SELECT {} FROM emails WHERE id = ?1", EMAIL_COLUMNS),
                [id],
                email_from_row,
            )?)
        })
        .await
    }

    pub async fn update_scores(
        &self,
        id: &str,
        scores: Scores,
        risk: RiskLevel,
        flagged: bool,
    ) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE emails SET scores = ?2, total_score = ?3, phishing_risk = ?4, flagged = ?5 \
                 WHERE id = ?1",
                params![
                    id,
                    serde_json::to_string(&scores)?,
                    scores.total as i64,
                    risk.as_str(),
                    flagged
                ],
            )?;
            if updated == 0 {
                return Err(PhishError::NotFound("Email".to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Persist a detailed analysis and fold its total into the email's scores
    pub async fn save_detailed_analysis(
        &self,
        id: &str,
        analysis: serde_json::Value,
        total: u32,
        risk: RiskLevel,
        flagged: bool,
        analyzed_at: DateTime<Utc>,
    ) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut scores: Scores = tx
                .query_row("SELECT scores FROM emails WHERE id = ?1", [&id], |row| {
                    json_col(row, 0)
                })
                .optional()?
                .ok_or_else(|| PhishError::NotFound("Email".to_string()))?;
            scores.total = total;

            tx.execute(
                "UPDATE emails SET detailed_analysis = ?2, scores = ?3, total_score = ?4, \
                 phishing_risk = ?5, flagged = ?6, analyzed_at = ?7 WHERE id = ?1",
                params![
                    id,
                    serde_json::to_string(&analysis)?,
                    serde_json::to_string(&scores)?,
                    total as i64,
                    risk.as_str(),
                    flagged,
                    timestamp(&analyzed_at),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Totals over all emails, or one user's when `user_id` is set
    pub async fn email_stats(&self, user_id: Option<String>) -> Result<EmailStats> {
        self.run(move |conn| {
            let (where_sql, values): (&str, Vec<Value>) = match user_id {
                Some(id) => (" WHERE user_id = ?", vec![Value::Text(id)]),
                None => ("", Vec::new()),
            };

            let mut stats = EmailStats::default();
            for level in [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High, RiskLevel::Critical] {
                stats.by_risk.insert(level.as_str().to_string(), 0);
            }
            for status in [
                EmailStatus::New,
                EmailStatus::Reviewed,
                EmailStatus::Quarantined,
                EmailStatus::Safe,
            ] {
                stats.by_status.insert(status.as_str().to_string(), 0);
            }

            let (total, flagged): (i64, i64) = conn.query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(flagged), 0) FROM emails{}",
                    where_sql
                ),
                params_from_iter(values.iter()),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            stats.total = total.max(0) as u64;
            stats.flagged = flagged.max(0) as u64;

            for (column, target) in [
                ("phishing_risk", &mut stats.by_risk),
                ("status", &mut stats.by_status),
            ] {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {col}, COUNT(*) FROM emails{w} GROUP BY {col}",
                    col = column,
                    w = where_sql
                ))?;
                let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (key, count) = row?;
                    target.insert(key, count.max(0) as u64);
                }
            }

            Ok(stats)
        })
        .await
    }

    pub async fn email_counts_by_user(&self) -> Result<Vec<UserEmailCount>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, u.email, COUNT(e.id) FROM users u \
                 JOIN emails e ON e.user_id = u.id GROUP BY u.id ORDER BY COUNT(e.id) DESC",
            )?;
            let counts = stmt
                .query_map([], |row| {
                    Ok(UserEmailCount {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        email: row.get(2)?,
                        count: row.get::<_, i64>(3)?.max(0) as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(counts)
        })
        .await
    }

    // ---- sandbox url analyses ----

    pub async fn insert_url_analysis(&self, record: UrlAnalysis) -> Result<UrlAnalysis> {
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO url_analyses ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    URL_ANALYSIS_COLUMNS
                ),
                params![
                    record.id,
                    record.url,
                    record.email_id,
                    record.submitted_by,
                    record.status.as_str(),
                    record.risk_score as i64,
                    serde_json::to_string(&record.reasons)?,
                    record.processing_started.as_ref().map(timestamp),
                    record.completed_at.as_ref().map(timestamp),
                    record.failed_at.as_ref().map(timestamp),
                    record.error,
                    record
                        .analysis_result
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    timestamp(&record.created_at),
                    timestamp(&record.updated_at),
                ],
            )?;
            Ok(record)
        })
        .await
    }

    pub async fn find_url_analysis(&self, id: &str) -> Result<Option<UrlAnalysis>> {
        let id = id.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM url_analyses WHERE id = ?1", URL_ANALYSIS_COLUMNS),
                    [id],
                    url_analysis_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Newest first; all records when `submitted_by` is `None`
    pub async fn list_url_analyses(&self, submitted_by: Option<String>) -> Result<Vec<UrlAnalysis>> {
        self.run(move |conn| {
            let (where_sql, values): (&str, Vec<Value>) = match submitted_by {
                Some(id) => (" WHERE submitted_by = ?", vec![Value::Text(id)]),
                None => ("", Vec::new()),
            };
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM url_analyses{} ORDER BY created_at DESC",
                URL_ANALYSIS_COLUMNS, where_sql
            ))?;
            let records = stmt
                .query_map(params_from_iter(values.iter()), url_analysis_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    pub async fn mark_url_processing(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            check_transition(&tx, &id, AnalysisStatus::Processing)?;
            let now = timestamp(&Utc::now());
            tx.execute(
                "UPDATE url_analyses SET status = ?2, processing_started = ?3, updated_at = ?3 \
                 WHERE id = ?1",
                params![id, AnalysisStatus::Processing.as_str(), now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn complete_url_analysis(
        &self,
        id: &str,
        risk_score: u32,
        reasons: Vec<String>,
        result: serde_json::Value,
    ) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            check_transition(&tx, &id, AnalysisStatus::Completed)?;
            let now = timestamp(&Utc::now());
            tx.execute(
                "UPDATE url_analyses SET status = ?2, risk_score = ?3, reasons = ?4, \
                 analysis_result = ?5, completed_at = ?6, updated_at = ?6 WHERE id = ?1",
                params![
                    id,
                    AnalysisStatus::Completed.as_str(),
                    risk_score.min(100) as i64,
                    serde_json::to_string(&reasons)?,
                    serde_json::to_string(&result)?,
                    now,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn fail_url_analysis(&self, id: &str, error: String) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            check_transition(&tx, &id, AnalysisStatus::Failed)?;
            let now = timestamp(&Utc::now());
            tx.execute(
                "UPDATE url_analyses SET status = ?2, error = ?3, failed_at = ?4, updated_at = ?4 \
                 WHERE id = ?1",
                params![id, AnalysisStatus::Failed.as_str(), error, now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn check_transition(conn: &Connection, id: &str, next: AnalysisStatus) -> Result<()> {
    let current: AnalysisStatus = conn
        .query_row("SELECT status FROM url_analyses WHERE id = ?1", [id], |row| {
            enum_col(row, 0)
        })
        .optional()?
        .ok_or_else(|| PhishError::NotFound("URL analysis".to_string()))?;

    if !current.can_transition_to(next) {
        return Err(PhishError::BadRequest(format!(
            "URL analysis cannot move from {} to {}",
            current.as_str(),
            next.as_str()
        )));
    }
    Ok(())
}
