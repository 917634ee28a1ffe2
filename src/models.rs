use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PhishError;

/// Account role carried in the JWT `role` claim
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Superadmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::Superadmin)
    }
}

impl FromStr for Role {
    type Err = PhishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            "superadmin" => Ok(Role::Superadmin),
            other => Err(PhishError::StorageError(format!("unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GmailStatus {
    Disconnected,
    Pending,
    Connected,
    Failed,
}

impl GmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GmailStatus::Disconnected => "disconnected",
            GmailStatus::Pending => "pending",
            GmailStatus::Connected => "connected",
            GmailStatus::Failed => "failed",
        }
    }
}

impl FromStr for GmailStatus {
    type Err = PhishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(GmailStatus::Disconnected),
            "pending" => Ok(GmailStatus::Pending),
            "connected" => Ok(GmailStatus::Connected),
            "failed" => Ok(GmailStatus::Failed),
            other => Err(PhishError::StorageError(format!(
                "unknown gmail status '{}'",
                other
            ))),
        }
    }
}

/// Stored OAuth grant for a user's Gmail account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GmailTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub gmail_connected: bool,
    pub gmail_status: GmailStatus,
    #[serde(skip_serializing)]
    pub gmail_tokens: Option<GmailTokens>,
    pub last_email_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admin {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Four-level phishing risk bucket
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::Critical => "Critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = PhishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Low" => Ok(RiskLevel::Low),
            "Medium" => Ok(RiskLevel::Medium),
            "High" => Ok(RiskLevel::High),
            "Critical" => Ok(RiskLevel::Critical),
            other => Err(PhishError::BadRequest(format!("Invalid risk level '{}'", other))),
        }
    }
}

/// Review status set by an administrator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EmailStatus {
    New,
    Reviewed,
    Quarantined,
    Safe,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::New => "New",
            EmailStatus::Reviewed => "Reviewed",
            EmailStatus::Quarantined => "Quarantined",
            EmailStatus::Safe => "Safe",
        }
    }
}

impl FromStr for EmailStatus {
    type Err = PhishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "New" => Ok(EmailStatus::New),
            "Reviewed" => Ok(EmailStatus::Reviewed),
            "Quarantined" => Ok(EmailStatus::Quarantined),
            "Safe" => Ok(EmailStatus::Safe),
            _ => Err(PhishError::BadRequest("Invalid status".to_string())),
        }
    }
}

/// Per-category heuristic scores; `total` is always clamped to 0..=100
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Scores {
    pub header: u32,
    pub text: u32,
    pub metadata: u32,
    pub attachments: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    pub name: String,
    pub content_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UrlEntry {
    pub url: String,
    pub suspicious: bool,
}

/// A fetched Gmail message as stored for scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecord {
    pub id: String,
    pub user_id: String,
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub body: String,
    pub raw_headers: String,
    pub attachments: Vec<AttachmentInfo>,
    pub urls: Vec<UrlEntry>,
    pub scores: Scores,
    pub phishing_risk: RiskLevel,
    pub flagged: bool,
    pub status: EmailStatus,
    pub admin_note: Option<String>,
    pub actioned_by: Option<String>,
    pub analyzed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed_analysis: Option<serde_json::Value>,
}

/// Sandbox URL job lifecycle: pending -> processing -> completed | failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }

    /// Whether a record in this state may move to `next`
    pub fn can_transition_to(&self, next: AnalysisStatus) -> bool {
        matches!(
            (self, next),
            (AnalysisStatus::Pending, AnalysisStatus::Processing)
                | (AnalysisStatus::Processing, AnalysisStatus::Completed)
                | (AnalysisStatus::Processing, AnalysisStatus::Failed)
                | (AnalysisStatus::Pending, AnalysisStatus::Failed)
        )
    }
}

impl FromStr for AnalysisStatus {
    type Err = PhishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "processing" => Ok(AnalysisStatus::Processing),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            other => Err(PhishError::BadRequest(format!("Invalid status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlAnalysis {
    pub id: String,
    pub url: String,
    pub email_id: Option<String>,
    pub submitted_by: String,
    pub status: AnalysisStatus,
    pub risk_score: u32,
    pub reasons: Vec<String>,
    pub processing_started: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub analysis_result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
