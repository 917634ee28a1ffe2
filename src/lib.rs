//! PhishGuard
//!
//! Phishing risk scoring for Gmail mailboxes, served over a JSON HTTP API.
//!
//! # Overview
//!
//! - **Accounts**: user and administrator sign-up/login with JWT sessions
//! - **Gmail**: OAuth consent, token refresh and concurrent message fetching
//! - **Scoring**: content heuristics, header anomalies and URL reputation,
//!   combined by a declarative weighted rule table into a risk bucket
//! - **Intel**: pluggable threat-intelligence lookups that degrade to
//!   explicit "unavailable" signals instead of failing
//! - **Sandbox**: queued URL analysis jobs with a tracked lifecycle
//! - **IP and attachments**: origin infrastructure and file tampering checks
//!
//! # Example Usage
//!
//! ```no_run
//! use phishguard::{api, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("phishguard.toml".as_ref()).await?;
//!     let bind = config.server.bind.clone();
//!     let state = api::AppState::from_config(config).await?;
//!     api::serve(state, &bind).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`accounts`] - Registration, login and JWT issuing
//! - [`analysis`] - Detailed email and URL analysis
//! - [`api`] - axum router, extractors and handlers
//! - [`attachments`] - Attachment hashing, sniffing and tamper detection
//! - [`circuit_breaker`] - Circuit breaker for external providers
//! - [`classifier`] - Content heuristics (quick score)
//! - [`cli`] - Command-line interface
//! - [`client`] - Gmail mailbox client
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`headers`] - Header parsing and anomaly scoring
//! - [`intel`] - Threat-intelligence providers
//! - [`ip`] - Sender IP infrastructure analysis
//! - [`models`] - Core data structures
//! - [`oauth`] - Gmail OAuth consent and token refresh
//! - [`rate_limiter`] - Token bucket for rate-limited providers
//! - [`sandbox`] - Background URL analysis jobs
//! - [`scoring`] - Rule table and risk aggregation
//! - [`store`] - SQLite persistence
//! - [`sync`] - Mailbox fetch job
//! - [`urls`] - URL extraction and scoring
//! - [`whois`] - Domain registration lookups

pub mod accounts;
pub mod analysis;
pub mod api;
pub mod attachments;
pub mod circuit_breaker;
pub mod classifier;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod intel;
pub mod ip;
pub mod models;
pub mod oauth;
pub mod rate_limiter;
pub mod sandbox;
pub mod scoring;
pub mod store;
pub mod sync;
pub mod urls;
pub mod whois;

// Re-export commonly used types for convenience
pub use error::{PhishError, Result};

pub use models::{EmailRecord, EmailStatus, RiskLevel, Role, Scores, UrlAnalysis};

pub use config::Config;

pub use scoring::{aggregate, RiskThresholds, ScoringConfig};

pub use intel::{HttpThreatIntel, OfflineIntel, ThreatIntel};

pub use client::{MailboxClient, MailboxConnector};

pub use api::{router, AppState, Services};
