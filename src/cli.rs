//! Command-line interface

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::accounts::{Accounts, JwtKeys};
use crate::analysis::{EmailAnalyzer, MessageReport};
use crate::classifier::{ContentClassifier, ContentInput};
use crate::config::Config;
use crate::error::{PhishError, Result};
use crate::intel::{HttpThreatIntel, OfflineIntel, ThreatIntel};
use crate::models::{Admin, Role};
use crate::store::Database;
use crate::sync::quick_score;

#[derive(Parser, Debug)]
#[command(name = "phishguard")]
#[command(version)]
#[command(about = "Phishing risk scoring for connected Gmail mailboxes", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "phishguard.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Address to listen on, overriding `server.bind`
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "phishguard.toml")]
        path: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Create an administrator account
    CreateAdmin {
        #[arg(long)]
        username: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        password: String,

        /// Grant the superadmin role
        #[arg(long)]
        superadmin: bool,
    },

    /// Score a raw message file (headers, blank line, body) and print a JSON report
    Score {
        file: PathBuf,

        /// Skip network lookups; only local heuristics contribute
        #[arg(long)]
        offline: bool,
    },

    /// Re-run content scoring over every stored email
    Rescore,
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new(multi: MultiProgress) -> Self {
        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self { multi, bar_style }
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

/// Write the default configuration, refusing to clobber an existing file
pub async fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(PhishError::ConfigError(format!(
            "Configuration file already exists at {:?}. Use --force to overwrite.",
            path
        )));
    }
    Config::create_example(path).await
}

pub async fn create_admin(
    config: &Config,
    username: &str,
    email: &str,
    password: &str,
    superadmin: bool,
) -> Result<Admin> {
    let db = Database::open(&config.database.path)?;
    let accounts = Accounts::new(db, JwtKeys::new(&config.auth));
    let role = if superadmin { Role::Superadmin } else { Role::Admin };
    accounts.create_admin(username, email, password, role).await
}

/// Full analysis of one message file; nothing is stored
pub async fn score_file(config: &Config, file: &Path, offline: bool) -> Result<MessageReport> {
    let raw = tokio::fs::read_to_string(file).await?;
    if raw.trim().is_empty() {
        return Err(PhishError::InvalidMessageFormat(format!("{:?} is empty", file)));
    }

    let intel: Arc<dyn ThreatIntel> = if offline {
        Arc::new(OfflineIntel)
    } else {
        Arc::new(HttpThreatIntel::new(
            config.intel.clone(),
            config.circuit_breaker.clone(),
        )?)
    };

    let analyzer = EmailAnalyzer::new(
        Database::open_in_memory()?,
        intel,
        config.scoring.clone(),
        config.intel.max_concurrent_lookups,
        config.analysis.batch_size,
    );
    Ok(analyzer.analyze_message(&raw).await)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RescoreSummary {
    pub rescored: usize,
    pub failed: usize,
}

/// Recompute the content score, bucket and flag of every stored email
pub async fn rescore(config: &Config, progress: &ProgressReporter) -> Result<RescoreSummary> {
    let db = Database::open(&config.database.path)?;
    rescore_all(&db, config, Some(progress)).await
}

async fn rescore_all(
    db: &Database,
    config: &Config,
    progress: Option<&ProgressReporter>,
) -> Result<RescoreSummary> {
    let emails = db.all_emails().await?;
    let classifier = ContentClassifier::new(config.scoring.content.clone());
    let pb = progress.map(|p| p.add_progress_bar(emails.len() as u64, "Rescoring emails"));
    let mut summary = RescoreSummary::default();

    for email in &emails {
        let input = ContentInput {
            from: &email.from,
            subject: &email.subject,
            body: &email.body,
            attachments: &email.attachments,
        };
        let (scores, risk, flagged) = quick_score(&classifier, &config.scoring, &input);

        match db.update_scores(&email.id, scores, risk, flagged).await {
            Ok(()) => summary.rescored += 1,
            Err(e) => {
                warn!(email_id = %email.id, error = %e, "Failed to store new scores");
                summary.failed += 1;
            }
        }
        if let Some(pb) = &pb {
            pb.inc(1);
        }
    }

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    info!(rescored = summary.rescored, failed = summary.failed, "Rescore complete");
    Ok(summary)
}
