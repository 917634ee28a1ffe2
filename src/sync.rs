//! Mailbox fetch job: pull recent messages, quick-score them and store the new ones

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{ContentClassifier, ContentInput};
use crate::client::{FetchedMessage, MailboxConnector};
use crate::error::{PhishError, Result};
use crate::models::{EmailRecord, EmailStatus, RiskLevel, Scores, UrlEntry};
use crate::oauth::TokenManager;
use crate::scoring::ScoringConfig;
use crate::store::Database;
use crate::urls::{extract_domain, extract_urls, is_shortener};

/// Messages fetched from Gmail at the same time
const FETCH_CONCURRENCY: usize = 5;

/// Outcome of one fetch run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Message ids returned by the mailbox listing
    pub listed: usize,
    /// Already stored, not fetched again
    pub skipped: usize,
    pub failed: usize,
    pub emails: Vec<EmailRecord>,
}

/// Content score, bucket and flag for a message
pub fn quick_score(
    classifier: &ContentClassifier,
    scoring: &ScoringConfig,
    input: &ContentInput<'_>,
) -> (Scores, RiskLevel, bool) {
    let verdict = classifier.classify(input);
    let total = verdict.scores.total;
    (
        verdict.scores,
        scoring.email_thresholds.level(total),
        scoring.is_flagged(total),
    )
}

/// URLs found in a body, marking shortener links as suspicious
pub fn url_entries(body: &str) -> Vec<UrlEntry> {
    extract_urls(body)
        .into_iter()
        .map(|url| {
            let suspicious = extract_domain(&url).map(|d| is_shortener(&d)).unwrap_or(false);
            UrlEntry { url, suspicious }
        })
        .collect()
}

pub struct MailboxSync {
    db: Database,
    tokens: TokenManager,
    connector: Arc<dyn MailboxConnector>,
    classifier: Arc<ContentClassifier>,
    scoring: ScoringConfig,
    max_results: u32,
}

impl MailboxSync {
    pub fn new(
        db: Database,
        tokens: TokenManager,
        connector: Arc<dyn MailboxConnector>,
        scoring: ScoringConfig,
        max_results: u32,
    ) -> Self {
        let classifier = Arc::new(ContentClassifier::new(scoring.content.clone()));
        Self {
            db,
            tokens,
            connector,
            classifier,
            scoring,
            max_results,
        }
    }

    /// Build the stored record for a freshly fetched message
    pub fn build_record(&self, user_id: &str, message: FetchedMessage) -> Result<EmailRecord> {
        let (scores, risk, flagged) = quick_score(
            &self.classifier,
            &self.scoring,
            &ContentInput {
                from: &message.from,
                subject: &message.subject,
                body: &message.body,
                attachments: &message.attachments,
            },
        );

        Ok(EmailRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            message_id: message.id,
            raw_headers: serde_json::to_string(&message.headers)?,
            urls: url_entries(&message.body),
            from: message.from,
            to: message.to,
            subject: message.subject,
            date: message.date,
            body: message.body,
            attachments: message.attachments,
            scores,
            phishing_risk: risk,
            flagged,
            status: EmailStatus::New,
            admin_note: None,
            actioned_by: None,
            analyzed_at: Utc::now(),
            detailed_analysis: None,
        })
    }

    /// Fetch the user's most recent messages and store those not seen before
    pub async fn fetch_for_user(&self, user_id: &str) -> Result<SyncReport> {
        let user = self
            .db
            .find_user(user_id)
            .await?
            .ok_or_else(|| PhishError::NotFound("User".to_string()))?;
        if !user.gmail_connected {
            return Err(PhishError::NotConnected);
        }

        let access_token = self.tokens.ensure_fresh(&user).await?;
        let client = self.connector.connect(access_token)?;

        let ids = client.list_message_ids(self.max_results).await?;
        let existing = self.db.existing_message_ids(ids.clone()).await?;
        let mut report = SyncReport {
            listed: ids.len(),
            ..SyncReport::default()
        };

        let new_ids: Vec<String> = ids.into_iter().filter(|id| !existing.contains(id)).collect();
        report.skipped = report.listed - new_ids.len();
        debug!(user_id, new = new_ids.len(), skipped = report.skipped, "Fetching messages");

        let mut fetched = stream::iter(new_ids)
            .map(|id| {
                let client = client.clone();
                async move {
                    let result = client.get_message(&id).await;
                    (id, result)
                }
            })
            .buffered(FETCH_CONCURRENCY);

        while let Some((id, result)) = fetched.next().await {
            let message = match result {
                Ok(message) => message,
                // the token stopped working mid-run; nothing else will succeed
                Err(e @ (PhishError::AuthError(_) | PhishError::ReconnectRequired)) => return Err(e),
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Failed to fetch message");
                    report.failed += 1;
                    continue;
                }
            };

            let record = self.build_record(user_id, message)?;
            match self.db.insert_email(record).await {
                Ok(stored) => report.emails.push(stored),
                Err(PhishError::Conflict(_)) => {
                    debug!(message_id = %id, "Message stored concurrently, skipping");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        self.db.touch_last_sync(user_id, Utc::now()).await?;
        info!(
            user_id,
            stored = report.emails.len(),
            skipped = report.skipped,
            failed = report.failed,
            "Mailbox sync complete"
        );

        Ok(report)
    }
}
