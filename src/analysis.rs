//! Detailed analysis: header checks, per-URL intel and the weighted total.
//!
//! The fetch job only stores a content score. This module re-reads a stored
//! email, runs the header analyzer over its raw headers, fans the URL lookups
//! out with a concurrency bound and folds everything into one 0-100 total
//! using the configured weights.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::classifier::{ContentClassifier, ContentInput};
use crate::error::{PhishError, Result};
use crate::headers::{parse_headers, HeaderAnalysis, HeaderAnalyzer};
use crate::intel::{ThreatIntel, Unavailable};
use crate::models::{AttachmentInfo, EmailRecord, RiskLevel, Scores};
use crate::scoring::{aggregate, RiskThresholds, ScoringConfig, UrlRules};
use crate::store::Database;
use crate::urls::{extract_domain, extract_urls, score_url, UrlReport, UrlSignals};

/// Per-URL lookups and scoring
#[derive(Clone)]
pub struct UrlAnalyzer {
    intel: Arc<dyn ThreatIntel>,
    rules: UrlRules,
    thresholds: RiskThresholds,
}

impl UrlAnalyzer {
    pub fn new(intel: Arc<dyn ThreatIntel>, scoring: &ScoringConfig) -> Self {
        Self {
            intel,
            rules: scoring.urls.clone(),
            thresholds: scoring.url_thresholds,
        }
    }

    /// Run the four lookups for one URL concurrently
    pub async fn gather(&self, url: &str) -> UrlSignals {
        let Some(domain) = extract_domain(url) else {
            let invalid = |source: &str| Unavailable::new(source, "invalid URL");
            return UrlSignals {
                redirect: Err(invalid("redirect")),
                tls: Err(invalid("tls")),
                domain_age: Err(invalid("whois")),
                reputation: Err(invalid("virustotal")),
            };
        };

        let (redirect, tls, domain_age, reputation) = tokio::join!(
            self.intel.check_redirect(url),
            self.intel.probe_tls(&domain),
            self.intel.domain_age(&domain),
            self.intel.domain_reputation(&domain),
        );

        UrlSignals {
            redirect,
            tls,
            domain_age,
            reputation,
        }
    }

    pub async fn analyze(&self, url: &str) -> UrlReport {
        let signals = self.gather(url).await;
        score_url(&self.rules, &self.thresholds, url, signals)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedAnalysis {
    pub header_analysis: HeaderAnalysis,
    pub url_analysis: Vec<UrlReport>,
    pub content_score: u32,
    pub content_reasons: Vec<String>,
    pub total_risk_score: u32,
    pub risk_level: RiskLevel,
    pub flagged: bool,
    pub analyzed_at: DateTime<Utc>,
}

/// Result of scoring a pasted or file-based raw message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReport {
    pub from: String,
    pub subject: String,
    pub scores: Scores,
    #[serde(flatten)]
    pub analysis: DetailedAnalysis,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub analyzed: usize,
    pub failed: usize,
}

/// Split a raw message at the first blank line.
///
/// Text with no parseable header block is treated as body only.
pub fn split_raw_message(raw: &str) -> (&str, &str) {
    let split = raw
        .find("\r\n\r\n")
        .map(|i| (i, 4))
        .into_iter()
        .chain(raw.find("\n\n").map(|i| (i, 2)))
        .min_by_key(|(i, _)| *i);

    match split {
        Some((i, sep)) if !parse_headers(&raw[..i]).is_empty() => (&raw[..i], &raw[i + sep..]),
        _ => ("", raw),
    }
}

#[derive(Clone)]
pub struct EmailAnalyzer {
    db: Database,
    headers: Arc<HeaderAnalyzer>,
    content: Arc<ContentClassifier>,
    urls: UrlAnalyzer,
    scoring: ScoringConfig,
    /// Shared by every clone so concurrent analyses stay within one lookup budget
    lookups: Arc<Semaphore>,
    max_concurrent: usize,
    batch_size: usize,
}

impl EmailAnalyzer {
    pub fn new(
        db: Database,
        intel: Arc<dyn ThreatIntel>,
        scoring: ScoringConfig,
        max_concurrent: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            db,
            headers: Arc::new(HeaderAnalyzer::new(scoring.header.clone())),
            content: Arc::new(ContentClassifier::new(scoring.content.clone())),
            urls: UrlAnalyzer::new(intel, &scoring),
            scoring,
            lookups: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_concurrent: max_concurrent.max(1),
            batch_size: batch_size.max(1),
        }
    }

    pub fn url_analyzer(&self) -> &UrlAnalyzer {
        &self.urls
    }

    /// Reports in the same order as `urls`
    pub async fn url_reports(&self, urls: &[String]) -> Vec<UrlReport> {
        let jobs: Vec<_> = urls.iter().map(|url| {
            let analyzer = self.urls.clone();
            let lookups = self.lookups.clone();
            let url = url.clone();
            async move {
                // The semaphore is never closed
                let _permit = lookups.acquire_owned().await.ok();
                analyzer.analyze(&url).await
            }
        }).collect();

        stream::iter(jobs).buffered(self.max_concurrent).collect().await
    }

    /// Score headers, URLs and content of one message
    pub async fn evaluate(&self, raw_headers: &str, input: &ContentInput<'_>) -> DetailedAnalysis {
        let header_analysis = self.headers.analyze_raw(raw_headers);
        let verdict = self.content.classify(input);
        let url_analysis = self.url_reports(&extract_urls(input.body)).await;

        let url_scores: Vec<u32> = url_analysis.iter().map(|r| r.risk_score).collect();
        let total = aggregate(
            &self.scoring.weights,
            header_analysis.score,
            &url_scores,
            verdict.scores.total,
        );

        DetailedAnalysis {
            header_analysis,
            url_analysis,
            content_score: verdict.scores.total,
            content_reasons: verdict.reasons,
            total_risk_score: total,
            risk_level: self.scoring.email_thresholds.level(total),
            flagged: self.scoring.is_flagged(total),
            analyzed_at: Utc::now(),
        }
    }

    /// Score a raw message (headers, blank line, body) without storing anything
    pub async fn analyze_message(&self, raw: &str) -> MessageReport {
        let (header_text, body) = split_raw_message(raw);
        let headers = parse_headers(header_text);
        let from = headers.get("From").unwrap_or_default().to_string();
        let subject = headers.get("Subject").unwrap_or_default().to_string();
        let attachments: Vec<AttachmentInfo> = Vec::new();

        let input = ContentInput {
            from: &from,
            subject: &subject,
            body,
            attachments: &attachments,
        };
        let scores = self.content.classify(&input).scores;
        let analysis = self.evaluate(header_text, &input).await;

        MessageReport {
            from,
            subject,
            scores,
            analysis,
        }
    }

    async fn analyze_record(&self, email: &EmailRecord) -> Result<DetailedAnalysis> {
        let input = ContentInput {
            from: &email.from,
            subject: &email.subject,
            body: &email.body,
            attachments: &email.attachments,
        };
        let analysis = self.evaluate(&email.raw_headers, &input).await;

        self.db
            .save_detailed_analysis(
                &email.id,
                serde_json::to_value(&analysis)?,
                analysis.total_risk_score,
                analysis.risk_level,
                analysis.flagged,
                analysis.analyzed_at,
            )
            .await?;
        debug!(
            email_id = %email.id,
            total = analysis.total_risk_score,
            level = analysis.risk_level.as_str(),
            "Email analyzed"
        );

        Ok(analysis)
    }

    async fn owned_email(&self, email_id: &str, owner: Option<&str>) -> Result<EmailRecord> {
        self.db
            .find_email(email_id)
            .await?
            .filter(|email| owner.map_or(true, |o| email.user_id == o))
            .ok_or_else(|| PhishError::NotFound("Email".to_string()))
    }

    /// Analyze one stored email; `owner` restricts access to that user's emails
    pub async fn analyze_email(&self, email_id: &str, owner: Option<&str>) -> Result<DetailedAnalysis> {
        let email = self.owned_email(email_id, owner).await?;
        self.analyze_record(&email).await
    }

    /// Stored detailed analysis of an email
    pub async fn analysis_results(
        &self,
        email_id: &str,
        owner: Option<&str>,
    ) -> Result<serde_json::Value> {
        self.owned_email(email_id, owner)
            .await?
            .detailed_analysis
            .ok_or_else(|| PhishError::NotFound("Analysis".to_string()))
    }

    /// Analyze every email a user has, `batch_size` emails in flight at a time
    pub async fn analyze_all(&self, user_id: &str) -> Result<BatchSummary> {
        let emails = self.db.emails_for_user(user_id).await?;
        let mut summary = BatchSummary::default();

        let jobs = emails.into_iter().map(|email| {
            let analyzer = self.clone();
            async move {
                let result = analyzer.analyze_record(&email).await;
                (email.id, result)
            }
        });
        let mut results = stream::iter(jobs).buffer_unordered(self.batch_size);

        while let Some((email_id, result)) = results.next().await {
            match result {
                Ok(_) => summary.analyzed += 1,
                Err(e) => {
                    warn!(email_id = %email_id, error = %e, "Analysis failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            user_id,
            analyzed = summary.analyzed,
            failed = summary.failed,
            "Batch analysis complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::{
        DomainAge, DomainReputation, FileReputation, IpGeolocation, IpReputation, MockThreatIntel,
        OfflineIntel, RedirectInfo, Signal, TlsInfo,
    };
    use crate::models::{EmailStatus, GmailStatus, Role, User};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const RAW: &str = "From: PayPal Security <security@paypal.com>\r\n\
Reply-To: help@paypal-support.ru\r\n\
Subject: Urgent: verify your account\r\n\
\r\n\
Click here to verify your account https://bit.ly/xyz";

    fn offline_analyzer(db: Database) -> EmailAnalyzer {
        EmailAnalyzer::new(db, Arc::new(OfflineIntel), ScoringConfig::default(), 4, 2)
    }

    async fn seed_user(db: &Database) {
        db.create_user(User {
            id: "u1".to_string(),
            username: "carol".to_string(),
            email: "carol@example.com".to_string(),
            password_hash: "x".to_string(),
            role: Role::User,
            gmail_connected: false,
            gmail_status: GmailStatus::Disconnected,
            gmail_tokens: None,
            last_email_sync: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    fn email(id: &str, body: &str) -> EmailRecord {
        EmailRecord {
            id: id.to_string(),
            user_id: "u1".to_string(),
            message_id: format!("msg-{}", id),
            from: "security@paypal.com".to_string(),
            to: "carol@example.com".to_string(),
            subject: "Account alert".to_string(),
            date: None,
            body: body.to_string(),
            raw_headers: r#"[{"name":"From","value":"security@paypal.com"},{"name":"Reply-To","value":"x@evil.ru"}]"#.to_string(),
            attachments: vec![],
            urls: vec![],
            scores: Scores::default(),
            phishing_risk: RiskLevel::Low,
            flagged: false,
            status: EmailStatus::New,
            admin_note: None,
            actioned_by: None,
            analyzed_at: Utc::now(),
            detailed_analysis: None,
        }
    }

    #[test]
    fn test_split_raw_message() {
        let (headers, body) = split_raw_message(RAW);
        assert!(headers.starts_with("From:"));
        assert!(body.starts_with("Click here"));

        let (headers, body) = split_raw_message("just a body\n\nwith paragraphs");
        assert_eq!(headers, "");
        assert_eq!(body, "just a body\n\nwith paragraphs");
    }

    #[tokio::test]
    async fn test_gather_reports_every_lookup() {
        let mut intel = MockThreatIntel::new();
        intel.expect_check_redirect().returning(|url| {
            Ok(RedirectInfo {
                original_url: url.to_string(),
                final_url: "https://login-paypal.ru/".to_string(),
                original_domain: Some("bit.ly".to_string()),
                final_domain: Some("login-paypal.ru".to_string()),
                redirects: true,
            })
        });
        intel.expect_probe_tls().returning(|_| {
            Ok(TlsInfo {
                valid: false,
                error: Some("self-signed".to_string()),
            })
        });
        intel.expect_domain_age().returning(|_| {
            Ok(DomainAge {
                age_days: 3,
                creation_date: Utc::now() - Duration::days(3),
                registrar: None,
            })
        });
        intel
            .expect_domain_reputation()
            .returning(|_| Err(Unavailable::new("virustotal", "no API key")));

        let analyzer = UrlAnalyzer::new(Arc::new(intel), &ScoringConfig::default());
        let report = analyzer.analyze("https://bit.ly/xyz").await;

        // shortener 20 + redirect 15 + tls 25 + young domain 20
        assert_eq!(report.risk_score, 80);
        assert_eq!(report.risk_level, RiskLevel::Critical);
        assert_eq!(report.expanded_url.as_deref(), Some("https://login-paypal.ru/"));
        assert_eq!(report.unavailable.len(), 1);
        assert_eq!(report.unavailable[0].source, "virustotal");
    }

    #[tokio::test]
    async fn test_invalid_url_skips_lookups() {
        let intel = MockThreatIntel::new();
        let analyzer = UrlAnalyzer::new(Arc::new(intel), &ScoringConfig::default());
        let signals = analyzer.gather("not a url").await;
        assert!(signals.redirect.is_err());
        assert!(signals.reputation.is_err());
    }

    #[tokio::test]
    async fn test_analyze_message_offline() {
        let analyzer = offline_analyzer(Database::open_in_memory().unwrap());
        let report = analyzer.analyze_message(RAW).await;

        assert_eq!(report.subject, "Urgent: verify your account");
        assert!(report
            .analysis
            .header_analysis
            .anomalies
            .iter()
            .any(|a| a.kind == "reply_to_mismatch"));
        assert_eq!(report.analysis.url_analysis.len(), 1);
        assert_eq!(report.analysis.url_analysis[0].risk_score, 20);
        assert!(report.analysis.total_risk_score <= 100);
        assert_eq!(
            report.analysis.risk_level,
            ScoringConfig::default()
                .email_thresholds
                .level(report.analysis.total_risk_score)
        );
    }

    #[tokio::test]
    async fn test_analyze_email_persists_results() {
        let db = Database::open_in_memory().unwrap();
        seed_user(&db).await;
        db.insert_email(email("e1", "Please pay https://bit.ly/a and https://example.com"))
            .await
            .unwrap();
        let analyzer = offline_analyzer(db.clone());

        assert!(matches!(
            analyzer.analysis_results("e1", Some("u1")).await,
            Err(PhishError::NotFound(_))
        ));

        let analysis = analyzer.analyze_email("e1", Some("u1")).await.unwrap();
        assert_eq!(analysis.url_analysis.len(), 2);

        let stored = db.find_email("e1").await.unwrap().unwrap();
        assert_eq!(stored.scores.total, analysis.total_risk_score);
        assert_eq!(stored.phishing_risk, analysis.risk_level);

        let results = analyzer.analysis_results("e1", Some("u1")).await.unwrap();
        assert_eq!(results["totalRiskScore"], analysis.total_risk_score);
        assert!(results["headerAnalysis"].is_object());
    }

    #[tokio::test]
    async fn test_other_users_email_is_hidden() {
        let db = Database::open_in_memory().unwrap();
        seed_user(&db).await;
        db.insert_email(email("e1", "hello")).await.unwrap();
        let analyzer = offline_analyzer(db);

        assert!(matches!(
            analyzer.analyze_email("e1", Some("someone-else")).await,
            Err(PhishError::NotFound(_))
        ));
        assert!(analyzer.analyze_email("e1", None).await.is_ok());
    }

    /// Tracks how many redirect checks run at once
    #[derive(Default)]
    struct CountingIntel {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ThreatIntel for CountingIntel {
        async fn check_redirect(&self, _url: &str) -> Signal<RedirectInfo> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Err(Unavailable::new("redirect", "counted"))
        }

        async fn probe_tls(&self, domain: &str) -> Signal<TlsInfo> {
            OfflineIntel.probe_tls(domain).await
        }

        async fn domain_age(&self, domain: &str) -> Signal<DomainAge> {
            OfflineIntel.domain_age(domain).await
        }

        async fn domain_reputation(&self, domain: &str) -> Signal<DomainReputation> {
            OfflineIntel.domain_reputation(domain).await
        }

        async fn ip_geolocation(&self, ip: Ipv4Addr) -> Signal<IpGeolocation> {
            OfflineIntel.ip_geolocation(ip).await
        }

        async fn ip_reputation(&self, ip: Ipv4Addr) -> Signal<IpReputation> {
            OfflineIntel.ip_reputation(ip).await
        }

        async fn reverse_dns(&self, ip: Ipv4Addr) -> Signal<Vec<String>> {
            OfflineIntel.reverse_dns(ip).await
        }

        async fn file_reputation(&self, sha256: &str) -> Signal<FileReputation> {
            OfflineIntel.file_reputation(sha256).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batch_analysis_respects_lookup_limit() {
        let db = Database::open_in_memory().unwrap();
        seed_user(&db).await;
        for i in 0..6 {
            let body = format!("https://a{0}.example/x https://b{0}.example/y https://c{0}.example/z", i);
            db.insert_email(email(&format!("e{}", i), &body)).await.unwrap();
        }

        let intel = Arc::new(CountingIntel::default());
        let analyzer = EmailAnalyzer::new(db, intel.clone(), ScoringConfig::default(), 2, 3);
        let summary = analyzer.analyze_all("u1").await.unwrap();

        assert_eq!(summary, BatchSummary { analyzed: 6, failed: 0 });
        assert!(intel.peak.load(Ordering::SeqCst) <= 2);
        assert!(intel.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_url_reports_keep_input_order() {
        let analyzer = offline_analyzer(Database::open_in_memory().unwrap());
        let urls = vec![
            "https://bit.ly/a".to_string(),
            "https://example.com/b".to_string(),
            "https://tinyurl.com/c".to_string(),
        ];
        let reports = analyzer.url_reports(&urls).await;
        let seen: Vec<&str> = reports.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(seen, vec!["https://bit.ly/a", "https://example.com/b", "https://tinyurl.com/c"]);
    }

    #[tokio::test]
    async fn test_analyze_all_in_batches() {
        let db = Database::open_in_memory().unwrap();
        seed_user(&db).await;
        for i in 0..5 {
            db.insert_email(email(&format!("e{}", i), "body")).await.unwrap();
        }
        let summary = offline_analyzer(db.clone()).analyze_all("u1").await.unwrap();
        assert_eq!(summary, BatchSummary { analyzed: 5, failed: 0 });

        let emails = db.emails_for_user("u1").await.unwrap();
        assert!(emails.iter().all(|e| e.detailed_analysis.is_some()));
    }
}
