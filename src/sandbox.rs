//! URL sandbox: submitted URLs become `pending` records and a background
//! worker drives each one through `processing` to `completed` or `failed`.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::UrlAnalyzer;
use crate::error::{PhishError, Result};
use crate::models::{AnalysisStatus, UrlAnalysis};
use crate::store::Database;
use crate::urls::{extract_domain, extract_urls, UrlReport};

/// Submission side of the sandbox; cheap to clone
#[derive(Clone)]
pub struct Sandbox {
    db: Database,
    queue: mpsc::Sender<String>,
}

impl Sandbox {
    /// Start the worker task and return the handle used to submit jobs
    pub fn spawn(
        db: Database,
        analyzer: UrlAnalyzer,
        queue_size: usize,
        job_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let worker = Worker {
            db: db.clone(),
            analyzer,
            job_timeout,
        };
        let handle = tokio::spawn(worker.run(rx));
        (Self { db, queue: tx }, handle)
    }

    /// Queue one URL for analysis
    pub async fn submit_url(
        &self,
        url: &str,
        submitted_by: &str,
        email_id: Option<String>,
    ) -> Result<UrlAnalysis> {
        let url = url.trim();
        let is_web = url.starts_with("http://") || url.starts_with("https://");
        if !is_web || extract_domain(url).is_none() {
            return Err(PhishError::BadRequest("A valid http(s) URL is required".to_string()));
        }

        let now = Utc::now();
        let record = self
            .db
            .insert_url_analysis(UrlAnalysis {
                id: Uuid::new_v4().to_string(),
                url: url.to_string(),
                email_id,
                submitted_by: submitted_by.to_string(),
                status: AnalysisStatus::Pending,
                risk_score: 0,
                reasons: Vec::new(),
                processing_started: None,
                completed_at: None,
                failed_at: None,
                error: None,
                analysis_result: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        if self.queue.send(record.id.clone()).await.is_err() {
            warn!(id = %record.id, "Sandbox worker is not running");
            self.db
                .fail_url_analysis(&record.id, "Sandbox worker is not running".to_string())
                .await?;
            return Err(PhishError::ServerError {
                status: 503,
                message: "Sandbox worker is not running".to_string(),
            });
        }

        debug!(id = %record.id, url = %record.url, "Queued URL for sandbox analysis");
        Ok(record)
    }

    /// Queue every URL of a stored email; `owner` restricts to that user's emails
    pub async fn submit_email(
        &self,
        email_id: &str,
        owner: Option<&str>,
        submitted_by: &str,
    ) -> Result<Vec<UrlAnalysis>> {
        let email = self
            .db
            .find_email(email_id)
            .await?
            .filter(|email| owner.map_or(true, |o| email.user_id == o))
            .ok_or_else(|| PhishError::NotFound("Email".to_string()))?;

        let urls: Vec<String> = if email.urls.is_empty() {
            extract_urls(&email.body)
        } else {
            email.urls.into_iter().map(|entry| entry.url).collect()
        };

        let mut records = Vec::with_capacity(urls.len());
        for url in urls {
            match self.submit_url(&url, submitted_by, Some(email.id.clone())).await {
                Ok(record) => records.push(record),
                Err(PhishError::BadRequest(_)) => debug!(%url, "Skipping non-web link"),
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// One record; `owner` restricts to that user's submissions
    pub async fn get(&self, id: &str, owner: Option<&str>) -> Result<UrlAnalysis> {
        self.db
            .find_url_analysis(id)
            .await?
            .filter(|record| owner.map_or(true, |o| record.submitted_by == o))
            .ok_or_else(|| PhishError::NotFound("URL analysis".to_string()))
    }

    pub async fn list(&self, submitted_by: Option<String>) -> Result<Vec<UrlAnalysis>> {
        self.db.list_url_analyses(submitted_by).await
    }
}

struct Worker {
    db: Database,
    analyzer: UrlAnalyzer,
    job_timeout: Duration,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<String>) {
        info!("Sandbox worker started");
        while let Some(id) = rx.recv().await {
            if let Err(e) = self.process(&id).await {
                error!(%id, error = %e, "Sandbox job could not be recorded");
            }
        }
        info!("Sandbox worker stopped");
    }

    async fn process(&self, id: &str) -> Result<()> {
        let Some(record) = self.db.find_url_analysis(id).await? else {
            warn!(%id, "Sandbox job vanished before processing");
            return Ok(());
        };

        self.db.mark_url_processing(id).await?;

        let failure = match tokio::time::timeout(self.job_timeout, self.analyzer.analyze(&record.url)).await
        {
            Ok(report) => match self.complete(id, &report).await {
                Ok(()) => {
                    debug!(%id, score = report.risk_score, "Sandbox job completed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(%id, error = %e, "Sandbox result could not be stored");
                    format!("Failed to store analysis result: {}", e)
                }
            },
            Err(_) => {
                let message = format!("Analysis timed out after {:?}", self.job_timeout);
                warn!(%id, url = %record.url, "{}", message);
                message
            }
        };

        // A processing record must always reach a final state
        self.db.fail_url_analysis(id, failure).await
    }

    async fn complete(&self, id: &str, report: &UrlReport) -> Result<()> {
        let result = serde_json::to_value(report)?;
        self.db
            .complete_url_analysis(id, report.risk_score, report.reasons.clone(), result)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::{
        DomainAge, DomainReputation, FileReputation, IpGeolocation, IpReputation, OfflineIntel,
        RedirectInfo, Signal, ThreatIntel, TlsInfo, Unavailable,
    };
    use crate::scoring::ScoringConfig;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn analyzer(intel: Arc<dyn ThreatIntel>) -> UrlAnalyzer {
        UrlAnalyzer::new(intel, &ScoringConfig::default())
    }

    async fn wait_for_final(sandbox: &Sandbox, id: &str) -> UrlAnalysis {
        for _ in 0..200 {
            let record = sandbox.get(id, None).await.unwrap();
            if matches!(record.status, AnalysisStatus::Completed | AnalysisStatus::Failed) {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sandbox job {} never finished", id);
    }

    #[tokio::test]
    async fn test_job_moves_to_completed() {
        let db = Database::open_in_memory().unwrap();
        let (sandbox, _worker) =
            Sandbox::spawn(db, analyzer(Arc::new(OfflineIntel)), 8, Duration::from_secs(5));

        let record = sandbox.submit_url("https://bit.ly/abc", "u1", None).await.unwrap();
        assert_eq!(record.status, AnalysisStatus::Pending);

        let done = wait_for_final(&sandbox, &record.id).await;
        assert_eq!(done.status, AnalysisStatus::Completed);
        assert_eq!(done.risk_score, 20);
        assert!(done.processing_started.is_some());
        assert!(done.completed_at.is_some());
        assert!(done.analysis_result.is_some());
    }

    /// Redirect checks that never finish in time
    struct StalledIntel;

    #[async_trait]
    impl ThreatIntel for StalledIntel {
        async fn check_redirect(&self, _url: &str) -> Signal<RedirectInfo> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(Unavailable::new("redirect", "stalled"))
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

    #[tokio::test]
    async fn test_slow_lookup_fails_job() {
        let db = Database::open_in_memory().unwrap();
        let (sandbox, _worker) =
            Sandbox::spawn(db, analyzer(Arc::new(StalledIntel)), 8, Duration::from_millis(50));
        let record = sandbox.submit_url("https://example.com", "u1", None).await.unwrap();

        let done = wait_for_final(&sandbox, &record.id).await;
        assert_eq!(done.status, AnalysisStatus::Failed);
        assert!(done.error.unwrap().contains("timed out"));
        assert!(done.failed_at.is_some());
    }

    #[tokio::test]
    async fn test_unstorable_result_fails_job() {
        let db = Database::open_in_memory().unwrap();
        db.run(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_completion BEFORE UPDATE OF status ON url_analyses \
                 WHEN NEW.status = 'completed' BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let (sandbox, _worker) =
            Sandbox::spawn(db, analyzer(Arc::new(OfflineIntel)), 8, Duration::from_secs(5));
        let record = sandbox.submit_url("https://example.com", "u1", None).await.unwrap();

        let done = wait_for_final(&sandbox, &record.id).await;
        assert_eq!(done.status, AnalysisStatus::Failed);
        assert!(done.error.unwrap().contains("disk full"));
        assert!(done.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let db = Database::open_in_memory().unwrap();
        let (sandbox, _worker) =
            Sandbox::spawn(db, analyzer(Arc::new(OfflineIntel)), 8, Duration::from_secs(5));
        assert!(matches!(
            sandbox.submit_url("ftp://example.com", "u1", None).await,
            Err(PhishError::BadRequest(_))
        ));
        assert!(sandbox.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_users_job_hidden() {
        let db = Database::open_in_memory().unwrap();
        let (sandbox, _worker) =
            Sandbox::spawn(db, analyzer(Arc::new(OfflineIntel)), 8, Duration::from_secs(5));
        let record = sandbox.submit_url("https://example.com", "u1", None).await.unwrap();
        assert!(matches!(
            sandbox.get(&record.id, Some("u2")).await,
            Err(PhishError::NotFound(_))
        ));
    }
}
