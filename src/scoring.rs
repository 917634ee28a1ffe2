//! Declarative scoring rules and the single evaluator that consumes them.
//!
//! Every coefficient used by the header, URL and content scorers lives in
//! [`ScoringConfig`]. [`aggregate`] combines per-category scores into the
//! final total and [`RiskThresholds::level`] buckets it.

use serde::{Deserialize, Serialize};

use crate::error::{PhishError, Result};
use crate::models::RiskLevel;

/// Upper bound of every score produced by this crate
pub const MAX_SCORE: u32 = 100;

/// Clamp a signed accumulator into `0..=100`
pub fn clamp_score(raw: i64) -> u32 {
    raw.clamp(0, MAX_SCORE as i64) as u32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub header: HeaderRules,
    #[serde(default)]
    pub urls: UrlRules,
    #[serde(default)]
    pub content: ContentRules,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default = "RiskThresholds::email_default")]
    pub email_thresholds: RiskThresholds,
    #[serde(default = "RiskThresholds::url_default")]
    pub url_thresholds: RiskThresholds,
    #[serde(default = "default_flag_threshold")]
    pub flag_threshold: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            header: HeaderRules::default(),
            urls: UrlRules::default(),
            content: ContentRules::default(),
            weights: Weights::default(),
            email_thresholds: RiskThresholds::email_default(),
            url_thresholds: RiskThresholds::url_default(),
            flag_threshold: default_flag_threshold(),
        }
    }
}

fn default_flag_threshold() -> u32 {
    50
}

/// Points added by each header anomaly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRules {
    #[serde(default = "default_reply_to_mismatch")]
    pub reply_to_mismatch: u32,
    #[serde(default = "default_return_path_mismatch")]
    pub return_path_mismatch: u32,
    #[serde(default = "default_missing_sender_route")]
    pub missing_sender_route: u32,
    #[serde(default = "default_bad_relay")]
    pub bad_relay: u32,
    #[serde(default = "default_excessive_hops")]
    pub excessive_hops: u32,
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    #[serde(default = "default_route_inconsistency")]
    pub route_inconsistency: u32,
    #[serde(default = "default_timestamp_regression")]
    pub timestamp_regression: u32,
    #[serde(default = "default_bad_relays")]
    pub bad_relays: Vec<String>,
}

impl Default for HeaderRules {
    fn default() -> Self {
        Self {
            reply_to_mismatch: default_reply_to_mismatch(),
            return_path_mismatch: default_return_path_mismatch(),
            missing_sender_route: default_missing_sender_route(),
            bad_relay: default_bad_relay(),
            excessive_hops: default_excessive_hops(),
            max_hops: default_max_hops(),
            route_inconsistency: default_route_inconsistency(),
            timestamp_regression: default_timestamp_regression(),
            bad_relays: default_bad_relays(),
        }
    }
}

fn default_reply_to_mismatch() -> u32 {
    25
}

fn default_return_path_mismatch() -> u32 {
    15
}

fn default_missing_sender_route() -> u32 {
    10
}

fn default_bad_relay() -> u32 {
    30
}

fn default_excessive_hops() -> u32 {
    20
}

fn default_max_hops() -> usize {
    15
}

fn default_route_inconsistency() -> u32 {
    15
}

fn default_timestamp_regression() -> u32 {
    20
}

fn default_bad_relays() -> Vec<String> {
    vec![
        "spam-relay".to_string(),
        "bulk-mail".to_string(),
        "mass-mailer".to_string(),
    ]
}

/// Points added by each URL signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRules {
    #[serde(default = "default_shortener")]
    pub shortener: u32,
    #[serde(default = "default_redirect_domain_change")]
    pub redirect_domain_change: u32,
    #[serde(default = "default_invalid_tls")]
    pub invalid_tls: u32,
    #[serde(default = "default_young_domain")]
    pub young_domain: u32,
    #[serde(default = "default_young_domain_days")]
    pub young_domain_days: i64,
    #[serde(default = "default_negative_reputation")]
    pub negative_reputation: u32,
    #[serde(default = "default_per_malicious_engine")]
    pub per_malicious_engine: u32,
}

impl Default for UrlRules {
    fn default() -> Self {
        Self {
            shortener: default_shortener(),
            redirect_domain_change: default_redirect_domain_change(),
            invalid_tls: default_invalid_tls(),
            young_domain: default_young_domain(),
            young_domain_days: default_young_domain_days(),
            negative_reputation: default_negative_reputation(),
            per_malicious_engine: default_per_malicious_engine(),
        }
    }
}

fn default_shortener() -> u32 {
    20
}

fn default_redirect_domain_change() -> u32 {
    15
}

fn default_invalid_tls() -> u32 {
    25
}

fn default_young_domain() -> u32 {
    20
}

fn default_young_domain_days() -> i64 {
    30
}

fn default_negative_reputation() -> u32 {
    25
}

fn default_per_malicious_engine() -> u32 {
    5
}

/// Points added by the fetch-time content classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRules {
    #[serde(default = "default_noreply_sender")]
    pub noreply_sender: u32,
    #[serde(default = "default_sensitive_sender")]
    pub sensitive_sender: u32,
    #[serde(default = "default_urgent_language")]
    pub urgent_language: u32,
    #[serde(default = "default_financial_terms")]
    pub financial_terms: u32,
    #[serde(default = "default_action_request")]
    pub action_request: u32,
    #[serde(default = "default_alarming_subject")]
    pub alarming_subject: u32,
    #[serde(default = "default_risky_attachment")]
    pub risky_attachment: u32,
    #[serde(default = "default_risky_extensions")]
    pub risky_extensions: Vec<String>,
}

impl Default for ContentRules {
    fn default() -> Self {
        Self {
            noreply_sender: default_noreply_sender(),
            sensitive_sender: default_sensitive_sender(),
            urgent_language: default_urgent_language(),
            financial_terms: default_financial_terms(),
            action_request: default_action_request(),
            alarming_subject: default_alarming_subject(),
            risky_attachment: default_risky_attachment(),
            risky_extensions: default_risky_extensions(),
        }
    }
}

fn default_noreply_sender() -> u32 {
    5
}

fn default_sensitive_sender() -> u32 {
    10
}

fn default_urgent_language() -> u32 {
    10
}

fn default_financial_terms() -> u32 {
    15
}

fn default_action_request() -> u32 {
    20
}

fn default_alarming_subject() -> u32 {
    15
}

fn default_risky_attachment() -> u32 {
    25
}

fn default_risky_extensions() -> Vec<String> {
    vec![
        ".exe".to_string(),
        ".zip".to_string(),
        ".bat".to_string(),
        ".js".to_string(),
    ]
}

/// Aggregate weights for the final total
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Weights {
    #[serde(default = "default_header_weight")]
    pub header: f64,
    #[serde(default = "default_urls_weight")]
    pub urls: f64,
    #[serde(default = "default_content_weight")]
    pub content: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            header: default_header_weight(),
            urls: default_urls_weight(),
            content: default_content_weight(),
        }
    }
}

fn default_header_weight() -> f64 {
    0.3
}

fn default_urls_weight() -> f64 {
    0.4
}

fn default_content_weight() -> f64 {
    0.3
}

/// Lower bounds of the Medium, High and Critical buckets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskThresholds {
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl RiskThresholds {
    pub fn email_default() -> Self {
        Self {
            medium: 30,
            high: 50,
            critical: 70,
        }
    }

    pub fn url_default() -> Self {
        Self {
            medium: 20,
            high: 40,
            critical: 60,
        }
    }

    /// Map a score onto its bucket; every value of `0..=100` lands in exactly one
    pub fn level(&self, score: u32) -> RiskLevel {
        if score < self.medium {
            RiskLevel::Low
        } else if score < self.high {
            RiskLevel::Medium
        } else if score < self.critical {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        let increasing = 0 < self.medium && self.medium < self.high && self.high < self.critical;
        if !increasing || self.critical > MAX_SCORE {
            return Err(PhishError::ConfigError(format!(
                "scoring.{} must satisfy 0 < medium < high < critical <= 100 (got {}/{}/{})",
                name, self.medium, self.high, self.critical
            )));
        }
        Ok(())
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        for (name, value) in [("header", w.header), ("urls", w.urls), ("content", w.content)] {
            if !value.is_finite() || value < 0.0 {
                return Err(PhishError::ConfigError(format!(
                    "scoring.weights.{} must be a non-negative number",
                    name
                )));
            }
        }

        self.email_thresholds.validate("email_thresholds")?;
        self.url_thresholds.validate("url_thresholds")?;

        if self.flag_threshold > MAX_SCORE {
            return Err(PhishError::ConfigError(
                "scoring.flag_threshold cannot exceed 100".to_string(),
            ));
        }
        if self.header.max_hops == 0 {
            return Err(PhishError::ConfigError(
                "scoring.header.max_hops must be at least 1".to_string(),
            ));
        }
        if self.content.risky_extensions.iter().any(|e| !e.starts_with('.')) {
            return Err(PhishError::ConfigError(
                "scoring.content.risky_extensions entries must start with '.'".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether a total crosses the flag line
    pub fn is_flagged(&self, total: u32) -> bool {
        total > self.flag_threshold
    }
}

/// Mean of per-URL scores, 0 when there are none
pub fn average(scores: &[u32]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().map(|&s| s as f64).sum::<f64>() / scores.len() as f64
}

/// Weighted total of header, URL and content scores, clamped to `0..=100`
pub fn aggregate(weights: &Weights, header: u32, url_scores: &[u32], content: u32) -> u32 {
    let raw = header as f64 * weights.header
        + average(url_scores) * weights.urls
        + content as f64 * weights.content;
    clamp_score(raw.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_score_bounds() {
        assert_eq!(clamp_score(-15), 0);
        assert_eq!(clamp_score(42), 42);
        assert_eq!(clamp_score(250), 100);
    }

    #[test]
    fn test_email_bucket_edges() {
        let t = RiskThresholds::email_default();
        assert_eq!(t.level(0), RiskLevel::Low);
        assert_eq!(t.level(29), RiskLevel::Low);
        assert_eq!(t.level(30), RiskLevel::Medium);
        assert_eq!(t.level(49), RiskLevel::Medium);
        assert_eq!(t.level(50), RiskLevel::High);
        assert_eq!(t.level(69), RiskLevel::High);
        assert_eq!(t.level(70), RiskLevel::Critical);
        assert_eq!(t.level(100), RiskLevel::Critical);
    }

    #[test]
    fn test_url_bucket_edges() {
        let t = RiskThresholds::url_default();
        assert_eq!(t.level(19), RiskLevel::Low);
        assert_eq!(t.level(20), RiskLevel::Medium);
        assert_eq!(t.level(40), RiskLevel::High);
        assert_eq!(t.level(60), RiskLevel::Critical);
    }

    #[test]
    fn test_aggregate_uses_weights() {
        let w = Weights::default();
        // 40*0.3 + 50*0.4 + 20*0.3 = 12 + 20 + 6
        assert_eq!(aggregate(&w, 40, &[30, 70], 20), 38);
    }

    #[test]
    fn test_aggregate_without_urls() {
        let w = Weights::default();
        assert_eq!(aggregate(&w, 100, &[], 100), 60);
    }

    #[test]
    fn test_aggregate_clamps_heavy_weights() {
        let w = Weights {
            header: 2.0,
            urls: 2.0,
            content: 2.0,
        };
        assert_eq!(aggregate(&w, 100, &[100], 100), 100);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(RiskThresholds::email_default().validate("t").is_ok());
        let bad = RiskThresholds {
            medium: 50,
            high: 50,
            critical: 70,
        };
        assert!(bad.validate("t").is_err());
        let over = RiskThresholds {
            medium: 10,
            high: 50,
            critical: 101,
        };
        assert!(over.validate("t").is_err());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut config = ScoringConfig::default();
        config.weights.urls = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flag_is_strictly_above_threshold() {
        let config = ScoringConfig::default();
        assert!(!config.is_flagged(50));
        assert!(config.is_flagged(51));
    }
}
