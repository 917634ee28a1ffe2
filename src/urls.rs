//! URL extraction and per-URL risk scoring.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::intel::{DomainAge, DomainReputation, RedirectInfo, Signal, TlsInfo, Unavailable};
use crate::models::RiskLevel;
use crate::scoring::{clamp_score, RiskThresholds, UrlRules};

static URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(https?://[^\s"'<>]+)|(www\.[^\s"'<>]+)"#).unwrap());

/// Link shortening services
pub const SHORTENER_DOMAINS: &[&str] = &[
    "bit.ly",
    "tinyurl.com",
    "goo.gl",
    "t.co",
    "ow.ly",
    "is.gd",
    "buff.ly",
    "rebrand.ly",
    "cutt.ly",
    "tiny.cc",
    "bl.ink",
    "shorturl.at",
    "rb.gy",
    "tr.im",
    "x.co",
];

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '>'];

/// Extract links from free text.
///
/// Bare `www.` links are normalised to `https://`, trailing sentence
/// punctuation is dropped and duplicates are removed keeping the first
/// occurrence.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for m in URL_REGEX.find_iter(text) {
        let trimmed = m.as_str().trim_end_matches(TRAILING_PUNCTUATION);
        let Some(url) = normalise(trimmed) else {
            continue;
        };
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }

    urls
}

fn normalise(candidate: &str) -> Option<String> {
    let lower = candidate.to_ascii_lowercase();
    for scheme in ["https://", "http://"] {
        if lower.starts_with(scheme) {
            return (candidate.len() > scheme.len()).then(|| candidate.to_string());
        }
    }
    if lower.starts_with("www.") && candidate.len() > 4 {
        return Some(format!("https://{}", candidate));
    }
    None
}

/// Host of a URL without `www.` or port, lower-cased
pub fn extract_domain(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url)
        .or_else(|_| url::Url::parse(&format!("https://{}", url)))
        .ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    (!host.is_empty()).then_some(host)
}

pub fn is_shortener(domain: &str) -> bool {
    let domain = domain.to_lowercase();
    SHORTENER_DOMAINS.contains(&domain.as_str())
}

/// External lookups gathered for one URL
#[derive(Debug, Clone)]
pub struct UrlSignals {
    pub redirect: Signal<RedirectInfo>,
    pub tls: Signal<TlsInfo>,
    pub domain_age: Signal<DomainAge>,
    pub reputation: Signal<DomainReputation>,
}

impl UrlSignals {
    /// Every lookup skipped, used when no network access is allowed
    pub fn offline() -> Self {
        let off = |source: &str| Unavailable::new(source, "offline mode");
        Self {
            redirect: Err(off("redirect")),
            tls: Err(off("tls")),
            domain_age: Err(off("whois")),
            reputation: Err(off("virustotal")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlReport {
    pub url: String,
    pub domain: Option<String>,
    pub is_url_shortener: bool,
    pub expanded_url: Option<String>,
    pub redirect_info: Option<RedirectInfo>,
    pub ssl_info: Option<TlsInfo>,
    pub domain_age_info: Option<DomainAge>,
    pub reputation_info: Option<DomainReputation>,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub reasons: Vec<String>,
    pub unavailable: Vec<Unavailable>,
}

/// Score one URL from its signals; unavailable lookups add nothing but are reported
pub fn score_url(
    rules: &UrlRules,
    thresholds: &RiskThresholds,
    url: &str,
    signals: UrlSignals,
) -> UrlReport {
    let domain = extract_domain(url);
    let shortener = domain.as_deref().map(is_shortener).unwrap_or(false);

    let mut raw: i64 = 0;
    let mut reasons = Vec::new();
    let mut unavailable = Vec::new();

    if shortener {
        raw += rules.shortener as i64;
        reasons.push("URL shortener".to_string());
    }

    let redirect_info = take(signals.redirect, &mut unavailable);
    if let Some(info) = &redirect_info {
        if info.redirects {
            raw += rules.redirect_domain_change as i64;
            reasons.push(format!(
                "Redirects to a different domain ({})",
                info.final_domain.as_deref().unwrap_or("unknown")
            ));
        }
    }

    let ssl_info = take(signals.tls, &mut unavailable);
    if let Some(info) = &ssl_info {
        if !info.valid {
            raw += rules.invalid_tls as i64;
            reasons.push(format!(
                "Invalid TLS certificate{}",
                info.error
                    .as_deref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ));
        }
    }

    let domain_age_info = take(signals.domain_age, &mut unavailable);
    if let Some(age) = &domain_age_info {
        if age.age_days < rules.young_domain_days {
            raw += rules.young_domain as i64;
            reasons.push(format!("Domain registered {} days ago", age.age_days));
        }
    }

    let reputation_info = take(signals.reputation, &mut unavailable);
    if let Some(rep) = &reputation_info {
        if rep.reputation < 0 {
            raw += rules.negative_reputation as i64;
            reasons.push(format!("Negative domain reputation ({})", rep.reputation));
        }
        if rep.malicious > 0 {
            raw += rep.malicious as i64 * rules.per_malicious_engine as i64;
            reasons.push(format!("Flagged malicious by {} engines", rep.malicious));
        }
    }

    let risk_score = clamp_score(raw);
    let expanded_url = if shortener {
        redirect_info.as_ref().map(|r| r.final_url.clone())
    } else {
        None
    };

    UrlReport {
        url: url.to_string(),
        domain,
        is_url_shortener: shortener,
        expanded_url,
        redirect_info,
        ssl_info,
        domain_age_info,
        reputation_info,
        risk_score,
        risk_level: thresholds.level(risk_score),
        reasons,
        unavailable,
    }
}

fn take<T>(signal: Signal<T>, unavailable: &mut Vec<Unavailable>) -> Option<T> {
    match signal {
        Ok(value) => Some(value),
        Err(reason) => {
            unavailable.push(reason);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_extract_urls_dedups_and_normalises() {
        let text = "Visit https://example.com/login, or www.example.org. Again: https://example.com/login";
        assert_eq!(
            extract_urls(text),
            vec![
                "https://example.com/login".to_string(),
                "https://www.example.org".to_string()
            ]
        );
    }

    #[test]
    fn test_extract_urls_stops_at_html_delimiters() {
        let html = r#"<a href="http://bit.ly/abc">click</a>"#;
        assert_eq!(extract_urls(html), vec!["http://bit.ly/abc".to_string()]);
    }

    #[test]
    fn test_extract_urls_ignores_bare_scheme() {
        assert!(extract_urls("broken link https://. here").is_empty());
        assert!(extract_urls("no links at all").is_empty());
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://www.Example.com:8443/a?b=c").as_deref(), Some("example.com"));
        assert_eq!(extract_domain("bit.ly/xyz").as_deref(), Some("bit.ly"));
        assert_eq!(extract_domain(""), None);
    }

    #[test]
    fn test_is_shortener() {
        assert!(is_shortener("bit.ly"));
        assert!(is_shortener("TinyURL.com"));
        assert!(!is_shortener("example.com"));
    }

    #[test]
    fn test_score_url_offline_only_counts_shortener() {
        let report = score_url(
            &UrlRules::default(),
            &RiskThresholds::url_default(),
            "https://bit.ly/abc",
            UrlSignals::offline(),
        );
        assert_eq!(report.risk_score, 20);
        assert_eq!(report.risk_level, RiskLevel::Medium);
        assert_eq!(report.unavailable.len(), 4);
    }

    #[test]
    fn test_score_url_all_signals() {
        let signals = UrlSignals {
            redirect: Ok(RedirectInfo {
                original_url: "https://bit.ly/abc".to_string(),
                final_url: "https://evil.example/login".to_string(),
                original_domain: Some("bit.ly".to_string()),
                final_domain: Some("evil.example".to_string()),
                redirects: true,
            }),
            tls: Ok(TlsInfo {
                valid: false,
                error: Some("certificate expired".to_string()),
            }),
            domain_age: Ok(DomainAge {
                age_days: 3,
                creation_date: Utc::now(),
                registrar: None,
            }),
            reputation: Ok(DomainReputation {
                reputation: -10,
                malicious: 4,
                suspicious: 0,
                harmless: 10,
            }),
        };
        let report = score_url(
            &UrlRules::default(),
            &RiskThresholds::url_default(),
            "https://bit.ly/abc",
            signals,
        );
        // 20 + 15 + 25 + 20 + 25 + 20, clamped
        assert_eq!(report.risk_score, 100);
        assert_eq!(report.risk_level, RiskLevel::Critical);
        assert_eq!(report.expanded_url.as_deref(), Some("https://evil.example/login"));
        assert!(report.unavailable.is_empty());
    }

    #[test]
    fn test_benign_signals_score_zero() {
        let signals = UrlSignals {
            redirect: Ok(RedirectInfo {
                original_url: "https://example.com".to_string(),
                final_url: "https://example.com/".to_string(),
                original_domain: Some("example.com".to_string()),
                final_domain: Some("example.com".to_string()),
                redirects: false,
            }),
            tls: Ok(TlsInfo {
                valid: true,
                error: None,
            }),
            domain_age: Ok(DomainAge {
                age_days: 9000,
                creation_date: Utc::now(),
                registrar: Some("MarkMonitor".to_string()),
            }),
            reputation: Ok(DomainReputation {
                reputation: 5,
                malicious: 0,
                suspicious: 0,
                harmless: 70,
            }),
        };
        let report = score_url(
            &UrlRules::default(),
            &RiskThresholds::url_default(),
            "https://example.com",
            signals,
        );
        assert_eq!(report.risk_score, 0);
        assert_eq!(report.risk_level, RiskLevel::Low);
        assert!(report.reasons.is_empty());
    }
}
