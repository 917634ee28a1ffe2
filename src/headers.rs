//! Header parsing and anomaly detection.
//!
//! Accepts either the JSON `[{name, value}]` list stored for Gmail messages
//! or raw RFC 5322 header text, then walks the `Received` chain oldest hop
//! first.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::scoring::{clamp_score, HeaderRules};

static HOP_FROM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bfrom\s+([^\s()\[\];]+)").unwrap());
static HOP_BY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bby\s+([^\s()\[\];]+)").unwrap());
static ANY_IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").unwrap());

/// Ordered from most to least specific
static SENDER_IP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)from\s+\[?(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\]?").unwrap(),
        Regex::new(r"\((\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\)").unwrap(),
        Regex::new(r"\[(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\]").unwrap(),
    ]
});

static TRAILING_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\([^)]*\)\s*$").unwrap());

/// Allowed clock skew between consecutive hops
const HOP_SKEW_MINUTES: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// Header list preserving the original order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(pub Vec<HeaderField>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parse stored headers: a JSON `[{name, value}]` array or raw header text
pub fn parse_headers(raw: &str) -> Headers {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        if let Ok(fields) = serde_json::from_str::<Vec<HeaderField>>(trimmed) {
            return Headers(fields);
        }
    }

    let mut fields: Vec<HeaderField> = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = fields.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            fields.push(HeaderField {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }
    Headers(fields)
}

/// Domain part of an address header such as `Name <user@example.com>`
pub fn address_domain(value: &str) -> Option<String> {
    let address = match (value.find('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value,
    };
    let (_, domain) = address.rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('>').to_lowercase();
    (!domain.is_empty()).then_some(domain)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingHop {
    pub from: Option<String>,
    pub by: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub timestamp: Option<DateTime<Utc>>,
}

fn parse_hop(received: &str) -> RoutingHop {
    let capture = |re: &Regex| re.captures(received).map(|c| c[1].to_lowercase());
    let ip = ANY_IPV4
        .captures_iter(received)
        .find_map(|c| c[1].parse::<Ipv4Addr>().ok());
    let timestamp = received
        .rsplit_once(';')
        .and_then(|(_, date)| parse_received_date(date));

    RoutingHop {
        from: capture(&HOP_FROM),
        by: capture(&HOP_BY),
        ip,
        timestamp,
    }
}

fn parse_received_date(date: &str) -> Option<DateTime<Utc>> {
    let cleaned = TRAILING_COMMENT.replace(date.trim(), "");
    DateTime::parse_from_rfc2822(cleaned.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// `Received` hops, oldest first
pub fn routing_path(headers: &Headers) -> Vec<RoutingHop> {
    let mut received: Vec<&str> = headers.get_all("Received").collect();
    received.reverse();
    received.into_iter().map(parse_hop).collect()
}

/// Originating IPv4 address from the oldest `Received` hop
pub fn extract_sender_ip(headers: &Headers) -> Option<Ipv4Addr> {
    let mut received: Vec<&str> = headers.get_all("Received").collect();
    received.reverse();

    if let Some(first) = received.first() {
        for pattern in SENDER_IP_PATTERNS.iter() {
            if let Some(ip) = pattern
                .captures(first)
                .and_then(|c| c[1].parse::<Ipv4Addr>().ok())
            {
                return Some(ip);
            }
        }
    }

    received.iter().find_map(|header| {
        ANY_IPV4
            .captures_iter(header)
            .find_map(|c| c[1].parse::<Ipv4Addr>().ok())
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub severity: Severity,
    pub points: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderAnalysis {
    pub from: String,
    pub reply_to: String,
    pub return_path: String,
    pub message_id: String,
    pub authentication_results: String,
    pub spf: String,
    pub has_dkim_signature: bool,
    pub received_count: usize,
    pub sender_ip: Option<Ipv4Addr>,
    pub routing_path: Vec<RoutingHop>,
    pub anomalies: Vec<Anomaly>,
    pub score: u32,
    pub suspicious: bool,
}

pub struct HeaderAnalyzer {
    rules: HeaderRules,
}

impl HeaderAnalyzer {
    pub fn new(rules: HeaderRules) -> Self {
        Self { rules }
    }

    pub fn analyze_raw(&self, raw: &str) -> HeaderAnalysis {
        self.analyze(&parse_headers(raw))
    }

    pub fn analyze(&self, headers: &Headers) -> HeaderAnalysis {
        let text = |name: &str| headers.get(name).unwrap_or_default().to_string();
        let from = text("From");
        let reply_to = text("Reply-To");
        let return_path = text("Return-Path");
        let path = routing_path(headers);
        let from_domain = address_domain(&from);

        let mut anomalies = Vec::new();

        if let (Some(from_domain), Some(reply_domain)) = (&from_domain, address_domain(&reply_to)) {
            if *from_domain != reply_domain {
                anomalies.push(Anomaly {
                    kind: "reply_to_mismatch".to_string(),
                    description: "Reply-To domain does not match From domain".to_string(),
                    severity: Severity::High,
                    points: self.rules.reply_to_mismatch,
                });
            }
        }

        if let (Some(from_domain), Some(return_domain)) = (&from_domain, address_domain(&return_path)) {
            if *from_domain != return_domain {
                anomalies.push(Anomaly {
                    kind: "return_path_mismatch".to_string(),
                    description: "Return-Path domain does not match From domain".to_string(),
                    severity: Severity::Medium,
                    points: self.rules.return_path_mismatch,
                });
            }
        }

        if let Some(domain) = &from_domain {
            if !path.is_empty() && !sender_in_path(domain, &path) {
                anomalies.push(Anomaly {
                    kind: "sender_not_in_route".to_string(),
                    description: format!("Sender domain {} does not appear in the routing path", domain),
                    severity: Severity::Low,
                    points: self.rules.missing_sender_route,
                });
            }
        }

        if let Some(relay) = self.bad_relay(&path) {
            anomalies.push(Anomaly {
                kind: "known_bad_relay".to_string(),
                description: format!("Mail passed through known spam relay server {}", relay),
                severity: Severity::High,
                points: self.rules.bad_relay,
            });
        }

        if path.len() > self.rules.max_hops {
            anomalies.push(Anomaly {
                kind: "excessive_hops".to_string(),
                description: format!("Unusually high number of mail server hops ({})", path.len()),
                severity: Severity::Medium,
                points: self.rules.excessive_hops,
            });
        }

        if route_reenters_private_network(&path) {
            anomalies.push(Anomaly {
                kind: "route_inconsistency".to_string(),
                description: "Public route passes through a private network hop".to_string(),
                severity: Severity::Medium,
                points: self.rules.route_inconsistency,
            });
        }

        if timestamps_regress(&path) {
            anomalies.push(Anomaly {
                kind: "timestamp_regression".to_string(),
                description: "Received timestamps go backwards along the route".to_string(),
                severity: Severity::Medium,
                points: self.rules.timestamp_regression,
            });
        }

        let score = clamp_score(anomalies.iter().map(|a| a.points as i64).sum());
        let suspicious = anomalies.iter().any(|a| a.severity >= Severity::Medium);

        HeaderAnalysis {
            from,
            reply_to,
            return_path,
            message_id: text("Message-ID"),
            authentication_results: text("Authentication-Results"),
            spf: text("Received-SPF"),
            has_dkim_signature: headers.get("DKIM-Signature").is_some(),
            received_count: path.len(),
            sender_ip: extract_sender_ip(headers),
            routing_path: path,
            anomalies,
            score,
            suspicious,
        }
    }

    fn bad_relay(&self, path: &[RoutingHop]) -> Option<String> {
        path.iter()
            .flat_map(|hop| hop.from.iter().chain(hop.by.iter()))
            .find(|server| self.rules.bad_relays.iter().any(|relay| server.contains(relay.as_str())))
            .cloned()
    }
}

impl Default for HeaderAnalyzer {
    fn default() -> Self {
        Self::new(HeaderRules::default())
    }
}

fn sender_in_path(domain: &str, path: &[RoutingHop]) -> bool {
    // Compare on the registrable part so mail.example.com matches example.com
    let base = registrable(domain);
    path.iter()
        .flat_map(|hop| hop.from.iter().chain(hop.by.iter()))
        .any(|server| registrable(server) == base)
}

fn registrable(host: &str) -> String {
    let labels: Vec<&str> = host.trim_end_matches('.').split('.').collect();
    if labels.len() <= 2 {
        return host.to_string();
    }
    labels[labels.len() - 2..].join(".")
}

/// A public hop, then a private one, then public again
fn route_reenters_private_network(path: &[RoutingHop]) -> bool {
    let ips: Vec<Ipv4Addr> = path.iter().filter_map(|hop| hop.ip).collect();
    let Some(first_public) = ips.iter().position(|ip| !is_internal(ip)) else {
        return false;
    };
    let rest = &ips[first_public + 1..];
    match rest.iter().position(is_internal) {
        Some(private_at) => rest[private_at + 1..].iter().any(|ip| !is_internal(ip)),
        None => false,
    }
}

fn is_internal(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

fn timestamps_regress(path: &[RoutingHop]) -> bool {
    let skew = Duration::minutes(HOP_SKEW_MINUTES);
    let stamps: Vec<DateTime<Utc>> = path.iter().filter_map(|hop| hop.timestamp).collect();
    stamps.windows(2).any(|pair| pair[1] + skew < pair[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "Received: from mx.example.net (mx.example.net [203.0.113.9])\r\n\tby mail.recipient.org; Tue, 1 Oct 2024 10:05:00 +0000\r\n\
Received: from sender.example.com ([198.51.100.7]) by mx.example.net; Tue, 1 Oct 2024 10:00:00 +0000 (UTC)\r\n\
From: \"Example\" <news@example.com>\r\n\
Reply-To: <collect@other.example>\r\n\
Return-Path: <bounce@example.com>\r\n\
Subject: hello\r\n\
\r\n\
Body: not a header\r\n";

    #[test]
    fn test_parse_raw_headers_with_folding() {
        let headers = parse_headers(RAW);
        let received: Vec<&str> = headers.get_all("received").collect();
        assert_eq!(received.len(), 2);
        assert!(received[0].contains("by mail.recipient.org"));
        assert_eq!(headers.get("subject"), Some("hello"));
        assert_eq!(headers.get("Body"), None);
    }

    #[test]
    fn test_parse_json_headers() {
        let json = r#"[{"name":"From","value":"a@b.com"},{"name":"Subject","value":"x: y"}]"#;
        let headers = parse_headers(json);
        assert_eq!(headers.get("From"), Some("a@b.com"));
        assert_eq!(headers.get("Subject"), Some("x: y"));
    }

    #[test]
    fn test_address_domain() {
        assert_eq!(address_domain("\"Bank\" <Alerts@Bank.COM>").as_deref(), Some("bank.com"));
        assert_eq!(address_domain("plain@example.org").as_deref(), Some("example.org"));
        assert_eq!(address_domain("<>"), None);
        assert_eq!(address_domain("no address"), None);
        // Stray brackets in the wrong order
        assert_eq!(address_domain("a > b <c@evil.example").as_deref(), Some("evil.example"));
        assert_eq!(address_domain("a > b <c"), None);
    }

    #[test]
    fn test_sender_ip_comes_from_oldest_hop() {
        let headers = parse_headers(RAW);
        assert_eq!(extract_sender_ip(&headers), Some(Ipv4Addr::new(198, 51, 100, 7)));
    }

    #[test]
    fn test_routing_path_is_chronological() {
        let path = routing_path(&parse_headers(RAW));
        assert_eq!(path[0].from.as_deref(), Some("sender.example.com"));
        assert_eq!(path[1].by.as_deref(), Some("mail.recipient.org"));
        assert!(path[0].timestamp.unwrap() < path[1].timestamp.unwrap());
    }

    #[test]
    fn test_reply_to_mismatch_is_high() {
        let analysis = HeaderAnalyzer::default().analyze_raw(RAW);
        let kinds: Vec<&str> = analysis.anomalies.iter().map(|a| a.kind.as_str()).collect();
        assert!(kinds.contains(&"reply_to_mismatch"));
        assert!(!kinds.contains(&"return_path_mismatch"));
        assert!(!kinds.contains(&"sender_not_in_route"));
        assert!(!kinds.contains(&"timestamp_regression"));
        assert_eq!(analysis.score, 25);
        assert!(analysis.suspicious);
    }

    #[test]
    fn test_bad_relay_and_regression() {
        let raw = "Received: from relay2.example.com ([192.0.2.2]) by mx.victim.org; Tue, 1 Oct 2024 09:00:00 +0000\n\
Received: from spam-relay.biz ([192.0.2.1]) by relay2.example.com; Tue, 1 Oct 2024 10:00:00 +0000\n\
From: someone@example.com\n";
        let analysis = HeaderAnalyzer::default().analyze_raw(raw);
        let kinds: Vec<&str> = analysis.anomalies.iter().map(|a| a.kind.as_str()).collect();
        assert!(kinds.contains(&"known_bad_relay"));
        assert!(kinds.contains(&"timestamp_regression"));
        assert_eq!(analysis.score, 50);
    }

    #[test]
    fn test_excessive_hops_and_clamp() {
        let mut raw = String::new();
        for i in 0..20 {
            raw.push_str(&format!("Received: from bulk-mail{}.net by hop{}.net\n", i, i));
        }
        raw.push_str("From: x@sender.org\nReply-To: y@elsewhere.org\nReturn-Path: <z@third.org>\n");
        let analysis = HeaderAnalyzer::default().analyze_raw(&raw);
        // 25 + 15 + 10 + 30 + 20 = 100
        assert_eq!(analysis.score, 100);
        assert_eq!(analysis.received_count, 20);
    }

    #[test]
    fn test_private_hop_inside_public_route() {
        let raw = "Received: from c.example ([203.0.113.5]) by d.example\n\
Received: from b.example ([10.0.0.8]) by c.example\n\
Received: from a.example ([198.51.100.1]) by b.example\n";
        let analysis = HeaderAnalyzer::default().analyze_raw(raw);
        assert!(analysis
            .anomalies
            .iter()
            .any(|a| a.kind == "route_inconsistency"));
    }

    #[test]
    fn test_private_origin_is_fine() {
        let raw = "Received: from b.example ([203.0.113.5]) by c.example\n\
Received: from laptop ([192.168.1.20]) by b.example\n";
        let analysis = HeaderAnalyzer::default().analyze_raw(raw);
        assert!(analysis.anomalies.is_empty());
        assert_eq!(analysis.score, 0);
    }

    #[test]
    fn test_empty_headers() {
        let analysis = HeaderAnalyzer::default().analyze_raw("");
        assert_eq!(analysis.score, 0);
        assert!(!analysis.suspicious);
        assert!(analysis.sender_ip.is_none());
    }
}
