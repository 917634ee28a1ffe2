//! Sender IP investigation: resolve the target, pull geolocation and abuse
//! reports, then classify the network and estimate whether the address is a
//! real origin or a relay.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::debug;

use crate::error::{PhishError, Result};
use crate::intel::{IpGeolocation, IpReputation, Signal, ThreatIntel, Unavailable};

static IPV4_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$").unwrap());

const CLOUD_PROVIDERS: &[&str] = &[
    "amazon", "aws", "google", "azure", "microsoft", "digitalocean", "linode", "vultr", "ovh",
    "rackspace", "cloudflare",
];

const RESIDENTIAL_ISPS: &[&str] = &[
    "comcast", "xfinity", "verizon", "at&t", "spectrum", "cox", "charter", "centurylink",
    "frontier", "optimum",
];

const MOBILE_CARRIERS: &[&str] = &[
    "t-mobile", "sprint", "verizon wireless", "at&t mobility", "vodafone", "telefonica", "orange",
    "o2", "ee", "three",
];

const BUSINESS_INDICATORS: &[&str] = &["business", "corporate", "enterprise", "inc", "llc", "ltd"];

/// Substring of the organisation name and the provider it implies
const DATACENTERS: &[(&str, &str)] = &[
    ("amazon", "Amazon AWS"),
    ("aws", "Amazon AWS"),
    ("google", "Google Cloud"),
    ("azure", "Microsoft Azure"),
    ("microsoft", "Microsoft Azure"),
    ("digitalocean", "DigitalOcean"),
    ("linode", "Linode"),
    ("vultr", "Vultr"),
    ("ovh", "OVH"),
    ("rackspace", "Rackspace"),
    ("cloudflare", "Cloudflare"),
    ("hetzner", "Hetzner"),
    ("softlayer", "IBM Cloud"),
    ("ibm", "IBM Cloud"),
];

const VPN_PROVIDERS: &[&str] = &[
    "nordvpn",
    "expressvpn",
    "privatevpn",
    "protonvpn",
    "ipvanish",
    "surfshark",
    "purevpn",
    "vyprvpn",
    "torguard",
    "mullvad",
    "privateinternetaccess",
    "cyberghost",
    "hidemyass",
    "tunnelbear",
    "windscribe",
];

const PROXY_ASNS: &[&str] = &[
    "AS14061", "AS16509", "AS14618", "AS15169", "AS8075", "AS36351", "AS13335", "AS46606",
    "AS174", "AS3356",
];

/// Dotted quad with every octet in `0..=255`
pub fn is_valid_ip_address(input: &str) -> bool {
    parse_ipv4(input).is_some()
}

/// Parse a dotted quad; leading zeros in an octet are accepted
pub fn parse_ipv4(input: &str) -> Option<Ipv4Addr> {
    let caps = IPV4_LITERAL.captures(input)?;
    let mut octets = [0u8; 4];
    for (slot, i) in octets.iter_mut().zip(1..=4) {
        *slot = caps[i].parse::<u8>().ok()?;
    }
    Some(Ipv4Addr::from(octets))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Datacenter,
    Residential,
    Mobile,
    Business,
    Unknown,
}

pub fn network_type(org: &str) -> NetworkType {
    let org = org.to_lowercase();
    let any = |list: &[&str]| list.iter().any(|needle| org.contains(needle));

    if any(CLOUD_PROVIDERS) {
        NetworkType::Datacenter
    } else if any(RESIDENTIAL_ISPS) {
        NetworkType::Residential
    } else if any(MOBILE_CARRIERS) {
        NetworkType::Mobile
    } else if any(BUSINESS_INDICATORS) {
        NetworkType::Business
    } else {
        NetworkType::Unknown
    }
}

pub fn datacenter_name(org: &str) -> Option<&'static str> {
    let org = org.to_lowercase();
    DATACENTERS
        .iter()
        .find(|(needle, _)| org.contains(needle))
        .map(|(_, name)| *name)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Unknown,
}

/// Bucket an abuse confidence score; `None` input means no data
pub fn threat_level(abuse_score: Option<u32>) -> ThreatLevel {
    match abuse_score {
        None => ThreatLevel::Unknown,
        Some(s) if s >= 80 => ThreatLevel::High,
        Some(s) if s >= 40 => ThreatLevel::Medium,
        Some(s) if s > 0 => ThreatLevel::Low,
        Some(_) => ThreatLevel::None,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Ip,
    Domain,
    Url,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginalInput {
    pub value: String,
    #[serde(rename = "type")]
    pub kind: InputKind,
}

/// What the caller asked about and the address it resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub ip: Ipv4Addr,
    pub input: OriginalInput,
    pub hostname: Option<String>,
}

/// Accept an IPv4 literal, a domain or an URL and settle on one IPv4 address
pub async fn resolve_target(input: &str) -> Result<ResolvedTarget> {
    let input = input.trim();
    if input.is_empty() {
        return Err(PhishError::BadRequest(
            "IP address, URL, or domain is required".to_string(),
        ));
    }

    if let Some(ip) = parse_ipv4(input) {
        return Ok(ResolvedTarget {
            ip,
            input: OriginalInput {
                value: input.to_string(),
                kind: InputKind::Ip,
            },
            hostname: None,
        });
    }

    if !input.contains('.') {
        return Err(PhishError::BadRequest("Invalid IP address format".to_string()));
    }

    let (kind, host) = if input.starts_with("http") {
        let host = url::Url::parse(input)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| PhishError::BadRequest("Invalid URL format".to_string()))?;
        (InputKind::Url, host)
    } else {
        (InputKind::Domain, input.to_string())
    };

    // a dotted string that looks numeric but failed the octet check
    if IPV4_LITERAL.is_match(&host) {
        return Err(PhishError::BadRequest("Invalid IP address format".to_string()));
    }

    let ip = lookup_ipv4(&host)
        .await
        .ok_or_else(|| PhishError::NotFound(format!("IP address for {}", host)))?;
    debug!(%host, %ip, "Resolved target");

    Ok(ResolvedTarget {
        ip,
        input: OriginalInput {
            value: input.to_string(),
            kind,
        },
        hostname: Some(host),
    })
}

async fn lookup_ipv4(host: &str) -> Option<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((host, 0)).await.ok()?;
    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VpnDetection {
    pub is_vpn_or_proxy: bool,
    pub is_known_proxy_asn: bool,
    pub matched_vpn_provider: Option<String>,
    pub is_tor_exit_node: bool,
    pub asn: Option<String>,
    pub org: Option<String>,
}

/// VPN/proxy verdict from the organisation string (`AS15169 Google LLC`),
/// hostname and abuse report
pub fn detect_vpn(
    org: Option<&str>,
    hostname: Option<&str>,
    reputation: Option<&IpReputation>,
) -> VpnDetection {
    let asn = org
        .and_then(|o| o.split_whitespace().next())
        .filter(|token| token.starts_with("AS"))
        .map(str::to_string);
    let is_known_proxy_asn = asn.as_deref().is_some_and(|a| PROXY_ASNS.contains(&a));

    let haystack = format!("{} {}", org.unwrap_or_default(), hostname.unwrap_or_default()).to_lowercase();
    let matched_vpn_provider = VPN_PROVIDERS
        .iter()
        .find(|provider| haystack.contains(*provider))
        .map(|provider| provider.to_string());

    let is_tor_exit_node = reputation.is_some_and(|r| r.is_tor);

    VpnDetection {
        is_vpn_or_proxy: is_known_proxy_asn || matched_vpn_provider.is_some() || is_tor_exit_node,
        is_known_proxy_asn,
        matched_vpn_provider,
        is_tor_exit_node,
        asn,
        org: org.map(str::to_string),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Infrastructure {
    pub network_type: NetworkType,
    pub hosting_provider: Option<String>,
    pub datacenter: Option<String>,
}

/// Inputs to the real-origin confidence estimate
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceInputs {
    pub vpn_checked: bool,
    pub is_vpn_or_proxy: bool,
    pub geo_consistent: bool,
    pub network_type: NetworkType,
    pub routing_anomalies: bool,
    pub abuse_score: Option<u32>,
}

/// Likelihood (0-100) that the address is the real origin rather than a relay
pub fn confidence_score(inputs: &ConfidenceInputs) -> u32 {
    let mut score: i64 = 50;

    if inputs.is_vpn_or_proxy {
        score -= 20;
    } else if inputs.vpn_checked {
        score += 15;
    }
    if inputs.geo_consistent {
        score += 10;
    }
    match inputs.network_type {
        NetworkType::Residential => score += 15,
        NetworkType::Datacenter => score -= 10,
        _ => {}
    }
    if !inputs.routing_anomalies {
        score += 5;
    }
    if inputs.abuse_score.is_some_and(|s| s > 80) {
        score -= 10;
    }

    score.clamp(0, 100) as u32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpReport {
    pub ip: Ipv4Addr,
    pub original_input: OriginalInput,
    pub original_hostname: Option<String>,
    pub resolved_hostname: Option<String>,
    /// PTR names published for the address
    pub reverse_dns: Vec<String>,
    pub is_likely_real_ip: bool,
    pub confidence_score: u32,
    pub geolocation: Option<IpGeolocation>,
    pub geo_consistent: bool,
    pub vpn_proxy_detection: VpnDetection,
    pub infrastructure: Infrastructure,
    pub threat_intelligence: Option<IpReputation>,
    pub threat_level: ThreatLevel,
    pub unavailable: Vec<Unavailable>,
}

fn keep<T>(signal: Signal<T>, unavailable: &mut Vec<Unavailable>) -> Option<T> {
    signal.map_err(|u| unavailable.push(u)).ok()
}

#[derive(Clone)]
pub struct IpAnalyzer {
    intel: Arc<dyn ThreatIntel>,
}

impl IpAnalyzer {
    pub fn new(intel: Arc<dyn ThreatIntel>) -> Self {
        Self { intel }
    }

    /// Resolve `input` and analyze the resulting address
    pub async fn details(&self, input: &str) -> Result<IpReport> {
        let target = resolve_target(input).await?;
        Ok(self.analyze(target).await)
    }

    pub async fn analyze(&self, target: ResolvedTarget) -> IpReport {
        let (geo, reputation, ptr) = tokio::join!(
            self.intel.ip_geolocation(target.ip),
            self.intel.ip_reputation(target.ip),
            self.intel.reverse_dns(target.ip),
        );

        let mut unavailable = Vec::new();
        let geolocation = keep(geo, &mut unavailable);
        let reputation = keep(reputation, &mut unavailable);
        let reverse_dns = keep(ptr, &mut unavailable).unwrap_or_default();

        let org = geolocation.as_ref().and_then(|g| g.org.clone());
        let resolved_hostname = reverse_dns
            .first()
            .cloned()
            .or_else(|| geolocation.as_ref().and_then(|g| g.hostname.clone()))
            .or_else(|| reputation.as_ref().and_then(|r| r.hostnames.first().cloned()));
        debug!(ip = %target.ip, hostname = ?resolved_hostname, "Resolved reverse hostname");

        let vpn = detect_vpn(org.as_deref(), resolved_hostname.as_deref(), reputation.as_ref());

        let net = org.as_deref().map(network_type).unwrap_or(NetworkType::Unknown);
        let infrastructure = Infrastructure {
            network_type: net,
            hosting_provider: org.clone(),
            datacenter: org.as_deref().and_then(datacenter_name).map(str::to_string),
        };

        let geo_consistent = match (
            geolocation.as_ref().and_then(|g| g.country.as_deref()),
            reputation.as_ref().and_then(|r| r.country_code.as_deref()),
        ) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        };

        let abuse_score = reputation.as_ref().map(|r| r.abuse_confidence_score);
        let confidence = confidence_score(&ConfidenceInputs {
            vpn_checked: geolocation.is_some(),
            is_vpn_or_proxy: vpn.is_vpn_or_proxy,
            geo_consistent,
            network_type: net,
            routing_anomalies: vpn.is_tor_exit_node,
            abuse_score,
        });

        IpReport {
            ip: target.ip,
            original_input: target.input,
            original_hostname: target.hostname,
            resolved_hostname,
            reverse_dns,
            is_likely_real_ip: confidence > 70 && !vpn.is_vpn_or_proxy,
            confidence_score: confidence,
            geolocation,
            geo_consistent,
            vpn_proxy_detection: vpn,
            infrastructure,
            threat_intelligence: reputation,
            threat_level: threat_level(abuse_score),
            unavailable,
        }
    }
}
