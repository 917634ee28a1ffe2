//! External threat-intelligence lookups.
//!
//! Every lookup returns a [`Signal`]: either the observed value or an
//! [`Unavailable`] explaining why no data exists (missing API key, timeout,
//! provider error, open circuit). Callers never see a neutral default.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{CircuitBreakerConfig, IntelConfig};
use crate::error::{PhishError, Result};
use crate::rate_limiter::RequestRateLimiter;
use crate::urls::extract_domain;
use crate::whois::WhoisClient;

#[cfg(test)]
use mockall::automock;

/// Why a signal has no value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Unavailable {
    pub source: String,
    pub reason: String,
}

impl Unavailable {
    pub fn new(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reason: reason.into(),
        }
    }
}

pub type Signal<T> = std::result::Result<T, Unavailable>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedirectInfo {
    pub original_url: String,
    pub final_url: String,
    pub original_domain: Option<String>,
    pub final_domain: Option<String>,
    pub redirects: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsInfo {
    pub valid: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainAge {
    pub age_days: i64,
    pub creation_date: DateTime<Utc>,
    pub registrar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainReputation {
    pub reputation: i64,
    pub malicious: u32,
    pub suspicious: u32,
    pub harmless: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IpGeolocation {
    pub hostname: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub loc: Option<String>,
    pub org: Option<String>,
    pub postal: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpReputation {
    pub abuse_confidence_score: u32,
    pub total_reports: u32,
    pub usage_type: Option<String>,
    pub isp: Option<String>,
    pub domain: Option<String>,
    pub country_code: Option<String>,
    pub is_tor: bool,
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileReputation {
    /// False when the hash has never been submitted
    pub known: bool,
    pub malicious: u32,
    pub suspicious: u32,
    pub harmless: u32,
    pub undetected: u32,
}

/// Lookups used by URL, IP and attachment analysis
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ThreatIntel: Send + Sync {
    /// Follow redirects (HEAD, at most 5) and report whether the domain changed
    async fn check_redirect(&self, url: &str) -> Signal<RedirectInfo>;

    /// Handshake with `domain:443` and validate the certificate chain
    async fn probe_tls(&self, domain: &str) -> Signal<TlsInfo>;

    async fn domain_age(&self, domain: &str) -> Signal<DomainAge>;

    async fn domain_reputation(&self, domain: &str) -> Signal<DomainReputation>;

    async fn ip_geolocation(&self, ip: Ipv4Addr) -> Signal<IpGeolocation>;

    async fn ip_reputation(&self, ip: Ipv4Addr) -> Signal<IpReputation>;

    /// PTR names for the address; empty when none are published
    async fn reverse_dns(&self, ip: Ipv4Addr) -> Signal<Vec<String>>;

    async fn file_reputation(&self, sha256: &str) -> Signal<FileReputation>;
}

/// Intel that never touches the network
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineIntel;

#[async_trait]
impl ThreatIntel for OfflineIntel {
    async fn check_redirect(&self, _url: &str) -> Signal<RedirectInfo> {
        Err(Unavailable::new("redirect", "offline mode"))
    }

    async fn probe_tls(&self, _domain: &str) -> Signal<TlsInfo> {
        Err(Unavailable::new("tls", "offline mode"))
    }

    async fn domain_age(&self, _domain: &str) -> Signal<DomainAge> {
        Err(Unavailable::new("whois", "offline mode"))
    }

    async fn domain_reputation(&self, _domain: &str) -> Signal<DomainReputation> {
        Err(Unavailable::new("virustotal", "offline mode"))
    }

    async fn ip_geolocation(&self, _ip: Ipv4Addr) -> Signal<IpGeolocation> {
        Err(Unavailable::new("ipinfo", "offline mode"))
    }

    async fn ip_reputation(&self, _ip: Ipv4Addr) -> Signal<IpReputation> {
        Err(Unavailable::new("abuseipdb", "offline mode"))
    }

    async fn reverse_dns(&self, _ip: Ipv4Addr) -> Signal<Vec<String>> {
        Err(Unavailable::new("dns", "offline mode"))
    }

    async fn file_reputation(&self, _sha256: &str) -> Signal<FileReputation> {
        Err(Unavailable::new("virustotal", "offline mode"))
    }
}

/// Provider base URLs, overridable for tests
#[derive(Debug, Clone)]
pub struct IntelEndpoints {
    pub virustotal: String,
    pub abuseipdb: String,
    pub ipinfo: String,
    /// DNS-over-HTTPS resolver speaking the JSON API
    pub dns: String,
}

impl Default for IntelEndpoints {
    fn default() -> Self {
        Self {
            virustotal: "https://www.virustotal.com/api/v3".to_string(),
            abuseipdb: "https://api.abuseipdb.com/api/v2".to_string(),
            ipinfo: "https://ipinfo.io".to_string(),
            dns: "https://dns.google".to_string(),
        }
    }
}

type ProbeClient = google_gmail1::hyper_util::client::legacy::Client<
    google_gmail1::hyper_rustls::HttpsConnector<
        google_gmail1::hyper_util::client::legacy::connect::HttpConnector,
    >,
    http_body_util::Empty<bytes::Bytes>,
>;

/// Production intel backed by VirusTotal, AbuseIPDB, ipinfo.io, WHOIS and DNS-over-HTTPS
pub struct HttpThreatIntel {
    config: IntelConfig,
    endpoints: IntelEndpoints,
    http: reqwest::Client,
    redirect_http: reqwest::Client,
    tls_probe: ProbeClient,
    whois: WhoisClient,
    virustotal_limiter: RequestRateLimiter,
    virustotal_breaker: CircuitBreaker,
    abuseipdb_breaker: CircuitBreaker,
    ipinfo_breaker: CircuitBreaker,
    dns_breaker: CircuitBreaker,
    whois_breaker: CircuitBreaker,
    reputation_cache: Mutex<LruCache<String, DomainReputation>>,
    age_cache: Mutex<LruCache<String, DomainAge>>,
}

impl HttpThreatIntel {
    pub fn new(config: IntelConfig, breaker: CircuitBreakerConfig) -> Result<Self> {
        Self::with_endpoints(config, breaker, IntelEndpoints::default())
    }

    pub fn with_endpoints(
        config: IntelConfig,
        breaker: CircuitBreakerConfig,
        endpoints: IntelEndpoints,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("phishguard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PhishError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        let redirect_http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| PhishError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        let cache_size = NonZeroUsize::new(config.cache_size)
            .ok_or_else(|| PhishError::ConfigError("intel.cache_size must be at least 1".to_string()))?;

        Ok(Self {
            endpoints,
            http,
            redirect_http,
            tls_probe: build_probe_client()?,
            whois: WhoisClient::new(timeout),
            virustotal_limiter: RequestRateLimiter::per_minute(config.virustotal_per_minute),
            virustotal_breaker: CircuitBreaker::new("virustotal", breaker.clone()),
            abuseipdb_breaker: CircuitBreaker::new("abuseipdb", breaker.clone()),
            ipinfo_breaker: CircuitBreaker::new("ipinfo", breaker.clone()),
            dns_breaker: CircuitBreaker::new("dns", breaker.clone()),
            whois_breaker: CircuitBreaker::new("whois", breaker),
            reputation_cache: Mutex::new(LruCache::new(cache_size)),
            age_cache: Mutex::new(LruCache::new(cache_size)),
            config,
        })
    }

    async fn get_json(&self, request: reqwest::RequestBuilder) -> Result<Option<serde_json::Value>> {
        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PhishError::AuthError(format!("provider rejected API key ({})", status)));
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json().await?))
    }

    async fn virustotal(&self, path: String) -> Result<Option<serde_json::Value>> {
        let key = self
            .config
            .virustotal_api_key
            .as_deref()
            .ok_or_else(|| PhishError::ConfigError("VirusTotal API key not configured".to_string()))?;
        let request = self
            .http
            .get(format!("{}/{}", self.endpoints.virustotal, path))
            .header("x-apikey", key);

        // Quota is only spent on calls the breaker admits
        self.virustotal_breaker
            .guard(async {
                self.virustotal_limiter.acquire().await;
                self.get_json(request).await
            })
            .await
    }
}

fn build_probe_client() -> Result<ProbeClient> {
    use google_gmail1::{hyper_rustls, hyper_util};

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| PhishError::ConfigError(format!("Failed to load TLS roots: {}", e)))?
        .https_only()
        .enable_http1()
        .build();

    Ok(hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(connector))
}

/// Find a certificate verification failure anywhere in an error chain
fn certificate_error(error: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(rustls::Error::InvalidCertificate(reason)) = err.downcast_ref::<rustls::Error>() {
            return Some(format!("{:?}", reason));
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if let Some(rustls::Error::InvalidCertificate(reason)) =
                io.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>())
            {
                return Some(format!("{:?}", reason));
            }
        }
        current = err.source();
    }
    None
}

fn unavailable(source: &str, error: PhishError) -> Unavailable {
    debug!(source, error = %error, "Intel lookup unavailable");
    Unavailable::new(source, error.to_string())
}

fn stat(stats: &serde_json::Value, key: &str) -> u32 {
    stats
        .get(key)
        .and_then(|v| v.as_u64())
        .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX))
}

/// Codes from the JSON resolver API
const DNS_NOERROR: u64 = 0;
const DNS_NXDOMAIN: u64 = 3;
const DNS_TYPE_PTR: u64 = 12;

/// `4.3.2.1.in-addr.arpa` for 1.2.3.4
fn ptr_name(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("{}.{}.{}.{}.in-addr.arpa", d, c, b, a)
}

fn text(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ThreatIntel for HttpThreatIntel {
    async fn check_redirect(&self, url: &str) -> Signal<RedirectInfo> {
        let response = self
            .redirect_http
            .head(url)
            .send()
            .await
            .map_err(|e| unavailable("redirect", e.into()))?;

        // A final 3xx means the chain exceeded the redirect limit or had no Location
        let final_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| response.url().join(loc).ok())
            .unwrap_or_else(|| response.url().clone())
            .to_string();

        let original_domain = extract_domain(url);
        let final_domain = extract_domain(&final_url);
        Ok(RedirectInfo {
            original_url: url.to_string(),
            redirects: original_domain != final_domain,
            final_url,
            original_domain,
            final_domain,
        })
    }

    async fn probe_tls(&self, domain: &str) -> Signal<TlsInfo> {
        let uri: google_gmail1::hyper::Uri = format!("https://{}/", domain)
            .parse()
            .map_err(|e| Unavailable::new("tls", format!("invalid host: {}", e)))?;
        let request = google_gmail1::hyper::Request::head(uri)
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| Unavailable::new("tls", e.to_string()))?;

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        match tokio::time::timeout(timeout, self.tls_probe.request(request)).await {
            Err(_) => Err(Unavailable::new("tls", "handshake timed out")),
            Ok(Ok(_)) => Ok(TlsInfo {
                valid: true,
                error: None,
            }),
            Ok(Err(error)) => match certificate_error(&error) {
                Some(reason) => Ok(TlsInfo {
                    valid: false,
                    error: Some(reason),
                }),
                None => Err(Unavailable::new("tls", error.to_string())),
            },
        }
    }

    async fn domain_age(&self, domain: &str) -> Signal<DomainAge> {
        if let Some(hit) = self.age_cache.lock().await.get(domain) {
            return Ok(hit.clone());
        }

        let record = self
            .whois_breaker
            .guard(self.whois.lookup(domain))
            .await
            .map_err(|e| unavailable("whois", e))?;
        let creation_date = record
            .creation_date
            .ok_or_else(|| Unavailable::new("whois", "no creation date found"))?;

        let age = DomainAge {
            age_days: (Utc::now() - creation_date).num_days(),
            creation_date,
            registrar: record.registrar,
        };
        self.age_cache.lock().await.put(domain.to_string(), age.clone());
        Ok(age)
    }

    async fn domain_reputation(&self, domain: &str) -> Signal<DomainReputation> {
        if let Some(hit) = self.reputation_cache.lock().await.get(domain) {
            return Ok(hit.clone());
        }

        let body = self
            .virustotal(format!("domains/{}", domain))
            .await
            .map_err(|e| unavailable("virustotal", e))?
            .ok_or_else(|| Unavailable::new("virustotal", "domain not known to VirusTotal"))?;

        let attributes = &body["data"]["attributes"];
        let stats = &attributes["last_analysis_stats"];
        let reputation = DomainReputation {
            reputation: attributes["reputation"].as_i64().unwrap_or(0),
            malicious: stat(stats, "malicious"),
            suspicious: stat(stats, "suspicious"),
            harmless: stat(stats, "harmless"),
        };
        self.reputation_cache
            .lock()
            .await
            .put(domain.to_string(), reputation.clone());
        Ok(reputation)
    }

    async fn ip_geolocation(&self, ip: Ipv4Addr) -> Signal<IpGeolocation> {
        let mut request = self.http.get(format!("{}/{}/json", self.endpoints.ipinfo, ip));
        if let Some(token) = &self.config.ipinfo_token {
            request = request.query(&[("token", token)]);
        }

        let body = self
            .ipinfo_breaker
            .guard(self.get_json(request))
            .await
            .map_err(|e| unavailable("ipinfo", e))?
            .ok_or_else(|| Unavailable::new("ipinfo", "address not found"))?;

        if body.get("bogon").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Err(Unavailable::new("ipinfo", "bogon address"));
        }

        Ok(IpGeolocation {
            hostname: text(&body, "hostname"),
            city: text(&body, "city"),
            region: text(&body, "region"),
            country: text(&body, "country"),
            loc: text(&body, "loc"),
            org: text(&body, "org"),
            postal: text(&body, "postal"),
            timezone: text(&body, "timezone"),
        })
    }

    async fn ip_reputation(&self, ip: Ipv4Addr) -> Signal<IpReputation> {
        let key = self
            .config
            .abuseipdb_api_key
            .as_deref()
            .ok_or_else(|| Unavailable::new("abuseipdb", "AbuseIPDB API key not configured"))?;

        let request = self
            .http
            .get(format!("{}/check", self.endpoints.abuseipdb))
            .query(&[("ipAddress", ip.to_string().as_str()), ("maxAgeInDays", "90"), ("verbose", "")])
            .header("Key", key)
            .header(reqwest::header::ACCEPT, "application/json");

        let body = self
            .abuseipdb_breaker
            .guard(self.get_json(request))
            .await
            .map_err(|e| unavailable("abuseipdb", e))?
            .ok_or_else(|| Unavailable::new("abuseipdb", "address not found"))?;

        let data = &body["data"];
        Ok(IpReputation {
            abuse_confidence_score: stat(data, "abuseConfidenceScore"),
            total_reports: stat(data, "totalReports"),
            usage_type: text(data, "usageType"),
            isp: text(data, "isp"),
            domain: text(data, "domain"),
            country_code: text(data, "countryCode"),
            is_tor: data["isTor"].as_bool().unwrap_or(false),
            hostnames: data["hostnames"]
                .as_array()
                .map(|names| {
                    names
                        .iter()
                        .filter_map(|n| n.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    async fn reverse_dns(&self, ip: Ipv4Addr) -> Signal<Vec<String>> {
        let request = self
            .http
            .get(format!("{}/resolve", self.endpoints.dns))
            .query(&[("name", ptr_name(ip).as_str()), ("type", "PTR")])
            .header(reqwest::header::ACCEPT, "application/dns-json");

        let body = self
            .dns_breaker
            .guard(self.get_json(request))
            .await
            .map_err(|e| unavailable("dns", e))?
            .ok_or_else(|| Unavailable::new("dns", "resolver returned 404"))?;

        match body["Status"].as_u64() {
            Some(DNS_NOERROR) => {}
            Some(DNS_NXDOMAIN) => return Ok(Vec::new()),
            Some(code) => return Err(Unavailable::new("dns", format!("resolver status {}", code))),
            None => return Err(Unavailable::new("dns", "malformed resolver response")),
        }

        Ok(body["Answer"]
            .as_array()
            .map(|answers| {
                answers
                    .iter()
                    .filter(|a| a["type"].as_u64() == Some(DNS_TYPE_PTR))
                    .filter_map(|a| a["data"].as_str())
                    .map(|name| name.trim_end_matches('.').to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn file_reputation(&self, sha256: &str) -> Signal<FileReputation> {
        let body = self
            .virustotal(format!("files/{}", sha256))
            .await
            .map_err(|e| unavailable("virustotal", e))?;

        let Some(body) = body else {
            return Ok(FileReputation {
                known: false,
                malicious: 0,
                suspicious: 0,
                harmless: 0,
                undetected: 0,
            });
        };

        let stats = &body["data"]["attributes"]["last_analysis_stats"];
        let reputation = FileReputation {
            known: true,
            malicious: stat(stats, "malicious"),
            suspicious: stat(stats, "suspicious"),
            harmless: stat(stats, "harmless"),
            undetected: stat(stats, "undetected"),
        };
        if reputation.malicious > 0 {
            warn!(sha256, malicious = reputation.malicious, "Attachment hash flagged by VirusTotal");
        }
        Ok(reputation)
    }
}
