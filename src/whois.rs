//! Minimal WHOIS client (RFC 3912) used for domain age.
//!
//! Queries IANA for the registry's WHOIS server, then asks that server for
//! the domain record and pulls out the creation date and registrar.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{PhishError, Result};

const IANA_SERVER: &str = "whois.iana.org";
const WHOIS_PORT: u16 = 43;
const MAX_RESPONSE_BYTES: u64 = 256 * 1024;

const CREATION_KEYS: &[&str] = &[
    "creation date",
    "created",
    "created on",
    "registered on",
    "registration time",
    "domain registration date",
    "registered",
];

#[derive(Debug, Clone, PartialEq)]
pub struct WhoisRecord {
    pub creation_date: Option<DateTime<Utc>>,
    pub registrar: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WhoisClient {
    timeout: Duration,
}

impl WhoisClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn lookup(&self, domain: &str) -> Result<WhoisRecord> {
        let domain = registrable_domain(domain);
        let referral = self.query(IANA_SERVER, &domain).await?;
        let server = parse_referral(&referral).ok_or_else(|| {
            PhishError::NotFound(format!("WHOIS server for {}", domain))
        })?;

        debug!(domain = %domain, server = %server, "Querying registry WHOIS");
        let response = self.query(&server, &domain).await?;
        Ok(parse_record(&response))
    }

    async fn query(&self, server: &str, domain: &str) -> Result<String> {
        let exchange = async {
            let mut stream = TcpStream::connect((server, WHOIS_PORT)).await?;
            stream.write_all(format!("{}\r\n", domain).as_bytes()).await?;
            let mut buf = Vec::new();
            stream.take(MAX_RESPONSE_BYTES).read_to_end(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };

        let bytes = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| PhishError::NetworkError(format!("WHOIS query to {} timed out", server)))?
            .map_err(|e| PhishError::NetworkError(format!("WHOIS query to {} failed: {}", server, e)))?;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Last two labels; WHOIS registries index the registered name
pub fn registrable_domain(domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        return domain;
    }
    labels[labels.len() - 2..].join(".")
}

fn fields(response: &str) -> impl Iterator<Item = (String, &str)> {
    response.lines().filter_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        let value = value.trim();
        (!value.is_empty()).then(|| (key.trim().to_lowercase(), value))
    })
}

fn parse_referral(response: &str) -> Option<String> {
    fields(response)
        .find(|(key, _)| key == "refer" || key == "whois")
        .map(|(_, value)| value.to_string())
}

pub fn parse_record(response: &str) -> WhoisRecord {
    let mut creation_date = None;
    let mut registrar = None;

    for (key, value) in fields(response) {
        if creation_date.is_none() && CREATION_KEYS.contains(&key.as_str()) {
            creation_date = parse_date(value);
        }
        if registrar.is_none() && key == "registrar" {
            registrar = Some(value.to_string());
        }
    }

    WhoisRecord {
        creation_date,
        registrar,
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    // Registries also use date-only forms, sometimes followed by a zone name
    let first = value.split_whitespace().next().unwrap_or(value);
    for fmt in ["%Y-%m-%d", "%Y.%m.%d", "%d-%b-%Y", "%d.%m.%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(first, fmt) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|dt| Utc.from_utc_datetime(&dt));
        }
    }
    None
}
