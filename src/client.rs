//! Read-only Gmail mailbox client with retry logic

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use google_gmail1::{api::Message, api::MessagePart, hyper_rustls, hyper_util, Gmail};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PhishError, Result};
use crate::headers::HeaderField;
use crate::models::AttachmentInfo;
use crate::oauth::GMAIL_SCOPES;

#[cfg(test)]
use mockall::automock;

/// Gmail hub authenticated with a bare access token
pub type GmailHub = Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// A message as pulled from the mailbox, before scoring
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMessage {
    pub id: String,
    pub headers: Vec<HeaderField>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub body: String,
    pub attachments: Vec<AttachmentInfo>,
}

/// Trait defining the mailbox operations the fetch job needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Most recent message ids, newest first
    async fn list_message_ids(&self, max_results: u32) -> Result<Vec<String>>;

    /// Full message with decoded body parts
    async fn get_message(&self, id: &str) -> Result<FetchedMessage>;
}

/// Builds a mailbox client for one user's access token
#[cfg_attr(test, automock)]
pub trait MailboxConnector: Send + Sync {
    fn connect(&self, access_token: String) -> Result<Arc<dyn MailboxClient>>;
}

pub struct GmailConnector;

impl MailboxConnector for GmailConnector {
    fn connect(&self, access_token: String) -> Result<Arc<dyn MailboxClient>> {
        Ok(Arc::new(GmailMailboxClient::new(build_hub(access_token)?)))
    }
}

/// Configure the hub's HTTP client with TLS; the token is sent as-is
pub fn build_hub(access_token: String) -> Result<GmailHub> {
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| PhishError::ConfigError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, access_token))
}

/// Production Gmail client
///
/// Transient failures (429, 5xx, network) are retried with exponential
/// backoff; anything else is returned immediately.
pub struct GmailMailboxClient {
    hub: GmailHub,
    max_elapsed: Duration,
}

impl GmailMailboxClient {
    pub fn new(hub: GmailHub) -> Self {
        Self {
            hub,
            max_elapsed: Duration::from_secs(30),
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        with_backoff(operation_name, self.max_elapsed, &mut operation).await
    }
}

async fn with_backoff<T, F, Fut>(operation_name: &str, max_elapsed: Duration, operation: &mut F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(max_elapsed))
        .build();

    backoff::future::retry(policy, || {
        let attempt = operation();
        async move {
            attempt.await.map_err(|e| match e {
                PhishError::RateLimitExceeded { retry_after } => {
                    warn!("{} rate limited, retrying after {}s", operation_name, retry_after);
                    backoff::Error::retry_after(e, Duration::from_secs(retry_after))
                }
                e if e.is_transient() => {
                    warn!("{} failed: {}. Retrying...", operation_name, e);
                    backoff::Error::transient(e)
                }
                e => backoff::Error::permanent(e),
            })
        }
    })
    .await
}

#[async_trait]
impl MailboxClient for GmailMailboxClient {
    async fn list_message_ids(&self, max_results: u32) -> Result<Vec<String>> {
        let (_, response) = self
            .with_retry("list_messages", || async {
                Ok(self
                    .hub
                    .users()
                    .messages_list("me")
                    .max_results(max_results)
                    .add_scope(GMAIL_SCOPES[0])
                    .doit()
                    .await?)
            })
            .await?;

        let ids: Vec<String> = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();
        debug!("Listed {} message ids", ids.len());
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<FetchedMessage> {
        let (_, message) = self
            .with_retry("get_message", || async {
                Ok(self
                    .hub
                    .users()
                    .messages_get("me", id)
                    .format("full")
                    .add_scope(GMAIL_SCOPES[0])
                    .doit()
                    .await?)
            })
            .await?;

        parse_message(message)
    }
}

/// Convert a full-format Gmail message
pub fn parse_message(msg: Message) -> Result<FetchedMessage> {
    let id = msg
        .id
        .ok_or_else(|| PhishError::InvalidMessageFormat("Missing message ID".to_string()))?;
    let payload = msg
        .payload
        .ok_or_else(|| PhishError::InvalidMessageFormat("Missing payload".to_string()))?;

    let headers: Vec<HeaderField> = payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|h| {
            Some(HeaderField {
                name: h.name.clone()?,
                value: h.value.clone().unwrap_or_default(),
            })
        })
        .collect();

    let header = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };

    let date = parse_date(&header("Date")).ok().or_else(|| {
        msg.internal_date
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    });

    let mut body = String::new();
    let mut attachments = Vec::new();
    collect_parts(&payload, &mut body, &mut attachments);
    if body.is_empty() {
        body = msg.snippet.unwrap_or_default();
    }

    Ok(FetchedMessage {
        from: header("From"),
        to: header("To"),
        subject: header("Subject"),
        headers,
        id,
        date,
        body,
        attachments,
    })
}

/// Walk the MIME tree: text/plain parts become the body, named parts attachments
fn collect_parts(part: &MessagePart, body: &mut String, attachments: &mut Vec<AttachmentInfo>) {
    let mime_type = part.mime_type.as_deref().unwrap_or_default();
    let filename = part.filename.as_deref().unwrap_or_default();

    if !filename.is_empty() {
        attachments.push(AttachmentInfo {
            name: filename.to_string(),
            content_type: mime_type.to_string(),
            size: part
                .body
                .as_ref()
                .and_then(|b| b.size)
                .map(|s| s.max(0) as u64)
                .unwrap_or(0),
        });
    } else if mime_type.eq_ignore_ascii_case("text/plain") {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref()) {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(&String::from_utf8_lossy(data));
        }
    }

    for child in part.parts.as_deref().unwrap_or_default() {
        collect_parts(child, body, attachments);
    }
}

/// Parse RFC 2822 date string
pub fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    // Gmail sometimes appends a zone comment, e.g. "+0000 (UTC)"
    let trimmed = match date_str.find(" (") {
        Some(idx) => &date_str[..idx],
        None => date_str,
    };
    DateTime::parse_from_rfc2822(trimmed.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(date_str.trim()).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| PhishError::InvalidMessageFormat(format!("Invalid date format: {}", e)))
}
