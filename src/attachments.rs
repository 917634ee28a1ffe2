//! Uploaded attachment checks: hashing, type and size tampering, blocklisted
//! extensions and a VirusTotal lookup by hash.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::classifier::ContentClassifier;
use crate::error::{PhishError, Result};
use crate::intel::{FileReputation, ThreatIntel, Unavailable};
use crate::scoring::clamp_score;

/// Declared and actual sizes may differ by this much before it counts
const SIZE_TOLERANCE: u64 = 100;
const TAMPERING_THRESHOLD: u32 = 50;
const SUSPICIOUS_TRANSPORT_HEADERS: &[&str] = &["x-proxy-id", "via", "forwarded"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUpload {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Base64 file content
    #[serde(default)]
    pub content: String,
    /// Transport headers seen with the attachment, keys matched case-insensitively
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Hash recorded when the attachment was first seen
    #[serde(default)]
    pub original_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileHashes {
    pub sha256: String,
    pub sha512: String,
}

pub fn hash_bytes(data: &[u8]) -> FileHashes {
    FileHashes {
        sha256: hex::encode(Sha256::digest(data)),
        sha512: hex::encode(Sha512::digest(data)),
    }
}

/// MIME type from magic bytes, when the format is recognised
pub fn sniff_content_type(data: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"MZ", "application/x-msdownload"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"\x1f\x8b", "application/gzip"),
        (b"Rar!\x1a\x07", "application/vnd.rar"),
        (b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1", "application/msword"),
    ];

    SIGNATURES
        .iter()
        .find(|(magic, _)| data.starts_with(magic))
        .map(|(_, mime)| *mime)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TamperCheck {
    pub suspected_tampering: bool,
    pub indicators: Vec<String>,
    pub risk_score: u32,
}

/// Compare declared metadata against the decoded content
pub fn detect_tampering(
    headers: &BTreeMap<String, String>,
    declared_type: Option<&str>,
    detected_type: Option<&str>,
    actual_size: u64,
    original_sha256: Option<&str>,
    current_sha256: &str,
) -> TamperCheck {
    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    };

    let mut indicators = Vec::new();
    let mut score = 0u32;

    if let (Some(declared), Some(detected)) = (declared_type, detected_type) {
        let declared = declared.split(';').next().unwrap_or_default().trim();
        if !declared.eq_ignore_ascii_case(detected) {
            indicators.push(format!("Content-Type mismatch ({} declared, {} detected)", declared, detected));
            score += 25;
        }
    }

    if let Some(declared) = header("content-length").and_then(|v| v.parse::<u64>().ok()) {
        if declared.abs_diff(actual_size) > SIZE_TOLERANCE {
            indicators.push(format!(
                "Content-Length mismatch ({} declared, {} actual)",
                declared, actual_size
            ));
            score += 25;
        }
    }

    for name in SUSPICIOUS_TRANSPORT_HEADERS {
        if header(name).is_some() {
            indicators.push(format!("Suspicious header: {}", name));
            score += 15;
        }
    }

    if let Some(original) = original_sha256 {
        if !original.eq_ignore_ascii_case(current_sha256) {
            indicators.push("File hash mismatch".to_string());
            score += 35;
        }
    }

    TamperCheck {
        suspected_tampering: score >= TAMPERING_THRESHOLD,
        indicators,
        risk_score: score,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentReport {
    pub filename: String,
    pub size: u64,
    pub declared_content_type: Option<String>,
    pub detected_content_type: Option<String>,
    pub hashes: FileHashes,
    pub risky_extension: bool,
    pub file_reputation: Option<FileReputation>,
    pub is_known_malware: bool,
    pub tamper_check: TamperCheck,
    pub risk_score: u32,
    pub indicators: Vec<String>,
    pub unavailable: Vec<Unavailable>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AttachmentAnalyzer {
    intel: Arc<dyn ThreatIntel>,
    classifier: Arc<ContentClassifier>,
    risky_extension_points: u32,
}

impl AttachmentAnalyzer {
    pub fn new(
        intel: Arc<dyn ThreatIntel>,
        classifier: Arc<ContentClassifier>,
        risky_extension_points: u32,
    ) -> Self {
        Self {
            intel,
            classifier,
            risky_extension_points,
        }
    }

    pub async fn analyze(&self, upload: AttachmentUpload) -> Result<AttachmentReport> {
        if upload.filename.trim().is_empty() {
            return Err(PhishError::BadRequest("Filename is required".to_string()));
        }
        let data = STANDARD
            .decode(upload.content.trim())
            .map_err(|_| PhishError::BadRequest("Attachment content is not valid base64".to_string()))?;

        let hashes = hash_bytes(&data);
        let size = data.len() as u64;
        let detected = sniff_content_type(&data);
        let declared = upload.content_type.clone().or_else(|| {
            upload
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.clone())
        });

        let tamper_check = detect_tampering(
            &upload.headers,
            declared.as_deref(),
            detected,
            size,
            upload.original_sha256.as_deref(),
            &hashes.sha256,
        );

        let mut unavailable = Vec::new();
        let file_reputation = match self.intel.file_reputation(&hashes.sha256).await {
            Ok(rep) => Some(rep),
            Err(u) => {
                unavailable.push(u);
                None
            }
        };
        let is_known_malware = file_reputation.as_ref().is_some_and(|r| r.known && r.malicious > 0);
        let risky_extension = self.classifier.is_risky_attachment(&upload.filename);

        let mut indicators = tamper_check.indicators.clone();
        if risky_extension {
            indicators.push(format!("Risky file extension: {}", upload.filename));
        }
        if let Some(rep) = file_reputation.as_ref().filter(|_| is_known_malware) {
            indicators.push(format!("Flagged malicious by {} engines", rep.malicious));
        }

        let malware = if is_known_malware { 100.0 } else { 0.0 };
        let weighted = malware * 0.6 + tamper_check.risk_score as f64 * 0.4;
        let extension = if risky_extension { self.risky_extension_points } else { 0 };
        let risk_score = clamp_score(weighted.round() as i64 + extension as i64);

        debug!(filename = %upload.filename, sha256 = %hashes.sha256, risk_score, "Attachment analyzed");

        Ok(AttachmentReport {
            filename: upload.filename,
            size,
            declared_content_type: declared,
            detected_content_type: detected.map(str::to_string),
            hashes,
            risky_extension,
            file_reputation,
            is_known_malware,
            tamper_check,
            risk_score,
            indicators,
            unavailable,
            analyzed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::{MockThreatIntel, OfflineIntel};

    fn analyzer(intel: Arc<dyn ThreatIntel>) -> AttachmentAnalyzer {
        AttachmentAnalyzer::new(intel, Arc::new(ContentClassifier::default()), 25)
    }

    fn upload(filename: &str, data: &[u8]) -> AttachmentUpload {
        AttachmentUpload {
            filename: filename.to_string(),
            content_type: None,
            content: STANDARD.encode(data),
            headers: BTreeMap::new(),
            original_sha256: None,
        }
    }

    #[test]
    fn test_sha256_of_known_input() {
        assert_eq!(
            hash_bytes(b"abc").sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(b"%PDF-1.7 ..."), Some("application/pdf"));
        assert_eq!(sniff_content_type(b"MZ\x90\x00"), Some("application/x-msdownload"));
        assert_eq!(sniff_content_type(b"plain text"), None);
    }

    #[test]
    fn test_tampering_indicators_add_up() {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Length".to_string(), "5000".to_string());
        headers.insert("Via".to_string(), "1.1 proxy".to_string());

        let check = detect_tampering(
            &headers,
            Some("application/pdf; name=a.pdf"),
            Some("application/x-msdownload"),
            200,
            Some("deadbeef"),
            "cafebabe",
        );
        assert_eq!(check.risk_score, 25 + 25 + 15 + 35);
        assert!(check.suspected_tampering);
        assert_eq!(check.indicators.len(), 4);
    }

    #[test]
    fn test_small_size_difference_tolerated() {
        let mut headers = BTreeMap::new();
        headers.insert("content-length".to_string(), "1050".to_string());
        let check = detect_tampering(&headers, Some("application/pdf"), Some("application/pdf"), 1000, None, "x");
        assert_eq!(check.risk_score, 0);
        assert!(!check.suspected_tampering);
    }

    #[tokio::test]
    async fn test_invalid_base64_rejected() {
        let mut bad = upload("a.txt", b"");
        bad.content = "***".to_string();
        assert!(matches!(
            analyzer(Arc::new(OfflineIntel)).analyze(bad).await,
            Err(PhishError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_executable_scores_extension_only() {
        let report = analyzer(Arc::new(OfflineIntel))
            .analyze(upload("invoice.exe", b"MZ\x90\x00payload"))
            .await
            .unwrap();
        assert!(report.risky_extension);
        assert_eq!(report.risk_score, 25);
        assert_eq!(report.detected_content_type.as_deref(), Some("application/x-msdownload"));
        assert_eq!(report.unavailable.len(), 1);
        assert!(!report.is_known_malware);
    }

    #[tokio::test]
    async fn test_known_malware_dominates() {
        let mut intel = MockThreatIntel::new();
        intel.expect_file_reputation().returning(|_| {
            Ok(FileReputation {
                known: true,
                malicious: 42,
                suspicious: 0,
                harmless: 0,
                undetected: 10,
            })
        });

        let mut doc = upload("report.pdf", b"%PDF-1.4 body");
        doc.content_type = Some("application/pdf".to_string());
        let report = analyzer(Arc::new(intel)).analyze(doc).await.unwrap();
        assert!(report.is_known_malware);
        assert_eq!(report.risk_score, 60);
        assert!(report.unavailable.is_empty());
    }
}
