//! Fetch-time content classifier: keyword checks over sender, body and subject
//! plus the attachment extension blocklist.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{AttachmentInfo, Scores};
use crate::scoring::{clamp_score, ContentRules};

struct ContentPatterns {
    noreply_sender: Regex,
    sensitive_sender: Regex,
    urgent: Regex,
    financial: Regex,
    action_request: Regex,
    alarming_subject: Regex,
}

static PATTERNS: Lazy<ContentPatterns> = Lazy::new(|| ContentPatterns {
    noreply_sender: Regex::new(r"(?i)(noreply|no-reply)").unwrap(),
    sensitive_sender: Regex::new(r"(?i)(security|account)").unwrap(),
    urgent: Regex::new(r"(?i)(urgent|immediately)").unwrap(),
    financial: Regex::new(r"(?i)(bank|account|credit card|payment)").unwrap(),
    action_request: Regex::new(r"(?i)(click here|login now|verify your|update your)").unwrap(),
    alarming_subject: Regex::new(r"(?i)(urgent|alert|verify)").unwrap(),
});

/// The parts of a message the classifier looks at
#[derive(Debug, Clone, Copy)]
pub struct ContentInput<'a> {
    pub from: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub attachments: &'a [AttachmentInfo],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentVerdict {
    pub scores: Scores,
    pub reasons: Vec<String>,
}

pub struct ContentClassifier {
    rules: ContentRules,
}

impl ContentClassifier {
    pub fn new(rules: ContentRules) -> Self {
        Self { rules }
    }

    /// Score a message; `scores.total` is the clamped sum of the four categories
    pub fn classify(&self, input: &ContentInput<'_>) -> ContentVerdict {
        let mut scores = Scores::default();
        let mut reasons = Vec::new();

        if PATTERNS.noreply_sender.is_match(input.from) {
            scores.header += self.rules.noreply_sender;
            reasons.push("Sender is a no-reply address".to_string());
        }
        if PATTERNS.sensitive_sender.is_match(input.from) {
            scores.header += self.rules.sensitive_sender;
            reasons.push("Sender impersonates a security or account service".to_string());
        }

        if PATTERNS.urgent.is_match(input.body) {
            scores.text += self.rules.urgent_language;
            reasons.push("Urgent language in body".to_string());
        }
        if PATTERNS.financial.is_match(input.body) {
            scores.text += self.rules.financial_terms;
            reasons.push("Financial terms in body".to_string());
        }
        if PATTERNS.action_request.is_match(input.body) {
            scores.text += self.rules.action_request;
            reasons.push("Body asks the reader to act".to_string());
        }

        if PATTERNS.alarming_subject.is_match(input.subject) {
            scores.metadata += self.rules.alarming_subject;
            reasons.push("Alarming subject line".to_string());
        }

        for attachment in input.attachments {
            if self.is_risky_attachment(&attachment.name) {
                scores.attachments += self.rules.risky_attachment;
                reasons.push(format!("Risky attachment type: {}", attachment.name));
            }
        }

        let sum = scores.header as i64
            + scores.text as i64
            + scores.metadata as i64
            + scores.attachments as i64;
        scores.total = clamp_score(sum);

        ContentVerdict { scores, reasons }
    }

    pub fn is_risky_attachment(&self, filename: &str) -> bool {
        let lower = filename.to_lowercase();
        self.rules
            .risky_extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_lowercase()))
    }
}

impl Default for ContentClassifier {
    fn default() -> Self {
        Self::new(ContentRules::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(name: &str) -> AttachmentInfo {
        AttachmentInfo {
            name: name.to_string(),
            content_type: "application/octet-stream".to_string(),
            size: 1024,
        }
    }

    #[test]
    fn test_benign_message_scores_zero() {
        let verdict = ContentClassifier::default().classify(&ContentInput {
            from: "Alice <alice@example.com>",
            subject: "Lunch on Friday?",
            body: "Want to grab lunch at noon?",
            attachments: &[],
        });
        assert_eq!(verdict.scores, Scores::default());
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn test_sender_checks() {
        let verdict = ContentClassifier::default().classify(&ContentInput {
            from: "PayPal Security <no-reply@security.example.com>",
            subject: "Hello",
            body: "",
            attachments: &[],
        });
        assert_eq!(verdict.scores.header, 15);
    }

    #[test]
    fn test_body_categories_accumulate() {
        let verdict = ContentClassifier::default().classify(&ContentInput {
            from: "someone@example.com",
            subject: "Hi",
            body: "URGENT: your bank needs you to click here",
            attachments: &[],
        });
        assert_eq!(verdict.scores.text, 45);
        assert_eq!(verdict.scores.total, 45);
    }

    #[test]
    fn test_subject_keywords() {
        let verdict = ContentClassifier::default().classify(&ContentInput {
            from: "someone@example.com",
            subject: "Security Alert",
            body: "",
            attachments: &[],
        });
        assert_eq!(verdict.scores.metadata, 15);
    }

    #[test]
    fn test_attachments_case_insensitive() {
        let attachments = [attachment("invoice.ZIP"), attachment("setup.exe"), attachment("photo.png")];
        let verdict = ContentClassifier::default().classify(&ContentInput {
            from: "someone@example.com",
            subject: "",
            body: "",
            attachments: &attachments,
        });
        assert_eq!(verdict.scores.attachments, 50);
    }

    #[test]
    fn test_total_is_clamped() {
        let attachments: Vec<_> = (0..6).map(|i| attachment(&format!("f{}.exe", i))).collect();
        let verdict = ContentClassifier::default().classify(&ContentInput {
            from: "no-reply@account.example.com",
            subject: "URGENT verify",
            body: "urgent bank click here",
            attachments: &attachments,
        });
        assert_eq!(verdict.scores.attachments, 150);
        assert_eq!(verdict.scores.total, 100);
    }
}
