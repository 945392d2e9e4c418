//! The pluggable inference capability. The marketplace only ever sees the
//! trait; the bundled implementation is a keyword heuristic scoring spam
//! probability, which is all the demo marketplace models require.

use async_trait::async_trait;
use color_eyre::eyre::Result;
use mockall::automock;
use serde::Serialize;

pub const LABEL_SPAM: &str = "SPAM";
pub const LABEL_NOT_SPAM: &str = "NOT_SPAM";

/// Output of one classification. `confidence` is the spam probability in
/// [0, 1]; the label is `SPAM` exactly when it exceeds 0.5.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub version: String,
    pub labels: Vec<String>,
}

/// Idempotent, side-effect-free classification capability.
#[automock]
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification>;

    fn info(&self) -> BackendInfo;
}

/// Weighted phrase markers. Hit counts are additive; the sum is clamped into
/// an open probability interval so neither label is ever reported with full
/// certainty.
const SPAM_MARKERS: &[(&str, f64)] = &[
    ("congratulations", 0.20),
    ("click here", 0.20),
    ("you've won", 0.20),
    ("you have won", 0.20),
    ("free money", 0.20),
    ("act now", 0.20),
    ("get rich", 0.20),
    ("lottery", 0.20),
    ("viagra", 0.30),
    ("winner", 0.15),
    ("prize", 0.15),
    ("urgent", 0.15),
    ("limited time", 0.15),
    ("work from home", 0.15),
    ("million", 0.15),
    ("investment opportunity", 0.15),
    ("claim your", 0.15),
    ("verify your account", 0.15),
    ("credit card", 0.10),
];

const MIN_CONFIDENCE: f64 = 0.02;
const MAX_CONFIDENCE: f64 = 0.98;

#[derive(Debug, Clone, Default)]
pub struct RuleBasedSpamClassifier;

impl RuleBasedSpamClassifier {
    pub fn new() -> Self {
        Self
    }

    fn score(text: &str) -> f64 {
        let lower = text.to_lowercase();
        let mut score = 0.0;

        for (marker, weight) in SPAM_MARKERS {
            if lower.contains(marker) {
                score += weight;
            }
        }
        if text.matches('!').count() >= 3 {
            score += 0.15;
        }
        if text.contains('$') {
            score += 0.10;
        }

        let letters = text.chars().filter(char::is_ascii_alphabetic).count();
        let uppercase = text.chars().filter(char::is_ascii_uppercase).count();
        if letters > 0 && uppercase as f64 / letters as f64 > 0.3 {
            score += 0.15;
        }

        score.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
    }
}

#[async_trait]
impl InferenceBackend for RuleBasedSpamClassifier {
    async fn classify(&self, text: &str) -> Result<Classification> {
        let confidence = Self::score(text);
        let label = if confidence > 0.5 { LABEL_SPAM } else { LABEL_NOT_SPAM };
        Ok(Classification { label: label.to_string(), confidence })
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "rule-based-spam-classifier".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            labels: vec![LABEL_SPAM.to_string(), LABEL_NOT_SPAM.to_string()],
        }
    }
}
