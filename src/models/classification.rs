use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Upper bound on `topics` in a stored result.
pub const MAX_TOPICS: usize = 3;
/// Limits below count characters, not bytes.
pub const MAX_SUMMARY_CHARS: usize = 500;
pub const MAX_LABEL_CHARS: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// Which path produced a classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClassificationMethod {
    Primary,
    Fallback,
    Heuristic,
}

/// A fully populated classification. Never mutated once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    #[garde(length(chars, min = 1, max = MAX_LABEL_CHARS))]
    pub category: String,

    #[garde(skip)]
    pub priority: Priority,

    #[garde(skip)]
    pub sentiment: Sentiment,

    #[garde(length(chars, min = 1, max = MAX_SUMMARY_CHARS))]
    pub summary: String,

    #[garde(length(max = MAX_TOPICS), inner(length(chars, min = 1, max = MAX_LABEL_CHARS)))]
    pub topics: Vec<String>,

    #[garde(skip)]
    pub action_required: bool,

    #[garde(skip)]
    pub method: ClassificationMethod,

    #[garde(skip)]
    pub produced_at: DateTime<Utc>,
}

/// Classification fields as returned by a model, before validation.
///
/// Enum-valued fields arrive as free text and are parsed case-insensitively.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelClassification {
    pub category: String,
    pub priority: String,
    pub sentiment: String,
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default, alias = "actionRequired")]
    pub action_required: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidClassification {
    #[error("Unknown priority: {0}")]
    Priority(String),

    #[error("Unknown sentiment: {0}")]
    Sentiment(String),

    #[error("Classification failed validation: {0}")]
    Validation(#[from] garde::Report),
}

impl ModelClassification {
    /// Convert into a stored result, trimming text and keeping at most
    /// [`MAX_TOPICS`] non-empty topics. Overlong text is cut to the field
    /// limits rather than rejected.
    pub fn into_result(
        self,
        method: ClassificationMethod,
        produced_at: DateTime<Utc>,
    ) -> Result<ClassificationResult, InvalidClassification> {
        let priority = self
            .priority
            .trim()
            .parse::<Priority>()
            .map_err(|_| InvalidClassification::Priority(self.priority.clone()))?;
        let sentiment = self
            .sentiment
            .trim()
            .parse::<Sentiment>()
            .map_err(|_| InvalidClassification::Sentiment(self.sentiment.clone()))?;

        let topics = self
            .topics
            .into_iter()
            .map(|t| truncate_chars(t.trim(), MAX_LABEL_CHARS))
            .filter(|t| !t.is_empty())
            .take(MAX_TOPICS)
            .collect();

        let result = ClassificationResult {
            category: truncate_chars(&self.category.trim().to_lowercase(), MAX_LABEL_CHARS),
            priority,
            sentiment,
            summary: truncate_chars(self.summary.trim(), MAX_SUMMARY_CHARS),
            topics,
            action_required: self.action_required,
            method,
            produced_at,
        };
        result.validate()?;
        Ok(result)
    }
}

/// First `max` characters of `text`, without a trailing space.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].trim_end().to_string(),
        None => text.to_string(),
    }
}
