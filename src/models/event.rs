use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classification::ClassificationResult;

/// Broadcast once per finished job for real-time consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub subject_id: String,
    pub result: ClassificationResult,
    pub timestamp: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn new(subject_id: impl Into<String>, result: ClassificationResult) -> Self {
        Self {
            subject_id: subject_id.into(),
            result,
            timestamp: Utc::now(),
        }
    }
}
