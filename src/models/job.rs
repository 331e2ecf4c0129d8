use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Delivery budget for every job; the last delivery takes the heuristic path.
pub const MAX_ATTEMPTS: u32 = 3;

/// Status of a classification job, owned by the job queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

/// Sender-declared priority carried alongside the message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PriorityHint {
    High,
    Normal,
    Low,
}

/// Summary of an inbound message, as handed over by the ingestion process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageSummary {
    pub sender: String,
    pub subject: String,
    pub body_excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_hint: Option<PriorityHint>,
}

/// A pending classification job, one per inbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    /// Mailbox-scoped message id; doubles as the result cache key.
    pub subject_id: String,
    pub payload: MessageSummary,
    /// Failed deliveries so far. Maintained by the queue.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

fn default_max_attempts() -> u32 {
    MAX_ATTEMPTS
}

impl Job {
    pub fn new(subject_id: impl Into<String>, payload: MessageSummary) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: subject_id.into(),
            payload,
            attempts: 0,
            max_attempts: MAX_ATTEMPTS,
            enqueued_at: Utc::now(),
        }
    }

    /// True when no redelivery will follow a failure of this delivery.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts + 1 >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> MessageSummary {
        MessageSummary {
            sender: "alice@example.com".to_string(),
            subject: "Lunch?".to_string(),
            body_excerpt: "Are you free on Friday?".to_string(),
            priority_hint: None,
        }
    }

    #[test]
    fn test_new_job_starts_with_full_budget() {
        let job = Job::new("inbox/42", summary());
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, MAX_ATTEMPTS);
        assert!(!job.is_final_attempt());
    }

    #[test]
    fn test_final_attempt_is_third_delivery() {
        let mut job = Job::new("inbox/42", summary());
        job.attempts = 1;
        assert!(!job.is_final_attempt());
        job.attempts = 2;
        assert!(job.is_final_attempt());
    }

    #[test]
    fn test_priority_hint_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<PriorityHint>().unwrap(), PriorityHint::High);
        assert!("urgent".parse::<PriorityHint>().is_err());
    }
}
