//! Rule-based classification used when no provider could answer.
//!
//! Pure and infallible: every input produces a fully populated result.

use chrono::{DateTime, Utc};

use crate::models::classification::{
    truncate_chars, ClassificationMethod, ClassificationResult, Priority, Sentiment, MAX_TOPICS,
};
use crate::models::job::{MessageSummary, PriorityHint};

const SUMMARY_MAX_CHARS: usize = 200;
const DEFAULT_CATEGORY: &str = "general";

/// Category keyword table, in tie-break order.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("security", &["password", "security", "verify", "verification", "login", "2fa", "suspicious"]),
    ("finance", &["invoice", "payment", "receipt", "billing", "refund", "paid", "overdue"]),
    ("meeting", &["meeting", "calendar", "invite", "invitation", "schedule", "reschedule", "agenda"]),
    ("support", &["support", "ticket", "issue", "bug", "error", "outage", "broken"]),
    ("shipping", &["shipped", "shipping", "delivery", "tracking", "package", "order"]),
    ("marketing", &["unsubscribe", "newsletter", "promo", "promotion", "sale", "offer", "discount"]),
    ("social", &["party", "lunch", "dinner", "birthday", "congrats", "congratulations"]),
];

const URGENT_WORDS: &[&str] = &["urgent", "asap", "immediately", "critical", "emergency", "deadline", "overdue"];
const ACTION_WORDS: &[&str] = &["please", "reply", "respond", "confirm", "review", "approve", "sign", "action"];
const POSITIVE_WORDS: &[&str] = &["thanks", "thank", "great", "congrats", "congratulations", "appreciate", "happy", "excellent", "welcome"];
const NEGATIVE_WORDS: &[&str] = &["unfortunately", "problem", "issue", "complaint", "angry", "disappointed", "failed", "error", "broken", "cancel", "overdue"];
const AUTOMATED_SENDERS: &[&str] = &["noreply", "no-reply", "donotreply", "newsletter", "notifications", "mailer-daemon"];

/// Classify `message` without any network calls.
pub fn classify(message: &MessageSummary) -> ClassificationResult {
    classify_at(message, Utc::now())
}

pub fn classify_at(message: &MessageSummary, now: DateTime<Utc>) -> ClassificationResult {
    let words = tokenize(&format!("{} {}", message.subject, message.body_excerpt));
    let automated = is_automated_sender(&message.sender);

    let mut scored: Vec<(&str, usize)> = CATEGORY_KEYWORDS
        .iter()
        .map(|(category, keywords)| (*category, count_matches(&words, keywords)))
        .filter(|(_, score)| *score > 0)
        .collect();
    // Stable sort keeps table order on ties.
    scored.sort_by(|a, b| b.1.cmp(&a.1));

    let category = match scored.first() {
        Some((category, _)) => category.to_string(),
        None if automated => "notification".to_string(),
        None => DEFAULT_CATEGORY.to_string(),
    };

    let mut topics: Vec<String> = scored
        .iter()
        .take(MAX_TOPICS)
        .map(|(category, _)| category.to_string())
        .collect();
    if topics.is_empty() {
        topics.push(category.clone());
    }

    let urgent = count_matches(&words, URGENT_WORDS) > 0;
    let priority = match message.priority_hint {
        Some(PriorityHint::High) => Priority::High,
        Some(PriorityHint::Low) => Priority::Low,
        _ if urgent => Priority::High,
        _ if automated || category == "marketing" => Priority::Low,
        _ => Priority::Medium,
    };

    let positive = count_matches(&words, POSITIVE_WORDS);
    let negative = count_matches(&words, NEGATIVE_WORDS);
    let sentiment = match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Sentiment::Positive,
        std::cmp::Ordering::Less => Sentiment::Negative,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    };

    let asks_question = message.subject.contains('?') || message.body_excerpt.contains('?');
    let action_required = !automated
        && (priority == Priority::High || asks_question || count_matches(&words, ACTION_WORDS) > 0);

    ClassificationResult {
        category,
        priority,
        sentiment,
        summary: summarize(message),
        topics,
        action_required,
        method: ClassificationMethod::Heuristic,
        produced_at: now,
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn count_matches(words: &[String], keywords: &[&str]) -> usize {
    words
        .iter()
        .filter(|w| keywords.contains(&w.as_str()))
        .count()
}

fn is_automated_sender(sender: &str) -> bool {
    let local = sender
        .rsplit('<')
        .next()
        .unwrap_or(sender)
        .split('@')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    AUTOMATED_SENDERS.iter().any(|marker| local.contains(marker))
}

fn summarize(message: &MessageSummary) -> String {
    let source = if message.subject.trim().is_empty() {
        message.body_excerpt.trim()
    } else {
        message.subject.trim()
    };
    if source.is_empty() {
        return "(no subject)".to_string();
    }
    let collapsed = source.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SUMMARY_MAX_CHARS {
        collapsed
    } else {
        format!("{}...", truncate_chars(&collapsed, SUMMARY_MAX_CHARS - 3))
    }
}
