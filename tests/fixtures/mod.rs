//! Sample inbound messages for pipeline tests

#![allow(dead_code)]

use inbox_triage::models::job::{MessageSummary, PriorityHint};

pub fn outage_report() -> MessageSummary {
    MessageSummary {
        sender: "ops-lead@example.com".to_string(),
        subject: "URGENT: production outage".to_string(),
        body_excerpt: "The checkout API is broken since 09:00. Please confirm you are on it.".to_string(),
        priority_hint: Some(PriorityHint::High),
    }
}

pub fn newsletter() -> MessageSummary {
    MessageSummary {
        sender: "newsletter@shop.example".to_string(),
        subject: "Weekend sale: 30% discount on everything".to_string(),
        body_excerpt: "Our biggest promotion of the year. Unsubscribe at any time.".to_string(),
        priority_hint: None,
    }
}

pub fn meeting_request() -> MessageSummary {
    MessageSummary {
        sender: "alice@example.com".to_string(),
        subject: "Can we reschedule the planning meeting?".to_string(),
        body_excerpt: "Thursday works better for me. Thanks!".to_string(),
        priority_hint: None,
    }
}

pub fn invoice_reminder() -> MessageSummary {
    MessageSummary {
        sender: "billing@vendor.example".to_string(),
        subject: "Invoice 2291 is overdue".to_string(),
        body_excerpt: "Payment of $420 was due last week.".to_string(),
        priority_hint: Some(PriorityHint::Normal),
    }
}

/// Every sample, for bulk runs.
pub fn all() -> Vec<MessageSummary> {
    vec![outage_report(), newsletter(), meeting_request(), invoice_reminder()]
}
