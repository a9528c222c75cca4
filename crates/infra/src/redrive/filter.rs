//! Dead-letter message selection and diagnostics.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::queue::{ATTR_ERROR_TYPE_CANDIDATE, QueueMessage};

/// Coarse failure category, for display and logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Validation,
    Timeout,
    Transient,
    Processing,
    Permanent,
    Unknown,
}

const KEYWORDS: [(&str, ErrorCategory); 5] = [
    ("validation", ErrorCategory::Validation),
    ("timeout", ErrorCategory::Timeout),
    ("transient", ErrorCategory::Transient),
    ("processing", ErrorCategory::Processing),
    ("permanent", ErrorCategory::Permanent),
];

fn keyword_category(text: &str) -> Option<ErrorCategory> {
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, category)| *category)
}

/// Categorize by the ingest-time fault candidate, then the body text, then
/// how often the message was received.
pub fn categorize(message: &QueueMessage) -> ErrorCategory {
    if let Some(category) = message
        .attribute(ATTR_ERROR_TYPE_CANDIDATE)
        .and_then(keyword_category)
    {
        return category;
    }

    if let Some(category) = keyword_category(&message.body) {
        return category;
    }

    match message.receive_count {
        n if n >= 5 => ErrorCategory::Permanent,
        n if n >= 2 => ErrorCategory::Transient,
        _ => ErrorCategory::Unknown,
    }
}

/// Age since the message was first sent, in whole seconds.
pub fn age_seconds(message: &QueueMessage, now: DateTime<Utc>) -> i64 {
    now.signed_duration_since(message.sent_timestamp).num_seconds().max(0)
}

/// Which dead-letter messages a preview or redrive run selects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Case-insensitive substring of `errorTypeCandidate`. Empty matches all.
    pub error_type: String,
    pub min_age_seconds: u64,
}

impl MessageFilter {
    pub fn new(error_type: impl Into<String>, min_age_seconds: u64) -> Self {
        Self {
            error_type: error_type.into(),
            min_age_seconds,
        }
    }

    pub fn matches(&self, message: &QueueMessage, now: DateTime<Utc>) -> bool {
        if self.min_age_seconds > 0 && (age_seconds(message, now) as u64) < self.min_age_seconds {
            return false;
        }

        if !self.error_type.is_empty() {
            let candidate = message.attribute(ATTR_ERROR_TYPE_CANDIDATE).unwrap_or("");
            if !candidate
                .to_lowercase()
                .contains(&self.error_type.to_lowercase())
            {
                return false;
            }
        }

        true
    }
}
