//! Per-message transform: blank-line filtering, routing tag and record.
//!
//! Everything here is pure; the same message and config always produce the
//! same [`Envelope`].

use chrono::{DateTime, Utc};

use crate::config::ConnectorConfig;
use crate::message::{InboundMessage, Record};

/// A message ready to hand to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tag: String,
    pub timestamp: DateTime<Utc>,
    pub record: Record,
}

/// Transform an inbound message into an envelope.
///
/// Returns `None` when the log line is empty or whitespace only.
pub fn transform(msg: &InboundMessage, config: &ConnectorConfig) -> Option<Envelope> {
    if is_blank(&msg.data) {
        return None;
    }

    Some(Envelope {
        tag: build_tag(msg, &config.tag_prefix, &config.tag_suffix_label),
        timestamp: msg.timestamp,
        record: Record::from_message(msg),
    })
}

/// Check whether a log line holds only ASCII whitespace.
///
/// Space, tab, newline, vertical tab, form feed and carriage return count as
/// blank. Unicode spaces such as U+00A0 are content and get forwarded.
pub fn is_blank(data: &str) -> bool {
    data.chars()
        .all(|c| matches!(c, ' ' | '\t' | '\n' | '\x0b' | '\x0c' | '\r'))
}

/// Build the routing tag `prefix.suffix`.
///
/// The suffix is the value of the `suffix_label` container label, or
/// `name-hostname` when that label is missing or empty. With an empty prefix
/// the tag is the bare suffix.
pub fn build_tag(msg: &InboundMessage, prefix: &str, suffix_label: &str) -> String {
    let labelled = if suffix_label.is_empty() {
        None
    } else {
        msg.container_labels
            .get(suffix_label)
            .filter(|value| !value.is_empty())
    };

    let suffix = match labelled {
        Some(value) => value.clone(),
        None => format!("{}-{}", msg.container_name, msg.container_hostname),
    };

    if prefix.is_empty() {
        suffix
    } else {
        format!("{}.{}", prefix, suffix)
    }
}
