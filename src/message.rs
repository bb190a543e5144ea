//! Message types flowing through the forwarder.
//!
//! [`InboundMessage`] is produced by the host process, one per container log
//! line. [`Record`] is the payload sent to the collector for an accepted line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single container log line handed to the forwarder by the host process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Container ID
    pub container_id: String,

    /// Container name
    pub container_name: String,

    /// Hostname configured for the container
    #[serde(default)]
    pub container_hostname: String,

    /// Container labels
    #[serde(default)]
    pub container_labels: HashMap<String, String>,

    /// Raw log line
    pub data: String,

    /// Stream the line came from, e.g. `stdout` or `stderr`
    #[serde(default)]
    pub source: String,

    /// Time the line was observed
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Create a new message stamped with the current time.
    pub fn new(
        container_id: impl Into<String>,
        container_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            container_name: container_name.into(),
            container_hostname: String::new(),
            container_labels: HashMap::new(),
            data: data.into(),
            source: "stdout".to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Set the container hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.container_hostname = hostname.into();
        self
    }

    /// Add a container label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.container_labels.insert(key.into(), value.into());
        self
    }

    /// Set the output stream.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the observation time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// The record forwarded to the collector.
///
/// Always carries exactly the keys `log`, `container_id`, `container_name`
/// and `source`, copied verbatim from the inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub log: String,
    pub container_id: String,
    pub container_name: String,
    pub source: String,
}

impl Record {
    /// Build the record for an inbound message.
    pub fn from_message(msg: &InboundMessage) -> Self {
        Self {
            log: msg.data.clone(),
            container_id: msg.container_id.clone(),
            container_name: msg.container_name.clone(),
            source: msg.source.clone(),
        }
    }

    /// Key/value pairs in wire order.
    pub fn fields(&self) -> [(&'static str, &str); 4] {
        [
            ("log", self.log.as_str()),
            ("container_id", self.container_id.as_str()),
            ("container_name", self.container_name.as_str()),
            ("source", self.source.as_str()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_deserialization() {
        let json = r#"{
            "container_id": "abc123",
            "container_name": "web1",
            "container_hostname": "host-a",
            "container_labels": {"svc": "api"},
            "data": "GET / 200",
            "source": "stderr",
            "timestamp": "2024-05-01T12:00:00.250Z"
        }"#;

        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.container_id, "abc123");
        assert_eq!(msg.container_name, "web1");
        assert_eq!(msg.container_hostname, "host-a");
        assert_eq!(msg.container_labels.get("svc").map(String::as_str), Some("api"));
        assert_eq!(msg.data, "GET / 200");
        assert_eq!(msg.source, "stderr");
        assert_eq!(msg.timestamp.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_inbound_message_optional_fields() {
        let json = r#"{
            "container_id": "abc123",
            "container_name": "web1",
            "data": "hello",
            "timestamp": "2024-05-01T12:00:00Z"
        }"#;

        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert!(msg.container_labels.is_empty());
        assert_eq!(msg.container_hostname, "");
        assert_eq!(msg.source, "");
    }

    #[test]
    fn test_record_copies_fields_verbatim() {
        let msg = InboundMessage::new("id-1", "/web1", "  padded line\t")
            .with_source("stderr");
        let record = Record::from_message(&msg);

        assert_eq!(record.log, "  padded line\t");
        assert_eq!(record.container_id, "id-1");
        assert_eq!(record.container_name, "/web1");
        assert_eq!(record.source, "stderr");
    }

    #[test]
    fn test_record_fields_order() {
        let record = Record::from_message(&InboundMessage::new("id", "name", "line"));
        let keys: Vec<&str> = record.fields().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, ["log", "container_id", "container_name", "source"]);
    }
}
