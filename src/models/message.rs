// Message envelope - the unit of data flowing along workflow edges

//! # Message Models
//!
//! This module defines [`MessageValue`], the envelope carried along edges
//! during workflow execution. A message wraps an opaque JSON payload with
//! a content-type tag, free-form metadata, a creation timestamp, and the
//! provenance of the node that produced it.
//!
//! The metadata map doubles as the channel for routing decisions: a ROUTER
//! node writes its `selected_port` there, and downstream ROUTE_OUTPUT
//! edges read it back. The engine also stamps a monotonic `delivery_seq`
//! into metadata at delivery time so consumers can order inputs without
//! comparing wall-clock strings.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Key-value metadata attached to a message
pub type MessageMetadata = HashMap<String, serde_json::Value>;

/// Value object for messages passed between nodes
///
/// This represents data flowing through the workflow: message content,
/// metadata, and execution provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageValue {
    /// Unique message identifier
    pub id: String,

    /// Message content - string, structured mapping, boolean, or null
    pub content: serde_json::Value,

    /// Type tag of the content (text, json, boolean, ...) - informational
    pub content_type: String,

    /// Additional metadata, including routing decisions
    #[serde(default)]
    pub metadata: MessageMetadata,

    /// Creation timestamp
    pub timestamp: DateTime<Utc>,

    /// ID of the node that produced this message
    /// `None` means external/initial input
    pub source_node_id: Option<String>,
}

impl MessageValue {
    /// Create a new message with a generated ID and the current timestamp
    pub fn new<C: Into<String>>(
        content: serde_json::Value,
        content_type: C,
        source_node_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            content_type: content_type.into(),
            metadata: MessageMetadata::new(),
            timestamp: Utc::now(),
            source_node_id,
        }
    }

    /// Create a plain text message
    pub fn text<T: Into<String>>(text: T, source_node_id: Option<String>) -> Self {
        Self::new(serde_json::Value::String(text.into()), "text", source_node_id)
    }

    /// Set a metadata value, builder-style
    pub fn with_metadata<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Content coerced to a string for matching and display
    ///
    /// Unwraps a `text` field if the content is a mapping carrying one;
    /// strings are returned verbatim, everything else is JSON-rendered.
    pub fn content_as_text(&self) -> String {
        let content = match &self.content {
            serde_json::Value::Object(map) => map.get("text").unwrap_or(&self.content),
            other => other,
        };

        match content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Read an integer metadata value, tolerating string-encoded numbers
    pub fn metadata_as_i64(&self, key: &str) -> Option<i64> {
        match self.metadata.get(key)? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for MessageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.content_type[..], &self.content) {
            ("text", serde_json::Value::String(s)) => write!(f, "{}", s),
            (_, content) => write!(f, "{}", content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_message_display() {
        let message = MessageValue::text("hello", None);
        assert_eq!(message.to_string(), "hello");
        assert_eq!(message.content_type, "text");
        assert!(message.source_node_id.is_none());
    }

    #[test]
    fn test_content_as_text_unwraps_text_field() {
        let message = MessageValue::new(json!({"text": "inner", "extra": 1}), "json", None);
        assert_eq!(message.content_as_text(), "inner");

        let message = MessageValue::new(json!({"value": 42}), "json", None);
        assert_eq!(message.content_as_text(), r#"{"value":42}"#);
    }

    #[test]
    fn test_metadata_as_i64_coercion() {
        let message = MessageValue::text("x", None)
            .with_metadata("selected_port", json!(2))
            .with_metadata("as_string", json!("3"))
            .with_metadata("garbage", json!("not a number"));

        assert_eq!(message.metadata_as_i64("selected_port"), Some(2));
        assert_eq!(message.metadata_as_i64("as_string"), Some(3));
        assert_eq!(message.metadata_as_i64("garbage"), None);
        assert_eq!(message.metadata_as_i64("missing"), None);
    }

    #[test]
    fn test_serde_round_trip() {
        let message = MessageValue::new(json!({"k": [1, 2]}), "json", Some("node-1".into()))
            .with_metadata("selected_port", json!(0));

        let json = serde_json::to_string(&message).unwrap();
        let restored: MessageValue = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.id, message.id);
        assert_eq!(restored.content, message.content);
        assert_eq!(restored.metadata, message.metadata);
        assert_eq!(restored.source_node_id, message.source_node_id);
    }
}
