//! Message Envelope
//!
//! The transport-agnostic record every adapter serializes and deserializes.
//! All three transports carry the same JSON shape verbatim:
//!
//! ```text
//! {
//!   "message_type":   "task.assign",
//!   "content":        { ... any JSON ... },
//!   "sender_id":      "agent-a",
//!   "priority":       "normal",
//!   "target_agent":   "agent-b",        (optional)
//!   "correlation_id": "c0ffee",         (optional)
//!   "timestamp":      "2024-05-01T12:00:00Z",
//!   "metadata":       { ... }
//! }
//! ```
//!
//! An envelope is immutable once handed to an adapter. Adapters work on a
//! stamped copy (see [`Envelope::stamped`]) when they need to fill in a
//! missing sender.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::AdapterError;

/// Delivery priority of an envelope
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background traffic
    Low,
    /// Regular traffic
    #[default]
    Normal,
    /// Should overtake normal traffic
    High,
    /// Must overtake everything else
    Critical,
}

impl Priority {
    /// Numeric priority used by the queue broker transport
    ///
    /// low=1, normal=5, high=8, critical=10
    #[must_use]
    pub fn broker_priority(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 8,
            Self::Critical => 10,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A message exchanged through the communication layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type, used to pick the inbound handler
    pub message_type: String,

    /// Arbitrary JSON payload
    pub content: Value,

    /// Identity of the sending agent (stamped by the adapter when empty)
    #[serde(default)]
    pub sender_id: String,

    /// Delivery priority
    #[serde(default)]
    pub priority: Priority,

    /// Intended recipient, if the sender named one
    #[serde(default, rename = "target_agent", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Correlates requests with replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Creation time (filled at construction or decode when absent)
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Open key/value metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Envelope {
    /// Create an envelope with normal priority, stamped with the current time
    pub fn new(
        message_type: impl Into<String>,
        content: impl Into<Value>,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            content: content.into(),
            sender_id: sender_id.into(),
            priority: Priority::Normal,
            target: None,
            correlation_id: None,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the intended recipient
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the correlation id
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach a fresh random correlation id
    #[must_use]
    pub fn with_new_correlation_id(self) -> Self {
        self.with_correlation_id(uuid::Uuid::new_v4().to_string())
    }

    /// Add one metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build a reply addressed to this envelope's sender
    ///
    /// The reply carries the same correlation id and priority.
    #[must_use]
    pub fn reply(
        &self,
        message_type: impl Into<String>,
        content: impl Into<Value>,
        sender_id: impl Into<String>,
    ) -> Self {
        let mut reply = Self::new(message_type, content, sender_id).with_priority(self.priority);
        reply.target = Some(self.sender_id.clone());
        reply.correlation_id = self.correlation_id.clone();
        reply
    }

    /// Copy of this envelope with `sender_id` filled in if it was empty
    ///
    /// Caller-supplied fields are never overwritten.
    #[must_use]
    pub fn stamped(&self, sender_id: &str) -> Self {
        let mut copy = self.clone();
        if copy.sender_id.is_empty() {
            copy.sender_id = sender_id.to_string();
        }
        copy
    }

    /// Check the required fields (`message_type`, `content`, `sender_id`)
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Parse` naming the first missing field.
    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.message_type.is_empty() {
            return Err(AdapterError::Parse("missing message_type".into()));
        }
        if self.content.is_null() {
            return Err(AdapterError::Parse("missing content".into()));
        }
        if self.sender_id.is_empty() {
            return Err(AdapterError::Parse("missing sender_id".into()));
        }
        Ok(())
    }

    /// Serialize to the wire format
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Parse` if required fields are missing or JSON
    /// serialization fails.
    pub fn to_wire(&self) -> Result<Vec<u8>, AdapterError> {
        self.validate()?;
        serde_json::to_vec(self).map_err(|e| AdapterError::Parse(e.to_string()))
    }

    /// Decode and validate an envelope from wire bytes
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Parse` on malformed JSON or missing fields.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, AdapterError> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| AdapterError::Parse(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Decode and validate an envelope from an already-parsed JSON value
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Parse` on shape mismatch or missing fields.
    pub fn from_value(value: Value) -> Result<Self, AdapterError> {
        let envelope: Self =
            serde_json::from_value(value).map_err(|e| AdapterError::Parse(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }
}
