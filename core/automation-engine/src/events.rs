//! Event types flowing out of the topic graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Observable change of a topic's value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEvent {
    /// Monotonic sequence number across the process
    pub sequence: u64,

    /// Topic whose value changed
    pub topic: String,

    pub value: Value,

    pub previous_value: Value,

    pub timestamp: DateTime<Utc>,

    /// Topic whose update started this propagation chain
    pub trigger_topic: String,
}

impl TopicEvent {
    pub fn new(
        topic: impl Into<String>,
        value: Value,
        previous_value: Value,
        timestamp: DateTime<Utc>,
        trigger_topic: impl Into<String>,
    ) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        Self {
            sequence: COUNTER.fetch_add(1, Ordering::Relaxed),
            topic: topic.into(),
            value,
            previous_value,
            timestamp,
            trigger_topic: trigger_topic.into(),
        }
    }
}

/// Serialized value handed to the messaging transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Raw inbound delivery from the messaging transport
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Decode the payload: JSON when it parses, otherwise a lossy UTF-8 string
    pub fn decode(&self) -> Value {
        decode_payload(&self.payload)
    }
}

/// Parse a raw payload as JSON, falling back to a string value
pub fn decode_payload(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}
