//! Outbound publication of topic values to the messaging transport

use crate::events::OutboundMessage;
use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::trace;

/// Channel capacity for outbound messages
const CHANNEL_CAPACITY: usize = 10000;

/// Transport seam for topics flagged `publish_externally`
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// Publisher that fans messages out to in-process transport tasks
///
/// A bridge task subscribes and forwards each [`OutboundMessage`] to the
/// broker. Publishing with no bridge attached is not an error.
pub struct ChannelPublisher {
    sender: broadcast::Sender<OutboundMessage>,
}

impl ChannelPublisher {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.sender.subscribe()
    }
}

impl Default for ChannelPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let message = OutboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            timestamp: Utc::now(),
        };
        if self.sender.send(message).is_err() {
            trace!("No transport attached, outbound message for {} discarded", topic);
        }
        Ok(())
    }
}
