//! Subscriber utilities and helpers

use crate::events::TopicEvent;
use tokio::sync::broadcast;

/// Receiving end of an [`UpdateBus`](crate::bus::UpdateBus) channel
pub struct Subscriber {
    receiver: broadcast::Receiver<TopicEvent>,
}

impl Subscriber {
    pub fn new(receiver: broadcast::Receiver<TopicEvent>) -> Self {
        Self { receiver }
    }

    /// Receive the next update, skipping past any lag
    ///
    /// Returns `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<TopicEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Subscriber lagged, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive without blocking
    pub fn try_recv(&mut self) -> Option<TopicEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Subscriber lagged, skipped {} updates", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain every update currently buffered
    pub fn drain(&mut self) -> Vec<TopicEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Fresh receiver starting at the current tail
    pub fn resubscribe(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
        }
    }
}
