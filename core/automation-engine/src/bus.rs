//! Broadcast bus for observable topic updates

use crate::events::TopicEvent;
use crate::subscriber::Subscriber;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Channel capacity for each topic
const CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the all-topics channel
const FIREHOSE_CAPACITY: usize = 10000;

/// Fan-out of topic updates to in-process observers
///
/// Publishing never blocks and never fails: an update with no subscribers is
/// counted as dropped.
pub struct UpdateBus {
    /// Broadcast channel per topic name
    channels: Arc<DashMap<String, broadcast::Sender<TopicEvent>>>,

    /// Every update, regardless of topic
    firehose: broadcast::Sender<TopicEvent>,

    /// Statistics per topic
    stats: Arc<DashMap<String, UpdateStats>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateStats {
    pub published: u64,
    pub dropped: u64,
}

impl UpdateBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
            stats: Arc::new(DashMap::new()),
        }
    }

    /// Broadcast an update on its topic channel and the firehose
    pub fn publish(&self, event: TopicEvent) {
        let topic = event.topic.clone();
        let _ = self.firehose.send(event.clone());

        let sender = self.channels.get(&topic).map(|entry| entry.value().clone());
        let delivered = match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        };

        let mut stats = self.stats.entry(topic).or_default();
        if delivered {
            stats.published += 1;
        } else {
            stats.dropped += 1;
        }
    }

    /// Subscribe to updates of one topic
    pub fn subscribe(&self, topic: &str) -> Subscriber {
        let sender = self
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!("Creating new update channel for topic: {}", topic);
                broadcast::channel(CHANNEL_CAPACITY).0
            })
            .clone();

        Subscriber::new(sender.subscribe())
    }

    /// Subscribe to updates of every topic
    pub fn subscribe_all(&self) -> Subscriber {
        Subscriber::new(self.firehose.subscribe())
    }

    /// Drop the channel of a removed topic
    pub fn close(&self, topic: &str) {
        if self.channels.remove(topic).is_some() {
            debug!("Closed update channel for topic: {}", topic);
        }
    }

    pub fn get_stats(&self) -> Vec<(String, UpdateStats)> {
        let mut stats: Vec<(String, UpdateStats)> = self
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    pub fn stats_for(&self, topic: &str) -> UpdateStats {
        self.stats
            .get(topic)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new()
    }
}
