//! Bridge from an async delivery stream into the synchronous registry

use crate::events::Delivery;
use crate::registry::TopicRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Apply deliveries one at a time, in arrival order, until the stream closes
///
/// Each delivery (and the propagation it triggers) runs on the blocking pool
/// so strategy execution never stalls the async runtime. Returns the number of
/// deliveries applied without error.
pub async fn run_ingest(registry: Arc<TopicRegistry>, mut deliveries: mpsc::Receiver<Delivery>) -> usize {
    let mut applied = 0;

    while let Some(delivery) = deliveries.recv().await {
        let topic = delivery.topic.clone();
        let registry = registry.clone();

        match tokio::task::spawn_blocking(move || registry.handle_delivery(&delivery)).await {
            Ok(Ok(_)) => applied += 1,
            Ok(Err(err)) => warn!("Failed to apply delivery for {}: {}", topic, err),
            Err(err) => error!("Delivery task for {} panicked: {}", topic, err),
        }
    }

    info!("Delivery stream closed after {} applied deliveries", applied);
    applied
}
