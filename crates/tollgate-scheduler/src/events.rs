//! In-process event bus.

use async_trait::async_trait;
use futures::stream;
use tokio::sync::broadcast;
use tollgate_core::Result;
use tollgate_core::events::Event;
use tollgate_core::ports::{EventBus, EventStream};
use tracing::{debug, warn};

/// Event bus backed by a tokio broadcast channel.
///
/// Publishing never blocks and succeeds with no subscribers. A subscriber
/// that falls behind by more than the channel capacity skips the oldest
/// events.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        debug!(subject = %event.subject(), "Publishing event");
        // No receivers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream> {
        let rx = self.tx.subscribe();
        let events = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(events))
    }
}
