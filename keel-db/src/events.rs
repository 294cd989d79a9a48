//! Update-event bus.
//!
//! Every committed write publishes one event after its batch is visible.
//! Subscriptions listen on a bounded broadcast channel; receivers that fall
//! too far behind simply miss events (and slow subscription deliveries are
//! dropped by the sender, see `Database::subscribe`).

use tokio::sync::broadcast;

/// Capacity of the broadcast channel feeding subscriptions.
const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub collection: String,
    pub dockey: String,
    /// Composite commit CID of the write.
    pub cid: String,
}

#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<UpdateEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event. A bus with no listeners swallows it.
    pub fn publish(&self, event: UpdateEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let event = UpdateEvent {
            collection: "user".into(),
            dockey: "bae-1".into(),
            cid: "bafyfake".into(),
        };
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn publish_without_listeners_is_fine() {
        let bus = EventBus::new();
        bus.publish(UpdateEvent {
            collection: "user".into(),
            dockey: "bae-1".into(),
            cid: "bafyfake".into(),
        });
    }
}
