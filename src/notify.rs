use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-shop change events. Slot lists go stale the
/// moment a booking lands; subscribers use these events to refresh
/// incrementally instead of polling.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a shop's events. Creates the channel if needed.
    pub fn subscribe(&self, shop_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(shop_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, shop_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&shop_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a shop is deleted).
    pub fn remove(&self, shop_id: &Ulid) {
        self.channels.remove(shop_id);
    }
}

/// JSON payload for a notification, as handed to wire listeners.
pub fn payload(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let shop_id = Ulid::new();
        let mut rx = hub.subscribe(shop_id);

        let event = Event::ShopCreated {
            id: shop_id,
            name: "Fade Factory".into(),
        };
        hub.send(shop_id, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let shop_id = Ulid::new();
        // No subscriber — should not panic
        hub.send(shop_id, &Event::ShopDeleted { id: shop_id });
    }

    #[test]
    fn payload_is_valid_json() {
        let event = Event::ShopCreated {
            id: Ulid::new(),
            name: "Fade Factory".into(),
        };
        let parsed: serde_json::Value = serde_json::from_str(&payload(&event)).unwrap();
        assert!(parsed.is_object());
    }

    #[tokio::test]
    async fn remove_drops_channel() {
        let hub = NotifyHub::new();
        let shop_id = Ulid::new();
        let _rx = hub.subscribe(shop_id);
        hub.remove(&shop_id);
        // New sends are no-ops again
        hub.send(shop_id, &Event::ShopDeleted { id: shop_id });
    }
}
