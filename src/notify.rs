use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking notifications. Downstream delivery (email,
/// push) subscribes here; the core fires and forgets.
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

    /// Subscribe to events for a booking. Creates the channel if needed.
    pub fn subscribe(&self, booking_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(booking_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, booking_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&booking_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel once a booking is terminal and drained.
    pub fn remove(&self, booking_id: &Ulid) {
        self.channels.remove(booking_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let bid = Ulid::new();
        let mut rx = hub.subscribe(bid);

        let event = Event::BookingConfirmed { id: bid, at: 1000 };
        hub.send(bid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let bid = Ulid::new();
        // No subscriber — should not panic or block
        hub.send(bid, &Event::BookingCompleted { id: bid, at: 2000 });
    }

    #[tokio::test]
    async fn removed_channel_drops_subscribers() {
        let hub = NotifyHub::new();
        let bid = Ulid::new();
        let mut rx = hub.subscribe(bid);
        hub.remove(&bid);
        hub.send(bid, &Event::BookingCompleted { id: bid, at: 1 });
        assert!(rx.try_recv().is_err());
    }
}
