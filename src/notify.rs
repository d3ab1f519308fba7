use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::VenueEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for venue events: one venue-wide channel plus lazily created
/// per-attraction channels.
pub struct NotifyHub {
    all: broadcast::Sender<VenueEvent>,
    channels: DashMap<String, broadcast::Sender<VenueEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    /// Every event the venue emits.
    pub fn subscribe_all(&self) -> broadcast::Receiver<VenueEvent> {
        self.all.subscribe()
    }

    /// Events concerning one attraction. Creates the channel if needed.
    pub fn subscribe(&self, attraction_id: &str) -> broadcast::Receiver<VenueEvent> {
        let sender = self
            .channels
            .entry(attraction_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: &VenueEvent) {
        metrics::counter!(
            crate::observability::EVENTS_TOTAL,
            "event" => crate::observability::event_label(event)
        )
        .increment(1);
        if let Some(id) = event.attraction_id()
            && let Some(sender) = self.channels.get(id)
        {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }

    /// Drop per-attraction channels nobody listens to. Returns how many went.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before.saturating_sub(self.channels.len())
    }

    /// Per-attraction channels currently held.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
