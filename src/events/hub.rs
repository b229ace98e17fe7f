//! Non-blocking fan-out of dashboard events.

use tokio::sync::broadcast;
use tracing::trace;

use super::model::DashboardEvent;

/// Broadcasts state changes to every connected dashboard.
///
/// Each subscriber owns a bounded ring of `capacity` events. Publishing never
/// waits: a subscriber that falls behind loses its oldest events and observes
/// `RecvError::Lagged` on its next receive, at which point it should resync
/// from a snapshot. There is no replay for subscribers that join later.
pub struct EventHub {
    tx: broadcast::Sender<DashboardEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: DashboardEvent) {
        let kind = event.kind();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(kind, delivered, "Event published");
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}
