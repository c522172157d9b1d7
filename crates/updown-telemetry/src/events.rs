//! Engine event stream.
//!
//! `EventBus` fans every `EngineEvent` out to broadcast subscribers, logs it
//! at its severity, and feeds the Prometheus counters. Publishing never
//! blocks and never fails: with no subscribers the event is still logged and
//! counted.

use crate::metrics::Metrics;
use tokio::sync::broadcast;
use tracing::{error, info, trace, warn};
use updown_core::{EngineEvent, EventSeverity};

/// Default broadcast capacity. Lagging subscribers lose the oldest events.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Log, count and broadcast an event.
    pub fn publish(&self, event: EngineEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        let kind = event.kind();
        match event.severity() {
            EventSeverity::Error => error!(kind, event = %payload, "engine event"),
            EventSeverity::Warn => warn!(kind, event = %payload, "engine event"),
            EventSeverity::Info => info!(kind, event = %payload, "engine event"),
        }

        Metrics::record_event(&event);

        // No receivers is normal when nothing is listening
        if self.tx.send(event).is_err() {
            trace!(kind, "No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
