//! In-process subscription bus.
//!
//! Core notifications fan out over a broadcast channel; a listener thread
//! echoes them to the log.

use std::thread::JoinHandle;

use sound_core::SubscriptionSink;
use sound_core_types::SubscriptionEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SubscriptionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionSink for EventBus {
    fn post(&self, event: SubscriptionEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

/// Log every notification at debug level until all senders are gone.
pub fn spawn_event_logger(bus: &EventBus) -> std::io::Result<JoinHandle<()>> {
    let mut rx = bus.subscribe();
    std::thread::Builder::new()
        .name("event-logger".to_string())
        .spawn(move || {
            loop {
                match rx.blocking_recv() {
                    Ok(event) => tracing::debug!(
                        facility = ?event.facility,
                        kind = ?event.kind,
                        index = event.index,
                        "subscription event"
                    ),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event logger lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
}
