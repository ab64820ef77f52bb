//! Fan-out of push records to connected subscribers.
//!
//! The broadcaster keeps no history. A late subscriber must take a snapshot
//! first and then rely on the stream for deltas. Records for one entity reach
//! each subscriber in the order they were published because every publish
//! walks the subscriber list under a single mutex.

use plugin_sync_protocol::{PluginState, PushEvent};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::db::timestamp;

#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Sender<PushEvent>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<PushEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
            tracing::debug!(subscribers = subscribers.len(), "Subscriber attached");
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    pub fn state_changed(&self, repository: &str, to: PluginState) {
        self.publish(PushEvent::StateChanged {
            repository: repository.to_string(),
            to,
        });
    }

    pub fn heartbeat(&self) {
        self.publish(PushEvent::Heartbeat {
            at: timestamp(chrono::Utc::now()),
        });
    }

    /// Sends to every live subscriber and drops the ones whose receiver is gone.
    fn publish(&self, event: PushEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            tracing::warn!("Broadcaster mutex poisoned; dropping push record");
            return;
        };
        let before = subscribers.len();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        let dropped = before - subscribers.len();
        if dropped > 0 {
            tracing::debug!(
                dropped,
                remaining = subscribers.len(),
                "Subscribers detached"
            );
        }
    }
}
