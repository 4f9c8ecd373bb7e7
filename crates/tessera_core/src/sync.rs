//! Cross-context change propagation.
//!
//! Databases opened with a bus publish every locally committed event on a
//! channel derived from the database name, and replay events received
//! from other contexts to their own listeners with the source forced to
//! [`Remote`](crate::ChangeSource::Remote). Remote events are never
//! re-published, so two connected contexts cannot loop.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Channel name prefix shared by every database on a bus.
pub const CHANNEL_PREFIX: &str = "tessera:";

/// Returns the bus channel for a database name.
#[must_use]
pub fn channel_for(db_name: &str) -> String {
    format!("{CHANNEL_PREFIX}{db_name}")
}

/// A bus message handler. Receives the JSON-encoded event payload.
pub type BusHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Transport for propagating change events between contexts.
///
/// Implementations deliver a published payload to every subscriber of the
/// channel except the publisher itself, identified by the subscriber id
/// returned from [`subscribe`](BroadcastBus::subscribe).
pub trait BroadcastBus: Send + Sync {
    /// Registers a handler on a channel and returns its subscriber id.
    fn subscribe(&self, channel: &str, handler: BusHandler) -> u64;

    /// Removes a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, channel: &str, id: u64);

    /// Delivers `payload` to every channel subscriber except `sender`.
    fn publish(&self, channel: &str, payload: &str, sender: u64);
}

/// In-process bus for tests and single-process multi-handle setups.
pub struct LocalBus {
    channels: RwLock<HashMap<String, Vec<(u64, BusHandler)>>>,
    next_id: AtomicU64,
}

impl LocalBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus for LocalBus {
    fn subscribe(&self, channel: &str, handler: BusHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn unsubscribe(&self, channel: &str, id: u64) {
        if let Some(subscribers) = self.channels.write().get_mut(channel) {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    fn publish(&self, channel: &str, payload: &str, sender: u64) {
        // Snapshot before invoking so a handler can re-enter the bus.
        let handlers: Vec<BusHandler> = match self.channels.read().get(channel) {
            Some(subscribers) => subscribers
                .iter()
                .filter(|(id, _)| *id != sender)
                .map(|(_, handler)| Arc::clone(handler))
                .collect(),
            None => return,
        };
        for handler in handlers {
            handler(payload);
        }
    }
}
