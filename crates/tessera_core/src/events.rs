//! Change events and listener registries.
//!
//! Every committed mutation produces one [`ChangeEvent`]. Events are
//! buffered while a transaction runs and delivered only after the engine
//! confirms the commit; an aborted transaction delivers nothing.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tessera_engine::Key;

/// What kind of mutation produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// An upsert, or an in-place cursor update.
    Set,
    /// An insert that required the key to be absent.
    Add,
    /// A deletion, including cursor deletes.
    Remove,
    /// The whole store was emptied. Carries no keys.
    Clear,
}

/// Where a change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    /// Produced by this database handle.
    Local,
    /// Received over the broadcast bus from another context.
    Remote,
}

/// A committed mutation, as seen by listeners.
///
/// A batch write emits a single event carrying every affected key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Store the mutation targeted.
    pub store: String,
    /// The mutation kind.
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Affected primary keys. Empty for [`ChangeKind::Clear`].
    pub keys: Vec<Key>,
    /// Local or remote origin.
    pub source: ChangeSource,
    /// Milliseconds since the Unix epoch when the event was emitted.
    pub timestamp: u64,
}

impl ChangeEvent {
    /// Builds a local event stamped with the current time.
    #[must_use]
    pub(crate) fn local(store: impl Into<String>, kind: ChangeKind, keys: Vec<Key>) -> Self {
        Self {
            store: store.into(),
            kind,
            keys,
            source: ChangeSource::Local,
            timestamp: now_millis(),
        }
    }

    /// The first affected key, for the common single-record case.
    #[must_use]
    pub fn key(&self) -> Option<&Key> {
        self.keys.first()
    }
}

/// A listener failure report, delivered on the error channel when a
/// registered callback panics.
#[derive(Debug, Clone)]
pub struct ListenerError {
    /// Store whose event was being dispatched, when known.
    pub store: Option<String>,
    /// The panic payload rendered as text.
    pub message: String,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Entries<E> = Arc<RwLock<Vec<(u64, Callback<E>)>>>;

/// A registry of callbacks for one event type.
///
/// Dispatch snapshots the callback list first, so a listener that
/// unsubscribes (or subscribes) during dispatch never deadlocks.
pub(crate) struct Listeners<E> {
    entries: Entries<E>,
    next_id: Arc<AtomicU64>,
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, Arc::new(callback)));
        let entries = Arc::downgrade(&self.entries);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(entries) = entries.upgrade() {
                    entries.write().retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Callback<E>> {
        self.entries
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }
}

impl Listeners<ChangeEvent> {
    /// Invokes every callback with the event. A panicking listener is
    /// isolated: remaining listeners still run, and the panic is reported
    /// on the error channel instead of unwinding into the caller.
    pub fn dispatch(&self, event: &ChangeEvent, errors: &Listeners<ListenerError>) {
        for callback in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(event)));
            if let Err(payload) = outcome {
                let message = panic_message(payload.as_ref());
                tracing::warn!(store = %event.store, %message, "change listener panicked");
                errors.dispatch_errors(&ListenerError {
                    store: Some(event.store.clone()),
                    message,
                });
            }
        }
    }
}

impl Listeners<ListenerError> {
    /// Error listeners are never isolated recursively; a panic here is
    /// swallowed after logging.
    pub fn dispatch_errors(&self, report: &ListenerError) {
        for callback in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| callback(report))).is_err() {
                tracing::warn!("error listener panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "listener panicked".to_string()
    }
}

/// Handle returned by the `on_change` family. Unsubscribing is idempotent;
/// the registration is removed on the first call and subsequent calls are
/// no-ops. Dropping the handle does NOT unsubscribe.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Removes the registration.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event() -> ChangeEvent {
        ChangeEvent::local("users", ChangeKind::Set, vec![Key::text("u1")])
    }

    #[test]
    fn subscribe_and_dispatch() {
        let listeners = Listeners::<ChangeEvent>::new();
        let errors = Listeners::<ListenerError>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = Arc::clone(&hits);
        let _sub = listeners.subscribe(move |_| {
            hits_in.fetch_add(1, Ordering::SeqCst);
        });
        listeners.dispatch(&event(), &errors);
        listeners.dispatch(&event(), &errors);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let listeners = Listeners::<ChangeEvent>::new();
        let errors = Listeners::<ListenerError>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = Arc::clone(&hits);
        let mut sub = listeners.subscribe(move |_| {
            hits_in.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        sub.unsubscribe();
        listeners.dispatch(&event(), &errors);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(listeners.is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let listeners = Listeners::<ChangeEvent>::new();
        let errors = Listeners::<ListenerError>::new();
        let reports = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));

        let reports_in = Arc::clone(&reports);
        let _err_sub = errors.subscribe(move |report: &ListenerError| {
            assert_eq!(report.store.as_deref(), Some("users"));
            assert!(report.message.contains("boom"));
            reports_in.fetch_add(1, Ordering::SeqCst);
        });

        let _bad = listeners.subscribe(|_| panic!("boom"));
        let hits_in = Arc::clone(&hits);
        let _good = listeners.subscribe(move |_| {
            hits_in.fetch_add(1, Ordering::SeqCst);
        });

        listeners.dispatch(&event(), &errors);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_serializes_camel_case() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["store"], "users");
        assert_eq!(json["type"], "set");
        assert_eq!(json["source"], "local");
        assert!(json["timestamp"].is_u64());
    }
}
