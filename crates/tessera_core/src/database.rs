//! Database connection and lifecycle.

use crate::error::{map_engine_error, DbError, DbResult};
use crate::events::{ChangeEvent, ChangeSource, ListenerError, Listeners, Subscription};
use crate::request::RequestContext;
use crate::store::Store;
use crate::sync::{channel_for, BroadcastBus, BusHandler};
use crate::transaction::Transaction;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tessera_engine::{Engine, EngineTransaction, MemoryEngine, Mode, Schema};

/// An open connection to a Tessera database.
///
/// All access goes through typed [`Store`] handles or explicit
/// [`read`](Database::read)/[`write`](Database::write) transactions.
/// Change listeners registered here see every committed local mutation,
/// plus remote mutations when the database was opened with a bus.
pub struct Database {
    name: String,
    engine: Arc<dyn Engine>,
    db_listeners: Listeners<ChangeEvent>,
    store_listeners: RwLock<HashMap<String, Listeners<ChangeEvent>>>,
    error_listeners: Listeners<ListenerError>,
    bus: Option<Arc<dyn BroadcastBus>>,
    bus_id: u64,
    channel: String,
    open: AtomicBool,
}

impl Database {
    /// Opens a database over an engine, with no cross-context sync.
    #[must_use]
    pub fn open(name: impl Into<String>, engine: Arc<dyn Engine>) -> Arc<Self> {
        Self::build(name.into(), engine, None)
    }

    /// Opens a database over an engine and attaches it to a broadcast bus.
    ///
    /// Locally committed events are published on the database's channel;
    /// events received from other contexts are replayed to this database's
    /// listeners with their source forced to [`ChangeSource::Remote`].
    #[must_use]
    pub fn open_with_bus(
        name: impl Into<String>,
        engine: Arc<dyn Engine>,
        bus: Arc<dyn BroadcastBus>,
    ) -> Arc<Self> {
        Self::build(name.into(), engine, Some(bus))
    }

    /// Opens a fresh in-memory database with the given schema.
    #[must_use]
    pub fn open_in_memory(name: impl Into<String>, schema: Schema) -> Arc<Self> {
        Self::open(name, Arc::new(MemoryEngine::new(schema)))
    }

    fn build(name: String, engine: Arc<dyn Engine>, bus: Option<Arc<dyn BroadcastBus>>) -> Arc<Self> {
        let channel = channel_for(&name);
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let bus_id = match &bus {
                Some(bus) => {
                    let weak = Weak::clone(weak);
                    let handler: BusHandler = Arc::new(move |payload: &str| {
                        if let Some(db) = weak.upgrade() {
                            db.handle_remote(payload);
                        }
                    });
                    bus.subscribe(&channel, handler)
                }
                None => 0,
            };
            Self {
                name,
                engine,
                db_listeners: Listeners::new(),
                store_listeners: RwLock::new(HashMap::new()),
                error_listeners: Listeners::new(),
                bus,
                bus_id,
                channel,
                open: AtomicBool::new(true),
            }
        })
    }

    /// The database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema the engine was opened with.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        self.engine.schema()
    }

    /// Returns a typed handle onto a declared store.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::StoreNotFound`] if the name is not in the
    /// schema, or [`DbError::InvalidState`] if the database is closed.
    pub fn store<T>(self: &Arc<Self>, name: &str) -> DbResult<Store<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.ensure_open()?;
        let definition = self
            .schema()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::StoreNotFound {
                name: name.to_string(),
            })?;
        Ok(Store::new(Arc::clone(self), definition))
    }

    /// Runs a read-only transaction over the given stores.
    ///
    /// # Errors
    ///
    /// Returns whatever error the body produced, after rolling back.
    pub fn read<R>(
        self: &Arc<Self>,
        stores: &[&str],
        f: impl FnOnce(&Transaction) -> DbResult<R>,
    ) -> DbResult<R> {
        self.run_transaction(stores, Mode::ReadOnly, f)
    }

    /// Runs a read-write transaction over the given stores. On success the
    /// transaction commits and its buffered change events are delivered;
    /// on error everything rolls back and no events fire.
    ///
    /// # Errors
    ///
    /// Returns whatever error the body produced, after rolling back.
    pub fn write<R>(
        self: &Arc<Self>,
        stores: &[&str],
        f: impl FnOnce(&Transaction) -> DbResult<R>,
    ) -> DbResult<R> {
        self.run_transaction(stores, Mode::ReadWrite, f)
    }

    fn run_transaction<R>(
        self: &Arc<Self>,
        stores: &[&str],
        mode: Mode,
        f: impl FnOnce(&Transaction) -> DbResult<R>,
    ) -> DbResult<R> {
        let txn = self.begin(stores, mode)?;
        match f(&txn) {
            Ok(value) => {
                let events = txn.finish()?;
                self.emit_all(events);
                Ok(value)
            }
            Err(error) => {
                txn.finish_abort();
                Err(error)
            }
        }
    }

    pub(crate) fn begin(&self, stores: &[&str], mode: Mode) -> DbResult<Transaction> {
        self.ensure_open()?;
        let definitions = stores
            .iter()
            .map(|name| {
                self.schema()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| DbError::StoreNotFound {
                        name: (*name).to_string(),
                    })
            })
            .collect::<DbResult<Vec<_>>>()?;
        let engine = self.begin_engine(stores, mode)?;
        Ok(Transaction::new(engine, mode, definitions))
    }

    pub(crate) fn begin_engine(
        &self,
        stores: &[&str],
        mode: Mode,
    ) -> DbResult<Box<dyn EngineTransaction>> {
        self.engine
            .begin(stores, mode)
            .map_err(|error| map_engine_error(error, &RequestContext::none()))
    }

    /// Registers a listener for every committed change in the database.
    pub fn on_change(&self, callback: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Subscription {
        self.db_listeners.subscribe(callback)
    }

    /// Registers a listener for committed changes in one store.
    pub fn on_store_change(
        &self,
        store: &str,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.store_listeners
            .write()
            .entry(store.to_string())
            .or_insert_with(Listeners::new)
            .subscribe(callback)
    }

    /// Registers a listener for panics raised inside change listeners.
    pub fn on_listener_error(
        &self,
        callback: impl Fn(&ListenerError) + Send + Sync + 'static,
    ) -> Subscription {
        self.error_listeners.subscribe(callback)
    }

    pub(crate) fn emit_all(self: &Arc<Self>, events: Vec<ChangeEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn emit(&self, event: ChangeEvent) {
        self.fan_out(&event);
        if let Some(bus) = &self.bus {
            match serde_json::to_string(&event) {
                Ok(payload) => bus.publish(&self.channel, &payload, self.bus_id),
                Err(error) => {
                    tracing::warn!(store = %event.store, %error, "failed to encode change event")
                }
            }
        }
    }

    fn fan_out(&self, event: &ChangeEvent) {
        tracing::debug!(store = %event.store, kind = ?event.kind, keys = event.keys.len(), "change");
        self.db_listeners.dispatch(event, &self.error_listeners);
        let store_listeners = {
            let map = self.store_listeners.read();
            map.get(&event.store).cloned()
        };
        if let Some(listeners) = store_listeners {
            listeners.dispatch(event, &self.error_listeners);
        }
    }

    fn handle_remote(&self, payload: &str) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        match serde_json::from_str::<ChangeEvent>(payload) {
            Ok(mut event) => {
                // Anything arriving over the bus is remote by definition,
                // regardless of what the sender stamped.
                event.source = ChangeSource::Remote;
                self.fan_out(&event);
            }
            Err(error) => {
                tracing::warn!(%error, "discarding malformed bus payload");
            }
        }
    }

    /// Closes the connection. Later operations fail with
    /// [`DbError::InvalidState`]. Closing twice is a no-op.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            if let Some(bus) = &self.bus {
                bus.unsubscribe(&self.channel, self.bus_id);
            }
            tracing::debug!(name = %self.name, "database closed");
        }
    }

    pub(crate) fn ensure_open(&self) -> DbResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DbError::invalid_state(format!(
                "database {} is closed",
                self.name
            )))
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("open", &self.open.load(Ordering::Acquire))
            .field("synced", &self.bus.is_some())
            .finish()
    }
}
