//! Explicit multi-store transactions.
//!
//! A [`Transaction`] wraps one engine transaction over a declared scope.
//! Mutations record change events into a buffer that the owning
//! [`Database`](crate::Database) drains and delivers only after the engine
//! confirms the commit; an abort discards the buffer.

use crate::error::{DbError, DbResult};
use crate::events::ChangeEvent;
use crate::request::await_transaction;
use crate::store::TransactionStore;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_engine::{EngineTransaction, Mode, StoreDefinition};

struct TxnState {
    finished: bool,
    aborted: bool,
    events: Vec<ChangeEvent>,
}

/// An explicit transaction over a fixed set of stores.
pub struct Transaction {
    engine: Mutex<Option<Box<dyn EngineTransaction>>>,
    state: Mutex<TxnState>,
    mode: Mode,
    scope: Vec<String>,
    definitions: Vec<StoreDefinition>,
}

impl Transaction {
    pub(crate) fn new(
        engine: Box<dyn EngineTransaction>,
        mode: Mode,
        definitions: Vec<StoreDefinition>,
    ) -> Self {
        Self {
            engine: Mutex::new(Some(engine)),
            state: Mutex::new(TxnState {
                finished: false,
                aborted: false,
                events: Vec::new(),
            }),
            mode,
            scope: definitions.iter().map(|d| d.name.clone()).collect(),
            definitions,
        }
    }

    /// The transaction's access mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The store names this transaction may touch.
    #[must_use]
    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Whether the transaction is still usable.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let state = self.state.lock();
        !state.finished && !state.aborted
    }

    /// Returns a typed handle onto a store within this transaction.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::TransactionInactive`] if the transaction has
    /// finished or the store is outside the declared scope.
    pub fn store<T>(&self, name: &str) -> DbResult<TransactionStore<'_, T>>
    where
        T: Serialize + DeserializeOwned,
    {
        {
            let state = self.state.lock();
            if state.finished || state.aborted {
                return Err(DbError::TransactionInactive {
                    message: format!("store {name} requested after transaction finished"),
                });
            }
        }
        let definition = self
            .definitions
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| DbError::TransactionInactive {
                message: format!(
                    "store {name} is outside this transaction's scope {:?}",
                    self.scope
                ),
            })?;
        let handle = {
            let guard = self.engine.lock();
            let engine = guard.as_ref().ok_or_else(|| DbError::TransactionInactive {
                message: format!("store {name} requested after transaction finished"),
            })?;
            engine.store(name).map_err(|error| {
                crate::error::map_engine_error(error, &crate::request::RequestContext::store(name))
            })?
        };
        Ok(TransactionStore::new(self, definition, handle))
    }

    /// Commits buffered work early. The transaction is unusable afterwards;
    /// recorded events stay buffered for the caller that finishes the
    /// enclosing block to deliver.
    ///
    /// # Errors
    ///
    /// Fails if the engine rejects the commit or the transaction already
    /// finished.
    pub fn commit(&self) -> DbResult<()> {
        let engine = self.engine.lock().take();
        let Some(engine) = engine else {
            return Err(DbError::TransactionInactive {
                message: "commit after transaction finished".to_string(),
            });
        };
        let result = await_transaction(engine.commit());
        let mut state = self.state.lock();
        state.finished = true;
        if result.is_err() {
            state.aborted = true;
            state.events.clear();
        }
        result
    }

    /// Rolls the transaction back, discarding buffered events.
    pub fn abort(&self) {
        if let Some(engine) = self.engine.lock().take() {
            let _ = engine.abort().wait();
        }
        let mut state = self.state.lock();
        state.finished = true;
        state.aborted = true;
        state.events.clear();
    }

    pub(crate) fn record_event(&self, event: ChangeEvent) {
        let mut state = self.state.lock();
        if !state.aborted {
            state.events.push(event);
        }
    }

    /// Commits any remaining engine work and drains the event buffer for
    /// delivery. An aborted transaction yields an error instead.
    pub(crate) fn finish(self) -> DbResult<Vec<ChangeEvent>> {
        let engine = self.engine.lock().take();
        {
            let state = self.state.lock();
            if state.aborted {
                return Err(DbError::aborted("transaction was rolled back"));
            }
        }
        if let Some(engine) = engine {
            await_transaction(engine.commit())?;
        }
        let mut state = self.state.lock();
        state.finished = true;
        Ok(std::mem::take(&mut state.events))
    }

    /// Rolls back and discards everything; used when a transaction body
    /// returns an error.
    pub(crate) fn finish_abort(self) {
        self.abort();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // An unfinished transaction rolls back rather than silently commit.
        if let Some(engine) = self.engine.lock().take() {
            let _ = engine.abort().wait();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Transaction")
            .field("mode", &self.mode)
            .field("scope", &self.scope)
            .field("finished", &state.finished)
            .field("aborted", &state.aborted)
            .finish()
    }
}
