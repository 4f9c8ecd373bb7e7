//! Bridging engine requests into typed results.
//!
//! Engine operations return [`Pending`] handles that settle exactly once.
//! The adapter here blocks on the settle, then maps engine errors into the
//! [`DbError`](crate::DbError) taxonomy with whatever store/index/key
//! context the caller had in hand.

use crate::error::{map_engine_error, DbResult};
use tessera_engine::{Key, Pending};

/// Context attached to an in-flight engine request, used to enrich error
/// messages when the engine fails without naming its target.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestContext {
    pub store: Option<String>,
    pub index: Option<String>,
    pub key: Option<Key>,
}

impl RequestContext {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn store(store: impl Into<String>) -> Self {
        Self {
            store: Some(store.into()),
            ..Self::default()
        }
    }

    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    /// Renders the request target for error messages, when any part of it
    /// is known.
    pub fn describe(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(store) = &self.store {
            parts.push(format!("store {store}"));
        }
        if let Some(index) = &self.index {
            parts.push(format!("index {index}"));
        }
        if let Some(key) = &self.key {
            parts.push(format!("key {key}"));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

/// Blocks until the engine settles the request, mapping failure into the
/// typed taxonomy.
pub(crate) fn await_request<T>(pending: Pending<T>, ctx: &RequestContext) -> DbResult<T> {
    pending.wait().map_err(|error| map_engine_error(error, ctx))
}

/// Blocks on a transaction-lifecycle request. Abort outcomes become
/// [`DbError::TransactionAborted`].
pub(crate) fn await_transaction(pending: Pending<()>) -> DbResult<()> {
    pending
        .wait()
        .map_err(|error| map_engine_error(error, &RequestContext::none()))
}
