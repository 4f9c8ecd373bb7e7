//! Lazy record and key iteration.
//!
//! Iterators carry their own read transaction, pull one row per `next`
//! call, and commit the transaction when the scan is exhausted or the
//! iterator is dropped.

use crate::cursor::OwnedScope;
use crate::error::DbResult;
use crate::request::{await_request, RequestContext};
use crate::store::is_expired_value;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use tessera_engine::{CursorHandle, CursorStep, Direction, Key, Query, TtlConfig};

/// Options for [`Store::iterate`](crate::Store::iterate) and
/// [`Store::iterate_keys`](crate::Store::iterate_keys).
#[derive(Debug, Clone, Default)]
pub struct IterateOptions {
    /// Key restriction; `None` scans the whole store.
    pub query: Option<Query>,
    /// Scan direction.
    pub direction: Direction,
}

impl IterateOptions {
    /// Restricts the scan to a key query.
    #[must_use]
    pub fn query(mut self, query: impl Into<Query>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Sets the scan direction.
    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

/// A lazy iterator over typed records. Expired records are skipped.
pub struct RecordIter<T> {
    handle: Box<dyn CursorHandle>,
    scope: OwnedScope,
    store: String,
    ttl: Option<TtlConfig>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RecordIter<T> {
    pub(crate) fn new(
        handle: Box<dyn CursorHandle>,
        scope: OwnedScope,
        store: String,
        ttl: Option<TtlConfig>,
    ) -> Self {
        Self {
            handle,
            scope,
            store,
            ttl,
            done: false,
            _marker: PhantomData,
        }
    }
}

impl<T> Iterator for RecordIter<T>
where
    T: DeserializeOwned,
{
    type Item = DbResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let ctx = RequestContext::store(&self.store);
        loop {
            let row = match await_request(self.handle.step(CursorStep::Next), &ctx) {
                Ok(row) => row,
                Err(error) => {
                    self.done = true;
                    self.scope.abort();
                    return Some(Err(error));
                }
            };
            let Some(row) = row else {
                self.done = true;
                return match self.scope.finish() {
                    Ok(()) => None,
                    Err(error) => Some(Err(error)),
                };
            };
            let Some(value) = row.value else {
                continue;
            };
            if let Some(ttl) = &self.ttl {
                if is_expired_value(&value, &ttl.field) {
                    continue;
                }
            }
            return match serde_json::from_value(value) {
                Ok(record) => Some(Ok(record)),
                Err(error) => {
                    self.done = true;
                    self.scope.abort();
                    Some(Err(error.into()))
                }
            };
        }
    }
}

impl<T> std::fmt::Debug for RecordIter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordIter")
            .field("store", &self.store)
            .field("done", &self.done)
            .finish()
    }
}

/// A lazy iterator over primary keys. No TTL filtering applies.
pub struct KeyIter {
    handle: Box<dyn CursorHandle>,
    scope: OwnedScope,
    store: String,
    done: bool,
}

impl KeyIter {
    pub(crate) fn new(handle: Box<dyn CursorHandle>, scope: OwnedScope, store: String) -> Self {
        Self {
            handle,
            scope,
            store,
            done: false,
        }
    }
}

impl Iterator for KeyIter {
    type Item = DbResult<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let ctx = RequestContext::store(&self.store);
        match await_request(self.handle.step(CursorStep::Next), &ctx) {
            Ok(Some(row)) => Some(Ok(row.primary_key)),
            Ok(None) => {
                self.done = true;
                match self.scope.finish() {
                    Ok(()) => None,
                    Err(error) => Some(Err(error)),
                }
            }
            Err(error) => {
                self.done = true;
                self.scope.abort();
                Some(Err(error))
            }
        }
    }
}

impl std::fmt::Debug for KeyIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyIter")
            .field("store", &self.store)
            .field("done", &self.done)
            .finish()
    }
}
