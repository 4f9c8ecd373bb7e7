//! Positional cursors.
//!
//! Navigation consumes the cursor and hands back a new one, so a position
//! can never be read after it has been stepped past. Exhaustion yields
//! `Ok(None)` and, for cursors that own their transaction, commits it.

use crate::database::Database;
use crate::error::{DbError, DbResult};
use crate::events::{ChangeEvent, ChangeKind};
use crate::request::{await_request, await_transaction, RequestContext};
use crate::store::is_expired_value;
use crate::transaction::Transaction;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tessera_engine::{
    CursorHandle, CursorStep, Direction, EngineTransaction, Key, Query, TtlConfig,
};

/// Options for opening a cursor.
#[derive(Debug, Clone, Default)]
pub struct CursorOptions {
    /// Key restriction; `None` scans the whole store or index.
    pub query: Option<Query>,
    /// Scan direction.
    pub direction: Direction,
    /// For owning cursors only: open the backing transaction read-write so
    /// [`Cursor::update`] and [`Cursor::delete`] are allowed.
    pub writable: bool,
}

impl CursorOptions {
    /// Restricts the cursor to a key query.
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

    /// Opens the backing transaction read-write.
    #[must_use]
    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }
}

/// A transaction owned by a cursor or iterator, committed when the scan
/// finishes and buffering change events until then.
pub(crate) struct OwnedScope {
    db: Arc<Database>,
    engine: Option<Box<dyn EngineTransaction>>,
    events: Vec<ChangeEvent>,
}

impl OwnedScope {
    pub(crate) fn new(db: Arc<Database>, engine: Box<dyn EngineTransaction>) -> Self {
        Self {
            db,
            engine: Some(engine),
            events: Vec::new(),
        }
    }

    pub(crate) fn record_event(&mut self, event: ChangeEvent) {
        self.events.push(event);
    }

    /// Commits and delivers buffered events.
    pub(crate) fn finish(&mut self) -> DbResult<()> {
        if let Some(engine) = self.engine.take() {
            await_transaction(engine.commit())?;
            self.db.emit_all(std::mem::take(&mut self.events));
        }
        Ok(())
    }

    /// Rolls back, discarding buffered events.
    pub(crate) fn abort(&mut self) {
        if let Some(engine) = self.engine.take() {
            let _ = engine.abort().wait();
        }
        self.events.clear();
    }
}

impl Drop for OwnedScope {
    fn drop(&mut self) {
        // A dropped scope still commits so cursor writes are not silently
        // lost; a commit failure here is unobservable and delivers nothing.
        if let Some(engine) = self.engine.take() {
            if engine.commit().wait().is_ok() {
                self.db.emit_all(std::mem::take(&mut self.events));
            }
        }
    }
}

/// Who owns the transaction under a cursor.
pub(crate) enum CursorOwner<'a> {
    /// The cursor runs inside a caller's explicit transaction.
    Borrowed(&'a Transaction),
    /// The cursor carries its own transaction.
    Owned(OwnedScope),
}

impl CursorOwner<'_> {
    fn record_event(&mut self, event: ChangeEvent) {
        match self {
            Self::Borrowed(txn) => txn.record_event(event),
            Self::Owned(scope) => scope.record_event(event),
        }
    }

    fn finish(&mut self) -> DbResult<()> {
        match self {
            Self::Borrowed(_) => Ok(()),
            Self::Owned(scope) => scope.finish(),
        }
    }

    fn abort(&mut self) {
        if let Self::Owned(scope) = self {
            scope.abort();
        }
    }
}

/// A typed cursor over a store or index.
///
/// The cursor always sits on a row, so `key()`, `primary_key()` and
/// `value()` never dangle. Navigation consumes `self` and returns the
/// cursor at its new position, or `Ok(None)` once the scan is exhausted.
/// Store cursors skip expired records; index cursors do not filter.
pub struct Cursor<'a, T> {
    handle: Box<dyn CursorHandle>,
    store: String,
    ttl: Option<TtlConfig>,
    is_index: bool,
    owner: CursorOwner<'a>,
    key: Key,
    primary: Key,
    value: T,
}

impl<'a, T> Cursor<'a, T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn open(
        handle: Box<dyn CursorHandle>,
        store: String,
        ttl: Option<TtlConfig>,
        is_index: bool,
        owner: CursorOwner<'a>,
    ) -> DbResult<Option<Self>> {
        Self::settle(handle, store, ttl, is_index, owner, CursorStep::Next)
    }

    fn settle(
        mut handle: Box<dyn CursorHandle>,
        store: String,
        ttl: Option<TtlConfig>,
        is_index: bool,
        mut owner: CursorOwner<'a>,
        first: CursorStep,
    ) -> DbResult<Option<Self>> {
        let ctx = RequestContext::store(&store);
        let mut step = first;
        loop {
            let row = match await_request(handle.step(step), &ctx) {
                Ok(row) => row,
                Err(error) => {
                    owner.abort();
                    return Err(error);
                }
            };
            let Some(row) = row else {
                owner.finish()?;
                return Ok(None);
            };
            step = CursorStep::Next;
            let Some(value) = row.value else {
                owner.abort();
                return Err(DbError::data("cursor row carried no value"));
            };
            if let Some(ttl) = &ttl {
                if is_expired_value(&value, &ttl.field) {
                    continue;
                }
            }
            let decoded = match serde_json::from_value(value) {
                Ok(decoded) => decoded,
                Err(error) => {
                    owner.abort();
                    return Err(error.into());
                }
            };
            return Ok(Some(Self {
                handle,
                store,
                ttl,
                is_index,
                owner,
                key: row.key,
                primary: row.primary_key,
                value: decoded,
            }));
        }
    }

    fn resume(self, step: CursorStep) -> DbResult<Option<Self>> {
        Self::settle(
            self.handle,
            self.store,
            self.ttl,
            self.is_index,
            self.owner,
            step,
        )
    }

    /// Moves to the next row in scan order.
    pub fn next(self) -> DbResult<Option<Self>> {
        self.resume(CursorStep::Next)
    }

    /// Moves to the first row at or past `key` in scan order.
    pub fn next_at(self, key: impl Into<Key>) -> DbResult<Option<Self>> {
        self.resume(CursorStep::NextAt(key.into()))
    }

    /// Skips forward by `count` rows.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::Data`] when `count` is zero.
    pub fn advance(self, count: u32) -> DbResult<Option<Self>> {
        self.resume(CursorStep::Advance(count))
    }

    /// Moves to the first row at or past the `(index key, primary key)`
    /// pair. Index cursors only.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::InvalidState`] on a store cursor.
    pub fn next_pair(self, key: impl Into<Key>, primary: impl Into<Key>) -> DbResult<Option<Self>> {
        if !self.is_index {
            return Err(DbError::invalid_state(
                "pair navigation requires an index cursor",
            ));
        }
        self.resume(CursorStep::NextPair(key.into(), primary.into()))
    }

    /// Replaces the record at the current position. The replacement must
    /// keep the same primary key. Emits a `Set` event on commit.
    pub fn update(&mut self, record: &T) -> DbResult<Key> {
        let value = serde_json::to_value(record)?;
        let ctx = RequestContext::store(&self.store).key(self.primary.clone());
        let key = await_request(self.handle.update(value.clone()), &ctx)?;
        self.value = serde_json::from_value(value)?;
        self.owner.record_event(ChangeEvent::local(
            &self.store,
            ChangeKind::Set,
            vec![key.clone()],
        ));
        Ok(key)
    }

    /// Deletes the record at the current position. The cursor stays on the
    /// position and can still navigate onward. Emits a `Remove` event on
    /// commit.
    pub fn delete(&mut self) -> DbResult<()> {
        let ctx = RequestContext::store(&self.store).key(self.primary.clone());
        await_request(self.handle.delete(), &ctx)?;
        self.owner.record_event(ChangeEvent::local(
            &self.store,
            ChangeKind::Remove,
            vec![self.primary.clone()],
        ));
        Ok(())
    }

    /// The scan key: the index key for index cursors, otherwise the
    /// primary key.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The primary key of the current record.
    #[must_use]
    pub fn primary_key(&self) -> &Key {
        &self.primary
    }

    /// The current record.
    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The direction fixed at open time.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.handle.direction()
    }
}

impl<T> std::fmt::Debug for Cursor<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("store", &self.store)
            .field("key", &self.key)
            .field("primary", &self.primary)
            .finish()
    }
}

/// A key-only cursor: yields keys without materializing records, and
/// without TTL filtering.
pub struct KeyCursor<'a> {
    handle: Box<dyn CursorHandle>,
    is_index: bool,
    owner: CursorOwner<'a>,
    key: Key,
    primary: Key,
}

impl<'a> KeyCursor<'a> {
    pub(crate) fn open(
        handle: Box<dyn CursorHandle>,
        is_index: bool,
        owner: CursorOwner<'a>,
    ) -> DbResult<Option<Self>> {
        Self::settle(handle, is_index, owner, CursorStep::Next)
    }

    fn settle(
        mut handle: Box<dyn CursorHandle>,
        is_index: bool,
        mut owner: CursorOwner<'a>,
        step: CursorStep,
    ) -> DbResult<Option<Self>> {
        let row = match await_request(handle.step(step), &RequestContext::none()) {
            Ok(row) => row,
            Err(error) => {
                owner.abort();
                return Err(error);
            }
        };
        match row {
            Some(row) => Ok(Some(Self {
                handle,
                is_index,
                owner,
                key: row.key,
                primary: row.primary_key,
            })),
            None => {
                owner.finish()?;
                Ok(None)
            }
        }
    }

    /// Moves to the next key in scan order.
    pub fn next(self) -> DbResult<Option<Self>> {
        Self::settle(self.handle, self.is_index, self.owner, CursorStep::Next)
    }

    /// Moves to the first key at or past `key` in scan order.
    pub fn next_at(self, key: impl Into<Key>) -> DbResult<Option<Self>> {
        Self::settle(
            self.handle,
            self.is_index,
            self.owner,
            CursorStep::NextAt(key.into()),
        )
    }

    /// Skips forward by `count` keys.
    pub fn advance(self, count: u32) -> DbResult<Option<Self>> {
        Self::settle(
            self.handle,
            self.is_index,
            self.owner,
            CursorStep::Advance(count),
        )
    }

    /// Moves to the first `(index key, primary key)` pair at or past the
    /// given pair. Index cursors only.
    pub fn next_pair(self, key: impl Into<Key>, primary: impl Into<Key>) -> DbResult<Option<Self>> {
        if !self.is_index {
            return Err(DbError::invalid_state(
                "pair navigation requires an index cursor",
            ));
        }
        Self::settle(
            self.handle,
            self.is_index,
            self.owner,
            CursorStep::NextPair(key.into(), primary.into()),
        )
    }

    /// The scan key.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The primary key.
    #[must_use]
    pub fn primary_key(&self) -> &Key {
        &self.primary
    }

    /// The direction fixed at open time.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.handle.direction()
    }
}

impl std::fmt::Debug for KeyCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCursor")
            .field("key", &self.key)
            .field("primary", &self.primary)
            .finish()
    }
}
