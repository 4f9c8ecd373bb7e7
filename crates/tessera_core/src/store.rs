//! Typed store surfaces.
//!
//! [`TransactionStore`] borrows an explicit transaction and performs all
//! record operations through it. [`Store`] is the owning convenience
//! surface: every call opens a single-store transaction, delegates, and
//! commits. Both encode records through serde, so any `Serialize +
//! DeserializeOwned` type works as a record.
//!
//! Stores with TTL enabled filter expired records out of every
//! record-returning read. Expired records remain physically present (they
//! still count, and still occupy their keys) until [`prune`] removes them.
//!
//! [`prune`]: TransactionStore::prune

use crate::cursor::{Cursor, CursorOptions, CursorOwner, KeyCursor, OwnedScope};
use crate::database::Database;
use crate::error::{map_engine_error, DbError, DbResult};
use crate::events::{ChangeEvent, ChangeKind, Subscription};
use crate::index::{Index, TransactionIndex};
use crate::iter::{IterateOptions, KeyIter, RecordIter};
use crate::query::QueryBuilder;
use crate::request::{await_request, RequestContext};
use crate::transaction::Transaction;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tessera_engine::{Key, Mode, Query, StoreDefinition, StoreHandle};

/// Outcome of a [`prune`](TransactionStore::prune) pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    /// Expired records physically removed.
    pub pruned: u64,
    /// Records remaining after the pass.
    pub remaining: u64,
}

/// Returns true when `record` carries an expiry timestamp at or before now.
pub(crate) fn is_expired_value(record: &Value, ttl_field: &str) -> bool {
    match record.get(ttl_field).and_then(Value::as_f64) {
        Some(expires_at) => expires_at <= crate::events::now_millis() as f64,
        None => false,
    }
}

/// A typed handle onto one store within an explicit [`Transaction`].
pub struct TransactionStore<'a, T> {
    txn: &'a Transaction,
    definition: StoreDefinition,
    handle: Box<dyn StoreHandle>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T> TransactionStore<'a, T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(
        txn: &'a Transaction,
        definition: StoreDefinition,
        handle: Box<dyn StoreHandle>,
    ) -> Self {
        Self {
            txn,
            definition,
            handle,
            _marker: PhantomData,
        }
    }

    /// The store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Whether this store has TTL enabled.
    #[must_use]
    pub fn has_ttl(&self) -> bool {
        self.definition.ttl.is_some()
    }

    fn ctx(&self) -> RequestContext {
        RequestContext::store(self.name())
    }

    fn encode(&self, record: &T) -> DbResult<Value> {
        serde_json::to_value(record).map_err(DbError::from)
    }

    fn decode(&self, value: Value) -> DbResult<T> {
        serde_json::from_value(value).map_err(DbError::from)
    }

    fn expired(&self, value: &Value) -> bool {
        match &self.definition.ttl {
            Some(ttl) => is_expired_value(value, &ttl.field),
            None => false,
        }
    }

    fn emit(&self, kind: ChangeKind, keys: Vec<Key>) {
        self.txn
            .record_event(ChangeEvent::local(self.name(), kind, keys));
    }

    /// Reads a record by primary key. Expired records read as absent.
    ///
    /// # Errors
    ///
    /// Fails on engine errors or if the stored value does not decode as
    /// `T`.
    pub fn get(&self, key: impl Into<Key>) -> DbResult<Option<T>> {
        let key = key.into();
        let ctx = self.ctx().key(key.clone());
        match await_request(self.handle.get(&key), &ctx)? {
            Some(value) if self.expired(&value) => Ok(None),
            Some(value) => Ok(Some(self.decode(value)?)),
            None => Ok(None),
        }
    }

    /// Reads several records by primary key, preserving order. Missing or
    /// expired keys yield `None` at their position.
    pub fn get_many<K>(&self, keys: impl IntoIterator<Item = K>) -> DbResult<Vec<Option<T>>>
    where
        K: Into<Key>,
    {
        keys.into_iter().map(|key| self.get(key)).collect()
    }

    /// Reads a record that must exist.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::NotFound`] carrying the key when the record
    /// is absent or expired.
    pub fn resolve(&self, key: impl Into<Key>) -> DbResult<T> {
        let key = key.into();
        self.get(key.clone())?.ok_or_else(|| DbError::NotFound {
            store: self.name().to_string(),
            key,
        })
    }

    /// Reads several records that must all exist.
    ///
    /// # Errors
    ///
    /// Fails on the first absent key with [`DbError::NotFound`] naming it.
    pub fn resolve_many<K>(&self, keys: impl IntoIterator<Item = K>) -> DbResult<Vec<T>>
    where
        K: Into<Key>,
    {
        keys.into_iter().map(|key| self.resolve(key)).collect()
    }

    /// Whether a record is physically present under the key.
    ///
    /// Presence is checked without reading the value and without TTL
    /// filtering, so an expired record still reports `true` until pruned.
    pub fn has(&self, key: impl Into<Key>) -> DbResult<bool> {
        let key = key.into();
        let ctx = self.ctx().key(key.clone());
        let count = await_request(self.handle.count(Some(&Query::Only(key))), &ctx)?;
        Ok(count > 0)
    }

    /// [`has`](Self::has) over several keys, preserving order.
    pub fn has_many<K>(&self, keys: impl IntoIterator<Item = K>) -> DbResult<Vec<bool>>
    where
        K: Into<Key>,
    {
        keys.into_iter().map(|key| self.has(key)).collect()
    }

    /// Upserts a record, deriving the key from the store's key path.
    ///
    /// Emits one `Set` event on commit.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::Constraint`] when a unique index would be
    /// violated, or [`DbError::Data`] when no key can be derived.
    pub fn set(&self, record: &T) -> DbResult<Key> {
        let value = self.encode(record)?;
        let key = await_request(self.handle.put(value, None), &self.ctx())?;
        self.emit(ChangeKind::Set, vec![key.clone()]);
        Ok(key)
    }

    /// Upserts a record under an explicit key. Only valid for stores with
    /// out-of-line keys.
    pub fn set_with_key(&self, key: impl Into<Key>, record: &T) -> DbResult<Key> {
        let key = key.into();
        let value = self.encode(record)?;
        let ctx = self.ctx().key(key.clone());
        let key = await_request(self.handle.put(value, Some(key)), &ctx)?;
        self.emit(ChangeKind::Set, vec![key.clone()]);
        Ok(key)
    }

    /// Upserts a batch of records atomically.
    ///
    /// The whole batch commits as one unit and emits a single `Set` event
    /// carrying every affected key. A failure part-way leaves nothing
    /// applied once the enclosing transaction rolls back.
    pub fn set_many(&self, records: &[T]) -> DbResult<Vec<Key>> {
        self.set_many_with_progress(records, |_, _| {})
    }

    /// [`set_many`](Self::set_many) with a per-record progress callback.
    ///
    /// The callback receives `(current, total)` where `current` counts the
    /// records written so far, from 1 to `records.len()`. It observes each
    /// write before the batch commits; if the batch later fails, progressed
    /// writes are still rolled back.
    pub fn set_many_with_progress(
        &self,
        records: &[T],
        mut progress: impl FnMut(usize, usize),
    ) -> DbResult<Vec<Key>> {
        let total = records.len();
        let mut keys = Vec::with_capacity(total);
        for (position, record) in records.iter().enumerate() {
            let value = self.encode(record)?;
            let key = await_request(self.handle.put(value, None), &self.ctx())?;
            progress(position + 1, total);
            keys.push(key);
        }
        if !keys.is_empty() {
            self.emit(ChangeKind::Set, keys.clone());
        }
        Ok(keys)
    }

    /// Inserts a record, failing if its key is already present.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::Constraint`] on a duplicate key or unique
    /// index violation.
    pub fn add(&self, record: &T) -> DbResult<Key> {
        let value = self.encode(record)?;
        let key = await_request(self.handle.insert(value, None), &self.ctx())?;
        self.emit(ChangeKind::Add, vec![key.clone()]);
        Ok(key)
    }

    /// Inserts a record under an explicit key.
    pub fn add_with_key(&self, key: impl Into<Key>, record: &T) -> DbResult<Key> {
        let key = key.into();
        let value = self.encode(record)?;
        let ctx = self.ctx().key(key.clone());
        let key = await_request(self.handle.insert(value, Some(key)), &ctx)?;
        self.emit(ChangeKind::Add, vec![key.clone()]);
        Ok(key)
    }

    /// Inserts a batch of records atomically. One `Add` event carries
    /// every key.
    pub fn add_many(&self, records: &[T]) -> DbResult<Vec<Key>> {
        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            let value = self.encode(record)?;
            keys.push(await_request(self.handle.insert(value, None), &self.ctx())?);
        }
        if !keys.is_empty() {
            self.emit(ChangeKind::Add, keys.clone());
        }
        Ok(keys)
    }

    /// Deletes a record by key. Deleting an absent key succeeds.
    pub fn remove(&self, key: impl Into<Key>) -> DbResult<()> {
        let key = key.into();
        let ctx = self.ctx().key(key.clone());
        await_request(self.handle.delete(&Query::Only(key.clone())), &ctx)?;
        self.emit(ChangeKind::Remove, vec![key]);
        Ok(())
    }

    /// Deletes several records. One `Remove` event carries every key.
    pub fn remove_many<K>(&self, keys: impl IntoIterator<Item = K>) -> DbResult<()>
    where
        K: Into<Key>,
    {
        let mut removed = Vec::new();
        for key in keys {
            let key = key.into();
            let ctx = self.ctx().key(key.clone());
            await_request(self.handle.delete(&Query::Only(key.clone())), &ctx)?;
            removed.push(key);
        }
        if !removed.is_empty() {
            self.emit(ChangeKind::Remove, removed);
        }
        Ok(())
    }

    /// Reads live records in ascending primary-key order, optionally
    /// restricted to a key query and capped.
    ///
    /// On TTL stores the cap applies before filtering, so the result may
    /// hold fewer than `limit` records even when more live ones exist.
    pub fn all(&self, query: Option<&Query>, limit: Option<u32>) -> DbResult<Vec<T>> {
        let values = await_request(self.handle.get_all(query, limit), &self.ctx())?;
        values
            .into_iter()
            .filter(|value| !self.expired(value))
            .map(|value| self.decode(value))
            .collect()
    }

    /// Reads primary keys in ascending order, expired included, optionally
    /// restricted to a key query and capped.
    pub fn keys(&self, query: Option<&Query>, limit: Option<u32>) -> DbResult<Vec<Key>> {
        await_request(self.handle.get_all_keys(query, limit), &self.ctx())
    }

    /// Empties the store. Emits a `Clear` event with no keys.
    pub fn clear(&self) -> DbResult<()> {
        await_request(self.handle.clear(), &self.ctx())?;
        self.emit(ChangeKind::Clear, Vec::new());
        Ok(())
    }

    /// Counts physically present records, expired included, optionally
    /// restricted to a key query.
    pub fn count(&self, query: Option<&Query>) -> DbResult<u64> {
        await_request(self.handle.count(query), &self.ctx())
    }

    /// Whether the record under `key` is present but past its expiry.
    pub fn is_expired(&self, key: impl Into<Key>) -> DbResult<bool> {
        let key = key.into();
        let ctx = self.ctx().key(key.clone());
        match await_request(self.handle.get(&key), &ctx)? {
            Some(value) => Ok(self.expired(&value)),
            None => Ok(false),
        }
    }

    /// Physically removes expired records.
    ///
    /// Emits one `Remove` event carrying the pruned keys when anything was
    /// removed. A no-op on stores without TTL.
    pub fn prune(&self) -> DbResult<PruneStats> {
        let Some(ttl) = self.definition.ttl.clone() else {
            let remaining = self.count(None)?;
            return Ok(PruneStats {
                pruned: 0,
                remaining,
            });
        };
        let mut expired_keys = Vec::new();
        let mut cursor = self
            .handle
            .open_cursor(None, tessera_engine::Direction::Next, false)
            .map_err(|error| map_engine_error(error, &self.ctx()))?;
        loop {
            let row = await_request(cursor.step(tessera_engine::CursorStep::Next), &self.ctx())?;
            let Some(row) = row else { break };
            if let Some(value) = &row.value {
                if is_expired_value(value, &ttl.field) {
                    expired_keys.push(row.primary_key);
                }
            }
        }
        for key in &expired_keys {
            let ctx = self.ctx().key(key.clone());
            await_request(self.handle.delete(&Query::Only(key.clone())), &ctx)?;
        }
        let remaining = self.count(None)?;
        if !expired_keys.is_empty() {
            self.emit(ChangeKind::Remove, expired_keys.clone());
        }
        Ok(PruneStats {
            pruned: expired_keys.len() as u64,
            remaining,
        })
    }

    pub(crate) fn engine_cursor(
        &self,
        query: Option<&Query>,
        direction: tessera_engine::Direction,
        key_only: bool,
    ) -> DbResult<Box<dyn tessera_engine::CursorHandle>> {
        self.handle
            .open_cursor(query, direction, key_only)
            .map_err(|error| map_engine_error(error, &self.ctx()))
    }

    pub(crate) fn ttl_config(&self) -> Option<&tessera_engine::TtlConfig> {
        self.definition.ttl.as_ref()
    }

    /// Returns a typed handle onto a declared index.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::IndexNotFound`] for an undeclared name.
    pub fn index(&self, name: &str) -> DbResult<TransactionIndex<'a, T>> {
        let definition =
            self.definition
                .find_index(name)
                .cloned()
                .ok_or_else(|| DbError::IndexNotFound {
                    store: self.name().to_string(),
                    name: name.to_string(),
                })?;
        let handle = self
            .handle
            .index(name)
            .map_err(|error| map_engine_error(error, &self.ctx().index(name)))?;
        Ok(TransactionIndex::new(
            self.txn,
            self.definition.clone(),
            definition,
            handle,
        ))
    }

    /// Opens a cursor over the store in primary-key order.
    ///
    /// Returns `Ok(None)` when nothing matches. Expired records are
    /// skipped.
    pub fn open_cursor(&self, options: CursorOptions) -> DbResult<Option<Cursor<'a, T>>> {
        let handle = self
            .handle
            .open_cursor(options.query.as_ref(), options.direction, false)
            .map_err(|error| map_engine_error(error, &self.ctx()))?;
        Cursor::open(
            handle,
            self.name().to_string(),
            self.definition.ttl.clone(),
            false,
            CursorOwner::Borrowed(self.txn),
        )
    }

    /// Opens a key-only cursor over the store. No TTL filtering applies.
    pub fn open_key_cursor(&self, options: CursorOptions) -> DbResult<Option<KeyCursor<'a>>> {
        let handle = self
            .handle
            .open_cursor(options.query.as_ref(), options.direction, true)
            .map_err(|error| map_engine_error(error, &self.ctx()))?;
        KeyCursor::open(handle, false, CursorOwner::Borrowed(self.txn))
    }
}

impl<T> std::fmt::Debug for TransactionStore<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStore")
            .field("store", &self.definition.name)
            .finish()
    }
}

/// A typed owning handle onto one store.
///
/// Every call opens its own single-store transaction and commits it, so a
/// `Store` is the right surface for isolated reads and writes. Use
/// [`Database::read`]/[`Database::write`] when several operations must
/// share one transaction.
pub struct Store<T> {
    db: Arc<Database>,
    definition: StoreDefinition,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            definition: self.definition.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(db: Arc<Database>, definition: StoreDefinition) -> Self {
        Self {
            db,
            definition,
            _marker: PhantomData,
        }
    }

    /// The store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Whether this store has TTL enabled.
    #[must_use]
    pub fn has_ttl(&self) -> bool {
        self.definition.ttl.is_some()
    }

    pub(crate) fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub(crate) fn definition(&self) -> &StoreDefinition {
        &self.definition
    }

    pub(crate) fn with_txn<R>(
        &self,
        mode: Mode,
        f: impl FnOnce(&TransactionStore<'_, T>) -> DbResult<R>,
    ) -> DbResult<R> {
        let txn = self.db.begin(&[self.name()], mode)?;
        let result = {
            let store = txn.store::<T>(self.name())?;
            f(&store)
        };
        match result {
            Ok(value) => {
                let events = txn.finish()?;
                self.db.emit_all(events);
                Ok(value)
            }
            Err(error) => {
                txn.finish_abort();
                Err(error)
            }
        }
    }

    /// Reads a record by primary key. See [`TransactionStore::get`].
    pub fn get(&self, key: impl Into<Key>) -> DbResult<Option<T>> {
        let key = key.into();
        self.with_txn(Mode::ReadOnly, |store| store.get(key))
    }

    /// Reads several records by primary key.
    pub fn get_many<K>(&self, keys: impl IntoIterator<Item = K>) -> DbResult<Vec<Option<T>>>
    where
        K: Into<Key>,
    {
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        self.with_txn(Mode::ReadOnly, |store| store.get_many(keys))
    }

    /// Reads a record that must exist. See [`TransactionStore::resolve`].
    pub fn resolve(&self, key: impl Into<Key>) -> DbResult<T> {
        let key = key.into();
        self.with_txn(Mode::ReadOnly, |store| store.resolve(key))
    }

    /// Reads several records that must all exist.
    pub fn resolve_many<K>(&self, keys: impl IntoIterator<Item = K>) -> DbResult<Vec<T>>
    where
        K: Into<Key>,
    {
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        self.with_txn(Mode::ReadOnly, |store| store.resolve_many(keys))
    }

    /// Whether a record is physically present under the key.
    pub fn has(&self, key: impl Into<Key>) -> DbResult<bool> {
        let key = key.into();
        self.with_txn(Mode::ReadOnly, |store| store.has(key))
    }

    /// [`has`](Self::has) over several keys.
    pub fn has_many<K>(&self, keys: impl IntoIterator<Item = K>) -> DbResult<Vec<bool>>
    where
        K: Into<Key>,
    {
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        self.with_txn(Mode::ReadOnly, |store| store.has_many(keys))
    }

    /// Upserts a record. See [`TransactionStore::set`].
    pub fn set(&self, record: &T) -> DbResult<Key> {
        self.with_txn(Mode::ReadWrite, |store| store.set(record))
    }

    /// Upserts a record under an explicit key.
    pub fn set_with_key(&self, key: impl Into<Key>, record: &T) -> DbResult<Key> {
        let key = key.into();
        self.with_txn(Mode::ReadWrite, |store| store.set_with_key(key, record))
    }

    /// Upserts a batch atomically. See [`TransactionStore::set_many`].
    pub fn set_many(&self, records: &[T]) -> DbResult<Vec<Key>> {
        self.with_txn(Mode::ReadWrite, |store| store.set_many(records))
    }

    /// Batch upsert with a `(current, total)` progress callback. See
    /// [`TransactionStore::set_many_with_progress`].
    pub fn set_many_with_progress(
        &self,
        records: &[T],
        progress: impl FnMut(usize, usize),
    ) -> DbResult<Vec<Key>> {
        self.with_txn(Mode::ReadWrite, |store| {
            store.set_many_with_progress(records, progress)
        })
    }

    /// Inserts a record, failing on a duplicate key.
    pub fn add(&self, record: &T) -> DbResult<Key> {
        self.with_txn(Mode::ReadWrite, |store| store.add(record))
    }

    /// Inserts a record under an explicit key.
    pub fn add_with_key(&self, key: impl Into<Key>, record: &T) -> DbResult<Key> {
        let key = key.into();
        self.with_txn(Mode::ReadWrite, |store| store.add_with_key(key, record))
    }

    /// Inserts a batch atomically.
    pub fn add_many(&self, records: &[T]) -> DbResult<Vec<Key>> {
        self.with_txn(Mode::ReadWrite, |store| store.add_many(records))
    }

    /// Deletes a record by key.
    pub fn remove(&self, key: impl Into<Key>) -> DbResult<()> {
        let key = key.into();
        self.with_txn(Mode::ReadWrite, |store| store.remove(key))
    }

    /// Deletes several records in one transaction.
    pub fn remove_many<K>(&self, keys: impl IntoIterator<Item = K>) -> DbResult<()>
    where
        K: Into<Key>,
    {
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        self.with_txn(Mode::ReadWrite, |store| store.remove_many(keys))
    }

    /// Reads live records in primary-key order. See
    /// [`TransactionStore::all`].
    pub fn all(&self, query: Option<&Query>, limit: Option<u32>) -> DbResult<Vec<T>> {
        self.with_txn(Mode::ReadOnly, |store| store.all(query, limit))
    }

    /// Reads primary keys in ascending order.
    pub fn keys(&self, query: Option<&Query>, limit: Option<u32>) -> DbResult<Vec<Key>> {
        self.with_txn(Mode::ReadOnly, |store| store.keys(query, limit))
    }

    /// Empties the store.
    pub fn clear(&self) -> DbResult<()> {
        self.with_txn(Mode::ReadWrite, |store| store.clear())
    }

    /// Counts physically present records, optionally restricted to a key
    /// query.
    pub fn count(&self, query: Option<&Query>) -> DbResult<u64> {
        self.with_txn(Mode::ReadOnly, |store| store.count(query))
    }

    /// Whether the record under `key` is present but past its expiry.
    pub fn is_expired(&self, key: impl Into<Key>) -> DbResult<bool> {
        let key = key.into();
        self.with_txn(Mode::ReadOnly, |store| store.is_expired(key))
    }

    /// Physically removes expired records. See [`TransactionStore::prune`].
    pub fn prune(&self) -> DbResult<PruneStats> {
        self.with_txn(Mode::ReadWrite, |store| store.prune())
    }

    /// Returns an owning handle onto a declared index.
    pub fn index(&self, name: &str) -> DbResult<Index<T>> {
        let index = self
            .definition
            .find_index(name)
            .cloned()
            .ok_or_else(|| DbError::IndexNotFound {
                store: self.name().to_string(),
                name: name.to_string(),
            })?;
        Ok(Index::new(self.clone(), index))
    }

    /// Starts a declarative query over this store.
    #[must_use]
    pub fn query(&self) -> QueryBuilder<T> {
        QueryBuilder::new(self.clone())
    }

    /// Lazily iterates records in key order inside a dedicated read
    /// transaction. Expired records are skipped.
    pub fn iterate(&self, options: IterateOptions) -> DbResult<RecordIter<T>> {
        self.db.ensure_open()?;
        let engine = self.db.begin_engine(&[self.name()], Mode::ReadOnly)?;
        let handle = engine
            .store(self.name())
            .map_err(|error| map_engine_error(error, &RequestContext::store(self.name())))?;
        let cursor = handle
            .open_cursor(options.query.as_ref(), options.direction, false)
            .map_err(|error| map_engine_error(error, &RequestContext::store(self.name())))?;
        let scope = OwnedScope::new(Arc::clone(&self.db), engine);
        Ok(RecordIter::new(
            cursor,
            scope,
            self.name().to_string(),
            self.definition.ttl.clone(),
        ))
    }

    /// Lazily iterates primary keys in key order.
    pub fn iterate_keys(&self, options: IterateOptions) -> DbResult<KeyIter> {
        self.db.ensure_open()?;
        let engine = self.db.begin_engine(&[self.name()], Mode::ReadOnly)?;
        let handle = engine
            .store(self.name())
            .map_err(|error| map_engine_error(error, &RequestContext::store(self.name())))?;
        let cursor = handle
            .open_cursor(options.query.as_ref(), options.direction, true)
            .map_err(|error| map_engine_error(error, &RequestContext::store(self.name())))?;
        let scope = OwnedScope::new(Arc::clone(&self.db), engine);
        Ok(KeyIter::new(cursor, scope, self.name().to_string()))
    }

    /// Opens a cursor in its own transaction. The transaction commits when
    /// the cursor is exhausted or dropped; pass
    /// [`CursorOptions::writable`] to allow in-place updates and deletes.
    pub fn open_cursor(&self, options: CursorOptions) -> DbResult<Option<Cursor<'static, T>>> {
        self.db.ensure_open()?;
        let mode = if options.writable {
            Mode::ReadWrite
        } else {
            Mode::ReadOnly
        };
        let engine = self.db.begin_engine(&[self.name()], mode)?;
        let handle = engine
            .store(self.name())
            .map_err(|error| map_engine_error(error, &RequestContext::store(self.name())))?;
        let cursor = handle
            .open_cursor(options.query.as_ref(), options.direction, false)
            .map_err(|error| map_engine_error(error, &RequestContext::store(self.name())))?;
        let scope = OwnedScope::new(Arc::clone(&self.db), engine);
        Cursor::open(
            cursor,
            self.name().to_string(),
            self.definition.ttl.clone(),
            false,
            CursorOwner::Owned(scope),
        )
    }

    /// Opens a key-only cursor in its own read transaction.
    pub fn open_key_cursor(&self, options: CursorOptions) -> DbResult<Option<KeyCursor<'static>>> {
        self.db.ensure_open()?;
        let engine = self.db.begin_engine(&[self.name()], Mode::ReadOnly)?;
        let handle = engine
            .store(self.name())
            .map_err(|error| map_engine_error(error, &RequestContext::store(self.name())))?;
        let cursor = handle
            .open_cursor(options.query.as_ref(), options.direction, true)
            .map_err(|error| map_engine_error(error, &RequestContext::store(self.name())))?;
        let scope = OwnedScope::new(Arc::clone(&self.db), engine);
        KeyCursor::open(cursor, false, CursorOwner::Owned(scope))
    }

    /// Registers a listener for committed changes in this store.
    pub fn on_change(
        &self,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.db.on_store_change(self.name(), callback)
    }
}

impl<T> std::fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("store", &self.definition.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeSource;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use tessera_engine::{IndexDefinition, Schema, StoreDefinition};

    #[derive(Debug, Clone, PartialEq, serde::Serialize, Deserialize)]
    struct User {
        id: String,
        email: String,
        name: String,
    }

    fn user(id: &str, email: &str) -> User {
        User {
            id: id.into(),
            email: email.into(),
            name: format!("user {id}"),
        }
    }

    fn db() -> Arc<Database> {
        let schema = Schema::new().store(
            StoreDefinition::new("users")
                .key_path("id")
                .index(IndexDefinition::new("byEmail", "email").unique()),
        );
        Database::open_in_memory("app", schema)
    }

    #[test]
    fn set_and_get_round_trip() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        let alice = user("u1", "alice@example.com");
        let key = users.set(&alice).unwrap();
        assert_eq!(key, Key::text("u1"));
        assert_eq!(users.get("u1").unwrap(), Some(alice));
        assert_eq!(users.get("nope").unwrap(), None);
    }

    #[test]
    fn resolve_missing_names_the_key() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        let error = users.resolve("ghost").unwrap_err();
        assert_eq!(error.key(), Some(&Key::text("ghost")));
    }

    #[test]
    fn add_rejects_duplicates_and_set_overwrites() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        users.add(&user("u1", "a@example.com")).unwrap();
        let error = users.add(&user("u1", "b@example.com")).unwrap_err();
        assert_eq!(error.code(), crate::ErrorCode::Constraint);
        users.set(&user("u1", "b@example.com")).unwrap();
        assert_eq!(users.resolve("u1").unwrap().email, "b@example.com");
    }

    #[test]
    fn batch_set_is_atomic_under_unique_index() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        users.add(&user("u1", "taken@example.com")).unwrap();

        // Second record collides on the unique email index; the first must
        // not survive the rollback.
        let batch = [user("u2", "fresh@example.com"), user("u3", "taken@example.com")];
        assert!(users.set_many(&batch).is_err());
        assert_eq!(users.get("u2").unwrap(), None);
        assert_eq!(users.count(None).unwrap(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        users.set(&user("u1", "a@example.com")).unwrap();
        users.remove("u1").unwrap();
        users.remove("u1").unwrap();
        assert_eq!(users.count(None).unwrap(), 0);
    }

    #[test]
    fn batch_progress_reports_current_and_total() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let batch = [user("u1", "a@example.com"), user("u2", "b@example.com")];
        users
            .set_many_with_progress(&batch, move |current, total| {
                seen_in.lock().push((current, total));
            })
            .unwrap();
        assert_eq!(seen.lock().as_slice(), [(1, 2), (2, 2)]);
    }

    #[test]
    fn one_event_per_mutation_batch_included() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_in = Arc::clone(&events);
        let _sub = users.on_change(move |event| {
            events_in.lock().push(event.clone());
        });

        users.set(&user("u1", "a@example.com")).unwrap();
        users
            .set_many(&[user("u2", "b@example.com"), user("u3", "c@example.com")])
            .unwrap();
        users.remove("u1").unwrap();
        users.clear().unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].kind, ChangeKind::Set);
        assert_eq!(events[0].keys, vec![Key::text("u1")]);
        assert_eq!(events[1].keys, vec![Key::text("u2"), Key::text("u3")]);
        assert_eq!(events[2].kind, ChangeKind::Remove);
        assert_eq!(events[3].kind, ChangeKind::Clear);
        assert!(events[3].keys.is_empty());
        assert!(events.iter().all(|e| e.source == ChangeSource::Local));
    }

    #[test]
    fn failed_write_emits_nothing() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        users.add(&user("u1", "a@example.com")).unwrap();

        let fired = Arc::new(Mutex::new(0_u32));
        let fired_in = Arc::clone(&fired);
        let _sub = users.on_change(move |_| *fired_in.lock() += 1);

        assert!(users.add(&user("u1", "b@example.com")).is_err());
        assert_eq!(*fired.lock(), 0);
    }

    #[test]
    fn lookup_via_unique_index() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        users.set(&user("u1", "alice@example.com")).unwrap();

        let by_email = users.index("byEmail").unwrap();
        let found = by_email.get("alice@example.com").unwrap().unwrap();
        assert_eq!(found.id, "u1");
        assert_eq!(
            by_email.get_key("alice@example.com").unwrap(),
            Some(Key::text("u1"))
        );
        assert!(users.index("byPhone").is_err());
    }

    #[test]
    fn ttl_reads_filter_but_count_does_not() {
        let schema = Schema::new().store(StoreDefinition::new("sessions").key_path("id").ttl());
        let db = Database::open_in_memory("app", schema);

        #[derive(serde::Serialize, Deserialize, Debug, PartialEq)]
        struct Session {
            id: String,
            #[serde(rename = "_expiresAt")]
            expires_at: u64,
        }

        let sessions = db.store::<Session>("sessions").unwrap();
        let now = crate::events::now_millis();
        sessions
            .set(&Session {
                id: "live".into(),
                expires_at: now + 60_000,
            })
            .unwrap();
        sessions
            .set(&Session {
                id: "stale".into(),
                expires_at: now.saturating_sub(1),
            })
            .unwrap();

        assert!(sessions.get("live").unwrap().is_some());
        assert!(sessions.get("stale").unwrap().is_none());
        assert!(sessions.has("stale").unwrap());
        assert!(sessions.is_expired("stale").unwrap());
        assert_eq!(sessions.all(None, None).unwrap().len(), 1);
        assert_eq!(sessions.count(None).unwrap(), 2);

        let stats = sessions.prune().unwrap();
        assert_eq!(stats, PruneStats { pruned: 1, remaining: 1 });
        assert!(!sessions.has("stale").unwrap());
    }

    #[test]
    fn ttl_iterate_skips_expired_but_iterate_keys_does_not() {
        let schema = Schema::new().store(StoreDefinition::new("sessions").key_path("id").ttl());
        let db = Database::open_in_memory("app", schema);

        #[derive(serde::Serialize, Deserialize, Debug, PartialEq)]
        struct Session {
            id: String,
            #[serde(rename = "_expiresAt")]
            expires_at: u64,
        }

        let sessions = db.store::<Session>("sessions").unwrap();
        let now = crate::events::now_millis();
        sessions
            .set(&Session {
                id: "live".into(),
                expires_at: now + 60_000,
            })
            .unwrap();
        sessions
            .set(&Session {
                id: "stale".into(),
                expires_at: now.saturating_sub(1),
            })
            .unwrap();

        let ids: Vec<String> = sessions
            .iterate(IterateOptions::default())
            .unwrap()
            .map(|record| record.map(|s| s.id))
            .collect::<DbResult<_>>()
            .unwrap();
        assert_eq!(ids, ["live"]);

        // Key iteration reports physical presence, like `has` and `count`.
        let keys: Vec<Key> = sessions
            .iterate_keys(IterateOptions::default())
            .unwrap()
            .collect::<DbResult<_>>()
            .unwrap();
        assert_eq!(keys, [Key::text("live"), Key::text("stale")]);
    }

    #[test]
    fn iterate_walks_in_key_order() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        users.set(&user("b", "b@example.com")).unwrap();
        users.set(&user("a", "a@example.com")).unwrap();
        users.set(&user("c", "c@example.com")).unwrap();

        let ids: Vec<String> = users
            .iterate(IterateOptions::default())
            .unwrap()
            .map(|record| record.map(|u| u.id))
            .collect::<DbResult<_>>()
            .unwrap();
        assert_eq!(ids, ["a", "b", "c"]);

        let keys: Vec<Key> = users
            .iterate_keys(IterateOptions::default())
            .unwrap()
            .collect::<DbResult<_>>()
            .unwrap();
        assert_eq!(keys, [Key::text("a"), Key::text("b"), Key::text("c")]);

        // Batch reads honor the query and cap.
        assert_eq!(users.all(None, Some(2)).unwrap().len(), 2);
        assert_eq!(
            users.keys(Some(&Query::Only(Key::text("b"))), None).unwrap(),
            [Key::text("b")]
        );
        assert_eq!(users.count(Some(&Query::Only(Key::text("b")))).unwrap(), 1);
    }

    #[test]
    fn explicit_transaction_rolls_back_on_error() {
        let db = db();
        let result: DbResult<()> = db.write(&["users"], |txn| {
            let users = txn.store::<User>("users")?;
            users.set(&user("u1", "a@example.com"))?;
            Err(DbError::data("caller bailed"))
        });
        assert!(result.is_err());
        let users = db.store::<User>("users").unwrap();
        assert_eq!(users.count(None).unwrap(), 0);
    }

    #[test]
    fn closed_database_rejects_operations() {
        let db = db();
        let users = db.store::<User>("users").unwrap();
        db.close();
        let error = users.get("u1").unwrap_err();
        assert_eq!(error.code(), crate::ErrorCode::InvalidState);
        assert!(db.store::<User>("users").is_err());
    }
}
