//! Typed secondary-index surfaces.
//!
//! Index reads resolve records by index key in ascending index order; a
//! non-unique index key resolves to the record with the lowest primary
//! key. Index surfaces do not TTL-filter: an expired record stays visible
//! through its indexes until pruned.

use crate::cursor::{Cursor, CursorOptions, CursorOwner, KeyCursor, OwnedScope};
use crate::error::{map_engine_error, DbError, DbResult};
use crate::query::QueryBuilder;
use crate::request::{await_request, RequestContext};
use crate::store::Store;
use crate::transaction::Transaction;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tessera_engine::{IndexDefinition, IndexHandle, Key, Mode, Query, StoreDefinition};

/// A typed index handle borrowed from an explicit [`Transaction`].
pub struct TransactionIndex<'a, T> {
    txn: &'a Transaction,
    store: StoreDefinition,
    definition: IndexDefinition,
    handle: Box<dyn IndexHandle>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T> TransactionIndex<'a, T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(
        txn: &'a Transaction,
        store: StoreDefinition,
        definition: IndexDefinition,
        handle: Box<dyn IndexHandle>,
    ) -> Self {
        Self {
            txn,
            store,
            definition,
            handle,
            _marker: PhantomData,
        }
    }

    /// The index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Whether the index enforces key uniqueness.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.definition.unique
    }

    fn ctx(&self) -> RequestContext {
        RequestContext::store(&self.store.name).index(&self.definition.name)
    }

    /// Reads the first record matching an index key.
    pub fn get(&self, key: impl Into<Key>) -> DbResult<Option<T>> {
        let key = key.into();
        let ctx = self.ctx().key(key.clone());
        match await_request(self.handle.get(&key), &ctx)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Resolves the primary key of the first record matching an index key.
    pub fn get_key(&self, key: impl Into<Key>) -> DbResult<Option<Key>> {
        let key = key.into();
        let ctx = self.ctx().key(key.clone());
        await_request(self.handle.get_key(&key), &ctx)
    }

    /// Reads a record that must exist under the index key.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::NotFound`] carrying the index key.
    pub fn resolve(&self, key: impl Into<Key>) -> DbResult<T> {
        let key = key.into();
        self.get(key.clone())?.ok_or_else(|| DbError::NotFound {
            store: self.store.name.clone(),
            key,
        })
    }

    /// Whether any record carries the index key.
    pub fn has(&self, key: impl Into<Key>) -> DbResult<bool> {
        let key = key.into();
        let ctx = self.ctx().key(key.clone());
        let count = await_request(self.handle.count(Some(&Query::Only(key))), &ctx)?;
        Ok(count > 0)
    }

    /// Counts index entries, optionally restricted to a key query.
    pub fn count(&self, query: Option<&Query>) -> DbResult<u64> {
        await_request(self.handle.count(query), &self.ctx())
    }

    /// Reads records in ascending index-key order.
    pub fn all(&self, query: Option<&Query>, limit: Option<u32>) -> DbResult<Vec<T>> {
        let values = await_request(self.handle.get_all(query, limit), &self.ctx())?;
        values
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(DbError::from))
            .collect()
    }

    /// Reads primary keys in ascending index-key order.
    pub fn keys(&self, query: Option<&Query>, limit: Option<u32>) -> DbResult<Vec<Key>> {
        await_request(self.handle.get_all_keys(query, limit), &self.ctx())
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

    /// Opens a cursor over the index in index-key order.
    pub fn open_cursor(&self, options: CursorOptions) -> DbResult<Option<Cursor<'a, T>>> {
        let handle = self
            .handle
            .open_cursor(options.query.as_ref(), options.direction, false)
            .map_err(|error| map_engine_error(error, &self.ctx()))?;
        Cursor::open(
            handle,
            self.store.name.clone(),
            None,
            true,
            CursorOwner::Borrowed(self.txn),
        )
    }

    /// Opens a key-only cursor over the index.
    pub fn open_key_cursor(&self, options: CursorOptions) -> DbResult<Option<KeyCursor<'a>>> {
        let handle = self
            .handle
            .open_cursor(options.query.as_ref(), options.direction, true)
            .map_err(|error| map_engine_error(error, &self.ctx()))?;
        KeyCursor::open(handle, true, CursorOwner::Borrowed(self.txn))
    }
}

impl<T> std::fmt::Debug for TransactionIndex<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionIndex")
            .field("store", &self.store.name)
            .field("index", &self.definition.name)
            .finish()
    }
}

/// A typed owning index handle. Each call runs in its own read
/// transaction.
pub struct Index<T> {
    store: Store<T>,
    definition: IndexDefinition,
}

impl<T> Clone for Index<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            definition: self.definition.clone(),
        }
    }
}

impl<T> Index<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(store: Store<T>, definition: IndexDefinition) -> Self {
        Self { store, definition }
    }

    /// The index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Whether the index enforces key uniqueness.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.definition.unique
    }

    fn with_index<R>(
        &self,
        f: impl FnOnce(&TransactionIndex<'_, T>) -> DbResult<R>,
    ) -> DbResult<R> {
        self.store.with_txn(Mode::ReadOnly, |store| {
            let index = store.index(&self.definition.name)?;
            f(&index)
        })
    }

    /// Reads the first record matching an index key.
    pub fn get(&self, key: impl Into<Key>) -> DbResult<Option<T>> {
        let key = key.into();
        self.with_index(|index| index.get(key))
    }

    /// Resolves the primary key of the first record matching an index key.
    pub fn get_key(&self, key: impl Into<Key>) -> DbResult<Option<Key>> {
        let key = key.into();
        self.with_index(|index| index.get_key(key))
    }

    /// Reads a record that must exist under the index key.
    pub fn resolve(&self, key: impl Into<Key>) -> DbResult<T> {
        let key = key.into();
        self.with_index(|index| index.resolve(key))
    }

    /// Whether any record carries the index key.
    pub fn has(&self, key: impl Into<Key>) -> DbResult<bool> {
        let key = key.into();
        self.with_index(|index| index.has(key))
    }

    /// Counts index entries, optionally restricted to a key query.
    pub fn count(&self, query: Option<&Query>) -> DbResult<u64> {
        self.with_index(|index| index.count(query))
    }

    /// Reads records in ascending index-key order.
    pub fn all(&self, query: Option<&Query>, limit: Option<u32>) -> DbResult<Vec<T>> {
        self.with_index(|index| index.all(query, limit))
    }

    /// Reads primary keys in ascending index-key order.
    pub fn keys(&self, query: Option<&Query>, limit: Option<u32>) -> DbResult<Vec<Key>> {
        self.with_index(|index| index.keys(query, limit))
    }

    /// Starts a declarative query scanning this index.
    #[must_use]
    pub fn query(&self) -> QueryBuilder<T> {
        QueryBuilder::new(self.store.clone()).index(&self.definition.name)
    }

    fn open_engine_cursor(
        &self,
        options: &CursorOptions,
        key_only: bool,
    ) -> DbResult<(Box<dyn tessera_engine::CursorHandle>, OwnedScope)> {
        let db = self.store.db();
        db.ensure_open()?;
        let store_name = self.store.name();
        let ctx = RequestContext::store(store_name).index(&self.definition.name);
        let engine = db.begin_engine(&[store_name], Mode::ReadOnly)?;
        let handle = engine
            .store(store_name)
            .map_err(|error| map_engine_error(error, &ctx))?
            .index(&self.definition.name)
            .map_err(|error| map_engine_error(error, &ctx))?;
        let cursor = handle
            .open_cursor(options.query.as_ref(), options.direction, key_only)
            .map_err(|error| map_engine_error(error, &ctx))?;
        Ok((cursor, OwnedScope::new(Arc::clone(db), engine)))
    }

    /// Opens a cursor over the index in its own read transaction. The
    /// transaction commits when the cursor is exhausted or dropped.
    pub fn open_cursor(&self, options: CursorOptions) -> DbResult<Option<Cursor<'static, T>>> {
        let (cursor, scope) = self.open_engine_cursor(&options, false)?;
        Cursor::open(
            cursor,
            self.store.name().to_string(),
            None,
            true,
            CursorOwner::Owned(scope),
        )
    }

    /// Opens a key-only cursor over the index in its own read transaction.
    pub fn open_key_cursor(&self, options: CursorOptions) -> DbResult<Option<KeyCursor<'static>>> {
        let (cursor, scope) = self.open_engine_cursor(&options, true)?;
        KeyCursor::open(cursor, true, CursorOwner::Owned(scope))
    }
}

impl<T> std::fmt::Debug for Index<T>
where
    T: Serialize + DeserializeOwned,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("store", &self.store.name().to_string())
            .field("index", &self.definition.name)
            .finish()
    }
}
