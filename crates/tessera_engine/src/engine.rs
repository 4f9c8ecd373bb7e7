//! Engine trait family.
//!
//! Engines expose a transactional key-value protocol with secondary
//! indexes. All handles are consumed as trait objects; every operation
//! that touches storage returns a [`Pending`] completion.
//!
//! # Invariants
//!
//! - A transaction's store scope and mode are fixed at begin time
//! - Requests issued within one transaction execute and observe each
//!   other's effects in call order
//! - Writes through a readonly transaction fail with `ReadOnly`
//! - Operations on a finished transaction fail with `TransactionInactive`
//! - Unique-index violations fail the offending request, not the commit

use crate::error::EngineResult;
use crate::key::{Direction, Key, Query};
use crate::pending::Pending;
use crate::schema::Schema;
use serde_json::Value;

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reads only.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

/// A transactional indexed key-value engine.
pub trait Engine: Send + Sync {
    /// Returns the schema the engine was opened with.
    fn schema(&self) -> &Schema;

    /// Begins a transaction over a fixed set of stores.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStore` if any name is not declared in the schema.
    fn begin(&self, stores: &[&str], mode: Mode) -> EngineResult<Box<dyn EngineTransaction>>;
}

/// One engine transaction.
pub trait EngineTransaction: Send {
    /// Returns a handle to a store within this transaction's scope.
    ///
    /// # Errors
    ///
    /// Returns `OutOfScope` for names outside the fixed scope and
    /// `TransactionInactive` after the transaction finished.
    fn store(&self, name: &str) -> EngineResult<Box<dyn StoreHandle>>;

    /// Commits the transaction; the completion settles once the commit is
    /// durable.
    fn commit(self: Box<Self>) -> Pending<()>;

    /// Rolls back every write performed in this transaction.
    fn abort(self: Box<Self>) -> Pending<()>;

    /// Returns the transaction mode.
    fn mode(&self) -> Mode;

    /// Returns true while the transaction can accept operations.
    fn is_active(&self) -> bool;
}

/// A store handle borrowed from a transaction.
pub trait StoreHandle: Send {
    /// Reads one record by primary key.
    fn get(&self, key: &Key) -> Pending<Option<Value>>;

    /// Upserts a record, returning the effective key.
    ///
    /// The key comes from `key` for out-of-line stores, from the store's
    /// key path, or from the auto-increment generator.
    fn put(&self, value: Value, key: Option<Key>) -> Pending<Key>;

    /// Inserts a record, failing with `Constraint` if the key or a unique
    /// index value is already present.
    fn insert(&self, value: Value, key: Option<Key>) -> Pending<Key>;

    /// Deletes every record matching the query. Absent keys are not an
    /// error.
    fn delete(&self, query: &Query) -> Pending<()>;

    /// Deletes all records in the store.
    fn clear(&self) -> Pending<()>;

    /// Counts records, optionally restricted to a query.
    fn count(&self, query: Option<&Query>) -> Pending<u64>;

    /// Reads records in ascending key order, optionally restricted and
    /// capped.
    fn get_all(&self, query: Option<&Query>, limit: Option<u32>) -> Pending<Vec<Value>>;

    /// Reads primary keys in ascending order, optionally restricted and
    /// capped.
    fn get_all_keys(&self, query: Option<&Query>, limit: Option<u32>) -> Pending<Vec<Key>>;

    /// Opens a positional cursor over the store.
    ///
    /// The cursor yields nothing until its first step. `key_only` cursors
    /// omit record values.
    fn open_cursor(
        &self,
        query: Option<&Query>,
        direction: Direction,
        key_only: bool,
    ) -> EngineResult<Box<dyn CursorHandle>>;

    /// Returns a handle to a declared index.
    fn index(&self, name: &str) -> EngineResult<Box<dyn IndexHandle>>;
}

/// A read-only index handle borrowed from a transaction.
pub trait IndexHandle: Send {
    /// Reads the first record matching an index key, in forward index
    /// order.
    fn get(&self, key: &Key) -> Pending<Option<Value>>;

    /// Resolves the primary key of the first record matching an index key.
    fn get_key(&self, key: &Key) -> Pending<Option<Key>>;

    /// Counts index entries, optionally restricted to a query.
    fn count(&self, query: Option<&Query>) -> Pending<u64>;

    /// Reads records in ascending index-key order.
    fn get_all(&self, query: Option<&Query>, limit: Option<u32>) -> Pending<Vec<Value>>;

    /// Reads primary keys in ascending index-key order.
    fn get_all_keys(&self, query: Option<&Query>, limit: Option<u32>) -> Pending<Vec<Key>>;

    /// Opens a positional cursor over the index.
    fn open_cursor(
        &self,
        query: Option<&Query>,
        direction: Direction,
        key_only: bool,
    ) -> EngineResult<Box<dyn CursorHandle>>;
}

/// One row under a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRow {
    /// The scan key: the index key for index cursors, otherwise the
    /// primary key.
    pub key: Key,
    /// The record's primary key.
    pub primary_key: Key,
    /// The record value; `None` for key-only cursors.
    pub value: Option<Value>,
}

/// A navigation request against a cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorStep {
    /// Advance to the next row in scan order.
    Next,
    /// Advance to the first row whose key is at or past the given key in
    /// scan order.
    NextAt(Key),
    /// Skip forward by the given number of rows (must be at least 1).
    Advance(u32),
    /// Advance to the first row whose (index key, primary key) pair is at
    /// or past the given pair. Index cursors only.
    NextPair(Key, Key),
}

/// A live positional cursor borrowed from a transaction.
pub trait CursorHandle: Send {
    /// Performs one navigation step, yielding the next row or `None` on
    /// exhaustion.
    fn step(&mut self, step: CursorStep) -> Pending<Option<CursorRow>>;

    /// Replaces the record at the current position. The new value must
    /// keep the same primary key.
    fn update(&mut self, value: Value) -> Pending<Key>;

    /// Deletes the record at the current position.
    fn delete(&mut self) -> Pending<()>;

    /// Returns the direction fixed at open time.
    fn direction(&self) -> Direction;
}
