//! Declarative queries over stores and indexes.
//!
//! A [`QueryBuilder`] accumulates a key restriction, scan direction,
//! offset/limit window and an optional record predicate, then executes in
//! a single read transaction. The predicate runs after TTL filtering and
//! before the offset window, so `offset`/`limit` count matching records.

use crate::error::DbResult;
use crate::request::{await_request, RequestContext};
use crate::store::{is_expired_value, Store};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_engine::{CursorStep, Direction, Key, KeyRange, Mode, Query};

type Predicate<T> = Box<dyn Fn(&T) -> bool>;

/// A lazily-built query, executed by one of the terminal methods.
pub struct QueryBuilder<T> {
    store: Store<T>,
    index: Option<String>,
    only: Option<Key>,
    lower: Option<(Key, bool)>,
    upper: Option<(Key, bool)>,
    direction: Direction,
    offset: usize,
    limit: Option<usize>,
    predicate: Option<Predicate<T>>,
}

impl<T> QueryBuilder<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(store: Store<T>) -> Self {
        Self {
            store,
            index: None,
            only: None,
            lower: None,
            upper: None,
            direction: Direction::Next,
            offset: 0,
            limit: None,
            predicate: None,
        }
    }

    /// Scans a declared index instead of the primary key order. Key
    /// restrictions then apply to index keys.
    #[must_use]
    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index = Some(name.into());
        self
    }

    /// Matches exactly one key. Overrides any range bounds.
    #[must_use]
    pub fn only(mut self, key: impl Into<Key>) -> Self {
        self.only = Some(key.into());
        self
    }

    /// Keys greater than or equal to `key`.
    #[must_use]
    pub fn at_least(mut self, key: impl Into<Key>) -> Self {
        self.lower = Some((key.into(), false));
        self
    }

    /// Keys strictly greater than `key`.
    #[must_use]
    pub fn above(mut self, key: impl Into<Key>) -> Self {
        self.lower = Some((key.into(), true));
        self
    }

    /// Keys less than or equal to `key`.
    #[must_use]
    pub fn at_most(mut self, key: impl Into<Key>) -> Self {
        self.upper = Some((key.into(), false));
        self
    }

    /// Keys strictly less than `key`.
    #[must_use]
    pub fn below(mut self, key: impl Into<Key>) -> Self {
        self.upper = Some((key.into(), true));
        self
    }

    /// Keys within the inclusive range `[lower, upper]`.
    #[must_use]
    pub fn between(self, lower: impl Into<Key>, upper: impl Into<Key>) -> Self {
        self.at_least(lower).at_most(upper)
    }

    /// Applies an explicit key range.
    #[must_use]
    pub fn range(mut self, range: KeyRange) -> Self {
        self.lower = range.lower.map(|key| (key, range.lower_open));
        self.upper = range.upper.map(|key| (key, range.upper_open));
        self
    }

    /// Scans in descending key order.
    #[must_use]
    pub fn descending(mut self) -> Self {
        self.direction = Direction::Prev;
        self
    }

    /// Sets the scan direction explicitly.
    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Skips the first `count` matching records.
    #[must_use]
    pub fn offset(mut self, count: usize) -> Self {
        self.offset = count;
        self
    }

    /// Caps the number of returned records.
    #[must_use]
    pub fn limit(mut self, count: usize) -> Self {
        self.limit = Some(count);
        self
    }

    /// Keeps only records for which the predicate holds.
    #[must_use]
    pub fn filter(mut self, predicate: impl Fn(&T) -> bool + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    fn build_query(&self) -> Option<Query> {
        if let Some(key) = &self.only {
            return Some(Query::Only(key.clone()));
        }
        match (&self.lower, &self.upper) {
            (Some((lower, lower_open)), Some((upper, upper_open))) => Some(Query::Range(
                KeyRange::bound(lower.clone(), upper.clone(), *lower_open, *upper_open),
            )),
            (Some((lower, open)), None) => {
                Some(Query::Range(KeyRange::lower_bound(lower.clone(), *open)))
            }
            (None, Some((upper, open))) => {
                Some(Query::Range(KeyRange::upper_bound(upper.clone(), *open)))
            }
            (None, None) => None,
        }
    }

    fn batch_read_eligible(&self) -> bool {
        self.predicate.is_none()
            && self.offset == 0
            && self.direction == Direction::Next
            && !self.store.has_ttl()
    }

    fn batch_limit(&self) -> Option<u32> {
        self.limit.and_then(|limit| u32::try_from(limit).ok())
    }

    /// Executes and returns matching records in scan order.
    pub fn collect(self) -> DbResult<Vec<T>> {
        // A plain forward scan maps onto one batch read.
        if self.batch_read_eligible() {
            let query = self.build_query();
            let limit = self.batch_limit();
            let index = self.index.clone();
            return self.store.with_txn(Mode::ReadOnly, |store| match &index {
                Some(name) => store.index(name)?.all(query.as_ref(), limit),
                None => store.all(query.as_ref(), limit),
            });
        }
        Ok(self.rows()?.into_iter().map(|(_, record)| record).collect())
    }

    /// Executes and returns the first matching record.
    pub fn first(mut self) -> DbResult<Option<T>> {
        self.limit = Some(1);
        Ok(self.rows()?.into_iter().next().map(|(_, record)| record))
    }

    /// Executes and returns primary keys of matching records in scan
    /// order.
    pub fn keys(self) -> DbResult<Vec<Key>> {
        if self.batch_read_eligible() {
            let query = self.build_query();
            let limit = self.batch_limit();
            let index = self.index.clone();
            return self.store.with_txn(Mode::ReadOnly, |store| match &index {
                Some(name) => store.index(name)?.keys(query.as_ref(), limit),
                None => store.keys(query.as_ref(), limit),
            });
        }
        Ok(self.rows()?.into_iter().map(|(key, _)| key).collect())
    }

    /// Executes and counts matching records.
    pub fn count(self) -> DbResult<u64> {
        // Without a predicate or TTL the engine can count directly.
        if self.predicate.is_none() && !self.store.has_ttl() && self.offset == 0 {
            let query = self.build_query();
            let limit = self.limit;
            let index = self.index.clone();
            let counted = self.store.with_txn(Mode::ReadOnly, |store| match &index {
                Some(name) => store.index(name)?.count(query.as_ref()),
                None => store.count(query.as_ref()),
            })?;
            return Ok(match limit {
                Some(limit) => counted.min(limit as u64),
                None => counted,
            });
        }
        Ok(self.rows()?.len() as u64)
    }

    fn rows(self) -> DbResult<Vec<(Key, T)>> {
        let Self {
            store,
            index,
            direction,
            offset,
            limit,
            predicate,
            ..
        } = &self;
        let query = self.build_query();
        if matches!(limit, Some(0)) {
            return Ok(Vec::new());
        }
        store.with_txn(Mode::ReadOnly, |ts| {
            let ctx = match index {
                Some(name) => RequestContext::store(ts.name()).index(name),
                None => RequestContext::store(ts.name()),
            };
            let mut cursor = match index {
                Some(name) => ts.index(name)?.engine_cursor(query.as_ref(), *direction, false)?,
                None => ts.engine_cursor(query.as_ref(), *direction, false)?,
            };
            let ttl = ts.ttl_config().cloned();
            let mut out = Vec::new();
            let mut skipped = 0usize;
            loop {
                let Some(row) = await_request(cursor.step(CursorStep::Next), &ctx)? else {
                    break;
                };
                let Some(value) = row.value else { continue };
                if let Some(ttl) = &ttl {
                    if is_expired_value(&value, &ttl.field) {
                        continue;
                    }
                }
                let record: T = serde_json::from_value(value)?;
                if let Some(predicate) = predicate {
                    if !predicate(&record) {
                        continue;
                    }
                }
                if skipped < *offset {
                    skipped += 1;
                    continue;
                }
                out.push((row.primary_key, record));
                if limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
            Ok(out)
        })
    }
}

impl<T> std::fmt::Debug for QueryBuilder<T>
where
    T: Serialize + DeserializeOwned,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("store", &self.store.name().to_string())
            .field("index", &self.index)
            .field("direction", &self.direction)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("filtered", &self.predicate.is_some())
            .finish()
    }
}
