//! Reference in-memory engine.
//!
//! `MemoryEngine` implements the full engine protocol against process
//! memory. Transactions clone their scoped stores at begin time, mutate
//! the clone, and merge the keys they touched back into the live state on
//! commit; aborting drops the clone. Overlapping readwrite transactions
//! therefore keep each other's committed writes intact. Unique
//! constraints are checked eagerly so the offending request fails, not the
//! commit. Index entries are derived on the fly from record values.

use crate::engine::{
    CursorHandle, CursorRow, CursorStep, Engine, EngineTransaction, IndexHandle, Mode, StoreHandle,
};
use crate::error::{EngineError, EngineResult};
use crate::key::{Direction, Key, Query};
use crate::keypath::{index_keys, key_from_value};
use crate::pending::Pending;
use crate::schema::{IndexDefinition, KeyPath, Schema, StoreDefinition};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Contents of one store.
#[derive(Debug, Clone, Default)]
struct StoreState {
    records: BTreeMap<Key, Value>,
    next_auto: i64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct EngineState {
    stores: HashMap<String, StoreState>,
}

/// Keys one transaction wrote or removed in one store.
#[derive(Debug, Default)]
struct StoreDelta {
    cleared: bool,
    puts: BTreeSet<Key>,
    deletes: BTreeSet<Key>,
}

impl StoreDelta {
    fn record_put(&mut self, key: &Key) {
        self.deletes.remove(key);
        self.puts.insert(key.clone());
    }

    fn record_delete(&mut self, key: &Key) {
        self.puts.remove(key);
        self.deletes.insert(key.clone());
    }

    fn record_clear(&mut self) {
        self.cleared = true;
        self.puts.clear();
        self.deletes.clear();
    }
}

/// Replays the keys one transaction touched onto the live store, leaving
/// records committed by overlapping transactions in place.
fn apply_delta(live: &mut StoreState, working: &StoreState, delta: StoreDelta) {
    if delta.cleared {
        live.records.clear();
        live.bytes = 0;
    }
    for key in delta.deletes {
        if let Some(removed) = live.records.remove(&key) {
            live.bytes = live.bytes.saturating_sub(record_size(&removed));
        }
    }
    for key in delta.puts {
        if let Some(value) = working.records.get(&key) {
            let added = record_size(value);
            let replaced = live
                .records
                .insert(key, value.clone())
                .map(|v| record_size(&v))
                .unwrap_or(0);
            live.bytes = (live.bytes + added).saturating_sub(replaced);
        }
    }
    live.next_auto = live.next_auto.max(working.next_auto);
}

/// Working state of one transaction, shared by its handles.
#[derive(Debug)]
struct TxnShared {
    scope: Vec<String>,
    mode: Mode,
    active: bool,
    working: HashMap<String, StoreState>,
    deltas: HashMap<String, StoreDelta>,
}

impl TxnShared {
    fn ensure_active(&self) -> EngineResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(EngineError::TransactionInactive)
        }
    }

    fn ensure_writable(&self, store: &str) -> EngineResult<()> {
        self.ensure_active()?;
        if self.mode == Mode::ReadWrite {
            Ok(())
        } else {
            Err(EngineError::ReadOnly {
                store: store.to_string(),
            })
        }
    }

    fn store(&self, name: &str) -> EngineResult<&StoreState> {
        self.working
            .get(name)
            .ok_or_else(|| EngineError::OutOfScope {
                name: name.to_string(),
                scope: self.scope.clone(),
            })
    }

    fn store_mut(&mut self, name: &str) -> EngineResult<&mut StoreState> {
        let scope = self.scope.clone();
        self.working
            .get_mut(name)
            .ok_or(EngineError::OutOfScope {
                name: name.to_string(),
                scope,
            })
    }

    fn total_bytes(&self) -> u64 {
        self.working.values().map(|s| s.bytes).sum()
    }

    fn delta_mut(&mut self, name: &str) -> &mut StoreDelta {
        self.deltas.entry(name.to_string()).or_default()
    }
}

/// A transactional in-memory engine for testing and ephemeral storage.
pub struct MemoryEngine {
    schema: Arc<Schema>,
    state: Arc<RwLock<EngineState>>,
    quota: Option<u64>,
}

impl MemoryEngine {
    /// Creates an engine holding the given schema.
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self::build(schema, None)
    }

    /// Creates an engine with a byte quota; writes that would push the
    /// scoped stores past the quota fail with `QuotaExceeded`.
    #[must_use]
    pub fn with_quota(schema: Schema, quota: u64) -> Self {
        Self::build(schema, Some(quota))
    }

    fn build(schema: Schema, quota: Option<u64>) -> Self {
        let stores = schema
            .store_names()
            .map(|name| (name.to_string(), StoreState::default()))
            .collect();
        Self {
            schema: Arc::new(schema),
            state: Arc::new(RwLock::new(EngineState { stores })),
            quota,
        }
    }
}

impl Engine for MemoryEngine {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn begin(&self, stores: &[&str], mode: Mode) -> EngineResult<Box<dyn EngineTransaction>> {
        for name in stores {
            if self.schema.get(name).is_none() {
                return Err(EngineError::UnknownStore {
                    name: (*name).to_string(),
                });
            }
        }
        let working = {
            let state = self.state.read();
            stores
                .iter()
                .map(|name| {
                    let store = state.stores.get(*name).cloned().unwrap_or_default();
                    ((*name).to_string(), store)
                })
                .collect()
        };
        Ok(Box::new(MemoryTransaction {
            schema: Arc::clone(&self.schema),
            engine_state: Arc::clone(&self.state),
            shared: Arc::new(Mutex::new(TxnShared {
                scope: stores.iter().map(|s| (*s).to_string()).collect(),
                mode,
                active: true,
                working,
                deltas: HashMap::new(),
            })),
            quota: self.quota,
        }))
    }
}

struct MemoryTransaction {
    schema: Arc<Schema>,
    engine_state: Arc<RwLock<EngineState>>,
    shared: Arc<Mutex<TxnShared>>,
    quota: Option<u64>,
}

impl EngineTransaction for MemoryTransaction {
    fn store(&self, name: &str) -> EngineResult<Box<dyn StoreHandle>> {
        let shared = self.shared.lock();
        shared.ensure_active()?;
        shared.store(name)?;
        let definition = self
            .schema
            .get(name)
            .ok_or_else(|| EngineError::UnknownStore {
                name: name.to_string(),
            })?
            .clone();
        Ok(Box::new(MemoryStoreHandle {
            definition,
            shared: Arc::clone(&self.shared),
            quota: self.quota,
        }))
    }

    fn commit(self: Box<Self>) -> Pending<()> {
        let mut shared = self.shared.lock();
        if let Err(err) = shared.ensure_active() {
            return Pending::settled(Err(err));
        }
        shared.active = false;
        if shared.mode == Mode::ReadWrite {
            let working = std::mem::take(&mut shared.working);
            let mut deltas = std::mem::take(&mut shared.deltas);
            let mut state = self.engine_state.write();
            for (name, store) in working {
                let delta = deltas.remove(&name).unwrap_or_default();
                let live = state.stores.entry(name).or_default();
                apply_delta(live, &store, delta);
            }
        }
        tracing::debug!(stores = shared.scope.len(), "transaction committed");
        Pending::settled(Ok(()))
    }

    fn abort(self: Box<Self>) -> Pending<()> {
        let mut shared = self.shared.lock();
        if let Err(err) = shared.ensure_active() {
            return Pending::settled(Err(err));
        }
        shared.active = false;
        shared.working.clear();
        shared.deltas.clear();
        tracing::debug!(stores = shared.scope.len(), "transaction aborted");
        Pending::settled(Ok(()))
    }

    fn mode(&self) -> Mode {
        self.shared.lock().mode
    }

    fn is_active(&self) -> bool {
        self.shared.lock().active
    }
}

fn record_size(value: &Value) -> u64 {
    serde_json::to_string(value).map(|s| s.len() as u64).unwrap_or(0)
}

/// Checks every unique index of `definition` against `value`, ignoring the
/// record stored under `key` itself.
fn check_unique(
    store: &StoreState,
    definition: &StoreDefinition,
    key: &Key,
    value: &Value,
) -> EngineResult<()> {
    for index in definition.indexes.iter().filter(|i| i.unique) {
        let candidates = index_keys(value, index);
        if candidates.is_empty() {
            continue;
        }
        for (primary, existing) in &store.records {
            if primary == key {
                continue;
            }
            for existing_key in index_keys(existing, index) {
                if candidates.contains(&existing_key) {
                    return Err(EngineError::Constraint {
                        store: definition.name.clone(),
                        index: Some(index.name.clone()),
                        key: existing_key,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Writes one record into the transaction's working state.
fn put_record(
    shared: &mut TxnShared,
    definition: &StoreDefinition,
    quota: Option<u64>,
    mut value: Value,
    key: Option<Key>,
    insert_only: bool,
) -> EngineResult<Key> {
    shared.ensure_writable(&definition.name)?;

    let key = match (&definition.key_path, key) {
        (Some(_), Some(_)) => {
            return Err(EngineError::data(
                "explicit key conflicts with the store's in-line key path",
            ));
        }
        (Some(path), None) => match key_from_value(&value, path) {
            Some(key) => key,
            None if definition.auto_increment => {
                let store = shared.store_mut(&definition.name)?;
                store.next_auto += 1;
                let generated = Key::Number(store.next_auto as f64);
                inject_key(&mut value, path, &generated)?;
                generated
            }
            None => {
                return Err(EngineError::data(
                    "record does not evaluate to a valid key",
                ));
            }
        },
        (None, Some(key)) => key,
        (None, None) if definition.auto_increment => {
            let store = shared.store_mut(&definition.name)?;
            store.next_auto += 1;
            Key::Number(store.next_auto as f64)
        }
        (None, None) => {
            return Err(EngineError::data(
                "out-of-line store requires an explicit key",
            ));
        }
    };

    let store = shared.store(&definition.name)?;
    if insert_only && store.records.contains_key(&key) {
        return Err(EngineError::Constraint {
            store: definition.name.clone(),
            index: None,
            key,
        });
    }
    check_unique(store, definition, &key, &value)?;

    let added = record_size(&value);
    let replaced = store.records.get(&key).map(record_size).unwrap_or(0);
    if let Some(limit) = quota {
        let used = (shared.total_bytes() + added).saturating_sub(replaced);
        if used > limit {
            return Err(EngineError::QuotaExceeded {
                store: definition.name.clone(),
                used,
                limit,
            });
        }
    }

    let store = shared.store_mut(&definition.name)?;
    store.bytes = store.bytes + added - replaced;
    store.records.insert(key.clone(), value);
    shared.delta_mut(&definition.name).record_put(&key);
    Ok(key)
}

fn inject_key(value: &mut Value, path: &KeyPath, key: &Key) -> EngineResult<()> {
    let KeyPath::Single(field) = path else {
        return Err(EngineError::data(
            "cannot auto-generate a key for a compound key path",
        ));
    };
    let json = key
        .to_json()
        .ok_or_else(|| EngineError::data("generated key has no JSON form"))?;
    let mut current = value;
    let mut segments = field.split('.').peekable();
    while let Some(segment) = segments.next() {
        let object = current
            .as_object_mut()
            .ok_or_else(|| EngineError::data("cannot inject generated key into non-object"))?;
        if segments.peek().is_none() {
            object.insert(segment.to_string(), json);
            return Ok(());
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Err(EngineError::data("empty key path"))
}

struct MemoryStoreHandle {
    definition: StoreDefinition,
    shared: Arc<Mutex<TxnShared>>,
    quota: Option<u64>,
}

impl MemoryStoreHandle {
    fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> EngineResult<R> {
        let shared = self.shared.lock();
        shared.ensure_active()?;
        Ok(f(shared.store(&self.definition.name)?))
    }
}

impl StoreHandle for MemoryStoreHandle {
    fn get(&self, key: &Key) -> Pending<Option<Value>> {
        Pending::settled(self.read(|store| store.records.get(key).cloned()))
    }

    fn put(&self, value: Value, key: Option<Key>) -> Pending<Key> {
        let mut shared = self.shared.lock();
        Pending::settled(put_record(
            &mut shared,
            &self.definition,
            self.quota,
            value,
            key,
            false,
        ))
    }

    fn insert(&self, value: Value, key: Option<Key>) -> Pending<Key> {
        let mut shared = self.shared.lock();
        Pending::settled(put_record(
            &mut shared,
            &self.definition,
            self.quota,
            value,
            key,
            true,
        ))
    }

    fn delete(&self, query: &Query) -> Pending<()> {
        let mut shared = self.shared.lock();
        let result = shared
            .ensure_writable(&self.definition.name)
            .and_then(|()| {
                let store = shared.store_mut(&self.definition.name)?;
                let doomed: Vec<Key> = store
                    .records
                    .keys()
                    .filter(|key| query.contains(key))
                    .cloned()
                    .collect();
                for key in &doomed {
                    if let Some(removed) = store.records.remove(key) {
                        store.bytes = store.bytes.saturating_sub(record_size(&removed));
                    }
                }
                let delta = shared.delta_mut(&self.definition.name);
                for key in &doomed {
                    delta.record_delete(key);
                }
                Ok(())
            });
        Pending::settled(result)
    }

    fn clear(&self) -> Pending<()> {
        let mut shared = self.shared.lock();
        let result = shared
            .ensure_writable(&self.definition.name)
            .and_then(|()| {
                {
                    let store = shared.store_mut(&self.definition.name)?;
                    store.records.clear();
                    store.bytes = 0;
                }
                shared.delta_mut(&self.definition.name).record_clear();
                Ok(())
            });
        Pending::settled(result)
    }

    fn count(&self, query: Option<&Query>) -> Pending<u64> {
        Pending::settled(self.read(|store| {
            store
                .records
                .keys()
                .filter(|key| query.map(|q| q.contains(key)).unwrap_or(true))
                .count() as u64
        }))
    }

    fn get_all(&self, query: Option<&Query>, limit: Option<u32>) -> Pending<Vec<Value>> {
        Pending::settled(self.read(|store| {
            store
                .records
                .iter()
                .filter(|(key, _)| query.map(|q| q.contains(key)).unwrap_or(true))
                .take(limit.map(|l| l as usize).unwrap_or(usize::MAX))
                .map(|(_, value)| value.clone())
                .collect()
        }))
    }

    fn get_all_keys(&self, query: Option<&Query>, limit: Option<u32>) -> Pending<Vec<Key>> {
        Pending::settled(self.read(|store| {
            store
                .records
                .keys()
                .filter(|key| query.map(|q| q.contains(key)).unwrap_or(true))
                .take(limit.map(|l| l as usize).unwrap_or(usize::MAX))
                .cloned()
                .collect()
        }))
    }

    fn open_cursor(
        &self,
        query: Option<&Query>,
        direction: Direction,
        key_only: bool,
    ) -> EngineResult<Box<dyn CursorHandle>> {
        self.shared.lock().ensure_active()?;
        Ok(Box::new(MemoryCursor {
            definition: self.definition.clone(),
            index: None,
            shared: Arc::clone(&self.shared),
            query: query.cloned(),
            direction,
            key_only,
            position: None,
            quota: self.quota,
        }))
    }

    fn index(&self, name: &str) -> EngineResult<Box<dyn IndexHandle>> {
        let index = self
            .definition
            .find_index(name)
            .ok_or_else(|| EngineError::UnknownIndex {
                store: self.definition.name.clone(),
                name: name.to_string(),
            })?
            .clone();
        Ok(Box::new(MemoryIndexHandle {
            definition: self.definition.clone(),
            index,
            shared: Arc::clone(&self.shared),
            quota: self.quota,
        }))
    }
}

/// Sorted (index key, primary key) entries for one index.
fn index_entries(store: &StoreState, index: &IndexDefinition) -> Vec<(Key, Key)> {
    let mut entries: Vec<(Key, Key)> = store
        .records
        .iter()
        .flat_map(|(primary, value)| {
            index_keys(value, index)
                .into_iter()
                .map(move |key| (key, primary.clone()))
        })
        .collect();
    entries.sort();
    entries
}

struct MemoryIndexHandle {
    definition: StoreDefinition,
    index: IndexDefinition,
    shared: Arc<Mutex<TxnShared>>,
    quota: Option<u64>,
}

impl MemoryIndexHandle {
    fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> EngineResult<R> {
        let shared = self.shared.lock();
        shared.ensure_active()?;
        Ok(f(shared.store(&self.definition.name)?))
    }

    fn first_match(&self, key: &Key) -> EngineResult<Option<(Key, Value)>> {
        self.read(|store| {
            index_entries(store, &self.index)
                .into_iter()
                .find(|(index_key, _)| index_key == key)
                .and_then(|(_, primary)| {
                    store
                        .records
                        .get(&primary)
                        .map(|value| (primary, value.clone()))
                })
        })
    }
}

impl IndexHandle for MemoryIndexHandle {
    fn get(&self, key: &Key) -> Pending<Option<Value>> {
        Pending::settled(self.first_match(key).map(|hit| hit.map(|(_, value)| value)))
    }

    fn get_key(&self, key: &Key) -> Pending<Option<Key>> {
        Pending::settled(self.first_match(key).map(|hit| hit.map(|(primary, _)| primary)))
    }

    fn count(&self, query: Option<&Query>) -> Pending<u64> {
        Pending::settled(self.read(|store| {
            index_entries(store, &self.index)
                .iter()
                .filter(|(key, _)| query.map(|q| q.contains(key)).unwrap_or(true))
                .count() as u64
        }))
    }

    fn get_all(&self, query: Option<&Query>, limit: Option<u32>) -> Pending<Vec<Value>> {
        Pending::settled(self.read(|store| {
            index_entries(store, &self.index)
                .into_iter()
                .filter(|(key, _)| query.map(|q| q.contains(key)).unwrap_or(true))
                .take(limit.map(|l| l as usize).unwrap_or(usize::MAX))
                .filter_map(|(_, primary)| store.records.get(&primary).cloned())
                .collect()
        }))
    }

    fn get_all_keys(&self, query: Option<&Query>, limit: Option<u32>) -> Pending<Vec<Key>> {
        Pending::settled(self.read(|store| {
            index_entries(store, &self.index)
                .into_iter()
                .filter(|(key, _)| query.map(|q| q.contains(key)).unwrap_or(true))
                .take(limit.map(|l| l as usize).unwrap_or(usize::MAX))
                .map(|(_, primary)| primary)
                .collect()
        }))
    }

    fn open_cursor(
        &self,
        query: Option<&Query>,
        direction: Direction,
        key_only: bool,
    ) -> EngineResult<Box<dyn CursorHandle>> {
        self.shared.lock().ensure_active()?;
        Ok(Box::new(MemoryCursor {
            definition: self.definition.clone(),
            index: Some(self.index.clone()),
            shared: Arc::clone(&self.shared),
            query: query.cloned(),
            direction,
            key_only,
            position: None,
            quota: self.quota,
        }))
    }
}

struct MemoryCursor {
    definition: StoreDefinition,
    index: Option<IndexDefinition>,
    shared: Arc<Mutex<TxnShared>>,
    query: Option<Query>,
    direction: Direction,
    key_only: bool,
    /// (scan key, primary key) of the last yielded row.
    position: Option<(Key, Key)>,
    quota: Option<u64>,
}

impl MemoryCursor {
    /// Materializes the scan in direction order against the live working
    /// state, so writes made during iteration are observed.
    fn rows(&self, store: &StoreState) -> Vec<(Key, Key, Value)> {
        let mut rows: Vec<(Key, Key, Value)> = match &self.index {
            Some(index) => index_entries(store, index)
                .into_iter()
                .filter_map(|(key, primary)| {
                    store
                        .records
                        .get(&primary)
                        .map(|value| (key, primary, value.clone()))
                })
                .collect(),
            None => store
                .records
                .iter()
                .map(|(key, value)| (key.clone(), key.clone(), value.clone()))
                .collect(),
        };
        rows.retain(|(key, _, _)| self.query.as_ref().map(|q| q.contains(key)).unwrap_or(true));
        if self.direction.is_reverse() {
            rows.reverse();
        }
        if self.direction.is_unique() {
            let mut last: Option<Key> = None;
            rows.retain(|(key, _, _)| {
                if last.as_ref() == Some(key) {
                    false
                } else {
                    last = Some(key.clone());
                    true
                }
            });
        }
        rows
    }

    /// True if `row` comes strictly after the current position in scan
    /// order.
    fn past_position(&self, key: &Key, primary: &Key) -> bool {
        let Some((pos_key, pos_primary)) = &self.position else {
            return true;
        };
        let ordering = (key, primary).cmp(&(pos_key, pos_primary));
        if self.direction.is_reverse() {
            ordering.is_lt()
        } else {
            ordering.is_gt()
        }
    }

    /// True if `key` is at or past `target` in scan order.
    fn at_or_past(&self, key: &Key, target: &Key) -> bool {
        if self.direction.is_reverse() {
            key <= target
        } else {
            key >= target
        }
    }
}

impl CursorHandle for MemoryCursor {
    fn step(&mut self, step: CursorStep) -> Pending<Option<CursorRow>> {
        let shared = self.shared.lock();
        if let Err(err) = shared.ensure_active() {
            return Pending::settled(Err(err));
        }
        let store = match shared.store(&self.definition.name) {
            Ok(store) => store,
            Err(err) => return Pending::settled(Err(err)),
        };
        let rows = self.rows(store);
        drop(shared);

        let mut remaining = rows
            .into_iter()
            .filter(|(key, primary, _)| self.past_position(key, primary));

        let hit = match step {
            CursorStep::Next => remaining.next(),
            CursorStep::NextAt(target) => {
                remaining.find(|(key, _, _)| self.at_or_past(key, &target))
            }
            CursorStep::Advance(0) => {
                return Pending::settled(Err(EngineError::data("advance requires a count of at least 1")));
            }
            CursorStep::Advance(count) => remaining.nth(count as usize - 1),
            CursorStep::NextPair(target_key, target_primary) => {
                if self.index.is_none() {
                    return Pending::settled(Err(EngineError::data(
                        "continue-to-pair requires an index cursor",
                    )));
                }
                remaining.find(|(key, primary, _)| {
                    let ordering = (key, primary).cmp(&(&target_key, &target_primary));
                    if self.direction.is_reverse() {
                        ordering.is_le()
                    } else {
                        ordering.is_ge()
                    }
                })
            }
        };

        Pending::settled(Ok(hit.map(|(key, primary, value)| {
            self.position = Some((key.clone(), primary.clone()));
            CursorRow {
                key,
                primary_key: primary,
                value: (!self.key_only).then_some(value),
            }
        })))
    }

    fn update(&mut self, value: Value) -> Pending<Key> {
        let Some((_, primary)) = self.position.clone() else {
            return Pending::settled(Err(EngineError::invalid_state(
                "cursor is not positioned on a record",
            )));
        };
        if let Some(path) = &self.definition.key_path {
            match key_from_value(&value, path) {
                Some(derived) if derived == primary => {}
                _ => {
                    return Pending::settled(Err(EngineError::data(
                        "updated value must keep the record's primary key",
                    )));
                }
            }
        }
        let mut shared = self.shared.lock();
        let explicit = self.definition.key_path.is_none().then(|| primary.clone());
        Pending::settled(put_record(
            &mut shared,
            &self.definition,
            self.quota,
            value,
            explicit,
            false,
        ))
    }

    fn delete(&mut self) -> Pending<()> {
        let Some((_, primary)) = self.position.clone() else {
            return Pending::settled(Err(EngineError::invalid_state(
                "cursor is not positioned on a record",
            )));
        };
        let mut shared = self.shared.lock();
        let result = shared
            .ensure_writable(&self.definition.name)
            .and_then(|()| {
                {
                    let store = shared.store_mut(&self.definition.name)?;
                    if let Some(removed) = store.records.remove(&primary) {
                        store.bytes = store.bytes.saturating_sub(record_size(&removed));
                    }
                }
                shared.delta_mut(&self.definition.name).record_delete(&primary);
                Ok(())
            });
        Pending::settled(result)
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}
