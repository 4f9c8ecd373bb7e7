//! Schema types: store, index, and TTL definitions.
//!
//! A [`Schema`] is static configuration handed to the engine at open time.
//! Definitions are immutable after open; every surface above treats them
//! as read-only.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default name of the record field holding a TTL expiry timestamp.
pub const DEFAULT_TTL_FIELD: &str = "_expiresAt";

/// A field name or compound field-name sequence used to derive a key
/// from a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// A single field name.
    Single(String),
    /// An ordered list of field names; the derived key is a compound key.
    Compound(Vec<String>),
}

impl From<&str> for KeyPath {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(fields: Vec<&str>) -> Self {
        Self::Compound(fields.iter().map(|f| f.to_string()).collect())
    }
}

/// Definition of a secondary index on a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index name, unique within its store.
    pub name: String,
    /// Key path evaluated against each record.
    pub key_path: KeyPath,
    /// Whether the engine enforces uniqueness of index keys.
    pub unique: bool,
    /// Whether an array-valued key path contributes one entry per element.
    pub multi_entry: bool,
}

impl IndexDefinition {
    /// Creates a non-unique, single-entry index definition.
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    /// Makes this a unique index.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Makes this a multi-entry index.
    #[must_use]
    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

/// Opt-in per-store TTL configuration.
///
/// Reads filter out records whose expiry field holds a number at or below
/// the current time; expired records stay physically present until pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Name of the record field holding the epoch-millisecond expiry.
    pub field: String,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            field: DEFAULT_TTL_FIELD.to_string(),
        }
    }
}

impl TtlConfig {
    /// TTL configuration with a custom expiry field name.
    pub fn with_field(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

/// Per-store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDefinition {
    /// Store name.
    pub name: String,
    /// Key path used to derive record keys; `None` means out-of-line keys.
    pub key_path: Option<KeyPath>,
    /// Whether the engine assigns monotonically increasing keys when a
    /// record carries none.
    pub auto_increment: bool,
    /// Secondary indexes declared on this store.
    pub indexes: Vec<IndexDefinition>,
    /// Optional TTL configuration.
    pub ttl: Option<TtlConfig>,
}

impl StoreDefinition {
    /// Creates a store definition with out-of-line keys and no indexes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: None,
            auto_increment: false,
            indexes: Vec::new(),
            ttl: None,
        }
    }

    /// Sets the key path.
    #[must_use]
    pub fn key_path(mut self, path: impl Into<KeyPath>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    /// Enables auto-increment key generation.
    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Declares a secondary index.
    #[must_use]
    pub fn index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    /// Enables TTL with the default expiry field.
    #[must_use]
    pub fn ttl(mut self) -> Self {
        self.ttl = Some(TtlConfig::default());
        self
    }

    /// Enables TTL with a custom expiry field.
    #[must_use]
    pub fn ttl_field(mut self, field: impl Into<String>) -> Self {
        self.ttl = Some(TtlConfig::with_field(field));
        self
    }

    /// Looks up a declared index by name.
    #[must_use]
    pub fn find_index(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes.iter().find(|index| index.name == name)
    }
}

/// A static mapping from store name to store definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    stores: BTreeMap<String, StoreDefinition>,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a store definition.
    #[must_use]
    pub fn store(mut self, definition: StoreDefinition) -> Self {
        self.stores.insert(definition.name.clone(), definition);
        self
    }

    /// Looks up a store definition by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StoreDefinition> {
        self.stores.get(name)
    }

    /// Iterates over all store definitions.
    pub fn stores(&self) -> impl Iterator<Item = &StoreDefinition> {
        self.stores.values()
    }

    /// Returns the declared store names.
    pub fn store_names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_builder() {
        let def = StoreDefinition::new("users")
            .key_path("id")
            .index(IndexDefinition::new("byEmail", "email").unique())
            .ttl();

        assert_eq!(def.name, "users");
        assert_eq!(def.key_path, Some(KeyPath::Single("id".into())));
        assert!(def.find_index("byEmail").unwrap().unique);
        assert!(def.find_index("missing").is_none());
        assert_eq!(def.ttl.unwrap().field, DEFAULT_TTL_FIELD);
    }

    #[test]
    fn compound_key_path() {
        let def = StoreDefinition::new("events").key_path(vec!["day", "seq"]);
        assert_eq!(
            def.key_path,
            Some(KeyPath::Compound(vec!["day".into(), "seq".into()]))
        );
    }

    #[test]
    fn schema_lookup() {
        let schema = Schema::new()
            .store(StoreDefinition::new("users").key_path("id"))
            .store(StoreDefinition::new("posts").auto_increment());

        assert!(schema.get("users").is_some());
        assert!(schema.get("comments").is_none());
        assert_eq!(schema.store_names().count(), 2);
    }

    #[test]
    fn multi_entry_index() {
        let index = IndexDefinition::new("byTag", "tags").multi_entry();
        assert!(index.multi_entry);
        assert!(!index.unique);
    }
}
