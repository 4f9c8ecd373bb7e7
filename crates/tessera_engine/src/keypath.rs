//! Key-path evaluation over JSON records.

use crate::key::Key;
use crate::schema::{IndexDefinition, KeyPath};
use serde_json::Value;

/// Derives a key from a record by evaluating a key path.
///
/// Single paths read one top-level field; dotted segments descend into
/// nested objects. Compound paths produce an array key and fail if any
/// field is missing or not a valid key.
#[must_use]
pub fn key_from_value(value: &Value, path: &KeyPath) -> Option<Key> {
    match path {
        KeyPath::Single(field) => Key::from_json(lookup(value, field)?),
        KeyPath::Compound(fields) => {
            let keys: Option<Vec<Key>> = fields
                .iter()
                .map(|field| Key::from_json(lookup(value, field)?))
                .collect();
            keys.map(Key::Array)
        }
    }
}

/// Derives the index entries a record contributes to an index.
///
/// Returns an empty vector when the key path does not evaluate to a valid
/// key (the record simply has no entry in that index). For multi-entry
/// indexes an array value contributes one entry per valid element.
#[must_use]
pub fn index_keys(value: &Value, definition: &IndexDefinition) -> Vec<Key> {
    let Some(key) = key_from_value(value, &definition.key_path) else {
        return Vec::new();
    };
    match key {
        Key::Array(elements) if definition.multi_entry => elements,
        key => vec![key],
    }
}

fn lookup<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in field.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_path() {
        let record = json!({"id": "u1", "age": 30});
        assert_eq!(
            key_from_value(&record, &KeyPath::Single("id".into())),
            Some(Key::text("u1"))
        );
        assert_eq!(
            key_from_value(&record, &KeyPath::Single("age".into())),
            Some(Key::Number(30.0))
        );
        assert!(key_from_value(&record, &KeyPath::Single("missing".into())).is_none());
    }

    #[test]
    fn nested_path() {
        let record = json!({"meta": {"slug": "hello"}});
        assert_eq!(
            key_from_value(&record, &KeyPath::Single("meta.slug".into())),
            Some(Key::text("hello"))
        );
    }

    #[test]
    fn compound_path() {
        let record = json!({"day": "2024-01-01", "seq": 7});
        let path = KeyPath::Compound(vec!["day".into(), "seq".into()]);
        assert_eq!(
            key_from_value(&record, &path),
            Some(Key::Array(vec![Key::text("2024-01-01"), Key::Number(7.0)]))
        );

        let partial = json!({"day": "2024-01-01"});
        assert!(key_from_value(&partial, &path).is_none());
    }

    #[test]
    fn invalid_field_value() {
        let record = json!({"id": null});
        assert!(key_from_value(&record, &KeyPath::Single("id".into())).is_none());
    }

    #[test]
    fn multi_entry_expansion() {
        let record = json!({"tags": ["a", "b"]});
        let index = IndexDefinition::new("byTag", "tags").multi_entry();
        assert_eq!(
            index_keys(&record, &index),
            vec![Key::text("a"), Key::text("b")]
        );
    }

    #[test]
    fn single_entry_array_value() {
        let record = json!({"tags": ["a", "b"]});
        let index = IndexDefinition::new("byTags", "tags");
        assert_eq!(
            index_keys(&record, &index),
            vec![Key::Array(vec![Key::text("a"), Key::text("b")])]
        );
    }

    #[test]
    fn missing_index_field_yields_no_entries() {
        let record = json!({"name": "x"});
        let index = IndexDefinition::new("byTag", "tags").multi_entry();
        assert!(index_keys(&record, &index).is_empty());
    }
}
