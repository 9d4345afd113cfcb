//! Dotted-path addressing into nested JSON mappings.
//!
//! `a.b.c` addresses `root["a"]["b"]["c"]`. Reads may step into arrays with
//! numeric segments (`atoms.0.symbols`); writes only walk mappings and create
//! missing intermediate mappings on the way down.

use serde_json::{Map, Value};

use crate::{ChainError, Result};

/// Split a dotted path into its segments. Empty segments are kept so callers
/// can reject them.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.')
}

/// Returns `true` if every segment of `path` is non-empty.
pub fn is_valid(path: &str) -> bool {
    !path.is_empty() && segments(path).all(|s| !s.is_empty())
}

/// Read the value at `path` under a mapping.
pub fn get<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = segments(path);
    let first = parts.next()?;
    let mut current = root.get(first)?;
    for part in parts {
        current = step_into(current, part)?;
    }
    Some(current)
}

/// Read the value at `path` under an arbitrary JSON value.
pub fn get_in<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in segments(path) {
        current = step_into(current, part)?;
    }
    Some(current)
}

fn step_into<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Write `value` at `path`, creating intermediate mappings as needed.
///
/// Fails with [`ChainError::InvalidPath`] on empty segments and with
/// [`ChainError::PathConflict`] when an intermediate segment already holds a
/// non-mapping value.
pub fn set(root: &mut Map<String, Value>, path: &str, value: Value) -> Result<()> {
    if !is_valid(path) {
        return Err(ChainError::InvalidPath {
            path: path.to_string(),
        });
    }

    let parts: Vec<&str> = segments(path).collect();
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| ChainError::InvalidPath {
            path: path.to_string(),
        })?;

    let mut current = root;
    for part in parents {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match slot {
            Value::Object(map) => map,
            _ => {
                return Err(ChainError::PathConflict {
                    path: path.to_string(),
                    segment: part.to_string(),
                })
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn get_nested_value() {
        let root = map(json!({"a": {"b": {"c": 3}}}));
        assert_eq!(get(&root, "a.b.c"), Some(&json!(3)));
        assert_eq!(get(&root, "a.b"), Some(&json!({"c": 3})));
        assert_eq!(get(&root, "a.x"), None);
    }

    #[test]
    fn get_indexes_arrays_with_numeric_segments() {
        let root = map(json!({"atoms": [{"symbols": "Ba"}, {"symbols": "Ti"}]}));
        assert_eq!(get(&root, "atoms.1.symbols"), Some(&json!("Ti")));
        assert_eq!(get(&root, "atoms.9.symbols"), None);
        assert_eq!(get(&root, "atoms.first"), None);
    }

    #[test]
    fn get_in_walks_from_a_value() {
        let value = json!({"energy": {"total": -12.5}});
        assert_eq!(get_in(&value, "energy.total"), Some(&json!(-12.5)));
    }

    #[test]
    fn set_creates_intermediate_mappings() {
        let mut root = Map::new();
        set(&mut root, "a.b.c", json!("x")).unwrap();
        assert_eq!(Value::Object(root), json!({"a": {"b": {"c": "x"}}}));
    }

    #[test]
    fn set_overwrites_leaf_and_keeps_siblings() {
        let mut root = map(json!({"a": {"keep": 1, "b": 2}}));
        set(&mut root, "a.b", json!(3)).unwrap();
        assert_eq!(Value::Object(root), json!({"a": {"keep": 1, "b": 3}}));
    }

    #[test]
    fn set_through_scalar_is_a_conflict() {
        let mut root = map(json!({"a": 5}));
        let err = set(&mut root, "a.b", json!(1)).unwrap_err();
        match err {
            ChainError::PathConflict { path, segment } => {
                assert_eq!(path, "a.b");
                assert_eq!(segment, "a");
            }
            other => panic!("expected PathConflict, got {other:?}"),
        }
    }

    #[test]
    fn set_rejects_empty_segments() {
        let mut root = Map::new();
        assert!(matches!(
            set(&mut root, "a..b", json!(1)),
            Err(ChainError::InvalidPath { .. })
        ));
        assert!(matches!(
            set(&mut root, "", json!(1)),
            Err(ChainError::InvalidPath { .. })
        ));
    }
}
