// Dot-separated field path traversal.
//
// Paths address nested object fields: `address.city.zip`. Set auto-creates
// intermediate objects; Get returns None when any segment is missing; Unset
// is a no-op for unresolved paths.

use std::collections::BTreeMap;

use crate::error::{DbError, Result};

use super::value::Value;

/// Splits and validates a dot-separated path.
///
/// Empty paths and empty segments (`"a..b"`, `".a"`) are rejected.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(DbError::invalid_argument("field path is empty"));
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(DbError::invalid_argument(format!(
            "field path '{path}' contains an empty segment"
        )));
    }
    Ok(segments)
}

/// Reads the value at `path`, or None when any segment is missing or a
/// non-object is traversed.
pub fn get_path<'a>(root: &'a BTreeMap<String, Value>, path: &str) -> Result<Option<&'a Value>> {
    let segments = split_path(path)?;
    let (first, rest) = segments.split_first().expect("validated non-empty");

    let mut current = match root.get(*first) {
        Some(v) => v,
        None => return Ok(None),
    };
    for seg in rest {
        match current {
            Value::Object(map) => match map.get(*seg) {
                Some(v) => current = v,
                None => return Ok(None),
            },
            _ => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Writes `value` at `path`, creating intermediate objects as needed.
///
/// Fails with `InvalidArgument` when an intermediate segment resolves to a
/// non-object value that already exists.
pub fn set_path(root: &mut BTreeMap<String, Value>, path: &str, value: Value) -> Result<()> {
    let segments = split_path(path)?;
    let (last, parents) = segments.split_last().expect("validated non-empty");

    let mut current = root;
    for seg in parents {
        let slot = current
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(BTreeMap::new()));
        match slot {
            Value::Object(map) => current = map,
            other => {
                return Err(DbError::invalid_argument(format!(
                    "path '{path}' traverses non-object segment '{seg}' of type {}",
                    other.type_name()
                )))
            }
        }
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Removes the value at `path`. Returns the removed value, or None when the
/// path does not resolve (a no-op).
pub fn unset_path(root: &mut BTreeMap<String, Value>, path: &str) -> Result<Option<Value>> {
    let segments = split_path(path)?;
    let (last, parents) = segments.split_last().expect("validated non-empty");

    let mut current = root;
    for seg in parents {
        match current.get_mut(*seg) {
            Some(Value::Object(map)) => current = map,
            _ => return Ok(None),
        }
    }
    Ok(current.remove(*last))
}
