use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::record::ParamHash;

pub const KEY_SEPARATOR: &str = "__";

/// Flattens nested objects into one level, joining keys with `__`.
/// Arrays and scalars are leaves; a non-object input flattens to nothing.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if let Value::Object(map) = value {
        flatten_into(&mut out, None, map);
    }
    out
}

fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: Option<&str>, map: &Map<String, Value>) {
    for (key, value) in map {
        let full = match prefix {
            Some(p) => format!("{}{}{}", p, KEY_SEPARATOR, key),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(out, Some(&full), inner),
            other => {
                out.insert(full, other.clone());
            }
        }
    }
}

/// Stable fingerprint of a parameter object, or `None` when there is nothing
/// to track. Key order and nesting shape do not change the result as long as
/// the flattened view is the same.
pub fn hash_params(params: &Value) -> Option<ParamHash> {
    let flat = flatten(params);
    if flat.is_empty() {
        return None;
    }
    let canonical = sorted_keys(Value::Object(flat.into_iter().collect())).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    Some(ParamHash::from_be_bytes(head))
}

/// Rebuilds every object with its keys in ascending order, at any depth.
fn sorted_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sorted_keys(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted_keys).collect()),
        other => other,
    }
}
