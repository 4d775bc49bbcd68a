//! Option deep-merge.
//!
//! A bundle's root [`fleet_api::fleet_yaml::BundleOptions`] and a target's
//! partial `custom` overlay (free-form JSON, see
//! [`fleet_api::fleet_yaml::TargetEntry`]) are merged with these rules:
//! object-valued fields merge key-by-key (recursively), array-valued
//! fields append (overlay after base), and any other value in the
//! overlay overrides the base value outright. The sentinel string `"-"`
//! removes the corresponding key from the merged result entirely,
//! causing the field's `#[serde(default)]` to apply on deserialize —
//! this is what "clears the parent value" means in practice, and it is
//! insensitive to how deep the key sits or which side of an associative
//! chain of merges it was cleared on.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};

/// The clear sentinel value used to delete a key during a deep-merge.
pub const CLEAR_SENTINEL: &str = "-";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize base options for merge"))]
    SerializeBase { source: serde_json::Error },

    #[snafu(display("failed to deserialize merged options"))]
    DeserializeMerged { source: serde_json::Error },
}

/// Deep-merge `overlay` over `base`, returning the re-typed result.
/// `base` and `overlay` are both merged at the JSON level so the
/// sentinel and append/override rules apply uniformly regardless of
/// which Rust type eventually consumes the result.
pub fn merge_options<T>(base: &T, overlay: &Map<String, Value>) -> Result<T, Error>
where
    T: Serialize + DeserializeOwned,
{
    let base_value = serde_json::to_value(base).context(SerializeBaseSnafu)?;
    let merged = merge_value(&base_value, &Value::Object(overlay.clone()));
    serde_json::from_value(merged).context(DeserializeMergedSnafu)
}

/// The untyped recursive merge. Exposed directly for callers (like the
/// targeting engine) that want to merge two overlays before applying
/// them to a base, or that need associativity guarantees at the JSON
/// level without round-tripping through a concrete type.
pub fn merge_value(base: &Value, patch: &Value) -> Value {
    match patch {
        Value::Object(patch_map) => {
            let mut result = match base {
                Value::Object(base_map) => base_map.clone(),
                _ => Map::new(),
            };
            for (key, patch_value) in patch_map {
                if is_clear_sentinel(patch_value) {
                    result.remove(key);
                    continue;
                }
                let merged = match result.get(key) {
                    Some(existing) => merge_value(existing, patch_value),
                    None => merge_value(&Value::Null, patch_value),
                };
                result.insert(key.clone(), merged);
            }
            Value::Object(result)
        }
        Value::Array(patch_items) => {
            let mut result = match base {
                Value::Array(base_items) => base_items.clone(),
                _ => Vec::new(),
            };
            result.extend(patch_items.clone());
            Value::Array(result)
        }
        // A bare "-" as the whole patch (not inside an object) has
        // nothing to clear relative to; treat it as a literal string
        // override, matching the fallthrough for every other scalar.
        other => other.clone(),
    }
}

fn is_clear_sentinel(value: &Value) -> bool {
    matches!(value, Value::String(s) if s == CLEAR_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_merge_recursively() {
        let base = json!({"a": {"x": 1, "y": 2}, "b": 3});
        let patch = json!({"a": {"y": 20, "z": 30}});
        let merged = merge_value(&base, &patch);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 20, "z": 30}, "b": 3}));
    }

    #[test]
    fn lists_append() {
        let base = json!({"items": [1, 2]});
        let patch = json!({"items": [3, 4]});
        let merged = merge_value(&base, &patch);
        assert_eq!(merged, json!({"items": [1, 2, 3, 4]}));
    }

    #[test]
    fn scalars_override() {
        let base = json!({"name": "base"});
        let patch = json!({"name": "overlay"});
        assert_eq!(merge_value(&base, &patch), json!({"name": "overlay"}));
    }

    #[test]
    fn sentinel_clears_regardless_of_nesting() {
        let base = json!({"a": {"b": "value"}, "c": "value"});
        let patch = json!({"a": {"b": "-"}, "c": "-"});
        let merged = merge_value(&base, &patch);
        assert_eq!(merged, json!({"a": {}, }));
    }

    #[test]
    fn map_merge_is_associative() {
        let base = json!({"a": 1, "b": 1});
        let p1 = json!({"a": 2});
        let p2 = json!({"b": 2});
        // (base merge p1) merge p2 == base merge (p1 merge p2), when p1
        // and p2 touch disjoint keys.
        let left = merge_value(&merge_value(&base, &p1), &p2);
        let right = merge_value(&base, &merge_value(&p1, &p2));
        assert_eq!(left, right);
    }

    #[test]
    fn sentinel_clears_regardless_of_merge_order() {
        let base = json!({"a": "value"});
        let clear = json!({"a": "-"});
        let set = json!({"a": "new"});
        // Clearing then setting restores the key; setting then clearing
        // removes it again either way the two patches are associated.
        let cleared_then_set = merge_value(&merge_value(&base, &clear), &set);
        assert_eq!(cleared_then_set, json!({"a": "new"}));

        let set_then_cleared = merge_value(&merge_value(&base, &set), &clear);
        assert_eq!(set_then_cleared, json!({}));
    }
}
