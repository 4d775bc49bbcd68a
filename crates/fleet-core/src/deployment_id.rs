//! Deterministic deployment-ID hashing: `id(O, C) == id(O', C)` iff `O` and `O'` differ only in
//! their `diff` subtree. We enforce this by stripping `diff` from the
//! options before hashing, rather than trying to special-case every
//! field that happens not to affect identity.

use fleet_api::fleet_yaml::BundleOptions;
use serde_json::Value;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize options for deployment-id hashing"))]
    Serialize { source: serde_json::Error },
}

/// Compute the deployment-ID for one (content, merged options) pair.
/// `content_keys` should already be sorted by the caller if order must
/// not affect identity; targeting always produces them in a stable
/// declaration order so we hash as given.
pub fn deployment_id(content_keys: &[String], options: &BundleOptions) -> Result<String, Error> {
    let mut value = serde_json::to_value(options).context(SerializeSnafu)?;
    strip_diff_subtree(&mut value);

    let canonical = canonicalize(&value);
    let mut hasher = Sha256::new();
    for key in content_keys {
        hasher.update(key.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Removes the `diff` key wherever it appears at the options' top
/// level. `BundleOptions::diff` is the only subtree excluded from
/// identity.
fn strip_diff_subtree(value: &mut Value) {
    if let Value::Object(map) = value {
        map.remove("diff");
    }
}

/// A minimal canonical JSON form: object keys sorted, no insignificant
/// whitespace. `serde_json::Value::Object` is already a `BTreeMap`-like
/// ordered map via `preserve_order` being off in our dependency config,
/// so `to_string` already emits sorted keys; this helper exists to make
/// that assumption explicit and testable rather than relying on an
/// un-asserted serde_json build flag.
fn canonicalize(value: &Value) -> String {
    fn sort_keys(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted = serde_json::Map::new();
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for key in keys {
                    sorted.insert(key.clone(), sort_keys(&map[key]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort_keys(value)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_api::fleet_yaml::{ComparePatch, DiffOptions};

    fn options_with_diff(patches: Vec<ComparePatch>) -> BundleOptions {
        BundleOptions {
            diff: DiffOptions {
                compare_patches: patches,
            },
            ..Default::default()
        }
    }

    #[test]
    fn diff_only_changes_preserve_id() {
        let content = vec!["abc123".to_owned()];
        let a = options_with_diff(vec![]);
        let b = options_with_diff(vec![ComparePatch {
            api_version: "apps/v1".to_owned(),
            kind: "Deployment".to_owned(),
            namespace: None,
            name: None,
            name_regex: None,
            operations: vec![],
            json_pointers: vec!["/spec/replicas".to_owned()],
        }]);

        let id_a = deployment_id(&content, &a).expect("hash a");
        let id_b = deployment_id(&content, &b).expect("hash b");
        assert_eq!(id_a, id_b, "diff-only change must not change the deployment-id");
    }

    #[test]
    fn non_diff_changes_alter_id() {
        let content = vec!["abc123".to_owned()];
        let a = BundleOptions::default();
        let b = BundleOptions {
            default_namespace: Some("prod".to_owned()),
            ..Default::default()
        };

        let id_a = deployment_id(&content, &a).expect("hash a");
        let id_b = deployment_id(&content, &b).expect("hash b");
        assert_ne!(id_a, id_b, "non-diff option change must change the deployment-id");
    }

    #[test]
    fn same_inputs_are_stable() {
        let content = vec!["abc123".to_owned(), "def456".to_owned()];
        let options = BundleOptions::default();
        let first = deployment_id(&content, &options).expect("hash 1");
        let second = deployment_id(&content, &options).expect("hash 2");
        assert_eq!(first, second);
    }

    #[test]
    fn content_changes_alter_id() {
        let options = BundleOptions::default();
        let id_a = deployment_id(&["abc".to_owned()], &options).expect("hash a");
        let id_b = deployment_id(&["def".to_owned()], &options).expect("hash b");
        assert_ne!(id_a, id_b);
    }
}
