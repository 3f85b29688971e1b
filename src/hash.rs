//! Canonical hashing for runner templates.
//!
//! A template hash identifies a generation of runner pods during rollouts.
//! The digest must be stable across semantically equal templates, so the
//! value is serialized to JSON, re-keyed through `serde_json::Value` (object
//! keys are BTreeMap-ordered) and stripped of volatile metadata before
//! hashing.

use crate::conditions::LABEL_TEMPLATE_HASH;
use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of the truncated hex digest appended to child-resource names.
/// Long enough to avoid collisions between live generations, short enough
/// to leave room for the parent name within the 63-char label limit.
const HASH_SUFFIX_LEN: usize = 10;

/// Compute the canonical hash of any serializable template value.
///
/// Fields whose name is in `excluded_keys` are removed at every object
/// level. Callers pass the template-hash label itself plus volatile
/// annotations.
pub fn template_hash<T: Serialize>(value: &T, excluded_keys: &[&str]) -> Result<String> {
    let mut json = serde_json::to_value(value)?;
    strip_keys(&mut json, excluded_keys);
    let canonical = serde_json::to_vec(&json)?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(HASH_SUFFIX_LEN);
    for byte in digest.iter() {
        if hex.len() >= HASH_SUFFIX_LEN {
            break;
        }
        hex.push_str(&format!("{:02x}", byte));
    }
    hex.truncate(HASH_SUFFIX_LEN);
    Ok(hex)
}

/// Default exclusion set for runner templates: the hash label refers to the
/// hash itself, so it can never participate in the digest.
pub fn default_hash_exclusions() -> Vec<&'static str> {
    vec![LABEL_TEMPLATE_HASH, "kubectl.kubernetes.io/last-applied-configuration"]
}

fn strip_keys(value: &mut Value, excluded: &[&str]) {
    match value {
        Value::Object(map) => {
            map.retain(|k, _| !excluded.contains(&k.as_str()));
            for v in map.values_mut() {
                strip_keys(v, excluded);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_keys(v, excluded);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Template {
        image: String,
        labels: BTreeMap<String, String>,
    }

    #[test]
    fn test_hash_is_deterministic() {
        let t = Template {
            image: "runner:v1".into(),
            labels: BTreeMap::from([("a".into(), "1".into()), ("b".into(), "2".into())]),
        };
        let h1 = template_hash(&t, &[]).unwrap();
        let h2 = template_hash(&t, &[]).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), HASH_SUFFIX_LEN);
    }

    #[test]
    fn test_hash_is_field_order_insensitive() {
        // serde_json::Value objects iterate in key order, so two maps built
        // in different insertion orders canonicalize identically.
        let mut forward = BTreeMap::new();
        forward.insert("a".to_string(), "1".to_string());
        forward.insert("b".to_string(), "2".to_string());

        let mut reverse = BTreeMap::new();
        reverse.insert("b".to_string(), "2".to_string());
        reverse.insert("a".to_string(), "1".to_string());

        let t1 = Template { image: "runner:v1".into(), labels: forward };
        let t2 = Template { image: "runner:v1".into(), labels: reverse };
        assert_eq!(template_hash(&t1, &[]).unwrap(), template_hash(&t2, &[]).unwrap());
    }

    #[test]
    fn test_hash_changes_on_meaningful_change() {
        let t1 = Template { image: "runner:v1".into(), labels: BTreeMap::new() };
        let t2 = Template { image: "runner:v2".into(), labels: BTreeMap::new() };
        assert_ne!(template_hash(&t1, &[]).unwrap(), template_hash(&t2, &[]).unwrap());
    }

    #[test]
    fn test_excluded_keys_do_not_affect_hash() {
        let t1 = Template {
            image: "runner:v1".into(),
            labels: BTreeMap::from([(LABEL_TEMPLATE_HASH.to_string(), "abc".to_string())]),
        };
        let t2 = Template {
            image: "runner:v1".into(),
            labels: BTreeMap::from([(LABEL_TEMPLATE_HASH.to_string(), "def".to_string())]),
        };
        let excl = default_hash_exclusions();
        assert_eq!(
            template_hash(&t1, &excl).unwrap(),
            template_hash(&t2, &excl).unwrap()
        );
    }

    #[test]
    fn test_excluded_keys_stripped_at_nested_levels() {
        let nested1 = serde_json::json!({
            "spec": {"image": "a", "meta": {LABEL_TEMPLATE_HASH: "x"}}
        });
        let nested2 = serde_json::json!({
            "spec": {"image": "a", "meta": {LABEL_TEMPLATE_HASH: "y"}}
        });
        let excl = default_hash_exclusions();
        assert_eq!(
            template_hash(&nested1, &excl).unwrap(),
            template_hash(&nested2, &excl).unwrap()
        );
    }
}
