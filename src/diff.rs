//! JSON merge-patch construction (RFC 7386)
//!
//! The apply engine compares a normalized live object against its desired
//! manifest by building the merge patch that would transform one into the
//! other. An empty patch (`{}`) means the resource is already in the desired
//! state and no write is issued.

use serde_json::{Map, Value};

/// Build the RFC 7386 merge patch transforming `live` into `desired`.
///
/// Structural comparison: keys equal in both are omitted; keys present only
/// in `desired` (or whose scalar/array value differs) take the desired value
/// wholesale; keys present only in `live` map to `null` (deletion); nested
/// objects recurse. Arrays are atomic: any difference replaces the whole
/// array, which is how the cluster interprets merge patches too.
pub fn merge_patch(live: &Value, desired: &Value) -> Value {
    match (live, desired) {
        (Value::Object(live_map), Value::Object(desired_map)) => {
            let mut patch = Map::new();
            for (key, desired_value) in desired_map {
                match live_map.get(key) {
                    Some(live_value) if live_value == desired_value => {}
                    Some(live_value) if live_value.is_object() && desired_value.is_object() => {
                        let nested = merge_patch(live_value, desired_value);
                        if !is_noop(&nested) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                    _ => {
                        patch.insert(key.clone(), desired_value.clone());
                    }
                }
            }
            for key in live_map.keys() {
                if !desired_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ if live == desired => Value::Object(Map::new()),
        _ => desired.clone(),
    }
}

/// True when a merge patch is exactly the empty object, i.e. live and
/// desired already agree.
pub fn is_noop(patch: &Value) -> bool {
    matches!(patch, Value::Object(map) if map.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_objects_produce_empty_patch() {
        let object = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "flow-controller-config" },
            "data": { "config": "executor: docker" }
        });

        let patch = merge_patch(&object, &object.clone());
        assert!(is_noop(&patch));
        assert_eq!(patch, json!({}));
    }

    #[test]
    fn changed_scalar_takes_desired_value() {
        let live = json!({ "spec": { "replicas": 0 } });
        let desired = json!({ "spec": { "replicas": 1 } });

        assert_eq!(
            merge_patch(&live, &desired),
            json!({ "spec": { "replicas": 1 } })
        );
    }

    #[test]
    fn field_only_in_desired_is_added() {
        let live = json!({ "data": { "config": "a" } });
        let desired = json!({ "data": { "config": "a", "extra": "b" } });

        assert_eq!(
            merge_patch(&live, &desired),
            json!({ "data": { "extra": "b" } })
        );
    }

    #[test]
    fn field_only_in_live_is_nulled_out() {
        let live = json!({ "data": { "config": "a", "stale": "x" } });
        let desired = json!({ "data": { "config": "a" } });

        assert_eq!(
            merge_patch(&live, &desired),
            json!({ "data": { "stale": null } })
        );
    }

    #[test]
    fn nested_objects_patch_only_the_changed_leaves() {
        let live = json!({
            "metadata": {
                "name": "flow-controller",
                "labels": {
                    "app.kubernetes.io/managed-by": "sluice",
                    "app.kubernetes.io/version": "0a1b2c"
                }
            },
            "spec": { "replicas": 1 }
        });
        let desired = json!({
            "metadata": {
                "name": "flow-controller",
                "labels": {
                    "app.kubernetes.io/managed-by": "sluice",
                    "app.kubernetes.io/version": "ffeedd"
                }
            },
            "spec": { "replicas": 1 }
        });

        assert_eq!(
            merge_patch(&live, &desired),
            json!({
                "metadata": {
                    "labels": { "app.kubernetes.io/version": "ffeedd" }
                }
            })
        );
    }

    #[test]
    fn arrays_are_replaced_wholesale() {
        let live = json!({ "spec": { "ports": [{ "port": 80 }, { "port": 443 }] } });
        let desired = json!({ "spec": { "ports": [{ "port": 9090 }] } });

        assert_eq!(
            merge_patch(&live, &desired),
            json!({ "spec": { "ports": [{ "port": 9090 }] } })
        );
    }

    #[test]
    fn type_change_replaces_the_value() {
        let live = json!({ "data": { "value": { "nested": true } } });
        let desired = json!({ "data": { "value": "flat" } });

        assert_eq!(
            merge_patch(&live, &desired),
            json!({ "data": { "value": "flat" } })
        );
    }

    #[test]
    fn noop_detection_only_matches_the_empty_object() {
        assert!(is_noop(&json!({})));
        assert!(!is_noop(&json!({ "spec": null })));
        assert!(!is_noop(&json!(null)));
        assert!(!is_noop(&json!([])));
    }
}
