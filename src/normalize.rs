//! Live-object normalization for drift comparison
//!
//! Objects read back from the cluster carry server-populated noise
//! (timestamps, UIDs, resource versions, defaulted spec fields) that would
//! make every diff against the desired manifest non-empty. [`normalize`]
//! strips that noise so the differ only sees fields a user actually manages.

use serde_json::{Map, Value};

/// Annotation written by kubectl apply; never user-managed.
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Rollout revision annotation maintained by the deployment controller.
const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Per-kind normalization rules, keyed by (apiVersion, kind).
///
/// Each rule removes fields the API server populates after creation for that
/// kind. New exceptions are added here rather than as branches in
/// [`normalize`].
static KIND_RULES: &[((&str, &str), fn(&mut Map<String, Value>))] =
    &[(("v1", "Service"), strip_service_defaults)];

/// Service gets an allocated clusterIP and defaulted sessionAffinity/type on
/// creation; only the defaulted values are dropped so an explicit
/// `type: LoadBalancer` still diffs.
fn strip_service_defaults(root: &mut Map<String, Value>) {
    if let Some(Value::Object(spec)) = root.get_mut("spec") {
        spec.remove("clusterIP");
        if spec.get("sessionAffinity").and_then(Value::as_str) == Some("None") {
            spec.remove("sessionAffinity");
        }
        if spec.get("type").and_then(Value::as_str) == Some("ClusterIP") {
            spec.remove("type");
        }
    }
}

fn is_system_annotation(key: &str) -> bool {
    key.contains(".kubernetes.io/")
        || key == LAST_APPLIED_ANNOTATION
        || key == REVISION_ANNOTATION
}

/// Strip server-managed fields from a live object so it can be compared
/// fairly against a desired manifest.
///
/// Drops the `metadata`, `status`, and `secrets` sub-documents, applies the
/// per-kind rules from [`KIND_RULES`], then restores the parts of metadata
/// that are user-managed: the name, annotations minus system-injected ones
/// (omitted entirely if nothing survives the filter), and the label set
/// as-is (labels are semantically meaningful and must be diffed).
///
/// Pure and idempotent: `normalize(&normalize(x)) == normalize(x)`.
pub fn normalize(live: &Value) -> Value {
    let mut root = match live.as_object() {
        Some(obj) => obj.clone(),
        None => return live.clone(),
    };

    let name = live.pointer("/metadata/name").cloned();
    let labels = live.pointer("/metadata/labels").cloned();
    let annotations = live
        .pointer("/metadata/annotations")
        .and_then(Value::as_object)
        .cloned();

    root.remove("metadata");
    root.remove("status");
    root.remove("secrets");

    let api_version = root
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let kind = root
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    for ((rule_api_version, rule_kind), rule) in KIND_RULES {
        if *rule_api_version == api_version && *rule_kind == kind {
            rule(&mut root);
        }
    }

    let mut metadata = Map::new();
    if let Some(name) = name {
        metadata.insert("name".to_string(), name);
    }
    if let Some(annotations) = annotations {
        let kept: Map<String, Value> = annotations
            .into_iter()
            .filter(|(key, _)| !is_system_annotation(key))
            .collect();
        if !kept.is_empty() {
            metadata.insert("annotations".to_string(), Value::Object(kept));
        }
    }
    if let Some(labels) = labels {
        metadata.insert("labels".to_string(), labels);
    }
    root.insert("metadata".to_string(), Value::Object(metadata));

    Value::Object(root)
}
