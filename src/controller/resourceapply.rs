//! Kind-aware create-or-update of static manifests
//!
//! Each kind claims a fixed set of fields. On update the claimed fields are copied
//! from the manifest, labels and annotations are merged additively and every other
//! field of the live object is left alone.

use kube::{
    api::{DeleteParams, DynamicObject, PostParams},
    Client,
};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::restmapper::RestMapping;
use crate::error::{Error, Result};

/// Annotation asking the service CA operator to fill a ConfigMap with its bundle
pub const INJECT_CA_BUNDLE_ANNOTATION: &str = "service.beta.openshift.io/inject-cabundle";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Merge `required` into `existing` for `kind`. Returns `None` when nothing changes.
pub fn merge_for_update(kind: &str, required: &Value, existing: &Value) -> Option<Value> {
    let mut merged = existing.clone();
    merge_metadata(&mut merged, required);

    match kind {
        "Role" => replace_fields(&mut merged, required, &["rules"]),
        "ClusterRole" => {
            // Aggregated roles have their rules filled in by the aggregation controller
            if required.get("aggregationRule").is_some() {
                replace_fields(&mut merged, required, &["aggregationRule"]);
            } else {
                replace_fields(&mut merged, required, &["rules", "aggregationRule"]);
            }
        }
        "RoleBinding" | "ClusterRoleBinding" => {
            replace_fields(&mut merged, required, &["subjects", "roleRef"])
        }
        "ConfigMap" => {
            if !has_annotation(required, INJECT_CA_BUNDLE_ANNOTATION) {
                replace_fields(&mut merged, required, &["data", "binaryData"]);
            }
        }
        "Secret" => replace_fields(&mut merged, required, &["data", "binaryData", "type"]),
        "Service" => merge_service_spec(&mut merged, required),
        "Namespace" | "ServiceAccount" => {}
        "CustomResourceDefinition" => {
            let ca_bundle = existing
                .pointer("/spec/conversion/webhook/clientConfig/caBundle")
                .cloned();
            replace_fields(&mut merged, required, &["spec"]);
            let webhook_conversion = required.pointer("/spec/conversion/webhook").is_some();
            if let (Some(ca_bundle), true) = (ca_bundle, webhook_conversion) {
                set_if_absent(
                    &mut merged,
                    &["spec", "conversion", "webhook", "clientConfig", "caBundle"],
                    ca_bundle,
                );
            }
        }
        "ValidatingWebhookConfiguration" | "MutatingWebhookConfiguration" => {
            merge_webhooks(&mut merged, required, existing)
        }
        _ => replace_fields(&mut merged, required, &["spec"]),
    }

    (merged != *existing).then_some(merged)
}

fn merge_metadata(merged: &mut Value, required: &Value) {
    for key in ["labels", "annotations"] {
        let Some(Value::Object(wanted)) = required.pointer(&format!("/metadata/{key}")) else {
            continue;
        };
        let Some(metadata) = merged.get_mut("metadata").and_then(Value::as_object_mut) else {
            continue;
        };
        let target = metadata
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()));
        if !target.is_object() {
            *target = Value::Object(Map::new());
        }
        if let Some(target) = target.as_object_mut() {
            for (k, v) in wanted {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}

fn replace_fields(merged: &mut Value, required: &Value, fields: &[&str]) {
    let Some(object) = merged.as_object_mut() else {
        return;
    };
    for field in fields {
        match required.get(*field) {
            Some(value) => {
                object.insert(field.to_string(), value.clone());
            }
            None => {
                object.remove(*field);
            }
        }
    }
}

fn has_annotation(object: &Value, annotation: &str) -> bool {
    object
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(annotation))
        .is_some()
}

/// Overlay the manifest's service spec, keeping the allocated cluster IPs
fn merge_service_spec(merged: &mut Value, required: &Value) {
    let Some(Value::Object(wanted)) = required.get("spec") else {
        return;
    };
    let Some(object) = merged.as_object_mut() else {
        return;
    };
    let spec = object
        .entry("spec")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(spec) = spec.as_object_mut() else {
        return;
    };
    for (key, value) in wanted {
        if (key == "clusterIP" || key == "clusterIPs") && spec.contains_key(key) {
            continue;
        }
        spec.insert(key.clone(), value.clone());
    }
}

/// Replace the webhook list, keeping injected CA bundles per webhook name
fn merge_webhooks(merged: &mut Value, required: &Value, existing: &Value) {
    let mut webhooks = required
        .get("webhooks")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let live = existing
        .get("webhooks")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for webhook in webhooks.iter_mut() {
        let name = webhook.get("name").and_then(Value::as_str).unwrap_or_default();
        let ca_bundle = live
            .iter()
            .find(|w| w.get("name").and_then(Value::as_str) == Some(name))
            .and_then(|w| w.pointer("/clientConfig/caBundle"))
            .cloned();
        if let Some(ca_bundle) = ca_bundle {
            set_if_absent(webhook, &["clientConfig", "caBundle"], ca_bundle);
        }
    }

    if let Some(object) = merged.as_object_mut() {
        object.insert("webhooks".to_string(), Value::Array(webhooks));
    }
}

fn set_if_absent(target: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = target;
    for key in parents {
        let Some(object) = cursor.as_object_mut() else {
            return;
        };
        cursor = object
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Some(object) = cursor.as_object_mut() {
        object.entry(last.to_string()).or_insert(value);
    }
}

/// Name and namespace from a manifest's metadata
pub fn object_key(manifest: &Value) -> Result<(String, Option<String>)> {
    let name = manifest
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::ConfigError("manifest has no metadata.name".to_string()))?;
    let namespace = manifest
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Ok((name.to_string(), namespace))
}

/// Create `required` if absent, otherwise update the fields its kind claims
pub async fn apply_manifest(
    client: &Client,
    mapping: &RestMapping,
    required: &Value,
) -> Result<ApplyOutcome> {
    let (name, namespace) = object_key(required)?;
    let api = mapping.api(client, namespace.as_deref());
    let kind = mapping.resource.kind.as_str();

    let Some(existing) = api.get_opt(&name).await? else {
        let object: DynamicObject = serde_json::from_value(required.clone())?;
        api.create(&PostParams::default(), &object).await?;
        info!(kind, name = %name, namespace = ?namespace, "Created resource");
        return Ok(ApplyOutcome::Created);
    };

    let existing = serde_json::to_value(&existing)?;
    let Some(merged) = merge_for_update(kind, required, &existing) else {
        debug!(kind, name = %name, "Resource unchanged");
        return Ok(ApplyOutcome::Unchanged);
    };
    let object: DynamicObject = serde_json::from_value(merged)?;
    api.replace(&name, &PostParams::default(), &object).await?;
    info!(kind, name = %name, namespace = ?namespace, "Updated resource");
    Ok(ApplyOutcome::Updated)
}

/// Delete the object a manifest describes; absence is success
pub async fn delete_manifest(
    client: &Client,
    mapping: &RestMapping,
    manifest: &Value,
) -> Result<bool> {
    let (name, namespace) = object_key(manifest)?;
    let api = mapping.api(client, namespace.as_deref());
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(kind = %mapping.resource.kind, name = %name, "Deleted resource");
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}
