//! Tests for kind-aware merging of static manifests

#[cfg(test)]
mod tests {
    use super::super::resourceapply::*;
    use serde_json::json;

    #[test]
    fn test_role_rules_replaced_labels_merged() {
        let existing = json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": {
                "name": "r", "namespace": "ns", "resourceVersion": "7",
                "labels": { "user": "kept" }
            },
            "rules": [{ "verbs": ["get"], "resources": ["pods"], "apiGroups": [""] }]
        });
        let required = json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "Role",
            "metadata": { "name": "r", "namespace": "ns", "labels": { "app": "olm" } },
            "rules": [{ "verbs": ["list"], "resources": ["pods"], "apiGroups": [""] }]
        });
        let merged = merge_for_update("Role", &required, &existing).unwrap();
        assert_eq!(merged["rules"], required["rules"]);
        assert_eq!(merged["metadata"]["labels"]["user"], "kept");
        assert_eq!(merged["metadata"]["labels"]["app"], "olm");
        assert_eq!(merged["metadata"]["resourceVersion"], "7");
    }

    #[test]
    fn test_unchanged_object_yields_none() {
        let existing = json!({
            "kind": "ClusterRoleBinding",
            "metadata": { "name": "b", "labels": { "app": "olm", "extra": "x" } },
            "roleRef": { "kind": "ClusterRole", "name": "r" },
            "subjects": [{ "kind": "ServiceAccount", "name": "sa", "namespace": "ns" }]
        });
        let required = json!({
            "kind": "ClusterRoleBinding",
            "metadata": { "name": "b", "labels": { "app": "olm" } },
            "roleRef": { "kind": "ClusterRole", "name": "r" },
            "subjects": [{ "kind": "ServiceAccount", "name": "sa", "namespace": "ns" }]
        });
        assert!(merge_for_update("ClusterRoleBinding", &required, &existing).is_none());
    }

    #[test]
    fn test_aggregated_cluster_role_keeps_live_rules() {
        let existing = json!({
            "kind": "ClusterRole",
            "metadata": { "name": "agg" },
            "aggregationRule": { "clusterRoleSelectors": [{ "matchLabels": { "a": "b" } }] },
            "rules": [{ "verbs": ["get"] }]
        });
        let required = json!({
            "kind": "ClusterRole",
            "metadata": { "name": "agg" },
            "aggregationRule": { "clusterRoleSelectors": [{ "matchLabels": { "a": "b" } }] }
        });
        assert!(merge_for_update("ClusterRole", &required, &existing).is_none());
    }

    #[test]
    fn test_service_keeps_cluster_ip() {
        let existing = json!({
            "kind": "Service",
            "metadata": { "name": "svc", "namespace": "ns" },
            "spec": { "clusterIP": "10.0.0.5", "ports": [{ "port": 80 }] }
        });
        let required = json!({
            "kind": "Service",
            "metadata": { "name": "svc", "namespace": "ns" },
            "spec": { "ports": [{ "port": 443 }] }
        });
        let merged = merge_for_update("Service", &required, &existing).unwrap();
        assert_eq!(merged["spec"]["clusterIP"], "10.0.0.5");
        assert_eq!(merged["spec"]["ports"][0]["port"], 443);
    }

    #[test]
    fn test_webhook_ca_bundle_preserved() {
        let existing = json!({
            "kind": "ValidatingWebhookConfiguration",
            "metadata": { "name": "w" },
            "webhooks": [{
                "name": "a.olm.io",
                "clientConfig": { "caBundle": "Q0E=", "service": { "name": "s", "namespace": "ns" } }
            }]
        });
        let required = json!({
            "kind": "ValidatingWebhookConfiguration",
            "metadata": { "name": "w" },
            "webhooks": [{
                "name": "a.olm.io",
                "clientConfig": { "service": { "name": "s", "namespace": "ns" } }
            }]
        });
        assert!(merge_for_update("ValidatingWebhookConfiguration", &required, &existing).is_none());
    }

    #[test]
    fn test_crd_conversion_ca_bundle_preserved() {
        let existing = json!({
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "things.olm.io" },
            "spec": {
                "group": "olm.io",
                "conversion": { "strategy": "Webhook", "webhook": { "clientConfig": { "caBundle": "Q0E=" } } }
            }
        });
        let required = json!({
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "things.olm.io" },
            "spec": {
                "group": "olm.io",
                "versions": [{ "name": "v1" }],
                "conversion": { "strategy": "Webhook", "webhook": { "clientConfig": {} } }
            }
        });
        let merged = merge_for_update("CustomResourceDefinition", &required, &existing).unwrap();
        assert_eq!(
            merged["spec"]["conversion"]["webhook"]["clientConfig"]["caBundle"],
            "Q0E="
        );
        assert_eq!(merged["spec"]["versions"][0]["name"], "v1");
    }

    #[test]
    fn test_injected_config_map_data_is_left_alone() {
        let existing = json!({
            "kind": "ConfigMap",
            "metadata": {
                "name": "ca", "namespace": "ns",
                "annotations": { INJECT_CA_BUNDLE_ANNOTATION: "true" }
            },
            "data": { "service-ca.crt": "pem" }
        });
        let required = json!({
            "kind": "ConfigMap",
            "metadata": {
                "name": "ca", "namespace": "ns",
                "annotations": { INJECT_CA_BUNDLE_ANNOTATION: "true" }
            }
        });
        assert!(merge_for_update("ConfigMap", &required, &existing).is_none());
    }

    #[test]
    fn test_service_account_only_metadata() {
        let existing = json!({
            "kind": "ServiceAccount",
            "metadata": { "name": "sa", "namespace": "ns" },
            "secrets": [{ "name": "token" }]
        });
        let required = json!({
            "kind": "ServiceAccount",
            "metadata": { "name": "sa", "namespace": "ns", "annotations": { "a": "b" } }
        });
        let merged = merge_for_update("ServiceAccount", &required, &existing).unwrap();
        assert_eq!(merged["secrets"][0]["name"], "token");
        assert_eq!(merged["metadata"]["annotations"]["a"], "b");
    }

    #[test]
    fn test_object_key() {
        let (name, namespace) =
            object_key(&json!({ "metadata": { "name": "x", "namespace": "ns" } })).unwrap();
        assert_eq!(name, "x");
        assert_eq!(namespace.as_deref(), Some("ns"));
        assert!(object_key(&json!({ "metadata": {} })).is_err());
    }
}
