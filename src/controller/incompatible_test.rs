//! Unit tests for incompatible operator detection

#[cfg(test)]
mod tests {
    use super::super::incompatible::*;
    use crate::controller::conditions::{CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE};
    use crate::controller::version::parse_tolerant;
    use crate::crd::extension::{
        BundleMetadata, ClusterExtensionInstallStatus, ClusterExtensionRevisionSpec,
        ClusterExtensionSpec, ClusterExtensionStatus, BUNDLE_NAME_ANNOTATION,
        BUNDLE_PROPERTIES_ANNOTATION, REVISION_OWNER_NAME_LABEL,
    };
    use crate::crd::{ClusterExtension, ClusterExtensionRevision};
    use crate::error::Error;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use flate2::{write::GzEncoder, Compression};
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::Arc;

    const MAX_417: &str = r#"[{"type":"olm.maxOpenShiftVersion","value":"4.17"}]"#;
    const MAX_419: &str = r#"[{"type":"olm.maxOpenShiftVersion","value":4.19}]"#;

    fn record(bundle: &str, properties: &str) -> ExtensionRecord {
        ExtensionRecord {
            extension_name: format!("{bundle}-ext"),
            bundle_name: bundle.to_string(),
            properties: properties.to_string(),
        }
    }

    fn release_payload(name: &str, version: i64, bundle: &str, properties: &str) -> Vec<u8> {
        let release = json!({
            "name": name,
            "version": version,
            "info": { "status": "deployed" },
            "chart": {
                "metadata": {
                    "name": name,
                    "annotations": { BUNDLE_PROPERTIES_ANNOTATION: properties }
                }
            },
            "labels": { BUNDLE_NAME_ANNOTATION: bundle }
        });
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(release.to_string().as_bytes())
            .unwrap();
        STANDARD.encode(encoder.finish().unwrap()).into_bytes()
    }

    fn helm_secret(name: &str, version: i64, status: &str, payload: Vec<u8>) -> Arc<Secret> {
        let mut secret = Secret::default();
        secret.metadata.name = Some(format!("sh.helm.release.v1.{name}.v{version}"));
        secret.metadata.labels = Some(BTreeMap::from([
            ("owner".to_string(), "helm".to_string()),
            ("name".to_string(), name.to_string()),
            ("version".to_string(), version.to_string()),
            ("status".to_string(), status.to_string()),
        ]));
        secret.data = Some(BTreeMap::from([(
            "release".to_string(),
            ByteString(payload),
        )]));
        Arc::new(secret)
    }

    fn revision(
        owner: &str,
        number: i64,
        state: &str,
        bundle: &str,
        properties: &str,
    ) -> Arc<ClusterExtensionRevision> {
        let mut rev = ClusterExtensionRevision::new(
            &format!("{owner}-{number}"),
            ClusterExtensionRevisionSpec {
                revision: number,
                lifecycle_state: state.to_string(),
            },
        );
        rev.metadata.labels = Some(BTreeMap::from([(
            REVISION_OWNER_NAME_LABEL.to_string(),
            owner.to_string(),
        )]));
        rev.metadata.annotations = Some(BTreeMap::from([
            (BUNDLE_NAME_ANNOTATION.to_string(), bundle.to_string()),
            (BUNDLE_PROPERTIES_ANNOTATION.to_string(), properties.to_string()),
        ]));
        Arc::new(rev)
    }

    #[test]
    fn test_operator_capped_at_current_minor_blocks_upgrade() {
        let current = parse_tolerant("4.17.3").unwrap();
        let condition = evaluate(&[record("foo.v1.0.0", MAX_417)], &[], &current);

        assert_eq!(condition.type_, CONDITION_TYPE_INSTALLED_OPERATORS_UPGRADEABLE);
        assert_eq!(condition.status, CONDITION_STATUS_FALSE);
        assert_eq!(condition.reason, REASON_INCOMPATIBLE_OPERATORS);
        assert!(condition.message.contains("4.18"));
        assert!(condition.message.contains("foo.v1.0.0"));
    }

    #[test]
    fn test_operator_allowing_next_minor_is_upgradeable() {
        let current = parse_tolerant("4.18.0").unwrap();
        let condition = evaluate(&[record("foo.v1.0.0", MAX_419)], &[], &current);
        assert_eq!(condition.status, CONDITION_STATUS_TRUE);
    }

    #[test]
    fn test_no_property_is_upgradeable() {
        let current = parse_tolerant("4.18.0").unwrap();
        let condition = evaluate(&[record("plain.v1", ""), record("other.v2", "[]")], &[], &current);
        assert_eq!(condition.status, CONDITION_STATUS_TRUE);
    }

    #[test]
    fn test_incompatible_bundles_are_sorted_and_take_precedence() {
        let current = parse_tolerant("4.17").unwrap();
        let records = [
            record("zeta.v1", MAX_417),
            record("broken.v1", "not json"),
            record("alpha.v1", MAX_417),
        ];
        let condition = evaluate(&records, &[], &current);
        assert_eq!(condition.reason, REASON_INCOMPATIBLE_OPERATORS);
        assert!(condition.message.ends_with("alpha.v1, zeta.v1"));
    }

    #[test]
    fn test_metadata_failure_is_reported() {
        let current = parse_tolerant("4.18").unwrap();
        let condition = evaluate(
            &[record("broken.v1", "not json")],
            &[Error::ExtensionMetadata("extension x has no bundle name".to_string())],
            &current,
        );
        assert_eq!(condition.status, CONDITION_STATUS_FALSE);
        assert_eq!(condition.reason, REASON_METADATA_FAILURE);
        assert!(condition.message.contains("broken.v1"));
        assert!(condition.message.contains("has no bundle name"));
    }

    #[test]
    fn test_decode_plain_release() {
        let payload = STANDARD.encode(r#"{"name":"foo","version":2}"#).into_bytes();
        let release = decode_helm_release(&payload).unwrap();
        assert_eq!(release.name, "foo");
        assert_eq!(release.version, 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_helm_release(b"%%%").is_err());
        let not_json = STANDARD.encode("nope").into_bytes();
        assert!(decode_helm_release(&not_json).is_err());
    }

    #[test]
    fn test_helm_uses_latest_deployed_release() {
        let secrets = vec![
            helm_secret("foo", 1, "superseded", release_payload("foo", 1, "foo.v1", MAX_417)),
            helm_secret("foo", 2, "deployed", release_payload("foo", 2, "foo.v2", MAX_419)),
            helm_secret("foo", 3, "failed", release_payload("foo", 3, "foo.v3", MAX_417)),
        ];
        let (records, errors) = records_from_helm_secrets(&secrets, &[]);
        assert!(errors.is_empty());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].extension_name, "foo");
        assert_eq!(records[0].bundle_name, "foo.v2");
        assert_eq!(records[0].properties, MAX_419);
    }

    #[test]
    fn test_helm_bundle_name_falls_back_to_extension_status() {
        let payload = STANDARD
            .encode(r#"{"name":"bar","version":1,"labels":{}}"#)
            .into_bytes();
        let secrets = vec![helm_secret("bar", 1, "deployed", payload)];

        let mut extension = ClusterExtension::new("bar", ClusterExtensionSpec::default());
        extension.status = Some(ClusterExtensionStatus {
            install: Some(ClusterExtensionInstallStatus {
                bundle: BundleMetadata {
                    name: "bar.v0.3.0".to_string(),
                    version: "0.3.0".to_string(),
                },
            }),
        });

        let (records, errors) = records_from_helm_secrets(&secrets, &[Arc::new(extension)]);
        assert!(errors.is_empty());
        assert_eq!(records[0].bundle_name, "bar.v0.3.0");

        let (records, errors) = records_from_helm_secrets(&secrets, &[]);
        assert!(records.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_revisions_use_highest_active_revision() {
        let revisions = vec![
            revision("foo", 1, "Archived", "foo.v1", MAX_417),
            revision("foo", 2, "Active", "foo.v2", MAX_417),
            revision("foo", 3, "Active", "foo.v3", MAX_419),
        ];
        let (records, errors) = records_from_revisions(&revisions, &[]);
        assert!(errors.is_empty());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bundle_name, "foo.v3");
    }

    #[test]
    fn test_both_sources_agree() {
        let secrets = vec![
            helm_secret("foo", 1, "deployed", release_payload("foo", 1, "foo.v1", MAX_417)),
            helm_secret("bar", 4, "deployed", release_payload("bar", 4, "bar.v2", MAX_419)),
        ];
        let revisions = vec![
            revision("foo", 1, "Active", "foo.v1", MAX_417),
            revision("bar", 2, "Active", "bar.v2", MAX_419),
        ];
        let (from_helm, helm_errors) = records_from_helm_secrets(&secrets, &[]);
        let (from_revisions, revision_errors) = records_from_revisions(&revisions, &[]);
        assert!(helm_errors.is_empty() && revision_errors.is_empty());
        assert_eq!(from_helm, from_revisions);

        let current = parse_tolerant("4.17.0").unwrap();
        assert_eq!(
            evaluate(&from_helm, &[], &current),
            evaluate(&from_revisions, &[], &current)
        );
    }
}
