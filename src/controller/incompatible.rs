//! Incompatible operator detection
//!
//! Installed extensions may declare `olm.maxOpenShiftVersion` in their bundle
//! properties. When any of them cannot run on the next minor release the operator
//! reports `InstalledOLMOperatorsUpgradeable=False`.
//!
//! Extensions are found either through helm release secrets or, with the BoxCutter
//! runtime enabled, through `ClusterExtensionRevision` objects. Both sources yield
//! the same [`ExtensionRecord`] and share [`evaluate`].

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use semver::Version;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::conditions::{CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, REASON_AS_EXPECTED};
use super::informers::InformerKind;
use super::version::{is_compatible, next_minor, parse_max_openshift_version, parse_tolerant};
use super::{Controller, ControllerContext};
use crate::crd::extension::{
    BUNDLE_NAME_ANNOTATION, BUNDLE_PROPERTIES_ANNOTATION, REVISION_OWNER_NAME_LABEL,
    REVISION_STATE_ACTIVE,
};
use crate::crd::{ClusterExtension, ClusterExtensionRevision, Condition, ManagementState};
use crate::error::{Error, Result};
use crate::featuregates::BOXCUTTER_RUNTIME;

pub const CONDITION_TYPE_INSTALLED_OPERATORS_UPGRADEABLE: &str = "InstalledOLMOperatorsUpgradeable";
pub const REASON_INCOMPATIBLE_OPERATORS: &str = "IncompatibleOperatorsInstalled";
pub const REASON_METADATA_FAILURE: &str = "FailureGettingExtensionMetadata";

const HELM_RELEASE_KEY: &str = "release";
const HELM_STATUS_DEPLOYED: &str = "deployed";

const WATCHES: &[InformerKind] = &[
    InformerKind::Olm,
    InformerKind::ClusterVersion,
    InformerKind::FeatureGate,
    InformerKind::HelmSecrets,
    InformerKind::ClusterExtensions,
    InformerKind::ExtensionRevisions,
];

/// Bundle metadata of one installed extension
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionRecord {
    pub extension_name: String,
    pub bundle_name: String,
    /// Raw `olm.properties` JSON, empty when the bundle declares none
    pub properties: String,
}

/// The part of a helm release this operator reads
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HelmRelease {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub chart: Option<HelmChart>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HelmChart {
    #[serde(default)]
    pub metadata: Option<HelmChartMetadata>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HelmChartMetadata {
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl HelmRelease {
    /// Chart annotation, falling back to the release labels
    fn metadata(&self, key: &str) -> Option<&str> {
        self.chart
            .as_ref()
            .and_then(|c| c.metadata.as_ref())
            .and_then(|m| m.annotations.get(key))
            .or_else(|| self.labels.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Decode the `release` payload of a helm secret: base64 of (optionally gzipped) JSON
pub fn decode_helm_release(payload: &[u8]) -> Result<HelmRelease> {
    let decoded = STANDARD
        .decode(payload)
        .map_err(|e| Error::ExtensionMetadata(format!("release is not base64: {e}")))?;
    let json = if decoded.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(decoded.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| Error::ExtensionMetadata(format!("release is not valid gzip: {e}")))?;
        out
    } else {
        decoded
    };
    serde_json::from_slice(&json)
        .map_err(|e| Error::ExtensionMetadata(format!("release is not valid JSON: {e}")))
}

/// Records from helm secrets, using the latest deployed release of every extension
pub fn records_from_helm_secrets(
    secrets: &[Arc<Secret>],
    extensions: &[Arc<ClusterExtension>],
) -> (Vec<ExtensionRecord>, Vec<Error>) {
    let mut latest: BTreeMap<String, (i64, &Secret)> = BTreeMap::new();
    for secret in secrets {
        let labels = secret.labels();
        if labels.get("status").map(String::as_str) != Some(HELM_STATUS_DEPLOYED) {
            continue;
        }
        let Some(name) = labels.get("name") else {
            continue;
        };
        let version = labels
            .get("version")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or_default();
        match latest.get(name) {
            Some((current, _)) if *current >= version => {}
            _ => {
                latest.insert(name.clone(), (version, secret.as_ref()));
            }
        }
    }

    let mut records = Vec::new();
    let mut errors = Vec::new();
    for (extension_name, (_, secret)) in latest {
        let payload = secret
            .data
            .as_ref()
            .and_then(|d| d.get(HELM_RELEASE_KEY))
            .map(|b| b.0.as_slice());
        let Some(payload) = payload else {
            errors.push(Error::ExtensionMetadata(format!(
                "helm secret {} has no release",
                secret.name_any()
            )));
            continue;
        };
        let release = match decode_helm_release(payload) {
            Ok(release) => release,
            Err(e) => {
                errors.push(Error::ExtensionMetadata(format!(
                    "extension {extension_name}: {e}"
                )));
                continue;
            }
        };
        match record(
            &extension_name,
            release.metadata(BUNDLE_NAME_ANNOTATION),
            release.metadata(BUNDLE_PROPERTIES_ANNOTATION),
            extensions,
        ) {
            Ok(r) => records.push(r),
            Err(e) => errors.push(e),
        }
    }
    (records, errors)
}

/// Records from the highest active revision of every extension
pub fn records_from_revisions(
    revisions: &[Arc<ClusterExtensionRevision>],
    extensions: &[Arc<ClusterExtension>],
) -> (Vec<ExtensionRecord>, Vec<Error>) {
    let mut latest: BTreeMap<String, &ClusterExtensionRevision> = BTreeMap::new();
    for revision in revisions {
        if revision.spec.lifecycle_state != REVISION_STATE_ACTIVE {
            continue;
        }
        let Some(owner) = revision.labels().get(REVISION_OWNER_NAME_LABEL) else {
            continue;
        };
        match latest.get(owner) {
            Some(current) if current.spec.revision >= revision.spec.revision => {}
            _ => {
                latest.insert(owner.clone(), revision.as_ref());
            }
        }
    }

    let mut records = Vec::new();
    let mut errors = Vec::new();
    for (extension_name, revision) in latest {
        let annotations = revision.annotations();
        let lookup = |key: &str| {
            annotations
                .get(key)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
        };
        match record(
            &extension_name,
            lookup(BUNDLE_NAME_ANNOTATION),
            lookup(BUNDLE_PROPERTIES_ANNOTATION),
            extensions,
        ) {
            Ok(r) => records.push(r),
            Err(e) => errors.push(e),
        }
    }
    (records, errors)
}

fn record(
    extension_name: &str,
    bundle_name: Option<&str>,
    properties: Option<&str>,
    extensions: &[Arc<ClusterExtension>],
) -> Result<ExtensionRecord> {
    let bundle_name = bundle_name
        .map(str::to_string)
        .or_else(|| {
            extensions
                .iter()
                .find(|e| e.name_any() == extension_name)
                .and_then(|e| e.status.as_ref())
                .and_then(|s| s.install.as_ref())
                .map(|i| i.bundle.name.clone())
                .filter(|n| !n.is_empty())
        })
        .ok_or_else(|| {
            Error::ExtensionMetadata(format!("extension {extension_name} has no bundle name"))
        })?;
    Ok(ExtensionRecord {
        extension_name: extension_name.to_string(),
        bundle_name,
        properties: properties.unwrap_or_default().to_string(),
    })
}

/// Decide `InstalledOLMOperatorsUpgradeable` for the current cluster version.
///
/// Incompatible bundles take precedence over metadata errors.
pub fn evaluate(records: &[ExtensionRecord], errors: &[Error], current: &Version) -> Condition {
    let mut incompatible = BTreeSet::new();
    let mut failures: Vec<String> = errors.iter().map(ToString::to_string).collect();

    for record in records {
        match parse_max_openshift_version(&record.properties) {
            Ok(Some(max)) if !is_compatible(&max, current) => {
                incompatible.insert(record.bundle_name.clone());
            }
            Ok(_) => {}
            Err(e) => failures.push(format!("bundle {}: {e}", record.bundle_name)),
        }
    }

    if !incompatible.is_empty() {
        let next = next_minor(current);
        let bundles: Vec<String> = incompatible.into_iter().collect();
        return Condition::new(
            CONDITION_TYPE_INSTALLED_OPERATORS_UPGRADEABLE,
            CONDITION_STATUS_FALSE,
            REASON_INCOMPATIBLE_OPERATORS,
            &format!(
                "Found ClusterExtensions that require upgrades prior to upgrading cluster to version {}.{}: bundles {}",
                next.major,
                next.minor,
                bundles.join(", ")
            ),
        );
    }
    if !failures.is_empty() {
        failures.sort();
        return Condition::new(
            CONDITION_TYPE_INSTALLED_OPERATORS_UPGRADEABLE,
            CONDITION_STATUS_FALSE,
            REASON_METADATA_FAILURE,
            &failures.join("; "),
        );
    }
    Condition::new(
        CONDITION_TYPE_INSTALLED_OPERATORS_UPGRADEABLE,
        CONDITION_STATUS_TRUE,
        REASON_AS_EXPECTED,
        "",
    )
}

pub struct IncompatibleOperatorsController {
    ctx: ControllerContext,
}

impl IncompatibleOperatorsController {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Controller for IncompatibleOperatorsController {
    fn name(&self) -> &str {
        "IncompatibleOperators"
    }

    fn watches(&self) -> &[InformerKind] {
        WATCHES
    }

    #[instrument(skip(self, _token))]
    async fn sync(&self, _token: &CancellationToken) -> Result<()> {
        if self.ctx.operator.management_state()? == ManagementState::Unmanaged {
            return Ok(());
        }
        let raw_version = self
            .ctx
            .observer
            .cluster_version()
            .ok_or_else(|| Error::ConfigError("cluster version is not known yet".to_string()))?;
        let current = parse_tolerant(&raw_version)?;

        let extensions = self.ctx.cluster.cluster_extensions.state();
        let (records, errors) = if self.ctx.observer.feature_gates()?.is_enabled(BOXCUTTER_RUNTIME)
        {
            records_from_revisions(&self.ctx.cluster.extension_revisions.state(), &extensions)
        } else {
            records_from_helm_secrets(&self.ctx.cluster.helm_secrets.state(), &extensions)
        };
        debug!(
            extensions = records.len(),
            errors = errors.len(),
            "Evaluating installed extensions"
        );

        let condition = evaluate(&records, &errors, &current);
        self.ctx.operator.update_conditions(vec![condition]).await?;
        Ok(())
    }
}
