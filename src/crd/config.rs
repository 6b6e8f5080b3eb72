//! Cluster-wide configuration resources (`config.openshift.io/v1`)
//!
//! Only the fields this operator reads or writes are modelled; everything else is
//! ignored on deserialization.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, RelatedObject};

/// Name shared by all cluster-scoped config singletons
pub const CLUSTER_CONFIG_NAME: &str = "cluster";

/// Name of the ClusterVersion singleton
pub const CLUSTER_VERSION_NAME: &str = "version";

// ============================================================================
// Proxy
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "Proxy",
    plural = "proxies",
    status = "ProxyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

/// Effective proxy configuration computed by the cluster
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

// ============================================================================
// APIServer
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "APIServer",
    root = "ApiServer",
    plural = "apiservers"
)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_security_profile: Option<TlsSecurityProfile>,
}

/// Cluster TLS security profile selection
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSecurityProfile {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<TlsProfileType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomTlsProfile>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum TlsProfileType {
    Old,
    Intermediate,
    Modern,
    Custom,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomTlsProfile {
    #[serde(default)]
    pub ciphers: Vec<String>,
    #[serde(default, rename = "minTLSVersion")]
    pub min_tls_version: String,
}

// ============================================================================
// ClusterVersion
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterVersion",
    plural = "clusterversions",
    status = "ClusterVersionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionStatus {
    #[serde(default)]
    pub desired: Release,
    #[serde(default)]
    pub history: Vec<UpdateHistory>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Release {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub image: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UpdateHistory {
    /// "Completed" or "Partial"
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub version: String,
}

impl ClusterVersion {
    /// The version the cluster currently runs: the desired release, or the most
    /// recent completed update when no desired version is recorded
    pub fn current_version(&self) -> Option<&str> {
        let status = self.status.as_ref()?;
        if !status.desired.version.is_empty() {
            return Some(status.desired.version.as_str());
        }
        status
            .history
            .iter()
            .find(|h| h.state == "Completed" && !h.version.is_empty())
            .map(|h| h.version.as_str())
    }
}

// ============================================================================
// FeatureGate
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "FeatureGate",
    plural = "featuregates",
    status = "FeatureGateStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGateSpec {
    /// "", "TechPreviewNoUpgrade", "DevPreviewNoUpgrade" or "CustomNoUpgrade"
    #[serde(default)]
    pub feature_set: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_no_upgrade: Option<CustomFeatureGates>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct CustomFeatureGates {
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub disabled: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGateStatus {
    #[serde(default)]
    pub feature_gates: Vec<FeatureGateDetails>,
}

/// Enabled and disabled gates computed for one cluster version
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct FeatureGateDetails {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub enabled: Vec<FeatureGateAttributes>,
    #[serde(default)]
    pub disabled: Vec<FeatureGateAttributes>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct FeatureGateAttributes {
    pub name: String,
}

// ============================================================================
// ClusterOperator
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterOperator",
    plural = "clusteroperators",
    status = "ClusterOperatorStatus"
)]
pub struct ClusterOperatorSpec {}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperatorStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<OperandVersion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_objects: Vec<RelatedObject>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct OperandVersion {
    pub name: String,
    pub version: String,
}
