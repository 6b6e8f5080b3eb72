//! Installed extension resources owned by operator-controller
//!
//! These are read only. Bundle metadata lives either in the helm release backing a
//! ClusterExtension or on its active ClusterExtensionRevision.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label on a revision naming the ClusterExtension it belongs to
pub const REVISION_OWNER_NAME_LABEL: &str = "olm.operatorframework.io/owner-name";

/// Annotation carrying the bundle name on a revision
pub const BUNDLE_NAME_ANNOTATION: &str = "olm.operatorframework.io/bundle-name";

/// Annotation carrying the bundle properties JSON array
pub const BUNDLE_PROPERTIES_ANNOTATION: &str = "olm.properties";

/// Lifecycle state of the revision currently serving an extension
pub const REVISION_STATE_ACTIVE: &str = "Active";

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "olm.operatorframework.io",
    version = "v1",
    kind = "ClusterExtension",
    plural = "clusterextensions",
    status = "ClusterExtensionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtensionSpec {
    /// Namespace the extension's content is installed into
    #[serde(default)]
    pub namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtensionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<ClusterExtensionInstallStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ClusterExtensionInstallStatus {
    pub bundle: BundleMetadata,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct BundleMetadata {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "olm.operatorframework.io",
    version = "v1alpha1",
    kind = "ClusterExtensionRevision",
    plural = "clusterextensionrevisions"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtensionRevisionSpec {
    /// Monotonic revision number within one extension
    #[serde(default)]
    pub revision: i64,
    /// "Active" or "Archived"
    #[serde(default)]
    pub lifecycle_state: String,
}
