//! OLM operator configuration singleton
//!
//! The `OLM` object named `cluster` is created by the installer. This operator only
//! writes its spec, status and finalizers through the operator client.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{OperatorSpec, OperatorStatus};

/// Name of the singleton configuration object
pub const OLM_SINGLETON_NAME: &str = "cluster";

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "operator.openshift.io",
    version = "v1",
    kind = "OLM",
    root = "Olm",
    plural = "olms",
    status = "OlmStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.managementState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OlmSpec {
    #[serde(flatten)]
    pub operator: OperatorSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OlmStatus {
    #[serde(flatten)]
    pub operator: OperatorStatus,
}
