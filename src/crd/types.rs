//! Shared types for operator specifications and statuses
//!
//! These types follow the OpenShift operator API conventions and are shared by the
//! OLM singleton, the cluster operator status and the controllers that write them.
//!
//! # Type Hierarchy
//!
//! - [`ManagementState`] - Whether the operator enforces, ignores or removes its operands
//! - [`LogLevel`] - Operand and operator verbosity
//! - [`OperatorSpec`] / [`OperatorStatus`] - The common spec and status blocks
//! - [`Condition`] - A single typed status condition
//! - [`GenerationStatus`] - Generation memo for an object managed by the operator
//! - [`RelatedObject`] - Inventory entry reported on the cluster operator

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the operator treats the resources it manages
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ManagementState {
    /// Sync and enforce the desired state
    #[default]
    Managed,
    /// Leave operands alone, only report status
    Unmanaged,
    /// Behave as Managed, ignoring unchanged detection
    Force,
    /// De-provision operands where possible
    Removed,
}

impl std::fmt::Display for ManagementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagementState::Managed => write!(f, "Managed"),
            ManagementState::Unmanaged => write!(f, "Unmanaged"),
            ManagementState::Force => write!(f, "Force"),
            ManagementState::Removed => write!(f, "Removed"),
        }
    }
}

/// Log verbosity for the operator and its operands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum LogLevel {
    #[default]
    Normal,
    Debug,
    Trace,
    TraceAll,
}

impl LogLevel {
    /// klog style verbosity passed to the operands
    pub fn verbosity(&self) -> u8 {
        match self {
            LogLevel::Normal => 2,
            LogLevel::Debug => 4,
            LogLevel::Trace => 6,
            LogLevel::TraceAll => 8,
        }
    }
}

/// Spec block shared by all OpenShift operator configuration objects
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    #[serde(default)]
    pub management_state: ManagementState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_log_level: Option<LogLevel>,

    /// Configuration observed from the cluster, opaque to this operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_config: Option<serde_json::Value>,

    /// Escape hatch for unsupported overrides, opaque to this operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsupported_config_overrides: Option<serde_json::Value>,
}

impl OperatorSpec {
    /// Operand log level, `Normal` when unset
    pub fn effective_log_level(&self) -> LogLevel {
        self.log_level.unwrap_or_default()
    }
}

/// Status block shared by all OpenShift operator configuration objects
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generations: Vec<GenerationStatus>,
}

/// Status condition following the OpenShift operator condition model
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "CatalogdUpgradeable", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn new(type_: &str, status: &str, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: String::new(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

/// Generation memo for one object written by the operator
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub group: String,
    pub resource: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub last_generation: i64,
    #[serde(default)]
    pub hash: String,
}

impl GenerationStatus {
    /// Whether this entry describes the same object as `other`
    pub fn same_object(&self, other: &GenerationStatus) -> bool {
        self.group == other.group
            && self.resource == other.resource
            && self.namespace == other.namespace
            && self.name == other.name
    }
}

/// Reference to an object managed by the operator
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelatedObject {
    /// API group, empty for the core group
    pub group: String,
    /// Plural resource name
    pub resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}
