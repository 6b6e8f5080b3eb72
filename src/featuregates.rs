//! Downstream (cluster) to upstream (operand) feature gate mapping
//!
//! The cluster's `FeatureGate` configuration names gates with the `NewOLM` prefix.
//! Each mapped gate turns into an upstream feature identifier written to the
//! `enabled` or `disabled` feature list of one sub-component's chart values.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::helm::values::HelmValues;
use crate::subcomponent::SubComponent;

/// Prefix shared by every downstream gate this operator understands
pub const DOWNSTREAM_PREFIX: &str = "NewOLM";

pub const PREFLIGHT_PERMISSION_CHECKS: &str = "NewOLMPreflightPermissionChecks";
pub const OWN_SINGLE_NAMESPACE: &str = "NewOLMOwnSingleNamespace";
pub const WEBHOOK_PROVIDER_OPENSHIFT_SERVICE_CA: &str = "NewOLMWebhookProviderOpenshiftServiceCA";
pub const CATALOGD_API_V1_METAS: &str = "NewOLMCatalogdAPIV1Metas";
/// Also switches incompatible operator detection to extension revisions
pub const BOXCUTTER_RUNTIME: &str = "NewOLMBoxCutterRuntime";

pub const FEATURE_SET_DEFAULT: &str = "";
pub const FEATURE_SET_TECH_PREVIEW: &str = "TechPreviewNoUpgrade";
pub const FEATURE_SET_DEV_PREVIEW: &str = "DevPreviewNoUpgrade";
pub const FEATURE_SET_CUSTOM: &str = "CustomNoUpgrade";

/// Feature gates observed on the cluster for the running release
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureGateSnapshot {
    pub feature_set: String,
    pub enabled: BTreeSet<String>,
    pub disabled: BTreeSet<String>,
}

impl FeatureGateSnapshot {
    pub fn is_enabled(&self, gate: &str) -> bool {
        self.enabled.contains(gate)
    }

    /// Whether the feature set is hand-picked, so gate mismatches are tolerated
    pub fn is_custom(&self) -> bool {
        self.feature_set == FEATURE_SET_CUSTOM
    }

    /// Whether the feature set is one of the non-default preview sets
    pub fn is_preview(&self) -> bool {
        self.feature_set == FEATURE_SET_TECH_PREVIEW || self.feature_set == FEATURE_SET_DEV_PREVIEW
    }
}

/// One entry of the mapping table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateMapping {
    pub downstream: String,
    pub subcomponent: SubComponent,
    pub upstream: String,
    /// Upstream features that are always disabled alongside this mapping
    pub always_disable: Vec<String>,
}

impl GateMapping {
    pub fn new(downstream: &str, subcomponent: SubComponent, upstream: &str) -> Self {
        Self {
            downstream: downstream.to_string(),
            subcomponent,
            upstream: upstream.to_string(),
            always_disable: Vec::new(),
        }
    }

    pub fn always_disabling(mut self, upstream: &str) -> Self {
        self.always_disable.push(upstream.to_string());
        self
    }
}

/// A single mutation of a feature list in the chart values
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValuesOp {
    Add { path: &'static str, feature: String },
    Remove { path: &'static str, feature: String },
}

impl ValuesOp {
    pub fn apply(&self, values: &mut HelmValues) -> Result<()> {
        match self {
            ValuesOp::Add { path, feature } => values.add_to_list(path, feature),
            ValuesOp::Remove { path, feature } => values.remove_from_list(path, feature),
        }
    }
}

/// Registry of downstream to upstream feature gate mappings
#[derive(Clone, Debug)]
pub struct FeatureGateMapper {
    mappings: Vec<GateMapping>,
}

impl FeatureGateMapper {
    /// Validate and build a mapper. Every key must carry the downstream prefix and
    /// the bare prefix itself is rejected.
    pub fn new(mappings: Vec<GateMapping>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for mapping in &mappings {
            if mapping.downstream == DOWNSTREAM_PREFIX {
                return Err(Error::Precondition(format!(
                    "{DOWNSTREAM_PREFIX} is reserved and cannot be mapped"
                )));
            }
            if !mapping.downstream.starts_with(DOWNSTREAM_PREFIX) {
                return Err(Error::Precondition(format!(
                    "feature gate {} does not start with {DOWNSTREAM_PREFIX}",
                    mapping.downstream
                )));
            }
            if mapping.upstream.is_empty() {
                return Err(Error::Precondition(format!(
                    "feature gate {} maps to an empty upstream name",
                    mapping.downstream
                )));
            }
            if !seen.insert(mapping.downstream.as_str()) {
                return Err(Error::Precondition(format!(
                    "feature gate {} is mapped twice",
                    mapping.downstream
                )));
            }
        }
        Ok(Self { mappings })
    }

    /// The gates shipped with this release of the operator
    pub fn openshift() -> Result<Self> {
        Self::new(vec![
            GateMapping::new(
                PREFLIGHT_PERMISSION_CHECKS,
                SubComponent::OperatorController,
                "PreflightPermissions",
            ),
            GateMapping::new(
                OWN_SINGLE_NAMESPACE,
                SubComponent::OperatorController,
                "SingleOwnNamespaceInstallSupport",
            ),
            GateMapping::new(
                WEBHOOK_PROVIDER_OPENSHIFT_SERVICE_CA,
                SubComponent::OperatorController,
                "WebhookProviderOpenshiftServiceCA",
            )
            .always_disabling("WebhookProviderCertManager"),
            GateMapping::new(
                CATALOGD_API_V1_METAS,
                SubComponent::Catalogd,
                "APIV1MetasHandler",
            ),
            GateMapping::new(
                BOXCUTTER_RUNTIME,
                SubComponent::OperatorController,
                "BoxcutterRuntime",
            ),
        ])
    }

    pub fn mappings(&self) -> &[GateMapping] {
        &self.mappings
    }

    /// Values operations for the given snapshot.
    ///
    /// Enabled gates are added to the `enabled` list and removed from `disabled`.
    /// Gates the snapshot lists as disabled get the opposite treatment. Gates the
    /// snapshot does not mention produce nothing, so the upstream default applies.
    pub fn operations(&self, snapshot: &FeatureGateSnapshot) -> Vec<ValuesOp> {
        let mut ops = Vec::new();
        for mapping in &self.mappings {
            let enabled_path = mapping.subcomponent.features_enabled_path();
            let disabled_path = mapping.subcomponent.features_disabled_path();

            if snapshot.enabled.contains(&mapping.downstream) {
                ops.push(ValuesOp::Add {
                    path: enabled_path,
                    feature: mapping.upstream.clone(),
                });
                ops.push(ValuesOp::Remove {
                    path: disabled_path,
                    feature: mapping.upstream.clone(),
                });
            } else if snapshot.disabled.contains(&mapping.downstream) {
                ops.push(ValuesOp::Add {
                    path: disabled_path,
                    feature: mapping.upstream.clone(),
                });
                ops.push(ValuesOp::Remove {
                    path: enabled_path,
                    feature: mapping.upstream.clone(),
                });
            }

            for feature in &mapping.always_disable {
                ops.push(ValuesOp::Add {
                    path: disabled_path,
                    feature: feature.clone(),
                });
                ops.push(ValuesOp::Remove {
                    path: enabled_path,
                    feature: feature.clone(),
                });
            }
        }
        ops
    }

    /// Apply [`FeatureGateMapper::operations`] to `values`
    pub fn apply(&self, snapshot: &FeatureGateSnapshot, values: &mut HelmValues) -> Result<()> {
        for op in self.operations(snapshot) {
            op.apply(values)?;
        }
        Ok(())
    }

    /// Sorted upstream features enabled for one sub-component
    pub fn enabled_upstream(
        &self,
        snapshot: &FeatureGateSnapshot,
        subcomponent: SubComponent,
    ) -> Vec<String> {
        let features: BTreeSet<String> = self
            .mappings
            .iter()
            .filter(|m| m.subcomponent == subcomponent && snapshot.is_enabled(&m.downstream))
            .map(|m| m.upstream.clone())
            .collect();
        features.into_iter().collect()
    }

    /// Whether any mapped downstream gate is enabled
    pub fn any_enabled(&self, snapshot: &FeatureGateSnapshot) -> bool {
        self.mappings
            .iter()
            .any(|m| snapshot.is_enabled(&m.downstream))
    }

    /// Stable summary of everything in the snapshot that influences rendering.
    /// A change in this value means manifests must be re-rendered.
    pub fn fingerprint(&self, snapshot: &FeatureGateSnapshot) -> String {
        let mut parts = vec![format!("set={}", snapshot.feature_set)];
        for mapping in &self.mappings {
            let state = if snapshot.enabled.contains(&mapping.downstream) {
                "on"
            } else if snapshot.disabled.contains(&mapping.downstream) {
                "off"
            } else {
                "default"
            };
            parts.push(format!("{}={state}", mapping.downstream));
        }
        parts.join(",")
    }
}
