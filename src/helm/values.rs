//! In-memory Helm values tree
//!
//! Values are a recursive map of string keys to scalars, string lists or nested maps.
//! Paths use dotted notation (`options.catalogd.features.enabled`).
//!
//! Merging is deep for maps only: scalars and lists from a later source replace the
//! earlier value. Lists in chart values are position sensitive, so they are never
//! concatenated.

use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::assets::AssetStore;
use crate::error::{Error, Result};

pub const CATALOGD_FEATURES_ENABLED: &str = "options.catalogd.features.enabled";
pub const CATALOGD_FEATURES_DISABLED: &str = "options.catalogd.features.disabled";
pub const OPERATOR_CONTROLLER_FEATURES_ENABLED: &str = "options.operatorController.features.enabled";
pub const OPERATOR_CONTROLLER_FEATURES_DISABLED: &str =
    "options.operatorController.features.disabled";

pub const CATALOGD_IMAGE_PATH: &str = "options.catalogd.deployment.image";
pub const OPERATOR_CONTROLLER_IMAGE_PATH: &str = "options.operatorController.deployment.image";
pub const KUBE_RBAC_PROXY_IMAGE_PATH: &str = "options.kubeRbacProxy.image";

/// Every feature list path written by the feature gate mapper
pub const FEATURE_LIST_PATHS: [&str; 4] = [
    CATALOGD_FEATURES_ENABLED,
    CATALOGD_FEATURES_DISABLED,
    OPERATOR_CONTROLLER_FEATURES_ENABLED,
    OPERATOR_CONTROLLER_FEATURES_DISABLED,
];

/// Mutable Helm values tree
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HelmValues {
    root: Mapping,
}

impl HelmValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single YAML document; an empty document yields an empty tree
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        match serde_yaml::from_str::<Value>(source)? {
            Value::Null => Ok(Self::new()),
            Value::Mapping(root) => Ok(Self { root }),
            other => Err(Error::ConfigError(format!(
                "helm values must be a map, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// Parse each file as YAML and deep-merge them in order
    pub fn load_from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut values = Self::new();
        for path in paths {
            let path = path.as_ref();
            let source = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
            values.merge(Self::from_yaml_str(&source).map_err(|e| {
                Error::ConfigError(format!("values file {}: {e}", path.display()))
            })?);
        }
        Ok(values)
    }

    /// Same as [`HelmValues::load_from_files`] but reading from the asset store
    pub fn load_from_assets(assets: &AssetStore, paths: &[&str]) -> Result<Self> {
        let mut values = Self::new();
        for path in paths {
            let source = String::from_utf8_lossy(assets.read(path)?).into_owned();
            values.merge(
                Self::from_yaml_str(&source)
                    .map_err(|e| Error::ConfigError(format!("values file {path}: {e}")))?,
            );
        }
        Ok(values)
    }

    /// Deep-merge `other` on top of `self`
    pub fn merge(&mut self, other: HelmValues) {
        merge_mappings(&mut self.root, other.root);
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let value = current.get(segment)?;
            if segments.peek().is_none() {
                return Some(value);
            }
            current = value.as_mapping()?;
        }
        None
    }

    /// String list at `path`, empty when absent
    pub fn get_list(&self, path: &str) -> Vec<String> {
        self.get(path)
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrite the terminal key, creating intermediate maps as needed
    pub fn set_scalar(&mut self, path: &str, value: impl Into<Value>) -> Result<()> {
        let (parent, key) = self.parent_mut(path)?;
        parent.insert(Value::String(key), value.into());
        Ok(())
    }

    /// Replace the list at `path`
    pub fn set_list(&mut self, path: &str, values: Vec<String>) -> Result<()> {
        self.set_scalar(
            path,
            Value::Sequence(values.into_iter().map(Value::String).collect()),
        )
    }

    /// Insert `value` into the list at `path`, keeping it sorted and unique
    pub fn add_to_list(&mut self, path: &str, value: &str) -> Result<()> {
        let mut list = self.list_at(path)?;
        list.push(value.to_string());
        list.sort();
        list.dedup();
        self.set_list(path, list)
    }

    /// Remove `value` from the list at `path`; the list stays (possibly empty)
    pub fn remove_from_list(&mut self, path: &str, value: &str) -> Result<()> {
        if self.get(path).is_none() {
            return Ok(());
        }
        let mut list = self.list_at(path)?;
        list.retain(|v| v != value);
        self.set_list(path, list)
    }

    /// Whether either sub-component has a non-empty `enabled` feature list
    pub fn has_any_enabled_feature_gates(&self) -> bool {
        [CATALOGD_FEATURES_ENABLED, OPERATOR_CONTROLLER_FEATURES_ENABLED]
            .iter()
            .any(|path| !self.get_list(path).is_empty())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.root)?)
    }

    fn list_at(&self, path: &str) -> Result<Vec<String>> {
        match self.get(path) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Sequence(seq)) => seq
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        Error::ConfigError(format!("{path} must only contain strings"))
                    })
                })
                .collect(),
            Some(other) => Err(Error::ConfigError(format!(
                "{path} is a {}, not a list",
                kind_of(other)
            ))),
        }
    }

    fn parent_mut(&mut self, path: &str) -> Result<(&mut Mapping, String)> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::ConfigError(format!("invalid values path {path:?}")));
        }
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| Error::ConfigError("empty values path".to_string()))?;

        let mut current = &mut self.root;
        for segment in parents {
            let key = Value::String((*segment).to_string());
            let entry = current
                .entry(key)
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if entry.is_null() {
                *entry = Value::Mapping(Mapping::new());
            }
            current = match entry {
                Value::Mapping(m) => m,
                other => {
                    return Err(Error::ConfigError(format!(
                        "{path}: {segment} is a {}, not a map",
                        kind_of(other)
                    )))
                }
            };
        }
        Ok((current, (*last).to_string()))
    }
}

fn merge_mappings(base: &mut Mapping, overlay: Mapping) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                merge_mappings(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "map",
        Value::Tagged(_) => "tagged value",
    }
}
