//! Chart rendering into an ordered directory of manifest files
//!
//! One render produces `<out>/<subcomponent>/NN-[<namespace>-]<kind>-<name>.yaml` for
//! every sub-component. The output directory is built next to the target and
//! swapped into place, so a failed render leaves the previous manifests untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use serde_yaml::Value;
use tracing::{debug, info, instrument, warn};

use crate::assets::AssetStore;
use crate::environment::{placeholder, OperatorEnvironment, KUBE_RBAC_PROXY_IMAGE_ENV};
use crate::error::{Error, Result};
use crate::featuregates::{FeatureGateMapper, FeatureGateSnapshot};
use crate::helm::values::{HelmValues, FEATURE_LIST_PATHS, KUBE_RBAC_PROXY_IMAGE_PATH};
use crate::subcomponent::SubComponent;

pub const CHART_DIR: &str = "helm/olmv1";
pub const BASE_VALUES_FILE: &str = "helm/openshift.yaml";
pub const EXPERIMENTAL_VALUES_FILE: &str = "helm/experimental.yaml";

/// Synthetic release name passed to the chart engine
pub const RELEASE_NAME: &str = "olmv1";

const RELEASE_VERSION_PATH: &str = "options.openshift.releaseVersion";

/// Turns a chart directory plus one values file into a YAML stream
pub trait ChartEngine: Send + Sync {
    fn template(&self, release: &str, chart_dir: &Path, values_file: &Path) -> Result<String>;
}

/// [`ChartEngine`] backed by `helm template`
#[derive(Clone, Debug)]
pub struct HelmTemplate {
    binary: String,
}

impl Default for HelmTemplate {
    fn default() -> Self {
        Self {
            binary: "helm".to_string(),
        }
    }
}

impl HelmTemplate {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl ChartEngine for HelmTemplate {
    fn template(&self, release: &str, chart_dir: &Path, values_file: &Path) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("template")
            .arg(release)
            .arg(chart_dir)
            .arg("--values")
            .arg(values_file)
            .arg("--no-hooks")
            .output()
            .map_err(|e| Error::RenderError(format!("failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::RenderError(format!(
                "helm template failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// One document of the rendered stream
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestDocument {
    /// 1-based position among the kept documents
    pub index: usize,
    pub kind: String,
    pub api_version: String,
    pub name: String,
    pub namespace: String,
    /// Source text exactly as rendered
    pub raw: String,
}

impl ManifestDocument {
    /// API group, empty for the core group
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    pub fn file_name(&self) -> String {
        manifest_file_name(self.index, &self.namespace, &self.kind, &self.name)
    }
}

/// Result of a successful render
#[derive(Clone, Debug)]
pub struct RenderedManifests {
    pub root: PathBuf,
    pub documents: BTreeMap<SubComponent, Vec<ManifestDocument>>,
}

impl RenderedManifests {
    pub fn subcomponent_dir(&self, subcomponent: SubComponent) -> PathBuf {
        self.root.join(subcomponent.name())
    }
}

/// Renders the embedded chart for every sub-component
pub struct ManifestRenderer {
    assets: Arc<AssetStore>,
    engine: Arc<dyn ChartEngine>,
    mapper: Arc<FeatureGateMapper>,
    chart_dir: String,
    base_values: String,
    experimental_values: Option<String>,
}

impl ManifestRenderer {
    pub fn new(
        assets: Arc<AssetStore>,
        engine: Arc<dyn ChartEngine>,
        mapper: Arc<FeatureGateMapper>,
    ) -> Self {
        let experimental_values = assets
            .contains(EXPERIMENTAL_VALUES_FILE)
            .then(|| EXPERIMENTAL_VALUES_FILE.to_string());
        Self {
            assets,
            engine,
            mapper,
            chart_dir: CHART_DIR.to_string(),
            base_values: BASE_VALUES_FILE.to_string(),
            experimental_values,
        }
    }

    pub fn with_chart_dir(mut self, chart_dir: impl Into<String>) -> Self {
        self.chart_dir = chart_dir.into();
        self
    }

    pub fn with_values_files(mut self, base: impl Into<String>, experimental: Option<String>) -> Self {
        self.base_values = base.into();
        self.experimental_values = experimental;
        self
    }

    /// Build the values shared by every sub-component render
    pub fn compose_values(
        &self,
        snapshot: &FeatureGateSnapshot,
        environment: &OperatorEnvironment,
    ) -> Result<HelmValues> {
        let mut gate_values = HelmValues::new();
        self.mapper.apply(snapshot, &mut gate_values)?;

        let mut files = vec![self.base_values.as_str()];
        if gate_values.has_any_enabled_feature_gates() || snapshot.is_preview() {
            if let Some(experimental) = &self.experimental_values {
                files.push(experimental.as_str());
            }
        }
        let mut values = HelmValues::load_from_assets(&self.assets, &files)?;

        // Feature lists only ever come from the cluster's gates
        for path in FEATURE_LIST_PATHS {
            values.set_list(path, Vec::new())?;
        }
        self.mapper.apply(snapshot, &mut values)?;

        for sub in SubComponent::ALL {
            let image = environment
                .image(sub)
                .map(str::to_string)
                .unwrap_or_else(|| placeholder(sub.image_env()));
            values.set_scalar(sub.image_values_path(), image)?;
        }
        let rbac_proxy = environment
            .kube_rbac_proxy_image
            .clone()
            .unwrap_or_else(|| placeholder(KUBE_RBAC_PROXY_IMAGE_ENV));
        values.set_scalar(KUBE_RBAC_PROXY_IMAGE_PATH, rbac_proxy)?;

        if !environment.release_version.is_empty() {
            values.set_scalar(RELEASE_VERSION_PATH, environment.release_version.clone())?;
        }

        debug!(files = ?files, "Composed chart values");
        Ok(values)
    }

    /// Render every sub-component into `out_dir`, replacing its previous content
    #[instrument(skip(self, snapshot, environment), fields(out_dir = %out_dir.display()))]
    pub fn render(
        &self,
        snapshot: &FeatureGateSnapshot,
        environment: &OperatorEnvironment,
        out_dir: &Path,
    ) -> Result<RenderedManifests> {
        let values = self.compose_values(snapshot, environment)?;

        let workdir = tempfile::Builder::new()
            .prefix("olm-chart-")
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?;
        let chart_path = workdir.path().join("chart");
        let written = self.assets.materialize(&self.chart_dir, &chart_path)?;
        if written.is_empty() {
            return Err(Error::RenderError(format!(
                "chart directory {} is empty",
                self.chart_dir
            )));
        }

        let parent = match out_dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| Error::io(&parent, e))?;
        let staging = tempfile::Builder::new()
            .prefix(".manifests-")
            .tempdir_in(&parent)
            .map_err(|e| Error::io(&parent, e))?;

        let mut documents = BTreeMap::new();
        for sub in SubComponent::ALL {
            let mut sub_values = values.clone();
            for other in SubComponent::ALL {
                sub_values.set_scalar(&other.enabled_values_path(), other == sub)?;
            }
            let values_file = workdir.path().join(format!("values-{}.yaml", sub.name()));
            std::fs::write(&values_file, sub_values.to_yaml()?)
                .map_err(|e| Error::io(&values_file, e))?;

            let stream = self.engine.template(RELEASE_NAME, &chart_path, &values_file)?;
            let docs = split_documents(&stream)?;

            let sub_dir = staging.path().join(sub.name());
            std::fs::create_dir_all(&sub_dir).map_err(|e| Error::io(&sub_dir, e))?;
            for doc in &docs {
                let path = sub_dir.join(doc.file_name());
                std::fs::write(&path, &doc.raw).map_err(|e| Error::io(&path, e))?;
            }
            debug!(subcomponent = %sub, count = docs.len(), "Rendered sub-component");
            documents.insert(sub, docs);
        }

        replace_dir(staging.path(), out_dir)?;
        info!(
            catalogd = documents.get(&SubComponent::Catalogd).map_or(0, Vec::len),
            operator_controller = documents
                .get(&SubComponent::OperatorController)
                .map_or(0, Vec::len),
            "Rendered manifests"
        );
        Ok(RenderedManifests {
            root: out_dir.to_path_buf(),
            documents,
        })
    }
}

/// Split a rendered YAML stream into documents, keeping their source text.
///
/// Empty and comment-only documents are dropped. Every other document must have a
/// non-empty `kind`.
pub fn split_documents(stream: &str) -> Result<Vec<ManifestDocument>> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in stream.lines() {
        if is_separator(line) {
            chunks.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    chunks.push(current);

    let mut documents = Vec::new();
    for (position, chunk) in chunks.into_iter().enumerate() {
        let meaningful = chunk.lines().any(|l| {
            let t = l.trim();
            !t.is_empty() && !t.starts_with('#')
        });
        if !meaningful {
            continue;
        }
        let value: Value = serde_yaml::from_str(&chunk).map_err(|e| {
            Error::RenderError(format!("document {} is not valid YAML: {e}", position + 1))
        })?;
        if value.is_null() {
            continue;
        }

        let kind = str_at(&value, &["kind"]);
        if kind.is_empty() {
            return Err(Error::RenderError(format!(
                "document {} has no kind",
                position + 1
            )));
        }
        documents.push(ManifestDocument {
            index: documents.len() + 1,
            kind,
            api_version: str_at(&value, &["apiVersion"]),
            name: str_at(&value, &["metadata", "name"]),
            namespace: str_at(&value, &["metadata", "namespace"]),
            raw: chunk,
        });
    }
    Ok(documents)
}

/// `NN-<namespace>-<kind>-<name>.yaml`, or `NN-<kind>-<name>.yaml` when cluster scoped
pub fn manifest_file_name(index: usize, namespace: &str, kind: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("{index:02}-{kind}-{}.yaml", sanitize(name))
    } else {
        format!(
            "{index:02}-{}-{kind}-{}.yaml",
            sanitize(namespace),
            sanitize(name)
        )
    }
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn is_separator(line: &str) -> bool {
    let line = line.trim_end();
    line == "---" || line.starts_with("--- ")
}

fn str_at(value: &Value, path: &[&str]) -> String {
    let mut current = value;
    for key in path {
        match current.get(*key) {
            Some(v) => current = v,
            None => return String::new(),
        }
    }
    current.as_str().unwrap_or_default().to_string()
}

/// Move `staging` to `target`, replacing whatever was there
fn replace_dir(staging: &Path, target: &Path) -> Result<()> {
    let backup = target.with_file_name(format!(
        ".{}-previous",
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manifests".to_string())
    ));
    if backup.exists() {
        std::fs::remove_dir_all(&backup).map_err(|e| Error::io(&backup, e))?;
    }

    let had_previous = target.exists();
    if had_previous {
        std::fs::rename(target, &backup).map_err(|e| Error::io(target, e))?;
    }
    if let Err(e) = std::fs::rename(staging, target) {
        if had_previous {
            if let Err(restore) = std::fs::rename(&backup, target) {
                warn!(
                    backup = %backup.display(),
                    "Failed to restore previous manifests: {}", restore
                );
                let message = format!(
                    "{e}; restoring previous manifests from {} failed: {restore}",
                    backup.display()
                );
                return Err(Error::io(target, std::io::Error::new(e.kind(), message)));
            }
        }
        return Err(Error::io(target, e));
    }
    if had_previous {
        std::fs::remove_dir_all(&backup).map_err(|e| Error::io(&backup, e))?;
    }
    Ok(())
}
