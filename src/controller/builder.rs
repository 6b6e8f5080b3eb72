//! Turn a rendered manifest directory into controllers
//!
//! Every `.yaml`/`.yml` file below a sub-component directory is decoded, resolved to
//! an API resource and classified:
//!
//! - `apps` `Deployment` becomes a [`DeploymentController`]
//! - `ClusterCatalog` becomes a [`DynamicRequiredManifestController`]
//! - everything else joins the sub-component's [`StaticResourceController`]
//!
//! Files are visited in lexicographic order. Errors are collected across all files
//! and reported together.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::deployment::DeploymentController;
use super::dynamic::DynamicRequiredManifestController;
use super::restmapper::{split_api_version, RestMapper, RestMapping};
use super::static_resources::{StaticManifest, StaticResourceController};
use super::{title_case, Controller, ControllerContext};
use crate::crd::RelatedObject;
use crate::error::{join_errors, Error, Result};
use crate::subcomponent::SubComponent;

const CLUSTER_CATALOG_GROUP: &str = "olm.operatorframework.io";

/// A controller the plan will construct
#[derive(Clone, Debug)]
pub enum PlannedController {
    Deployment {
        name: String,
        subcomponent: SubComponent,
        file: PathBuf,
        namespace: String,
        deployment_name: String,
    },
    Dynamic {
        name: String,
        file: PathBuf,
        object_name: String,
        mapping: RestMapping,
    },
    Static {
        name: String,
        subcomponent: SubComponent,
        manifests: Vec<StaticManifest>,
    },
}

impl PlannedController {
    pub fn name(&self) -> &str {
        match self {
            PlannedController::Deployment { name, .. }
            | PlannedController::Dynamic { name, .. }
            | PlannedController::Static { name, .. } => name,
        }
    }
}

/// Classified manifests, before any cluster collaborator is attached
#[derive(Clone, Debug, Default)]
pub struct BuildPlan {
    pub controllers: Vec<PlannedController>,
    pub related_objects: Vec<RelatedObject>,
    pub namespaces: BTreeSet<String>,
}

impl BuildPlan {
    /// Construct the controllers with their shared context
    pub fn into_controller_set(self, ctx: &ControllerContext) -> ControllerSet {
        let controllers = self
            .controllers
            .into_iter()
            .map(|planned| -> Arc<dyn Controller> {
                match planned {
                    PlannedController::Deployment {
                        name,
                        subcomponent,
                        file,
                        namespace,
                        deployment_name,
                    } => Arc::new(DeploymentController::new(
                        name,
                        subcomponent,
                        file,
                        namespace,
                        deployment_name,
                        ctx.clone(),
                    )),
                    PlannedController::Dynamic {
                        name,
                        file,
                        object_name,
                        mapping,
                    } => Arc::new(DynamicRequiredManifestController::new(
                        name,
                        file,
                        object_name,
                        mapping,
                        ctx.clone(),
                    )),
                    PlannedController::Static {
                        name, manifests, ..
                    } => Arc::new(StaticResourceController::new(name, manifests, ctx.clone())),
                }
            })
            .collect();
        ControllerSet {
            controllers,
            related_objects: self.related_objects,
            namespaces: self.namespaces,
        }
    }
}

/// Controllers for one render plus the inventory they manage
pub struct ControllerSet {
    pub controllers: Vec<Arc<dyn Controller>>,
    pub related_objects: Vec<RelatedObject>,
    pub namespaces: BTreeSet<String>,
}

/// `TitleCase(subcomponent) + Kind + TitleCase(name)`
pub fn controller_name(subcomponent: SubComponent, kind: &str, name: &str) -> String {
    format!("{}{kind}{}", title_case(subcomponent.name()), title_case(name))
}

pub struct ControllerBuilder {
    mapper: Arc<dyn RestMapper>,
}

impl ControllerBuilder {
    pub fn new(mapper: Arc<dyn RestMapper>) -> Self {
        Self { mapper }
    }

    /// Classify every manifest under `root/<subcomponent>/`
    pub async fn plan(&self, root: &Path) -> Result<BuildPlan> {
        let mut plan = BuildPlan::default();
        let mut seen = BTreeSet::new();
        let mut names = BTreeSet::new();
        let mut errors = Vec::new();

        for subcomponent in SubComponent::ALL {
            let dir = root.join(subcomponent.name());
            if !dir.is_dir() {
                debug!(subcomponent = %subcomponent, "No manifests rendered");
                continue;
            }

            let mut statics = Vec::new();
            for file in manifest_files(&dir, &mut errors) {
                let manifest = match self.resolve(&file).await {
                    Ok(m) => m,
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                };

                let related = manifest.related_object();
                if seen.insert(related.clone()) {
                    if !related.namespace.is_empty() {
                        plan.namespaces.insert(related.namespace.clone());
                    }
                    if manifest.kind == "Namespace" {
                        plan.namespaces.insert(related.name.clone());
                    }
                    plan.related_objects.push(related);
                }

                let group = manifest.group().to_string();
                let planned = match (group.as_str(), manifest.kind.as_str()) {
                    ("apps", "Deployment") => PlannedController::Deployment {
                        name: controller_name(subcomponent, &manifest.kind, &manifest.name),
                        subcomponent,
                        file: manifest.file,
                        namespace: manifest.namespace,
                        deployment_name: manifest.name,
                    },
                    (CLUSTER_CATALOG_GROUP, "ClusterCatalog") => PlannedController::Dynamic {
                        name: controller_name(subcomponent, &manifest.kind, &manifest.name),
                        file: manifest.file,
                        object_name: manifest.name,
                        mapping: manifest.mapping,
                    },
                    _ => {
                        statics.push(StaticManifest {
                            file: manifest.file,
                            mapping: manifest.mapping,
                        });
                        continue;
                    }
                };
                if !names.insert(planned.name().to_string()) {
                    errors.push(Error::ConfigError(format!(
                        "duplicate controller name {}",
                        planned.name()
                    )));
                    continue;
                }
                plan.controllers.push(planned);
            }

            if !statics.is_empty() {
                plan.controllers.push(PlannedController::Static {
                    name: format!("{}StaticResources", title_case(subcomponent.name())),
                    subcomponent,
                    manifests: statics,
                });
            }
        }

        if let Some(err) = join_errors(errors) {
            return Err(err);
        }
        info!(
            controllers = plan.controllers.len(),
            related_objects = plan.related_objects.len(),
            "Planned controllers"
        );
        Ok(plan)
    }

    pub async fn build(&self, root: &Path, ctx: &ControllerContext) -> Result<ControllerSet> {
        Ok(self.plan(root).await?.into_controller_set(ctx))
    }

    async fn resolve(&self, file: &Path) -> Result<ResolvedManifest> {
        let display = file.display().to_string();
        let raw = std::fs::read_to_string(file).map_err(|e| Error::io(file, e))?;
        let value: Value =
            serde_yaml::from_str(&raw).map_err(|e| Error::manifest(&display, e.to_string()))?;

        let field = |pointer: &str| {
            value
                .pointer(pointer)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let api_version = field("/apiVersion");
        let kind = field("/kind");
        let name = field("/metadata/name");
        let namespace = field("/metadata/namespace");
        if api_version.is_empty() || kind.is_empty() || name.is_empty() {
            return Err(Error::manifest(
                &display,
                "apiVersion, kind and metadata.name are required",
            ));
        }

        let mapping = self
            .mapper
            .mapping(&api_version, &kind)
            .await
            .map_err(|e| Error::manifest(&display, e.to_string()))?;
        if mapping.namespaced && namespace.is_empty() {
            return Err(Error::manifest(
                &display,
                format!("namespaced {kind} {name} has no namespace"),
            ));
        }

        Ok(ResolvedManifest {
            file: file.to_path_buf(),
            api_version,
            kind,
            name,
            namespace: if mapping.namespaced { namespace } else { String::new() },
            mapping,
        })
    }
}

struct ResolvedManifest {
    file: PathBuf,
    api_version: String,
    kind: String,
    name: String,
    namespace: String,
    mapping: RestMapping,
}

impl ResolvedManifest {
    fn group(&self) -> &str {
        split_api_version(&self.api_version).0
    }

    fn related_object(&self) -> RelatedObject {
        RelatedObject {
            group: self.mapping.resource.group.clone(),
            resource: self.mapping.resource.plural.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Manifest files below `dir` in lexicographic order
fn manifest_files(dir: &Path, errors: &mut Vec<Error>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let path = entry.into_path();
                let is_yaml = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "yaml" || e == "yml");
                if is_yaml {
                    files.push(path);
                }
            }
            Ok(_) => {}
            Err(e) => errors.push(Error::ConfigError(format!(
                "walking {}: {e}",
                dir.display()
            ))),
        }
    }
    files
}
