//! Deployment controller
//!
//! Enforces one rendered deployment. The manifest is re-read on every sync, passed
//! through the manifest hooks, decoded and passed through the deployment hooks
//! before it is applied.

use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    ResourceExt,
};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::conditions::{
    apply_conditions, find_generation, removed_condition, set_generation,
    CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, CONDITION_TYPE_AVAILABLE,
    CONDITION_TYPE_PROGRESSING, CONDITION_TYPE_REMOVED, REASON_AS_EXPECTED,
};
use super::hooks::{
    apply_deployment_hooks, apply_manifest_hooks, deployment_hooks, manifest_hooks,
    DeploymentHook, ManifestHook,
};
use super::informers::InformerKind;
use super::operator_client::FIELD_MANAGER;
use super::{ensure_active, Controller, ControllerContext, ManagementAction};
use crate::crd::{Condition, GenerationStatus, LogLevel, ManagementState};
use crate::error::{Error, Result};
use crate::subcomponent::SubComponent;

/// Annotation carrying the hash of the applied deployment
pub const SPEC_HASH_ANNOTATION: &str = "operator.openshift.io/spec-hash";

const WATCHES: &[InformerKind] = &[
    InformerKind::Olm,
    InformerKind::Deployments,
    InformerKind::Proxy,
    InformerKind::ApiServer,
    InformerKind::FeatureGate,
];

pub struct DeploymentController {
    name: String,
    file: PathBuf,
    namespace: String,
    deployment_name: String,
    manifest_hooks: Vec<ManifestHook>,
    deployment_hooks: Vec<DeploymentHook>,
    ctx: ControllerContext,
}

impl DeploymentController {
    pub fn new(
        name: String,
        subcomponent: SubComponent,
        file: PathBuf,
        namespace: String,
        deployment_name: String,
        ctx: ControllerContext,
    ) -> Self {
        Self {
            name,
            file,
            namespace,
            deployment_name,
            manifest_hooks: manifest_hooks(&ctx.environment),
            deployment_hooks: deployment_hooks(subcomponent),
            ctx,
        }
    }

    fn api(&self) -> Api<Deployment> {
        Api::namespaced(self.ctx.client.clone(), &self.namespace)
    }

    /// Build the desired deployment from the manifest and the current cluster view
    fn desired(&self, log_level: LogLevel) -> Result<Deployment> {
        let raw = std::fs::read_to_string(&self.file).map_err(|e| Error::io(&self.file, e))?;
        let raw = apply_manifest_hooks(&raw, &self.manifest_hooks, log_level);
        let mut deployment: Deployment = serde_yaml::from_str(&raw)
            .map_err(|e| Error::manifest(self.file.display().to_string(), e.to_string()))?;

        let snapshot = self.ctx.observer.snapshot()?;
        apply_deployment_hooks(
            &mut deployment,
            &self.deployment_hooks,
            &snapshot,
            &self.ctx.mapper,
        )?;

        let hash = spec_hash(&deployment)?;
        deployment
            .annotations_mut()
            .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
        Ok(deployment)
    }

    async fn remove(&self, token: &CancellationToken) -> Result<()> {
        ensure_active(token)?;
        match self
            .api()
            .delete(&self.deployment_name, &DeleteParams::default())
            .await
        {
            Ok(_) => info!(
                "Deleted deployment {}/{}",
                self.namespace, self.deployment_name
            ),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let available = format!("{}{CONDITION_TYPE_AVAILABLE}", self.name);
        let progressing = format!("{}{CONDITION_TYPE_PROGRESSING}", self.name);
        self.ctx
            .operator
            .update_status(|status, clock| {
                status
                    .conditions
                    .retain(|c| c.type_ != available && c.type_ != progressing);
                status.conditions =
                    apply_conditions(&status.conditions, &[removed_condition(&self.name)], clock)?;
                status.generations.retain(|g| {
                    !(g.resource == "deployments"
                        && g.namespace == self.namespace
                        && g.name == self.deployment_name)
                });
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Controller for DeploymentController {
    fn name(&self) -> &str {
        &self.name
    }

    fn watches(&self) -> &[InformerKind] {
        WATCHES
    }

    fn removable(&self) -> bool {
        true
    }

    #[instrument(skip(self, token), fields(controller = %self.name))]
    async fn sync(&self, token: &CancellationToken) -> Result<()> {
        let spec = self.ctx.operator.spec()?;
        let state = self.ctx.operator.effective_management_state()?;
        match ManagementAction::for_state(state, true) {
            ManagementAction::Skip => return Ok(()),
            ManagementAction::Remove => return self.remove(token).await,
            ManagementAction::Enforce => {}
        }

        let desired = self.desired(spec.effective_log_level())?;
        let hash = desired
            .annotations()
            .get(SPEC_HASH_ANNOTATION)
            .cloned()
            .unwrap_or_default();

        let status = self.ctx.operator.status()?;
        let recorded = find_generation(
            &status.generations,
            "apps",
            "deployments",
            &self.namespace,
            &self.deployment_name,
        );
        let live = self
            .ctx
            .managed
            .deployment(&self.namespace, &self.deployment_name);
        let unchanged = match (&live, recorded) {
            (Some(live), Some(recorded)) => {
                live.annotations().get(SPEC_HASH_ANNOTATION) == Some(&hash)
                    && live.metadata.generation == Some(recorded.last_generation)
            }
            _ => false,
        };

        ensure_active(token)?;
        let applied = match live {
            Some(live) if unchanged && state != ManagementState::Force => {
                debug!("Deployment unchanged, skipping apply");
                (*live).clone()
            }
            _ => {
                let applied = self
                    .api()
                    .patch(
                        &self.deployment_name,
                        &PatchParams::apply(FIELD_MANAGER).force(),
                        &Patch::Apply(&desired),
                    )
                    .await?;
                info!(
                    "Applied deployment {}/{}",
                    self.namespace, self.deployment_name
                );
                applied
            }
        };

        ensure_active(token)?;
        let generation = GenerationStatus {
            group: "apps".to_string(),
            resource: "deployments".to_string(),
            namespace: self.namespace.clone(),
            name: self.deployment_name.clone(),
            last_generation: applied.metadata.generation.unwrap_or_default(),
            hash,
        };
        let conditions = deployment_conditions(&self.name, &applied);
        let removed = format!("{}{CONDITION_TYPE_REMOVED}", self.name);
        self.ctx
            .operator
            .update_status(move |status, clock| {
                set_generation(&mut status.generations, generation);
                status.conditions.retain(|c| c.type_ != removed);
                status.conditions = apply_conditions(&status.conditions, &conditions, clock)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Hex sha256 of the deployment as it will be applied, excluding the hash itself
pub fn spec_hash(deployment: &Deployment) -> Result<String> {
    let mut unhashed = deployment.clone();
    if let Some(annotations) = unhashed.metadata.annotations.as_mut() {
        annotations.remove(SPEC_HASH_ANNOTATION);
        if annotations.is_empty() {
            unhashed.metadata.annotations = None;
        }
    }
    let bytes = serde_json::to_vec(&unhashed)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// `<name>Available` and `<name>Progressing` for a live deployment
pub fn deployment_conditions(name: &str, deployment: &Deployment) -> Vec<Condition> {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();
    let available = status.available_replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let observed = status.observed_generation.unwrap_or(0);
    let generation = deployment.metadata.generation.unwrap_or(0);

    let available_condition = if available > 0 || desired == 0 {
        Condition::new(
            &format!("{name}{CONDITION_TYPE_AVAILABLE}"),
            CONDITION_STATUS_TRUE,
            REASON_AS_EXPECTED,
            &format!("{available} of {desired} replicas available"),
        )
    } else {
        Condition::new(
            &format!("{name}{CONDITION_TYPE_AVAILABLE}"),
            CONDITION_STATUS_FALSE,
            "NoAvailableReplicas",
            &format!(
                "deployment {} has no available replicas",
                deployment.name_any()
            ),
        )
    };

    let progressing_condition = if observed < generation || updated < desired {
        Condition::new(
            &format!("{name}{CONDITION_TYPE_PROGRESSING}"),
            CONDITION_STATUS_TRUE,
            "RollingOut",
            &format!("{updated} of {desired} replicas updated"),
        )
    } else {
        Condition::new(
            &format!("{name}{CONDITION_TYPE_PROGRESSING}"),
            CONDITION_STATUS_FALSE,
            REASON_AS_EXPECTED,
            "",
        )
    };

    vec![available_condition, progressing_condition]
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

    fn deployment(
        replicas: i32,
        available: i32,
        updated: i32,
        generation: i64,
        observed: i64,
    ) -> Deployment {
        Deployment {
            metadata: kube::api::ObjectMeta {
                name: Some("catalogd-controller-manager".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                available_replicas: Some(available),
                updated_replicas: Some(updated),
                observed_generation: Some(observed),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_rolled_out_deployment_is_available() {
        let conditions = deployment_conditions("CatalogdDeployment", &deployment(1, 1, 1, 3, 3));
        assert_eq!(conditions[0].type_, "CatalogdDeploymentAvailable");
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_eq!(conditions[1].type_, "CatalogdDeploymentProgressing");
        assert_eq!(conditions[1].status, CONDITION_STATUS_FALSE);
    }

    #[test]
    fn test_new_generation_is_progressing() {
        let conditions = deployment_conditions("X", &deployment(1, 0, 0, 4, 3));
        assert_eq!(conditions[0].status, CONDITION_STATUS_FALSE);
        assert_eq!(conditions[1].status, CONDITION_STATUS_TRUE);
    }

    #[test]
    fn test_spec_hash_ignores_its_own_annotation() {
        let mut d = deployment(1, 1, 1, 1, 1);
        let before = spec_hash(&d).unwrap();
        d.annotations_mut()
            .insert(SPEC_HASH_ANNOTATION.to_string(), before.clone());
        assert_eq!(spec_hash(&d).unwrap(), before);

        d.spec.as_mut().unwrap().replicas = Some(2);
        assert_ne!(spec_hash(&d).unwrap(), before);
    }
}
