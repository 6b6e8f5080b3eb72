//! Static resource controller
//!
//! Enforces every non-deployment, non-catalog manifest of one sub-component, in
//! file order. Removal walks the list backwards.

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::conditions::removed_condition;
use super::hooks::{apply_manifest_hooks, manifest_hooks, ManifestHook};
use super::informers::InformerKind;
use super::resourceapply::{apply_manifest, delete_manifest, ApplyOutcome};
use super::restmapper::RestMapping;
use super::{clear_removed, ensure_active, Controller, ControllerContext, ManagementAction};
use crate::crd::LogLevel;
use crate::error::{join_errors, Error, Result};

const WATCHES: &[InformerKind] = &[
    InformerKind::Olm,
    InformerKind::StaticNamespaced,
    InformerKind::StaticClusterScoped,
];

/// Kinds left in place on removal; deleting them would take user data along
const RETAINED_ON_REMOVAL: &[&str] = &["CustomResourceDefinition"];

/// One manifest file and where it is served
#[derive(Clone, Debug)]
pub struct StaticManifest {
    pub file: PathBuf,
    pub mapping: RestMapping,
}

/// Manifests in deletion order: reversed, retained kinds left out
pub fn removal_order(manifests: &[StaticManifest]) -> Vec<&StaticManifest> {
    manifests
        .iter()
        .rev()
        .filter(|m| !RETAINED_ON_REMOVAL.contains(&m.mapping.resource.kind.as_str()))
        .collect()
}

/// Apply every manifest in file order. A failing manifest does not stop the pass;
/// failures come back joined, each naming its file. Returns how many objects changed.
pub async fn enforce_each<F, Fut>(
    manifests: &[StaticManifest],
    token: &CancellationToken,
    mut apply: F,
) -> Result<usize>
where
    F: FnMut(&StaticManifest) -> Fut,
    Fut: Future<Output = Result<ApplyOutcome>>,
{
    let mut errors = Vec::new();
    let mut changed = 0usize;
    for manifest in manifests {
        ensure_active(token)?;
        match apply(manifest).await {
            Ok(ApplyOutcome::Unchanged) => {}
            Ok(_) => changed += 1,
            Err(e @ Error::ManifestError { .. }) => errors.push(e),
            Err(e) => errors.push(Error::manifest(
                manifest.file.display().to_string(),
                e.to_string(),
            )),
        }
    }
    join_errors(errors).map_or(Ok(changed), Err)
}

/// Delete manifests in [`removal_order`], collecting failures like [`enforce_each`]
pub async fn remove_each<F, Fut>(
    manifests: &[StaticManifest],
    token: &CancellationToken,
    mut delete: F,
) -> Result<()>
where
    F: FnMut(&StaticManifest) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut errors = Vec::new();
    for manifest in removal_order(manifests) {
        ensure_active(token)?;
        match delete(manifest).await {
            Ok(_) => {}
            Err(e @ Error::ManifestError { .. }) => errors.push(e),
            Err(e) => errors.push(Error::manifest(
                manifest.file.display().to_string(),
                e.to_string(),
            )),
        }
    }
    join_errors(errors).map_or(Ok(()), Err)
}

pub struct StaticResourceController {
    name: String,
    manifests: Vec<StaticManifest>,
    hooks: Vec<ManifestHook>,
    ctx: ControllerContext,
}

impl StaticResourceController {
    pub fn new(name: String, manifests: Vec<StaticManifest>, ctx: ControllerContext) -> Self {
        Self {
            name,
            manifests,
            hooks: manifest_hooks(&ctx.environment),
            ctx,
        }
    }

    pub fn manifests(&self) -> &[StaticManifest] {
        &self.manifests
    }

    fn load(&self, manifest: &StaticManifest, log_level: LogLevel) -> Result<Value> {
        let raw = std::fs::read_to_string(&manifest.file)
            .map_err(|e| Error::io(&manifest.file, e))?;
        let raw = apply_manifest_hooks(&raw, &self.hooks, log_level);
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::manifest(manifest.file.display().to_string(), e.to_string()))
    }

    async fn enforce(&self, token: &CancellationToken, log_level: LogLevel) -> Result<()> {
        let client = &self.ctx.client;
        let changed = enforce_each(&self.manifests, token, |manifest| {
            let mapping = manifest.mapping.clone();
            let required = self.load(manifest, log_level);
            async move { apply_manifest(client, &mapping, &required?).await }
        })
        .await?;
        debug!(total = self.manifests.len(), changed, "Static resources enforced");
        clear_removed(&self.ctx.operator, &self.name).await
    }

    async fn remove(&self, token: &CancellationToken, log_level: LogLevel) -> Result<()> {
        let client = &self.ctx.client;
        remove_each(&self.manifests, token, |manifest| {
            let mapping = manifest.mapping.clone();
            let required = self.load(manifest, log_level);
            async move { delete_manifest(client, &mapping, &required?).await }
        })
        .await?;
        info!(controller = %self.name, "Removed static resources");
        self.ctx
            .operator
            .update_conditions(vec![removed_condition(&self.name)])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Controller for StaticResourceController {
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
        let log_level = self.ctx.operator.spec()?.effective_log_level();
        let state = self.ctx.operator.effective_management_state()?;
        match ManagementAction::for_state(state, true) {
            ManagementAction::Skip => Ok(()),
            ManagementAction::Remove => self.remove(token, log_level).await,
            ManagementAction::Enforce => self.enforce(token, log_level).await,
        }
    }
}
