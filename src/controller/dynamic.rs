//! Field-level enforcement of one dynamically typed manifest
//!
//! The controller owns only the fields present in its manifest. Anything users add
//! to the live object is left alone, and an apply only happens when a manifest field
//! is missing or different.

use std::path::PathBuf;

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::hooks::{apply_manifest_hooks, manifest_hooks, ManifestHook};
use super::informers::InformerKind;
use super::restmapper::RestMapping;
use super::{ensure_active, Controller, ControllerContext, ManagementAction};
use crate::error::{Error, Result};

const WATCHES: &[InformerKind] = &[InformerKind::Olm, InformerKind::ClusterCatalogs];

/// Whether every field of `required` appears identically in `live`, at every depth.
///
/// Lists must match element by element. `null` in `required` matches anything.
pub fn is_deep_derivative(required: &Value, live: &Value) -> bool {
    match (required, live) {
        (Value::Null, _) => true,
        (Value::Object(required), Value::Object(live)) => required.iter().all(|(key, value)| {
            match live.get(key) {
                Some(found) => is_deep_derivative(value, found),
                None => value.is_null(),
            }
        }),
        (Value::Array(required), Value::Array(live)) => {
            required.len() == live.len()
                && required
                    .iter()
                    .zip(live.iter())
                    .all(|(r, l)| is_deep_derivative(r, l))
        }
        (required, live) => required == live,
    }
}

/// Whether `required` has to be applied over the cached `live` object
pub fn needs_apply(required: &Value, live: Option<&Value>) -> bool {
    live.map_or(true, |live| !is_deep_derivative(required, live))
}

pub struct DynamicRequiredManifestController {
    name: String,
    file: PathBuf,
    object_name: String,
    mapping: RestMapping,
    hooks: Vec<ManifestHook>,
    ctx: ControllerContext,
}

impl DynamicRequiredManifestController {
    pub fn new(
        name: String,
        file: PathBuf,
        object_name: String,
        mapping: RestMapping,
        ctx: ControllerContext,
    ) -> Self {
        Self {
            name,
            file,
            object_name,
            mapping,
            hooks: manifest_hooks(&ctx.environment),
            ctx,
        }
    }

    fn required(&self) -> Result<Value> {
        let raw = std::fs::read_to_string(&self.file).map_err(|e| Error::io(&self.file, e))?;
        let log_level = self.ctx.operator.spec()?.effective_log_level();
        let raw = apply_manifest_hooks(&raw, &self.hooks, log_level);
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::manifest(self.file.display().to_string(), e.to_string()))
    }
}

#[async_trait]
impl Controller for DynamicRequiredManifestController {
    fn name(&self) -> &str {
        &self.name
    }

    fn watches(&self) -> &[InformerKind] {
        WATCHES
    }

    #[instrument(skip(self, token), fields(controller = %self.name))]
    async fn sync(&self, token: &CancellationToken) -> Result<()> {
        let state = self.ctx.operator.management_state()?;
        if ManagementAction::for_state(state, false) != ManagementAction::Enforce {
            return Ok(());
        }

        let required = self.required()?;
        let live = self
            .ctx
            .managed
            .cluster_catalog(&self.object_name)
            .map(|live| serde_json::to_value(live.as_ref()))
            .transpose()?;
        if !needs_apply(&required, live.as_ref()) {
            debug!(name = %self.object_name, "Live object already matches manifest");
            return Ok(());
        }

        ensure_active(token)?;
        self.mapping
            .api(&self.ctx.client, None)
            .patch(
                &self.object_name,
                &PatchParams::apply(&self.name).force(),
                &Patch::Apply(&required),
            )
            .await?;
        info!(
            kind = %self.mapping.resource.kind,
            name = %self.object_name,
            "Applied required manifest"
        );
        Ok(())
    }
}
