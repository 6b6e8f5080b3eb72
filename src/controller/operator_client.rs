//! Client for the `OLM` singleton
//!
//! Reads come from the informer cache. Writes are forced server-side applies, each
//! scoped to one field path and owned by its own field manager:
//!
//! | path                 | field manager                      |
//! |----------------------|------------------------------------|
//! | `spec`               | `<base>-spec`                      |
//! | `status`             | `<base>`                           |
//! | `metadata.finalizers`| `<base>-finalizer`                 |
//!
//! The managers are fixed when the client is built, so no caller can widen a patch.

use std::sync::Arc;

use kube::{
    api::{Api, Patch, PatchParams},
    runtime::reflector::{ObjectRef, Store},
    Client, Resource, ResourceExt,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::conditions::{apply_conditions, Clock};
use crate::crd::{
    Condition, ManagementState, Olm, OperatorSpec, OperatorStatus, OLM_SINGLETON_NAME,
};
use crate::error::{Error, Result};

/// Base field manager of this operator
pub const FIELD_MANAGER: &str = "cluster-olm-operator";

/// Finalizer kept on the singleton while the operands are managed
pub const CLEANUP_FINALIZER: &str = "olm.operator.openshift.io/cleanup";

/// The three disjoint field managers derived from one base name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldManagers {
    status: String,
    spec: String,
    finalizer: String,
}

impl FieldManagers {
    pub fn new(base: &str) -> Result<Self> {
        if base.trim().is_empty() {
            return Err(Error::Precondition("field manager must not be empty".to_string()));
        }
        Ok(Self {
            status: base.to_string(),
            spec: format!("{base}-spec"),
            finalizer: format!("{base}-finalizer"),
        })
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }
}

/// Apply body for `spec` only
pub fn spec_patch(spec: &OperatorSpec) -> Value {
    json!({
        "apiVersion": Olm::api_version(&()),
        "kind": Olm::kind(&()),
        "spec": spec,
    })
}

/// Apply body for `status` only
pub fn status_patch(status: &OperatorStatus) -> Value {
    json!({
        "apiVersion": Olm::api_version(&()),
        "kind": Olm::kind(&()),
        "status": status,
    })
}

/// Apply body for `metadata.finalizers` only
pub fn finalizers_patch(finalizers: &[String]) -> Value {
    json!({
        "apiVersion": Olm::api_version(&()),
        "kind": Olm::kind(&()),
        "metadata": { "finalizers": finalizers },
    })
}

/// The finalizer set this client's manager applies so that `token` ends up present
/// (or absent), or `None` when nothing changes.
///
/// `metadata.finalizers` merges as a set under server-side apply, so the manager
/// only ever states its own token and leaves entries of other owners alone.
pub fn owned_finalizers(current: &[String], token: &str, present: bool) -> Option<Vec<String>> {
    let has = current.iter().any(|f| f == token);
    match (has, present) {
        (false, true) => Some(vec![token.to_string()]),
        (true, false) => Some(Vec::new()),
        _ => None,
    }
}

/// Management state with a pending deletion of the singleton treated as `Removed`
pub fn effective_state(state: ManagementState, deleting: bool) -> ManagementState {
    match state {
        ManagementState::Managed | ManagementState::Force if deleting => ManagementState::Removed,
        state => state,
    }
}

/// Typed access to the `OLM` singleton
pub struct OperatorClient {
    api: Api<Olm>,
    store: Store<Olm>,
    managers: FieldManagers,
    clock: Arc<dyn Clock>,
    status_lock: Mutex<()>,
}

impl OperatorClient {
    pub fn new(
        client: Client,
        store: Store<Olm>,
        field_manager: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            api: Api::all(client),
            store,
            managers: FieldManagers::new(field_manager)?,
            clock,
            status_lock: Mutex::new(()),
        })
    }

    pub fn field_managers(&self) -> &FieldManagers {
        &self.managers
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn cached(&self) -> Result<Arc<Olm>> {
        self.store
            .get(&ObjectRef::new(OLM_SINGLETON_NAME))
            .ok_or_else(|| {
                Error::ConfigError(format!("OLM {OLM_SINGLETON_NAME} not found in cache"))
            })
    }

    pub fn spec(&self) -> Result<OperatorSpec> {
        Ok(self.cached()?.spec.operator.clone())
    }

    pub fn status(&self) -> Result<OperatorStatus> {
        Ok(self
            .cached()?
            .status
            .as_ref()
            .map(|s| s.operator.clone())
            .unwrap_or_default())
    }

    pub fn resource_version(&self) -> Result<String> {
        Ok(self.cached()?.resource_version().unwrap_or_default())
    }

    pub fn management_state(&self) -> Result<ManagementState> {
        Ok(self.spec()?.management_state)
    }

    pub fn finalizers(&self) -> Result<Vec<String>> {
        Ok(self.cached()?.finalizers().to_vec())
    }

    /// Whether the singleton carries a deletion timestamp
    pub fn is_deleting(&self) -> Result<bool> {
        Ok(self.cached()?.metadata.deletion_timestamp.is_some())
    }

    /// The state removable controllers act on, see [`effective_state`]
    pub fn effective_management_state(&self) -> Result<ManagementState> {
        let olm = self.cached()?;
        Ok(effective_state(
            olm.spec.operator.management_state,
            olm.metadata.deletion_timestamp.is_some(),
        ))
    }

    /// Replace the spec through the spec field manager
    pub async fn apply_spec(&self, spec: &OperatorSpec) -> Result<()> {
        self.api
            .patch(
                OLM_SINGLETON_NAME,
                &PatchParams::apply(self.managers.spec()).force(),
                &Patch::Apply(spec_patch(spec)),
            )
            .await?;
        debug!(manager = self.managers.spec(), "Applied OLM spec");
        Ok(())
    }

    /// Read the live status, let `mutate` change it and apply the result when it
    /// differs. Returns whether a write happened.
    pub async fn update_status<F>(&self, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut OperatorStatus, &dyn Clock) -> Result<()>,
    {
        let _guard = self.status_lock.lock().await;

        let live = self.api.get_status(OLM_SINGLETON_NAME).await?;
        let current = live.status.map(|s| s.operator).unwrap_or_default();
        let mut next = current.clone();
        mutate(&mut next, self.clock.as_ref())?;
        next.conditions.sort_by(|a, b| a.type_.cmp(&b.type_));

        if next == current {
            return Ok(false);
        }
        self.api
            .patch_status(
                OLM_SINGLETON_NAME,
                &PatchParams::apply(self.managers.status()).force(),
                &Patch::Apply(status_patch(&next)),
            )
            .await?;
        debug!(manager = self.managers.status(), "Applied OLM status");
        Ok(true)
    }

    /// Merge conditions into the status under the transition-time policy
    pub async fn update_conditions(&self, updates: Vec<Condition>) -> Result<bool> {
        self.update_status(move |status, clock| {
            status.conditions = apply_conditions(&status.conditions, &updates, clock)?;
            Ok(())
        })
        .await
    }

    pub async fn ensure_finalizer(&self, token: &str) -> Result<bool> {
        let live = self.api.get(OLM_SINGLETON_NAME).await?;
        match owned_finalizers(live.finalizers(), token, true) {
            Some(owned) => {
                self.apply_finalizers(&owned).await?;
                info!(finalizer = token, "Added finalizer to OLM {}", OLM_SINGLETON_NAME);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn remove_finalizer(&self, token: &str) -> Result<bool> {
        let live = self.api.get(OLM_SINGLETON_NAME).await?;
        match owned_finalizers(live.finalizers(), token, false) {
            Some(owned) => {
                self.apply_finalizers(&owned).await?;
                info!(finalizer = token, "Removed finalizer from OLM {}", OLM_SINGLETON_NAME);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn apply_finalizers(&self, finalizers: &[String]) -> Result<()> {
        self.api
            .patch(
                OLM_SINGLETON_NAME,
                &PatchParams::apply(self.managers.finalizer()).force(),
                &Patch::Apply(finalizers_patch(finalizers)),
            )
            .await?;
        Ok(())
    }
}
