//! Controllers that install and maintain the OLM sub-components
//!
//! A rendered manifest directory is turned into a set of [`Controller`] values by the
//! [`builder`]. The [`scheduler`] runs every controller as its own worker, waking it
//! when one of its informers changes or the resync period elapses.

use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::crd::ManagementState;
use conditions::{find_condition, CONDITION_TYPE_REMOVED};
use crate::environment::OperatorEnvironment;
use crate::error::{Error, Result};
use crate::featuregates::FeatureGateMapper;

pub mod builder;
pub mod cluster_status;
pub mod conditions;
pub mod deployment;
pub mod dynamic;
pub mod hooks;
pub mod incompatible;
#[cfg(test)]
mod incompatible_test;
pub mod informers;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod observers;
pub mod operator_client;
pub mod resourceapply;
#[cfg(test)]
mod resourceapply_test;
pub mod restmapper;
pub mod runner;
pub mod scheduler;
#[cfg(test)]
mod scheduler_test;
pub mod static_resources;
pub mod upgradeable;
pub mod version;

pub use builder::{ControllerBuilder, ControllerSet};
pub use informers::{ClusterInformers, InformerKind, ManagedInformers};
pub use observers::{ClusterSnapshot, ConfigObserver, TlsProfile};
pub use operator_client::{OperatorClient, CLEANUP_FINALIZER, FIELD_MANAGER};
pub use runner::{run, RunConfig};
pub use scheduler::{ConditionSink, Scheduler};

/// A unit of reconciliation driven by the scheduler
#[async_trait]
pub trait Controller: Send + Sync {
    /// Unique name, also the prefix of the controller's conditions
    fn name(&self) -> &str;

    /// Informers whose changes trigger a sync
    fn watches(&self) -> &[InformerKind];

    /// Whether the controller deletes its operands when the singleton is removed.
    /// The cleanup finalizer waits for every such controller's `Removed` marker.
    fn removable(&self) -> bool {
        false
    }

    /// Converge the cluster towards the desired state once
    async fn sync(&self, token: &CancellationToken) -> Result<()>;
}

/// Collaborators shared by the controllers of one set
#[derive(Clone)]
pub struct ControllerContext {
    pub client: Client,
    pub operator: Arc<OperatorClient>,
    pub observer: ConfigObserver,
    pub cluster: ClusterInformers,
    pub managed: ManagedInformers,
    pub environment: Arc<OperatorEnvironment>,
    pub mapper: Arc<FeatureGateMapper>,
}

/// What a controller should do for the current management state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagementAction {
    Enforce,
    Remove,
    Skip,
}

impl ManagementAction {
    pub fn for_state(state: ManagementState, removable: bool) -> Self {
        match state {
            ManagementState::Managed | ManagementState::Force => ManagementAction::Enforce,
            ManagementState::Unmanaged => ManagementAction::Skip,
            ManagementState::Removed if removable => ManagementAction::Remove,
            ManagementState::Removed => ManagementAction::Enforce,
        }
    }
}

/// Abort a sync between cluster API calls once the scheduler is shutting down
pub fn ensure_active(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Drop a stale `<controller>Removed` marker once the controller enforces again
pub async fn clear_removed(operator: &OperatorClient, controller: &str) -> Result<()> {
    let type_ = format!("{controller}{CONDITION_TYPE_REMOVED}");
    if find_condition(&operator.status()?.conditions, &type_).is_none() {
        return Ok(());
    }
    operator
        .update_status(|status, _| {
            status.conditions.retain(|c| c.type_ != type_);
            Ok(())
        })
        .await?;
    Ok(())
}

/// `TitleCase` of a dash, dot or underscore separated name, separators removed
pub fn title_case(name: &str) -> String {
    name.split(['-', '.', '_', ':'])
        .filter(|s| !s.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_management_action() {
        use ManagementState::*;
        assert_eq!(ManagementAction::for_state(Managed, true), ManagementAction::Enforce);
        assert_eq!(ManagementAction::for_state(Force, false), ManagementAction::Enforce);
        assert_eq!(ManagementAction::for_state(Unmanaged, true), ManagementAction::Skip);
        assert_eq!(ManagementAction::for_state(Removed, true), ManagementAction::Remove);
        assert_eq!(ManagementAction::for_state(Removed, false), ManagementAction::Enforce);
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("operator-controller"), "OperatorController");
        assert_eq!(title_case("catalogd-controller-manager"), "CatalogdControllerManager");
        assert_eq!(title_case("openshift-certified-operators"), "OpenshiftCertifiedOperators");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn test_ensure_active() {
        let token = CancellationToken::new();
        assert!(ensure_active(&token).is_ok());
        token.cancel();
        assert!(matches!(ensure_active(&token), Err(Error::Cancelled)));
    }
}
