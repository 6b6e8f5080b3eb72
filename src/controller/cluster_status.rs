//! Cluster operator status aggregation
//!
//! Rolls the per-controller conditions of the `OLM` singleton up into the four
//! top-level conditions of the `olm` ClusterOperator, together with the operand
//! version and the related object inventory.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::ObjectRef;
use kube::Resource;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::conditions::{
    apply_conditions, removal_complete, Clock, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
    CONDITION_TYPE_AVAILABLE, CONDITION_TYPE_DEGRADED, CONDITION_TYPE_PROGRESSING,
    CONDITION_TYPE_UPGRADEABLE, REASON_AS_EXPECTED,
};
use super::informers::{InformerKind, CLUSTER_OPERATOR_NAME};
use super::operator_client::{CLEANUP_FINALIZER, FIELD_MANAGER};
use super::{ensure_active, Controller, ControllerContext};
use crate::crd::{
    ClusterOperator, ClusterOperatorStatus, Condition, ManagementState, Olm, OperandVersion,
    RelatedObject, OLM_SINGLETON_NAME,
};
use crate::error::Result;

/// Operand name under which the release version is reported
pub const OPERATOR_VERSION_NAME: &str = "operator";

const REASON_MULTIPLE: &str = "MultipleConditionsMatching";
const REASON_NEW_VERSION: &str = "NewVersionAvailable";

const WATCHES: &[InformerKind] = &[InformerKind::Olm, InformerKind::ClusterOperator];

/// Related object entry for the singleton itself
pub fn singleton_related_object() -> RelatedObject {
    RelatedObject {
        group: Olm::group(&()).to_string(),
        resource: Olm::plural(&()).to_string(),
        namespace: String::new(),
        name: OLM_SINGLETON_NAME.to_string(),
    }
}

/// Union of every condition whose type ends with `suffix` and whose status is `bad`.
///
/// The result is `bad` when at least one matches, otherwise the opposite status.
fn union(conditions: &[Condition], suffix: &str, bad: &str) -> Condition {
    let good = if bad == CONDITION_STATUS_TRUE {
        CONDITION_STATUS_FALSE
    } else {
        CONDITION_STATUS_TRUE
    };
    let mut matching: Vec<&Condition> = conditions
        .iter()
        .filter(|c| c.type_.ends_with(suffix) && c.type_ != suffix && c.status == bad)
        .collect();
    matching.sort_by(|a, b| a.type_.cmp(&b.type_));

    match matching.as_slice() {
        [] => Condition::new(suffix, good, REASON_AS_EXPECTED, ""),
        [only] => Condition::new(
            suffix,
            bad,
            &format!("{}_{}", only.type_, only.reason),
            &format!("{}: {}", only.type_, only.message),
        ),
        many => {
            let message: Vec<String> = many
                .iter()
                .map(|c| format!("{}: {}", c.type_, c.message))
                .collect();
            Condition::new(suffix, bad, REASON_MULTIPLE, &message.join("\n"))
        }
    }
}

/// Top-level Degraded, Progressing, Available and Upgradeable
pub fn roll_up(conditions: &[Condition]) -> Vec<Condition> {
    vec![
        union(conditions, CONDITION_TYPE_AVAILABLE, CONDITION_STATUS_FALSE),
        union(conditions, CONDITION_TYPE_DEGRADED, CONDITION_STATUS_TRUE),
        union(conditions, CONDITION_TYPE_PROGRESSING, CONDITION_STATUS_TRUE),
        union(conditions, CONDITION_TYPE_UPGRADEABLE, CONDITION_STATUS_FALSE),
    ]
}

fn reported_version(status: &ClusterOperatorStatus) -> Option<&str> {
    status
        .versions
        .iter()
        .find(|v| v.name == OPERATOR_VERSION_NAME)
        .map(|v| v.version.as_str())
}

/// Compose the ClusterOperator status.
///
/// The release version is reported once the components are available and settled
/// (or when nothing was reported yet). Until then the previous version stays and
/// `Progressing` is True. An unknown release version never clears a reported one.
pub fn compose_status(
    conditions: &[Condition],
    related_objects: &[RelatedObject],
    release_version: &str,
    live: &ClusterOperatorStatus,
    clock: &dyn Clock,
) -> Result<ClusterOperatorStatus> {
    let mut rolled = roll_up(conditions);
    let settled = rolled.iter().all(|c| match c.type_.as_str() {
        CONDITION_TYPE_AVAILABLE => c.status == CONDITION_STATUS_TRUE,
        CONDITION_TYPE_PROGRESSING => c.status == CONDITION_STATUS_FALSE,
        _ => true,
    });

    let previous = reported_version(live);
    let version = match previous {
        Some(previous) if !settled || release_version.is_empty() => previous.to_string(),
        _ => release_version.to_string(),
    };

    if !release_version.is_empty() && version != release_version {
        if let Some(progressing) = rolled
            .iter_mut()
            .find(|c| c.type_ == CONDITION_TYPE_PROGRESSING)
        {
            if progressing.status != CONDITION_STATUS_TRUE {
                *progressing = Condition::new(
                    CONDITION_TYPE_PROGRESSING,
                    CONDITION_STATUS_TRUE,
                    REASON_NEW_VERSION,
                    &format!("Moving to version {release_version}"),
                );
            }
        }
    }

    let mut related: Vec<RelatedObject> = related_objects.to_vec();
    related.push(singleton_related_object());
    related.sort();
    related.dedup();

    let versions = if version.is_empty() {
        Vec::new()
    } else {
        vec![OperandVersion {
            name: OPERATOR_VERSION_NAME.to_string(),
            version,
        }]
    };

    Ok(ClusterOperatorStatus {
        conditions: apply_conditions(&live.conditions, &rolled, clock)?,
        versions,
        related_objects: related,
    })
}

/// What to do with the cleanup finalizer on this pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerAction {
    Ensure,
    Hold,
    Release,
}

/// Decide the cleanup finalizer from the management state, a pending deletion and
/// whether every removable controller has reported its operands gone.
///
/// The finalizer is only released after removal finished. An `Unmanaged` singleton
/// that is being deleted is let go right away since nothing will clean up.
pub fn finalizer_action(
    state: ManagementState,
    deleting: bool,
    removal_complete: bool,
) -> FinalizerAction {
    match state {
        ManagementState::Unmanaged if deleting => FinalizerAction::Release,
        ManagementState::Unmanaged => FinalizerAction::Hold,
        _ if deleting || state == ManagementState::Removed => {
            if removal_complete {
                FinalizerAction::Release
            } else {
                FinalizerAction::Hold
            }
        }
        _ => FinalizerAction::Ensure,
    }
}

pub struct ClusterStatusController {
    related_objects: Vec<RelatedObject>,
    removable: Vec<String>,
    ctx: ControllerContext,
}

impl ClusterStatusController {
    /// `removable` names the controllers whose removal gates the cleanup finalizer
    pub fn new(
        related_objects: Vec<RelatedObject>,
        removable: Vec<String>,
        ctx: ControllerContext,
    ) -> Self {
        Self {
            related_objects,
            removable,
            ctx,
        }
    }

    async fn sync_finalizer(&self) -> Result<()> {
        let state = self.ctx.operator.management_state()?;
        let deleting = self.ctx.operator.is_deleting()?;
        let complete = removal_complete(&self.ctx.operator.status()?.conditions, &self.removable);
        match finalizer_action(state, deleting, complete) {
            FinalizerAction::Ensure => {
                self.ctx.operator.ensure_finalizer(CLEANUP_FINALIZER).await?;
            }
            FinalizerAction::Release => {
                self.ctx.operator.remove_finalizer(CLEANUP_FINALIZER).await?;
            }
            FinalizerAction::Hold => {
                debug!(?state, deleting, "Holding cleanup finalizer");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Controller for ClusterStatusController {
    fn name(&self) -> &str {
        "ClusterOperatorStatus"
    }

    fn watches(&self) -> &[InformerKind] {
        WATCHES
    }

    #[instrument(skip(self, token))]
    async fn sync(&self, token: &CancellationToken) -> Result<()> {
        self.sync_finalizer().await?;
        ensure_active(token)?;

        let status = self.ctx.operator.status()?;
        let live = self
            .ctx
            .cluster
            .cluster_operator
            .get(&ObjectRef::<ClusterOperator>::new(CLUSTER_OPERATOR_NAME))
            .and_then(|co| co.status.clone())
            .unwrap_or_default();

        let next = compose_status(
            &status.conditions,
            &self.related_objects,
            &self.ctx.environment.release_version,
            &live,
            self.ctx.operator.clock(),
        )?;
        if next == live {
            debug!("ClusterOperator status unchanged");
            return Ok(());
        }

        let patch = json!({
            "apiVersion": ClusterOperator::api_version(&()),
            "kind": ClusterOperator::kind(&()),
            "metadata": { "name": CLUSTER_OPERATOR_NAME },
            "status": next,
        });
        Api::<ClusterOperator>::all(self.ctx.client.clone())
            .patch_status(
                CLUSTER_OPERATOR_NAME,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await?;
        info!(
            name = CLUSTER_OPERATOR_NAME,
            related = next.related_objects.len(),
            "Updated ClusterOperator status"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::conditions::FixedClock;
    use chrono::{TimeZone, Utc};

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    fn condition(type_: &str, status: &str) -> Condition {
        Condition::new(type_, status, "Reason", "message")
    }

    fn find<'a>(conditions: &'a [Condition], type_: &str) -> &'a Condition {
        conditions.iter().find(|c| c.type_ == type_).unwrap()
    }

    fn healthy() -> Vec<Condition> {
        vec![
            condition("CatalogdDeploymentCatalogdControllerManagerAvailable", "True"),
            condition("CatalogdDeploymentCatalogdControllerManagerProgressing", "False"),
            condition("CatalogdStaticResourcesDegraded", "False"),
            condition("CatalogdUpgradeable", "True"),
            condition("InstalledOLMOperatorsUpgradeable", "True"),
        ]
    }

    #[test]
    fn test_healthy_roll_up() {
        let rolled = roll_up(&healthy());
        assert_eq!(find(&rolled, "Available").status, CONDITION_STATUS_TRUE);
        assert_eq!(find(&rolled, "Degraded").status, CONDITION_STATUS_FALSE);
        assert_eq!(find(&rolled, "Progressing").status, CONDITION_STATUS_FALSE);
        assert_eq!(find(&rolled, "Upgradeable").status, CONDITION_STATUS_TRUE);
    }

    #[test]
    fn test_single_degraded_controller_names_itself() {
        let mut conditions = healthy();
        conditions.push(Condition::new(
            "OperatorControllerStaticResourcesDegraded",
            "True",
            "SyncError",
            "boom",
        ));
        let degraded = find(&roll_up(&conditions), "Degraded").clone();
        assert_eq!(degraded.status, CONDITION_STATUS_TRUE);
        assert_eq!(degraded.reason, "OperatorControllerStaticResourcesDegraded_SyncError");
        assert_eq!(degraded.message, "OperatorControllerStaticResourcesDegraded: boom");
    }

    #[test]
    fn test_incompatible_operators_block_upgrade() {
        let mut conditions = healthy();
        conditions.retain(|c| c.type_ != "InstalledOLMOperatorsUpgradeable");
        conditions.push(condition("InstalledOLMOperatorsUpgradeable", "False"));
        conditions.push(condition("OperatorControllerUpgradeable", "False"));
        let upgradeable = find(&roll_up(&conditions), "Upgradeable").clone();
        assert_eq!(upgradeable.status, CONDITION_STATUS_FALSE);
        assert_eq!(upgradeable.reason, REASON_MULTIPLE);
        assert!(upgradeable.message.starts_with("InstalledOLMOperatorsUpgradeable"));
    }

    #[test]
    fn test_new_release_is_progressing_until_settled() {
        let live = ClusterOperatorStatus {
            versions: vec![OperandVersion {
                name: OPERATOR_VERSION_NAME.to_string(),
                version: "4.17.0".to_string(),
            }],
            ..Default::default()
        };
        let mut conditions = healthy();
        conditions[0].status = CONDITION_STATUS_FALSE.to_string();

        let status = compose_status(&conditions, &[], "4.18.0", &live, &clock()).unwrap();
        assert_eq!(status.versions[0].version, "4.17.0");
        let progressing = find(&status.conditions, "Progressing");
        assert_eq!(progressing.status, CONDITION_STATUS_TRUE);
        assert_eq!(progressing.reason, REASON_NEW_VERSION);

        let status = compose_status(&healthy(), &[], "4.18.0", &live, &clock()).unwrap();
        assert_eq!(status.versions[0].version, "4.18.0");
        assert_eq!(find(&status.conditions, "Progressing").status, CONDITION_STATUS_FALSE);
    }

    #[test]
    fn test_unknown_release_keeps_reported_version() {
        let live = ClusterOperatorStatus {
            versions: vec![OperandVersion {
                name: OPERATOR_VERSION_NAME.to_string(),
                version: "4.17.0".to_string(),
            }],
            ..Default::default()
        };
        let status = compose_status(&healthy(), &[], "", &live, &clock()).unwrap();
        assert_eq!(status.versions.len(), 1);
        assert_eq!(status.versions[0].version, "4.17.0");
        assert_eq!(find(&status.conditions, "Progressing").status, CONDITION_STATUS_FALSE);

        let fresh =
            compose_status(&healthy(), &[], "", &ClusterOperatorStatus::default(), &clock())
                .unwrap();
        assert!(fresh.versions.is_empty());
    }

    #[test]
    fn test_finalizer_kept_while_managed() {
        use ManagementState::*;
        assert_eq!(finalizer_action(Managed, false, false), FinalizerAction::Ensure);
        assert_eq!(finalizer_action(Force, false, true), FinalizerAction::Ensure);
        assert_eq!(finalizer_action(Unmanaged, false, false), FinalizerAction::Hold);
    }

    #[test]
    fn test_finalizer_released_only_after_removal() {
        use ManagementState::*;
        assert_eq!(finalizer_action(Removed, false, false), FinalizerAction::Hold);
        assert_eq!(finalizer_action(Removed, false, true), FinalizerAction::Release);
    }

    #[test]
    fn test_deletion_waits_for_removal() {
        use ManagementState::*;
        assert_eq!(finalizer_action(Managed, true, false), FinalizerAction::Hold);
        assert_eq!(finalizer_action(Managed, true, true), FinalizerAction::Release);
        assert_eq!(finalizer_action(Force, true, false), FinalizerAction::Hold);
        assert_eq!(finalizer_action(Unmanaged, true, false), FinalizerAction::Release);
    }

    #[test]
    fn test_related_objects_include_singleton() {
        let deployment = RelatedObject {
            group: "apps".to_string(),
            resource: "deployments".to_string(),
            namespace: "openshift-catalogd".to_string(),
            name: "catalogd-controller-manager".to_string(),
        };
        let status = compose_status(
            &healthy(),
            &[deployment.clone(), deployment.clone()],
            "4.18.0",
            &ClusterOperatorStatus::default(),
            &clock(),
        )
        .unwrap();
        assert_eq!(status.related_objects.len(), 2);
        assert!(status.related_objects.contains(&deployment));
        assert!(status.related_objects.contains(&singleton_related_object()));
        assert_eq!(status.related_objects.iter().find(|r| r.resource == "olms").unwrap().group, "operator.openshift.io");
    }
}
