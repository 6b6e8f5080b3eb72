//! Per sub-component upgradeability
//!
//! The sub-components themselves never block an upgrade, so while the operator is
//! Managed each of them reports `<Prefix>Upgradeable=True`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::conditions::{CONDITION_STATUS_TRUE, CONDITION_TYPE_UPGRADEABLE, REASON_AS_EXPECTED};
use super::informers::InformerKind;
use super::{Controller, ControllerContext};
use crate::crd::{Condition, ManagementState};
use crate::error::Result;
use crate::subcomponent::SubComponent;

const WATCHES: &[InformerKind] = &[InformerKind::Olm];

pub struct StaticUpgradeableController {
    prefixes: Vec<String>,
    ctx: ControllerContext,
}

impl StaticUpgradeableController {
    pub fn new(subcomponents: &[SubComponent], ctx: ControllerContext) -> Self {
        Self {
            prefixes: subcomponents
                .iter()
                .map(|s| s.condition_prefix().to_string())
                .collect(),
            ctx,
        }
    }
}

pub fn upgradeable_conditions(prefixes: &[String]) -> Vec<Condition> {
    prefixes
        .iter()
        .map(|prefix| {
            Condition::new(
                &format!("{prefix}{CONDITION_TYPE_UPGRADEABLE}"),
                CONDITION_STATUS_TRUE,
                REASON_AS_EXPECTED,
                "",
            )
        })
        .collect()
}

#[async_trait]
impl Controller for StaticUpgradeableController {
    fn name(&self) -> &str {
        "StaticUpgradeable"
    }

    fn watches(&self) -> &[InformerKind] {
        WATCHES
    }

    async fn sync(&self, _token: &CancellationToken) -> Result<()> {
        if self.ctx.operator.management_state()? != ManagementState::Managed {
            return Ok(());
        }
        self.ctx
            .operator
            .update_conditions(upgradeable_conditions(&self.prefixes))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subcomponent_is_upgradeable() {
        let prefixes: Vec<String> = SubComponent::ALL
            .iter()
            .map(|s| s.condition_prefix().to_string())
            .collect();
        let conditions = upgradeable_conditions(&prefixes);
        let types: Vec<&str> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["CatalogdUpgradeable", "OperatorControllerUpgradeable"]);
        assert!(conditions
            .iter()
            .all(|c| c.status == CONDITION_STATUS_TRUE && c.reason == REASON_AS_EXPECTED));
    }
}
