//! The OLM v1 sub-components rendered and managed by this operator

use std::fmt;

use crate::helm::values::{
    CATALOGD_FEATURES_DISABLED, CATALOGD_FEATURES_ENABLED, CATALOGD_IMAGE_PATH,
    OPERATOR_CONTROLLER_FEATURES_DISABLED, OPERATOR_CONTROLLER_FEATURES_ENABLED,
    OPERATOR_CONTROLLER_IMAGE_PATH,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubComponent {
    Catalogd,
    OperatorController,
}

impl SubComponent {
    pub const ALL: [SubComponent; 2] = [SubComponent::Catalogd, SubComponent::OperatorController];

    /// Directory name under the rendered manifest root
    pub fn name(&self) -> &'static str {
        match self {
            SubComponent::Catalogd => "catalogd",
            SubComponent::OperatorController => "operator-controller",
        }
    }

    /// Prefix used for controller names and condition types
    pub fn condition_prefix(&self) -> &'static str {
        match self {
            SubComponent::Catalogd => "Catalogd",
            SubComponent::OperatorController => "OperatorController",
        }
    }

    /// Key of this sub-component under `options` in the chart values
    pub fn values_key(&self) -> &'static str {
        match self {
            SubComponent::Catalogd => "catalogd",
            SubComponent::OperatorController => "operatorController",
        }
    }

    pub fn enabled_values_path(&self) -> String {
        format!("options.{}.enabled", self.values_key())
    }

    pub fn features_enabled_path(&self) -> &'static str {
        match self {
            SubComponent::Catalogd => CATALOGD_FEATURES_ENABLED,
            SubComponent::OperatorController => OPERATOR_CONTROLLER_FEATURES_ENABLED,
        }
    }

    pub fn features_disabled_path(&self) -> &'static str {
        match self {
            SubComponent::Catalogd => CATALOGD_FEATURES_DISABLED,
            SubComponent::OperatorController => OPERATOR_CONTROLLER_FEATURES_DISABLED,
        }
    }

    pub fn image_values_path(&self) -> &'static str {
        match self {
            SubComponent::Catalogd => CATALOGD_IMAGE_PATH,
            SubComponent::OperatorController => OPERATOR_CONTROLLER_IMAGE_PATH,
        }
    }

    /// Environment variable carrying the operand image
    pub fn image_env(&self) -> &'static str {
        match self {
            SubComponent::Catalogd => "CATALOGD_IMAGE",
            SubComponent::OperatorController => "OPERATOR_CONTROLLER_IMAGE",
        }
    }

    pub fn from_name(name: &str) -> Option<SubComponent> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

impl fmt::Display for SubComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
