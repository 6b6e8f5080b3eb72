//! cluster-olm-operator: installs and maintains the OLM v1 sub-components
//!
//! The operator renders an embedded Helm chart for the catalog daemon and the
//! operator controller, turns the rendered manifests into controllers and keeps the
//! cluster converged on them, reporting status on the `OLM` singleton and the `olm`
//! ClusterOperator.

pub mod assets;
pub mod controller;
pub mod crd;
pub mod environment;
pub mod error;
pub mod featuregates;
pub mod helm;
pub mod leader;
pub mod subcomponent;
pub mod telemetry;

pub use crate::error::{Error, Result};
