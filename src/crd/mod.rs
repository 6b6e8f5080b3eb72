//! Custom resources read and written by the cluster OLM operator
//!
//! None of these CRDs are owned by this crate; they are installed by the platform
//! or by operator-controller. The types only carry the fields the operator needs.

pub mod config;
pub mod extension;
mod olm;
pub mod types;

pub use config::{
    ApiServer, ClusterOperator, ClusterOperatorStatus, ClusterVersion, FeatureGate,
    OperandVersion, Proxy, TlsProfileType, TlsSecurityProfile, CLUSTER_CONFIG_NAME, CLUSTER_VERSION_NAME,
};
pub use extension::{ClusterExtension, ClusterExtensionRevision};
pub use olm::{Olm, OlmSpec, OlmStatus, OLM_SINGLETON_NAME};
pub use types::*;
