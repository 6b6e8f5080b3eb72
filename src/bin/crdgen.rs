//! Print the CRDs the operator reads and writes, for clusters that lack them

use cluster_olm_operator::crd::{
    ApiServer, ClusterExtension, ClusterExtensionRevision, ClusterOperator, ClusterVersion,
    FeatureGate, Olm, Proxy,
};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        Olm::crd(),
        ClusterOperator::crd(),
        ClusterVersion::crd(),
        FeatureGate::crd(),
        Proxy::crd(),
        ApiServer::crd(),
        ClusterExtension::crd(),
        ClusterExtensionRevision::crd(),
    ];
    for crd in &crds {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
