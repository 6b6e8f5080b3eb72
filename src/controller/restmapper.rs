//! Resolve manifest kinds to API resources
//!
//! Kinds shipped by the chart are answered from a fixed table. Anything else goes to
//! API discovery once and is cached for the lifetime of the mapper.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use kube::{
    api::{Api, DynamicObject},
    core::{ApiResource, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use tracing::debug;

use crate::error::{Error, Result};

/// Where and how a kind is served
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestMapping {
    pub resource: ApiResource,
    pub namespaced: bool,
}

impl RestMapping {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            resource: ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk(group, version, kind),
                plural,
            ),
            namespaced,
        }
    }

    /// Dynamic API for this resource, scoped to `namespace` when namespaced
    pub fn api(&self, client: &Client, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.namespaced => Api::namespaced_with(client.clone(), ns, &self.resource),
            _ => Api::all_with(client.clone(), &self.resource),
        }
    }
}

/// Split an `apiVersion` into group and version
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[async_trait]
pub trait RestMapper: Send + Sync {
    async fn mapping(&self, api_version: &str, kind: &str) -> Result<RestMapping>;
}

/// Kinds the rendered chart is known to contain
pub fn known_mappings() -> Vec<RestMapping> {
    vec![
        RestMapping::new("", "v1", "Namespace", "namespaces", false),
        RestMapping::new("", "v1", "ServiceAccount", "serviceaccounts", true),
        RestMapping::new("", "v1", "Service", "services", true),
        RestMapping::new("", "v1", "ConfigMap", "configmaps", true),
        RestMapping::new("", "v1", "Secret", "secrets", true),
        RestMapping::new("apps", "v1", "Deployment", "deployments", true),
        RestMapping::new("rbac.authorization.k8s.io", "v1", "Role", "roles", true),
        RestMapping::new("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings", true),
        RestMapping::new("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
        RestMapping::new(
            "rbac.authorization.k8s.io",
            "v1",
            "ClusterRoleBinding",
            "clusterrolebindings",
            false,
        ),
        RestMapping::new(
            "apiextensions.k8s.io",
            "v1",
            "CustomResourceDefinition",
            "customresourcedefinitions",
            false,
        ),
        RestMapping::new(
            "admissionregistration.k8s.io",
            "v1",
            "ValidatingWebhookConfiguration",
            "validatingwebhookconfigurations",
            false,
        ),
        RestMapping::new(
            "admissionregistration.k8s.io",
            "v1",
            "MutatingWebhookConfiguration",
            "mutatingwebhookconfigurations",
            false,
        ),
        RestMapping::new("networking.k8s.io", "v1", "NetworkPolicy", "networkpolicies", true),
        RestMapping::new(
            "olm.operatorframework.io",
            "v1",
            "ClusterCatalog",
            "clustercatalogs",
            false,
        ),
    ]
}

/// Table-backed mapper; unknown kinds are an error
#[derive(Clone, Debug, Default)]
pub struct StaticRestMapper {
    table: HashMap<(String, String), RestMapping>,
}

impl StaticRestMapper {
    pub fn new(mappings: Vec<RestMapping>) -> Self {
        let table = mappings
            .into_iter()
            .map(|m| ((m.resource.api_version.clone(), m.resource.kind.clone()), m))
            .collect();
        Self { table }
    }

    pub fn known() -> Self {
        Self::new(known_mappings())
    }

    pub fn lookup(&self, api_version: &str, kind: &str) -> Option<RestMapping> {
        self.table
            .get(&(api_version.to_string(), kind.to_string()))
            .cloned()
    }
}

#[async_trait]
impl RestMapper for StaticRestMapper {
    async fn mapping(&self, api_version: &str, kind: &str) -> Result<RestMapping> {
        self.lookup(api_version, kind).ok_or_else(|| {
            Error::ConfigError(format!("no mapping for {api_version} {kind}"))
        })
    }
}

/// Known table first, then API discovery with a cache
pub struct DiscoveryRestMapper {
    client: Client,
    known: StaticRestMapper,
    discovered: RwLock<HashMap<(String, String), RestMapping>>,
}

impl DiscoveryRestMapper {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            known: StaticRestMapper::known(),
            discovered: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &(String, String)) -> Option<RestMapping> {
        self.discovered
            .read()
            .ok()
            .and_then(|cache| cache.get(key).cloned())
    }
}

#[async_trait]
impl RestMapper for DiscoveryRestMapper {
    async fn mapping(&self, api_version: &str, kind: &str) -> Result<RestMapping> {
        if let Some(mapping) = self.known.lookup(api_version, kind) {
            return Ok(mapping);
        }
        let key = (api_version.to_string(), kind.to_string());
        if let Some(mapping) = self.cached(&key) {
            return Ok(mapping);
        }

        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, caps) = discovery::pinned_kind(&self.client, &gvk).await?;
        let mapping = RestMapping {
            resource,
            namespaced: caps.scope == Scope::Namespaced,
        };
        debug!(api_version, kind, plural = %mapping.resource.plural, "Discovered mapping");

        if let Ok(mut cache) = self.discovered.write() {
            cache.insert(key, mapping.clone());
        }
        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
    }

    #[tokio::test]
    async fn test_static_mapper() {
        let mapper = StaticRestMapper::known();
        let deployment = mapper.mapping("apps/v1", "Deployment").await.unwrap();
        assert_eq!(deployment.resource.plural, "deployments");
        assert_eq!(deployment.resource.group, "apps");
        assert!(deployment.namespaced);

        let role = mapper.mapping("rbac.authorization.k8s.io/v1", "ClusterRole").await.unwrap();
        assert!(!role.namespaced);

        assert!(mapper.mapping("example.com/v1", "Widget").await.is_err());
    }
}
