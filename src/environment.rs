//! Process environment captured once at startup
//!
//! Sync handlers never read environment variables; they receive this snapshot.

use crate::subcomponent::SubComponent;

pub const CATALOGD_IMAGE_ENV: &str = "CATALOGD_IMAGE";
pub const OPERATOR_CONTROLLER_IMAGE_ENV: &str = "OPERATOR_CONTROLLER_IMAGE";
pub const KUBE_RBAC_PROXY_IMAGE_ENV: &str = "KUBE_RBAC_PROXY_IMAGE";
pub const RELEASE_VERSION_ENV: &str = "RELEASE_VERSION";

/// Proxy settings, either observed on the cluster or taken from the environment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        self.http_proxy.is_empty() && self.https_proxy.is_empty() && self.no_proxy.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatorEnvironment {
    pub catalogd_image: Option<String>,
    pub operator_controller_image: Option<String>,
    pub kube_rbac_proxy_image: Option<String>,
    pub release_version: String,
    /// Used when the cluster Proxy object is absent
    pub fallback_proxy: ProxyConfig,
}

impl OperatorEnvironment {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let proxy_var = |upper: &str| {
            get(upper)
                .or_else(|| get(&upper.to_lowercase()))
                .unwrap_or_default()
        };
        Self {
            catalogd_image: get(CATALOGD_IMAGE_ENV),
            operator_controller_image: get(OPERATOR_CONTROLLER_IMAGE_ENV),
            kube_rbac_proxy_image: get(KUBE_RBAC_PROXY_IMAGE_ENV),
            release_version: get(RELEASE_VERSION_ENV).unwrap_or_default(),
            fallback_proxy: ProxyConfig {
                http_proxy: proxy_var("HTTP_PROXY"),
                https_proxy: proxy_var("HTTPS_PROXY"),
                no_proxy: proxy_var("NO_PROXY"),
            },
        }
    }

    pub fn image(&self, subcomponent: SubComponent) -> Option<&str> {
        match subcomponent {
            SubComponent::Catalogd => self.catalogd_image.as_deref(),
            SubComponent::OperatorController => self.operator_controller_image.as_deref(),
        }
    }

    /// `(placeholder, value)` pairs for every image that is configured
    pub fn image_substitutions(&self) -> Vec<(String, String)> {
        [
            (CATALOGD_IMAGE_ENV, &self.catalogd_image),
            (OPERATOR_CONTROLLER_IMAGE_ENV, &self.operator_controller_image),
            (KUBE_RBAC_PROXY_IMAGE_ENV, &self.kube_rbac_proxy_image),
        ]
        .into_iter()
        .filter_map(|(env, value)| value.as_ref().map(|v| (placeholder(env), v.clone())))
        .collect()
    }
}

/// `${NAME}` placeholder used in chart values and manifests
pub fn placeholder(name: &str) -> String {
    format!("${{{name}}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> OperatorEnvironment {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorEnvironment::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_images_and_placeholders() {
        let env = env(&[("CATALOGD_IMAGE", "img-a"), ("OPERATOR_CONTROLLER_IMAGE", "img-b")]);
        assert_eq!(env.image(SubComponent::Catalogd), Some("img-a"));
        assert_eq!(
            env.image_substitutions(),
            vec![
                ("${CATALOGD_IMAGE}".to_string(), "img-a".to_string()),
                ("${OPERATOR_CONTROLLER_IMAGE}".to_string(), "img-b".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_values_are_unset() {
        let env = env(&[("CATALOGD_IMAGE", ""), ("RELEASE_VERSION", "4.18.0")]);
        assert_eq!(env.catalogd_image, None);
        assert_eq!(env.release_version, "4.18.0");
    }

    #[test]
    fn test_lowercase_proxy_fallback() {
        let env = env(&[("https_proxy", "http://p"), ("NO_PROXY", ".svc")]);
        assert_eq!(env.fallback_proxy.https_proxy, "http://p");
        assert_eq!(env.fallback_proxy.no_proxy, ".svc");
        assert!(env.fallback_proxy.http_proxy.is_empty());
    }
}
