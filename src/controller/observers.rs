//! Observers for cluster-wide configuration
//!
//! Every read produces an owned snapshot from the informer caches, so a sync never
//! sees a half-updated view and nothing is shared mutably between controllers.

use kube::runtime::reflector::ObjectRef;
use tracing::debug;

use super::informers::ClusterInformers;
use crate::crd::{
    ApiServer, ClusterVersion, FeatureGate, Proxy, TlsProfileType, TlsSecurityProfile,
    CLUSTER_CONFIG_NAME, CLUSTER_VERSION_NAME,
};
use crate::environment::ProxyConfig;
use crate::error::{Error, Result};
use crate::featuregates::FeatureGateSnapshot;

/// Effective TLS profile for operand servers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TlsProfile {
    Old,
    #[default]
    Intermediate,
    Modern,
    Custom {
        /// API spelling, e.g. `VersionTLS12`
        min_tls_version: String,
        ciphers: Vec<String>,
    },
}

impl TlsProfile {
    /// Interpret the APIServer profile; an unset profile means Intermediate
    pub fn from_api(profile: Option<&TlsSecurityProfile>) -> Result<Self> {
        let Some(profile) = profile else {
            return Ok(TlsProfile::default());
        };
        match profile.type_ {
            None | Some(TlsProfileType::Intermediate) => Ok(TlsProfile::Intermediate),
            Some(TlsProfileType::Old) => Ok(TlsProfile::Old),
            Some(TlsProfileType::Modern) => Ok(TlsProfile::Modern),
            Some(TlsProfileType::Custom) => {
                let custom = profile.custom.as_ref().ok_or_else(|| {
                    Error::ConfigError("custom TLS profile has no custom settings".to_string())
                })?;
                if custom.min_tls_version.is_empty() {
                    return Err(Error::ConfigError(
                        "custom TLS profile has no minimum TLS version".to_string(),
                    ));
                }
                if custom.ciphers.is_empty() {
                    return Err(Error::ConfigError(
                        "custom TLS profile has no ciphers".to_string(),
                    ));
                }
                Ok(TlsProfile::Custom {
                    min_tls_version: custom.min_tls_version.clone(),
                    ciphers: custom.ciphers.clone(),
                })
            }
        }
    }
}

/// Everything a sync needs from the cluster configuration, taken at one moment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub proxy: ProxyConfig,
    pub tls_profile: TlsProfile,
    pub feature_gates: FeatureGateSnapshot,
    pub cluster_version: Option<String>,
}

/// Reads cluster configuration from the shared caches
#[derive(Clone)]
pub struct ConfigObserver {
    informers: ClusterInformers,
    release_version: String,
    fallback_proxy: ProxyConfig,
}

impl ConfigObserver {
    pub fn new(
        informers: ClusterInformers,
        release_version: impl Into<String>,
        fallback_proxy: ProxyConfig,
    ) -> Self {
        Self {
            informers,
            release_version: release_version.into(),
            fallback_proxy,
        }
    }

    /// Cluster proxy, or the process proxy settings when no Proxy object exists
    pub fn proxy(&self) -> ProxyConfig {
        let cached = self
            .informers
            .proxy
            .get(&ObjectRef::<Proxy>::new(CLUSTER_CONFIG_NAME));
        match cached {
            Some(proxy) => proxy_from_cluster(&proxy),
            None => {
                debug!("No cluster proxy, using process environment");
                self.fallback_proxy.clone()
            }
        }
    }

    pub fn tls_profile(&self) -> Result<TlsProfile> {
        let cached = self
            .informers
            .api_server
            .get(&ObjectRef::<ApiServer>::new(CLUSTER_CONFIG_NAME));
        TlsProfile::from_api(cached.as_ref().and_then(|a| a.spec.tls_security_profile.as_ref()))
    }

    pub fn feature_gates(&self) -> Result<FeatureGateSnapshot> {
        let cached = self
            .informers
            .feature_gate
            .get(&ObjectRef::<FeatureGate>::new(CLUSTER_CONFIG_NAME))
            .ok_or_else(|| Error::ConfigError("FeatureGate cluster not found".to_string()))?;
        feature_gates_for_version(&cached, &self.release_version)
    }

    pub fn cluster_version(&self) -> Option<String> {
        self.informers
            .cluster_version
            .get(&ObjectRef::<ClusterVersion>::new(CLUSTER_VERSION_NAME))
            .and_then(|cv| cv.current_version().map(str::to_string))
    }

    pub fn snapshot(&self) -> Result<ClusterSnapshot> {
        Ok(ClusterSnapshot {
            proxy: self.proxy(),
            tls_profile: self.tls_profile()?,
            feature_gates: self.feature_gates()?,
            cluster_version: self.cluster_version(),
        })
    }
}

/// Prefer the effective values the cluster computed in status over the spec
pub fn proxy_from_cluster(proxy: &Proxy) -> ProxyConfig {
    let status = proxy.status.as_ref();
    let pick = |from_status: Option<&Option<String>>, from_spec: &Option<String>| {
        from_status
            .and_then(|v| v.clone())
            .filter(|v| !v.is_empty())
            .or_else(|| from_spec.clone())
            .unwrap_or_default()
    };
    ProxyConfig {
        http_proxy: pick(status.map(|s| &s.http_proxy), &proxy.spec.http_proxy),
        https_proxy: pick(status.map(|s| &s.https_proxy), &proxy.spec.https_proxy),
        no_proxy: pick(status.map(|s| &s.no_proxy), &proxy.spec.no_proxy),
    }
}

/// Gates computed for `release_version`. Without a release version the first
/// reported set is used.
pub fn feature_gates_for_version(
    gate: &FeatureGate,
    release_version: &str,
) -> Result<FeatureGateSnapshot> {
    let details = gate.status.as_ref().map(|s| s.feature_gates.as_slice()).unwrap_or_default();
    let matching = if release_version.is_empty() {
        details.first()
    } else {
        details.iter().find(|d| d.version == release_version)
    };
    let details = matching.ok_or_else(|| {
        Error::ConfigError(format!(
            "feature gates for version {release_version:?} are not available yet"
        ))
    })?;

    Ok(FeatureGateSnapshot {
        feature_set: gate.spec.feature_set.clone(),
        enabled: details.enabled.iter().map(|g| g.name.clone()).collect(),
        disabled: details.disabled.iter().map(|g| g.name.clone()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::config::{
        CustomTlsProfile, FeatureGateAttributes, FeatureGateDetails, FeatureGateSpec,
        FeatureGateStatus, ProxySpec, ProxyStatus,
    };

    #[test]
    fn test_tls_profile_defaults_to_intermediate() {
        assert_eq!(TlsProfile::from_api(None).unwrap(), TlsProfile::Intermediate);
        let unset = TlsSecurityProfile::default();
        assert_eq!(TlsProfile::from_api(Some(&unset)).unwrap(), TlsProfile::Intermediate);
    }

    #[test]
    fn test_custom_tls_profile_requires_all_fields() {
        let mut profile = TlsSecurityProfile {
            type_: Some(TlsProfileType::Custom),
            custom: None,
        };
        assert!(TlsProfile::from_api(Some(&profile)).is_err());

        profile.custom = Some(CustomTlsProfile {
            ciphers: vec![],
            min_tls_version: "VersionTLS12".to_string(),
        });
        assert!(TlsProfile::from_api(Some(&profile)).is_err());

        profile.custom = Some(CustomTlsProfile {
            ciphers: vec!["a".to_string(), "b".to_string()],
            min_tls_version: "VersionTLS12".to_string(),
        });
        assert_eq!(
            TlsProfile::from_api(Some(&profile)).unwrap(),
            TlsProfile::Custom {
                min_tls_version: "VersionTLS12".to_string(),
                ciphers: vec!["a".to_string(), "b".to_string()],
            }
        );
    }

    #[test]
    fn test_proxy_prefers_status() {
        let mut proxy = Proxy::new(
            CLUSTER_CONFIG_NAME,
            ProxySpec {
                http_proxy: Some("spec-http".to_string()),
                https_proxy: Some("spec-https".to_string()),
                no_proxy: None,
            },
        );
        proxy.status = Some(ProxyStatus {
            http_proxy: Some("p1".to_string()),
            https_proxy: None,
            no_proxy: Some("x,y".to_string()),
        });
        assert_eq!(
            proxy_from_cluster(&proxy),
            ProxyConfig {
                http_proxy: "p1".to_string(),
                https_proxy: "spec-https".to_string(),
                no_proxy: "x,y".to_string(),
            }
        );
    }

    fn gate(versions: &[(&str, &[&str])]) -> FeatureGate {
        let mut gate = FeatureGate::new(
            CLUSTER_CONFIG_NAME,
            FeatureGateSpec {
                feature_set: "TechPreviewNoUpgrade".to_string(),
                custom_no_upgrade: None,
            },
        );
        gate.status = Some(FeatureGateStatus {
            feature_gates: versions
                .iter()
                .map(|(version, enabled)| FeatureGateDetails {
                    version: version.to_string(),
                    enabled: enabled
                        .iter()
                        .map(|n| FeatureGateAttributes { name: n.to_string() })
                        .collect(),
                    disabled: vec![],
                })
                .collect(),
        });
        gate
    }

    #[test]
    fn test_feature_gates_match_release_version() {
        let gate = gate(&[("4.17.0", &["Old"]), ("4.18.0", &["NewOLMPreflightPermissionChecks"])]);
        let snapshot = feature_gates_for_version(&gate, "4.18.0").unwrap();
        assert!(snapshot.is_enabled("NewOLMPreflightPermissionChecks"));
        assert!(!snapshot.is_enabled("Old"));
        assert!(snapshot.is_preview());

        assert!(feature_gates_for_version(&gate, "4.19.0").is_err());
        assert!(feature_gates_for_version(&gate, "").unwrap().is_enabled("Old"));
    }
}
