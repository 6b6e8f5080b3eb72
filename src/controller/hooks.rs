//! Mutation hooks for deployment manifests
//!
//! Manifest hooks rewrite the raw YAML before it is decoded. Deployment hooks then
//! edit the typed object. Both kinds are pure: the same input always yields the same
//! output, so a sync that re-reads its manifest never appends twice.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, EnvVar};

use tracing::trace;

use super::observers::{ClusterSnapshot, TlsProfile};
use crate::crd::LogLevel;
use crate::environment::{OperatorEnvironment, ProxyConfig};
use crate::error::{Error, Result};
use crate::featuregates::FeatureGateMapper;
use crate::subcomponent::SubComponent;

/// Container whose arguments carry TLS and feature gate flags
pub const MANAGER_CONTAINER: &str = "manager";

pub const LOG_VERBOSITY_PLACEHOLDER: &str = "${LOG_VERBOSITY}";

const FEATURE_GATES_FLAG: &str = "--feature-gates";
const TLS_PROFILE_FLAG: &str = "--tls-profile";
const TLS_CUSTOM_VERSION_FLAG: &str = "--tls-custom-version";
const TLS_CUSTOM_CIPHERS_FLAG: &str = "--tls-custom-ciphers";

/// Text substitutions over the raw manifest
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestHook {
    ReplaceImage { placeholder: String, value: String },
    Verbosity,
}

impl ManifestHook {
    pub fn apply(&self, raw: &str, log_level: LogLevel) -> String {
        match self {
            ManifestHook::ReplaceImage { placeholder, value } => raw.replace(placeholder, value),
            ManifestHook::Verbosity => {
                raw.replace(LOG_VERBOSITY_PLACEHOLDER, &log_level.verbosity().to_string())
            }
        }
    }
}

/// Image substitutions followed by the verbosity hook
pub fn manifest_hooks(environment: &OperatorEnvironment) -> Vec<ManifestHook> {
    let mut hooks: Vec<ManifestHook> = environment
        .image_substitutions()
        .into_iter()
        .map(|(placeholder, value)| ManifestHook::ReplaceImage { placeholder, value })
        .collect();
    hooks.push(ManifestHook::Verbosity);
    hooks
}

/// Run manifest hooks in order
pub fn apply_manifest_hooks(raw: &str, hooks: &[ManifestHook], log_level: LogLevel) -> String {
    hooks
        .iter()
        .fold(raw.to_string(), |acc, hook| hook.apply(&acc, log_level))
}

/// Edits of the decoded deployment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentHook {
    Proxy,
    TlsProfile,
    FeatureGates(SubComponent),
}

impl DeploymentHook {
    pub fn name(&self) -> &'static str {
        match self {
            DeploymentHook::Proxy => "proxy",
            DeploymentHook::TlsProfile => "tls-profile",
            DeploymentHook::FeatureGates(_) => "feature-gates",
        }
    }

    pub fn apply(
        &self,
        deployment: &mut Deployment,
        snapshot: &ClusterSnapshot,
        mapper: &FeatureGateMapper,
    ) -> Result<()> {
        match self {
            DeploymentHook::Proxy => set_proxy_env(deployment, &snapshot.proxy),
            DeploymentHook::TlsProfile => set_tls_args(deployment, &snapshot.tls_profile),
            DeploymentHook::FeatureGates(sub) => set_feature_gate_args(
                deployment,
                &mapper.enabled_upstream(&snapshot.feature_gates, *sub),
                snapshot.feature_gates.is_custom(),
            ),
        }
    }
}

/// Hooks for a deployment of `subcomponent`, in application order
pub fn deployment_hooks(subcomponent: SubComponent) -> Vec<DeploymentHook> {
    vec![
        DeploymentHook::Proxy,
        DeploymentHook::TlsProfile,
        DeploymentHook::FeatureGates(subcomponent),
    ]
}

pub fn apply_deployment_hooks(
    deployment: &mut Deployment,
    hooks: &[DeploymentHook],
    snapshot: &ClusterSnapshot,
    mapper: &FeatureGateMapper,
) -> Result<()> {
    for hook in hooks {
        hook.apply(deployment, snapshot, mapper)?;
        trace!(hook = hook.name(), "Applied deployment hook");
    }
    Ok(())
}

/// Add `HTTPS_PROXY`, `HTTP_PROXY` and `NO_PROXY` to every init and app container.
/// Empty values are skipped; a variable that is already set is an error.
pub fn set_proxy_env(deployment: &mut Deployment, proxy: &ProxyConfig) -> Result<()> {
    let vars: Vec<(&str, &str)> = [
        ("HTTPS_PROXY", proxy.https_proxy.as_str()),
        ("HTTP_PROXY", proxy.http_proxy.as_str()),
        ("NO_PROXY", proxy.no_proxy.as_str()),
    ]
    .into_iter()
    .filter(|(_, value)| !value.is_empty())
    .collect();
    if vars.is_empty() {
        return Ok(());
    }

    for container in all_containers(deployment) {
        let env = container.env.get_or_insert_with(Vec::new);
        for (name, value) in &vars {
            if env.iter().any(|e| e.name == *name) {
                return Err(Error::hook(
                    "proxy",
                    format!("container {} already sets {name}", container.name),
                ));
            }
            env.push(EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                value_from: None,
            });
        }
    }
    Ok(())
}

/// `VersionTLS12` to `TLSv1.2`
pub fn tls_version_arg(api_version: &str) -> Result<&'static str> {
    match api_version {
        "VersionTLS10" => Ok("TLSv1.0"),
        "VersionTLS11" => Ok("TLSv1.1"),
        "VersionTLS12" => Ok("TLSv1.2"),
        "VersionTLS13" => Ok("TLSv1.3"),
        other => Err(Error::hook(
            "tls-profile",
            format!("unsupported minimum TLS version {other:?}"),
        )),
    }
}

/// TLS flags for `profile`
pub fn tls_args(profile: &TlsProfile) -> Result<Vec<String>> {
    let args = match profile {
        TlsProfile::Old => vec![format!("{TLS_PROFILE_FLAG}=old")],
        TlsProfile::Intermediate => vec![format!("{TLS_PROFILE_FLAG}=intermediate")],
        TlsProfile::Modern => vec![format!("{TLS_PROFILE_FLAG}=modern")],
        TlsProfile::Custom {
            min_tls_version,
            ciphers,
        } => {
            if ciphers.is_empty() {
                return Err(Error::hook("tls-profile", "custom profile has no ciphers"));
            }
            vec![
                format!("{TLS_PROFILE_FLAG}=custom"),
                format!("{TLS_CUSTOM_VERSION_FLAG}={}", tls_version_arg(min_tls_version)?),
                format!("{TLS_CUSTOM_CIPHERS_FLAG}={}", ciphers.join(",")),
            ]
        }
    };
    Ok(args)
}

/// Replace the manager's TLS flags with those of `profile`
pub fn set_tls_args(deployment: &mut Deployment, profile: &TlsProfile) -> Result<()> {
    let desired = tls_args(profile)?;
    let manager = manager_container(deployment, "tls-profile")?;
    let args = manager.args.get_or_insert_with(Vec::new);
    args.retain(|arg| {
        ![TLS_PROFILE_FLAG, TLS_CUSTOM_VERSION_FLAG, TLS_CUSTOM_CIPHERS_FLAG]
            .iter()
            .any(|flag| is_flag(arg, flag))
    });
    args.extend(desired);
    Ok(())
}

/// Replace every `--feature-gates` argument of the manager with one combined flag.
///
/// `enabled` must be sorted. Existing gates that disagree with it are an error unless
/// the cluster runs a custom feature set.
pub fn set_feature_gate_args(
    deployment: &mut Deployment,
    enabled: &[String],
    tolerate_conflicts: bool,
) -> Result<()> {
    let manager = manager_container(deployment, "feature-gates")?;
    let args = manager.args.get_or_insert_with(Vec::new);

    if !tolerate_conflicts {
        let mut conflicts = Vec::new();
        for (name, value) in existing_feature_gates(args) {
            let wanted = enabled.contains(&name);
            let on = value.eq_ignore_ascii_case("true");
            if wanted != on {
                conflicts.push(format!("{name}={value}"));
            }
        }
        if !conflicts.is_empty() {
            return Err(Error::hook(
                "feature-gates",
                format!(
                    "manifest sets conflicting feature gates: {}",
                    conflicts.join(",")
                ),
            ));
        }
    }

    args.retain(|arg| !is_flag(arg, FEATURE_GATES_FLAG));
    if !enabled.is_empty() {
        let gates: Vec<String> = enabled.iter().map(|g| format!("{g}=true")).collect();
        args.push(format!("{FEATURE_GATES_FLAG}={}", gates.join(",")));
    }
    Ok(())
}

fn existing_feature_gates(args: &[String]) -> Vec<(String, String)> {
    args.iter()
        .filter_map(|arg| arg.strip_prefix(FEATURE_GATES_FLAG)?.strip_prefix('='))
        .flat_map(|list| list.split(','))
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
            None => (pair.trim().to_string(), "true".to_string()),
        })
        .collect()
}

fn is_flag(arg: &str, flag: &str) -> bool {
    arg == flag
        || arg
            .strip_prefix(flag)
            .is_some_and(|rest| rest.starts_with('='))
}

fn all_containers(deployment: &mut Deployment) -> Vec<&mut Container> {
    let Some(pod) = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
    else {
        return Vec::new();
    };
    let mut containers: Vec<&mut Container> = Vec::new();
    if let Some(init) = pod.init_containers.as_mut() {
        containers.extend(init.iter_mut());
    }
    containers.extend(pod.containers.iter_mut());
    containers
}

fn manager_container<'a>(deployment: &'a mut Deployment, hook: &str) -> Result<&'a mut Container> {
    let name = deployment.metadata.name.clone().unwrap_or_default();
    deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|pod| pod.containers.iter_mut().find(|c| c.name == MANAGER_CONTAINER))
        .ok_or_else(|| {
            Error::hook(
                hook,
                format!("deployment {name} has no {MANAGER_CONTAINER} container"),
            )
        })
}
