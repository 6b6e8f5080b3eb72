use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cluster_olm_operator::controller::{self, RunConfig};
use cluster_olm_operator::environment::OperatorEnvironment;
use cluster_olm_operator::leader::LeaderElection;
use cluster_olm_operator::telemetry;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the operator
    #[command(alias = "operator")]
    Start(StartArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Path to a kubeconfig; in-cluster configuration is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace the operator runs in
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "openshift-cluster-olm-operator")]
    namespace: String,

    /// Only run controllers while holding the leader lease
    #[arg(long, env = "LEADER_ELECT", default_value_t = true, action = clap::ArgAction::Set)]
    leader_elect: bool,

    /// Identity recorded in the leader lease, the host name when unset
    #[arg(long, env = "POD_NAME")]
    leader_elect_lock_identity: Option<String>,

    /// Namespace of the leader lease, `--namespace` when unset
    #[arg(long, env = "POD_NAMESPACE")]
    leader_elect_lock_namespace: Option<String>,

    /// Log verbosity (0-1 warn, 2-3 info, 4-5 debug, 6+ trace)
    #[arg(short = 'v', long = "v", env = "OPERATOR_VERBOSITY", default_value_t = 2)]
    verbosity: u8,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Directory holding the chart and values files
    #[arg(long, env = "ASSETS_DIR", default_value = "/assets")]
    assets_dir: PathBuf,

    /// Directory rendered manifests are written to
    #[arg(long, env = "MANIFESTS_DIR", default_value = "/var/run/cluster-olm-operator/manifests")]
    manifests_dir: PathBuf,

    /// Seconds between unconditional controller syncs
    #[arg(long, env = "RESYNC_INTERVAL", default_value_t = 600)]
    resync_interval: u64,

    /// `helm` executable used to template the chart
    #[arg(long, env = "HELM_BINARY", default_value = "helm")]
    helm_binary: String,

    /// Address of the metrics and health endpoint
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,
}

/// Accept `--flag_name` for `--flag-name`
fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| match arg.strip_prefix("--") {
            Some(rest) => {
                let (name, value) = match rest.split_once('=') {
                    Some((name, value)) => (name, Some(value)),
                    None => (rest, None),
                };
                let name = name.replace('_', "-");
                match value {
                    Some(value) => format!("--{name}={value}"),
                    None => format!("--{name}"),
                }
            }
            None => arg,
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse_from(normalize_args(std::env::args()));

    match args.command {
        Commands::Version => {
            println!("cluster-olm-operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Start(start_args) => {
            telemetry::init(start_args.verbosity, start_args.log_json)?;
            let result = run_operator(start_args).await;
            telemetry::shutdown();
            result
        }
    }
}

async fn client_for(kubeconfig: Option<&PathBuf>) -> anyhow::Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?
        }
        None => Config::infer().await.context("inferring cluster configuration")?,
    };
    Client::try_from(config).context("creating Kubernetes client")
}

fn shutdown_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Shutdown signal received");
        token.cancel();
    });
}

async fn run_operator(args: StartArgs) -> anyhow::Result<()> {
    info!("Starting cluster-olm-operator v{}", env!("CARGO_PKG_VERSION"));

    let client = client_for(args.kubeconfig.as_ref()).await?;
    info!("Connected to Kubernetes cluster");

    let token = CancellationToken::new();
    shutdown_on_signal(token.clone());

    #[cfg(feature = "metrics")]
    {
        let addr = args.metrics_bind_address;
        let metrics_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = controller::metrics::serve(addr, metrics_token).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let leadership_lost = Arc::new(AtomicBool::new(false));
    if args.leader_elect {
        let identity = args.leader_elect_lock_identity.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        let lease_namespace = args
            .leader_elect_lock_namespace
            .clone()
            .unwrap_or_else(|| args.namespace.clone());
        let election = LeaderElection::new(client.clone(), &lease_namespace, &identity);
        if !election.acquire(&token).await {
            return Ok(());
        }

        let lost = leadership_lost.clone();
        let election_token = token.clone();
        tokio::spawn(async move {
            if election.hold(&election_token).await {
                lost.store(true, Ordering::Relaxed);
                election_token.cancel();
            }
        });
    }

    let config = RunConfig {
        assets_dir: args.assets_dir,
        manifests_dir: args.manifests_dir,
        resync_interval: Duration::from_secs(args.resync_interval),
        helm_binary: args.helm_binary,
        ..RunConfig::default()
    };
    controller::run(client, config, OperatorEnvironment::from_env(), token)
        .await
        .context("running controllers")?;

    if leadership_lost.load(Ordering::Relaxed) {
        bail!("leadership lost");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_underscores_are_normalized() {
        let normalized = normalize_args(strings(&[
            "cluster-olm-operator",
            "start",
            "--leader_elect_lock_identity=pod_a",
            "--manifests_dir",
            "/tmp/some_dir",
            "-v",
            "4",
        ]));
        assert_eq!(
            normalized,
            strings(&[
                "cluster-olm-operator",
                "start",
                "--leader-elect-lock-identity=pod_a",
                "--manifests-dir",
                "/tmp/some_dir",
                "-v",
                "4",
            ])
        );
    }

    #[test]
    fn test_start_flags_parse() {
        let args = Args::parse_from(normalize_args(strings(&[
            "cluster-olm-operator",
            "operator",
            "--leader_elect=false",
            "--v=6",
            "--resync-interval=30",
        ])));
        let Commands::Start(start) = args.command else {
            panic!("expected start");
        };
        assert!(!start.leader_elect);
        assert_eq!(start.verbosity, 6);
        assert_eq!(start.resync_interval, 30);
    }
}
