//! Operator main loop
//!
//! Renders the manifests for the current feature gates, builds the controllers and
//! runs them until either the process shuts down or the mapped feature gates
//! change. A change re-renders and swaps the running set for a new one.
//!
//! A render or build failure never stops the process. It is reported as
//! `ManifestRendererDegraded=True`, retried with backoff, and the controllers of
//! the last good render keep running meanwhile.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::builder::{BuildPlan, ControllerBuilder};
use super::cluster_status::ClusterStatusController;
use super::conditions::{degraded_condition, not_degraded_condition, SystemClock};
use super::incompatible::IncompatibleOperatorsController;
use super::informers::{ClusterInformers, InformerKind, ManagedInformers};
use super::observers::ConfigObserver;
use super::operator_client::{OperatorClient, FIELD_MANAGER};
use super::restmapper::{DiscoveryRestMapper, RestMapper};
use super::scheduler::{calculate_backoff, Scheduler, DEFAULT_RESYNC_INTERVAL};
use super::upgradeable::StaticUpgradeableController;
use super::{Controller, ControllerContext};
use crate::assets::AssetStore;
use crate::crd::{Condition, RelatedObject};
use crate::environment::OperatorEnvironment;
use crate::error::{Error, Result};
use crate::featuregates::{FeatureGateMapper, FeatureGateSnapshot};
use crate::helm::{HelmTemplate, ManifestRenderer};
use crate::subcomponent::SubComponent;

/// Condition prefix for render and build failures
pub const RENDERER_CONDITION: &str = "ManifestRenderer";

const FEATURE_GATE_RETRY: Duration = Duration::from_secs(5);

/// Runtime settings of the operator loop
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Directory holding the chart and values files
    pub assets_dir: PathBuf,
    /// Directory the rendered manifests are written to
    pub manifests_dir: PathBuf,
    pub resync_interval: Duration,
    /// How long to wait for the shared caches before giving up
    pub cache_sync_timeout: Duration,
    /// `helm` executable used to template the chart
    pub helm_binary: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("/assets"),
            manifests_dir: PathBuf::from("/var/run/cluster-olm-operator/manifests"),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            cache_sync_timeout: Duration::from_secs(120),
            helm_binary: "helm".to_string(),
        }
    }
}

/// Render the manifests for `gates` into `manifests_dir` and plan controllers
/// from the result. The directory keeps its previous content when rendering fails.
pub async fn prepare(
    renderer: &ManifestRenderer,
    builder: &ControllerBuilder,
    gates: &FeatureGateSnapshot,
    environment: &OperatorEnvironment,
    manifests_dir: &Path,
) -> Result<BuildPlan> {
    let rendered = renderer.render(gates, environment, manifests_dir);
    #[cfg(feature = "metrics")]
    super::metrics::inc_render(rendered.is_ok());
    rendered?;
    builder.plan(manifests_dir).await
}

/// `ManifestRendererDegraded` for the outcome of [`prepare`]
pub fn render_condition(failure: Option<&Error>) -> Condition {
    match failure {
        Some(e) => degraded_condition(RENDERER_CONDITION, &e.to_string()),
        None => not_degraded_condition(RENDERER_CONDITION),
    }
}

/// Why the main loop goes around again
#[derive(Debug, PartialEq, Eq)]
enum Wake {
    GatesChanged,
    Retry,
    Stop,
}

/// One running controller set
struct Generation {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Generation {
    async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Scheduler task failed: {}", e);
        }
    }
}

/// Collaborators that outlive every generation
struct Shared {
    client: Client,
    operator: Arc<OperatorClient>,
    observer: ConfigObserver,
    cluster: ClusterInformers,
    environment: Arc<OperatorEnvironment>,
    mapper: Arc<FeatureGateMapper>,
}

impl Shared {
    fn context(&self, managed: ManagedInformers) -> ControllerContext {
        ControllerContext {
            client: self.client.clone(),
            operator: self.operator.clone(),
            observer: self.observer.clone(),
            cluster: self.cluster.clone(),
            managed,
            environment: self.environment.clone(),
            mapper: self.mapper.clone(),
        }
    }
}

/// Run the operator until `token` is cancelled
pub async fn run(
    client: Client,
    config: RunConfig,
    environment: OperatorEnvironment,
    token: CancellationToken,
) -> Result<()> {
    let cluster = ClusterInformers::start(&client, &token);
    cluster.wait_for_sync(config.cache_sync_timeout).await?;

    let environment = Arc::new(environment);
    let mapper = Arc::new(FeatureGateMapper::openshift()?);
    let observer = ConfigObserver::new(
        cluster.clone(),
        environment.release_version.clone(),
        environment.fallback_proxy.clone(),
    );
    let operator = Arc::new(OperatorClient::new(
        client.clone(),
        cluster.olm.clone(),
        FIELD_MANAGER,
        Arc::new(SystemClock),
    )?);
    let renderer = ManifestRenderer::new(
        Arc::new(AssetStore::from_dir(&config.assets_dir)?),
        Arc::new(HelmTemplate::new(config.helm_binary.clone())),
        mapper.clone(),
    );
    let rest_mapper: Arc<dyn RestMapper> = Arc::new(DiscoveryRestMapper::new(client.clone()));
    let builder = ControllerBuilder::new(rest_mapper);
    let shared = Shared {
        client,
        operator: operator.clone(),
        observer: observer.clone(),
        cluster: cluster.clone(),
        environment: environment.clone(),
        mapper: mapper.clone(),
    };

    let mut events = cluster.subscribe();
    let mut running: Option<Generation> = None;
    let mut attempt = 0u32;

    loop {
        let Some(gates) = wait_for_feature_gates(&observer, &token).await else {
            break;
        };
        let fingerprint = mapper.fingerprint(&gates);

        let prepared = prepare(
            &renderer,
            &builder,
            &gates,
            &environment,
            &config.manifests_dir,
        )
        .await;
        let retry_at = match prepared {
            Ok(plan) => {
                attempt = 0;
                publish(&operator, render_condition(None)).await;
                if let Some(previous) = running.take() {
                    previous.stop().await;
                }
                running = Some(start_generation(plan, &shared, &config, &fingerprint, &token));
                None
            }
            Err(e) => {
                let delay = calculate_backoff(attempt, None, None);
                warn!(
                    attempt,
                    retry_in = ?delay,
                    running = running.is_some(),
                    "Failed to prepare controllers: {}",
                    e
                );
                publish(&operator, render_condition(Some(&e))).await;
                attempt = attempt.saturating_add(1);
                Some(Instant::now() + delay)
            }
        };

        match wait_for_wake(&observer, &mapper, &fingerprint, &mut events, retry_at, &token).await
        {
            Wake::GatesChanged => info!("Feature gates changed, re-rendering manifests"),
            Wake::Retry => info!("Retrying manifest rendering"),
            Wake::Stop => break,
        }
    }

    if let Some(generation) = running {
        generation.stop().await;
    }
    info!("Operator stopped");
    Ok(())
}

/// Start the informers and the scheduler for one successful render
fn start_generation(
    plan: BuildPlan,
    shared: &Shared,
    config: &RunConfig,
    fingerprint: &str,
    token: &CancellationToken,
) -> Generation {
    let generation = token.child_token();
    let managed = ManagedInformers::start(
        &shared.client,
        &plan.namespaces,
        &plan.related_objects,
        shared.cluster.sender(),
        &generation,
    );
    let ctx = shared.context(managed);

    let set = plan.into_controller_set(&ctx);
    let removable: Vec<String> = set
        .controllers
        .iter()
        .filter(|c| c.removable())
        .map(|c| c.name().to_string())
        .collect();
    let mut controllers = set.controllers;
    controllers.extend(supporting_controllers(set.related_objects, removable, &ctx));
    info!(
        controllers = controllers.len(),
        fingerprint = %fingerprint,
        "Starting controllers"
    );

    let scheduler = Scheduler::new(controllers, ctx.cluster.sender(), ctx.operator.clone())
        .with_resync_interval(config.resync_interval);
    Generation {
        task: tokio::spawn(scheduler.run(generation.clone())),
        token: generation,
    }
}

/// Publish a condition on the singleton; failures are only logged
async fn publish(operator: &OperatorClient, condition: Condition) {
    if let Err(e) = operator.update_conditions(vec![condition]).await {
        warn!("Failed to report render result: {}", e);
    }
}

/// Controllers that exist independently of the rendered manifests
fn supporting_controllers(
    related_objects: Vec<RelatedObject>,
    removable: Vec<String>,
    ctx: &ControllerContext,
) -> Vec<Arc<dyn Controller>> {
    vec![
        Arc::new(StaticUpgradeableController::new(&SubComponent::ALL, ctx.clone())),
        Arc::new(IncompatibleOperatorsController::new(ctx.clone())),
        Arc::new(ClusterStatusController::new(
            related_objects,
            removable,
            ctx.clone(),
        )),
    ]
}

/// Gates for the current release; `None` once `token` is cancelled
async fn wait_for_feature_gates(
    observer: &ConfigObserver,
    token: &CancellationToken,
) -> Option<FeatureGateSnapshot> {
    loop {
        match observer.feature_gates() {
            Ok(gates) => return Some(gates),
            Err(e) => warn!("Waiting for feature gates: {}", e),
        }
        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep(FEATURE_GATE_RETRY) => {}
        }
    }
}

/// Wait until the mapped gates no longer match `current`, the retry deadline passes
/// or `token` is cancelled
async fn wait_for_wake(
    observer: &ConfigObserver,
    mapper: &FeatureGateMapper,
    current: &str,
    events: &mut broadcast::Receiver<InformerKind>,
    retry_at: Option<Instant>,
    token: &CancellationToken,
) -> Wake {
    let mut listening = true;
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return Wake::Stop,
            _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                return Wake::Retry;
            }
            event = events.recv(), if listening => event,
        };
        match event {
            Ok(InformerKind::FeatureGate) | Err(RecvError::Lagged(_)) => {}
            Ok(_) => continue,
            Err(RecvError::Closed) => {
                listening = false;
                if retry_at.is_none() {
                    token.cancelled().await;
                    return Wake::Stop;
                }
                continue;
            }
        }
        match observer.feature_gates() {
            Ok(gates) if mapper.fingerprint(&gates) != current => return Wake::GatesChanged,
            Ok(_) => {}
            Err(e) => warn!("Could not read feature gates: {}", e),
        }
    }
}
