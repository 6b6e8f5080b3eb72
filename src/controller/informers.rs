//! Shared informer caches
//!
//! Every cache is a kube reflector store fed by a watcher task. Each change is
//! announced on a broadcast channel as an [`InformerKind`], which the scheduler uses
//! to decide which controllers to wake.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, DynamicObject},
    core::{ApiResource, GroupVersionKind},
    runtime::{
        metadata_watcher,
        reflector::{self, store::Writer, Store},
        watcher, WatchStreamExt,
    },
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::restmapper::{known_mappings, RestMapping};
use crate::crd::{
    ApiServer, ClusterExtension, ClusterExtensionRevision, ClusterOperator, ClusterVersion,
    FeatureGate, Olm, Proxy, RelatedObject, CLUSTER_CONFIG_NAME, CLUSTER_VERSION_NAME,
    OLM_SINGLETON_NAME,
};
use crate::error::{Error, Result};

/// Namespace holding the helm release secrets of installed extensions
pub const HELM_RELEASE_NAMESPACE: &str = "openshift-operator-controller";

/// Label selecting helm release secrets
pub const HELM_OWNER_SELECTOR: &str = "owner=helm";

/// Name of the cluster operator this operator reports on
pub const CLUSTER_OPERATOR_NAME: &str = "olm";

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Identifies the cache that changed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InformerKind {
    Olm,
    Proxy,
    ApiServer,
    ClusterVersion,
    FeatureGate,
    ClusterOperator,
    HelmSecrets,
    ClusterExtensions,
    ExtensionRevisions,
    Deployments,
    ClusterCatalogs,
    /// A namespaced object of a static manifest
    StaticNamespaced,
    /// A cluster-scoped object of a static manifest
    StaticClusterScoped,
}

/// GVK of the catalog resources managed at field level
pub fn cluster_catalog_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("olm.operatorframework.io", "v1", "ClusterCatalog"),
        "clustercatalogs",
    )
}

/// Caches that live for the whole process
#[derive(Clone)]
pub struct ClusterInformers {
    pub olm: Store<Olm>,
    pub proxy: Store<Proxy>,
    pub api_server: Store<ApiServer>,
    pub cluster_version: Store<ClusterVersion>,
    pub feature_gate: Store<FeatureGate>,
    pub cluster_operator: Store<ClusterOperator>,
    pub helm_secrets: Store<Secret>,
    pub cluster_extensions: Store<ClusterExtension>,
    pub extension_revisions: Store<ClusterExtensionRevision>,
    events: broadcast::Sender<InformerKind>,
}

impl ClusterInformers {
    /// Start all process-wide watchers; they stop when `token` is cancelled
    pub fn start(client: &Client, token: &CancellationToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let spawner = Spawner {
            events: events.clone(),
            token: token.clone(),
        };

        let by_name = |name: &str| watcher::Config::default().fields(&format!("metadata.name={name}"));

        let olm = spawner.spawn(
            Api::<Olm>::all(client.clone()),
            by_name(OLM_SINGLETON_NAME),
            InformerKind::Olm,
            false,
        );
        let proxy = spawner.spawn(
            Api::<Proxy>::all(client.clone()),
            by_name(CLUSTER_CONFIG_NAME),
            InformerKind::Proxy,
            true,
        );
        let api_server = spawner.spawn(
            Api::<ApiServer>::all(client.clone()),
            by_name(CLUSTER_CONFIG_NAME),
            InformerKind::ApiServer,
            true,
        );
        let cluster_version = spawner.spawn(
            Api::<ClusterVersion>::all(client.clone()),
            by_name(CLUSTER_VERSION_NAME),
            InformerKind::ClusterVersion,
            false,
        );
        let feature_gate = spawner.spawn(
            Api::<FeatureGate>::all(client.clone()),
            by_name(CLUSTER_CONFIG_NAME),
            InformerKind::FeatureGate,
            false,
        );
        let cluster_operator = spawner.spawn(
            Api::<ClusterOperator>::all(client.clone()),
            by_name(CLUSTER_OPERATOR_NAME),
            InformerKind::ClusterOperator,
            false,
        );
        let helm_secrets = spawner.spawn(
            Api::<Secret>::namespaced(client.clone(), HELM_RELEASE_NAMESPACE),
            watcher::Config::default().labels(HELM_OWNER_SELECTOR),
            InformerKind::HelmSecrets,
            true,
        );
        let cluster_extensions = spawner.spawn(
            Api::<ClusterExtension>::all(client.clone()),
            watcher::Config::default(),
            InformerKind::ClusterExtensions,
            true,
        );
        let extension_revisions = spawner.spawn(
            Api::<ClusterExtensionRevision>::all(client.clone()),
            watcher::Config::default(),
            InformerKind::ExtensionRevisions,
            true,
        );

        info!("Started cluster informers");
        Self {
            olm,
            proxy,
            api_server,
            cluster_version,
            feature_gate,
            cluster_operator,
            helm_secrets,
            cluster_extensions,
            extension_revisions,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InformerKind> {
        self.events.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<InformerKind> {
        self.events.clone()
    }

    /// Wait for the caches every controller depends on
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let ready = async {
            self.olm.wait_until_ready().await?;
            self.feature_gate.wait_until_ready().await?;
            self.cluster_version.wait_until_ready().await?;
            self.cluster_operator.wait_until_ready().await?;
            Ok::<_, reflector::store::WriterDropped>(())
        };
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::ConfigError(format!("informer stopped: {e}"))),
            Err(_) => Err(Error::ConfigError(format!(
                "informer caches did not sync within {}s",
                timeout.as_secs()
            ))),
        }
    }
}

/// Objects of one API resource in one scope whose changes wake the static controllers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticWatchTarget {
    pub mapping: RestMapping,
    /// `None` for cluster-scoped resources
    pub namespace: Option<String>,
    pub names: BTreeSet<String>,
}

impl StaticWatchTarget {
    fn kind(&self) -> InformerKind {
        if self.namespace.is_some() {
            InformerKind::StaticNamespaced
        } else {
            InformerKind::StaticClusterScoped
        }
    }
}

/// Group the related objects into metadata watches.
///
/// Deployments and cluster catalogs have caches of their own and resources missing
/// from `mappings` are not watched.
pub fn static_watch_targets(
    related: &[RelatedObject],
    mappings: &[RestMapping],
) -> Vec<StaticWatchTarget> {
    let mut grouped: BTreeMap<(String, String, String), BTreeSet<String>> = BTreeMap::new();
    for object in related {
        if matches!(object.resource.as_str(), "deployments" | "clustercatalogs") {
            continue;
        }
        grouped
            .entry((
                object.group.clone(),
                object.resource.clone(),
                object.namespace.clone(),
            ))
            .or_default()
            .insert(object.name.clone());
    }

    grouped
        .into_iter()
        .filter_map(|((group, resource, namespace), names)| {
            let mapping = mappings
                .iter()
                .find(|m| m.resource.group == group && m.resource.plural == resource)?;
            Some(StaticWatchTarget {
                mapping: mapping.clone(),
                namespace: (!namespace.is_empty()).then_some(namespace),
                names,
            })
        })
        .collect()
}

/// Caches scoped to one rendered controller set
#[derive(Clone)]
pub struct ManagedInformers {
    deployments: BTreeMap<String, Store<Deployment>>,
    pub cluster_catalogs: Store<DynamicObject>,
}

impl ManagedInformers {
    /// Watch deployments in `namespaces`, the cluster catalogs and the metadata of
    /// the other `related` objects
    pub fn start(
        client: &Client,
        namespaces: &BTreeSet<String>,
        related: &[RelatedObject],
        events: broadcast::Sender<InformerKind>,
        token: &CancellationToken,
    ) -> Self {
        let spawner = Spawner {
            events,
            token: token.clone(),
        };

        let deployments = namespaces
            .iter()
            .map(|ns| {
                let store = spawner.spawn(
                    Api::<Deployment>::namespaced(client.clone(), ns),
                    watcher::Config::default(),
                    InformerKind::Deployments,
                    false,
                );
                (ns.clone(), store)
            })
            .collect();

        let catalogs = cluster_catalog_resource();
        let cluster_catalogs = spawner.spawn_with(
            Api::<DynamicObject>::all_with(client.clone(), &catalogs),
            watcher::Config::default(),
            Writer::new(catalogs),
            InformerKind::ClusterCatalogs,
            true,
        );

        let targets = static_watch_targets(related, &known_mappings());
        for target in &targets {
            spawner.watch_metadata(client, target);
        }

        debug!(namespaces = ?namespaces, targets = targets.len(), "Started managed informers");
        Self {
            deployments,
            cluster_catalogs,
        }
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<std::sync::Arc<Deployment>> {
        self.deployments
            .get(namespace)?
            .get(&reflector::ObjectRef::new(name).within(namespace))
    }

    pub fn cluster_catalog(&self, name: &str) -> Option<std::sync::Arc<DynamicObject>> {
        self.cluster_catalogs
            .get(&reflector::ObjectRef::new_with(name, cluster_catalog_resource()))
    }
}

struct Spawner {
    events: broadcast::Sender<InformerKind>,
    token: CancellationToken,
}

impl Spawner {
    fn spawn<K>(
        &self,
        api: Api<K>,
        config: watcher::Config,
        kind: InformerKind,
        optional: bool,
    ) -> Store<K>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    {
        self.spawn_with(api, config, Writer::default(), kind, optional)
    }

    /// Feed `writer` from a watcher until the token is cancelled. Watch errors on
    /// optional resources (CRDs that may not be installed) are only logged at debug.
    fn spawn_with<K>(
        &self,
        api: Api<K>,
        config: watcher::Config,
        writer: Writer<K>,
        kind: InformerKind,
        optional: bool,
    ) -> Store<K>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Eq + Hash + Clone + Send + Sync,
    {
        let store = writer.as_reader();
        let events = self.events.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let stream = watcher(api, config)
                .default_backoff()
                .reflect(writer)
                .touched_objects();
            futures::pin_mut!(stream);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(_)) => {
                            // No receivers is fine during startup
                            let _ = events.send(kind);
                        }
                        Some(Err(e)) if optional => debug!(informer = ?kind, "Watch error: {}", e),
                        Some(Err(e)) => warn!(informer = ?kind, "Watch error: {}", e),
                        None => break,
                    }
                }
            }
            debug!(informer = ?kind, "Informer stopped");
        });

        store
    }

    /// Announce changes to the named objects of `target`. Only metadata is streamed;
    /// the controllers re-read their manifests on every sync.
    fn watch_metadata(&self, client: &Client, target: &StaticWatchTarget) {
        let ar = &target.mapping.resource;
        let api = match &target.namespace {
            Some(ns) => Api::<DynamicObject>::namespaced_with(client.clone(), ns, ar),
            None => Api::<DynamicObject>::all_with(client.clone(), ar),
        };
        let names = target.names.clone();
        let kind = target.kind();
        let resource = ar.plural.clone();
        let events = self.events.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let stream = metadata_watcher(api, watcher::Config::default())
                .default_backoff()
                .touched_objects();
            futures::pin_mut!(stream);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(meta)) => {
                            if meta.metadata.name.as_ref().is_some_and(|n| names.contains(n)) {
                                let _ = events.send(kind);
                            }
                        }
                        Some(Err(e)) => debug!(%resource, "Metadata watch error: {}", e),
                        None => break,
                    }
                }
            }
            debug!(%resource, "Metadata watch stopped");
        });
    }
}
