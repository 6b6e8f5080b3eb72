//! Lease based leader election
//!
//! Only the holder of the `cluster-olm-operator-lock` Lease runs controllers. The
//! holder renews the lease periodically; a lease that was not renewed within its
//! duration may be taken over.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;

pub const DEFAULT_LEASE_NAME: &str = "cluster-olm-operator-lock";
const LEASE_DURATION_SECS: i32 = 137;
const RENEW_INTERVAL: Duration = Duration::from_secs(26);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Whether a lease may be taken over at `now`
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    spec.and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(i64::from(duration))
        })
        .unwrap_or(true)
}

pub struct LeaderElection {
    leases: Api<Lease>,
    namespace: String,
    lease_name: String,
    identity: String,
}

impl LeaderElection {
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Block until the lease is held. Returns `false` if `token` fires first.
    pub async fn acquire(&self, token: &CancellationToken) -> bool {
        info!(lease = %self.lease_name, identity = %self.identity, "Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Acquired leadership for lease {}", self.lease_name);
                    return true;
                }
                Ok(false) => {}
                Err(e) => warn!("Leader election error: {}", e),
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    /// Keep renewing until leadership is lost or `token` fires.
    /// Returns `true` when leadership was lost.
    pub async fn hold(&self, token: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(RENEW_INTERVAL) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Lost leadership for lease {}", self.lease_name);
                    return true;
                }
                Err(e) => warn!("Failed to renew lease {}: {}", self.lease_name, e),
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();

        let Some(existing) = self.leases.get_opt(&self.lease_name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            self.leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", self.lease_name, self.identity);
            return Ok(true);
        };

        let spec = existing.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());
        let patch = if holder == Some(self.identity.as_str()) {
            serde_json::json!({
                "spec": {
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            })
        } else if lease_expired(spec, now) {
            info!("Lease held by {:?} has expired, taking over", holder);
            serde_json::json!({
                "spec": {
                    "holderIdentity": self.identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            })
        } else {
            return Ok(false);
        };

        self.leases
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(true)
    }
}
