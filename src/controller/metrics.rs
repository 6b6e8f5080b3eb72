//! Prometheus metrics for the cluster OLM operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `olm_controller_sync_duration_seconds` (histogram): sync duration labeled by controller.
//! - `olm_controller_sync_errors_total` (counter): failed syncs labeled by controller and kind.
//! - `olm_controller_panics_total` (counter): syncs that panicked, labeled by controller.
//! - `olm_manifest_renders_total` (counter): manifest renders labeled by result.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;

use axum::{http::StatusCode, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};

/// Labels for per-controller metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    /// Controller name, e.g. "CatalogdDeploymentCatalogdControllerManager"
    pub controller: String,
}

/// Labels for sync error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error category, e.g. "kube", "config", "hook"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RenderLabels {
    /// "success" or "failed"
    pub result: String,
}

/// Histogram tracking sync duration (seconds)
pub static SYNC_DURATION_SECONDS: Lazy<Family<ControllerLabels, Histogram>> = Lazy::new(|| {
    fn sync_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(sync_histogram)
});

pub static SYNC_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static PANICS_TOTAL: Lazy<Family<ControllerLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RENDERS_TOTAL: Lazy<Family<RenderLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "olm_controller_sync_duration_seconds",
        "Duration of controller syncs in seconds",
        SYNC_DURATION_SECONDS.clone(),
    );
    registry.register(
        "olm_controller_sync_errors",
        "Total number of failed controller syncs",
        SYNC_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "olm_controller_panics",
        "Total number of controller syncs that panicked",
        PANICS_TOTAL.clone(),
    );
    registry.register(
        "olm_manifest_renders",
        "Total number of manifest renders by result",
        RENDERS_TOTAL.clone(),
    );

    registry
});

/// Observe a sync duration in seconds.
pub fn observe_sync_duration_seconds(controller: &str, seconds: f64) {
    let labels = ControllerLabels {
        controller: controller.to_string(),
    };
    SYNC_DURATION_SECONDS.get_or_create(&labels).observe(seconds);
}

/// Increment the sync error counter.
pub fn inc_sync_error(controller: &str, error: &Error) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: error_kind(error).to_string(),
    };
    SYNC_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_panic(controller: &str) {
    let labels = ControllerLabels {
        controller: controller.to_string(),
    };
    PANICS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_render(success: bool) {
    let labels = RenderLabels {
        result: if success { "success" } else { "failed" }.to_string(),
    };
    RENDERS_TOTAL.get_or_create(&labels).inc();
}

fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::KubeError(_) => "kube",
        Error::YamlError(_) | Error::JsonError(_) => "decode",
        Error::IoError { .. } => "io",
        Error::ConfigError(_) => "config",
        Error::ManifestError { .. } => "manifest",
        Error::RenderError(_) => "render",
        Error::HookError { .. } => "hook",
        Error::Precondition(_) => "precondition",
        Error::ExtensionMetadata(_) => "extension_metadata",
        Error::Cancelled => "cancelled",
        Error::Aggregate(_) => "aggregate",
    }
}

async fn metrics_handler() -> (StatusCode, String) {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    match encode(&mut buffer, &REGISTRY) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve `/metrics` and `/healthz` until `shutdown` fires
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::io(addr.to_string(), e))?;
    info!("Metrics server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::io(addr.to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_encodes_sync_metrics() {
        observe_sync_duration_seconds("TestController", 0.25);
        inc_sync_error("TestController", &Error::ConfigError("bad".to_string()));
        inc_panic("TestController");

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();
        assert!(buffer.contains("olm_controller_sync_duration_seconds"));
        assert!(buffer.contains("kind=\"config\""));
        assert!(buffer.contains("olm_controller_panics_total"));
    }
}
