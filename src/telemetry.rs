//! Logging and tracing setup
//!
//! Logs go to stdout through `tracing-subscriber`. When `OTEL_EXPORTER_OTLP_ENDPOINT`
//! is set, spans are also exported over OTLP.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Endpoint variable that switches OTLP export on
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

const SERVICE_NAME: &str = "cluster-olm-operator";

/// Level of this crate's own logs for a `-v` verbosity
pub fn level_for_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0..=1 => Level::WARN,
        2..=3 => Level::INFO,
        4..=5 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Default filter: dependencies at `warn`, this crate at the requested level
pub fn default_directives(verbosity: u8) -> String {
    let level = level_for_verbosity(verbosity).to_string().to_lowercase();
    format!("warn,cluster_olm_operator={level}")
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity.
pub fn init(verbosity: u8, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

    let otel_layer = match std::env::var(OTLP_ENDPOINT_ENV) {
        Ok(endpoint) if !endpoint.is_empty() => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(trace::config().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])))
                .install_batch(runtime::Tokio)
                .map_err(|e| Error::ConfigError(format!("failed to initialize tracer: {e}")))?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        _ => None,
    };
    let otel_enabled = otel_layer.is_some();

    let (plain, structured) = if json {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(true)), None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(plain)
        .with(structured)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::ConfigError(format!("failed to initialize logging: {e}")))?;

    if otel_enabled {
        tracing::info!("OpenTelemetry tracing initialized");
    } else {
        tracing::debug!("OpenTelemetry tracing disabled ({} not set)", OTLP_ENDPOINT_ENV);
    }
    Ok(())
}

/// Flush buffered spans
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_for_verbosity(0), Level::WARN);
        assert_eq!(level_for_verbosity(1), Level::WARN);
        assert_eq!(level_for_verbosity(2), Level::INFO);
        assert_eq!(level_for_verbosity(5), Level::DEBUG);
        assert_eq!(level_for_verbosity(6), Level::TRACE);
        assert_eq!(level_for_verbosity(u8::MAX), Level::TRACE);
    }

    #[test]
    fn test_default_directives() {
        assert_eq!(default_directives(2), "warn,cluster_olm_operator=info");
        assert_eq!(default_directives(8), "warn,cluster_olm_operator=trace");
        assert!(EnvFilter::try_new(default_directives(4)).is_ok());
    }
}
