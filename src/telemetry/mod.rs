//! Tracing setup shared by the binaries.
//!
//! Events go to stderr, filtered through `RUST_LOG` (default `info`). When an OTLP collector
//! endpoint is given, spans are also exported there (eg: to jaeger).
use opentelemetry::sdk::propagation::TraceContextPropagator;
use opentelemetry::sdk::trace::BatchConfig;
use opentelemetry::sdk::{trace, Resource};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use tracing_bunyan_formatter::JsonStorageLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};

use crate::error::{Error, Result};

const SERVICE_NAME: &str = "dlt";
const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber. Must be called from within a tokio runtime when
/// `exporter_endpoint` is set.
///
/// # Errors
///  1. [`Error::InvalidConfig`] if the OTLP pipeline can't be built
///  2. [`Error::Logic`] if a global subscriber was already installed
pub fn initialize_subscriber(exporter_endpoint: Option<&str>) -> Result<()> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let otlp_layer = match exporter_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(trace::config().with_resource(Resource::new(vec![
                    KeyValue::new(
                        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                        SERVICE_NAME.to_string(),
                    ),
                ])))
                .with_batch_config(BatchConfig::default().with_max_queue_size(64 * 1024))
                .install_batch(opentelemetry::runtime::Tokio)
                .map_err(|e| Error::InvalidConfig {
                    reason: format!("unable to build the OTLP pipeline for {}: {}", endpoint, e),
                })?;
            global::set_text_map_propagator(TraceContextPropagator::new());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    Registry::default()
        .with(env_filter())
        .with(otlp_layer)
        .with(JsonStorageLayer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Logic {
            reason: format!("unable to install the tracing subscriber: {}", e),
        })
}

/// Flushes the spans that weren't exported yet
pub fn shutdown() {
    global::shutdown_tracer_provider();
}
