//! Logging and trace export for the operator
//!
//! Logs are JSON lines filtered by `RUST_LOG`. Spans are additionally shipped
//! over OTLP/gRPC when a collector endpoint is configured.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "info,tkm=debug,kube=info,tower=warn,hyper=warn";

/// Downward-API variables recorded on every exported span
const K8S_ATTRIBUTES: [(&str, &str); 3] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Telemetry setup failure
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The OTLP exporter could not be built
    #[error("failed to build OTLP exporter for {endpoint}: {message}")]
    Exporter {
        /// Collector endpoint that was configured
        endpoint: String,
        /// Exporter error
        message: String,
    },

    /// A global subscriber was already installed
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Telemetry settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` on exported spans
    pub service_name: String,
    /// OTLP collector endpoint; spans stay local when unset
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "tkm-operator".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

/// Install the global subscriber
///
/// Call once. With an OTLP endpoint configured this must run inside the
/// Tokio runtime, since the batch exporter spawns onto it.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let logs = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false);

    let traces = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| {
            let provider = tracer_provider(endpoint, &config.service_name)?;
            let tracer = provider.tracer(config.service_name.clone());
            global::set_text_map_propagator(TraceContextPropagator::new());
            global::set_tracer_provider(provider);
            Ok::<_, TelemetryError>(tracing_opentelemetry::layer().with_tracer(tracer))
        })
        .transpose()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(logs)
        .with(traces)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}

fn tracer_provider(endpoint: &str, service_name: &str) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

    let resource = Resource::new(resource_attributes(service_name, |var| {
        std::env::var(var).ok()
    }));

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

/// Service identity plus whichever downward-API variables `lookup` finds
fn resource_attributes(
    service_name: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    attributes.extend(
        K8S_ATTRIBUTES
            .iter()
            .filter_map(|(var, key)| lookup(var).map(|value| KeyValue::new(*key, value))),
    );
    attributes
}
