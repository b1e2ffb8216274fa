//! Logging, traces and metrics.
//!
//! Structured logging through `tracing` + `tracing_subscriber::fmt` is always
//! on and filtered with `RUST_LOG` (default `info`). OpenTelemetry export is
//! opt-in through cargo features:
//!
//! - `traces`: export spans (one per connection, plus request events).
//! - `metrics`: export counters and histograms for requests, connections,
//!   generation latency, queue wait and worker failures.
//! - `honeycomb`: OTLP/gRPC exporter configured from `HONEYCOMB_API_KEY`,
//!   `HONEYCOMB_DATASET`, `HONEYCOMB_ENDPOINT` and `HONEYCOMB_COMPRESSION`.
//! - `stdout`: print exported telemetry locally.
//!
//! Exporters require at least one of `traces` or `metrics`; both exporters
//! may be enabled at once.
//!
//! ```bash
//! cargo run --features traces,metrics,stdout
//! ```
//!
//! The `increment_*` / `record_*` helpers compile to no-ops without the
//! `metrics` feature, so call sites never need to be feature gated.

// `honeycomb` needs something to export
#[cfg(all(
    feature = "honeycomb",
    not(any(feature = "traces", feature = "metrics"))
))]
compile_error!(
    "The 'honeycomb' feature requires at least one of 'traces' or 'metrics' to be enabled."
);

// So does `stdout`
#[cfg(all(feature = "stdout", not(any(feature = "traces", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'traces' or 'metrics' to be enabled."
);

// Core imports - always needed
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// Honeycomb-specific imports
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "traces")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "honeycomb")]
use tonic::metadata::MetadataMap;
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "traces")))]
use tonic::transport::ClientTlsConfig;

// Metrics-specific imports
#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

// Either
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_semantic_conventions as semvcns;

// Tracing-specific imports
#[cfg(feature = "traces")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "traces")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "traces")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "traces")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops the exporters. A no-op without `traces`/`metrics`.
    pub fn shutdown(self) {
        #[cfg(feature = "traces")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                tracing::error!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                tracing::error!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                tracing::error!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                tracing::error!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "traces")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "traces")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "traces"))]
    let scope = InstrumentationScope::builder("chunkforge")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Console logging is independent of the `stdout` exporter.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "traces")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "traces")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

/// Exporter metadata, endpoint and compression read from the environment.
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "traces")))]
fn honeycomb_settings() -> anyhow::Result<(MetadataMap, String, Compression)> {
    use anyhow::Context;
    use std::str::FromStr;

    let mut metadata = MetadataMap::new();
    let api_key = std::env::var("HONEYCOMB_API_KEY").context("missing `HONEYCOMB_API_KEY`")?;
    let dataset = std::env::var("HONEYCOMB_DATASET").context("missing `HONEYCOMB_DATASET`")?;
    metadata.insert(
        "x-honeycomb-team",
        api_key.parse().context("invalid API key")?,
    );
    metadata.insert(
        "x-honeycomb-dataset",
        dataset.parse().context("invalid dataset")?,
    );

    let endpoint = std::env::var("HONEYCOMB_ENDPOINT").context("missing `HONEYCOMB_ENDPOINT`")?;
    let compression = std::env::var("HONEYCOMB_COMPRESSION")
        .context("missing `HONEYCOMB_COMPRESSION`")?
        .to_ascii_lowercase();
    let compression = Compression::from_str(&compression)?;

    Ok((metadata, endpoint, compression))
}

#[cfg(any(feature = "metrics", feature = "traces"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("chunkforge")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let (metadata, endpoint, compression) = honeycomb_settings()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(compression)
            .with_endpoint(endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "traces")]
fn batch_processor<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: sdktrace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "traces")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        builder.with_span_processor(batch_processor(SpanExporter::default()))
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let (metadata, endpoint, compression) = honeycomb_settings()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(compression)
            .with_endpoint(endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;

        builder.with_span_processor(batch_processor(exporter))
    };

    Ok(builder.build())
}

/// Instruments registered once the meter provider is up.
#[cfg(feature = "metrics")]
struct Metrics {
    requests: Counter<u64>,
    request_errors: Counter<u64>,
    connections_inflight: UpDownCounter<i64>,
    connection_duration: Histogram<f64>,
    chunks_generated: Counter<u64>,
    generation_duration: Histogram<f64>,
    queue_wait: Histogram<f64>,
    queue_length: Histogram<u64>,
    worker_failures: Counter<u64>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Metrics> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let ms_histogram = |name: &'static str, description: &'static str| {
        meter
            .f64_histogram(name)
            .with_unit("ms")
            .with_description(description)
            .build()
    };

    let metrics = Metrics {
        requests: meter
            .u64_counter("requests")
            .with_description("Generate requests accepted")
            .build(),
        request_errors: meter
            .u64_counter("errors")
            .with_description("Error frames sent to clients")
            .build(),
        connections_inflight: meter
            .i64_up_down_counter("connections_inflight")
            .with_description("Open chunk streams")
            .build(),
        connection_duration: ms_histogram("connection_duration", "Lifetime of a chunk stream"),
        chunks_generated: meter
            .u64_counter("chunks_generated")
            .with_description("Chunks delivered to clients")
            .build(),
        generation_duration: ms_histogram(
            "generation_duration",
            "Time spent inside the generator per job",
        ),
        queue_wait: ms_histogram("queue_wait", "Time a job spent queued before assignment"),
        queue_length: meter
            .u64_histogram("queue_length")
            .with_description("Pool queue length, sampled on change")
            .build(),
        worker_failures: meter
            .u64_counter("worker_failures")
            .with_description("Workers that crashed or exited unexpectedly")
            .build(),
    };

    if METRICS.set(metrics).is_err() {
        tracing::warn!("Metric instruments were already registered");
    }
}

/// Defines a recording helper and its no-op twin for builds without
/// `metrics`.
macro_rules! metric_helper {
    ($name:ident($($arg:ident: $ty:ty)?) => |$m:ident| $record:expr) => {
        #[cfg(feature = "metrics")]
        pub fn $name($($arg: $ty)?) {
            if let Some($m) = METRICS.get() {
                $record;
            }
        }

        #[cfg(not(feature = "metrics"))]
        pub fn $name($(_: $ty)?) {}
    };
}

metric_helper!(increment_requests() => |m| m.requests.add(1, &[]));
metric_helper!(increment_request_errors() => |m| m.request_errors.add(1, &[]));
metric_helper!(increment_connections_inflight() => |m| m.connections_inflight.add(1, &[]));
metric_helper!(decrement_connections_inflight() => |m| m.connections_inflight.add(-1, &[]));
metric_helper!(record_connection_duration(duration_ms: f64) => |m| {
    m.connection_duration.record(duration_ms, &[])
});
metric_helper!(increment_chunks_generated() => |m| m.chunks_generated.add(1, &[]));
metric_helper!(record_generation_duration(duration_ms: f64) => |m| {
    m.generation_duration.record(duration_ms, &[])
});
metric_helper!(record_queue_wait(wait_ms: f64) => |m| m.queue_wait.record(wait_ms, &[]));
metric_helper!(record_queue_length(length: usize) => |m| {
    m.queue_length.record(length as u64, &[])
});
metric_helper!(increment_worker_failures() => |m| m.worker_failures.add(1, &[]));
