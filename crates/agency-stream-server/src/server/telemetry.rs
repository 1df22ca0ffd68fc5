//! # Telemetry
//!
//! Console logging through `tracing_subscriber` is always on. OpenTelemetry
//! export is opt-in through cargo features:
//!
//! - `otel-tracing`: export spans (one per stream, one per request).
//! - `metrics`: export counters and histograms (requests, skipped requests,
//!   in-flight streams, batches, records, stream errors, stream duration).
//! - `stdout`: print exported telemetry to stdout.
//! - `otlp`: ship exported telemetry over OTLP/gRPC. The endpoint and headers
//!   come from the standard `OTEL_EXPORTER_OTLP_*` environment variables.
//!
//! Exporters require at least one of `otel-tracing` or `metrics`. Metric
//! helpers compile to no-ops when `metrics` is disabled.
//!
//! ```bash
//! cargo run --features otel-tracing,metrics,otlp --bin agency-stream-server
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "otel-tracing", feature = "metrics"))))]
compile_error!(
    "The 'otlp' feature requires at least one of 'otel-tracing' or 'metrics' to be enabled."
);

#[cfg(all(feature = "stdout", not(any(feature = "otel-tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'otel-tracing' or 'metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel-tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel-tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel-tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel-tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel-tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel-tracing")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "agency-stream-server";

pub struct TelemetryProviders {
    #[cfg(feature = "otel-tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down the exporters. Errors are printed, not returned:
    /// logging may already be gone at this point.
    pub fn shutdown(self) {
        #[cfg(feature = "otel-tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel-tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel-tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "otel-tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "otel-tracing")]
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
        #[cfg(feature = "otel-tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "otel-tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
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
        let exporter = opentelemetry_stdout::MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_temporality(sdkmetrics::Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "otel-tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batch_processor(
        opentelemetry_stdout::SpanExporter::default(),
    ));

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .context("failed to build tracer exporter")?;
        builder.with_span_processor(batch_processor(exporter))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "otel-tracing", any(feature = "stdout", feature = "otlp")))]
fn batch_processor<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
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

#[cfg(feature = "metrics")]
struct MetricHandles {
    requests: Counter<u64>,
    requests_skipped: Counter<u64>,
    streams_inflight: UpDownCounter<i64>,
    stream_errors: Counter<u64>,
    stream_duration_ms: Histogram<f64>,
    batches_sent: Counter<u64>,
    records_generated: Counter<u64>,
    records_per_request: Histogram<f64>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<MetricHandles> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = METRICS.set(MetricHandles {
        requests: meter
            .u64_counter("requests")
            .with_description("Accepted generation requests")
            .build(),
        requests_skipped: meter
            .u64_counter("requests_skipped")
            .with_description("Generation requests rejected as invalid")
            .build(),
        streams_inflight: meter
            .i64_up_down_counter("streams_inflight")
            .with_description("Concurrent gRPC streams")
            .build(),
        stream_errors: meter
            .u64_counter("errors")
            .with_description("Refused or failed streams")
            .build(),
        stream_duration_ms: meter
            .f64_histogram("stream_duration")
            .with_unit("ms")
            .with_description("End-to-end stream duration")
            .build(),
        batches_sent: meter
            .u64_counter("batches_sent")
            .with_description("Record batches written to clients")
            .build(),
        records_generated: meter
            .u64_counter("records_generated")
            .with_description("Synthetic contract requests generated")
            .build(),
        records_per_request: meter
            .f64_histogram("records_per_request")
            .with_description("Records requested per generation request")
            .build(),
    });
}

/// Declares a metric helper that is a no-op without the `metrics` feature.
macro_rules! metric_fn {
    ($(#[$doc:meta])* $name:ident($($arg:ident: $ty:ty),*) => |$m:ident| $body:expr) => {
        $(#[$doc])*
        #[cfg(feature = "metrics")]
        pub fn $name($($arg: $ty),*) {
            if let Some($m) = METRICS.get() {
                $body;
            }
        }

        $(#[$doc])*
        #[cfg(not(feature = "metrics"))]
        pub fn $name($(_: $ty),*) {}
    };
}

metric_fn!(increment_requests() => |m| m.requests.add(1, &[]));
metric_fn!(increment_requests_skipped() => |m| m.requests_skipped.add(1, &[]));
metric_fn!(increment_streams_inflight() => |m| m.streams_inflight.add(1, &[]));
metric_fn!(decrement_streams_inflight() => |m| m.streams_inflight.add(-1, &[]));
metric_fn!(increment_stream_errors() => |m| m.stream_errors.add(1, &[]));
metric_fn!(
    record_stream_duration(duration_ms: f64) => |m| m.stream_duration_ms.record(duration_ms, &[])
);
metric_fn!(increment_batches_sent() => |m| m.batches_sent.add(1, &[]));
metric_fn!(increment_records_generated(count: u64) => |m| m.records_generated.add(count, &[]));
metric_fn!(record_records_per_request(count: f64) => |m| m.records_per_request.record(count, &[]));

#[cfg(test)]
pub(crate) mod capture {
    //! Formatted log output collected in memory for assertions.

    use std::{
        io::{self, Write},
        sync::{Arc, Mutex},
    };
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;

    #[derive(Clone, Default)]
    pub(crate) struct CapturedLogs {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl CapturedLogs {
        /// Routes every event of the current thread into the returned buffer
        /// until the guard is dropped.
        pub(crate) fn install() -> (Self, DefaultGuard) {
            let logs = Self::default();
            let writer = logs.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_ansi(false)
                .with_max_level(tracing::Level::DEBUG)
                .with_writer(BoxMakeWriter::new(move || writer.clone()))
                .finish();
            (logs, tracing::subscriber::set_default(subscriber))
        }

        pub(crate) fn lines(&self) -> Vec<String> {
            let buf = self.buf.lock().unwrap();
            String::from_utf8_lossy(&buf)
                .lines()
                .map(str::to_owned)
                .collect()
        }

        /// Lines logged at `level` (e.g. `"WARN"`) that contain `needle`.
        pub(crate) fn matching(&self, level: &str, needle: &str) -> Vec<String> {
            self.lines()
                .into_iter()
                .filter(|line| line.contains(level) && line.contains(needle))
                .collect()
        }
    }

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut inner = self
                .buf
                .lock()
                .map_err(|_| io::Error::other("failed to lock log buffer"))?;
            inner.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
