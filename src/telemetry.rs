//! Stderr logging and optional OTLP trace export for deobfuscation runs.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use opentelemetry::trace::{TraceContextExt, Tracer, TracerProvider as OtelTracerProvider};
use opentelemetry::{Context as OtelContext, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, SdkTracer, SdkTracerProvider, SpanExporter,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::transform::TransformStats;

/// Environment variable that overrides the log filter.
const LOG_ENV: &str = "JDEOB_LOG";
const DEFAULT_LOG_FILTER: &str = "jdeob=info,warn";
const SERVICE_NAME: &str = "jdeob";

/// Span export to an OTLP/HTTP collector, one span per phase, pass and input.
pub(crate) struct Telemetry {
    tracer: SdkTracer,
    provider: SdkTracerProvider,
}

impl Telemetry {
    pub(crate) fn new(endpoint: &str) -> Result<Self> {
        let endpoint = trace_endpoint(endpoint)?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("build OTLP span exporter")?;
        Self::with_exporter(exporter)
    }

    fn with_exporter<E: SpanExporter + 'static>(exporter: E) -> Result<Self> {
        // Spans may end on rayon workers; the batch processor owns its export thread.
        let batch_config = BatchConfigBuilder::default()
            .with_max_queue_size(16_384)
            .with_max_export_batch_size(2048)
            .with_scheduled_delay(Duration::from_millis(250))
            .build();
        let provider = SdkTracerProvider::builder()
            .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
            .with_span_processor(
                BatchSpanProcessor::builder(exporter)
                    .with_batch_config(batch_config)
                    .build(),
            )
            .build();
        let tracer = provider.tracer(SERVICE_NAME);
        opentelemetry::global::set_tracer_provider(provider.clone());
        Ok(Self { tracer, provider })
    }

    pub(crate) fn in_span<T, F>(&self, name: &str, attributes: &[KeyValue], f: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.tracer.in_span(name.to_string(), |cx| {
            let span = cx.span();
            for attribute in attributes {
                span.set_attribute(attribute.clone());
            }
            f()
        })
    }

    /// Flush pending spans.
    pub(crate) fn shutdown(&self) -> Result<()> {
        self.provider
            .shutdown()
            .map_err(|err| anyhow!("failed to shut down tracer provider: {err}"))
    }
}

/// Point a collector base URL (or its logs URL) at the traces endpoint.
fn trace_endpoint(endpoint: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(endpoint)
        .with_context(|| format!("parse OTLP endpoint {endpoint}"))?;
    let path = url.path().trim_end_matches('/').to_string();
    let base = ["/v1/logs", "/v1/metrics", "/v1/traces"]
        .iter()
        .find_map(|signal| path.strip_suffix(signal))
        .unwrap_or(path.as_str());
    url.set_path(&format!("{base}/v1/traces"));
    Ok(url.to_string())
}

/// Log to stderr, filtered by `JDEOB_LOG` (`jdeob=info,warn` when unset).
pub(crate) fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    // A second initialisation (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/// Attach a `pass.finished` event with the pass totals to the active span.
pub(crate) fn record_pass(stats: &TransformStats) {
    let cx = OtelContext::current();
    let span = cx.span();
    if !span.span_context().is_valid() {
        return;
    }
    let mut attributes = vec![
        KeyValue::new("jdeob.iterations", stats.iterations as i64),
        KeyValue::new("jdeob.changes", stats.changes as i64),
    ];
    attributes.extend(
        stats
            .counters
            .iter()
            .map(|(name, count)| KeyValue::new(format!("jdeob.{name}"), *count as i64)),
    );
    span.add_event("pass.finished", attributes);
}

/// Run `f` inside a span when telemetry is enabled.
pub(crate) fn with_span<T, F>(
    telemetry: Option<&Telemetry>,
    name: &str,
    attributes: &[KeyValue],
    f: F,
) -> T
where
    F: FnOnce() -> T,
{
    match telemetry {
        Some(telemetry) => telemetry.in_span(name, attributes, f),
        None => f(),
    }
}
