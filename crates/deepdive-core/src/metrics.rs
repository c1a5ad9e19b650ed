use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct ResearchMetrics {
    backend_calls: Counter<u64>,
    passages: Counter<u64>,
    session_duration_ms: Histogram<f64>,
}

static METRICS: OnceCell<ResearchMetrics> = OnceCell::new();

fn handles() -> &'static ResearchMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("deepdive.research");
        ResearchMetrics {
            backend_calls: meter
                .u64_counter("deepdive_backend_calls_total")
                .with_description("Search backend calls by engine and status")
                .init(),
            passages: meter
                .u64_counter("deepdive_passages_total")
                .with_description("Extracted passages by filter verdict")
                .init(),
            session_duration_ms: meter
                .f64_histogram("deepdive_session_duration_ms")
                .with_description("Research session wall time in milliseconds")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("DEEPDIVE_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "DEEPDIVE_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export research metrics."
        );
    }
}

/// Count one backend call; `status` is `ok` or a `BackendError` label.
pub fn record_backend_call(engine: &str, status: &str) {
    handles().backend_calls.add(
        1,
        &[
            KeyValue::new("engine", engine.to_string()),
            KeyValue::new("status", status.to_string()),
        ],
    );
}

pub fn record_passage(verdict: &str) {
    handles()
        .passages
        .add(1, &[KeyValue::new("verdict", verdict.to_string())]);
}

pub fn record_session(stop_reason: &str, duration_ms: u64) {
    handles().session_duration_ms.record(
        duration_ms as f64,
        &[KeyValue::new("stop_reason", stop_reason.to_string())],
    );
}
