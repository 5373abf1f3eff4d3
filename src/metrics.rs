use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Metric name prefix for all archiver metrics
const PREFIX: &str = "media_archiver";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Queue Metrics
    pub static ref QUEUE_MESSAGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_queue_messages_total"), "Total queue messages handled"),
        &["queue"]
    ).expect("Failed to create queue_messages_total metric");

    pub static ref QUEUE_MESSAGE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_queue_message_duration_seconds"),
            "Time spent handling one queue message"
        )
        .buckets(vec![0.1, 1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 14400.0]),
        &["queue"]
    ).expect("Failed to create queue_message_duration_seconds metric");

    // Worker Metrics
    pub static ref WORKER_OUTCOMES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_worker_outcomes_total"), "Worker job outcomes"),
        &["worker", "outcome"]
    ).expect("Failed to create worker_outcomes_total metric");

    pub static ref TRANSFER_BYTES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_transfer_bytes_total"), "Bytes moved to or from the object store"),
        &["direction"]
    ).expect("Failed to create transfer_bytes_total metric");

    // Background Job Metrics
    pub static ref BACKGROUND_JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_background_job_executions_total"), "Background job executions"),
        &["job_id", "status"]
    ).expect("Failed to create background_job_executions_total metric");

    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_background_job_duration_seconds"),
            "Background job duration in seconds"
        )
        .buckets(vec![0.1, 1.0, 10.0, 60.0, 300.0, 900.0]),
        &["job_id"]
    ).expect("Failed to create background_job_duration_seconds metric");

    pub static ref BACKGROUND_JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_background_job_running"), "1 while a background job runs"),
        &["job_id"]
    ).expect("Failed to create background_job_running metric");

    pub static ref LIBRARIES_TOTAL: Gauge = Gauge::new(
        format!("{PREFIX}_libraries_total"),
        "Number of configured libraries"
    ).expect("Failed to create libraries_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(QUEUE_MESSAGES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_MESSAGE_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(WORKER_OUTCOMES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TRANSFER_BYTES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(LIBRARIES_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_queue_message(queue: &str, duration: Duration) {
    QUEUE_MESSAGES_TOTAL.with_label_values(&[queue]).inc();
    QUEUE_MESSAGE_DURATION_SECONDS
        .with_label_values(&[queue])
        .observe(duration.as_secs_f64());
}

/// Record how a worker job ended ("succeeded", "failed", "cancelled", ...)
pub fn record_worker_outcome(worker: &str, outcome: &str) {
    WORKER_OUTCOMES_TOTAL
        .with_label_values(&[worker, outcome])
        .inc();
}

pub fn record_transfer_bytes(direction: &str, bytes: u64) {
    TRANSFER_BYTES_TOTAL
        .with_label_values(&[direction])
        .inc_by(bytes as f64);
}

/// Record a background job run ("success", "failed", "cancelled", "panic")
pub fn record_background_job_execution(job_id: &str, status: &str, duration: Duration) {
    BACKGROUND_JOB_EXECUTIONS_TOTAL
        .with_label_values(&[job_id, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_id])
        .observe(duration.as_secs_f64());
}

pub fn set_background_job_running(job_id: &str, running: bool) {
    BACKGROUND_JOB_RUNNING
        .with_label_values(&[job_id])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn set_libraries_total(count: usize) {
    LIBRARIES_TOTAL.set(count as f64);
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Serve `/metrics` on `port` until `shutdown` fires.
pub async fn run_metrics_server(port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Metrics available at port {}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
