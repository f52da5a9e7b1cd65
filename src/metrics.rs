use crate::status::JobStatus;
use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

/// Metric name prefix for all pipeline metrics
const PREFIX: &str = "pipeline";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Queue Metrics
    pub static ref JOBS_QUEUED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_queued_total"),
        "Total number of jobs added to the queue"
    ).expect("Failed to create jobs_queued_total metric");

    pub static ref JOBS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_finished_total"), "Jobs leaving a worker, by status"),
        &["status"]
    ).expect("Failed to create jobs_finished_total metric");

    pub static ref JOBS_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_jobs_running"),
        "Number of jobs currently running"
    ).expect("Failed to create jobs_running metric");

    // Split/Join Metrics
    pub static ref SPLIT_CHILDREN: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_split_children"),
            "Number of children created per split"
        )
        .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 50.0, 100.0, 500.0])
    ).expect("Failed to create split_children metric");

    pub static ref JOINS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_joins_total"), "Child joins, by outcome"),
        &["outcome"]
    ).expect("Failed to create joins_total metric");

    // Notification Metrics
    pub static ref NOTIFICATIONS_SENT_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_notifications_sent_total"), "Digest emails sent"),
        &["kind", "result"]
    ).expect("Failed to create notifications_sent_total metric");
}

pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOBS_QUEUED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(SPLIT_CHILDREN.clone()));
    let _ = REGISTRY.register(Box::new(JOINS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(NOTIFICATIONS_SENT_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_job_queued() {
    JOBS_QUEUED_TOTAL.inc();
}

pub fn record_job_finished(status: JobStatus) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn set_jobs_running(count: usize) {
    JOBS_RUNNING.set(count as f64);
}

pub fn record_split(children: usize) {
    SPLIT_CHILDREN.observe(children as f64);
}

pub fn record_join(outcome: &str) {
    JOINS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_notification(kind: &str, success: bool) {
    let result = if success { "sent" } else { "failed" };
    NOTIFICATIONS_SENT_TOTAL
        .with_label_values(&[kind, result])
        .inc();
}

/// Text exposition of every registered metric.
pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
