//! Observability infrastructure for the exporter itself
//!
//! Provides:
//! - Prometheus self metrics (cycle latency, discovered entities, source failures)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};

/// Histogram buckets for cycle latency (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ExporterMetricsInner> = OnceLock::new();

struct ExporterMetricsInner {
    cycle_duration_seconds: Histogram,
    cycles_total: IntCounter,
    cycle_failures_total: IntCounter,
    jobs_discovered: IntGauge,
    processes_discovered: IntGauge,
    source_failures_total: IntCounterVec,
    unresolved_gpu_processes_total: IntCounter,
}

impl ExporterMetricsInner {
    fn new() -> Self {
        Self {
            cycle_duration_seconds: register_histogram!(
                "exporter_cycle_duration_seconds",
                "Time spent in one collection cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            cycles_total: register_int_counter!(
                "exporter_cycles_total",
                "Total number of committed collection cycles"
            )
            .expect("Failed to register cycles_total"),

            cycle_failures_total: register_int_counter!(
                "exporter_cycle_failures_total",
                "Total number of aborted collection cycles"
            )
            .expect("Failed to register cycle_failures_total"),

            jobs_discovered: register_int_gauge!(
                "exporter_jobs_discovered",
                "Number of live jobs found in the last walk"
            )
            .expect("Failed to register jobs_discovered"),

            processes_discovered: register_int_gauge!(
                "exporter_processes_discovered",
                "Number of job processes found in the last walk"
            )
            .expect("Failed to register processes_discovered"),

            source_failures_total: register_int_counter_vec!(
                "exporter_source_failures_total",
                "Total number of failed external queries",
                &["source"]
            )
            .expect("Failed to register source_failures_total"),

            unresolved_gpu_processes_total: register_int_counter!(
                "exporter_unresolved_gpu_processes_total",
                "Total number of GPU processes not owned by any live job"
            )
            .expect("Failed to register unresolved_gpu_processes_total"),
        }
    }
}

/// Exporter self metrics
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ExporterMetrics {
    _private: (),
}

impl Default for ExporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExporterMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ExporterMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ExporterMetricsInner {
        GLOBAL_METRICS.get_or_init(ExporterMetricsInner::new)
    }

    pub fn observe_cycle(&self, duration_secs: f64) {
        self.inner().cycle_duration_seconds.observe(duration_secs);
        self.inner().cycles_total.inc();
    }

    pub fn inc_cycle_failures(&self) {
        self.inner().cycle_failures_total.inc();
    }

    pub fn set_discovered(&self, jobs: usize, processes: usize) {
        self.inner().jobs_discovered.set(jobs as i64);
        self.inner().processes_discovered.set(processes as i64);
    }

    pub fn inc_source_failure(&self, source: &str) {
        self.inner()
            .source_failures_total
            .with_label_values(&[source])
            .inc();
    }

    pub fn add_unresolved_gpu_processes(&self, count: usize) {
        self.inner()
            .unresolved_gpu_processes_total
            .inc_by(count as u64);
    }
}

/// Structured logger for exporter events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log exporter startup
    pub fn log_startup(&self, version: &str, listen_port: u16) {
        info!(
            event = "exporter_started",
            node = %self.node_name,
            version = %version,
            listen_port = listen_port,
            "Job metrics exporter started"
        );
    }

    /// Log exporter shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Job metrics exporter shutting down"
        );
    }

    pub fn log_cycle_complete(
        &self,
        cycle: u64,
        jobs: usize,
        processes: usize,
        series: usize,
        elapsed_ms: u128,
    ) {
        debug!(
            event = "cycle_complete",
            node = %self.node_name,
            cycle = cycle,
            jobs = jobs,
            processes = processes,
            series = series,
            elapsed_ms = elapsed_ms,
            "Collection cycle committed"
        );
    }

    /// Cycle aborted, the previous snapshot stays published
    pub fn log_cycle_failed(&self, reason: &str) {
        error!(
            event = "cycle_failed",
            node = %self.node_name,
            reason = %reason,
            "Collection cycle aborted, keeping previous snapshot"
        );
    }

    pub fn log_source_unavailable(&self, source: &str, reason: &str) {
        warn!(
            event = "source_unavailable",
            node = %self.node_name,
            source = %source,
            reason = %reason,
            "Data source unavailable, reconciling its series to zero"
        );
    }

    pub fn log_textfile_failure(&self, path: &str, reason: &str) {
        warn!(
            event = "textfile_write_failed",
            node = %self.node_name,
            path = %path,
            reason = %reason,
            "Failed to write textfile collector output"
        );
    }
}
