//! Observability infrastructure for pidfinder
//!
//! Provides:
//! - Prometheus metrics (records known/added, runtime errors, cycle and save latency)
//! - Text-format export of those metrics to a file for node-exporter's textfile collector
//! - Structured JSON logging of domain events with tracing

use crate::store::write_atomic;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram,
    IntCounter, IntGauge, TextEncoder,
};
use std::io;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

/// Histogram buckets for cycle and save durations (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ObserverMetricsInner> = OnceLock::new();

struct ObserverMetricsInner {
    known_records: IntGauge,
    records_added: IntCounter,
    cycles: IntCounter,
    list_errors: IntCounter,
    inspect_errors: IntCounter,
    save_failures: IntCounter,
    cycle_duration_seconds: Histogram,
    save_duration_seconds: Histogram,
}

impl ObserverMetricsInner {
    fn new() -> Self {
        Self {
            known_records: register_int_gauge!(
                "pidfinder_known_records",
                "Number of container observations in the record file"
            )
            .expect("Failed to register known_records"),

            records_added: register_int_counter!(
                "pidfinder_records_added_total",
                "Container observations recorded since start"
            )
            .expect("Failed to register records_added"),

            cycles: register_int_counter!(
                "pidfinder_poll_cycles_total",
                "Completed poll cycles"
            )
            .expect("Failed to register cycles"),

            list_errors: register_int_counter!(
                "pidfinder_list_errors_total",
                "Failed container list calls"
            )
            .expect("Failed to register list_errors"),

            inspect_errors: register_int_counter!(
                "pidfinder_inspect_errors_total",
                "Failed or timed out container inspect calls"
            )
            .expect("Failed to register inspect_errors"),

            save_failures: register_int_counter!(
                "pidfinder_save_failures_total",
                "Record file writes that failed after all retries"
            )
            .expect("Failed to register save_failures"),

            cycle_duration_seconds: register_histogram!(
                "pidfinder_poll_cycle_duration_seconds",
                "Time spent listing and inspecting containers in one cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            save_duration_seconds: register_histogram!(
                "pidfinder_save_duration_seconds",
                "Time spent rewriting the record file",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register save_duration_seconds"),
        }
    }
}

/// Handle to the process-wide observer metrics
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct ObserverMetrics {
    _private: (),
}

impl Default for ObserverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverMetrics {
    /// Create a new metrics handle (registers global metrics on first call)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ObserverMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ObserverMetricsInner {
        GLOBAL_METRICS.get_or_init(ObserverMetricsInner::new)
    }

    pub fn set_known_records(&self, count: usize) {
        self.inner().known_records.set(count as i64);
    }

    pub fn inc_records_added(&self) {
        self.inner().records_added.inc();
    }

    pub fn inc_cycles(&self) {
        self.inner().cycles.inc();
    }

    pub fn inc_list_errors(&self) {
        self.inner().list_errors.inc();
    }

    pub fn inc_inspect_errors(&self) {
        self.inner().inspect_errors.inc();
    }

    pub fn inc_save_failures(&self) {
        self.inner().save_failures.inc();
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.inner().cycle_duration_seconds.observe(duration_secs);
    }

    pub fn observe_save_duration(&self, duration_secs: f64) {
        self.inner().save_duration_seconds.observe(duration_secs);
    }

    /// Encode every registered metric in the Prometheus text format
    pub fn encode_text(&self) -> io::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buffer)
    }

    /// Atomically replace `path` with the current metrics
    pub fn write_textfile(&self, path: &Path) -> io::Result<()> {
        let buffer = self.encode_text()?;
        write_atomic(path, &buffer)
    }
}

/// Structured logger for pidfinder events
#[derive(Clone)]
pub struct StructuredLogger {
    destination: String,
}

impl StructuredLogger {
    pub fn new(destination: &Path) -> Self {
        Self {
            destination: destination.display().to_string(),
        }
    }

    pub fn log_startup(&self, version: &str, schema: &str, include_stopped: bool) {
        info!(
            event = "pidfinder_started",
            destination = %self.destination,
            version = %version,
            schema = %schema,
            include_stopped = include_stopped,
            "pidfinder started"
        );
    }

    pub fn log_seeded(&self, records: usize) {
        info!(
            event = "known_set_seeded",
            destination = %self.destination,
            records = records,
            "Seeded known containers from record file"
        );
    }

    pub fn log_new_record(&self, pid: i64, pod_name: &str, container_name: &str) {
        info!(
            event = "container_recorded",
            destination = %self.destination,
            pid = pid,
            pod_name = %pod_name,
            container_name = %container_name,
            "New pod written"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "pidfinder_shutdown",
            destination = %self.destination,
            reason = %reason,
            "pidfinder shutting down"
        );
    }
}
