//! Observability infrastructure for the forecast poller
//!
//! Provides:
//! - Prometheus metrics (fetch, inference and cycle latency, rows written, model info)
//! - Structured JSON logging with tracing

use crate::scheduler::{CycleReport, CycleStatus};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, GaugeVec, Histogram,
    IntCounter,
};
use std::sync::OnceLock;
use tracing::{debug, error, info};

/// Histogram buckets for cycle phase durations (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PollerMetricsInner> = OnceLock::new();

struct PollerMetricsInner {
    data_latency_seconds: Histogram,
    inference_latency_seconds: Histogram,
    cycle_latency_seconds: Histogram,
    model_info: GaugeVec,
    cycles: IntCounter,
    no_data_cycles: IntCounter,
    cycle_errors: IntCounter,
    rows_written: IntCounter,
}

impl PollerMetricsInner {
    fn new() -> Self {
        Self {
            data_latency_seconds: register_histogram!(
                "forecast_poller_data_latency_seconds",
                "Time spent refreshing the dataset snapshot",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register data_latency_seconds"),

            inference_latency_seconds: register_histogram!(
                "forecast_poller_inference_latency_seconds",
                "Time spent on inference, reshaping and writing",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register inference_latency_seconds"),

            cycle_latency_seconds: register_histogram!(
                "forecast_poller_cycle_latency_seconds",
                "Total duration of a poll cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            model_info: register_gauge_vec!(
                "forecast_poller_model_info",
                "Information about the loaded forecasting model",
                &["class", "mode"]
            )
            .expect("Failed to register model_info"),

            cycles: register_int_counter!(
                "forecast_poller_cycles_total",
                "Total number of completed poll cycles"
            )
            .expect("Failed to register cycles_total"),

            no_data_cycles: register_int_counter!(
                "forecast_poller_no_data_cycles_total",
                "Poll cycles skipped for insufficient history"
            )
            .expect("Failed to register no_data_cycles_total"),

            cycle_errors: register_int_counter!(
                "forecast_poller_cycle_errors_total",
                "Poll cycles that ended in an error"
            )
            .expect("Failed to register cycle_errors_total"),

            rows_written: register_int_counter!(
                "forecast_poller_rows_written_total",
                "Prediction rows written to the sink"
            )
            .expect("Failed to register rows_written_total"),
        }
    }
}

/// Poller metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct PollerMetrics {
    _private: (),
}

impl Default for PollerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PollerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PollerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PollerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record the loaded model class and predict mode
    pub fn set_model_info(&self, class: &str, mode: &str) {
        self.inner().model_info.reset();
        self.inner()
            .model_info
            .with_label_values(&[class, mode])
            .set(1.0);
    }

    /// Record the timings and outcome of one cycle
    pub fn observe_cycle(&self, report: &CycleReport) {
        let inner = self.inner();
        inner.data_latency_seconds.observe(report.dt_data.as_secs_f64());
        inner.cycle_latency_seconds.observe(report.dt_total.as_secs_f64());
        inner.cycles.inc();

        match report.status {
            CycleStatus::NoData => inner.no_data_cycles.inc(),
            CycleStatus::Written { rows } => {
                inner.inference_latency_seconds.observe(report.dt_pred.as_secs_f64());
                inner.rows_written.inc_by(rows as u64);
            }
        }
    }

    pub fn inc_cycle_errors(&self) {
        self.inner().cycle_errors.inc();
    }

    pub fn rows_written(&self) -> u64 {
        self.inner().rows_written.get()
    }
}

/// Structured logger for poller events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log poller startup
    pub fn log_startup(&self, version: &str, model_class: &str, period_secs: f64) {
        info!(
            event = "poller_started",
            instance = %self.instance,
            version = %version,
            model_class = %model_class,
            period_secs = period_secs,
            "Forecast poller started"
        );
    }

    /// Log one finished cycle; at info level when verbose, debug otherwise
    pub fn log_cycle(&self, report: &CycleReport, verbose: bool) {
        let rows = match report.status {
            CycleStatus::Written { rows } => rows,
            CycleStatus::NoData => 0,
        };
        if verbose {
            info!(
                event = "poll_cycle",
                instance = %self.instance,
                status = %report.status,
                rows = rows,
                dt_data_ms = report.dt_data.as_millis() as u64,
                dt_pred_ms = report.dt_pred.as_millis() as u64,
                dt_total_ms = report.dt_total.as_millis() as u64,
                "{}",
                report
            );
        } else {
            debug!(
                event = "poll_cycle",
                instance = %self.instance,
                status = %report.status,
                rows = rows,
                dt_total_ms = report.dt_total.as_millis() as u64,
                "Poll cycle complete"
            );
        }
    }

    /// Log the error that stopped the poll loop
    pub fn log_cycle_failure(&self, error: &anyhow::Error) {
        error!(
            event = "poll_cycle_failed",
            instance = %self.instance,
            error = %format!("{:#}", error),
            "Poll cycle failed, stopping"
        );
    }

    /// Log poller shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "poller_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Forecast poller shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn report(status: CycleStatus) -> CycleReport {
        CycleReport {
            started_at: Utc::now(),
            status,
            dt_data: Duration::from_millis(12),
            dt_pred: Duration::from_millis(34),
            dt_total: Duration::from_millis(46),
        }
    }

    #[test]
    fn test_poller_metrics_observe() {
        let metrics = PollerMetrics::new();
        let before = metrics.rows_written();

        metrics.set_model_info("Baseline", "quantiles");
        metrics.observe_cycle(&report(CycleStatus::NoData));
        metrics.observe_cycle(&report(CycleStatus::Written { rows: 5 }));
        metrics.inc_cycle_errors();

        assert!(metrics.rows_written() >= before + 5);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("poller-1");
        assert_eq!(logger.instance, "poller-1");
        logger.log_cycle(&report(CycleStatus::NoData), true);
        logger.log_cycle(&report(CycleStatus::Written { rows: 1 }), false);
    }
}
