//! Prometheus metrics for the tag invalidation service.
//!
//! This module provides:
//! - Purge request metrics (accepted/rejected, tags received)
//! - Sweep metrics (count, duration, evictions and errors per backend)
//! - Pending tag gauge

use std::sync::OnceLock;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tagsweep_core::{InvalidationScheduler, SweepReport};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Request metrics
    pub const PURGE_REQUESTS_TOTAL: &str = "cache_tag_purge_requests_total";
    pub const PURGE_TAGS_TOTAL: &str = "cache_tag_purge_tags_total";

    // Sweep metrics
    pub const SWEEPS_TOTAL: &str = "cache_tag_sweeps_total";
    pub const SWEEP_DURATION_SECONDS: &str = "cache_tag_sweep_duration_seconds";
    pub const SWEEP_EVICTIONS_TOTAL: &str = "cache_tag_sweep_evictions_total";
    pub const SWEEP_SCANNED_TOTAL: &str = "cache_tag_sweep_scanned_total";
    pub const SWEEP_ERRORS_TOTAL: &str = "cache_tag_sweep_errors_total";

    // Buffer metrics
    pub const PENDING_TAGS: &str = "cache_tag_pending";
}

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at server startup.
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Use install_recorder() for pull-based metrics (we serve /metrics ourselves)
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record a purge request and its outcome ("accepted", "rejected", "peer").
pub fn record_purge_request(outcome: &str, tags: usize) {
    counter!(names::PURGE_REQUESTS_TOTAL, "outcome" => outcome.to_string()).increment(1);
    counter!(names::PURGE_TAGS_TOTAL, "outcome" => outcome.to_string()).increment(tags as u64);
}

/// Set the number of tags waiting for the next sweep.
pub fn set_pending_tags(count: usize) {
    gauge!(names::PENDING_TAGS).set(count as f64);
}

/// Record a completed sweep.
pub fn record_sweep(report: &SweepReport) {
    counter!(names::SWEEPS_TOTAL, "trigger" => report.trigger.to_string()).increment(1);
    histogram!(names::SWEEP_DURATION_SECONDS).record(report.duration.as_secs_f64());

    for backend in &report.backends {
        counter!(names::SWEEP_SCANNED_TOTAL, "backend" => backend.backend.clone())
            .increment(backend.scanned as u64);
        counter!(names::SWEEP_EVICTIONS_TOTAL, "backend" => backend.backend.clone())
            .increment(backend.evicted as u64);
        if backend.errors > 0 {
            counter!(names::SWEEP_ERRORS_TOTAL, "backend" => backend.backend.clone())
                .increment(backend.errors as u64);
        }
    }
}

/// Record every sweep the scheduler completes, for as long as it lives.
pub fn spawn_sweep_recorder(scheduler: &InvalidationScheduler) -> JoinHandle<()> {
    let mut reports = scheduler.subscribe();
    let scheduler = scheduler.clone();

    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => {
                    record_sweep(&report);
                    set_pending_tags(scheduler.pending_len());
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "sweep metrics recorder lagged; reports dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
