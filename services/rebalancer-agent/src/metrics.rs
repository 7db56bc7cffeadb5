// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the rebalancer agent

use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

// Metric definitions are constant; a failure here is a programming error.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref REGISTRY: Registry = Registry::new();

        /// Bytes written to verified objects
        pub static ref BYTES_TOTAL: Counter = Counter::with_opts(
            Opts::new("rebalancer_agent_bytes_downloaded_total", "Bytes downloaded and verified")
        ).expect("valid metric name");

        /// Tasks finished, by status (completed, skipped, failed)
        pub static ref OBJECTS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("rebalancer_agent_objects_total", "Tasks finished by status"),
            &["status"]
        ).expect("valid metric name and labels");

        /// Failed tasks by reason label
        pub static ref ERRORS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("rebalancer_agent_errors_total", "Failed tasks by reason"),
            &["error_type"]
        ).expect("valid metric name and labels");

        pub static ref ASSIGNMENT_DURATION: Histogram = Histogram::with_opts(
            HistogramOpts::new(
                "rebalancer_agent_assignment_duration_seconds",
                "Assignment completion time in seconds"
            )
            .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0])
        ).expect("valid histogram opts");

        /// Temp files that could not be removed
        pub static ref CLEANUP_FAILURES: Counter = Counter::with_opts(
            Opts::new(
                "rebalancer_agent_cleanup_failures_total",
                "Temp files that could not be removed"
            )
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{
    ASSIGNMENT_DURATION, BYTES_TOTAL, CLEANUP_FAILURES, ERRORS_TOTAL, OBJECTS_TOTAL, REGISTRY,
};

/// Register all metrics with the registry. Call once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(BYTES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OBJECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ASSIGNMENT_DURATION.clone()))?;
    REGISTRY.register(Box::new(CLEANUP_FAILURES.clone()))?;
    Ok(())
}

/// Metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

pub fn record_object_completed(bytes: u64) {
    BYTES_TOTAL.inc_by(bytes as f64);
    OBJECTS_TOTAL.with_label_values(&["completed"]).inc();
}

pub fn record_object_failed(reason: &str) {
    OBJECTS_TOTAL.with_label_values(&["failed"]).inc();
    ERRORS_TOTAL.with_label_values(&[reason]).inc();
}

/// A verified copy was already in place.
pub fn record_object_skipped() {
    OBJECTS_TOTAL.with_label_values(&["skipped"]).inc();
}

pub fn record_assignment_duration(duration_secs: f64) {
    ASSIGNMENT_DURATION.observe(duration_secs);
}

pub fn record_cleanup_failure() {
    CLEANUP_FAILURES.inc();
}
