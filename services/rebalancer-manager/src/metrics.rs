// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the rebalancer manager

use prometheus::{Counter, CounterVec, Opts, Registry, TextEncoder};

// Metric definitions are constant; a failure here is a programming error.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        /// Registry for all manager metrics
        pub static ref REGISTRY: Registry = Registry::new();

        /// Per-object outcomes, by result label (complete, skipped, error)
        pub static ref OBJECTS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("rebalancer_manager_objects_total", "Objects finished by outcome"),
            &["outcome"]
        ).expect("valid metric name and labels");

        /// Assignments finished, by how they ended
        pub static ref ASSIGNMENTS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("rebalancer_manager_assignments_total", "Assignments by result"),
            &["result"]
        ).expect("valid metric name and labels");

        pub static ref METADATA_CONFLICTS: Counter = Counter::with_opts(
            Opts::new(
                "rebalancer_manager_metadata_conflicts_total",
                "Catalog writes rejected because the record changed underneath"
            )
        ).expect("valid metric name");

        /// Job store writes that failed without stopping the job, e.g. a
        /// result counter that could not be incremented.
        pub static ref DB_OPERATION_FAILURES: CounterVec = CounterVec::new(
            Opts::new(
                "rebalancer_manager_db_operation_failures_total",
                "Total DB operation failures that did not stop the job"
            ),
            &["operation"]
        ).expect("valid metric name and labels");

        pub static ref TASK_PANICS: CounterVec = CounterVec::new(
            Opts::new("rebalancer_manager_task_panics_total", "Panicked job tasks by stage"),
            &["stage"]
        ).expect("valid metric name and labels");
    }
}

pub use metrics_impl::{
    ASSIGNMENTS_TOTAL, DB_OPERATION_FAILURES, METADATA_CONFLICTS, OBJECTS_TOTAL, REGISTRY,
    TASK_PANICS,
};

/// Register all metrics with the registry. Call once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(OBJECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ASSIGNMENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(METADATA_CONFLICTS.clone()))?;
    REGISTRY.register(Box::new(DB_OPERATION_FAILURES.clone()))?;
    REGISTRY.register(Box::new(TASK_PANICS.clone()))?;
    Ok(())
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

/// `outcome` is the top-level result ("complete", "skipped", "error").
pub fn record_object_outcome(outcome: &str) {
    OBJECTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_assignment(result: &str) {
    ASSIGNMENTS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_metadata_conflict() {
    METADATA_CONFLICTS.inc();
}

/// Record a job store write that failed but did not stop the job.
pub fn record_db_operation_failure(operation: &str) {
    DB_OPERATION_FAILURES.with_label_values(&[operation]).inc();
}

pub fn record_task_panic(stage: &str) {
    TASK_PANICS.with_label_values(&[stage]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_operation_failure_counter() {
        let counter = DB_OPERATION_FAILURES.with_label_values(&["increment_result"]);
        let before = counter.get();
        record_db_operation_failure("increment_result");
        record_db_operation_failure("increment_result");
        assert_eq!(counter.get() - before, 2.0);
    }

    #[test]
    fn test_outcome_counters() {
        let before = OBJECTS_TOTAL.with_label_values(&["skipped"]).get();
        record_object_outcome("skipped");
        assert_eq!(OBJECTS_TOTAL.with_label_values(&["skipped"]).get() - before, 1.0);

        let before = TASK_PANICS.with_label_values(&["metadata"]).get();
        record_task_panic("metadata");
        assert_eq!(TASK_PANICS.with_label_values(&["metadata"]).get() - before, 1.0);
    }
}
