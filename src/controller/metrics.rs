//! Prometheus metrics for the Database operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `database_reconcile_duration_seconds` (histogram): duration of reconcile attempts.
//! - `database_reconcile_errors_total` (counter): failed attempts labeled by error kind.
//! - `database_queue_depth` (gauge): keys waiting in the work queue.
//! - `database_phase` (gauge): 1 for the current phase of each Database, 0 for the others.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::DatabasePhase;

const PHASES: [DatabasePhase; 6] = [
    DatabasePhase::Pending,
    DatabasePhase::Provisioning,
    DatabasePhase::Running,
    DatabasePhase::Degraded,
    DatabasePhase::Deleting,
    DatabasePhase::Failed,
];

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error kind/category, e.g. "kube", "validation", "timeout"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Histogram> =
    // 1ms .. ~32s across 16 buckets.
    Lazy::new(|| Histogram::new(exponential_buckets(0.001, 2.0, 16)));

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_DEPTH: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static DATABASE_PHASE: Lazy<Family<PhaseLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "database_reconcile_duration_seconds",
        "Duration of reconcile attempts in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "database_reconcile_errors",
        "Failed reconcile attempts by error kind",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "database_queue_depth",
        "Keys waiting in the work queue",
        QUEUE_DEPTH.clone(),
    );
    registry.register(
        "database_phase",
        "Current lifecycle phase of each Database",
        DATABASE_PHASE.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(seconds: f64) {
    RECONCILE_DURATION_SECONDS.observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(kind: &str) {
    let labels = ErrorLabels {
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
}

/// Mark `phase` as the current phase of a Database
pub fn set_phase(namespace: &str, name: &str, phase: DatabasePhase) {
    for candidate in PHASES {
        let labels = PhaseLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            phase: candidate.to_string(),
        };
        DATABASE_PHASE
            .get_or_create(&labels)
            .set(i64::from(candidate == phase));
    }
}

/// Drop the phase series of a deleted Database
pub fn clear_phase(namespace: &str, name: &str) {
    for candidate in PHASES {
        let labels = PhaseLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            phase: candidate.to_string(),
        };
        DATABASE_PHASE.remove(&labels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_phase_gauge_marks_only_the_current_phase() {
        set_phase("metrics-test", "orders", DatabasePhase::Running);

        let running = PhaseLabels {
            namespace: "metrics-test".to_string(),
            name: "orders".to_string(),
            phase: "Running".to_string(),
        };
        let pending = PhaseLabels {
            phase: "Pending".to_string(),
            ..running.clone()
        };
        assert_eq!(DATABASE_PHASE.get_or_create(&running).get(), 1);
        assert_eq!(DATABASE_PHASE.get_or_create(&pending).get(), 0);

        clear_phase("metrics-test", "orders");
    }

    #[test]
    fn test_registry_encodes_operator_metrics() {
        inc_reconcile_error("timeout");
        set_queue_depth(3);

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();
        assert!(buffer.contains("database_reconcile_errors_total"));
        assert!(buffer.contains("database_queue_depth"));
    }
}
