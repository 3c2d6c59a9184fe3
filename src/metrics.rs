//! Prometheus metrics for the manager and its runnables
//!
//! All collectors live in one registry that the probe server encodes on
//! `/metrics`:
//! - Runnable lifecycle (starts, failures)
//! - Leader election status
//! - Interval logger heartbeats
//! - Reconcile outcomes per controller

use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "controller_samples";

/// Registry holding every collector below
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(RUNNABLE_STARTS_TOTAL.clone()),
        Box::new(RUNNABLE_FAILURES_TOTAL.clone()),
        Box::new(LEADER_STATUS.clone()),
        Box::new(INTERVAL_LOGGER_MESSAGES_TOTAL.clone()),
        Box::new(RECONCILE_TOTAL.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            tracing::error!(error = %e, "failed to register collector");
        }
    }
    registry
});

// ============================================================================
// Runnable Lifecycle
// ============================================================================

/// Counter of runnable starts
///
/// Labels:
/// - `runnable`: registered runnable name
pub static RUNNABLE_STARTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "runnable_starts_total",
        "Total number of runnables started by the manager",
        &["runnable"],
    )
});

/// Counter of runnables that returned an error or panicked
///
/// Labels:
/// - `runnable`: registered runnable name
pub static RUNNABLE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "runnable_failures_total",
        "Total number of runnables that stopped with an error",
        &["runnable"],
    )
});

// ============================================================================
// Leader Election
// ============================================================================

/// 1 while this process holds the leader lease, 0 otherwise
pub static LEADER_STATUS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new("leader_status", "Whether this process currently holds the leader lease")
            .namespace(NAMESPACE),
    )
    .unwrap_or_else(|e| panic!("invalid leader_status metric definition: {e}"))
});

// ============================================================================
// Runnables
// ============================================================================

/// Counter of interval logger heartbeat messages
///
/// Labels:
/// - `name`: logger name (the pod name in production)
pub static INTERVAL_LOGGER_MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "interval_logger_messages_total",
        "Total number of heartbeat messages emitted by interval loggers",
        &["name"],
    )
});

/// Counter of reconcile outcomes
///
/// Labels:
/// - `controller`: controller name
/// - `result`: success, error
pub static RECONCILE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "reconcile_total",
        "Total number of reconciliations by controller and result",
        &["controller", "result"],
    )
});

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
        .unwrap_or_else(|e| panic!("invalid {name} metric definition: {e}"))
}

/// Encode every registered metric in the Prometheus text format
pub fn encode() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&REGISTRY.gather())
}
