//! Metrics definitions for the control node.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cn_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `reason`: handshake error labels (7 values)
//! - `outcome`: `success`, `none_eligible`, or a `CallError` label
//! - `kind`: syncer intent kinds (9 values)
//! - `method`: remote proxy methods (7 values)
//! - `actor_type`: `session_manager` or `syncer`

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ============================================================================
// Worker Metrics
// ============================================================================

/// Set the number of registered workers.
///
/// Metric: `cn_workers_connected`
#[allow(clippy::cast_precision_loss)]
pub fn set_workers_connected(count: usize) {
    gauge!("cn_workers_connected").set(count as f64);
}

/// Record a failed worker handshake.
///
/// Metric: `cn_handshake_failures_total`
/// Labels: `reason`
pub fn record_handshake_failure(reason: &str) {
    counter!("cn_handshake_failures_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a worker connection closing.
///
/// Metric: `cn_worker_disconnects_total`
/// Labels: `reason`
pub fn record_worker_disconnect(reason: &str) {
    counter!("cn_worker_disconnects_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record the outcome of a worker selection and binding attempt.
///
/// Metric: `cn_worker_selections_total`
/// Labels: `outcome`
pub fn record_worker_selection(outcome: &str) {
    counter!("cn_worker_selections_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Record an intent processed by a syncer.
///
/// Metric: `cn_syncer_intents_total`
/// Labels: `kind`
pub fn record_syncer_intent(kind: &'static str) {
    counter!("cn_syncer_intents_total",
        "kind" => kind
    )
    .increment(1);
}

/// Set the number of live sessions.
///
/// Metric: `cn_sessions_active`
#[allow(clippy::cast_precision_loss)]
pub fn set_sessions_active(count: usize) {
    gauge!("cn_sessions_active").set(count as f64);
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// A message entered an actor mailbox.
///
/// Metric: `cn_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn record_mailbox_enqueue(actor_type: &'static str) {
    gauge!("cn_actor_mailbox_depth", "actor_type" => actor_type).increment(1.0);
}

/// A message left an actor mailbox.
///
/// Metric: `cn_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn record_mailbox_dequeue(actor_type: &'static str) {
    gauge!("cn_actor_mailbox_depth", "actor_type" => actor_type).decrement(1.0);
}

/// Metric: `cn_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("cn_actor_panics_total", "actor_type" => actor_type).increment(1);
}

// ============================================================================
// Remote Call Metrics
// ============================================================================

/// Record a call made through a remote proxy.
///
/// Metric: `cn_remote_calls_total`, `cn_remote_call_duration_seconds`
/// Labels: `method`, `outcome`
pub fn record_remote_call(method: &str, outcome: &str, duration: Duration) {
    histogram!("cn_remote_call_duration_seconds",
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("cn_remote_calls_total",
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
