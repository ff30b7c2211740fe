// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for plan-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `plan_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: create, get, replace, patch, delete
//! - `outcome`: success, not_found, conflict, precondition_failed, ...
//! - `event`: create_plan, update_service, ... (see `ChangeEvent::label`)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// REPOSITORY - Primary store operations
// ═══════════════════════════════════════════════════════════════════════════

/// Record a repository operation and how it ended
pub fn record_operation(operation: &str, outcome: &str) {
    counter!(
        "plan_sync_operations_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record repository operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "plan_sync_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// PUBLISH - Change events handed to the queue
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_published(event: &str) {
    counter!(
        "plan_sync_events_published_total",
        "event" => event.to_string()
    )
    .increment(1);
}

pub fn record_publish_failure(event: &str) {
    counter!(
        "plan_sync_publish_failures_total",
        "event" => event.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// WORKER - Index sync
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_applied(event: &str) {
    counter!(
        "plan_sync_events_applied_total",
        "event" => event.to_string()
    )
    .increment(1);
}

pub fn record_requeued(event: &str) {
    counter!(
        "plan_sync_events_requeued_total",
        "event" => event.to_string()
    )
    .increment(1);
}

/// Record a dead-lettered delivery (`reason`: malformed, exhausted)
pub fn record_dead_lettered(reason: &str) {
    counter!(
        "plan_sync_events_dead_lettered_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record time spent applying one event to the index
pub fn record_apply_latency(event: &str, duration: Duration) {
    histogram!(
        "plan_sync_apply_seconds",
        "event" => event.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record deliveries returned to the queue on worker start
pub fn record_recovered(count: usize) {
    counter!("plan_sync_deliveries_recovered_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND HEALTH
// ═══════════════════════════════════════════════════════════════════════════

/// Record a connection/backend error
pub fn record_connection_error(backend: &str) {
    counter!(
        "plan_sync_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Set service state (for monitoring lifecycle transitions)
pub fn set_service_state(state: &str) {
    counter!(
        "plan_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Set worker liveness (1 = running, 0 = stopped)
pub fn set_worker_running(running: bool) {
    gauge!("plan_sync_worker_running").set(if running { 1.0 } else { 0.0 });
}

/// A timing guard that records repository latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_record_operation_counts() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_operation("create", "success");
            record_operation("create", "success");
            record_operation("create", "conflict");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let success = snapshot
            .into_iter()
            .find(|(key, _, _, _)| {
                key.key().name() == "plan_sync_operations_total"
                    && key.key().labels().any(|l| l.key() == "outcome" && l.value() == "success")
            })
            .map(|(_, _, _, value)| value);
        assert_eq!(success, Some(DebugValue::Counter(2)));
    }

    #[test]
    fn test_latency_timer_records_on_drop() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let _timer = LatencyTimer::new("get");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert!(snapshot
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "plan_sync_operation_seconds"));
    }

    #[test]
    fn test_worker_metrics() {
        record_applied("create_plan");
        record_requeued("update_service");
        record_dead_lettered("malformed");
        record_apply_latency("delete_plan", Duration::from_millis(3));
        record_recovered(2);
        set_worker_running(true);
        set_service_state("Running");
    }
}
