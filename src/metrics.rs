// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the storage tier.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding service is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `cdn_storage_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size counters
//!
//! # Labels
//! - `unit`: storage unit name (or `buffer`)
//! - `operation`: write, read, exists, add
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record an operation against a unit or the buffer
pub fn record_operation(unit: &str, operation: &str, status: &str) {
    counter!(
        "cdn_storage_operations_total",
        "unit" => unit.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(unit: &str, operation: &str, duration: Duration) {
    histogram!(
        "cdn_storage_operation_seconds",
        "unit" => unit.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_bytes_written(unit: &str, bytes: usize) {
    counter!(
        "cdn_storage_bytes_written_total",
        "unit" => unit.to_string()
    )
    .increment(bytes as u64);
}

pub fn record_bytes_read(unit: &str, bytes: usize) {
    counter!(
        "cdn_storage_bytes_read_total",
        "unit" => unit.to_string()
    )
    .increment(bytes as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// RESYNC
// ═══════════════════════════════════════════════════════════════════════════

/// Record the outcome of one resync pass over a unit
pub fn record_resync_pass(unit: &str, discovered: usize, synced: usize, failed: usize, duration: Duration) {
    counter!("cdn_storage_resync_passes_total", "unit" => unit.to_string()).increment(1);
    counter!("cdn_storage_resync_items_synced_total", "unit" => unit.to_string()).increment(synced as u64);
    counter!("cdn_storage_resync_items_failed_total", "unit" => unit.to_string()).increment(failed as u64);
    gauge!("cdn_storage_resync_backlog", "unit" => unit.to_string()).set(discovered.saturating_sub(synced) as f64);
    histogram!("cdn_storage_resync_pass_seconds", "unit" => unit.to_string()).record(duration.as_secs_f64());
}

/// Record a pass that aborted before processing items
pub fn record_resync_abort(unit: &str, reason: &str) {
    counter!(
        "cdn_storage_resync_aborts_total",
        "unit" => unit.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Current backoff applied to a unit's resync loop (0 when healthy)
pub fn set_resync_backoff(unit: &str, backoff: Duration) {
    gauge!("cdn_storage_resync_backoff_seconds", "unit" => unit.to_string()).set(backoff.as_secs_f64());
}

pub fn record_timeout(unit: &str, operation: &str) {
    counter!(
        "cdn_storage_timeouts_total",
        "unit" => unit.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// INTEGRITY
// ═══════════════════════════════════════════════════════════════════════════

/// Record a signature, decryption or content-hash failure
pub fn record_integrity_failure(source: &str) {
    counter!(
        "cdn_storage_integrity_failures_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Set the units orchestrator state (exposed as a labelled gauge)
pub fn set_units_state(state: &str) {
    for s in ["Initialized", "Running", "ShuttingDown", "Stopped"] {
        gauge!("cdn_storage_units_state", "state" => s).set(if s == state { 1.0 } else { 0.0 });
    }
}

/// Number of storage units currently loaded
pub fn set_units_loaded(count: usize) {
    gauge!("cdn_storage_units_loaded").set(count as f64);
}

/// A configured unit was left out because its driver failed to initialize
pub fn record_unit_init_failure(unit: &str, kind: &str) {
    counter!(
        "cdn_storage_unit_init_failures_total",
        "unit" => unit.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// 1 while the unit's last resync pass reached its backend, 0 after a fatal error
pub fn set_backend_healthy(unit: &str, healthy: bool) {
    gauge!("cdn_storage_backend_healthy", "unit" => unit.to_string()).set(if healthy { 1.0 } else { 0.0 });
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    unit: String,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(unit: impl Into<String>, operation: &'static str) -> Self {
        Self {
            unit: unit.into(),
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(&self.unit, self.operation, self.start.elapsed());
    }
}
