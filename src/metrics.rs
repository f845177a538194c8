// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for message-ingest.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `message_ingest_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: facade operation name (`stage_batch`, `sync_scope`, ...)
//! - `status`: success, error, invalid, cancelled, rate_limited

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a facade operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "message_ingest_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "message_ingest_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records accepted into staging as Pending
pub fn record_staged(kind: &str, count: usize) {
    counter!("message_ingest_staged_total", "kind" => kind.to_string()).increment(count as u64);
}

/// Records recognised as duplicates (skipped or staged as Duplicate)
pub fn record_duplicates(kind: &str, count: usize) {
    counter!("message_ingest_duplicates_total", "kind" => kind.to_string()).increment(count as u64);
}

/// Staged rows moved to Completed
pub fn record_committed(kind: &str, count: usize) {
    counter!("message_ingest_committed_total", "kind" => kind.to_string()).increment(count as u64);
}

/// Staged rows moved to Failed
pub fn record_commit_failed(kind: &str, count: usize) {
    counter!("message_ingest_commit_failed_total", "kind" => kind.to_string()).increment(count as u64);
}

/// Expired claims moved out of Processing
pub fn record_claims_recovered(kind: &str, count: usize) {
    counter!("message_ingest_claims_recovered_total", "kind" => kind.to_string()).increment(count as u64);
}

/// Size of one claimed commit batch
pub fn record_batch_size(kind: &str, count: usize) {
    histogram!("message_ingest_batch_size", "kind" => kind.to_string()).record(count as f64);
}

/// Records counted by a sync pass
pub fn record_synced(count: usize) {
    counter!("message_ingest_synced_total").increment(count as u64);
}

/// Checkpoint watermark moved
pub fn record_checkpoint_advance() {
    counter!("message_ingest_checkpoint_advances_total").increment(1);
}

/// Soft-deleted records
pub fn record_deleted(count: usize) {
    counter!("message_ingest_deleted_total").increment(count as u64);
}

/// A consume was denied by the token bucket
pub fn record_rate_limited() {
    counter!("message_ingest_rate_limited_total").increment(1);
}

/// Time a caller was held back before getting a token
pub fn record_backpressure_wait(waited: Duration) {
    histogram!("message_ingest_backpressure_wait_seconds").record(waited.as_secs_f64());
}

/// Current token count
pub fn set_tokens_available(tokens: f64) {
    gauge!("message_ingest_tokens_available").set(tokens);
}

/// Retry attempt scheduled
pub fn record_retry(operation: &str) {
    counter!(
        "message_ingest_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Retries exhausted; the error is surfaced
pub fn record_retry_exhausted(operation: &str) {
    counter!(
        "message_ingest_retries_exhausted_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Flag the engine state (for dashboards); 1 while current, 0 otherwise
pub fn set_engine_state(state: &str, current: bool) {
    gauge!(
        "message_ingest_engine_state",
        "state" => state.to_string()
    )
    .set(if current { 1.0 } else { 0.0 });
}

/// A timing guard that records latency on drop
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
