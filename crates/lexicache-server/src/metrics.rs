//! Prometheus metrics for the cache coordination layer.
//!
//! This module provides:
//! - HTTP request metrics (count, latency)
//! - Tier metrics (hits by tier, misses, degraded operations, latency)
//! - Local tier occupancy and evictions
//! - Write-behind, invalidation, warming and health gauges/counters

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

    // Coordinator metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_DEGRADED_TOTAL: &str = "cache_degraded_operations_total";
    pub const CACHE_OPERATION_DURATION_SECONDS: &str = "cache_operation_duration_seconds";

    // Local tier metrics
    pub const LOCAL_ENTRIES: &str = "cache_local_entries";
    pub const LOCAL_BYTES: &str = "cache_local_bytes";
    pub const LOCAL_EVICTIONS_TOTAL: &str = "cache_local_evictions_total";

    // Entry store metrics
    pub const ENTRY_STORE_ERRORS_TOTAL: &str = "cache_entry_store_errors_total";
    pub const NODE_HEALTH_TRANSITIONS_TOTAL: &str = "cache_node_health_transitions_total";
    pub const WRITE_BEHIND_QUEUE_DEPTH: &str = "cache_write_behind_queue_depth";
    pub const WRITE_BEHIND_DROPPED_TOTAL: &str = "cache_write_behind_dropped_total";
    pub const WRITE_BEHIND_FAILED_TOTAL: &str = "cache_write_behind_failed_total";

    // Compression metrics
    pub const DEDUP_HITS_TOTAL: &str = "cache_dedup_hits_total";
    pub const COMPRESSED_WRITES_TOTAL: &str = "cache_compressed_writes_total";

    // Invalidation / warming
    pub const INVALIDATION_EVENTS_TOTAL: &str = "cache_invalidation_events_total";
    pub const INVALIDATION_FAILED_TOTAL: &str = "cache_invalidation_failed_total";
    pub const WARMING_KEYS_TOTAL: &str = "cache_warming_keys_total";
    pub const ANALYTICS_DROPPED_TOTAL: &str = "cache_analytics_samples_dropped_total";

    // Health
    pub const HEALTH_SCORE: &str = "cache_health_score";
    pub const FAILOVER_ACTIVE: &str = "cache_failover_active";
    pub const INCIDENTS_OPENED_TOTAL: &str = "cache_incidents_opened_total";

    // Benchmark
    pub const BENCHMARK_REGRESSIONS_TOTAL: &str = "cache_benchmark_regressions_total";
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

    // Pull-based: /metrics is served by the router
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

// =============================================================================
// HTTP Metrics
// =============================================================================

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status_class" => status_class.to_string()
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "path" => path.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Coordinator Metrics
// =============================================================================

pub fn record_cache_hit(tier: &str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier.to_string()).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_degraded(operation: &'static str) {
    counter!(names::CACHE_DEGRADED_TOTAL, "op" => operation).increment(1);
}

pub fn record_operation(operation: &'static str, duration: Duration) {
    histogram!(names::CACHE_OPERATION_DURATION_SECONDS, "op" => operation)
        .record(duration.as_secs_f64());
}

// =============================================================================
// Local Tier Metrics
// =============================================================================

pub fn set_local_occupancy(entries: usize, bytes: u64) {
    gauge!(names::LOCAL_ENTRIES).set(entries as f64);
    gauge!(names::LOCAL_BYTES).set(bytes as f64);
}

/// `reason` is `lru` or `ttl`.
pub fn record_evictions(reason: &'static str, count: u64) {
    if count > 0 {
        counter!(names::LOCAL_EVICTIONS_TOTAL, "reason" => reason).increment(count);
    }
}

// =============================================================================
// Entry Store Metrics
// =============================================================================

pub fn record_entry_store_error(node: &str) {
    counter!(names::ENTRY_STORE_ERRORS_TOTAL, "node" => node.to_string()).increment(1);
}

pub fn record_node_transition(node: &str, health: &str) {
    counter!(
        names::NODE_HEALTH_TRANSITIONS_TOTAL,
        "node" => node.to_string(),
        "health" => health.to_string()
    )
    .increment(1);
}

pub fn set_write_behind_depth(depth: usize) {
    gauge!(names::WRITE_BEHIND_QUEUE_DEPTH).set(depth as f64);
}

pub fn record_write_behind_dropped() {
    counter!(names::WRITE_BEHIND_DROPPED_TOTAL).increment(1);
}

pub fn record_write_behind_failed() {
    counter!(names::WRITE_BEHIND_FAILED_TOTAL).increment(1);
}

// =============================================================================
// Compression, Invalidation, Warming, Analytics
// =============================================================================

pub fn record_dedup_hit() {
    counter!(names::DEDUP_HITS_TOTAL).increment(1);
}

pub fn record_compressed_write() {
    counter!(names::COMPRESSED_WRITES_TOTAL).increment(1);
}

pub fn record_invalidation(status: &str) {
    counter!(names::INVALIDATION_EVENTS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Events that exhausted their retries.
pub fn record_invalidation_failed(event: &'static str) {
    counter!(names::INVALIDATION_FAILED_TOTAL, "event" => event).increment(1);
}

pub fn record_warming_keys(outcome: &'static str, count: u64) {
    counter!(names::WARMING_KEYS_TOTAL, "outcome" => outcome).increment(count);
}

pub fn record_analytics_dropped() {
    counter!(names::ANALYTICS_DROPPED_TOTAL).increment(1);
}

// =============================================================================
// Health Metrics
// =============================================================================

pub fn set_health_score(score: f64) {
    gauge!(names::HEALTH_SCORE).set(score);
}

pub fn set_failover_active(active: bool) {
    gauge!(names::FAILOVER_ACTIVE).set(if active { 1.0 } else { 0.0 });
}

pub fn record_incident_opened(severity: &str) {
    counter!(names::INCIDENTS_OPENED_TOTAL, "severity" => severity.to_string()).increment(1);
}

pub fn record_benchmark_regression(profile: &str) {
    counter!(names::BENCHMARK_REGRESSIONS_TOTAL, "profile" => profile.to_string()).increment(1);
}

// =============================================================================
// Helpers
// =============================================================================

/// Reduce a cache key to its shape so keys can be grouped without
/// high cardinality.
///
/// `translation:en:fr:9f86d081884c7d65` becomes `translation:en:fr:{id}`.
pub fn key_shape(key: &str) -> String {
    key.split(':')
        .map(|part| if is_likely_id(part) { "{id}" } else { part })
        .collect::<Vec<_>>()
        .join(":")
}

/// Check if a key segment looks like an ID (UUID, hash or numeric).
fn is_likely_id(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }

    // UUID pattern (with dashes)
    if s.len() == 36 && s.chars().filter(|c| *c == '-').count() == 4 {
        return true;
    }

    // Content hashes and hex digests
    if s.len() >= 8 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }

    // Numeric ID
    if s.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    // Long alphanumeric (likely an ID)
    if s.len() > 12 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return true;
    }

    false
}
