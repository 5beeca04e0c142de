//! Passive traffic analytics.
//!
//! The coordinator pushes one `AccessSample` per operation into a bounded
//! channel with `try_send`; a full channel drops the sample instead of
//! slowing the caller. A single ingest task folds samples into two rolling
//! windows and a per-key access history, from which patterns, hotspots,
//! inefficiencies, suggestions and next-hours predictions are derived.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use lexicache_core::{Timestamp, now_utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AnalyticsConfig;
use crate::metrics::key_shape;

const SHORT_WINDOW_SECS: i64 = 5 * 60;
const SHORT_BUCKET_SECS: i64 = 10;
const LONG_WINDOW_SECS: i64 = 24 * 3600;
const LONG_BUCKET_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOutcome {
    LocalHit,
    RemoteHit,
    Miss,
    Write,
    Delete,
}

impl AccessOutcome {
    fn is_read(&self) -> bool {
        matches!(
            self,
            AccessOutcome::LocalHit | AccessOutcome::RemoteHit | AccessOutcome::Miss
        )
    }

    fn is_hit(&self) -> bool {
        matches!(self, AccessOutcome::LocalHit | AccessOutcome::RemoteHit)
    }
}

#[derive(Debug, Clone)]
pub struct AccessSample {
    pub key: String,
    pub outcome: AccessOutcome,
    pub latency: Duration,
    pub degraded: bool,
    pub at: Timestamp,
}

impl AccessSample {
    pub fn now(key: impl Into<String>, outcome: AccessOutcome, latency: Duration, degraded: bool) -> Self {
        Self {
            key: key.into(),
            outcome,
            latency,
            degraded,
            at: now_utc(),
        }
    }
}

/// Cheap cloneable sending half handed to the coordinator.
#[derive(Clone)]
pub struct AnalyticsRecorder {
    tx: mpsc::Sender<AccessSample>,
    dropped: Arc<AtomicU64>,
}

impl AnalyticsRecorder {
    pub fn record(&self, sample: AccessSample) {
        if self.tx.try_send(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_analytics_dropped();
        }
    }
}

// =============================================================================
// Rolling windows
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    start: i64,
    reads: u64,
    local_hits: u64,
    remote_hits: u64,
    misses: u64,
    writes: u64,
    deletes: u64,
    degraded: u64,
    latency_ms_total: f64,
}

impl Bucket {
    fn ops(&self) -> u64 {
        self.reads + self.writes + self.deletes
    }

    fn add(&mut self, sample: &AccessSample) {
        match sample.outcome {
            AccessOutcome::LocalHit => {
                self.reads += 1;
                self.local_hits += 1;
            }
            AccessOutcome::RemoteHit => {
                self.reads += 1;
                self.remote_hits += 1;
            }
            AccessOutcome::Miss => {
                self.reads += 1;
                self.misses += 1;
            }
            AccessOutcome::Write => self.writes += 1,
            AccessOutcome::Delete => self.deletes += 1,
        }
        if sample.degraded {
            self.degraded += 1;
        }
        self.latency_ms_total += sample.latency.as_secs_f64() * 1000.0;
    }
}

#[derive(Debug)]
struct RollingWindow {
    span_secs: i64,
    bucket_secs: i64,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    fn new(span_secs: i64, bucket_secs: i64) -> Self {
        Self {
            span_secs,
            bucket_secs,
            buckets: VecDeque::new(),
        }
    }

    fn record(&mut self, sample: &AccessSample) {
        let at = sample.at.unix_timestamp();
        let start = at - at.rem_euclid(self.bucket_secs);
        match self.buckets.iter_mut().rev().find(|b| b.start == start) {
            Some(bucket) => bucket.add(sample),
            None => {
                let mut bucket = Bucket {
                    start,
                    ..Bucket::default()
                };
                bucket.add(sample);
                let pos = self
                    .buckets
                    .iter()
                    .position(|b| b.start > start)
                    .unwrap_or(self.buckets.len());
                self.buckets.insert(pos, bucket);
            }
        }
        self.evict(at);
    }

    fn evict(&mut self, now: i64) {
        while self
            .buckets
            .front()
            .is_some_and(|b| b.start + self.bucket_secs <= now - self.span_secs)
        {
            self.buckets.pop_front();
        }
    }

    fn summary(&self, label: &'static str, now: i64) -> WindowSummary {
        let cutoff = now - self.span_secs;
        let mut total = Bucket::default();
        let mut earliest = None;
        for b in self.buckets.iter().filter(|b| b.start + self.bucket_secs > cutoff) {
            earliest.get_or_insert(b.start);
            total.reads += b.reads;
            total.local_hits += b.local_hits;
            total.remote_hits += b.remote_hits;
            total.misses += b.misses;
            total.writes += b.writes;
            total.deletes += b.deletes;
            total.degraded += b.degraded;
            total.latency_ms_total += b.latency_ms_total;
        }
        let ops = total.ops();
        // Before the window fills, rate over the time actually observed.
        let observed_secs = earliest
            .map(|start| (now - start + 1).clamp(1, self.span_secs))
            .unwrap_or(self.span_secs);
        let hits = total.local_hits + total.remote_hits;
        WindowSummary {
            window: label,
            operations: ops,
            reads: total.reads,
            local_hits: total.local_hits,
            remote_hits: total.remote_hits,
            misses: total.misses,
            writes: total.writes,
            deletes: total.deletes,
            hit_rate: ratio(hits, total.reads),
            throughput: ops as f64 / observed_secs as f64,
            avg_response_time_ms: if ops == 0 {
                0.0
            } else {
                total.latency_ms_total / ops as f64
            },
            degraded_rate: ratio(total.degraded, ops),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowSummary {
    pub window: &'static str,
    pub operations: u64,
    pub reads: u64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
    pub hit_rate: f64,
    /// Operations per second.
    pub throughput: f64,
    pub avg_response_time_ms: f64,
    pub degraded_rate: f64,
}

// =============================================================================
// Per-key history
// =============================================================================

/// Reads of one key during one epoch hour.
#[derive(Debug, Clone, Copy, Default)]
struct HourCount {
    hour: i64,
    requests: u64,
    hits: u64,
}

/// Lifetime totals drive inefficiencies and predictions; `recent` holds the
/// last 24 epoch hours for the window-scoped patterns and hotspots.
#[derive(Debug, Clone)]
struct KeyHistory {
    requests: u64,
    hits: u64,
    misses: u64,
    hourly: [u64; 24],
    recent: [HourCount; 24],
    first_seen: Timestamp,
    last_seen: Timestamp,
}

fn epoch_hour(at: &Timestamp) -> i64 {
    at.unix_timestamp().div_euclid(3600)
}

impl KeyHistory {
    fn new(at: Timestamp) -> Self {
        Self {
            requests: 0,
            hits: 0,
            misses: 0,
            hourly: [0; 24],
            recent: [HourCount::default(); 24],
            first_seen: at,
            last_seen: at,
        }
    }

    fn count_recent(&mut self, at: &Timestamp, hit: bool) {
        let hour = epoch_hour(at);
        let bucket = &mut self.recent[hour.rem_euclid(24) as usize];
        if bucket.hour != hour {
            if bucket.hour > hour {
                return;
            }
            *bucket = HourCount {
                hour,
                ..HourCount::default()
            };
        }
        bucket.requests += 1;
        if hit {
            bucket.hits += 1;
        }
    }

    /// `(requests, hits)` over the 24 hours ending at `now_hour`.
    fn last_day(&self, now_hour: i64) -> (u64, u64) {
        self.recent
            .iter()
            .filter(|b| b.hour > now_hour - 24 && b.hour <= now_hour)
            .fold((0, 0), |(r, h), b| (r + b.requests, h + b.hits))
    }

    fn miss_rate(&self) -> f64 {
        ratio(self.misses, self.requests)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyPattern {
    pub pattern: String,
    pub keys: usize,
    pub requests: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hotspot {
    pub key: String,
    pub pattern: String,
    /// Reads in the last 24 hours.
    pub requests: u64,
    /// Fraction of all reads in the last 24 hours.
    pub share: f64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Inefficiency {
    pub key: String,
    pub requests: u64,
    pub miss_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Warming,
    Compression,
    TtlTuning,
    PinHotKeys,
    CheckHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub priority: Priority,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    pub last_5m: WindowSummary,
    pub last_24h: WindowSummary,
    pub patterns: Vec<KeyPattern>,
    pub hotspots: Vec<Hotspot>,
    pub inefficiencies: Vec<Inefficiency>,
    pub suggestions: Vec<Suggestion>,
    pub tracked_keys: usize,
    pub dropped_samples: u64,
}

// =============================================================================
// Engine
// =============================================================================

pub struct AnalyticsEngine {
    config: AnalyticsConfig,
    short: Mutex<RollingWindow>,
    long: Mutex<RollingWindow>,
    keys: DashMap<String, KeyHistory>,
    dropped: Arc<AtomicU64>,
    untracked: AtomicU64,
}

impl AnalyticsEngine {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            config,
            short: Mutex::new(RollingWindow::new(SHORT_WINDOW_SECS, SHORT_BUCKET_SECS)),
            long: Mutex::new(RollingWindow::new(LONG_WINDOW_SECS, LONG_BUCKET_SECS)),
            keys: DashMap::new(),
            dropped: Arc::new(AtomicU64::new(0)),
            untracked: AtomicU64::new(0),
        }
    }

    /// Bounded sample channel; the receiver goes to `run_ingest`.
    pub fn channel(&self) -> (AnalyticsRecorder, mpsc::Receiver<AccessSample>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        (
            AnalyticsRecorder {
                tx,
                dropped: Arc::clone(&self.dropped),
            },
            rx,
        )
    }

    pub fn ingest(&self, sample: &AccessSample) {
        self.short.lock().record(sample);
        self.long.lock().record(sample);

        if !sample.outcome.is_read() {
            return;
        }
        if !self.keys.contains_key(&sample.key) && self.keys.len() >= self.config.max_tracked_keys {
            self.untracked.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut history = self
            .keys
            .entry(sample.key.clone())
            .or_insert_with(|| KeyHistory::new(sample.at));
        history.requests += 1;
        if sample.outcome.is_hit() {
            history.hits += 1;
        } else {
            history.misses += 1;
        }
        history.hourly[sample.at.hour() as usize % 24] += 1;
        history.count_recent(&sample.at, sample.outcome.is_hit());
        if sample.at > history.last_seen {
            history.last_seen = sample.at;
        }
    }

    /// Drain the sample channel until cancelled.
    pub fn spawn_ingest(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<AccessSample>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sample = rx.recv() => match sample {
                        Some(sample) => engine.ingest(&sample),
                        None => break,
                    },
                }
            }
            tracing::debug!("analytics ingest stopped");
        })
    }

    pub fn spawn_pruner(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = Duration::from_secs(self.config.prune_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = engine.prune();
                        if removed > 0 {
                            tracing::debug!(removed, "pruned stale key histories");
                        }
                    }
                }
            }
        })
    }

    /// Drop histories not seen within the lookback window, then trim the
    /// least recently seen tenth if still at the cap.
    pub fn prune(&self) -> usize {
        let now = now_utc();
        let lookback = self.config.lookback();
        let before = self.keys.len();
        self.keys.retain(|_, h| now.since(&h.last_seen) < lookback);

        if self.keys.len() >= self.config.max_tracked_keys {
            let mut by_age: Vec<(String, Timestamp)> = self
                .keys
                .iter()
                .map(|e| (e.key().clone(), e.last_seen))
                .collect();
            by_age.sort_by(|a, b| a.1.cmp(&b.1));
            let excess = (self.keys.len() / 10).max(1);
            for (key, _) in by_age.into_iter().take(excess) {
                self.keys.remove(&key);
            }
        }
        before.saturating_sub(self.keys.len())
    }

    pub fn window_5m(&self) -> WindowSummary {
        self.short
            .lock()
            .summary("5m", now_utc().unix_timestamp())
    }

    pub fn window_24h(&self) -> WindowSummary {
        self.long
            .lock()
            .summary("24h", now_utc().unix_timestamp())
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Per-key reads over the last 24 hours, skipping idle keys.
    fn last_day_counts(&self) -> Vec<(String, u64, u64)> {
        let now_hour = epoch_hour(&now_utc());
        self.keys
            .iter()
            .filter_map(|e| {
                let (requests, hits) = e.last_day(now_hour);
                (requests > 0).then(|| (e.key().clone(), requests, hits))
            })
            .collect()
    }

    /// Key shapes by request volume over the last 24 hours.
    pub fn patterns(&self, limit: usize) -> Vec<KeyPattern> {
        let mut groups: HashMap<String, (usize, u64, u64)> = HashMap::new();
        for (key, requests, hits) in self.last_day_counts() {
            let group = groups.entry(key_shape(&key)).or_default();
            group.0 += 1;
            group.1 += requests;
            group.2 += hits;
        }
        let mut patterns: Vec<KeyPattern> = groups
            .into_iter()
            .map(|(pattern, (keys, requests, hits))| KeyPattern {
                pattern,
                keys,
                requests,
                hit_rate: ratio(hits, requests),
            })
            .collect();
        patterns.sort_by(|a, b| b.requests.cmp(&a.requests).then(a.pattern.cmp(&b.pattern)));
        patterns.truncate(limit);
        patterns
    }

    /// Keys taking at least `hotspot_share` of the last 24 hours' reads.
    pub fn hotspots(&self) -> Vec<Hotspot> {
        let counts = self.last_day_counts();
        let total: u64 = counts.iter().map(|(_, requests, _)| requests).sum();
        if total == 0 {
            return Vec::new();
        }
        let mut hotspots: Vec<Hotspot> = counts
            .into_iter()
            .filter_map(|(key, requests, hits)| {
                let share = requests as f64 / total as f64;
                (share >= self.config.hotspot_share).then(|| Hotspot {
                    pattern: key_shape(&key),
                    key,
                    requests,
                    share,
                    hit_rate: ratio(hits, requests),
                })
            })
            .collect();
        hotspots.sort_by(|a, b| b.requests.cmp(&a.requests).then(a.key.cmp(&b.key)));
        hotspots.truncate(self.config.hotspot_limit);
        hotspots
    }

    /// Keys with enough traffic and a miss rate above the threshold.
    pub fn inefficiencies(&self) -> Vec<Inefficiency> {
        let mut found: Vec<Inefficiency> = self
            .keys
            .iter()
            .filter(|e| {
                e.requests >= self.config.inefficiency_min_requests
                    && e.miss_rate() >= self.config.inefficiency_miss_rate
            })
            .map(|e| Inefficiency {
                key: e.key().clone(),
                requests: e.requests,
                miss_rate: e.miss_rate(),
            })
            .collect();
        found.sort_by(|a, b| {
            b.miss_rate
                .total_cmp(&a.miss_rate)
                .then(b.requests.cmp(&a.requests))
                .then(a.key.cmp(&b.key))
        });
        found.truncate(self.config.hotspot_limit);
        found
    }

    /// Tracked keys under `prefix`, most requested first.
    pub fn known_keys(&self, prefix: &str, limit: usize) -> Vec<String> {
        let mut keys: Vec<(String, u64)> = self
            .keys
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.requests))
            .collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        keys.into_iter().take(limit).map(|(k, _)| k).collect()
    }

    pub fn suggestions(&self) -> Vec<Suggestion> {
        let day = self.window_24h();
        build_suggestions(&day, &self.hotspots(), &self.inefficiencies())
    }

    /// Keys most requested during the next `horizon_hours` hours of the day
    /// according to their hour-of-day histograms.
    pub fn predicted_keys(&self, horizon_hours: u32, limit: usize) -> Vec<String> {
        let current = now_utc().hour() as usize;
        let hours: Vec<usize> = (0..horizon_hours.clamp(1, 24) as usize)
            .map(|h| (current + h) % 24)
            .collect();
        let mut scored: Vec<(String, u64)> = self
            .keys
            .iter()
            .map(|e| {
                let score = hours.iter().map(|h| e.hourly[*h]).sum::<u64>();
                (e.key().clone(), score)
            })
            .filter(|(_, score)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.into_iter().take(limit).map(|(k, _)| k).collect()
    }

    pub fn report(&self) -> AnalyticsReport {
        let last_24h = self.window_24h();
        let hotspots = self.hotspots();
        let inefficiencies = self.inefficiencies();
        let suggestions = build_suggestions(&last_24h, &hotspots, &inefficiencies);
        AnalyticsReport {
            last_5m: self.window_5m(),
            last_24h,
            patterns: self.patterns(20),
            hotspots,
            inefficiencies,
            suggestions,
            tracked_keys: self.tracked_keys(),
            dropped_samples: self.dropped_samples(),
        }
    }
}

/// Fixed rule set over one window.
fn build_suggestions(
    window: &WindowSummary,
    hotspots: &[Hotspot],
    inefficiencies: &[Inefficiency],
) -> Vec<Suggestion> {
    let mut out = Vec::new();
    if window.reads > 0 && window.hit_rate < 0.60 {
        out.push(Suggestion {
            kind: SuggestionKind::Warming,
            priority: Priority::High,
            message: format!(
                "hit rate {:.0}% is below 60%; schedule predictive warming",
                window.hit_rate * 100.0
            ),
            keys: Vec::new(),
        });
    }
    if window.avg_response_time_ms > 200.0 {
        out.push(Suggestion {
            kind: SuggestionKind::Compression,
            priority: Priority::Medium,
            message: format!(
                "average response time {:.0}ms exceeds 200ms; enable or tighten compression",
                window.avg_response_time_ms
            ),
            keys: Vec::new(),
        });
    }
    if !inefficiencies.is_empty() {
        out.push(Suggestion {
            kind: SuggestionKind::TtlTuning,
            priority: Priority::Medium,
            message: format!(
                "{} key(s) miss more often than they hit; lengthen their TTL",
                inefficiencies.len()
            ),
            keys: inefficiencies.iter().take(5).map(|i| i.key.clone()).collect(),
        });
    }
    if !hotspots.is_empty() {
        out.push(Suggestion {
            kind: SuggestionKind::PinHotKeys,
            priority: Priority::Low,
            message: format!(
                "{} hot key(s) dominate traffic; keep them warm in the local tier",
                hotspots.len()
            ),
            keys: hotspots.iter().take(5).map(|h| h.key.clone()).collect(),
        });
    }
    if window.degraded_rate > 0.05 {
        out.push(Suggestion {
            kind: SuggestionKind::CheckHealth,
            priority: Priority::High,
            message: format!(
                "{:.1}% of operations were degraded; check entry store health",
                window.degraded_rate * 100.0
            ),
            keys: Vec::new(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> AnalyticsEngine {
        AnalyticsEngine::new(AnalyticsConfig::default())
    }

    fn read(engine: &AnalyticsEngine, key: &str, outcome: AccessOutcome, n: usize) {
        for _ in 0..n {
            engine.ingest(&AccessSample::now(key, outcome, Duration::from_millis(2), false));
        }
    }

    #[test]
    fn test_window_hit_rate_and_degraded() {
        let e = engine();
        read(&e, "user:1:a", AccessOutcome::LocalHit, 6);
        read(&e, "user:1:a", AccessOutcome::RemoteHit, 2);
        read(&e, "user:1:a", AccessOutcome::Miss, 2);
        e.ingest(&AccessSample::now("user:1:a", AccessOutcome::Write, Duration::ZERO, true));

        let w = e.window_5m();
        assert_eq!(w.reads, 10);
        assert_eq!(w.operations, 11);
        assert!((w.hit_rate - 0.8).abs() < 1e-9);
        assert!((w.degraded_rate - 1.0 / 11.0).abs() < 1e-9);
        assert!(w.throughput > 0.0);
        assert_eq!(e.window_24h().reads, 10);
    }

    #[test]
    fn test_old_samples_leave_short_window() {
        let e = engine();
        let mut old = AccessSample::now("k", AccessOutcome::Miss, Duration::ZERO, false);
        old.at = Timestamp::new(now_utc().0 - time::Duration::minutes(10));
        e.ingest(&old);
        read(&e, "k", AccessOutcome::LocalHit, 1);
        assert_eq!(e.window_5m().reads, 1);
        assert_eq!(e.window_24h().reads, 2);
    }

    #[test]
    fn test_patterns_group_by_shape() {
        let e = engine();
        for i in 0..5 {
            read(&e, &format!("translation:en:fr:{i:016x}"), AccessOutcome::LocalHit, 2);
        }
        read(&e, "glossary:42:terms", AccessOutcome::Miss, 1);
        let patterns = e.patterns(10);
        assert_eq!(patterns[0].pattern, "translation:en:fr:{id}");
        assert_eq!(patterns[0].keys, 5);
        assert_eq!(patterns[0].requests, 10);
        assert_eq!(patterns[1].pattern, "glossary:{id}:terms");
    }

    #[test]
    fn test_hotspots_ignore_reads_older_than_a_day() {
        let e = engine();
        let mut old = AccessSample::now("legacy", AccessOutcome::LocalHit, Duration::ZERO, false);
        old.at = Timestamp::new(now_utc().0 - time::Duration::hours(30));
        for _ in 0..500 {
            e.ingest(&old);
        }
        read(&e, "current", AccessOutcome::LocalHit, 10);
        read(&e, "current:other", AccessOutcome::Miss, 10);

        let hot = e.hotspots();
        assert!(hot.iter().all(|h| h.key != "legacy"));
        assert!(hot.iter().any(|h| h.key == "current"));
        assert!(hot.iter().all(|h| h.share <= 1.0));

        let patterns = e.patterns(10);
        assert!(patterns.iter().all(|p| p.pattern != "legacy"));
        assert_eq!(patterns.iter().map(|p| p.requests).sum::<u64>(), 20);
        // Lifetime history is still kept for the key
        assert_eq!(e.tracked_keys(), 3);
    }

    #[test]
    fn test_hotspots_and_inefficiencies() {
        let e = engine();
        read(&e, "hot", AccessOutcome::LocalHit, 80);
        for i in 0..40 {
            read(&e, &format!("cold:{i}"), AccessOutcome::LocalHit, 1);
        }
        read(&e, "missy", AccessOutcome::Miss, 30);

        let hot = e.hotspots();
        assert_eq!(hot[0].key, "hot");
        assert!(hot.iter().all(|h| !h.key.starts_with("cold")));

        let bad = e.inefficiencies();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].key, "missy");
    }

    #[test]
    fn test_suggestion_rules() {
        let e = engine();
        read(&e, "a", AccessOutcome::Miss, 30);
        read(&e, "b", AccessOutcome::LocalHit, 5);
        let kinds: Vec<SuggestionKind> = e.suggestions().iter().map(|s| s.kind).collect();
        assert!(kinds.contains(&SuggestionKind::Warming));
        assert!(kinds.contains(&SuggestionKind::TtlTuning));
        assert!(kinds.contains(&SuggestionKind::PinHotKeys));
        assert!(!kinds.contains(&SuggestionKind::Compression));
        assert!(!kinds.contains(&SuggestionKind::CheckHealth));
    }

    #[test]
    fn test_predicted_keys_follow_current_hour() {
        let e = engine();
        read(&e, "translation:en:de:1", AccessOutcome::LocalHit, 5);
        read(&e, "translation:en:de:2", AccessOutcome::LocalHit, 2);
        let predicted = e.predicted_keys(2, 10);
        assert_eq!(predicted, vec!["translation:en:de:1", "translation:en:de:2"]);
        assert_eq!(e.predicted_keys(2, 1).len(), 1);
    }

    #[test]
    fn test_prune_drops_stale_history() {
        let e = engine();
        let mut old = AccessSample::now("stale", AccessOutcome::Miss, Duration::ZERO, false);
        old.at = Timestamp::new(now_utc().0 - time::Duration::days(8));
        e.ingest(&old);
        read(&e, "fresh", AccessOutcome::LocalHit, 1);
        assert_eq!(e.prune(), 1);
        assert_eq!(e.tracked_keys(), 1);
    }

    #[test]
    fn test_cap_limits_tracked_keys() {
        let e = AnalyticsEngine::new(AnalyticsConfig {
            max_tracked_keys: 2,
            ..AnalyticsConfig::default()
        });
        for key in ["a", "b", "c"] {
            read(&e, key, AccessOutcome::Miss, 1);
        }
        assert_eq!(e.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn test_recorder_drops_when_full() {
        let e = Arc::new(AnalyticsEngine::new(AnalyticsConfig {
            channel_capacity: 1,
            ..AnalyticsConfig::default()
        }));
        let (recorder, rx) = e.channel();
        for _ in 0..3 {
            recorder.record(AccessSample::now("k", AccessOutcome::Miss, Duration::ZERO, false));
        }
        assert_eq!(e.dropped_samples(), 2);

        let cancel = CancellationToken::new();
        let handle = e.spawn_ingest(rx, cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(e.tracked_keys(), 1);
        cancel.cancel();
        handle.await.unwrap();
    }
}
