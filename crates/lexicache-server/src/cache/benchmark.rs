//! Load benchmarks run directly against the coordinator.
//!
//! Each run writes under its own `bench:<run id>:` namespace, which is
//! deleted once the workload stops. Only one run executes at a time.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lexicache_core::{
    BenchmarkConfig, BenchmarkProfile, BenchmarkRun, BenchmarkSummary, CacheError, OperationsMix,
    Result, now_utc,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::coordinator::{CacheCoordinator, Durability};
use crate::config::BenchmarkSettings;

const MGET_BATCH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Get,
    Set,
    MultiGet,
}

fn pick_op(mix: &OperationsMix, rng: &mut StdRng) -> Op {
    let Some(total) = mix.total().filter(|t| *t > 0) else {
        return Op::Get;
    };
    let roll = rng.gen_range(0..total);
    if roll < mix.get {
        Op::Get
    } else if roll < mix.get + mix.set {
        Op::Set
    } else {
        Op::MultiGet
    }
}

#[derive(Debug, Default)]
struct Tally {
    latencies_ms: Vec<f64>,
    ops: u64,
    errors: u64,
    degraded: u64,
    lookups: u64,
    hits: u64,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.latencies_ms.extend(other.latencies_ms);
        self.ops += other.ops;
        self.errors += other.errors;
        self.degraded += other.degraded;
        self.lookups += other.lookups;
        self.hits += other.hits;
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Compare a run's p95 with the mean p95 of earlier runs.
///
/// Returns `(regression, baseline)`; both `None` without history.
pub fn evaluate_regression(
    baseline_p95s: &[f64],
    p95_ms: f64,
    tolerance: f64,
) -> (Option<bool>, Option<f64>) {
    if baseline_p95s.is_empty() {
        return (None, None);
    }
    let baseline = baseline_p95s.iter().sum::<f64>() / baseline_p95s.len() as f64;
    (Some(p95_ms > baseline * (1.0 + tolerance)), Some(baseline))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileHistory {
    pub baseline_p95_ms: Option<f64>,
    pub last_regression: Option<bool>,
    /// Newest first.
    pub runs: Vec<BenchmarkRun>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkDashboard {
    pub running: bool,
    pub max_duration_ms: u64,
    pub max_concurrency: usize,
    pub profiles: BTreeMap<BenchmarkProfile, ProfileHistory>,
}

pub struct BenchmarkHarness {
    coordinator: Arc<CacheCoordinator>,
    settings: BenchmarkSettings,
    running: tokio::sync::Mutex<()>,
    history: Mutex<BTreeMap<BenchmarkProfile, VecDeque<BenchmarkRun>>>,
}

impl BenchmarkHarness {
    pub fn new(coordinator: Arc<CacheCoordinator>, settings: BenchmarkSettings) -> Self {
        Self {
            coordinator,
            settings,
            running: tokio::sync::Mutex::new(()),
            history: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    fn baseline_p95s(&self, profile: BenchmarkProfile) -> Vec<f64> {
        self.history
            .lock()
            .get(&profile)
            .map(|runs| {
                runs.iter()
                    .rev()
                    .take(self.settings.baseline_runs)
                    .map(|r| r.results_summary.p95_ms)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn history(&self, profile: BenchmarkProfile) -> Vec<BenchmarkRun> {
        self.history
            .lock()
            .get(&profile)
            .map(|runs| runs.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dashboard(&self) -> BenchmarkDashboard {
        let profiles = [
            BenchmarkProfile::Latency,
            BenchmarkProfile::Throughput,
            BenchmarkProfile::Memory,
        ]
        .into_iter()
        .map(|profile| {
            let runs = self.history(profile);
            let baseline = self.baseline_p95s(profile);
            let baseline_p95_ms =
                (!baseline.is_empty()).then(|| baseline.iter().sum::<f64>() / baseline.len() as f64);
            let last_regression = runs.first().and_then(|r| r.regression);
            (
                profile,
                ProfileHistory {
                    baseline_p95_ms,
                    last_regression,
                    runs,
                },
            )
        })
        .collect();
        BenchmarkDashboard {
            running: self.is_running(),
            max_duration_ms: self.settings.max_duration_ms,
            max_concurrency: self.settings.max_concurrency,
            profiles,
        }
    }

    /// Execute one run to completion.
    pub async fn run(&self, config: BenchmarkConfig) -> Result<BenchmarkRun> {
        config.validate(self.settings.max_duration_ms, self.settings.max_concurrency)?;
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| CacheError::conflict("a benchmark is already running"))?;

        let id = Uuid::new_v4();
        let namespace = format!("bench:{}:", id.simple());
        let mix = config.mix();
        let mut payload = vec![0u8; config.payload_size.bytes()];
        StdRng::from_entropy().fill(&mut payload[..]);
        let payload = Arc::new(payload);

        tracing::info!(
            run_id = %id,
            profile = %config.profile,
            duration_ms = config.duration_ms,
            concurrency = config.concurrency,
            "benchmark started"
        );

        let memory_before = self.coordinator.local().stats().bytes_used as i64;
        let started_at = now_utc();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(config.duration_ms);

        let mut workers = JoinSet::new();
        for _ in 0..config.concurrency {
            let coordinator = Arc::clone(&self.coordinator);
            let payload = Arc::clone(&payload);
            let namespace = namespace.clone();
            let key_space = config.key_space;
            workers.spawn(async move {
                worker(coordinator, mix, key_space, namespace, payload, deadline).await
            });
        }

        let mut tally = Tally::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(worker_tally) => tally.merge(worker_tally),
                Err(e) => {
                    tracing::warn!(run_id = %id, error = %e, "benchmark worker panicked");
                    tally.errors += 1;
                }
            }
        }
        let elapsed = started.elapsed();
        let memory_after = self.coordinator.local().stats().bytes_used as i64;

        let cleaned = self.cleanup(&namespace, config.key_space).await;
        tracing::debug!(run_id = %id, cleaned, "benchmark keys removed");

        let mut latencies = tally.latencies_ms;
        latencies.sort_by(f64::total_cmp);
        let summary = BenchmarkSummary {
            total_ops: tally.ops,
            errors: tally.errors,
            degraded_ops: tally.degraded,
            hit_rate: if tally.lookups == 0 {
                0.0
            } else {
                tally.hits as f64 / tally.lookups as f64
            },
            throughput_ops_per_sec: tally.ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
            p50_ms: percentile(&latencies, 50.0),
            p95_ms: percentile(&latencies, 95.0),
            p99_ms: percentile(&latencies, 99.0),
            max_ms: latencies.last().copied().unwrap_or(0.0),
            memory_delta_bytes: memory_after - memory_before,
        };

        let (regression, baseline_p95_ms) = evaluate_regression(
            &self.baseline_p95s(config.profile),
            summary.p95_ms,
            self.settings.regression_tolerance,
        );
        if regression == Some(true) {
            crate::metrics::record_benchmark_regression(&config.profile.to_string());
            tracing::warn!(
                run_id = %id,
                profile = %config.profile,
                p95_ms = summary.p95_ms,
                baseline_p95_ms = ?baseline_p95_ms,
                "benchmark regression"
            );
        }

        let run = BenchmarkRun {
            id,
            profile: config.profile,
            duration_ms: config.duration_ms,
            concurrency: config.concurrency,
            operations_mix: mix,
            payload_size: config.payload_size,
            key_space: config.key_space,
            results_summary: summary,
            started_at,
            finished_at: now_utc(),
            regression,
            baseline_p95_ms,
        };

        {
            let mut history = self.history.lock();
            let runs = history.entry(config.profile).or_default();
            runs.push_back(run.clone());
            while runs.len() > self.settings.history_size.max(1) {
                runs.pop_front();
            }
        }

        tracing::info!(
            run_id = %id,
            ops = run.results_summary.total_ops,
            p95_ms = run.results_summary.p95_ms,
            "benchmark finished"
        );
        Ok(run)
    }

    async fn cleanup(&self, namespace: &str, key_space: usize) -> usize {
        let keys = match self.coordinator.keys_with_prefix(namespace, key_space).await {
            Ok((keys, _)) => keys,
            Err(e) => {
                tracing::warn!(namespace, error = %e, "benchmark key scan failed");
                return 0;
            }
        };
        let mut removed = 0;
        for key in keys {
            if self.coordinator.delete(&key).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

async fn worker(
    coordinator: Arc<CacheCoordinator>,
    mix: OperationsMix,
    key_space: usize,
    namespace: String,
    payload: Arc<Vec<u8>>,
    deadline: Instant,
) -> Tally {
    let mut rng = StdRng::from_entropy();
    let mut tally = Tally::default();
    let ttl = Duration::from_secs(300);

    while Instant::now() < deadline {
        let op = pick_op(&mix, &mut rng);
        let started = Instant::now();
        match op {
            Op::Get => {
                let key = format!("{namespace}{}", rng.gen_range(0..key_space));
                match coordinator.get(&key).await {
                    Ok(result) => {
                        tally.lookups += 1;
                        tally.hits += u64::from(result.is_hit());
                        tally.degraded += u64::from(result.degraded);
                    }
                    Err(_) => tally.errors += 1,
                }
            }
            Op::Set => {
                let key = format!("{namespace}{}", rng.gen_range(0..key_space));
                match coordinator
                    .set(&key, payload.as_ref().clone(), ttl, Durability::Async)
                    .await
                {
                    Ok(ack) => tally.degraded += u64::from(ack.degraded),
                    Err(_) => tally.errors += 1,
                }
            }
            Op::MultiGet => {
                let keys: Vec<String> = (0..MGET_BATCH)
                    .map(|_| format!("{namespace}{}", rng.gen_range(0..key_space)))
                    .collect();
                match coordinator.get_many(&keys).await {
                    Ok(results) => {
                        for result in results.values() {
                            tally.lookups += 1;
                            tally.hits += u64::from(result.is_hit());
                            tally.degraded += u64::from(result.degraded);
                        }
                    }
                    Err(_) => tally.errors += 1,
                }
            }
        }
        tally.ops += 1;
        tally
            .latencies_ms
            .push(started.elapsed().as_secs_f64() * 1000.0);
        // Local hits never yield on their own
        tokio::task::yield_now().await;
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::health::FailoverSwitch;
    use crate::cache::local::LocalTier;
    use crate::config::CoordinatorConfig;
    use lexicache_core::PayloadSize;

    fn harness() -> Arc<BenchmarkHarness> {
        let coordinator = Arc::new(CacheCoordinator::new(
            Arc::new(LocalTier::new(16 * 1024 * 1024, 64)),
            None,
            CoordinatorConfig::default(),
            Duration::from_secs(60),
            FailoverSwitch::default(),
            None,
        ));
        Arc::new(BenchmarkHarness::new(coordinator, BenchmarkSettings::default()))
    }

    fn quick(profile: BenchmarkProfile, duration_ms: u64) -> BenchmarkConfig {
        BenchmarkConfig {
            duration_ms,
            concurrency: 2,
            payload_size: PayloadSize::Small,
            key_space: 50,
            ..BenchmarkConfig::new(profile)
        }
    }

    #[test]
    fn test_regression_rule() {
        let baseline = [10.0, 10.0, 10.0, 10.0, 10.0];
        assert_eq!(evaluate_regression(&baseline, 12.5, 0.20), (Some(true), Some(10.0)));
        assert_eq!(evaluate_regression(&baseline, 10.9, 0.20), (Some(false), Some(10.0)));
        assert_eq!(evaluate_regression(&[], 50.0, 0.20), (None, None));
    }

    #[test]
    fn test_percentiles() {
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&samples, 50.0), 51.0);
        assert_eq!(percentile(&samples, 95.0), 95.0);
        assert_eq!(percentile(&samples, 100.0), 100.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[test]
    fn test_op_selection_respects_zero_weights() {
        let mix = OperationsMix {
            get: 0,
            set: 1,
            mget: 0,
        };
        let mut rng = StdRng::seed_from_u64(3);
        assert!((0..100).all(|_| pick_op(&mix, &mut rng) == Op::Set));
    }

    #[tokio::test]
    async fn test_run_records_summary_and_cleans_up() {
        let h = harness();
        let run = h.run(quick(BenchmarkProfile::Latency, 150)).await.unwrap();
        let summary = &run.results_summary;
        assert!(summary.total_ops > 0);
        assert_eq!(summary.errors, 0);
        assert!(summary.p50_ms <= summary.p95_ms && summary.p95_ms <= summary.p99_ms);
        assert!(summary.p99_ms <= summary.max_ms);
        assert!(summary.throughput_ops_per_sec > 0.0);
        assert!(run.regression.is_none());
        assert!(h.coordinator.local().keys_with_prefix("bench:").is_empty());

        let second = h.run(quick(BenchmarkProfile::Latency, 100)).await.unwrap();
        assert!(second.regression.is_some());
        assert_eq!(second.baseline_p95_ms, Some(summary.p95_ms));
        assert_eq!(h.history(BenchmarkProfile::Latency).len(), 2);
        assert_eq!(h.history(BenchmarkProfile::Latency)[0].id, second.id);
    }

    #[tokio::test]
    async fn test_only_one_run_at_a_time() {
        let h = harness();
        let background = Arc::clone(&h);
        let first = tokio::spawn(async move {
            background
                .run(quick(BenchmarkProfile::Throughput, 300))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.is_running());
        let err = h
            .run(quick(BenchmarkProfile::Throughput, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Conflict(_)));
        first.await.unwrap().unwrap();
        assert!(!h.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let h = harness();
        let mut config = quick(BenchmarkProfile::Memory, 100);
        config.concurrency = 0;
        assert!(h.run(config).await.is_err());
        assert!(h.dashboard().profiles[&BenchmarkProfile::Memory].runs.is_empty());
    }
}
