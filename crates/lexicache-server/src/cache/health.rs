//! Health monitoring and failover.
//!
//! Each cycle runs the named checks, folds them into a weighted score
//! (pass 100, warn 50, fail 0) and applies the failover policy:
//!
//! - score below `failover_threshold` for `failover_consecutive` cycles
//!   switches the coordinator to local-only and opens an incident
//! - score at or above `recovery_threshold` for `recovery_consecutive`
//!   cycles switches back, closes the incident and flushes deferred deletes
//!
//! Scores between the two thresholds reset both counters, so the status
//! does not flap around a single threshold.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use lexicache_core::{
    AggregateStatus, CacheError, CheckStatus, HealthCheckResult, Incident, IncidentSeverity,
    NodeHealth, Result, Timestamp, deadline_after, now_utc,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::analytics::AnalyticsEngine;
use super::coordinator::CacheCoordinator;
use super::entry_store::{EntryStore, NodeProbe};
use crate::config::HealthConfig;

pub const CHECK_LOCAL_TIER: &str = "local_tier";
pub const CHECK_ENTRY_STORE: &str = "entry_store";
pub const CHECK_NODE_LATENCY: &str = "node_latency";
pub const CHECK_ERROR_RATE: &str = "error_rate";

/// Longest manual override, one week.
pub const MAX_OVERRIDE_SECS: u64 = 7 * 24 * 3600;

const RECOMMENDATIONS: [(&str, &str); 4] = [
    (
        CHECK_LOCAL_TIER,
        "Local tier is close to its memory budget; raise local_tier.memory_budget_bytes or shorten TTLs",
    ),
    (
        CHECK_ENTRY_STORE,
        "Entry store nodes are failing pings; check connectivity, failover bypasses them meanwhile",
    ),
    (
        CHECK_NODE_LATENCY,
        "Slow nodes are de-prioritized for reads; consider a rebalance or pinning a healthy region",
    ),
    (
        CHECK_ERROR_RATE,
        "Degraded operations are elevated; inspect entry store errors and write-behind drops",
    ),
];

// =============================================================================
// Failover switch
// =============================================================================

#[derive(Debug, Default)]
struct SwitchState {
    auto: AtomicBool,
    manual_until: Mutex<Option<Instant>>,
}

/// Shared flag that makes the coordinator bypass the remote tier.
///
/// Set automatically by the health monitor, or manually by an operator for
/// a bounded duration. Either source keeps it active.
#[derive(Debug, Clone, Default)]
pub struct FailoverSwitch {
    state: Arc<SwitchState>,
}

impl FailoverSwitch {
    pub fn is_active(&self) -> bool {
        self.is_auto() || self.manual_remaining().is_some()
    }

    pub fn is_auto(&self) -> bool {
        self.state.auto.load(Ordering::SeqCst)
    }

    pub fn set_auto(&self, active: bool) {
        self.state.auto.store(active, Ordering::SeqCst);
    }

    pub fn force_for(&self, duration: Duration) {
        *self.state.manual_until.lock() = Some(deadline_after(duration));
    }

    pub fn clear_manual(&self) {
        *self.state.manual_until.lock() = None;
    }

    /// Time left on a manual override.
    pub fn manual_remaining(&self) -> Option<Duration> {
        let until = (*self.state.manual_until.lock())?;
        until
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}

// =============================================================================
// Incident sinks
// =============================================================================

/// Receives incident lifecycle notifications.
pub trait IncidentSink: Send + Sync {
    fn opened(&self, incident: &Incident);
    fn escalated(&self, incident: &Incident);
    fn closed(&self, incident: &Incident);
}

/// Writes incidents to the log.
pub struct TracingSink;

impl IncidentSink for TracingSink {
    fn opened(&self, incident: &Incident) {
        tracing::error!(
            incident_id = %incident.id,
            severity = ?incident.severity,
            cause = %incident.cause,
            checks = ?incident.affected_checks,
            "incident opened, failing over to local tier"
        );
    }

    fn escalated(&self, incident: &Incident) {
        tracing::error!(incident_id = %incident.id, severity = ?incident.severity, "incident escalated");
    }

    fn closed(&self, incident: &Incident) {
        tracing::info!(incident_id = %incident.id, "incident closed, remote tier restored");
    }
}

// =============================================================================
// Operator override
// =============================================================================

/// Body of `POST /cache/failover`. `duration` is in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FailoverRequest {
    LocalOnly { duration: u64 },
    Region { region: String, duration: u64 },
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideInfo {
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub expires_at: Timestamp,
}

// =============================================================================
// Monitor
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub status: CheckStatus,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: AggregateStatus,
    pub score: f64,
    pub failover_active: bool,
    pub manual_override: Option<OverrideInfo>,
    pub checks: Vec<HealthCheckResult>,
    pub trends: BTreeMap<String, Vec<TrendPoint>>,
    pub active_incident: Option<Incident>,
    pub incidents: Vec<Incident>,
    pub recommendations: Vec<String>,
    pub deferred_keys: usize,
    pub last_run: Option<Timestamp>,
}

struct MonitorState {
    status: AggregateStatus,
    score: f64,
    checks: Vec<HealthCheckResult>,
    trends: HashMap<String, VecDeque<TrendPoint>>,
    below: u32,
    above: u32,
    failover_cycles: u32,
    active_incident: Option<uuid::Uuid>,
    incidents: VecDeque<Incident>,
    last_run: Option<Timestamp>,
    switch_was_active: bool,
    manual: Option<OverrideInfo>,
}

impl MonitorState {
    fn incident_mut(&mut self, id: uuid::Uuid) -> Option<&mut Incident> {
        self.incidents.iter_mut().find(|i| i.id == id)
    }
}

pub struct HealthMonitor {
    config: HealthConfig,
    coordinator: Arc<CacheCoordinator>,
    analytics: Option<Arc<AnalyticsEngine>>,
    sink: Arc<dyn IncidentSink>,
    state: Mutex<MonitorState>,
    cycle: tokio::sync::Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        coordinator: Arc<CacheCoordinator>,
        analytics: Option<Arc<AnalyticsEngine>>,
        sink: Arc<dyn IncidentSink>,
    ) -> Self {
        Self {
            config,
            coordinator,
            analytics,
            sink,
            state: Mutex::new(MonitorState {
                status: AggregateStatus::Normal,
                score: 100.0,
                checks: Vec::new(),
                trends: HashMap::new(),
                below: 0,
                above: 0,
                failover_cycles: 0,
                active_incident: None,
                incidents: VecDeque::new(),
                last_run: None,
                switch_was_active: false,
                manual: None,
            }),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    fn store(&self) -> Option<&Arc<EntryStore>> {
        self.coordinator.remote().map(|r| r.store())
    }

    pub fn status(&self) -> AggregateStatus {
        self.state.lock().status
    }

    /// True while the coordinator bypasses the remote tier for any reason.
    pub fn is_failover(&self) -> bool {
        self.coordinator.failover().is_active()
    }

    // -------------------------------------------------------------------------
    // Checks
    // -------------------------------------------------------------------------

    fn check_local_tier(&self) -> HealthCheckResult {
        let stats = self.coordinator.local().stats();
        let utilization = stats.utilization();
        let status = if utilization >= self.config.local_utilization_warn {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
        HealthCheckResult::new(
            CHECK_LOCAL_TIER,
            status,
            format!(
                "{} entries, {:.1}% of budget",
                stats.entries,
                utilization * 100.0
            ),
        )
    }

    fn check_entry_store(&self, probes: Option<&[NodeProbe]>) -> HealthCheckResult {
        let Some(probes) = probes else {
            return HealthCheckResult::new(CHECK_ENTRY_STORE, CheckStatus::Pass, "remote tier disabled");
        };
        let reachable = probes.iter().filter(|p| p.ok).count();
        let status = if reachable == probes.len() {
            CheckStatus::Pass
        } else if reachable > 0 {
            CheckStatus::Warn
        } else {
            CheckStatus::Fail
        };
        let mut message = format!("{reachable}/{} nodes reachable", probes.len());
        let failing: Vec<String> = probes
            .iter()
            .filter(|p| !p.ok)
            .map(|p| p.node.to_string())
            .collect();
        if !failing.is_empty() {
            message.push_str(&format!("; failing: {}", failing.join(", ")));
        }
        HealthCheckResult::new(CHECK_ENTRY_STORE, status, message)
    }

    /// Latency bound per node. Also moves nodes between Healthy and Degraded.
    fn check_node_latency(&self, probes: Option<&[NodeProbe]>) -> HealthCheckResult {
        let (Some(probes), Some(store)) = (probes, self.store()) else {
            return HealthCheckResult::new(CHECK_NODE_LATENCY, CheckStatus::Pass, "remote tier disabled");
        };
        let topology = store.topology();
        let mut worst: Option<f64> = None;
        for probe in probes.iter().filter(|p| p.ok) {
            let Some(latency) = probe.latency_ms else {
                continue;
            };
            worst = Some(worst.map_or(latency, |w: f64| w.max(latency)));
            let current = topology.node(&probe.node).map(|n| n.health);
            if latency >= self.config.latency_fail_ms && current == Some(NodeHealth::Healthy) {
                topology.set_node_health(&probe.node, NodeHealth::Degraded);
                tracing::warn!(node = %probe.node, latency_ms = latency, "node degraded by latency");
            } else if latency < self.config.latency_warn_ms && current == Some(NodeHealth::Degraded) {
                topology.set_node_health(&probe.node, NodeHealth::Healthy);
            }
        }
        match worst {
            None => HealthCheckResult::new(CHECK_NODE_LATENCY, CheckStatus::Fail, "no reachable nodes"),
            Some(latency) => {
                let status = if latency >= self.config.latency_fail_ms {
                    CheckStatus::Fail
                } else if latency >= self.config.latency_warn_ms {
                    CheckStatus::Warn
                } else {
                    CheckStatus::Pass
                };
                HealthCheckResult::new(
                    CHECK_NODE_LATENCY,
                    status,
                    format!("slowest node {latency:.1}ms"),
                )
                .with_latency_ms(latency)
            }
        }
    }

    fn check_error_rate(&self) -> HealthCheckResult {
        let Some(analytics) = &self.analytics else {
            return HealthCheckResult::new(CHECK_ERROR_RATE, CheckStatus::Pass, "analytics disabled");
        };
        let window = analytics.window_5m();
        if window.operations == 0 {
            return HealthCheckResult::new(CHECK_ERROR_RATE, CheckStatus::Pass, "no traffic");
        }
        let rate = window.degraded_rate;
        let status = if rate >= self.config.error_rate_fail {
            CheckStatus::Fail
        } else if rate >= self.config.error_rate_warn {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
        HealthCheckResult::new(
            CHECK_ERROR_RATE,
            status,
            format!("{:.1}% degraded over 5m", rate * 100.0),
        )
    }

    fn score(&self, checks: &[HealthCheckResult]) -> f64 {
        let (weighted, total) = checks.iter().fold((0.0, 0.0), |(sum, total), c| {
            let w = self.config.weight(&c.check_name);
            (sum + w * c.status.score(), total + w)
        });
        if total == 0.0 { 100.0 } else { weighted / total }
    }

    // -------------------------------------------------------------------------
    // Cycle
    // -------------------------------------------------------------------------

    /// Run all checks once and apply the failover policy.
    pub async fn run_cycle(&self) -> HealthReport {
        let _cycle = self.cycle.lock().await;

        let probes = match self.store() {
            Some(store) => {
                let probes = store.probe_all().await;
                store.publish_stats();
                Some(probes)
            }
            None => None,
        };
        let checks = vec![
            self.check_local_tier(),
            self.check_entry_store(probes.as_deref()),
            self.check_node_latency(probes.as_deref()),
            self.check_error_rate(),
        ];
        let score = self.score(&checks);
        let local = self.coordinator.local().stats();
        crate::metrics::set_local_occupancy(local.entries, local.bytes_used);
        crate::metrics::set_health_score(score);

        let recovered = self.apply_policy(checks, score);
        if recovered {
            self.coordinator.flush_deferred().await;
        }
        crate::metrics::set_failover_active(self.is_failover());
        self.report()
    }

    /// Returns `true` when the remote tier just became usable again.
    fn apply_policy(&self, checks: Vec<HealthCheckResult>, score: f64) -> bool {
        let switch = self.coordinator.failover();
        let mut state = self.state.lock();

        for check in &checks {
            let trend = state.trends.entry(check.check_name.clone()).or_default();
            trend.push_back(TrendPoint {
                status: check.status,
                timestamp: check.timestamp,
            });
            while trend.len() > self.config.trend_window {
                trend.pop_front();
            }
        }

        if score < self.config.failover_threshold {
            state.below += 1;
            state.above = 0;
        } else if score >= self.config.recovery_threshold {
            state.above += 1;
            state.below = 0;
        } else {
            state.below = 0;
            state.above = 0;
        }

        let status = state.status;
        match status {
            AggregateStatus::Normal if state.below >= self.config.failover_consecutive => {
                let affected: Vec<String> = checks
                    .iter()
                    .filter(|c| c.status != CheckStatus::Pass)
                    .map(|c| c.check_name.clone())
                    .collect();
                let incident = Incident::open(
                    format!(
                        "aggregate score {score:.0} below {:.0} for {} checks",
                        self.config.failover_threshold, state.below
                    ),
                    IncidentSeverity::for_score(score),
                    affected,
                );
                self.sink.opened(&incident);
                crate::metrics::record_incident_opened(&format!("{:?}", incident.severity).to_lowercase());
                state.active_incident = Some(incident.id);
                state.incidents.push_back(incident);
                while state.incidents.len() > self.config.incident_log_size {
                    state.incidents.pop_front();
                }
                state.status = AggregateStatus::Failover;
                state.failover_cycles = 0;
                switch.set_auto(true);
            }
            AggregateStatus::Failover => {
                state.failover_cycles += 1;
                if state.above >= self.config.recovery_consecutive {
                    if let Some(id) = state.active_incident.take() {
                        if let Some(incident) = state.incident_mut(id) {
                            if incident.close() {
                                self.sink.closed(incident);
                            }
                        }
                    }
                    state.status = AggregateStatus::Normal;
                    state.failover_cycles = 0;
                    switch.set_auto(false);
                } else if state.failover_cycles >= self.config.escalation_cycles {
                    if let Some(id) = state.active_incident {
                        if let Some(incident) = state.incident_mut(id) {
                            if incident.escalate() {
                                self.sink.escalated(incident);
                            }
                        }
                    }
                }
            }
            AggregateStatus::Normal => {}
        }

        state.score = score;
        state.checks = checks;
        state.last_run = Some(now_utc());

        let active = switch.is_active();
        let recovered = state.switch_was_active && !active;
        state.switch_was_active = active;
        if state.manual.is_some() && switch.manual_remaining().is_none() {
            state.manual = None;
        }
        recovered
    }

    pub fn report(&self) -> HealthReport {
        let state = self.state.lock();
        let recommendations = recommendations_for(&state.checks);
        let active_incident = state
            .active_incident
            .and_then(|id| state.incidents.iter().find(|i| i.id == id).cloned());
        HealthReport {
            status: state.status,
            score: state.score,
            failover_active: self.coordinator.failover().is_active(),
            manual_override: state.manual.clone(),
            checks: state.checks.clone(),
            trends: state
                .trends
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
                .collect(),
            active_incident,
            incidents: state.incidents.iter().rev().take(20).cloned().collect(),
            recommendations,
            deferred_keys: self.coordinator.deferred_count(),
            last_run: state.last_run,
        }
    }

    // -------------------------------------------------------------------------
    // Operator override
    // -------------------------------------------------------------------------

    pub async fn apply_override(&self, request: FailoverRequest) -> Result<Option<OverrideInfo>> {
        let switch = self.coordinator.failover();
        let info = match request {
            FailoverRequest::LocalOnly { duration } => {
                let duration = checked_duration(duration)?;
                switch.force_for(duration);
                tracing::warn!(duration_secs = duration.as_secs(), "manual failover to local tier");
                Some(OverrideInfo {
                    strategy: "local_only".into(),
                    region: None,
                    expires_at: now_utc().plus(duration),
                })
            }
            FailoverRequest::Region { region, duration } => {
                let duration = checked_duration(duration)?;
                let store = self.store().ok_or_else(|| {
                    CacheError::invalid_request("region pinning needs the remote tier")
                })?;
                let version = store.topology().pin_region(&region, duration)?;
                tracing::warn!(region = %region, version, duration_secs = duration.as_secs(), "reads pinned to region");
                Some(OverrideInfo {
                    strategy: "region".into(),
                    region: Some(region),
                    expires_at: now_utc().plus(duration),
                })
            }
            FailoverRequest::Clear => {
                switch.clear_manual();
                if let Some(store) = self.store() {
                    store.topology().clear_pin();
                }
                tracing::info!("manual failover override cleared");
                None
            }
        };

        let flush = {
            let mut state = self.state.lock();
            state.manual = info.clone();
            let active = switch.is_active();
            let recovered = state.switch_was_active && !active;
            state.switch_was_active = active;
            recovered
        };
        if flush {
            self.coordinator.flush_deferred().await;
        }
        crate::metrics::set_failover_active(switch.is_active());
        Ok(info)
    }

    /// Run a cycle every `interval_secs` until cancelled.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = self.config.interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = monitor.run_cycle().await;
                        tracing::debug!(score = report.score, status = ?report.status, "health cycle");
                    }
                }
            }
        })
    }
}

fn checked_duration(secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(CacheError::invalid_request("duration must be > 0 seconds"));
    }
    if secs > MAX_OVERRIDE_SECS {
        return Err(CacheError::invalid_request(format!(
            "duration must be at most {MAX_OVERRIDE_SECS} seconds"
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn recommendations_for(checks: &[HealthCheckResult]) -> Vec<String> {
    checks
        .iter()
        .filter(|c| c.status != CheckStatus::Pass)
        .filter_map(|c| {
            RECOMMENDATIONS
                .iter()
                .find(|(name, _)| *name == c.check_name)
                .map(|(_, text)| (*text).to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::{KvBackend, MemoryBackend};
    use crate::cache::compression::RemoteCodec;
    use crate::cache::coordinator::Durability;
    use crate::cache::local::LocalTier;
    use crate::cache::topology::TopologyManager;
    use crate::config::{CompressionConfig, CoordinatorConfig};
    use lexicache_core::{CacheNode, IncidentState, NodeId, NodeKind};

    #[derive(Default)]
    struct CountingSink {
        opened: Mutex<u32>,
        closed: Mutex<u32>,
        escalated: Mutex<u32>,
    }

    impl IncidentSink for CountingSink {
        fn opened(&self, _: &Incident) {
            *self.opened.lock() += 1;
        }
        fn escalated(&self, _: &Incident) {
            *self.escalated.lock() += 1;
        }
        fn closed(&self, _: &Incident) {
            *self.closed.lock() += 1;
        }
    }

    struct Fixture {
        monitor: HealthMonitor,
        coordinator: Arc<CacheCoordinator>,
        backend: Arc<MemoryBackend>,
        sink: Arc<CountingSink>,
    }

    fn fixture(config: HealthConfig) -> Fixture {
        let node = CacheNode::new("a", "eu", NodeKind::Primary, "memory://a");
        let topology = Arc::new(TopologyManager::new(vec![node], 1, 1.25));
        let backend = Arc::new(MemoryBackend::new("a"));
        let store = EntryStore::new(
            topology,
            vec![(NodeId::new("a"), Arc::clone(&backend) as Arc<dyn KvBackend>)],
            Duration::from_millis(100),
            1,
        );
        let codec = Arc::new(RemoteCodec::new(Arc::new(store), CompressionConfig::default()));
        let coordinator = Arc::new(CacheCoordinator::new(
            Arc::new(LocalTier::new(1024 * 1024, 64)),
            Some(codec),
            CoordinatorConfig::default(),
            Duration::from_secs(60),
            FailoverSwitch::default(),
            None,
        ));
        let sink = Arc::new(CountingSink::default());
        let monitor = HealthMonitor::new(
            config,
            Arc::clone(&coordinator),
            None,
            Arc::clone(&sink) as Arc<dyn IncidentSink>,
        );
        Fixture {
            monitor,
            coordinator,
            backend,
            sink,
        }
    }

    #[test]
    fn test_switch_manual_expiry() {
        let switch = FailoverSwitch::default();
        assert!(!switch.is_active());
        switch.force_for(Duration::from_secs(60));
        assert!(switch.is_active());
        assert!(!switch.is_auto());
        switch.clear_manual();
        assert!(!switch.is_active());
        switch.force_for(Duration::ZERO);
        assert!(!switch.is_active());
        switch.force_for(Duration::from_secs(u64::MAX / 2));
        assert!(switch.is_active());
        assert!(switch.manual_remaining().unwrap() > Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_healthy_cluster_scores_full() {
        let f = fixture(HealthConfig::default());
        let report = f.monitor.run_cycle().await;
        assert_eq!(report.status, AggregateStatus::Normal);
        assert_eq!(report.score, 100.0);
        assert_eq!(report.checks.len(), 4);
        assert!(report.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_failover_and_recovery() {
        let f = fixture(HealthConfig::default());
        f.backend.set_available(false);

        let first = f.monitor.run_cycle().await;
        assert!(first.score < 50.0);
        assert_eq!(first.status, AggregateStatus::Normal);

        let second = f.monitor.run_cycle().await;
        assert_eq!(second.status, AggregateStatus::Failover);
        assert!(f.monitor.is_failover());
        let incident = second.active_incident.unwrap();
        assert_eq!(incident.state, IncidentState::Open);
        assert!(incident.affected_checks.contains(&CHECK_ENTRY_STORE.to_string()));
        assert!(!second.recommendations.is_empty());
        assert_eq!(*f.sink.opened.lock(), 1);

        f.backend.set_available(true);
        let third = f.monitor.run_cycle().await;
        assert_eq!(third.status, AggregateStatus::Failover);
        let fourth = f.monitor.run_cycle().await;
        assert_eq!(fourth.status, AggregateStatus::Normal);
        assert!(fourth.active_incident.is_none());
        assert_eq!(fourth.incidents[0].state, IncidentState::Closed);
        assert!(!f.monitor.is_failover());
        assert_eq!(*f.sink.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_recovery_flushes_deferred_deletes() {
        let f = fixture(HealthConfig::default());
        f.coordinator
            .set("k", b"v".to_vec(), Duration::from_secs(60), Durability::Strong)
            .await
            .unwrap();
        f.backend.set_available(false);
        f.monitor.run_cycle().await;
        f.monitor.run_cycle().await;
        assert!(f.monitor.is_failover());

        f.coordinator.delete("k").await.unwrap();
        assert_eq!(f.coordinator.deferred_count(), 1);

        f.backend.set_available(true);
        f.monitor.run_cycle().await;
        f.monitor.run_cycle().await;
        assert_eq!(f.coordinator.deferred_count(), 0);
        assert!(!f.coordinator.get("k").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_incident_escalates() {
        let f = fixture(HealthConfig {
            escalation_cycles: 2,
            ..HealthConfig::default()
        });
        f.backend.set_available(false);
        for _ in 0..4 {
            f.monitor.run_cycle().await;
        }
        let report = f.monitor.report();
        assert_eq!(
            report.active_incident.unwrap().state,
            IncidentState::Escalated
        );
        assert_eq!(*f.sink.escalated.lock(), 1);
    }

    #[tokio::test]
    async fn test_trend_window_is_bounded() {
        let f = fixture(HealthConfig {
            trend_window: 3,
            ..HealthConfig::default()
        });
        for _ in 0..5 {
            f.monitor.run_cycle().await;
        }
        let report = f.monitor.report();
        assert_eq!(report.trends[CHECK_LOCAL_TIER].len(), 3);
    }

    #[tokio::test]
    async fn test_manual_override() {
        let f = fixture(HealthConfig::default());
        let info = f
            .monitor
            .apply_override(FailoverRequest::LocalOnly { duration: 60 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.strategy, "local_only");
        assert!(f.monitor.is_failover());
        assert_eq!(f.monitor.status(), AggregateStatus::Normal);

        f.monitor.apply_override(FailoverRequest::Clear).await.unwrap();
        assert!(!f.monitor.is_failover());

        assert!(
            f.monitor
                .apply_override(FailoverRequest::LocalOnly { duration: 0 })
                .await
                .is_err()
        );
        let too_long = f
            .monitor
            .apply_override(FailoverRequest::LocalOnly {
                duration: u64::MAX / 2,
            })
            .await
            .unwrap_err();
        assert!(matches!(too_long, CacheError::InvalidRequest(_)));
        assert!(!f.monitor.is_failover());
        let pinned = f
            .monitor
            .apply_override(FailoverRequest::Region {
                region: "eu".into(),
                duration: 30,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.region.as_deref(), Some("eu"));
        assert!(
            f.monitor
                .apply_override(FailoverRequest::Region {
                    region: "mars".into(),
                    duration: 30,
                })
                .await
                .is_err()
        );
    }

    #[test]
    fn test_failover_request_wire_format() {
        let req: FailoverRequest =
            serde_json::from_str(r#"{"strategy":"region","region":"eu","duration":120}"#).unwrap();
        assert_eq!(
            req,
            FailoverRequest::Region {
                region: "eu".into(),
                duration: 120
            }
        );
        let req: FailoverRequest = serde_json::from_str(r#"{"strategy":"clear"}"#).unwrap();
        assert_eq!(req, FailoverRequest::Clear);
    }
}
