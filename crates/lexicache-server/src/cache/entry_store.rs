//! Shared remote tier.
//!
//! Every call is routed through the topology manager, carries an explicit
//! deadline, and feeds a per-node tracker (consecutive failures, EWMA
//! latency, hit rate). Writes land on the slot's primary and fan out to its
//! replicas best-effort; writes redirected away from an unreachable primary
//! are remembered and copied back once a probe sees it again.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use lexicache_core::{
    CacheError, CacheNode, NodeHealth, NodeId, NodeStats, Result,
};

use super::backend::{KvBackend, MemoryBackend, RedisBackend};
use super::topology::{RebalanceReport, TopologyManager, slot_for};
use crate::config::{BackendMode, EntryStoreConfig};

const EWMA_ALPHA: f64 = 0.2;
/// Used when a resynced key has no expiry on its source node.
const RESYNC_FALLBACK_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
struct NodeTracker {
    consecutive_failures: u32,
    latency_ewma_ms: Option<f64>,
    lookups: u64,
    hits: u64,
    memory_used_pct: f64,
    seen_since_publish: bool,
}

impl NodeTracker {
    fn observe_latency(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.latency_ewma_ms = Some(match self.latency_ewma_ms {
            Some(prev) => prev + EWMA_ALPHA * (ms - prev),
            None => ms,
        });
    }

    fn stats(&self) -> NodeStats {
        NodeStats {
            hit_rate: if self.lookups == 0 {
                0.0
            } else {
                self.hits as f64 / self.lookups as f64
            },
            avg_latency_ms: self.latency_ewma_ms.unwrap_or(0.0),
            memory_used_pct: self.memory_used_pct,
        }
    }
}

/// Outcome of a single node ping.
#[derive(Debug, Clone)]
pub struct NodeProbe {
    pub node: NodeId,
    pub ok: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
    /// Node came back from `Unreachable` on this probe.
    pub recovered: bool,
    pub resynced_keys: usize,
}

pub struct EntryStore {
    topology: Arc<TopologyManager>,
    backends: DashMap<NodeId, Arc<dyn KvBackend>>,
    trackers: DashMap<NodeId, NodeTracker>,
    pending_resync: DashMap<NodeId, HashSet<String>>,
    timeout: Duration,
    failure_threshold: u32,
}

/// Build cluster nodes from configuration.
pub fn nodes_from_config(cfg: &EntryStoreConfig) -> Vec<CacheNode> {
    cfg.resolved_nodes()
        .into_iter()
        .map(|n| {
            let endpoint = match cfg.mode {
                BackendMode::Redis => n.url.clone().unwrap_or_else(|| cfg.url.clone()),
                BackendMode::Memory => format!("memory://{}", n.id),
            };
            CacheNode::new(n.id, n.region, n.kind, endpoint)
        })
        .collect()
}

impl EntryStore {
    pub fn new(
        topology: Arc<TopologyManager>,
        backends: Vec<(NodeId, Arc<dyn KvBackend>)>,
        timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        let store = Self {
            topology,
            backends: DashMap::new(),
            trackers: DashMap::new(),
            pending_resync: DashMap::new(),
            timeout,
            failure_threshold: failure_threshold.max(1),
        };
        for (id, backend) in backends {
            store.trackers.insert(id.clone(), NodeTracker::default());
            store.backends.insert(id, backend);
        }
        store
    }

    /// Create one backend per configured node.
    pub fn from_config(cfg: &EntryStoreConfig, topology: Arc<TopologyManager>) -> Result<Self> {
        let mut backends: Vec<(NodeId, Arc<dyn KvBackend>)> = Vec::new();
        for node in cfg.resolved_nodes() {
            let id = NodeId::new(node.id.clone());
            let backend: Arc<dyn KvBackend> = match cfg.mode {
                BackendMode::Memory => Arc::new(MemoryBackend::new(node.id.clone())),
                BackendMode::Redis => {
                    let url = node.url.clone().unwrap_or_else(|| cfg.url.clone());
                    tracing::info!(node = %id, url = %url, pool_size = cfg.pool_size, "Creating Redis pool");
                    Arc::new(RedisBackend::connect(
                        node.id.clone(),
                        &url,
                        cfg.pool_size,
                        cfg.timeout(),
                    )?)
                }
            };
            backends.push((id, backend));
        }
        Ok(Self::new(
            topology,
            backends,
            cfg.timeout(),
            cfg.failure_threshold,
        ))
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.backends.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn backend(&self, node: &NodeId) -> Result<Arc<dyn KvBackend>> {
        self.backends
            .get(node)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| CacheError::unavailable(format!("no backend for node {node}")))
    }

    /// Run one backend call against `node` under the store deadline.
    async fn call<T, F, Fut>(&self, node: &NodeId, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn KvBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backend = self.backend(node)?;
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, f(backend)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::timeout(operation, self.timeout)),
        };
        match &outcome {
            Ok(_) => self.record_success(node, started.elapsed()),
            Err(e) if e.is_transient() => self.record_failure(node, operation, e),
            Err(_) => {}
        }
        outcome
    }

    fn record_success(&self, node: &NodeId, elapsed: Duration) {
        if let Some(mut tracker) = self.trackers.get_mut(node) {
            tracker.consecutive_failures = 0;
            tracker.observe_latency(elapsed);
            tracker.seen_since_publish = true;
        }
    }

    fn record_failure(&self, node: &NodeId, operation: &'static str, error: &CacheError) {
        crate::metrics::record_entry_store_error(node.as_str());
        let failures = match self.trackers.get_mut(node) {
            Some(mut tracker) => {
                tracker.consecutive_failures += 1;
                tracker.consecutive_failures
            }
            None => return,
        };
        tracing::debug!(node = %node, operation, failures, error = %error, "entry store call failed");
        if failures >= self.failure_threshold
            && self
                .topology
                .set_node_health(node, NodeHealth::Unreachable)
                .is_some()
        {
            tracing::warn!(node = %node, failures, "node marked unreachable");
        }
    }

    fn record_lookup(&self, node: &NodeId, hit: bool) {
        if let Some(mut tracker) = self.trackers.get_mut(node) {
            tracker.lookups += 1;
            if hit {
                tracker.hits += 1;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Key operations
    // -------------------------------------------------------------------------

    /// Read from the preferred owner, falling back to the other owners on
    /// transient failure.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let first = self
            .topology
            .route_read(key)
            .ok_or_else(|| CacheError::unavailable("no routable node for read"))?;
        let mut candidates = vec![first.clone()];
        candidates.extend(self.topology.owners(key).into_iter().filter(|o| *o != first));

        let mut last_error = None;
        for node in candidates {
            if node != first && !self.topology.node(&node).is_some_and(|n| n.health.is_routable()) {
                continue;
            }
            match self.call(&node, "get", |b| async move { b.get(key).await }).await {
                Ok(value) => {
                    self.record_lookup(&node, value.is_some());
                    return Ok(value);
                }
                Err(e) if e.is_transient() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| CacheError::unavailable("no routable node for read")))
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let route = self
            .topology
            .route_write(key)
            .ok_or_else(|| CacheError::unavailable("no routable node for write"))?;

        self.call(&route.target, "set", |b| async move { b.set(key, value, ttl).await })
            .await?;
        self.topology.record_key(key, ttl);

        if let Some(primary) = &route.redirected_from {
            self.note_redirect(primary, key);
        }
        let fan_out = route.replicas.iter().map(|replica| async move {
            let result = self
                .call(replica, "set", |b| async move { b.set(key, value, ttl).await })
                .await;
            if let Err(e) = result {
                tracing::debug!(node = %replica, key, error = %e, "replica write skipped");
            }
        });
        join_all(fan_out).await;
        Ok(())
    }

    /// Delete from every routable owner. Returns whether any owner held it.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let owners: Vec<NodeId> = self
            .topology
            .owners(key)
            .into_iter()
            .filter(|o| self.topology.node(o).is_some_and(|n| n.health.is_routable()))
            .collect();
        if owners.is_empty() {
            return Err(CacheError::unavailable("no routable node for delete"));
        }

        let results = join_all(
            owners
                .iter()
                .map(|node| self.call(node, "delete", |b| async move { b.delete(key).await })),
        )
        .await;

        for mut keys in self.pending_resync.iter_mut() {
            keys.remove(key);
        }
        self.topology.forget_key(key);

        let mut existed = false;
        let mut first_error = None;
        let mut succeeded = 0;
        for result in results {
            match result {
                Ok(found) => {
                    succeeded += 1;
                    existed |= found;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if succeeded == 0 => Err(e),
            _ => Ok(existed),
        }
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let node = self
            .topology
            .route_read(key)
            .ok_or_else(|| CacheError::unavailable("no routable node for ttl"))?;
        self.call(&node, "ttl", |b| async move { b.ttl(key).await })
            .await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let route = self
            .topology
            .route_write(key)
            .ok_or_else(|| CacheError::unavailable("no routable node for expire"))?;
        let updated = self
            .call(&route.target, "expire", |b| async move { b.expire(key, ttl).await })
            .await?;
        if updated {
            self.topology.record_key(key, ttl);
        }
        join_all(route.replicas.iter().map(|replica| {
            self.call(replica, "expire", |b| async move { b.expire(key, ttl).await })
        }))
        .await;
        Ok(updated)
    }

    /// Counters live on the write target alone. Replicas never receive
    /// increments, so a counter has exactly one authoritative copy.
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let route = self
            .topology
            .route_write(key)
            .ok_or_else(|| CacheError::unavailable("no routable node for incr"))?;
        let value = self
            .call(&route.target, "incr", |b| async move { b.incr(key, delta).await })
            .await?;
        if let Some(primary) = &route.redirected_from {
            self.note_redirect(primary, key);
        }
        Ok(value)
    }

    /// Union of matching keys across all routable nodes.
    pub async fn scan_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let nodes: Vec<NodeId> = self
            .topology
            .nodes()
            .into_iter()
            .filter(|n| n.health.is_routable())
            .map(|n| n.id)
            .collect();
        if nodes.is_empty() {
            return Err(CacheError::unavailable("no routable node for scan"));
        }
        let results = join_all(nodes.iter().map(|node| {
            self.call(node, "scan", |b| async move {
                b.scan_prefix(prefix, limit).await
            })
        }))
        .await;

        let mut keys = HashSet::new();
        let mut errors = 0;
        for result in results {
            match result {
                Ok(batch) => keys.extend(batch),
                Err(e) => {
                    errors += 1;
                    tracing::debug!(prefix, error = %e, "scan skipped a node");
                }
            }
        }
        if errors == nodes.len() {
            return Err(CacheError::unavailable("scan failed on every node"));
        }
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    // -------------------------------------------------------------------------
    // Probing and resync
    // -------------------------------------------------------------------------

    fn note_redirect(&self, primary: &NodeId, key: &str) {
        self.pending_resync
            .entry(primary.clone())
            .or_default()
            .insert(key.to_string());
    }

    pub fn pending_resync(&self, node: &NodeId) -> usize {
        self.pending_resync.get(node).map(|s| s.len()).unwrap_or(0)
    }

    /// Ping a node, refresh its memory usage, and bring it back into routing
    /// if it was unreachable.
    pub async fn probe(&self, node: &NodeId) -> NodeProbe {
        let started = Instant::now();
        let ping = self.call(node, "ping", |b| async move { b.ping().await }).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        if let Err(e) = ping {
            return NodeProbe {
                node: node.clone(),
                ok: false,
                latency_ms: None,
                error: Some(e.to_string()),
                recovered: false,
                resynced_keys: 0,
            };
        }

        if let Ok(pct) = self
            .call(node, "memory", |b| async move { b.memory_used_pct().await })
            .await
        {
            if let Some(mut tracker) = self.trackers.get_mut(node) {
                tracker.memory_used_pct = pct;
            }
        }

        let recovered = self
            .topology
            .node(node)
            .is_some_and(|n| n.health == NodeHealth::Unreachable);
        let mut resynced_keys = 0;
        if recovered {
            self.topology.set_node_health(node, NodeHealth::Healthy);
            resynced_keys = self.resync(node).await;
            tracing::info!(node = %node, resynced_keys, "node recovered");
        }

        NodeProbe {
            node: node.clone(),
            ok: true,
            latency_ms: Some(latency_ms),
            error: None,
            recovered,
            resynced_keys,
        }
    }

    pub async fn probe_all(&self) -> Vec<NodeProbe> {
        let nodes = self.node_ids();
        join_all(nodes.iter().map(|n| self.probe(n))).await
    }

    /// Copy keys written elsewhere while `node` was down back onto it.
    pub async fn resync(&self, node: &NodeId) -> usize {
        let Some((_, keys)) = self.pending_resync.remove(node) else {
            return 0;
        };
        let mut copied = 0;
        for key in keys {
            let sources: Vec<NodeId> = self
                .topology
                .owners(&key)
                .into_iter()
                .filter(|o| o != node)
                .collect();
            for source in sources {
                let value = match self
                    .call(&source, "get", |b| {
                        let key = key.as_str();
                        async move { b.get(key).await }
                    })
                    .await
                {
                    Ok(Some(value)) => value,
                    _ => continue,
                };
                let ttl = self
                    .call(&source, "ttl", |b| {
                        let key = key.as_str();
                        async move { b.ttl(key).await }
                    })
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(RESYNC_FALLBACK_TTL);
                let written = self
                    .call(node, "set", |b| {
                        let key = key.as_str();
                        let value = value.as_slice();
                        async move { b.set(key, value, ttl).await }
                    })
                    .await;
                if written.is_ok() {
                    copied += 1;
                } else {
                    self.note_redirect(node, &key);
                }
                break;
            }
        }
        copied
    }

    /// Push tracker stats into the topology snapshot.
    pub fn publish_stats(&self) {
        let mut stats = HashMap::new();
        for mut entry in self.trackers.iter_mut() {
            let seen = std::mem::take(&mut entry.seen_since_publish);
            stats.insert(entry.key().clone(), (entry.stats(), seen));
        }
        self.topology.update_stats(&stats);
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    /// Register a new node and its backend, then rebalance onto it.
    pub async fn add_node(
        &self,
        node: CacheNode,
        backend: Arc<dyn KvBackend>,
    ) -> Result<RebalanceReport> {
        let id = node.id.clone();
        self.topology.add_node(node)?;
        self.trackers.insert(id.clone(), NodeTracker::default());
        self.backends.insert(id, backend);
        self.rebalance().await
    }

    /// Drain a node's slots onto the remaining nodes, then drop it.
    pub async fn remove_node(&self, id: &NodeId) -> Result<RebalanceReport> {
        let before = self.topology.slot_owners();
        let mut report = self.topology.remove_node(id)?;
        report.migrated_keys = self.migrate(&before).await;
        self.backends.remove(id);
        self.trackers.remove(id);
        self.pending_resync.remove(id);
        Ok(report)
    }

    /// Recompute slot ownership and move data to follow it.
    pub async fn rebalance(&self) -> Result<RebalanceReport> {
        let before = self.topology.slot_owners();
        let mut report = self.topology.rebalance()?;
        report.migrated_keys = self.migrate(&before).await;
        Ok(report)
    }

    /// Copy every key whose slot gained owners onto those owners, then
    /// delete it from sources that no longer own the slot. A key stays on
    /// its source when any copy fails.
    async fn migrate(&self, before: &[Vec<NodeId>]) -> usize {
        let after = self.topology.slot_owners();
        let changed: HashSet<usize> = (0..after.len().min(before.len()))
            .filter(|slot| before[*slot] != after[*slot])
            .collect();
        if changed.is_empty() {
            return 0;
        }

        let mut sources: Vec<NodeId> = before.iter().flatten().cloned().collect();
        sources.sort();
        sources.dedup();

        let mut copied: HashSet<(String, NodeId)> = HashSet::new();
        let mut migrated = 0;
        for source in sources {
            let keys = match self
                .call(&source, "scan", |b| async move { b.scan_prefix("", usize::MAX).await })
                .await
            {
                Ok(keys) => keys,
                Err(e) => {
                    tracing::warn!(node = %source, error = %e, "skipping migration source");
                    continue;
                }
            };
            for key in keys {
                let slot = slot_for(&key);
                if !changed.contains(&slot) || !before[slot].contains(&source) {
                    continue;
                }
                let targets: Vec<NodeId> = after[slot]
                    .iter()
                    .filter(|t| !before[slot].contains(t))
                    .filter(|t| !copied.contains(&(key.clone(), (*t).clone())))
                    .cloned()
                    .collect();
                let mut complete = true;
                if !targets.is_empty() {
                    match self.copy_key(&source, &key, &targets).await {
                        Ok(written) => {
                            for target in written {
                                copied.insert((key.clone(), target));
                            }
                            migrated += 1;
                        }
                        Err(e) => {
                            tracing::warn!(node = %source, key, error = %e, "key migration failed");
                            complete = false;
                        }
                    }
                }
                if complete && !after[slot].contains(&source) {
                    let key = key.as_str();
                    let _ = self
                        .call(&source, "delete", |b| async move { b.delete(key).await })
                        .await;
                }
            }
        }
        if migrated > 0 {
            tracing::info!(migrated, slots = changed.len(), "keys migrated after rebalance");
        }
        migrated
    }

    /// Copy one key with its remaining TTL. Returns the targets written.
    async fn copy_key(&self, source: &NodeId, key: &str, targets: &[NodeId]) -> Result<Vec<NodeId>> {
        let Some(value) = self
            .call(source, "get", |b| async move { b.get(key).await })
            .await?
        else {
            return Ok(Vec::new());
        };
        let ttl = self
            .call(source, "ttl", |b| async move { b.ttl(key).await })
            .await?
            .unwrap_or(RESYNC_FALLBACK_TTL);
        for target in targets {
            let value = value.as_slice();
            self.call(target, "set", |b| async move { b.set(key, value, ttl).await })
                .await?;
        }
        Ok(targets.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexicache_core::NodeKind;

    struct Cluster {
        store: EntryStore,
        backends: HashMap<String, Arc<MemoryBackend>>,
    }

    fn cluster(ids: &[&str], rf: u8, threshold: u32) -> Cluster {
        let nodes: Vec<CacheNode> = ids
            .iter()
            .map(|id| CacheNode::new(*id, "eu", NodeKind::Primary, format!("memory://{id}")))
            .collect();
        let topology = Arc::new(TopologyManager::new(nodes, rf, 1.25));
        let mut backends = HashMap::new();
        let mut dyn_backends: Vec<(NodeId, Arc<dyn KvBackend>)> = Vec::new();
        for id in ids {
            let b = Arc::new(MemoryBackend::new(*id));
            backends.insert(id.to_string(), Arc::clone(&b));
            dyn_backends.push((NodeId::new(*id), b));
        }
        Cluster {
            store: EntryStore::new(topology, dyn_backends, Duration::from_millis(100), threshold),
            backends,
        }
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let c = cluster(&["a"], 1, 3);
        c.store
            .set("user:1:x", b"hello", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(c.store.get("user:1:x").await.unwrap(), Some(b"hello".to_vec()));
        assert!(c.store.delete("user:1:x").await.unwrap());
        assert!(!c.store.delete("user:1:x").await.unwrap());
        assert_eq!(c.store.get("user:1:x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writes_fan_out_to_replicas() {
        let c = cluster(&["a", "b"], 2, 3);
        c.store
            .set("doc:1", b"v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(c.backends["a"].len(), 1);
        assert_eq!(c.backends["b"].len(), 1);
    }

    #[tokio::test]
    async fn test_three_failures_mark_node_unreachable() {
        let c = cluster(&["a"], 1, 3);
        c.backends["a"].set_available(false);
        for _ in 0..3 {
            assert!(c.store.get("k").await.is_err());
        }
        let node = c.store.topology().node(&NodeId::new("a")).unwrap();
        assert_eq!(node.health, NodeHealth::Unreachable);
        // Excluded from routing until a probe succeeds
        assert!(matches!(
            c.store.get("k").await,
            Err(CacheError::Unavailable(_))
        ));

        c.backends["a"].set_available(true);
        let probe = c.store.probe(&NodeId::new("a")).await;
        assert!(probe.ok && probe.recovered);
        assert!(c.store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_deadline_yields_timeout() {
        let c = cluster(&["a"], 1, 3);
        c.backends["a"].set_latency(Duration::from_millis(300));
        let err = c.store.get("slow").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_redirected_write_resyncs_on_recovery() {
        let c = cluster(&["a", "b"], 2, 1);
        let key = "translation:en:fr:1";
        let primary = c.store.topology().owners(key)[0].clone();
        let replica = c.store.topology().owners(key)[1].clone();

        c.backends[primary.as_str()].set_available(false);
        c.store.probe(&primary).await;
        assert_eq!(
            c.store.topology().node(&primary).unwrap().health,
            NodeHealth::Unreachable
        );

        c.store.set(key, b"bonjour", Duration::from_secs(60)).await.unwrap();
        assert_eq!(c.backends[replica.as_str()].len(), 1);
        assert_eq!(c.store.pending_resync(&primary), 1);

        c.backends[primary.as_str()].set_available(true);
        let probe = c.store.probe(&primary).await;
        assert!(probe.recovered);
        assert_eq!(probe.resynced_keys, 1);
        assert_eq!(
            c.backends[primary.as_str()].get(key).await.unwrap(),
            Some(b"bonjour".to_vec())
        );
        assert_eq!(c.store.pending_resync(&primary), 0);
    }

    #[tokio::test]
    async fn test_scan_prefix_unions_nodes() {
        let c = cluster(&["a", "b", "c"], 1, 3);
        for i in 0..30 {
            c.store
                .set(&format!("glossary:7:{i}"), b"t", Duration::from_secs(60))
                .await
                .unwrap();
        }
        let keys = c.store.scan_prefix("glossary:7:", 1000).await.unwrap();
        assert_eq!(keys.len(), 30);
    }

    #[tokio::test]
    async fn test_publish_stats_updates_topology() {
        let c = cluster(&["a"], 1, 3);
        c.store.set("k", b"v", Duration::from_secs(60)).await.unwrap();
        c.store.get("k").await.unwrap();
        c.store.get("missing").await.unwrap();
        c.store.publish_stats();
        let node = c.store.topology().node(&NodeId::new("a")).unwrap();
        assert!((node.stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert!(node.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn test_add_and_remove_node() {
        let c = cluster(&["a"], 1, 3);
        let node = CacheNode::new("b", "us", NodeKind::Replica, "memory://b");
        let report = c
            .store
            .add_node(node, Arc::new(MemoryBackend::new("b")))
            .await
            .unwrap();
        assert_eq!(report.healthy_nodes, 2);
        assert_eq!(c.store.node_ids().len(), 2);
        c.store.remove_node(&NodeId::new("b")).await.unwrap();
        assert_eq!(c.store.node_ids(), vec![NodeId::new("a")]);
    }

    #[tokio::test]
    async fn test_keys_follow_slots_onto_new_node() {
        let c = cluster(&["a", "b"], 1, 3);
        let ttl = Duration::from_secs(600);
        for i in 0..2000 {
            c.store
                .set(&format!("translation:en:de:{i}"), b"hallo", ttl)
                .await
                .unwrap();
        }

        let added = Arc::new(MemoryBackend::new("c"));
        let node = CacheNode::new("c", "eu", NodeKind::Primary, "memory://c");
        let report = c
            .store
            .add_node(node, Arc::clone(&added) as Arc<dyn KvBackend>)
            .await
            .unwrap();
        assert!(report.moved_slots > 0);
        assert!(report.migrated_keys > 0);
        assert_eq!(added.len(), report.migrated_keys);

        for i in 0..2000 {
            let key = format!("translation:en:de:{i}");
            assert_eq!(c.store.get(&key).await.unwrap(), Some(b"hallo".to_vec()), "{key}");
            let remaining = c.store.ttl(&key).await.unwrap().unwrap();
            assert!(remaining <= ttl && remaining > Duration::from_secs(500));
        }
        // Moved keys left their previous owner
        assert_eq!(c.backends["a"].len() + c.backends["b"].len() + added.len(), 2000);
    }

    #[tokio::test]
    async fn test_removed_node_drains_its_keys() {
        let c = cluster(&["a", "b", "c"], 1, 3);
        for i in 0..300 {
            c.store
                .set(&format!("glossary:3:{i}"), b"term", Duration::from_secs(600))
                .await
                .unwrap();
        }
        let drained = c.backends["c"].len();
        assert!(drained > 0);

        let report = c.store.remove_node(&NodeId::new("c")).await.unwrap();
        assert!(report.migrated_keys >= drained);
        assert!(c.backends["c"].is_empty());
        for i in 0..300 {
            let key = format!("glossary:3:{i}");
            assert_eq!(c.store.get(&key).await.unwrap(), Some(b"term".to_vec()), "{key}");
        }
        assert_eq!(c.backends["a"].len() + c.backends["b"].len(), 300);
    }

    #[tokio::test]
    async fn test_counters_stay_on_primary() {
        let c = cluster(&["a", "b"], 2, 3);
        let key = "blobrc:abc";
        assert_eq!(c.store.incr(key, 1).await.unwrap(), 1);
        assert_eq!(c.store.incr(key, 1).await.unwrap(), 2);
        let owners = c.store.topology().owners(key);
        assert_eq!(c.backends[owners[0].as_str()].len(), 1);
        assert_eq!(c.backends[owners[1].as_str()].len(), 0);
    }
}
