//! Cluster map: nodes, slot ownership and routing.
//!
//! The key space is split into 1024 slots (first two bytes of the key's
//! SHA-256). Each slot has an ordered owner list: a primary followed by
//! `replication_factor - 1` replicas. The whole map is an immutable
//! snapshot published through `ArcSwap`, so readers always see a complete
//! version; writers are serialized by a mutex and bump `version` on every
//! publish.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use lexicache_core::{
    CacheError, CacheNode, ClusterTopology, NodeHealth, NodeId, NodeStats, Result, deadline_after,
    now_utc,
};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const SLOT_COUNT: usize = 1024;

pub fn slot_for(key: &str) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    (u16::from_be_bytes([digest[0], digest[1]]) as usize) % SLOT_COUNT
}

#[derive(Debug, Clone)]
struct RegionPin {
    region: String,
    until: Instant,
}

#[derive(Debug, Clone)]
struct TopologySnapshot {
    version: u64,
    nodes: Vec<CacheNode>,
    /// owners[slot][0] is the primary
    owners: Vec<Vec<NodeId>>,
    replication_factor: u8,
    pin: Option<RegionPin>,
}

impl TopologySnapshot {
    fn node(&self, id: &NodeId) -> Option<&CacheNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    fn is_routable(&self, id: &NodeId) -> bool {
        self.node(id).is_some_and(|n| n.health.is_routable())
    }

    fn active_pin(&self) -> Option<&str> {
        self.pin
            .as_ref()
            .filter(|p| p.until > Instant::now())
            .map(|p| p.region.as_str())
    }

    fn in_region(&self, id: &NodeId, region: &str) -> bool {
        self.node(id).is_some_and(|n| n.region == region)
    }

    fn routing_cost(&self, id: &NodeId) -> f64 {
        self.node(id)
            .map(|n| n.stats.avg_latency_ms.max(0.01) * n.health.routing_penalty())
            .unwrap_or(f64::INFINITY)
    }
}

/// Where a write goes.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRoute {
    pub target: NodeId,
    pub replicas: Vec<NodeId>,
    /// Primary that should have taken the write but was unreachable.
    pub redirected_from: Option<NodeId>,
}

/// Outcome of `rebalance`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceReport {
    pub version: u64,
    pub moved_slots: usize,
    pub total_keys: u64,
    pub healthy_nodes: usize,
    /// Per-node load ceiling that triggered moves.
    pub bound: f64,
    pub node_keys: BTreeMap<String, u64>,
    pub node_slots: BTreeMap<String, usize>,
    /// Keys copied onto their new owners after the ownership change.
    pub migrated_keys: usize,
    pub warnings: Vec<String>,
}

pub struct TopologyManager {
    current: ArcSwap<TopologySnapshot>,
    write_lock: Mutex<()>,
    balance_factor: f64,
    /// Live remote keys, used to weigh slots during rebalance.
    tracked_keys: DashMap<String, Instant>,
}

impl TopologyManager {
    pub fn new(nodes: Vec<CacheNode>, replication_factor: u8, balance_factor: f64) -> Self {
        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        let owners = (0..SLOT_COUNT)
            .map(|slot| initial_owners(slot, &ids, replication_factor))
            .collect();
        Self {
            current: ArcSwap::from_pointee(TopologySnapshot {
                version: 1,
                nodes,
                owners,
                replication_factor,
                pin: None,
            }),
            write_lock: Mutex::new(()),
            balance_factor,
            tracked_keys: DashMap::new(),
        }
    }

    fn publish(&self, mutate: impl FnOnce(&mut TopologySnapshot)) -> u64 {
        let _guard = self.write_lock.lock();
        let mut next = TopologySnapshot::clone(&self.current.load());
        mutate(&mut next);
        next.version += 1;
        let version = next.version;
        self.current.store(Arc::new(next));
        version
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    pub fn replication_factor(&self) -> u8 {
        self.current.load().replication_factor
    }

    pub fn nodes(&self) -> Vec<CacheNode> {
        self.current.load().nodes.clone()
    }

    pub fn node(&self, id: &NodeId) -> Option<CacheNode> {
        self.current.load().node(id).cloned()
    }

    /// Read model for the distributed dashboard.
    pub fn topology(&self) -> ClusterTopology {
        let snap = self.current.load();
        let mut topology =
            ClusterTopology::from_nodes(snap.nodes.clone(), snap.replication_factor, snap.version);
        if let Some(region) = snap.active_pin() {
            topology
                .warnings
                .push(format!("routing pinned to region '{region}'"));
        }
        topology
    }

    /// Owner lists for every slot, primary first.
    pub fn slot_owners(&self) -> Vec<Vec<NodeId>> {
        self.current.load().owners.clone()
    }

    pub fn owners(&self, key: &str) -> Vec<NodeId> {
        self.current.load().owners[slot_for(key)].clone()
    }

    /// Lowest-cost routable owner of `key`'s slot.
    pub fn route_read(&self, key: &str) -> Option<NodeId> {
        let snap = self.current.load();
        let slot = slot_for(key);
        let owners = &snap.owners[slot];
        if let Some(region) = snap.active_pin() {
            return pinned_target(&snap, owners, region, slot);
        }
        owners
            .iter()
            .filter(|id| snap.is_routable(id))
            .min_by(|a, b| snap.routing_cost(a).total_cmp(&snap.routing_cost(b)))
            .cloned()
    }

    /// Primary of `key`'s slot, or the first routable replica if the
    /// primary is unreachable.
    pub fn route_write(&self, key: &str) -> Option<WriteRoute> {
        let snap = self.current.load();
        let slot = slot_for(key);
        let owners = &snap.owners[slot];

        let (target, redirected_from) = if let Some(region) = snap.active_pin() {
            let target = pinned_target(&snap, owners, region, slot)?;
            let redirected = owners.first().filter(|p| **p != target).cloned();
            (target, redirected)
        } else {
            let primary = owners.first()?;
            if snap.is_routable(primary) {
                (primary.clone(), None)
            } else {
                let fallback = owners.iter().skip(1).find(|id| snap.is_routable(id))?;
                (fallback.clone(), Some(primary.clone()))
            }
        };

        let replicas = owners
            .iter()
            .filter(|id| **id != target && snap.is_routable(id))
            .filter(|id| redirected_from.as_ref() != Some(*id))
            .cloned()
            .collect();
        Some(WriteRoute {
            target,
            replicas,
            redirected_from,
        })
    }

    // -------------------------------------------------------------------------
    // Node management
    // -------------------------------------------------------------------------

    pub fn add_node(&self, node: CacheNode) -> Result<u64> {
        if self.current.load().node(&node.id).is_some() {
            return Err(CacheError::conflict(format!("node {} already exists", node.id)));
        }
        tracing::info!(node = %node.id, region = %node.region, "node added to topology");
        Ok(self.publish(|snap| snap.nodes.push(node)))
    }

    /// Remove a node and reassign its slots.
    pub fn remove_node(&self, id: &NodeId) -> Result<RebalanceReport> {
        if self.current.load().node(id).is_none() {
            return Err(CacheError::not_found(format!("node {id}")));
        }
        self.publish(|snap| {
            snap.nodes.retain(|n| &n.id != id);
            for owners in snap.owners.iter_mut() {
                owners.retain(|o| o != id);
            }
        });
        tracing::info!(node = %id, "node removed from topology");
        self.rebalance()
    }

    /// Returns the previous health when it changed.
    pub fn set_node_health(&self, id: &NodeId, health: NodeHealth) -> Option<NodeHealth> {
        let snap = self.current.load();
        let previous = snap.node(id)?.health;
        if previous == health {
            return None;
        }
        drop(snap);
        self.publish(|snap| {
            if let Some(node) = snap.nodes.iter_mut().find(|n| &n.id == id) {
                node.health = health;
                if health.is_routable() {
                    node.last_seen_at = Some(now_utc());
                }
            }
        });
        crate::metrics::record_node_transition(id.as_str(), &health.to_string());
        tracing::warn!(node = %id, from = %previous, to = %health, "node health changed");
        Some(previous)
    }

    /// Refresh stats for every node in one publish.
    pub fn update_stats(&self, stats: &HashMap<NodeId, (NodeStats, bool)>) {
        self.publish(|snap| {
            for node in snap.nodes.iter_mut() {
                if let Some((s, seen)) = stats.get(&node.id) {
                    node.stats = *s;
                    if *seen {
                        node.last_seen_at = Some(now_utc());
                    }
                }
            }
        });
    }

    pub fn pin_region(&self, region: &str, duration: Duration) -> Result<u64> {
        let snap = self.current.load();
        if !snap
            .nodes
            .iter()
            .any(|n| n.region == region && n.health.is_routable())
        {
            return Err(CacheError::invalid_request(format!(
                "region '{region}' has no routable nodes"
            )));
        }
        drop(snap);
        let pin = RegionPin {
            region: region.to_string(),
            until: deadline_after(duration),
        };
        tracing::warn!(region, duration_secs = duration.as_secs(), "routing pinned to region");
        Ok(self.publish(|snap| snap.pin = Some(pin)))
    }

    pub fn clear_pin(&self) {
        if self.current.load().pin.is_some() {
            self.publish(|snap| snap.pin = None);
        }
    }

    pub fn pinned_region(&self) -> Option<String> {
        self.current.load().active_pin().map(str::to_string)
    }

    // -------------------------------------------------------------------------
    // Key accounting
    // -------------------------------------------------------------------------

    pub fn record_key(&self, key: &str, ttl: Duration) {
        self.tracked_keys
            .insert(key.to_string(), deadline_after(ttl));
    }

    pub fn forget_key(&self, key: &str) {
        self.tracked_keys.remove(key);
    }

    /// Drop tracked keys whose TTL has passed. Returns how many went.
    pub fn prune_tracked_keys(&self) -> usize {
        let now = Instant::now();
        let before = self.tracked_keys.len();
        self.tracked_keys.retain(|_, deadline| *deadline > now);
        before.saturating_sub(self.tracked_keys.len())
    }

    pub fn tracked_key_count(&self) -> usize {
        self.tracked_keys.len()
    }

    fn slot_weights(&self) -> Vec<u64> {
        self.prune_tracked_keys();
        let mut weights = vec![0u64; SLOT_COUNT];
        for entry in self.tracked_keys.iter() {
            weights[slot_for(entry.key())] += 1;
        }
        weights
    }

    /// Keys held per node as primary.
    pub fn node_key_counts(&self) -> BTreeMap<String, u64> {
        let weights = self.slot_weights();
        let snap = self.current.load();
        let mut counts: BTreeMap<String, u64> = snap
            .nodes
            .iter()
            .map(|n| (n.id.to_string(), 0))
            .collect();
        for (slot, owners) in snap.owners.iter().enumerate() {
            if let Some(primary) = owners.first() {
                *counts.entry(primary.to_string()).or_insert(0) += weights[slot];
            }
        }
        counts
    }

    // -------------------------------------------------------------------------
    // Rebalance
    // -------------------------------------------------------------------------

    /// Recompute slot ownership across routable nodes.
    ///
    /// Existing assignments on healthy nodes are kept; orphaned slots go to
    /// the least-loaded node, then slots move off any node whose load
    /// exceeds `average * balance_factor`. Load is tracked keys, or slot
    /// count while no keys are tracked.
    pub fn rebalance(&self) -> Result<RebalanceReport> {
        let key_weights = self.slot_weights();
        let total_keys: u64 = key_weights.iter().sum();
        let weights: Vec<u64> = if total_keys > 0 {
            key_weights.clone()
        } else {
            vec![1; SLOT_COUNT]
        };
        let balance_factor = self.balance_factor;

        let _guard = self.write_lock.lock();
        let mut next = TopologySnapshot::clone(&self.current.load());

        let healthy: Vec<NodeId> = next
            .nodes
            .iter()
            .filter(|n| n.health.is_routable())
            .map(|n| n.id.clone())
            .collect();
        if healthy.is_empty() {
            return Err(CacheError::unavailable("no routable nodes to rebalance onto"));
        }

        let before: Vec<Option<NodeId>> = next.owners.iter().map(|o| o.first().cloned()).collect();
        let mut load: HashMap<NodeId, u64> = healthy.iter().map(|id| (id.clone(), 0)).collect();
        let mut primary: Vec<Option<NodeId>> = next
            .owners
            .iter()
            .map(|owners| owners.iter().find(|o| load.contains_key(*o)).cloned())
            .collect();
        for (slot, p) in primary.iter().enumerate() {
            if let Some(id) = p {
                *load.entry(id.clone()).or_insert(0) += weights[slot];
            }
        }

        // Orphaned slots, heaviest first, onto the least-loaded node.
        let mut orphans: Vec<usize> = (0..SLOT_COUNT).filter(|s| primary[*s].is_none()).collect();
        orphans.sort_by(|a, b| weights[*b].cmp(&weights[*a]).then(a.cmp(b)));
        for slot in orphans {
            let target = least_loaded(&healthy, &load);
            *load.entry(target.clone()).or_insert(0) += weights[slot];
            primary[slot] = Some(target);
        }

        let total_weight: u64 = weights.iter().sum();
        let bound = total_weight as f64 / healthy.len() as f64 * balance_factor;
        let mut warnings = Vec::new();

        for _ in 0..SLOT_COUNT * 2 {
            let heaviest = most_loaded(&healthy, &load);
            let heaviest_load = load[&heaviest];
            if heaviest_load as f64 <= bound {
                break;
            }
            let lightest = least_loaded(&healthy, &load);
            let lightest_load = load[&lightest];

            // Largest slot that fits under the bound on the target, else the
            // largest one that still narrows the gap.
            let mut candidates: Vec<usize> = (0..SLOT_COUNT)
                .filter(|s| primary[*s].as_ref() == Some(&heaviest) && weights[*s] > 0)
                .collect();
            candidates.sort_by(|a, b| weights[*b].cmp(&weights[*a]).then(a.cmp(b)));
            let pick = candidates
                .iter()
                .find(|s| (lightest_load + weights[**s]) as f64 <= bound)
                .or_else(|| {
                    candidates
                        .iter()
                        .find(|s| lightest_load + weights[**s] < heaviest_load)
                })
                .copied();
            let Some(slot) = pick else {
                warnings.push(format!(
                    "node {heaviest} holds {heaviest_load} keys above bound {bound:.1} and no slot can move"
                ));
                break;
            };
            if let Some(l) = load.get_mut(&heaviest) {
                *l -= weights[slot];
            }
            if let Some(l) = load.get_mut(&lightest) {
                *l += weights[slot];
            }
            primary[slot] = Some(lightest);
        }

        // Rebuild owner lists: primary, surviving replicas, then ring order.
        let rf = next.replication_factor as usize;
        if rf > healthy.len() {
            warnings.push(format!(
                "replication factor {rf} exceeds {} routable node(s)",
                healthy.len()
            ));
        }
        for (slot, owners) in next.owners.iter_mut().enumerate() {
            let Some(p) = primary[slot].clone() else {
                continue;
            };
            let mut rebuilt = vec![p.clone()];
            for o in owners.iter() {
                if rebuilt.len() >= rf {
                    break;
                }
                if !rebuilt.contains(o) && healthy.contains(o) {
                    rebuilt.push(o.clone());
                }
            }
            let start = healthy.iter().position(|id| *id == p).unwrap_or(0);
            for i in 1..healthy.len() {
                if rebuilt.len() >= rf {
                    break;
                }
                let candidate = &healthy[(start + i) % healthy.len()];
                if !rebuilt.contains(candidate) {
                    rebuilt.push(candidate.clone());
                }
            }
            *owners = rebuilt;
        }

        let moved_slots = before
            .iter()
            .zip(next.owners.iter())
            .filter(|(b, o)| b.as_ref() != o.first())
            .count();
        next.version += 1;
        let version = next.version;

        let mut node_keys: BTreeMap<String, u64> =
            next.nodes.iter().map(|n| (n.id.to_string(), 0)).collect();
        let mut node_slots: BTreeMap<String, usize> =
            next.nodes.iter().map(|n| (n.id.to_string(), 0)).collect();
        for (slot, owners) in next.owners.iter().enumerate() {
            if let Some(p) = owners.first() {
                *node_keys.entry(p.to_string()).or_insert(0) += key_weights[slot];
                *node_slots.entry(p.to_string()).or_insert(0) += 1;
            }
        }
        self.current.store(Arc::new(next));

        tracing::info!(version, moved_slots, total_keys, bound, "cluster rebalanced");
        Ok(RebalanceReport {
            version,
            moved_slots,
            total_keys,
            healthy_nodes: healthy.len(),
            bound,
            node_keys,
            node_slots,
            migrated_keys: 0,
            warnings,
        })
    }
}

fn initial_owners(slot: usize, ids: &[NodeId], replication_factor: u8) -> Vec<NodeId> {
    if ids.is_empty() {
        return Vec::new();
    }
    let rf = (replication_factor as usize).min(ids.len()).max(1);
    (0..rf).map(|i| ids[(slot + i) % ids.len()].clone()).collect()
}

fn pinned_target(
    snap: &TopologySnapshot,
    owners: &[NodeId],
    region: &str,
    slot: usize,
) -> Option<NodeId> {
    if let Some(owner) = owners
        .iter()
        .find(|id| snap.is_routable(id) && snap.in_region(id, region))
    {
        return Some(owner.clone());
    }
    let regional: Vec<&CacheNode> = snap
        .nodes
        .iter()
        .filter(|n| n.region == region && n.health.is_routable())
        .collect();
    if regional.is_empty() {
        return None;
    }
    Some(regional[slot % regional.len()].id.clone())
}

fn least_loaded(nodes: &[NodeId], load: &HashMap<NodeId, u64>) -> NodeId {
    nodes
        .iter()
        .min_by_key(|id| load.get(*id).copied().unwrap_or(0))
        .cloned()
        .unwrap_or_else(|| nodes[0].clone())
}

fn most_loaded(nodes: &[NodeId], load: &HashMap<NodeId, u64>) -> NodeId {
    // Ties resolve to the earliest node.
    let mut best = nodes[0].clone();
    let mut best_load = load.get(&best).copied().unwrap_or(0);
    for id in nodes.iter().skip(1) {
        let l = load.get(id).copied().unwrap_or(0);
        if l > best_load {
            best = id.clone();
            best_load = l;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexicache_core::NodeKind;

    fn node(id: &str, region: &str) -> CacheNode {
        CacheNode::new(id, region, NodeKind::Primary, format!("redis://{id}:6379"))
    }

    fn manager(ids: &[(&str, &str)], rf: u8) -> TopologyManager {
        TopologyManager::new(ids.iter().map(|(i, r)| node(i, r)).collect(), rf, 1.25)
    }

    #[test]
    fn test_slot_is_stable_and_bounded() {
        let s = slot_for("translation:en:fr:abc");
        assert_eq!(s, slot_for("translation:en:fr:abc"));
        assert!(s < SLOT_COUNT);
    }

    #[test]
    fn test_prune_drops_expired_tracked_keys() {
        let topo = manager(&[("a", "eu")], 1);
        topo.record_key("session:short", Duration::from_millis(1));
        topo.record_key("session:long", Duration::from_secs(600));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(topo.prune_tracked_keys(), 1);
        assert_eq!(topo.tracked_key_count(), 1);
        assert_eq!(topo.prune_tracked_keys(), 0);
    }

    #[test]
    fn test_initial_owners_respect_replication_factor() {
        let topo = manager(&[("a", "eu"), ("b", "eu"), ("c", "us")], 2);
        for key in ["k1", "k2", "k3", "k4"] {
            let owners = topo.owners(key);
            assert_eq!(owners.len(), 2);
            assert_ne!(owners[0], owners[1]);
        }
    }

    #[test]
    fn test_write_falls_back_to_replica() {
        let topo = manager(&[("a", "eu"), ("b", "eu")], 2);
        let key = "user:1:profile";
        let owners = topo.owners(key);
        let primary = owners[0].clone();

        let route = topo.route_write(key).unwrap();
        assert_eq!(route.target, primary);
        assert_eq!(route.replicas, vec![owners[1].clone()]);
        assert!(route.redirected_from.is_none());

        topo.set_node_health(&primary, NodeHealth::Unreachable);
        let route = topo.route_write(key).unwrap();
        assert_eq!(route.target, owners[1]);
        assert_eq!(route.redirected_from, Some(primary));
        assert!(route.replicas.is_empty());
    }

    #[test]
    fn test_read_prefers_lowest_latency_owner() {
        let topo = manager(&[("a", "eu"), ("b", "eu")], 2);
        let key = "document:9:ocr";
        let owners = topo.owners(key);
        let mut stats = HashMap::new();
        stats.insert(
            owners[0].clone(),
            (
                NodeStats {
                    avg_latency_ms: 40.0,
                    ..Default::default()
                },
                true,
            ),
        );
        stats.insert(
            owners[1].clone(),
            (
                NodeStats {
                    avg_latency_ms: 2.0,
                    ..Default::default()
                },
                true,
            ),
        );
        topo.update_stats(&stats);
        assert_eq!(topo.route_read(key), Some(owners[1].clone()));

        topo.set_node_health(&owners[1], NodeHealth::Unreachable);
        assert_eq!(topo.route_read(key), Some(owners[0].clone()));
    }

    #[test]
    fn test_version_increments_on_publish() {
        let topo = manager(&[("a", "eu")], 1);
        let v0 = topo.version();
        topo.set_node_health(&NodeId::new("a"), NodeHealth::Degraded);
        assert_eq!(topo.version(), v0 + 1);
        // No-op transition does not publish
        topo.set_node_health(&NodeId::new("a"), NodeHealth::Degraded);
        assert_eq!(topo.version(), v0 + 1);
    }

    #[test]
    fn test_rebalance_bound_after_node_joins() {
        let topo = manager(&[("a", "eu"), ("b", "eu")], 1);
        for i in 0..10_000 {
            topo.record_key(&format!("translation:en:de:{i:08x}"), Duration::from_secs(600));
        }
        topo.add_node(node("c", "us")).unwrap();
        topo.add_node(node("d", "us")).unwrap();

        let report = topo.rebalance().unwrap();
        assert!(report.moved_slots > 0);
        assert_eq!(report.total_keys, 10_000);
        let bound = 1.25 * (10_000.0 / 4.0);
        for (node, keys) in &report.node_keys {
            assert!(
                (*keys as f64) <= bound,
                "node {node} holds {keys} keys, bound {bound}"
            );
        }
        assert_eq!(report.node_keys, topo.node_key_counts());
    }

    #[test]
    fn test_rebalance_keeps_assignments_when_balanced() {
        let topo = manager(&[("a", "eu"), ("b", "eu")], 1);
        for i in 0..2_000 {
            topo.record_key(&format!("k:{i}"), Duration::from_secs(600));
        }
        let before: Vec<_> = (0..50).map(|i| topo.owners(&format!("k:{i}"))).collect();
        let report = topo.rebalance().unwrap();
        assert_eq!(report.moved_slots, 0);
        let after: Vec<_> = (0..50).map(|i| topo.owners(&format!("k:{i}"))).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_unreachable_node_loses_slots_on_rebalance() {
        let topo = manager(&[("a", "eu"), ("b", "eu"), ("c", "eu")], 2);
        topo.set_node_health(&NodeId::new("c"), NodeHealth::Unreachable);
        let report = topo.rebalance().unwrap();
        assert_eq!(report.healthy_nodes, 2);
        assert_eq!(report.node_slots.get("c"), Some(&0));
        for i in 0..100 {
            let owners = topo.owners(&format!("key:{i}"));
            assert!(!owners.contains(&NodeId::new("c")));
            assert_eq!(owners.len(), 2);
        }
    }

    #[test]
    fn test_remove_node() {
        let topo = manager(&[("a", "eu"), ("b", "eu")], 1);
        let report = topo.remove_node(&NodeId::new("b")).unwrap();
        assert_eq!(report.node_slots.get("a"), Some(&SLOT_COUNT));
        assert!(topo.remove_node(&NodeId::new("b")).is_err());
        assert!(topo.add_node(node("a", "eu")).is_err());
    }

    #[test]
    fn test_region_pin_routes_to_region() {
        let topo = manager(&[("a", "eu"), ("b", "us")], 1);
        topo.pin_region("us", Duration::from_secs(60)).unwrap();
        for i in 0..20 {
            let key = format!("user:{i}:x");
            assert_eq!(topo.route_read(&key), Some(NodeId::new("b")));
            assert_eq!(topo.route_write(&key).unwrap().target, NodeId::new("b"));
        }
        assert_eq!(topo.pinned_region().as_deref(), Some("us"));
        assert!(!topo.topology().warnings.is_empty());
        topo.clear_pin();
        assert!(topo.pinned_region().is_none());
        assert!(topo.pin_region("apac", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_replication_warning_in_read_model() {
        let topo = manager(&[("a", "eu")], 2);
        let topology = topo.topology();
        assert!(!topology.replication_satisfied());
        assert_eq!(topology.warnings.len(), 1);
    }
}
