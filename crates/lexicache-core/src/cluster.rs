use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Primary,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Unreachable,
}

impl NodeHealth {
    /// Unreachable nodes are excluded from routing and from balance math.
    pub fn is_routable(&self) -> bool {
        !matches!(self, NodeHealth::Unreachable)
    }

    /// Multiplier applied to a node's latency when ranking read targets.
    pub fn routing_penalty(&self) -> f64 {
        match self {
            NodeHealth::Healthy => 1.0,
            NodeHealth::Degraded => 2.0,
            NodeHealth::Unreachable => f64::INFINITY,
        }
    }
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeHealth::Healthy => write!(f, "healthy"),
            NodeHealth::Degraded => write!(f, "degraded"),
            NodeHealth::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub hit_rate: f64,
    pub avg_latency_ms: f64,
    pub memory_used_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheNode {
    pub id: NodeId,
    pub region: String,
    pub kind: NodeKind,
    pub health: NodeHealth,
    pub last_seen_at: Option<Timestamp>,
    /// Backend endpoint, e.g. `redis://cache-eu-1:6379`.
    pub endpoint: String,
    pub stats: NodeStats,
}

impl CacheNode {
    pub fn new(
        id: impl Into<String>,
        region: impl Into<String>,
        kind: NodeKind,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: NodeId::new(id),
            region: region.into(),
            kind,
            health: NodeHealth::Healthy,
            last_seen_at: None,
            endpoint: endpoint.into(),
            stats: NodeStats::default(),
        }
    }

    pub fn with_health(mut self, health: NodeHealth) -> Self {
        self.health = health;
        self
    }
}

/// Read model of the cluster map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    pub nodes: Vec<CacheNode>,
    pub regions: BTreeMap<String, usize>,
    pub replication_factor: u8,
    pub version: u64,
    pub warnings: Vec<String>,
}

impl ClusterTopology {
    pub fn from_nodes(nodes: Vec<CacheNode>, replication_factor: u8, version: u64) -> Self {
        let mut regions = BTreeMap::new();
        for node in &nodes {
            *regions.entry(node.region.clone()).or_insert(0) += 1;
        }
        let mut topology = Self {
            nodes,
            regions,
            replication_factor,
            version,
            warnings: Vec::new(),
        };
        if !topology.replication_satisfied() {
            topology.warnings.push(format!(
                "replication factor {} exceeds {} healthy node(s); writes are best-effort",
                replication_factor,
                topology.healthy_node_count()
            ));
        }
        topology
    }

    pub fn healthy_node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.health.is_routable()).count()
    }

    pub fn replication_satisfied(&self) -> bool {
        self.replication_factor as usize <= self.healthy_node_count()
    }
}
