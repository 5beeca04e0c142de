//! Shared data model for the lexicache coordination layer.

pub mod benchmark;
pub mod cluster;
pub mod entry;
pub mod error;
pub mod health;
pub mod jobs;
pub mod time;

pub use benchmark::{
    BenchmarkConfig, BenchmarkProfile, BenchmarkRun, BenchmarkSummary, OperationsMix, PayloadSize,
};
pub use cluster::{CacheNode, ClusterTopology, NodeHealth, NodeId, NodeKind, NodeStats};
pub use entry::{CacheEntry, Lookup, Tier};
pub use error::{CacheError, ErrorCategory, Result};
pub use health::{
    AggregateStatus, CheckStatus, HealthCheckResult, Incident, IncidentSeverity, IncidentState,
};
pub use jobs::{
    InvalidationEvent, InvalidationStatus, InvalidationTrigger, WarmingJob, WarmingKind,
    WarmingStatus,
};
pub use crate::time::{Timestamp, deadline_after, now_utc};
