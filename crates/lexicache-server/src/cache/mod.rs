//! Two-tier cache coordination.
//!
//! ## Architecture
//!
//! - **Local tier**: in-process, byte-budgeted LRU per instance
//! - **Entry store**: shared Redis nodes behind a slot-based topology
//! - **Coordinator**: the only component callers talk to
//!
//! ```text
//! request → Coordinator → LocalTier ─miss→ RemoteCodec → EntryStore → node
//!                 │                                          ↑
//!                 └── write-behind queue ────────────────────┘
//! ```
//!
//! Invalidation, warming, health and benchmarking all act through the
//! coordinator. Analytics consumes its access samples over a channel.
//!
//! ## Graceful Degradation
//!
//! If the entry store is unavailable the coordinator keeps serving from the
//! local tier and flags results as degraded. The health monitor flips the
//! failover switch when the aggregate score stays low.

pub mod analytics;
pub mod backend;
pub mod benchmark;
pub mod compression;
pub mod coordinator;
pub mod entry_store;
pub mod health;
pub mod invalidation;
pub mod jobs;
pub mod local;
pub mod topology;
pub mod warming;

pub use analytics::{AnalyticsEngine, AnalyticsRecorder, AnalyticsReport};
pub use backend::{KvBackend, MemoryBackend, RedisBackend};
pub use benchmark::{BenchmarkDashboard, BenchmarkHarness};
pub use compression::{CompressionStats, RemoteCodec};
pub use coordinator::{CacheCoordinator, Durability, GetResult, WarmOutcome};
pub use entry_store::EntryStore;
pub use health::{FailoverRequest, FailoverSwitch, HealthMonitor, HealthReport, TracingSink};
pub use invalidation::{InvalidationOutcome, InvalidationPropagator};
pub use jobs::JobStore;
pub use local::{LocalTier, LocalTierStats};
pub use topology::{RebalanceReport, TopologyManager};
pub use warming::{WarmRequest, WarmSource, WarmingScheduler};
