use lexicache_core::NodeKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Shared remote tier (Redis nodes or the in-memory stand-in)
    #[serde(default)]
    pub entry_store: EntryStoreConfig,
    #[serde(default)]
    pub local_tier: LocalTierConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub warming: WarmingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub benchmark: BenchmarkSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Entry store validations
        if self.entry_store.timeout_ms == 0 {
            return Err("entry_store.timeout_ms must be > 0".into());
        }
        if self.entry_store.failure_threshold == 0 {
            return Err("entry_store.failure_threshold must be > 0".into());
        }
        if self.entry_store.mode == BackendMode::Redis && self.entry_store.pool_size == 0 {
            return Err("entry_store.pool_size must be > 0".into());
        }
        let nodes = self.entry_store.resolved_nodes();
        let mut seen = std::collections::HashSet::new();
        for node in &nodes {
            if node.id.is_empty() {
                return Err("entry_store.nodes[].id must not be empty".into());
            }
            if !seen.insert(node.id.as_str()) {
                return Err(format!("entry_store.nodes contains duplicate id '{}'", node.id));
            }
        }
        // Local tier validations
        if self.local_tier.memory_budget_bytes == 0 {
            return Err("local_tier.memory_budget_bytes must be > 0".into());
        }
        if self.local_tier.default_ttl_secs == 0 {
            return Err("local_tier.default_ttl_secs must be > 0".into());
        }
        if self.local_tier.sweep_interval_secs == 0 {
            return Err("local_tier.sweep_interval_secs must be > 0".into());
        }
        // Coordinator validations
        if self.coordinator.write_behind_capacity == 0 || self.coordinator.write_behind_concurrency == 0
        {
            return Err("coordinator write-behind capacity and concurrency must be > 0".into());
        }
        if self.coordinator.strong_write_timeout_ms == 0 || self.coordinator.remote_timeout_ms == 0 {
            return Err("coordinator timeouts must be > 0".into());
        }
        // Compression validations
        if !(0.0..1.0).contains(&self.compression.min_savings_ratio) {
            return Err("compression.min_savings_ratio must be in [0, 1)".into());
        }
        if self.compression.level > 9 {
            return Err("compression.level must be between 0 and 9".into());
        }
        // Health validations
        let h = &self.health;
        if !(0.0..=100.0).contains(&h.failover_threshold)
            || !(0.0..=100.0).contains(&h.recovery_threshold)
        {
            return Err("health thresholds must be within 0..=100".into());
        }
        if h.recovery_threshold <= h.failover_threshold {
            return Err("health.recovery_threshold must be > health.failover_threshold".into());
        }
        if h.failover_consecutive == 0 || h.recovery_consecutive == 0 {
            return Err("health consecutive-check counts must be > 0".into());
        }
        if h.trend_window == 0 || h.incident_log_size == 0 {
            return Err("health.trend_window and health.incident_log_size must be > 0".into());
        }
        if h.weights.values().any(|w| *w < 0.0) {
            return Err("health.weights must be non-negative".into());
        }
        if h.latency_warn_ms >= h.latency_fail_ms {
            return Err("health.latency_warn_ms must be < health.latency_fail_ms".into());
        }
        // Topology validations
        if self.topology.replication_factor == 0 {
            return Err("topology.replication_factor must be >= 1".into());
        }
        if self.topology.balance_factor < 1.0 {
            return Err("topology.balance_factor must be >= 1.0".into());
        }
        // Warming validations
        if self.warming.per_job_concurrency == 0 || self.warming.global_permits == 0 {
            return Err("warming concurrency limits must be > 0".into());
        }
        if self.warming.job_timeout_secs == 0 {
            return Err("warming.job_timeout_secs must be > 0".into());
        }
        // Analytics validations
        if self.analytics.channel_capacity == 0 {
            return Err("analytics.channel_capacity must be > 0".into());
        }
        if self.analytics.lookback_days == 0 {
            return Err("analytics.lookback_days must be > 0".into());
        }
        // Benchmark validations
        if self.benchmark.baseline_runs == 0 {
            return Err("benchmark.baseline_runs must be > 0".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Which key/value backend the entry store talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// In-process stand-in, used for local development and tests
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_node_kind")]
    pub kind: NodeKind,
    /// Redis URL; falls back to `entry_store.url`
    #[serde(default)]
    pub url: Option<String>,
}

fn default_region() -> String {
    "default".into()
}
fn default_node_kind() -> NodeKind {
    NodeKind::Primary
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryStoreConfig {
    #[serde(default = "default_entry_store_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: BackendMode,
    /// Default Redis URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Connection pool size per node
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Per-operation deadline in milliseconds
    #[serde(default = "default_entry_store_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive connection failures before a node is marked unreachable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

fn default_entry_store_enabled() -> bool {
    true
}
fn default_redis_url() -> String {
    "redis://localhost:6379".into()
}
fn default_pool_size() -> usize {
    10
}
fn default_entry_store_timeout_ms() -> u64 {
    250
}
fn default_failure_threshold() -> u32 {
    3
}

impl Default for EntryStoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_entry_store_enabled(),
            mode: BackendMode::default(),
            url: default_redis_url(),
            pool_size: default_pool_size(),
            timeout_ms: default_entry_store_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            nodes: Vec::new(),
        }
    }
}

impl EntryStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Configured nodes, or a single primary at `url` when none are listed.
    pub fn resolved_nodes(&self) -> Vec<NodeConfig> {
        if self.nodes.is_empty() {
            return vec![NodeConfig {
                id: "node-1".into(),
                region: default_region(),
                kind: NodeKind::Primary,
                url: Some(self.url.clone()),
            }];
        }
        self.nodes
            .iter()
            .map(|n| NodeConfig {
                url: n.url.clone().or_else(|| Some(self.url.clone())),
                ..n.clone()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTierConfig {
    #[serde(default = "default_memory_budget")]
    pub memory_budget_bytes: u64,
    /// TTL applied when a caller passes a zero TTL
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Bookkeeping cost charged per entry on top of key and value bytes
    #[serde(default = "default_entry_overhead")]
    pub entry_overhead_bytes: u64,
}

fn default_memory_budget() -> u64 {
    64 * 1024 * 1024
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_entry_overhead() -> u64 {
    96
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: default_memory_budget(),
            default_ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            entry_overhead_bytes: default_entry_overhead(),
        }
    }
}

impl LocalTierConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// How long a strong-durability write waits for the entry store
    #[serde(default = "default_strong_write_timeout_ms")]
    pub strong_write_timeout_ms: u64,
    /// Read budget for entry store lookups
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    #[serde(default = "default_write_behind_capacity")]
    pub write_behind_capacity: usize,
    #[serde(default = "default_write_behind_concurrency")]
    pub write_behind_concurrency: usize,
    #[serde(default = "default_write_behind_max_retries")]
    pub write_behind_max_retries: u32,
    #[serde(default = "default_write_behind_retry_base_ms")]
    pub write_behind_retry_base_ms: u64,
    #[serde(default = "default_get_many_concurrency")]
    pub get_many_concurrency: usize,
}

fn default_strong_write_timeout_ms() -> u64 {
    2_000
}
fn default_remote_timeout_ms() -> u64 {
    250
}
fn default_write_behind_capacity() -> usize {
    10_000
}
fn default_write_behind_concurrency() -> usize {
    16
}
fn default_write_behind_max_retries() -> u32 {
    3
}
fn default_write_behind_retry_base_ms() -> u64 {
    100
}
fn default_get_many_concurrency() -> usize {
    32
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strong_write_timeout_ms: default_strong_write_timeout_ms(),
            remote_timeout_ms: default_remote_timeout_ms(),
            write_behind_capacity: default_write_behind_capacity(),
            write_behind_concurrency: default_write_behind_concurrency(),
            write_behind_max_retries: default_write_behind_max_retries(),
            write_behind_retry_base_ms: default_write_behind_retry_base_ms(),
            get_many_concurrency: default_get_many_concurrency(),
        }
    }
}

impl CoordinatorConfig {
    pub fn strong_write_timeout(&self) -> Duration {
        Duration::from_millis(self.strong_write_timeout_ms)
    }
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.write_behind_retry_base_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub dedup_enabled: bool,
    /// Values at or below this size are stored raw
    #[serde(default = "default_compression_threshold")]
    pub threshold_bytes: usize,
    /// Minimum fraction of bytes saved for a compressed copy to be kept
    #[serde(default = "default_min_savings_ratio")]
    pub min_savings_ratio: f64,
    #[serde(default = "default_compression_level")]
    pub level: u32,
}

fn default_true() -> bool {
    true
}
fn default_compression_threshold() -> usize {
    1024
}
fn default_min_savings_ratio() -> f64 {
    0.10
}
fn default_compression_level() -> u32 {
    6
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dedup_enabled: true,
            threshold_bytes: default_compression_threshold(),
            min_savings_ratio: default_min_savings_ratio(),
            level: default_compression_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    #[serde(default = "default_invalidation_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_invalidation_retry_base_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_delete_concurrency")]
    pub delete_concurrency: usize,
    /// How long finished events stay visible on the dashboard
    #[serde(default = "default_job_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_job_history_max")]
    pub history_max: usize,
}

fn default_invalidation_max_retries() -> u32 {
    3
}
fn default_invalidation_retry_base_ms() -> u64 {
    500
}
fn default_delete_concurrency() -> usize {
    32
}
fn default_job_retention_secs() -> u64 {
    3600
}
fn default_job_history_max() -> usize {
    1000
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_invalidation_max_retries(),
            retry_base_delay_ms: default_invalidation_retry_base_ms(),
            delete_concurrency: default_delete_concurrency(),
            retention_secs: default_job_retention_secs(),
            history_max: default_job_history_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_analytics_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u64,
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    /// Share of total requests above which a key is a hotspot
    #[serde(default = "default_hotspot_share")]
    pub hotspot_share: f64,
    #[serde(default = "default_hotspot_limit")]
    pub hotspot_limit: usize,
    /// Keys need this many requests before miss rate is judged
    #[serde(default = "default_inefficiency_min_requests")]
    pub inefficiency_min_requests: u64,
    #[serde(default = "default_inefficiency_miss_rate")]
    pub inefficiency_miss_rate: f64,
}

fn default_analytics_channel_capacity() -> usize {
    10_000
}
fn default_lookback_days() -> u64 {
    7
}
fn default_max_tracked_keys() -> usize {
    100_000
}
fn default_prune_interval_secs() -> u64 {
    300
}
fn default_hotspot_share() -> f64 {
    0.05
}
fn default_hotspot_limit() -> usize {
    20
}
fn default_inefficiency_min_requests() -> u64 {
    20
}
fn default_inefficiency_miss_rate() -> f64 {
    0.5
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_analytics_channel_capacity(),
            lookback_days: default_lookback_days(),
            max_tracked_keys: default_max_tracked_keys(),
            prune_interval_secs: default_prune_interval_secs(),
            hotspot_share: default_hotspot_share(),
            hotspot_limit: default_hotspot_limit(),
            inefficiency_min_requests: default_inefficiency_min_requests(),
            inefficiency_miss_rate: default_inefficiency_miss_rate(),
        }
    }
}

impl AnalyticsConfig {
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_days * 24 * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmingConfig {
    /// Run predictive warming on a timer
    #[serde(default = "default_true")]
    pub timer_enabled: bool,
    #[serde(default = "default_warming_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_horizon_hours")]
    pub horizon_hours: u32,
    #[serde(default = "default_per_job_concurrency")]
    pub per_job_concurrency: usize,
    /// Shared across all jobs so warming never crowds out foreground traffic
    #[serde(default = "default_global_permits")]
    pub global_permits: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_max_keys_per_job")]
    pub max_keys_per_job: usize,
    /// Origin loader base URL; keys are fetched from `{origin_url}/{key}`
    #[serde(default)]
    pub origin_url: Option<String>,
    #[serde(default = "default_origin_timeout_ms")]
    pub origin_timeout_ms: u64,
    #[serde(default = "default_job_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_job_history_max")]
    pub history_max: usize,
}

fn default_warming_interval_secs() -> u64 {
    900
}
fn default_horizon_hours() -> u32 {
    2
}
fn default_per_job_concurrency() -> usize {
    8
}
fn default_global_permits() -> usize {
    16
}
fn default_job_timeout_secs() -> u64 {
    60
}
fn default_max_keys_per_job() -> usize {
    5_000
}
fn default_origin_timeout_ms() -> u64 {
    2_000
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            timer_enabled: true,
            interval_secs: default_warming_interval_secs(),
            horizon_hours: default_horizon_hours(),
            per_job_concurrency: default_per_job_concurrency(),
            global_permits: default_global_permits(),
            job_timeout_secs: default_job_timeout_secs(),
            max_keys_per_job: default_max_keys_per_job(),
            origin_url: None,
            origin_timeout_ms: default_origin_timeout_ms(),
            retention_secs: default_job_retention_secs(),
            history_max: default_job_history_max(),
        }
    }
}

impl WarmingConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: f64,
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: f64,
    #[serde(default = "default_consecutive")]
    pub failover_consecutive: u32,
    #[serde(default = "default_consecutive")]
    pub recovery_consecutive: u32,
    /// Failover cycles after which an open incident is escalated
    #[serde(default = "default_escalation_cycles")]
    pub escalation_cycles: u32,
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
    #[serde(default = "default_incident_log_size")]
    pub incident_log_size: usize,
    #[serde(default = "default_latency_warn_ms")]
    pub latency_warn_ms: f64,
    #[serde(default = "default_latency_fail_ms")]
    pub latency_fail_ms: f64,
    #[serde(default = "default_error_rate_warn")]
    pub error_rate_warn: f64,
    #[serde(default = "default_error_rate_fail")]
    pub error_rate_fail: f64,
    #[serde(default = "default_utilization_warn")]
    pub local_utilization_warn: f64,
    /// Per-check weight; unknown checks weigh 1.0
    #[serde(default = "default_weights")]
    pub weights: HashMap<String, f64>,
}

fn default_health_interval_secs() -> u64 {
    30
}
fn default_failover_threshold() -> f64 {
    50.0
}
fn default_recovery_threshold() -> f64 {
    80.0
}
fn default_consecutive() -> u32 {
    2
}
fn default_escalation_cycles() -> u32 {
    10
}
fn default_trend_window() -> usize {
    20
}
fn default_incident_log_size() -> usize {
    200
}
fn default_latency_warn_ms() -> f64 {
    50.0
}
fn default_latency_fail_ms() -> f64 {
    250.0
}
fn default_error_rate_warn() -> f64 {
    0.05
}
fn default_error_rate_fail() -> f64 {
    0.20
}
fn default_utilization_warn() -> f64 {
    0.95
}
fn default_weights() -> HashMap<String, f64> {
    HashMap::from([
        ("local_tier".to_string(), 1.0),
        ("entry_store".to_string(), 2.0),
        ("node_latency".to_string(), 1.0),
        ("error_rate".to_string(), 1.0),
    ])
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            failover_threshold: default_failover_threshold(),
            recovery_threshold: default_recovery_threshold(),
            failover_consecutive: default_consecutive(),
            recovery_consecutive: default_consecutive(),
            escalation_cycles: default_escalation_cycles(),
            trend_window: default_trend_window(),
            incident_log_size: default_incident_log_size(),
            latency_warn_ms: default_latency_warn_ms(),
            latency_fail_ms: default_latency_fail_ms(),
            error_rate_warn: default_error_rate_warn(),
            error_rate_fail: default_error_rate_fail(),
            local_utilization_warn: default_utilization_warn(),
            weights: default_weights(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn weight(&self, check: &str) -> f64 {
        self.weights.get(check).copied().unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u8,
    /// Soft bound multiplier over the per-node average key count
    #[serde(default = "default_balance_factor")]
    pub balance_factor: f64,
}

fn default_replication_factor() -> u8 {
    1
}
fn default_balance_factor() -> f64 {
    1.25
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            balance_factor: default_balance_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSettings {
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Runs kept per profile
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_baseline_runs")]
    pub baseline_runs: usize,
    /// Fractional p95 increase over baseline that counts as a regression
    #[serde(default = "default_regression_tolerance")]
    pub regression_tolerance: f64,
}

fn default_max_duration_ms() -> u64 {
    60_000
}
fn default_max_concurrency() -> usize {
    64
}
fn default_history_size() -> usize {
    50
}
fn default_baseline_runs() -> usize {
    5
}
fn default_regression_tolerance() -> f64 {
    0.20
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            max_duration_ms: default_max_duration_ms(),
            max_concurrency: default_max_concurrency(),
            history_size: default_history_size(),
            baseline_runs: default_baseline_runs(),
            regression_tolerance: default_regression_tolerance(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("lexicache.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., LEXICACHE__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("LEXICACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
