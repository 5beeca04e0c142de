use crate::error::{CacheError, Result};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkProfile {
    Latency,
    Throughput,
    Memory,
}

impl BenchmarkProfile {
    pub fn default_mix(&self) -> OperationsMix {
        match self {
            BenchmarkProfile::Latency => OperationsMix {
                get: 80,
                set: 20,
                mget: 0,
            },
            BenchmarkProfile::Throughput => OperationsMix {
                get: 60,
                set: 30,
                mget: 10,
            },
            BenchmarkProfile::Memory => OperationsMix {
                get: 20,
                set: 80,
                mget: 0,
            },
        }
    }
}

impl std::fmt::Display for BenchmarkProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchmarkProfile::Latency => write!(f, "latency"),
            BenchmarkProfile::Throughput => write!(f, "throughput"),
            BenchmarkProfile::Memory => write!(f, "memory"),
        }
    }
}

/// Relative weights of each operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationsMix {
    pub get: u32,
    pub set: u32,
    pub mget: u32,
}

impl OperationsMix {
    /// Sum of the weights, `None` when it does not fit in a `u32`.
    pub fn total(&self) -> Option<u32> {
        self.get.checked_add(self.set)?.checked_add(self.mget)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl PayloadSize {
    pub fn bytes(&self) -> usize {
        match self {
            PayloadSize::Small => 256,
            PayloadSize::Medium => 4 * 1024,
            PayloadSize::Large => 64 * 1024,
        }
    }
}

/// Workload definition accepted by `POST /cache/benchmark`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkConfig {
    pub profile: BenchmarkProfile,
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub operations_mix: Option<OperationsMix>,
    #[serde(default)]
    pub payload_size: PayloadSize,
    #[serde(default = "default_key_space")]
    pub key_space: usize,
}

fn default_duration_ms() -> u64 {
    5_000
}
fn default_concurrency() -> usize {
    8
}
fn default_key_space() -> usize {
    1_000
}

impl BenchmarkConfig {
    pub fn new(profile: BenchmarkProfile) -> Self {
        Self {
            profile,
            duration_ms: default_duration_ms(),
            concurrency: default_concurrency(),
            operations_mix: None,
            payload_size: PayloadSize::default(),
            key_space: default_key_space(),
        }
    }

    pub fn mix(&self) -> OperationsMix {
        self.operations_mix
            .unwrap_or_else(|| self.profile.default_mix())
    }

    /// Check the workload against operator limits.
    pub fn validate(&self, max_duration_ms: u64, max_concurrency: usize) -> Result<()> {
        if self.duration_ms == 0 || self.duration_ms > max_duration_ms {
            return Err(CacheError::invalid_request(format!(
                "durationMs must be between 1 and {max_duration_ms}"
            )));
        }
        if self.concurrency == 0 || self.concurrency > max_concurrency {
            return Err(CacheError::invalid_request(format!(
                "concurrency must be between 1 and {max_concurrency}"
            )));
        }
        if self.key_space == 0 {
            return Err(CacheError::invalid_request("keySpace must be > 0"));
        }
        match self.mix().total() {
            None => {
                return Err(CacheError::invalid_request(
                    "operationsMix weights must sum to at most 4294967295",
                ));
            }
            Some(0) => {
                return Err(CacheError::invalid_request(
                    "operationsMix needs at least one non-zero weight",
                ));
            }
            Some(_) => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkSummary {
    pub total_ops: u64,
    pub errors: u64,
    pub degraded_ops: u64,
    pub hit_rate: f64,
    pub throughput_ops_per_sec: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub memory_delta_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkRun {
    pub id: Uuid,
    pub profile: BenchmarkProfile,
    pub duration_ms: u64,
    pub concurrency: usize,
    pub operations_mix: OperationsMix,
    pub payload_size: PayloadSize,
    pub key_space: usize,
    pub results_summary: BenchmarkSummary,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    /// `None` until enough history exists to form a baseline.
    pub regression: Option<bool>,
    pub baseline_p95_ms: Option<f64>,
}
