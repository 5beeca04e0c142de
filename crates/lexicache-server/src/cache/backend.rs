//! Key/value backends behind the entry store.
//!
//! ## Backends
//!
//! - **Redis**: pooled connections (deadpool) to one Redis-compatible node
//! - **Memory**: in-process `DashMap` with fault injection, used for local
//!   mode and for exercising failover in tests
//!
//! Backends report failures as `CacheError::Backend`; deadlines and
//! failure counting live one level up in the entry store.

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::Pool;
use lexicache_core::{CacheError, Result, deadline_after};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remaining TTL, `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Returns `true` if the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomically add `delta`; missing keys start at zero.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    async fn scan_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;

    /// Memory in use as a percentage of the node's limit (0 when unbounded).
    async fn memory_used_pct(&self) -> Result<f64>;
}

// =============================================================================
// Redis
// =============================================================================

pub struct RedisBackend {
    node: String,
    pool: Pool,
}

impl RedisBackend {
    pub fn new(node: impl Into<String>, pool: Pool) -> Self {
        Self {
            node: node.into(),
            pool,
        }
    }

    /// Build a pool for `url` without connecting.
    pub fn connect(
        node: impl Into<String>,
        url: &str,
        pool_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let node = node.into();
        let mut redis_config = deadpool_redis::Config::from_url(url);
        let mut pool_config = deadpool_redis::PoolConfig::new(pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| CacheError::configuration(format!("redis pool for {node}: {e}")))?;
        Ok(Self::new(node, pool))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::backend(&self.node, e))
    }

    fn err(&self, e: redis::RedisError) -> CacheError {
        CacheError::backend(&self.node, e)
    }
}

/// Escape glob metacharacters so a prefix matches literally in SCAN MATCH.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

fn parse_info_field(info: &str, field: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
        .and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| self.err(e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let ms = ttl.as_millis().max(1) as u64;
        let () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(|e| self.err(e))?;
        Ok(removed > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn().await?;
        let ms: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.err(e))?;
        // -2: missing, -1: no expiry
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let ms = ttl.as_millis().max(1) as u64;
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(updated == 1)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        conn.incr(key, delta).await.map_err(|e| self.err(e))
    }

    async fn scan_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = glob_escape(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.err(e))?;
            keys.extend(batch);
            if next == 0 || keys.len() >= limit {
                break;
            }
            cursor = next;
        }
        keys.truncate(limit);
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn memory_used_pct(&self) -> Result<f64> {
        let mut conn = self.conn().await?;
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.err(e))?;
        let used = parse_info_field(&info, "used_memory").unwrap_or(0);
        match parse_info_field(&info, "maxmemory") {
            Some(max) if max > 0 => Ok(used as f64 / max as f64 * 100.0),
            _ => Ok(0.0),
        }
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Clone, Debug)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process backend with switchable availability and injected latency.
pub struct MemoryBackend {
    node: String,
    map: DashMap<String, StoredValue>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    capacity_bytes: u64,
}

impl MemoryBackend {
    pub fn new(node: impl Into<String>) -> Self {
        Self::with_capacity(node, 256 * 1024 * 1024)
    }

    pub fn with_capacity(node: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            node: node.into(),
            map: DashMap::new(),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            capacity_bytes,
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every subsequent operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.map.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys starting with `prefix`, for assertions.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.map
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.is_expired())
            .map(|e| e.key().clone())
            .collect()
    }

    async fn simulate(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::backend(&self.node, "connection refused"))
        }
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let entry = self.map.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.map.remove(key);
            return None;
        }
        Some(entry.clone())
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.simulate().await?;
        Ok(self.live(key).map(|v| v.data))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.simulate().await?;
        self.map.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: Some(deadline_after(ttl)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.simulate().await?;
        Ok(self
            .map
            .remove(key)
            .is_some_and(|(_, v)| !v.is_expired()))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.simulate().await?;
        Ok(self
            .live(key)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.simulate().await?;
        if self.live(key).is_none() {
            return Ok(false);
        }
        match self.map.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(deadline_after(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        self.simulate().await?;
        let mut entry = self.map.entry(key.to_string()).or_insert(StoredValue {
            data: b"0".to_vec(),
            expires_at: None,
        });
        if entry.is_expired() {
            entry.data = b"0".to_vec();
            entry.expires_at = None;
        }
        let current: i64 = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                CacheError::backend(&self.node, "value is not an integer or out of range")
            })?;
        let next = current.checked_add(delta).ok_or_else(|| {
            CacheError::backend(&self.node, "increment or decrement would overflow")
        })?;
        entry.data = next.to_string().into_bytes();
        Ok(next)
    }

    async fn scan_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        self.simulate().await?;
        Ok(self
            .map
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.is_expired())
            .take(limit)
            .map(|e| e.key().clone())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.simulate().await
    }

    async fn memory_used_pct(&self) -> Result<f64> {
        self.simulate().await?;
        let used: usize = self
            .map
            .iter()
            .map(|e| e.key().len() + e.data.len())
            .sum();
        Ok(used as f64 / self.capacity_bytes.max(1) as f64 * 100.0)
    }
}
