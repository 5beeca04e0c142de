//! Local tier: bounded in-process LRU with per-entry TTL.
//!
//! Entries are charged `key + value + overhead` bytes against a fixed
//! budget. Inserting past the budget evicts least-recently-used entries
//! first; recency is a monotonically increasing tick, so ties cannot occur
//! and insertion order breaks them implicitly. Expired entries are dropped
//! lazily on access and by a periodic sweep.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lexicache_core::{CacheEntry, CacheError, Result, Tier, deadline_after};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::LocalTierConfig;

struct Slot {
    entry: CacheEntry,
    deadline: Instant,
    charge: u64,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Slot>,
    /// tick -> key, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
    bytes_used: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.map.remove(key)?;
        self.order.remove(&slot.tick);
        self.bytes_used = self.bytes_used.saturating_sub(slot.charge);
        Some(slot)
    }
}

/// Snapshot of local tier counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTierStats {
    pub entries: usize,
    pub bytes_used: u64,
    pub budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl LocalTierStats {
    /// Fraction of the byte budget in use.
    pub fn utilization(&self) -> f64 {
        if self.budget_bytes == 0 {
            0.0
        } else {
            self.bytes_used as f64 / self.budget_bytes as f64
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct LocalTier {
    inner: Mutex<Inner>,
    budget_bytes: u64,
    overhead_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalTier {
    pub fn new(budget_bytes: u64, overhead_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            budget_bytes,
            overhead_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn from_config(cfg: &LocalTierConfig) -> Self {
        Self::new(cfg.memory_budget_bytes, cfg.entry_overhead_bytes)
    }

    fn charge_for(&self, key: &str, value: &[u8]) -> u64 {
        key.len() as u64 + value.len() as u64 + self.overhead_bytes
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.map.get(key).map(|slot| slot.deadline <= now) {
            None => {
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(true) => {
                inner.remove(key);
                drop(inner);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(false) => {}
        }

        let tick = inner.bump();
        let Inner { map, order, .. } = &mut *inner;
        let slot = map.get_mut(key)?;
        order.remove(&slot.tick);
        order.insert(tick, key.to_string());
        slot.tick = tick;
        let entry = slot.entry.clone();
        drop(inner);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Whether a live entry exists, without touching recency or counters.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .map
            .get(key)
            .is_some_and(|slot| slot.deadline > now)
    }

    /// Insert or replace `key`. Returns the number of entries evicted to
    /// make room.
    pub fn insert(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration) -> Result<u64> {
        let charge = self.charge_for(key, &value);
        if charge > self.budget_bytes {
            return Err(CacheError::CapacityExceeded {
                requested: charge,
                budget: self.budget_bytes,
            });
        }

        let entry = CacheEntry::new(key, value, ttl, Tier::Local);
        let deadline = deadline_after(ttl);

        let mut evicted = 0u64;
        let mut inner = self.inner.lock();
        inner.remove(key);
        while inner.bytes_used + charge > self.budget_bytes {
            let Some((_, victim)) = inner.order.pop_first() else {
                break;
            };
            if let Some(slot) = inner.map.remove(&victim) {
                inner.bytes_used = inner.bytes_used.saturating_sub(slot.charge);
                evicted += 1;
            }
        }
        let tick = inner.bump();
        inner.order.insert(tick, key.to_string());
        inner.bytes_used += charge;
        inner.map.insert(
            key.to_string(),
            Slot {
                entry,
                deadline,
                charge,
                tick,
            },
        );
        let (entries, bytes) = (inner.map.len(), inner.bytes_used);
        drop(inner);

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            crate::metrics::record_evictions("lru", evicted);
            tracing::debug!(key = %key, evicted, "local tier evicted entries to fit budget");
        }
        crate::metrics::set_local_occupancy(entries, bytes);
        Ok(evicted)
    }

    /// Returns `true` if the key was present.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Live keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .lock()
            .map
            .iter()
            .filter(|(k, slot)| k.starts_with(prefix) && slot.deadline > now)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        let (entries, bytes) = (inner.map.len(), inner.bytes_used);
        drop(inner);

        let removed = expired.len();
        if removed > 0 {
            self.expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            crate::metrics::record_evictions("ttl", removed as u64);
        }
        crate::metrics::set_local_occupancy(entries, bytes);
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::default();
        drop(inner);
        crate::metrics::set_local_occupancy(0, 0);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LocalTierStats {
        let (entries, bytes_used) = {
            let inner = self.inner.lock();
            (inner.map.len(), inner.bytes_used)
        };
        LocalTierStats {
            entries,
            bytes_used,
            budget_bytes: self.budget_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Run `sweep` every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tier = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = tier.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "local tier sweep removed expired entries");
                        }
                    }
                }
            }
            tracing::debug!("local tier sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(n: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![7u8; n])
    }

    #[test]
    fn test_insert_and_get() {
        let tier = LocalTier::new(1024, 0);
        tier.insert("a", val(10), Duration::from_secs(60)).unwrap();
        let entry = tier.get("a").unwrap();
        assert_eq!(entry.value.len(), 10);
        assert_eq!(entry.source_tier, Tier::Local);
        assert!(tier.get("b").is_none());

        let stats = tier.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bytes_used, 11);
    }

    #[test]
    fn test_lru_eviction_order() {
        // Each entry charges 1 (key) + 10 (value) = 11 bytes
        let tier = LocalTier::new(33, 0);
        tier.insert("a", val(10), Duration::from_secs(60)).unwrap();
        tier.insert("b", val(10), Duration::from_secs(60)).unwrap();
        tier.insert("c", val(10), Duration::from_secs(60)).unwrap();

        // Touch "a" so "b" becomes least recently used
        assert!(tier.get("a").is_some());
        let evicted = tier.insert("d", val(10), Duration::from_secs(60)).unwrap();
        assert_eq!(evicted, 1);
        assert!(tier.contains("a"));
        assert!(!tier.contains("b"));
        assert!(tier.contains("c"));
        assert!(tier.contains("d"));
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn test_untouched_entries_evict_in_insertion_order() {
        let tier = LocalTier::new(33, 0);
        for k in ["a", "b", "c", "d", "e"] {
            tier.insert(k, val(10), Duration::from_secs(60)).unwrap();
        }
        assert!(!tier.contains("a"));
        assert!(!tier.contains("b"));
        assert!(tier.contains("c"));
        assert!(tier.contains("e"));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let tier = LocalTier::new(100, 16);
        let err = tier
            .insert("big", val(200), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, CacheError::CapacityExceeded { .. }));
        assert!(tier.is_empty());
    }

    #[test]
    fn test_replace_updates_bytes() {
        let tier = LocalTier::new(1024, 0);
        tier.insert("a", val(100), Duration::from_secs(60)).unwrap();
        tier.insert("a", val(10), Duration::from_secs(60)).unwrap();
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.stats().bytes_used, 11);
    }

    #[tokio::test]
    async fn test_ttl_expiry_lazy_and_sweep() {
        let tier = LocalTier::new(1024, 0);
        tier.insert("a", val(1), Duration::from_millis(20)).unwrap();
        tier.insert("b", val(1), Duration::from_millis(20)).unwrap();
        tier.insert("c", val(1), Duration::from_secs(60)).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(tier.get("a").is_none());
        assert_eq!(tier.sweep(), 1);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.stats().expirations, 2);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let tier = Arc::new(LocalTier::new(1024, 0));
        tier.insert("a", val(1), Duration::from_millis(5)).unwrap();
        let cancel = CancellationToken::new();
        let handle = tier.spawn_sweeper(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tier.is_empty());
        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_keys_with_prefix_and_clear() {
        let tier = LocalTier::new(4096, 0);
        tier.insert("user:1:a", val(1), Duration::from_secs(60)).unwrap();
        tier.insert("user:1:b", val(1), Duration::from_secs(60)).unwrap();
        tier.insert("user:2:a", val(1), Duration::from_secs(60)).unwrap();
        let mut keys = tier.keys_with_prefix("user:1:");
        keys.sort();
        assert_eq!(keys, vec!["user:1:a", "user:1:b"]);
        tier.clear();
        assert!(tier.is_empty());
        assert_eq!(tier.stats().bytes_used, 0);
    }
}
