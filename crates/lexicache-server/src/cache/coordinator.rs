//! Cache coordinator: the single entry point for reads, writes and deletes.
//!
//! ## Read path
//!
//! Local tier first; on a miss the remote tier (through the compression
//! codec) under `remote_timeout`, retried once with half the budget. Remote
//! hits are promoted into the local tier before returning.
//!
//! ## Write path
//!
//! The local tier is written synchronously. The remote write goes through
//! the bounded write-behind queue, or inline for strong durability with a
//! deadline after which the write is queued and reported degraded.
//!
//! Every write and delete takes a per-key sequence number. Queued remote
//! operations that have been superseded by a newer one for the same key are
//! skipped, so the remote tier never regresses to an older value.
//!
//! While failover is active the remote tier is bypassed: reads are served
//! locally and flagged degraded, and keys touched during failover are
//! deleted remotely once the switch clears (`flush_deferred`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use lexicache_core::{CacheEntry, CacheError, Lookup, Result, Tier};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use super::analytics::{AccessOutcome, AccessSample, AnalyticsRecorder};
use super::compression::{RemoteCodec, RemoteValue};
use super::health::FailoverSwitch;
use super::local::{LocalTier, LocalTierStats};
use super::warming::WarmSource;
use crate::config::CoordinatorConfig;

const INTERNAL_PREFIXES: [&str; 2] = ["blob:", "blobrc:"];

/// Longest TTL a write keeps; larger requests are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

/// How long a write waits for the remote tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Return once the local tier has the value.
    #[default]
    Async,
    /// Wait for the remote tier, up to the strong write timeout.
    Strong,
}

/// What happened on the remote side of a write or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Written,
    Queued,
    /// Postponed until failover ends.
    Deferred,
    /// Write-behind queue was full.
    Dropped,
    /// Remote tier failed and the operation was not queued.
    Failed,
    /// No remote tier configured.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub lookup: Lookup,
    pub degraded: bool,
}

impl GetResult {
    fn hit(entry: CacheEntry, degraded: bool) -> Self {
        Self {
            lookup: Lookup::Hit(entry),
            degraded,
        }
    }

    fn miss(degraded: bool) -> Self {
        Self {
            lookup: Lookup::Miss,
            degraded,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.lookup.is_hit()
    }

    pub fn tier(&self) -> Option<Tier> {
        self.lookup.tier()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteAck {
    pub local: bool,
    pub remote: RemoteState,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAck {
    pub existed: bool,
    pub remote: RemoteState,
    pub degraded: bool,
}

/// Result of warming one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmOutcome {
    AlreadyLocal,
    Promoted,
    Loaded,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub gets: u64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub degraded_ops: u64,
    pub remote_errors: u64,
    pub write_behind_depth: usize,
    pub write_behind_dropped: u64,
    pub write_behind_failed: u64,
    pub deferred_keys: usize,
    pub failover: bool,
    pub local: LocalTierStats,
}

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    degraded: AtomicU64,
    remote_errors: AtomicU64,
    write_behind_dropped: AtomicU64,
    write_behind_failed: AtomicU64,
}

#[derive(Debug, Clone)]
enum RemoteOp {
    Set { value: Arc<Vec<u8>>, ttl: Duration },
    Delete,
}

#[derive(Debug, Clone)]
struct QueuedWrite {
    key: String,
    seq: u64,
    op: RemoteOp,
}

/// Latest sequence per key plus the number of remote operations still
/// holding it. Entries go away once nothing is pending.
#[derive(Debug, Clone, Copy)]
struct KeyState {
    latest: u64,
    pending: u32,
}

pub struct CacheCoordinator {
    local: Arc<LocalTier>,
    remote: Option<Arc<RemoteCodec>>,
    config: CoordinatorConfig,
    default_ttl: Duration,
    failover: FailoverSwitch,
    analytics: Option<AnalyticsRecorder>,
    next_seq: AtomicU64,
    keys: DashMap<String, KeyState>,
    deferred: Mutex<HashMap<String, u64>>,
    write_tx: mpsc::Sender<QueuedWrite>,
    write_rx: Mutex<Option<mpsc::Receiver<QueuedWrite>>>,
    queue_depth: AtomicUsize,
    counters: Counters,
}

impl CacheCoordinator {
    pub fn new(
        local: Arc<LocalTier>,
        remote: Option<Arc<RemoteCodec>>,
        config: CoordinatorConfig,
        default_ttl: Duration,
        failover: FailoverSwitch,
        analytics: Option<AnalyticsRecorder>,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel(config.write_behind_capacity.max(1));
        Self {
            local,
            remote,
            config,
            default_ttl,
            failover,
            analytics,
            next_seq: AtomicU64::new(0),
            keys: DashMap::new(),
            deferred: Mutex::new(HashMap::new()),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            queue_depth: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn local(&self) -> &Arc<LocalTier> {
        &self.local
    }

    pub fn remote(&self) -> Option<&Arc<RemoteCodec>> {
        self.remote.as_ref()
    }

    pub fn failover(&self) -> &FailoverSwitch {
        &self.failover
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Remote tier, unless absent or bypassed by failover.
    fn active_remote(&self) -> Option<&Arc<RemoteCodec>> {
        self.remote.as_ref().filter(|_| !self.failover.is_active())
    }

    fn effective_ttl(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.default_ttl
        } else {
            ttl.min(MAX_TTL)
        }
    }

    fn sample(&self, key: &str, outcome: AccessOutcome, started: Instant, degraded: bool) {
        if let Some(recorder) = &self.analytics {
            recorder.record(AccessSample::now(key, outcome, started.elapsed(), degraded));
        }
    }

    fn note_degraded(&self, operation: &'static str) {
        self.counters.degraded.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_degraded(operation);
    }

    // -------------------------------------------------------------------------
    // Sequencing
    // -------------------------------------------------------------------------

    fn begin(&self, key: &str) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.keys
            .entry(key.to_string())
            .and_modify(|s| s.latest = seq)
            .or_insert(KeyState {
                latest: seq,
                pending: 0,
            });
        seq
    }

    fn hold(&self, key: &str) {
        if let Some(mut state) = self.keys.get_mut(key) {
            state.pending += 1;
        }
    }

    fn release(&self, key: &str) {
        if let Some(mut state) = self.keys.get_mut(key) {
            state.pending = state.pending.saturating_sub(1);
        }
        self.settle(key);
    }

    /// Forget a key's sequence once no remote operation depends on it.
    fn settle(&self, key: &str) {
        self.keys.remove_if(key, |_, s| s.pending == 0);
    }

    fn is_current(&self, key: &str, seq: u64) -> bool {
        self.keys.get(key).is_none_or(|s| s.latest == seq)
    }

    fn defer(&self, key: &str, seq: u64) {
        // One hold per deferred key
        let previous = self.deferred.lock().insert(key.to_string(), seq);
        if previous.is_none() {
            self.hold(key);
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn get(&self, key: &str) -> Result<GetResult> {
        validate_key(key)?;
        let started = Instant::now();
        self.counters.gets.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.local.get(key) {
            // Served, but possibly stale relative to the bypassed remote tier
            let degraded = self.failover.is_active();
            if degraded {
                self.note_degraded("get");
            }
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_hit("local");
            crate::metrics::record_operation("get", started.elapsed());
            self.sample(key, AccessOutcome::LocalHit, started, degraded);
            return Ok(GetResult::hit(entry, degraded));
        }

        let result = match &self.remote {
            None => GetResult::miss(false),
            Some(_) if self.failover.is_active() => {
                self.note_degraded("get");
                GetResult::miss(true)
            }
            Some(remote) => match self.fetch_remote(remote, key).await {
                Ok(Some(value)) => GetResult::hit(self.promote(key, value), false),
                Ok(None) => GetResult::miss(false),
                Err(e) => {
                    self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
                    self.note_degraded("get");
                    tracing::warn!(key = %key, error = %e, "remote read failed, serving miss");
                    GetResult::miss(true)
                }
            },
        };

        let outcome = if result.is_hit() {
            self.counters.remote_hits.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_hit("remote");
            AccessOutcome::RemoteHit
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_miss();
            AccessOutcome::Miss
        };
        crate::metrics::record_operation("get", started.elapsed());
        self.sample(key, outcome, started, result.degraded);
        Ok(result)
    }

    /// Remote read with one retry at half the budget on timeout.
    async fn fetch_remote(&self, remote: &RemoteCodec, key: &str) -> Result<Option<RemoteValue>> {
        let budget = self.config.remote_timeout();
        match tokio::time::timeout(budget, remote.fetch(key)).await {
            Ok(result) => result,
            Err(_) => {
                let retry = budget / 2;
                tracing::debug!(key = %key, budget_ms = budget.as_millis() as u64, "remote read timed out, retrying");
                match tokio::time::timeout(retry, remote.fetch(key)).await {
                    Ok(result) => result,
                    Err(_) => Err(CacheError::timeout("get", retry)),
                }
            }
        }
    }

    fn promote(&self, key: &str, value: RemoteValue) -> CacheEntry {
        let data = Arc::new(value.data);
        if let Err(e) = self.local.insert(key, Arc::clone(&data), value.remaining_ttl) {
            tracing::debug!(key = %key, error = %e, "remote hit not promoted to local tier");
        }
        CacheEntry::new(key, data, value.remaining_ttl, Tier::Remote)
            .with_storage(value.compressed, value.stored_bytes)
    }

    pub async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, GetResult>> {
        let unique: HashSet<&String> = keys.iter().collect();
        let results: Vec<(String, Result<GetResult>)> = stream::iter(unique.into_iter().cloned())
            .map(|key: String| async move {
                let result = self.get(&key).await;
                (key, result)
            })
            .buffer_unordered(self.config.get_many_concurrency.max(1))
            .collect()
            .await;
        let mut out = HashMap::with_capacity(results.len());
        for (key, result) in results {
            out.insert(key, result?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        durability: Durability,
    ) -> Result<WriteAck> {
        validate_key(key)?;
        let started = Instant::now();
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        let ttl = self.effective_ttl(ttl);
        let value = Arc::new(value);
        let seq = self.begin(key);

        let local = match self.local.insert(key, Arc::clone(&value), ttl) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "local tier rejected write");
                false
            }
        };

        let ack = match &self.remote {
            None => {
                self.settle(key);
                if !local {
                    return Err(CacheError::unavailable(format!(
                        "no tier accepted write for {key}"
                    )));
                }
                WriteAck {
                    local,
                    remote: RemoteState::Skipped,
                    degraded: false,
                }
            }
            Some(_) if self.failover.is_active() => {
                if !local {
                    self.settle(key);
                    return Err(CacheError::unavailable(format!(
                        "local tier rejected {key} during failover"
                    )));
                }
                // Remote copy is stale from here on
                self.defer(key, seq);
                self.note_degraded("set");
                WriteAck {
                    local,
                    remote: RemoteState::Deferred,
                    degraded: true,
                }
            }
            Some(remote) => match durability {
                Durability::Async => {
                    let remote_state = self.enqueue(key, seq, RemoteOp::Set {
                        value: Arc::clone(&value),
                        ttl,
                    });
                    if remote_state == RemoteState::Dropped && !local {
                        return Err(CacheError::unavailable(format!(
                            "no tier accepted write for {key}"
                        )));
                    }
                    let degraded = remote_state == RemoteState::Dropped;
                    if degraded {
                        self.note_degraded("set");
                    }
                    WriteAck {
                        local,
                        remote: remote_state,
                        degraded,
                    }
                }
                Durability::Strong => {
                    let budget = self.config.strong_write_timeout();
                    let outcome = tokio::time::timeout(budget, remote.put(key, &value, ttl)).await;
                    match outcome {
                        Ok(Ok(_)) => {
                            self.settle(key);
                            WriteAck {
                                local,
                                remote: RemoteState::Written,
                                degraded: false,
                            }
                        }
                        failed => {
                            let error = match failed {
                                Ok(Err(e)) => e,
                                _ => CacheError::timeout("set", budget),
                            };
                            self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(key = %key, error = %error, "strong write degraded, queued for retry");
                            let remote_state = self.enqueue(key, seq, RemoteOp::Set {
                                value: Arc::clone(&value),
                                ttl,
                            });
                            if !local && remote_state == RemoteState::Dropped {
                                return Err(CacheError::unavailable(format!(
                                    "no tier accepted write for {key}"
                                )));
                            }
                            self.note_degraded("set");
                            WriteAck {
                                local,
                                remote: remote_state,
                                degraded: true,
                            }
                        }
                    }
                }
            },
        };

        crate::metrics::record_operation("set", started.elapsed());
        self.sample(key, AccessOutcome::Write, started, ack.degraded);
        Ok(ack)
    }

    fn enqueue(&self, key: &str, seq: u64, op: RemoteOp) -> RemoteState {
        self.hold(key);
        let queued = QueuedWrite {
            key: key.to_string(),
            seq,
            op,
        };
        match self.write_tx.try_send(queued) {
            Ok(()) => {
                let depth = self.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
                crate::metrics::set_write_behind_depth(depth);
                RemoteState::Queued
            }
            Err(_) => {
                self.release(key);
                self.counters
                    .write_behind_dropped
                    .fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_write_behind_dropped();
                tracing::warn!(key = %key, "write-behind queue full, remote write dropped");
                RemoteState::Dropped
            }
        }
    }

    // -------------------------------------------------------------------------
    // Deletes
    // -------------------------------------------------------------------------

    /// Delete from both tiers. Remote failures are queued for retry, so this
    /// only errors on an invalid key.
    pub async fn delete(&self, key: &str) -> Result<DeleteAck> {
        self.delete_inner(key, true).await
    }

    /// Like `delete`, but a remote failure is returned instead of queued.
    /// Used by invalidation, which retries failed keys itself.
    pub async fn delete_strict(&self, key: &str) -> Result<DeleteAck> {
        self.delete_inner(key, false).await
    }

    async fn delete_inner(&self, key: &str, queue_on_failure: bool) -> Result<DeleteAck> {
        validate_key(key)?;
        let started = Instant::now();
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        let seq = self.begin(key);
        let local_existed = self.local.remove(key);

        let ack = match &self.remote {
            None => {
                self.settle(key);
                DeleteAck {
                    existed: local_existed,
                    remote: RemoteState::Skipped,
                    degraded: false,
                }
            }
            Some(_) if self.failover.is_active() => {
                self.defer(key, seq);
                self.note_degraded("delete");
                DeleteAck {
                    existed: local_existed,
                    remote: RemoteState::Deferred,
                    degraded: true,
                }
            }
            Some(remote) => match self.remove_remote(remote, key).await {
                Ok(remote_existed) => {
                    self.settle(key);
                    DeleteAck {
                        existed: local_existed || remote_existed,
                        remote: RemoteState::Written,
                        degraded: false,
                    }
                }
                Err(e) => {
                    self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
                    self.note_degraded("delete");
                    if !queue_on_failure {
                        self.settle(key);
                        return Err(e);
                    }
                    tracing::warn!(key = %key, error = %e, "remote delete failed, queued for retry");
                    let remote_state = self.enqueue(key, seq, RemoteOp::Delete);
                    DeleteAck {
                        existed: local_existed,
                        remote: remote_state,
                        degraded: true,
                    }
                }
            },
        };

        crate::metrics::record_operation("delete", started.elapsed());
        self.sample(key, AccessOutcome::Delete, started, ack.degraded);
        Ok(ack)
    }

    async fn remove_remote(&self, remote: &RemoteCodec, key: &str) -> Result<bool> {
        let budget = self.config.remote_timeout();
        match tokio::time::timeout(budget, remote.remove(key)).await {
            Ok(result) => result,
            Err(_) => {
                let retry = budget / 2;
                match tokio::time::timeout(retry, remote.remove(key)).await {
                    Ok(result) => result,
                    Err(_) => Err(CacheError::timeout("delete", retry)),
                }
            }
        }
    }

    /// Apply remote deletes postponed during failover. Keys rewritten since
    /// are skipped. Returns how many were flushed.
    pub async fn flush_deferred(&self) -> usize {
        let Some(remote) = self.active_remote() else {
            return 0;
        };
        let pending: Vec<(String, u64)> = self.deferred.lock().drain().collect();
        let mut flushed = 0;
        for (key, seq) in pending {
            if !self.is_current(&key, seq) {
                self.release(&key);
                continue;
            }
            match self.remove_remote(remote, &key).await {
                Ok(_) => {
                    flushed += 1;
                    self.release(&key);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "deferred delete failed, keeping it");
                    self.deferred.lock().insert(key, seq);
                }
            }
        }
        if flushed > 0 {
            tracing::info!(flushed, "flushed operations deferred during failover");
        }
        flushed
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    // -------------------------------------------------------------------------
    // Support for invalidation and warming
    // -------------------------------------------------------------------------

    /// Keys under `prefix` in either tier. The second value is `true` when
    /// the remote tier could not be consulted.
    pub async fn keys_with_prefix(&self, prefix: &str, limit: usize) -> Result<(Vec<String>, bool)> {
        let mut keys: HashSet<String> = self.local.keys_with_prefix(prefix).into_iter().collect();
        let mut degraded = false;
        match &self.remote {
            None => {}
            Some(_) if self.failover.is_active() => degraded = true,
            Some(remote) => match remote.scan_prefix(prefix, limit).await {
                Ok(found) => keys.extend(
                    found
                        .into_iter()
                        .filter(|k| !INTERNAL_PREFIXES.iter().any(|p| k.starts_with(p))),
                ),
                Err(e) => {
                    tracing::warn!(prefix, error = %e, "remote scan failed");
                    degraded = true;
                }
            },
        }
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys.truncate(limit);
        Ok((keys, degraded))
    }

    /// Make sure `key` is in the local tier: keep it, promote it from the
    /// remote tier, or load it from `source`.
    pub async fn warm_key(&self, key: &str, source: &dyn WarmSource) -> Result<WarmOutcome> {
        validate_key(key)?;
        if self.local.contains(key) {
            return Ok(WarmOutcome::AlreadyLocal);
        }
        if let Some(remote) = self.active_remote() {
            match self.fetch_remote(remote, key).await {
                Ok(Some(value)) => {
                    let ttl = value.remaining_ttl;
                    self.local
                        .insert(key, Arc::new(value.data), ttl)
                        .map_err(|e| {
                            tracing::debug!(key = %key, error = %e, "warm promotion rejected");
                            e
                        })?;
                    return Ok(WarmOutcome::Promoted);
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(key = %key, error = %e, "warm remote lookup failed"),
            }
        }
        match source.load(key).await? {
            Some(loaded) => {
                let ttl = loaded.ttl.unwrap_or(self.default_ttl);
                self.set(key, loaded.value, ttl, Durability::Async).await?;
                Ok(WarmOutcome::Loaded)
            }
            None => Ok(WarmOutcome::NotFound),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            gets: self.counters.gets.load(Ordering::Relaxed),
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            remote_hits: self.counters.remote_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            degraded_ops: self.counters.degraded.load(Ordering::Relaxed),
            remote_errors: self.counters.remote_errors.load(Ordering::Relaxed),
            write_behind_depth: self.queue_depth.load(Ordering::Relaxed),
            write_behind_dropped: self.counters.write_behind_dropped.load(Ordering::Relaxed),
            write_behind_failed: self.counters.write_behind_failed.load(Ordering::Relaxed),
            deferred_keys: self.deferred_count(),
            failover: self.failover.is_active(),
            local: self.local.stats(),
        }
    }

    // -------------------------------------------------------------------------
    // Write-behind worker
    // -------------------------------------------------------------------------

    /// Start the write-behind worker. Returns `None` if it is already running.
    pub fn spawn_write_behind(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = self.write_rx.lock().take()?;
        let coordinator = Arc::clone(self);
        let permits = Arc::new(Semaphore::new(self.config.write_behind_concurrency.max(1)));
        Some(tokio::spawn(async move {
            loop {
                let queued = tokio::select! {
                    _ = cancel.cancelled() => break,
                    queued = rx.recv() => match queued {
                        Some(queued) => queued,
                        None => break,
                    },
                };
                let depth = coordinator
                    .queue_depth
                    .fetch_sub(1, Ordering::Relaxed)
                    .saturating_sub(1);
                crate::metrics::set_write_behind_depth(depth);

                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let worker = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    let _permit = permit;
                    worker.apply_queued(queued).await;
                });
            }
            tracing::debug!("write-behind worker stopped");
        }))
    }

    async fn apply_queued(&self, queued: QueuedWrite) {
        let Some(remote) = self.remote.as_ref() else {
            self.release(&queued.key);
            return;
        };
        let max_retries = self.config.write_behind_max_retries;
        let budget = self.config.strong_write_timeout();

        for attempt in 0..=max_retries {
            if !self.is_current(&queued.key, queued.seq) {
                self.release(&queued.key);
                return;
            }
            if self.failover.is_active() {
                // Hand the key to the deferred set; its hold moves with it
                self.defer(&queued.key, queued.seq);
                self.release(&queued.key);
                return;
            }
            let result = match &queued.op {
                RemoteOp::Set { value, ttl } => {
                    tokio::time::timeout(budget, remote.put(&queued.key, value, *ttl))
                        .await
                        .map(|r| r.map(|_| ()))
                }
                RemoteOp::Delete => tokio::time::timeout(budget, remote.remove(&queued.key))
                    .await
                    .map(|r| r.map(|_| ())),
            };
            match result {
                Ok(Ok(())) => {
                    self.release(&queued.key);
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(key = %queued.key, attempt, error = %e, "write-behind attempt failed");
                }
                Err(_) => {
                    tracing::debug!(key = %queued.key, attempt, "write-behind attempt timed out");
                }
            }
            if attempt < max_retries {
                tokio::time::sleep(self.config.retry_base() * 2u32.saturating_pow(attempt)).await;
            }
        }

        self.counters
            .write_behind_failed
            .fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_write_behind_failed();
        tracing::warn!(key = %queued.key, retries = max_retries, "write-behind gave up");
        self.release(&queued.key);
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_request("cache key must not be empty"));
    }
    if INTERNAL_PREFIXES.iter().any(|p| key.starts_with(p)) {
        return Err(CacheError::invalid_request(format!(
            "cache key '{key}' uses a reserved prefix"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::{KvBackend, MemoryBackend};
    use crate::cache::compression::RemoteCodec;
    use crate::cache::entry_store::EntryStore;
    use crate::cache::topology::TopologyManager;
    use crate::cache::warming::{LoadedValue, WarmSource};
    use crate::config::CompressionConfig;
    use async_trait::async_trait;
    use lexicache_core::{CacheNode, NodeId, NodeKind};

    struct Harness {
        coordinator: Arc<CacheCoordinator>,
        backend: Arc<MemoryBackend>,
        cancel: CancellationToken,
    }

    fn harness_with(config: CoordinatorConfig) -> Harness {
        let node = CacheNode::new("a", "eu", NodeKind::Primary, "memory://a");
        let topology = Arc::new(TopologyManager::new(vec![node], 1, 1.25));
        let backend = Arc::new(MemoryBackend::new("a"));
        let store = EntryStore::new(
            topology,
            vec![(NodeId::new("a"), Arc::clone(&backend) as Arc<dyn KvBackend>)],
            Duration::from_millis(200),
            100,
        );
        let codec = Arc::new(RemoteCodec::new(Arc::new(store), CompressionConfig::default()));
        let coordinator = Arc::new(CacheCoordinator::new(
            Arc::new(LocalTier::new(1024 * 1024, 64)),
            Some(codec),
            config,
            Duration::from_secs(60),
            FailoverSwitch::default(),
            None,
        ));
        let cancel = CancellationToken::new();
        coordinator.spawn_write_behind(cancel.clone());
        Harness {
            coordinator,
            backend,
            cancel,
        }
    }

    fn harness() -> Harness {
        harness_with(CoordinatorConfig {
            write_behind_retry_base_ms: 5,
            remote_timeout_ms: 100,
            strong_write_timeout_ms: 100,
            ..CoordinatorConfig::default()
        })
    }

    async fn settle_queue(c: &CacheCoordinator) {
        for _ in 0..100 {
            if c.stats().write_behind_depth == 0 && c.keys.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_set_then_get_hits_local() {
        let h = harness();
        let c = &h.coordinator;
        let ack = c
            .set("user:1:name", b"Ada".to_vec(), Duration::from_secs(30), Durability::Async)
            .await
            .unwrap();
        assert!(ack.local);
        assert_eq!(ack.remote, RemoteState::Queued);

        let got = c.get("user:1:name").await.unwrap();
        assert_eq!(got.tier(), Some(Tier::Local));
        assert!(!got.degraded);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_remote_hit_is_promoted() {
        let h = harness();
        let c = &h.coordinator;
        c.set("doc:1", b"text".to_vec(), Duration::from_secs(30), Durability::Strong)
            .await
            .unwrap();
        c.local().clear();

        let first = c.get("doc:1").await.unwrap();
        assert_eq!(first.tier(), Some(Tier::Remote));
        let second = c.get("doc:1").await.unwrap();
        assert_eq!(second.tier(), Some(Tier::Local));
        assert_eq!(second.lookup.entry().unwrap().bytes(), b"text");
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_ttl_expiry_in_both_tiers() {
        let h = harness();
        let c = &h.coordinator;
        c.set("short", b"v".to_vec(), Duration::from_millis(40), Durability::Strong)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!c.get("short").await.unwrap().is_hit());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_zero_ttl_uses_default() {
        let h = harness();
        let c = &h.coordinator;
        c.set("k", b"v".to_vec(), Duration::ZERO, Durability::Async)
            .await
            .unwrap();
        let entry = c.get("k").await.unwrap().lookup.into_entry().unwrap();
        assert!(entry.remaining_ttl() > Duration::from_secs(50));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let h = harness();
        let c = &h.coordinator;
        c.set("k", b"v".to_vec(), Duration::from_secs(30), Durability::Strong)
            .await
            .unwrap();
        let first = c.delete("k").await.unwrap();
        assert!(first.existed);
        let second = c.delete("k").await.unwrap();
        assert!(!second.existed);
        assert!(!second.degraded);
        assert!(!c.get("k").await.unwrap().is_hit());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_failover_bypasses_remote_and_flushes_deletes() {
        let h = harness();
        let c = &h.coordinator;
        c.set("k", b"v".to_vec(), Duration::from_secs(30), Durability::Strong)
            .await
            .unwrap();

        c.failover().set_auto(true);
        let ack = c.delete("k").await.unwrap();
        assert_eq!(ack.remote, RemoteState::Deferred);
        assert!(ack.degraded);
        let miss = c.get("k").await.unwrap();
        assert!(!miss.is_hit() && miss.degraded);
        assert!(!h.backend.is_empty());

        c.failover().set_auto(false);
        assert_eq!(c.flush_deferred().await, 1);
        assert!(h.backend.keys_with_prefix("k").is_empty());
        assert!(!c.get("k").await.unwrap().is_hit());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_failover_flags_local_hits_degraded() {
        let h = harness();
        let c = &h.coordinator;
        c.set("user:1:name", b"Ada".to_vec(), Duration::from_secs(30), Durability::Async)
            .await
            .unwrap();

        c.failover().set_auto(true);
        let got = c.get("user:1:name").await.unwrap();
        assert_eq!(got.tier(), Some(Tier::Local));
        assert!(got.degraded);
        let before = c.stats().degraded_ops;

        c.failover().set_auto(false);
        let got = c.get("user:1:name").await.unwrap();
        assert!(!got.degraded);
        assert_eq!(c.stats().degraded_ops, before);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_oversized_ttl_is_clamped() {
        let h = harness();
        let c = &h.coordinator;
        c.set("far", b"v".to_vec(), Duration::from_secs(u64::MAX / 2), Durability::Strong)
            .await
            .unwrap();
        let entry = c.get("far").await.unwrap().lookup.into_entry().unwrap();
        assert!(entry.remaining_ttl() <= MAX_TTL);
        assert!(entry.remaining_ttl() > MAX_TTL - Duration::from_secs(60));

        c.local().clear();
        assert!(c.get("far").await.unwrap().is_hit());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_newer_write_supersedes_queued_one() {
        let h = harness();
        let c = &h.coordinator;
        for i in 0..20u8 {
            c.set("counter", vec![i], Duration::from_secs(30), Durability::Async)
                .await
                .unwrap();
        }
        settle_queue(c).await;
        c.local().clear();
        let entry = c.get("counter").await.unwrap().lookup.into_entry().unwrap();
        assert_eq!(entry.bytes(), &[19u8]);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_strong_write_degrades_on_remote_failure() {
        let h = harness();
        let c = &h.coordinator;
        h.backend.set_available(false);
        let ack = c
            .set("k", b"v".to_vec(), Duration::from_secs(30), Durability::Strong)
            .await
            .unwrap();
        assert!(ack.local && ack.degraded);
        assert_eq!(ack.remote, RemoteState::Queued);

        h.backend.set_available(true);
        settle_queue(c).await;
        c.local().clear();
        assert_eq!(c.get("k").await.unwrap().tier(), Some(Tier::Remote));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_remote_failure_reads_degrade_to_miss() {
        let h = harness();
        let c = &h.coordinator;
        h.backend.set_available(false);
        let result = c.get("missing").await.unwrap();
        assert!(!result.is_hit());
        assert!(result.degraded);
        assert_eq!(c.stats().degraded_ops, 1);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_slow_remote_times_out() {
        let h = harness();
        let c = &h.coordinator;
        h.backend.set_latency(Duration::from_millis(300));
        let started = Instant::now();
        let result = c.get("slow").await.unwrap();
        assert!(result.degraded);
        // budget plus half-budget retry
        assert!(started.elapsed() < Duration::from_millis(290));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_get_many() {
        let h = harness();
        let c = &h.coordinator;
        c.set("a", b"1".to_vec(), Duration::from_secs(30), Durability::Async)
            .await
            .unwrap();
        let keys = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let results = c.get_many(&keys).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results["a"].is_hit());
        assert!(!results["b"].is_hit());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_reserved_and_empty_keys_rejected() {
        let h = harness();
        let c = &h.coordinator;
        assert!(c.get("").await.is_err());
        assert!(
            c.set("blob:abc", vec![], Duration::ZERO, Durability::Async)
                .await
                .is_err()
        );
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_keys_with_prefix_hides_blobs() {
        let h = harness();
        let c = &h.coordinator;
        c.set("user:9:a", b"x".to_vec(), Duration::from_secs(30), Durability::Strong)
            .await
            .unwrap();
        c.local().clear();
        let (keys, degraded) = c.keys_with_prefix("", 100).await.unwrap();
        assert_eq!(keys, vec!["user:9:a".to_string()]);
        assert!(!degraded);
        h.cancel.cancel();
    }

    struct StaticSource;

    #[async_trait]
    impl WarmSource for StaticSource {
        async fn load(&self, key: &str) -> Result<Option<LoadedValue>> {
            Ok((key != "absent").then(|| LoadedValue {
                value: format!("origin:{key}").into_bytes(),
                ttl: None,
            }))
        }
    }

    #[tokio::test]
    async fn test_warm_key_outcomes() {
        let h = harness();
        let c = &h.coordinator;
        assert_eq!(c.warm_key("fresh", &StaticSource).await.unwrap(), WarmOutcome::Loaded);
        assert_eq!(
            c.warm_key("fresh", &StaticSource).await.unwrap(),
            WarmOutcome::AlreadyLocal
        );
        c.set("remote-only", b"x".to_vec(), Duration::from_secs(30), Durability::Strong)
            .await
            .unwrap();
        c.local().clear();
        assert_eq!(
            c.warm_key("remote-only", &StaticSource).await.unwrap(),
            WarmOutcome::Promoted
        );
        assert_eq!(
            c.warm_key("absent", &StaticSource).await.unwrap(),
            WarmOutcome::NotFound
        );
        h.cancel.cancel();
    }
}
