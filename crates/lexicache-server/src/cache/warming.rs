//! Cache warming.
//!
//! A job resolves a candidate key set, then walks it with bounded per-job
//! concurrency. Every key also takes a permit from a pool shared by all jobs,
//! so several jobs together never exceed `global_permits` in-flight loads.
//! Jobs stop at their timeout or when cancelled, and report completion once
//! through a oneshot channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use lexicache_core::{CacheError, Result, WarmingJob, WarmingKind};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::analytics::AnalyticsEngine;
use super::coordinator::{CacheCoordinator, MAX_TTL, WarmOutcome};
use super::jobs::JobStore;
use crate::config::WarmingConfig;

pub const TRANSLATION_PREFIX: &str = "translation:";

/// Value fetched from the system of record.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedValue {
    pub value: Vec<u8>,
    /// `None` falls back to the coordinator default.
    pub ttl: Option<Duration>,
}

/// Where warming loads keys that neither tier holds.
#[async_trait]
pub trait WarmSource: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<LoadedValue>>;
}

/// Loads `{base_url}/{key}` over HTTP. 404 means the key does not exist;
/// `Cache-Control: max-age` sets the TTL.
pub struct OriginSource {
    client: reqwest::Client,
    base_url: String,
}

impl OriginSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::configuration(format!("origin client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl WarmSource for OriginSource {
    async fn load(&self, key: &str) -> Result<Option<LoadedValue>> {
        let url = format!("{}/{}", self.base_url, key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CacheError::backend("origin", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| CacheError::backend("origin", e))?;
        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(max_age);
        let body = response
            .bytes()
            .await
            .map_err(|e| CacheError::backend("origin", e))?;
        Ok(Some(LoadedValue {
            value: body.to_vec(),
            ttl,
        }))
    }
}

fn max_age(header: &str) -> Option<Duration> {
    header.split(',').find_map(|directive| {
        let secs = directive.trim().strip_prefix("max-age=")?;
        secs.parse::<u64>()
            .ok()
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(s).min(MAX_TTL))
    })
}

/// Source used when no origin is configured: only promotes remote entries.
pub struct NoopSource;

#[async_trait]
impl WarmSource for NoopSource {
    async fn load(&self, _key: &str) -> Result<Option<LoadedValue>> {
        Ok(None)
    }
}

/// Body of `POST /cache/warm`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WarmRequest {
    Predictive {
        #[serde(default)]
        hours: Option<u32>,
    },
    /// Everything under the translation key namespace.
    Translations {
        #[serde(default)]
        limit: Option<usize>,
    },
    Prefix {
        prefix: String,
    },
    Keys {
        keys: Vec<String>,
    },
}

/// Handle returned when a job is submitted.
pub struct WarmTicket {
    pub job: WarmingJob,
    pub done: oneshot::Receiver<WarmingJob>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmingDashboard {
    pub active_jobs: usize,
    pub available_permits: usize,
    pub timer_enabled: bool,
    pub interval_secs: u64,
    pub horizon_hours: u32,
    pub origin_configured: bool,
    pub recent_jobs: Vec<WarmingJob>,
}

pub struct WarmingScheduler {
    coordinator: Arc<CacheCoordinator>,
    analytics: Option<Arc<AnalyticsEngine>>,
    source: Arc<dyn WarmSource>,
    config: WarmingConfig,
    permits: Arc<Semaphore>,
    jobs: JobStore<WarmingJob>,
    cancels: DashMap<Uuid, CancellationToken>,
}

impl WarmingScheduler {
    pub fn new(
        coordinator: Arc<CacheCoordinator>,
        analytics: Option<Arc<AnalyticsEngine>>,
        source: Arc<dyn WarmSource>,
        config: WarmingConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.global_permits.max(1)));
        let jobs = JobStore::new(Duration::from_secs(config.retention_secs), config.history_max);
        Self {
            coordinator,
            analytics,
            source,
            config,
            permits,
            jobs,
            cancels: DashMap::new(),
        }
    }

    /// Build the source from `origin_url`, falling back to `NoopSource`.
    pub fn source_from_config(config: &WarmingConfig) -> Result<Arc<dyn WarmSource>> {
        match &config.origin_url {
            Some(url) => Ok(Arc::new(OriginSource::new(
                url.clone(),
                Duration::from_millis(config.origin_timeout_ms),
            )?)),
            None => Ok(Arc::new(NoopSource)),
        }
    }

    pub fn job(&self, id: Uuid) -> Option<WarmingJob> {
        self.jobs.get(id)
    }

    pub fn cleanup(&self) -> usize {
        self.jobs.cleanup()
    }

    pub fn dashboard(&self) -> WarmingDashboard {
        WarmingDashboard {
            active_jobs: self.jobs.active(),
            available_permits: self.permits.available_permits(),
            timer_enabled: self.config.timer_enabled,
            interval_secs: self.config.interval_secs,
            horizon_hours: self.config.horizon_hours,
            origin_configured: self.config.origin_url.is_some(),
            recent_jobs: self.jobs.recent(20),
        }
    }

    async fn candidates(
        &self,
        request: &WarmRequest,
    ) -> Result<(WarmingKind, Option<String>, Vec<String>)> {
        let max = self.config.max_keys_per_job;
        let (kind, pattern, keys) = match request {
            WarmRequest::Predictive { hours } => {
                let horizon = hours.unwrap_or(self.config.horizon_hours);
                let mut keys = Vec::new();
                if let Some(analytics) = &self.analytics {
                    keys.extend(analytics.hotspots().into_iter().map(|h| h.key));
                    keys.extend(analytics.predicted_keys(horizon, max));
                }
                (WarmingKind::Predictive, Some(format!("next {horizon}h")), keys)
            }
            WarmRequest::Translations { limit } => {
                let limit = limit.unwrap_or(max).min(max);
                let keys = self.prefix_candidates(TRANSLATION_PREFIX, limit).await?;
                (WarmingKind::TargetedPattern, Some("translations".to_string()), keys)
            }
            WarmRequest::Prefix { prefix } => {
                if prefix.is_empty() {
                    return Err(CacheError::invalid_request("prefix must not be empty"));
                }
                let keys = self.prefix_candidates(prefix, max).await?;
                (WarmingKind::TargetedPattern, Some(prefix.clone()), keys)
            }
            WarmRequest::Keys { keys } => {
                if keys.is_empty() || keys.iter().any(|k| k.is_empty()) {
                    return Err(CacheError::invalid_request(
                        "keys must contain at least one non-empty key",
                    ));
                }
                (WarmingKind::TargetedPattern, Some("keys".to_string()), keys.clone())
            }
        };

        let mut seen = HashSet::new();
        let mut unique: Vec<String> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
        unique.truncate(max);
        Ok((kind, pattern, unique))
    }

    /// Keys both tiers hold plus keys analytics has seen requested.
    async fn prefix_candidates(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let (mut keys, degraded) = self.coordinator.keys_with_prefix(prefix, limit).await?;
        if degraded {
            tracing::debug!(prefix, "warming candidates resolved without the remote tier");
        }
        if let Some(analytics) = &self.analytics {
            keys.extend(analytics.known_keys(prefix, limit));
        }
        Ok(keys)
    }

    /// Resolve candidates, record the job and start it.
    pub async fn submit(self: &Arc<Self>, request: WarmRequest) -> Result<WarmTicket> {
        let (kind, pattern, keys) = self.candidates(&request).await?;
        let job = WarmingJob::new(kind, pattern, keys.len() as u64);
        let id = job.id;
        self.jobs.insert(job.clone());

        let cancel = CancellationToken::new();
        self.cancels.insert(id, cancel.clone());
        let (tx, rx) = oneshot::channel();
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let finished = scheduler.run_job(id, keys, cancel).await;
            scheduler.cancels.remove(&id);
            // Receiver may be gone
            let _ = tx.send(finished);
        });

        tracing::info!(job_id = %id, kind = ?kind, candidates = job.candidate_keys, "warming job submitted");
        Ok(WarmTicket { job, done: rx })
    }

    /// Submit and wait for the job to finish.
    pub async fn run(self: &Arc<Self>, request: WarmRequest) -> Result<WarmingJob> {
        let ticket = self.submit(request).await?;
        let id = ticket.job.id;
        match ticket.done.await {
            Ok(job) => Ok(job),
            Err(_) => self
                .jobs
                .get(id)
                .ok_or_else(|| CacheError::not_found(format!("warming job {id}"))),
        }
    }

    pub fn cancel(&self, id: Uuid) -> Result<WarmingJob> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| CacheError::not_found(format!("warming job {id}")))?;
        if let Some(token) = self.cancels.get(&id) {
            token.cancel();
        }
        Ok(job)
    }

    async fn run_job(&self, id: Uuid, keys: Vec<String>, cancel: CancellationToken) -> WarmingJob {
        self.jobs.update(id, |j| j.start());
        let warmed = AtomicU64::new(0);
        let failed = AtomicU64::new(0);
        let per_job = self.config.per_job_concurrency.max(1);

        let work = stream::iter(keys.iter())
            .for_each_concurrent(per_job, |key| {
                let warmed = &warmed;
                let failed = &failed;
                async move {
                    let Ok(_permit) = self.permits.acquire().await else {
                        failed.fetch_add(1, Ordering::Relaxed);
                        return;
                    };
                    match self.coordinator.warm_key(key, self.source.as_ref()).await {
                        Ok(WarmOutcome::NotFound) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {
                            warmed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            tracing::debug!(key = %key, error = %e, "warming key failed");
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });

        let timeout = self.config.job_timeout();
        let (timed_out, cancelled) = tokio::select! {
            result = tokio::time::timeout(timeout, work) => (result.is_err(), false),
            _ = cancel.cancelled() => (false, true),
        };

        let warmed = warmed.load(Ordering::Relaxed);
        let failed = failed.load(Ordering::Relaxed);
        crate::metrics::record_warming_keys("warmed", warmed);
        crate::metrics::record_warming_keys("failed", failed);

        let finished = self.jobs.update(id, |j| {
            if cancelled {
                j.warmed_keys = warmed;
                j.failed_keys = failed;
                j.cancel();
            } else {
                j.finish(warmed, failed, timed_out);
            }
        });
        match finished {
            Some(job) => {
                if timed_out {
                    tracing::warn!(job_id = %id, warmed, timeout_secs = timeout.as_secs(), "warming job timed out");
                } else {
                    tracing::info!(job_id = %id, warmed, failed, status = ?job.status, "warming job finished");
                }
                job
            }
            None => {
                // Evicted from history while running
                let mut job = WarmingJob::new(WarmingKind::Predictive, None, keys.len() as u64);
                job.id = id;
                job.finish(warmed, failed, timed_out);
                job
            }
        }
    }

    /// Run predictive warming every `interval_secs`.
    pub fn spawn_timer(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; there is no history yet
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.cleanup();
                        let request = WarmRequest::Predictive { hours: None };
                        if let Err(e) = scheduler.submit(request).await {
                            tracing::warn!(error = %e, "scheduled warming failed to start");
                        }
                    }
                }
            }
        })
    }
}
