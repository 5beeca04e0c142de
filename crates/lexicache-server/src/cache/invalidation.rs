//! Event-driven invalidation.
//!
//! A domain event resolves to key prefixes (or explicit keys), the matching
//! keys are deleted through the coordinator, and keys whose remote delete
//! failed are retried as a child event after a backoff. The original event
//! is `Applied` even on partial failure; only a retry that exhausts
//! `max_retries` ends `Failed`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use lexicache_core::{InvalidationEvent, InvalidationStatus, InvalidationTrigger, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::coordinator::CacheCoordinator;
use super::jobs::JobStore;
use crate::config::InvalidationConfig;

/// Upper bound on keys resolved per prefix.
const RESOLVE_LIMIT: usize = 100_000;

/// Key prefixes covered by a trigger. Empty for explicit key lists.
pub fn prefixes_for(trigger: &InvalidationTrigger) -> Vec<String> {
    match trigger {
        InvalidationTrigger::UserData { user_id } => vec![format!("user:{user_id}:")],
        InvalidationTrigger::Document { document_id } => vec![
            format!("document:{document_id}:"),
            format!("ocr:{document_id}:"),
        ],
        InvalidationTrigger::TranslationPair {
            source_lang,
            target_lang,
        } => vec![format!("translation:{source_lang}:{target_lang}:")],
        InvalidationTrigger::Glossary { glossary_id } => vec![format!("glossary:{glossary_id}:")],
        InvalidationTrigger::Prefix { prefix } => vec![prefix.clone()],
        InvalidationTrigger::Keys { .. } => Vec::new(),
    }
}

/// Response of `POST /cache/invalidate`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationOutcome {
    pub event_id: Uuid,
    pub status: InvalidationStatus,
    pub invalidated: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_event_id: Option<Uuid>,
}

pub struct InvalidationPropagator {
    coordinator: Arc<CacheCoordinator>,
    config: InvalidationConfig,
    events: JobStore<InvalidationEvent>,
    shutdown: CancellationToken,
}

impl InvalidationPropagator {
    pub fn new(
        coordinator: Arc<CacheCoordinator>,
        config: InvalidationConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let events = JobStore::new(Duration::from_secs(config.retention_secs), config.history_max);
        Self {
            coordinator,
            config,
            events,
            shutdown,
        }
    }

    pub fn event(&self, id: Uuid) -> Option<InvalidationEvent> {
        self.events.get(id)
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<InvalidationEvent> {
        self.events.recent(limit)
    }

    pub fn cleanup(&self) -> usize {
        self.events.cleanup()
    }

    /// Validate and apply a trigger, returning once its keys are processed.
    pub async fn invalidate(self: &Arc<Self>, trigger: InvalidationTrigger) -> Result<InvalidationOutcome> {
        trigger.validate()?;
        let event = InvalidationEvent::new(trigger);
        Ok(self.apply(event).await)
    }

    async fn resolve(&self, trigger: &InvalidationTrigger) -> Result<Vec<String>> {
        if let InvalidationTrigger::Keys { keys } = trigger {
            let mut keys = keys.clone();
            keys.sort();
            keys.dedup();
            return Ok(keys);
        }
        let mut keys = Vec::new();
        for prefix in prefixes_for(trigger) {
            let (found, degraded) = self.coordinator.keys_with_prefix(&prefix, RESOLVE_LIMIT).await?;
            if degraded {
                tracing::warn!(prefix = %prefix, "remote tier not scanned, invalidating local keys only");
            }
            keys.extend(found);
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn apply(self: &Arc<Self>, mut event: InvalidationEvent) -> InvalidationOutcome {
        let id = event.id;
        let name = event.trigger.name();
        // Queued -> Applying cannot fail for a fresh event
        let _ = event.transition(InvalidationStatus::Applying);
        self.events.insert(event.clone());

        let keys = match self.resolve(&event.trigger).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(event_id = %id, event = name, error = %e, "could not resolve keys");
                Vec::new()
            }
        };

        let results: Vec<(String, bool)> = stream::iter(keys)
            .map(|key| async move {
                let ok = match self.coordinator.delete_strict(&key).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::debug!(key = %key, error = %e, "invalidation delete failed");
                        false
                    }
                };
                (key, ok)
            })
            .buffer_unordered(self.config.delete_concurrency.max(1))
            .collect()
            .await;

        let mut invalidated = 0u64;
        let mut failed_keys = Vec::new();
        for (key, ok) in results {
            if ok {
                invalidated += 1;
            } else {
                failed_keys.push(key);
            }
        }
        failed_keys.sort();

        let exhausted = !failed_keys.is_empty() && event.attempt >= self.config.max_retries;
        let next = if exhausted {
            InvalidationStatus::Failed
        } else {
            InvalidationStatus::Applied
        };
        event.affected_key_count = invalidated;
        event.failed_key_count = failed_keys.len() as u64;
        event.failed_keys = failed_keys;
        let _ = event.transition(next);
        self.events.insert(event.clone());
        crate::metrics::record_invalidation(&next.to_string());

        let mut retry_event_id = None;
        if exhausted {
            crate::metrics::record_invalidation_failed(name);
            tracing::error!(
                event_id = %id,
                event = name,
                attempt = event.attempt,
                failed = event.failed_key_count,
                "invalidation gave up after retries"
            );
        } else if !event.failed_keys.is_empty() {
            let child = event.retry_child();
            retry_event_id = Some(child.id);
            self.schedule_retry(child);
        }

        tracing::info!(
            event_id = %id,
            event = name,
            invalidated,
            failed = event.failed_key_count,
            status = %event.status,
            "invalidation applied"
        );

        InvalidationOutcome {
            event_id: id,
            status: event.status,
            invalidated,
            failed: event.failed_key_count,
            retry_event_id,
        }
    }

    fn schedule_retry(self: &Arc<Self>, child: InvalidationEvent) {
        let delay = self.backoff(child.attempt);
        self.events.insert(child.clone());
        let propagator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = propagator.shutdown.cancelled() => {
                    tracing::debug!(event_id = %child.id, "retry abandoned at shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    propagator.apply(child).await;
                }
            }
        });
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.retry_base_delay_ms) * 2u32.pow(exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::{KvBackend, MemoryBackend};
    use crate::cache::compression::RemoteCodec;
    use crate::cache::coordinator::Durability;
    use crate::cache::entry_store::EntryStore;
    use crate::cache::health::FailoverSwitch;
    use crate::cache::local::LocalTier;
    use crate::cache::topology::TopologyManager;
    use crate::config::{CompressionConfig, CoordinatorConfig};
    use lexicache_core::{CacheNode, NodeId, NodeKind};

    struct Fixture {
        propagator: Arc<InvalidationPropagator>,
        coordinator: Arc<CacheCoordinator>,
        backend: Arc<MemoryBackend>,
    }

    fn fixture(config: InvalidationConfig) -> Fixture {
        let node = CacheNode::new("a", "eu", NodeKind::Primary, "memory://a");
        let topology = Arc::new(TopologyManager::new(vec![node], 1, 1.25));
        let backend = Arc::new(MemoryBackend::new("a"));
        let store = EntryStore::new(
            topology,
            vec![(NodeId::new("a"), Arc::clone(&backend) as Arc<dyn KvBackend>)],
            Duration::from_millis(100),
            100,
        );
        let codec = Arc::new(RemoteCodec::new(Arc::new(store), CompressionConfig::default()));
        let coordinator = Arc::new(CacheCoordinator::new(
            Arc::new(LocalTier::new(1024 * 1024, 64)),
            Some(codec),
            CoordinatorConfig::default(),
            Duration::from_secs(60),
            FailoverSwitch::default(),
            None,
        ));
        let propagator = Arc::new(InvalidationPropagator::new(
            Arc::clone(&coordinator),
            config,
            CancellationToken::new(),
        ));
        Fixture {
            propagator,
            coordinator,
            backend,
        }
    }

    fn fast_retries(max_retries: u32) -> InvalidationConfig {
        InvalidationConfig {
            max_retries,
            retry_base_delay_ms: 50,
            ..InvalidationConfig::default()
        }
    }

    async fn seed(c: &CacheCoordinator, keys: &[&str]) {
        for key in keys {
            c.set(key, b"v".to_vec(), Duration::from_secs(60), Durability::Strong)
                .await
                .unwrap();
        }
    }

    async fn wait_for_child(p: &InvalidationPropagator, parent: Uuid) -> InvalidationEvent {
        for _ in 0..200 {
            if let Some(child) = p
                .recent(50)
                .into_iter()
                .find(|e| e.parent_id == Some(parent) && e.status.is_terminal())
            {
                return child;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("retry event for {parent} never finished");
    }

    #[test]
    fn test_prefix_rules() {
        assert_eq!(
            prefixes_for(&InvalidationTrigger::UserData {
                user_id: "42".into()
            }),
            vec!["user:42:".to_string()]
        );
        assert_eq!(
            prefixes_for(&InvalidationTrigger::Document {
                document_id: "d1".into()
            }),
            vec!["document:d1:".to_string(), "ocr:d1:".to_string()]
        );
        assert_eq!(
            prefixes_for(&InvalidationTrigger::TranslationPair {
                source_lang: "en".into(),
                target_lang: "ja".into()
            }),
            vec!["translation:en:ja:".to_string()]
        );
        assert!(prefixes_for(&InvalidationTrigger::Keys { keys: vec!["k".into()] }).is_empty());
    }

    #[tokio::test]
    async fn test_user_event_deletes_only_that_user() {
        let f = fixture(InvalidationConfig::default());
        seed(&f.coordinator, &["user:1:profile", "user:1:prefs", "user:2:profile"]).await;
        f.coordinator.local().clear();

        let outcome = f
            .propagator
            .invalidate(InvalidationTrigger::UserData {
                user_id: "1".into(),
            })
            .await
            .unwrap();
        assert_eq!(outcome.status, InvalidationStatus::Applied);
        assert_eq!(outcome.invalidated, 2);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.retry_event_id.is_none());
        assert!(!f.coordinator.get("user:1:profile").await.unwrap().is_hit());
        assert!(f.coordinator.get("user:2:profile").await.unwrap().is_hit());

        let stored = f.propagator.event(outcome.event_id).unwrap();
        assert_eq!(stored.affected_key_count, 2);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_document_event_covers_ocr_keys() {
        let f = fixture(InvalidationConfig::default());
        seed(&f.coordinator, &["document:d1:meta", "ocr:d1:page:1", "ocr:d2:page:1"]).await;
        let outcome = f
            .propagator
            .invalidate(InvalidationTrigger::Document {
                document_id: "d1".into(),
            })
            .await
            .unwrap();
        assert_eq!(outcome.invalidated, 2);
        assert!(f.coordinator.get("ocr:d2:page:1").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_invalid_trigger_rejected() {
        let f = fixture(InvalidationConfig::default());
        let err = f
            .propagator
            .invalidate(InvalidationTrigger::Glossary {
                glossary_id: String::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(f.propagator.recent(10).is_empty());
    }

    #[tokio::test]
    async fn test_failed_keys_retry_as_child_event() {
        let f = fixture(fast_retries(3));
        seed(&f.coordinator, &["glossary:g1:a", "glossary:g1:b"]).await;
        f.backend.set_available(false);

        let outcome = f
            .propagator
            .invalidate(InvalidationTrigger::Keys {
                keys: vec!["glossary:g1:a".into(), "glossary:g1:b".into()],
            })
            .await
            .unwrap();
        assert_eq!(outcome.status, InvalidationStatus::Applied);
        assert_eq!(outcome.invalidated, 0);
        assert_eq!(outcome.failed, 2);
        assert!(outcome.retry_event_id.is_some());

        f.backend.set_available(true);
        let child = wait_for_child(&f.propagator, outcome.event_id).await;
        assert_eq!(child.status, InvalidationStatus::Applied);
        assert_eq!(child.attempt, 1);
        assert_eq!(child.affected_key_count, 2);
        assert!(f.backend.keys_with_prefix("glossary:").is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_failed() {
        let f = fixture(fast_retries(1));
        f.backend.set_available(false);
        let outcome = f
            .propagator
            .invalidate(InvalidationTrigger::Keys {
                keys: vec!["k".into()],
            })
            .await
            .unwrap();
        let child = wait_for_child(&f.propagator, outcome.event_id).await;
        assert_eq!(child.status, InvalidationStatus::Failed);
        assert_eq!(child.failed_key_count, 1);
    }
}
