//! Invalidation events and warming jobs.

use crate::error::{CacheError, Result};
use crate::time::{Timestamp, now_utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain change that makes a set of cached keys stale.
///
/// Serialized adjacently tagged so the HTTP body reads
/// `{"event": "document", "context": {"documentId": "..."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "context", rename_all = "snake_case")]
pub enum InvalidationTrigger {
    #[serde(rename_all = "camelCase")]
    UserData { user_id: String },
    #[serde(rename_all = "camelCase")]
    Document { document_id: String },
    #[serde(rename_all = "camelCase")]
    TranslationPair {
        source_lang: String,
        target_lang: String,
    },
    #[serde(rename_all = "camelCase")]
    Glossary { glossary_id: String },
    Keys { keys: Vec<String> },
    Prefix { prefix: String },
}

impl InvalidationTrigger {
    pub fn name(&self) -> &'static str {
        match self {
            InvalidationTrigger::UserData { .. } => "user_data",
            InvalidationTrigger::Document { .. } => "document",
            InvalidationTrigger::TranslationPair { .. } => "translation_pair",
            InvalidationTrigger::Glossary { .. } => "glossary",
            InvalidationTrigger::Keys { .. } => "keys",
            InvalidationTrigger::Prefix { .. } => "prefix",
        }
    }

    /// Reject triggers that would resolve to an empty or unbounded key set.
    pub fn validate(&self) -> Result<()> {
        let blank = |field: &str, value: &str| {
            if value.trim().is_empty() || value.contains(':') {
                Err(CacheError::invalid_request(format!(
                    "{} event requires a non-empty '{field}' without ':'",
                    self.name()
                )))
            } else {
                Ok(())
            }
        };
        match self {
            InvalidationTrigger::UserData { user_id } => blank("userId", user_id),
            InvalidationTrigger::Document { document_id } => blank("documentId", document_id),
            InvalidationTrigger::TranslationPair {
                source_lang,
                target_lang,
            } => {
                blank("sourceLang", source_lang)?;
                blank("targetLang", target_lang)
            }
            InvalidationTrigger::Glossary { glossary_id } => blank("glossaryId", glossary_id),
            InvalidationTrigger::Keys { keys } => {
                if keys.is_empty() || keys.iter().any(|k| k.is_empty()) {
                    Err(CacheError::invalid_request(
                        "keys event requires at least one non-empty key",
                    ))
                } else {
                    Ok(())
                }
            }
            InvalidationTrigger::Prefix { prefix } => {
                if prefix.is_empty() {
                    Err(CacheError::invalid_request("prefix event requires a non-empty prefix"))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationStatus {
    Queued,
    Applying,
    Applied,
    Failed,
}

impl InvalidationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvalidationStatus::Applied | InvalidationStatus::Failed)
    }

    pub fn can_transition_to(&self, next: InvalidationStatus) -> bool {
        matches!(
            (self, next),
            (InvalidationStatus::Queued, InvalidationStatus::Applying)
                | (InvalidationStatus::Applying, InvalidationStatus::Applied)
                | (InvalidationStatus::Applying, InvalidationStatus::Failed)
        )
    }
}

impl std::fmt::Display for InvalidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationStatus::Queued => write!(f, "queued"),
            InvalidationStatus::Applying => write!(f, "applying"),
            InvalidationStatus::Applied => write!(f, "applied"),
            InvalidationStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    pub id: Uuid,
    pub trigger: InvalidationTrigger,
    pub status: InvalidationStatus,
    pub affected_key_count: u64,
    pub failed_key_count: u64,
    /// 0 for the original event, incremented for each retry child.
    pub attempt: u32,
    pub parent_id: Option<Uuid>,
    pub created_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    #[serde(skip)]
    pub failed_keys: Vec<String>,
}

impl InvalidationEvent {
    pub fn new(trigger: InvalidationTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            status: InvalidationStatus::Queued,
            affected_key_count: 0,
            failed_key_count: 0,
            attempt: 0,
            parent_id: None,
            created_at: now_utc(),
            finished_at: None,
            failed_keys: Vec::new(),
        }
    }

    /// Retry event covering the keys this event failed to delete.
    pub fn retry_child(&self) -> Self {
        let mut child = Self::new(InvalidationTrigger::Keys {
            keys: self.failed_keys.clone(),
        });
        child.attempt = self.attempt + 1;
        child.parent_id = Some(self.id);
        child
    }

    pub fn transition(&mut self, next: InvalidationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CacheError::conflict(format!(
                "invalidation event {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(now_utc());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmingKind {
    Predictive,
    TargetedPattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmingStatus {
    Pending,
    Running,
    Completed,
    PartialFailure,
    Cancelled,
}

impl WarmingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WarmingStatus::Completed | WarmingStatus::PartialFailure | WarmingStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmingJob {
    pub id: Uuid,
    pub kind: WarmingKind,
    pub pattern: Option<String>,
    pub candidate_keys: u64,
    pub status: WarmingStatus,
    pub success_rate: f64,
    pub warmed_keys: u64,
    pub failed_keys: u64,
    pub timed_out: bool,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl WarmingJob {
    pub fn new(kind: WarmingKind, pattern: Option<String>, candidate_keys: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            pattern,
            candidate_keys,
            status: WarmingStatus::Pending,
            success_rate: 0.0,
            warmed_keys: 0,
            failed_keys: 0,
            timed_out: false,
            created_at: now_utc(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = WarmingStatus::Running;
        self.started_at = Some(now_utc());
    }

    /// Record the outcome. Keys not attempted before a timeout count
    /// against the success rate.
    pub fn finish(&mut self, warmed: u64, failed: u64, timed_out: bool) {
        self.warmed_keys = warmed;
        self.failed_keys = failed;
        self.timed_out = timed_out;
        self.success_rate = if self.candidate_keys == 0 {
            1.0
        } else {
            warmed as f64 / self.candidate_keys as f64
        };
        self.status = if warmed == self.candidate_keys {
            WarmingStatus::Completed
        } else {
            WarmingStatus::PartialFailure
        };
        self.finished_at = Some(now_utc());
    }

    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = WarmingStatus::Cancelled;
            self.finished_at = Some(now_utc());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_wire_format() {
        let trigger: InvalidationTrigger = serde_json::from_str(
            r#"{"event":"translation_pair","context":{"sourceLang":"en","targetLang":"de"}}"#,
        )
        .unwrap();
        assert_eq!(
            trigger,
            InvalidationTrigger::TranslationPair {
                source_lang: "en".into(),
                target_lang: "de".into()
            }
        );
        assert_eq!(trigger.name(), "translation_pair");
    }

    #[test]
    fn test_trigger_validation() {
        assert!(
            InvalidationTrigger::UserData {
                user_id: "42".into()
            }
            .validate()
            .is_ok()
        );
        assert!(
            InvalidationTrigger::UserData {
                user_id: " ".into()
            }
            .validate()
            .is_err()
        );
        assert!(
            InvalidationTrigger::Document {
                document_id: "a:b".into()
            }
            .validate()
            .is_err()
        );
        assert!(InvalidationTrigger::Keys { keys: vec![] }.validate().is_err());
        assert!(
            InvalidationTrigger::Prefix {
                prefix: String::new()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_event_state_machine() {
        let mut event = InvalidationEvent::new(InvalidationTrigger::Prefix {
            prefix: "user:1:".into(),
        });
        assert!(event.transition(InvalidationStatus::Applied).is_err());
        event.transition(InvalidationStatus::Applying).unwrap();
        event.transition(InvalidationStatus::Applied).unwrap();
        assert!(event.finished_at.is_some());
        let err = event.transition(InvalidationStatus::Applying).unwrap_err();
        assert!(matches!(err, CacheError::Conflict(_)));
    }

    #[test]
    fn test_retry_child_links_parent() {
        let mut event = InvalidationEvent::new(InvalidationTrigger::Glossary {
            glossary_id: "g1".into(),
        });
        event.failed_keys = vec!["glossary:g1:terms".into()];
        let child = event.retry_child();
        assert_eq!(child.parent_id, Some(event.id));
        assert_eq!(child.attempt, 1);
        assert_eq!(
            child.trigger,
            InvalidationTrigger::Keys {
                keys: vec!["glossary:g1:terms".into()]
            }
        );
    }

    #[test]
    fn test_warming_job_outcomes() {
        let mut job = WarmingJob::new(WarmingKind::TargetedPattern, Some("translations".into()), 100);
        job.start();
        job.finish(100, 0, false);
        assert_eq!(job.status, WarmingStatus::Completed);
        assert_eq!(job.success_rate, 1.0);

        let mut partial = WarmingJob::new(WarmingKind::Predictive, None, 10);
        partial.finish(7, 1, true);
        assert_eq!(partial.status, WarmingStatus::PartialFailure);
        assert!((partial.success_rate - 0.7).abs() < f64::EPSILON);
        partial.cancel();
        assert_eq!(partial.status, WarmingStatus::PartialFailure);

        let mut empty = WarmingJob::new(WarmingKind::Predictive, None, 0);
        empty.finish(0, 0, false);
        assert_eq!(empty.status, WarmingStatus::Completed);
        assert_eq!(empty.success_rate, 1.0);
    }
}
