use crate::time::{Timestamp, now_utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Which cache level produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    Remote,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Local => write!(f, "local"),
            Tier::Remote => write!(f, "remote"),
        }
    }
}

/// A cached value together with its storage metadata.
///
/// The payload is wrapped in `Arc` so hits on hot keys clone a pointer,
/// not the bytes. `size_bytes` is the size of the representation held by
/// `source_tier` (compressed size for remote entries that were compressed).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Arc<Vec<u8>>,
    pub compressed: bool,
    pub size_bytes: u64,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub source_tier: Tier,
}

impl CacheEntry {
    /// Create an uncompressed entry expiring `ttl` from now.
    pub fn new(key: impl Into<String>, value: Arc<Vec<u8>>, ttl: Duration, tier: Tier) -> Self {
        let created_at = now_utc();
        let size_bytes = value.len() as u64;
        Self {
            key: key.into(),
            value,
            compressed: false,
            size_bytes,
            created_at,
            expires_at: created_at.plus(ttl),
            source_tier: tier,
        }
    }

    /// Override the stored representation metadata.
    pub fn with_storage(mut self, compressed: bool, size_bytes: u64) -> Self {
        self.compressed = compressed;
        self.size_bytes = size_bytes;
        self
    }

    pub fn bytes(&self) -> &[u8] {
        self.value.as_slice()
    }

    pub fn is_expired(&self) -> bool {
        now_utc() >= self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.since(&now_utc())
    }
}

/// Result of a single-key lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Miss => None,
        }
    }

    pub fn into_entry(self) -> Option<CacheEntry> {
        match self {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Miss => None,
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        self.entry().map(|e| e.source_tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_sets_expiry() {
        let entry = CacheEntry::new(
            "translation:en:fr:abc",
            Arc::new(b"bonjour".to_vec()),
            Duration::from_secs(60),
            Tier::Local,
        );
        assert_eq!(entry.size_bytes, 7);
        assert!(!entry.compressed);
        assert!(!entry.is_expired());
        assert!(entry.expires_at > entry.created_at);
        assert!(entry.remaining_ttl() <= Duration::from_secs(60));
    }

    #[test]
    fn test_zero_ttl_is_immediately_expired() {
        let entry = CacheEntry::new("k", Arc::new(vec![1]), Duration::ZERO, Tier::Remote);
        assert!(entry.is_expired());
        assert_eq!(entry.remaining_ttl(), Duration::ZERO);
    }

    #[test]
    fn test_lookup_accessors() {
        let entry = CacheEntry::new("k", Arc::new(vec![1, 2]), Duration::from_secs(5), Tier::Remote)
            .with_storage(true, 1);
        let hit = Lookup::Hit(entry.clone());
        assert!(hit.is_hit());
        assert_eq!(hit.tier(), Some(Tier::Remote));
        assert_eq!(hit.into_entry(), Some(entry));
        assert!(!Lookup::Miss.is_hit());
        assert_eq!(Lookup::Miss.tier(), None);
    }
}
