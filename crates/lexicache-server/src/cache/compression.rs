//! Value transforms between the coordinator and the entry store.
//!
//! Values are content-addressed: the payload lives once under
//! `blob:<sha256>` with a reference count in `blobrc:<sha256>`, and the
//! caller's key holds a small frame pointing at it. Frames on caller keys:
//!
//! ```text
//! [tag u8][expires_at unix ms, i64 BE][body]
//!   tag 0  raw payload
//!   tag 1  zlib payload
//!   tag 2  MessagePack BlobRef
//! ```
//!
//! Blob values carry just `[tag u8][body]` with tag 0 or 1.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use lexicache_core::{CacheError, Result, now_utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::entry_store::EntryStore;
use crate::config::CompressionConfig;

const TAG_RAW: u8 = 0;
const TAG_ZLIB: u8 = 1;
const TAG_REF: u8 = 2;
const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BlobRef {
    #[serde(rename = "f")]
    fingerprint: String,
    #[serde(rename = "n")]
    original_len: u64,
    #[serde(rename = "s")]
    stored_len: u64,
    #[serde(rename = "c")]
    compressed: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Body {
    Inline { compressed: bool, data: Vec<u8> },
    Ref(BlobRef),
}

#[derive(Debug, Clone, PartialEq)]
struct Frame {
    expires_at_ms: i64,
    body: Body,
}

impl Frame {
    fn encode(&self) -> Result<Vec<u8>> {
        let (tag, body) = match &self.body {
            Body::Inline { compressed, data } => {
                (if *compressed { TAG_ZLIB } else { TAG_RAW }, data.clone())
            }
            Body::Ref(r) => (
                TAG_REF,
                rmp_serde::to_vec_named(r).map_err(CacheError::serialization)?,
            ),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.push(tag);
        out.extend_from_slice(&self.expires_at_ms.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(CacheError::serialization("frame shorter than header"));
        }
        let mut expiry = [0u8; 8];
        expiry.copy_from_slice(&bytes[1..HEADER_LEN]);
        let expires_at_ms = i64::from_be_bytes(expiry);
        let rest = &bytes[HEADER_LEN..];
        let body = match bytes[0] {
            TAG_RAW => Body::Inline {
                compressed: false,
                data: rest.to_vec(),
            },
            TAG_ZLIB => Body::Inline {
                compressed: true,
                data: rest.to_vec(),
            },
            TAG_REF => Body::Ref(rmp_serde::from_slice(rest).map_err(CacheError::serialization)?),
            other => {
                return Err(CacheError::serialization(format!("unknown frame tag {other}")));
            }
        };
        Ok(Self {
            expires_at_ms,
            body,
        })
    }
}

fn now_ms() -> i64 {
    (now_utc().0.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn fingerprint(value: &[u8]) -> String {
    hex::encode(Sha256::digest(value))
}

fn blob_key(fp: &str) -> String {
    format!("blob:{fp}")
}

fn refcount_key(fp: &str) -> String {
    format!("blobrc:{fp}")
}

fn zlib_compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data).map_err(CacheError::serialization)?;
    encoder.finish().map_err(CacheError::serialization)
}

fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(CacheError::serialization)?;
    Ok(out)
}

/// A value read back from the remote tier.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteValue {
    pub data: Vec<u8>,
    pub compressed: bool,
    /// Size of the stored payload representation.
    pub stored_bytes: u64,
    pub remaining_ttl: Duration,
}

/// How a write was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    pub compressed: bool,
    pub stored_bytes: u64,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    /// Stored bytes over original bytes for payloads actually written.
    pub avg_ratio: f64,
    pub dedup_savings_bytes: u64,
    pub dedup_hits: u64,
    pub compressed_writes: u64,
    pub raw_writes: u64,
    pub bytes_in: u64,
    pub bytes_stored: u64,
}

#[derive(Default)]
struct Counters {
    dedup_savings_bytes: AtomicU64,
    dedup_hits: AtomicU64,
    compressed_writes: AtomicU64,
    raw_writes: AtomicU64,
    bytes_in: AtomicU64,
    bytes_stored: AtomicU64,
    payload_in: AtomicU64,
}

/// Compression and deduplication over the entry store.
pub struct RemoteCodec {
    store: Arc<EntryStore>,
    config: CompressionConfig,
    counters: Counters,
}

impl RemoteCodec {
    pub fn new(store: Arc<EntryStore>, config: CompressionConfig) -> Self {
        Self {
            store,
            config,
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    /// Compress when the value is over the threshold and compression saves
    /// enough; otherwise keep it raw.
    fn encode_payload(&self, value: &[u8]) -> Result<(bool, Vec<u8>)> {
        if self.config.enabled && value.len() > self.config.threshold_bytes {
            let packed = zlib_compress(value, self.config.level)?;
            let limit = value.len() as f64 * (1.0 - self.config.min_savings_ratio);
            if (packed.len() as f64) <= limit {
                return Ok((true, packed));
            }
        }
        Ok((false, value.to_vec()))
    }

    fn count_payload_write(&self, original: usize, stored: usize, compressed: bool) {
        self.counters
            .payload_in
            .fetch_add(original as u64, Ordering::Relaxed);
        self.counters
            .bytes_stored
            .fetch_add(stored as u64, Ordering::Relaxed);
        if compressed {
            self.counters.compressed_writes.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_compressed_write();
        } else {
            self.counters.raw_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn read_frame(&self, key: &str) -> Result<Option<Frame>> {
        match self.store.get(key).await? {
            Some(bytes) => Frame::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<StoreOutcome> {
        self.counters
            .bytes_in
            .fetch_add(value.len() as u64, Ordering::Relaxed);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms = now_ms().saturating_add(ttl_ms);

        if !self.config.dedup_enabled {
            let (compressed, data) = self.encode_payload(value)?;
            let stored_bytes = data.len() as u64;
            self.count_payload_write(value.len(), data.len(), compressed);
            let frame = Frame {
                expires_at_ms,
                body: Body::Inline { compressed, data },
            };
            self.store.set(key, &frame.encode()?, ttl).await?;
            return Ok(StoreOutcome {
                compressed,
                stored_bytes,
                deduplicated: false,
            });
        }

        let fp = fingerprint(value);
        let previous = match self.read_frame(key).await {
            Ok(Some(Frame {
                body: Body::Ref(r), ..
            })) => Some(r.fingerprint),
            Ok(_) => None,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                tracing::debug!(key, error = %e, "overwriting undecodable frame");
                None
            }
        };

        let blob = blob_key(&fp);
        let rc = refcount_key(&fp);
        // The count is taken with one atomic increment so concurrent writers
        // of the same payload each add exactly one reference.
        let new_reference = previous.as_deref() != Some(fp.as_str());
        let references = if new_reference {
            self.store.incr(&rc, 1).await?
        } else {
            match self.store.incr(&rc, 0).await? {
                // Counter expired under a live reference
                lost if lost < 1 => self.store.incr(&rc, 1 - lost).await?,
                count => count,
            }
        };

        let existing = if references > 1 || !new_reference {
            self.store.get(&blob).await?
        } else {
            None
        };
        let (reference, deduplicated) = match existing {
            Some(existing) => {
                let remaining = self.store.ttl(&blob).await?.unwrap_or(Duration::ZERO);
                if ttl > remaining {
                    self.store.expire(&blob, ttl).await?;
                    self.store.expire(&rc, ttl).await?;
                }
                let stored_len = existing.len().saturating_sub(1) as u64;
                if new_reference {
                    self.counters.dedup_hits.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .dedup_savings_bytes
                        .fetch_add(stored_len, Ordering::Relaxed);
                    crate::metrics::record_dedup_hit();
                }
                let reference = BlobRef {
                    fingerprint: fp.clone(),
                    original_len: value.len() as u64,
                    stored_len,
                    compressed: existing.first() == Some(&TAG_ZLIB),
                };
                (reference, new_reference)
            }
            None => {
                // First reference, or a concurrent first writer has not
                // stored the payload yet. Same fingerprint, same bytes.
                let (compressed, data) = self.encode_payload(value)?;
                let mut framed = Vec::with_capacity(data.len() + 1);
                framed.push(if compressed { TAG_ZLIB } else { TAG_RAW });
                framed.extend_from_slice(&data);
                self.store.set(&blob, &framed, ttl).await?;
                self.store.expire(&rc, ttl).await?;
                self.count_payload_write(value.len(), data.len(), compressed);
                let reference = BlobRef {
                    fingerprint: fp.clone(),
                    original_len: value.len() as u64,
                    stored_len: data.len() as u64,
                    compressed,
                };
                (reference, false)
            }
        };

        let outcome = StoreOutcome {
            compressed: reference.compressed,
            stored_bytes: reference.stored_len,
            deduplicated,
        };
        let frame = Frame {
            expires_at_ms,
            body: Body::Ref(reference),
        };
        self.store.set(key, &frame.encode()?, ttl).await?;

        if let Some(old) = previous.filter(|old| *old != fp) {
            self.release(&old).await;
        }
        Ok(outcome)
    }

    /// Drop one reference; the blob goes when none remain.
    async fn release(&self, fp: &str) {
        let rc = refcount_key(fp);
        match self.store.incr(&rc, -1).await {
            Ok(remaining) if remaining <= 0 => {
                let blob = blob_key(fp);
                let payload = self.store.get(&blob).await.ok().flatten();
                let ttl = self.store.ttl(&blob).await.ok().flatten();
                if let Err(e) = self.store.delete(&blob).await {
                    tracing::warn!(blob = %blob, error = %e, "failed to remove unreferenced blob");
                }
                // A writer may have re-referenced the payload since the decrement
                match self.store.incr(&rc, 0).await {
                    Ok(count) if count > 0 => {
                        if let (Some(payload), Some(ttl)) = (payload, ttl) {
                            let _ = self.store.set(&blob, &payload, ttl).await;
                        }
                    }
                    _ => {
                        let _ = self.store.delete(&rc).await;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(fingerprint = fp, error = %e, "failed to release blob reference"),
        }
    }

    /// Read and transparently decode a value. A dangling reference is a miss.
    pub async fn fetch(&self, key: &str) -> Result<Option<RemoteValue>> {
        let Some(frame) = self.read_frame(key).await? else {
            return Ok(None);
        };
        let remaining_ms = frame.expires_at_ms - now_ms();
        if remaining_ms <= 0 {
            return Ok(None);
        }
        let remaining_ttl = Duration::from_millis(remaining_ms as u64);

        match frame.body {
            Body::Inline { compressed, data } => {
                let stored_bytes = data.len() as u64;
                let data = if compressed {
                    zlib_decompress(&data)?
                } else {
                    data
                };
                Ok(Some(RemoteValue {
                    data,
                    compressed,
                    stored_bytes,
                    remaining_ttl,
                }))
            }
            Body::Ref(reference) => {
                let Some(blob) = self.store.get(&blob_key(&reference.fingerprint)).await? else {
                    tracing::debug!(key, fingerprint = %reference.fingerprint, "dangling blob reference");
                    return Ok(None);
                };
                let Some((&tag, body)) = blob.split_first() else {
                    return Ok(None);
                };
                let data = match tag {
                    TAG_ZLIB => zlib_decompress(body)?,
                    TAG_RAW => body.to_vec(),
                    other => {
                        return Err(CacheError::serialization(format!(
                            "unknown blob tag {other}"
                        )));
                    }
                };
                Ok(Some(RemoteValue {
                    data,
                    compressed: tag == TAG_ZLIB,
                    stored_bytes: body.len() as u64,
                    remaining_ttl,
                }))
            }
        }
    }

    /// Remove a key and release its blob reference.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let previous = match self.read_frame(key).await {
            Ok(Some(Frame {
                body: Body::Ref(r), ..
            })) => Some(r.fingerprint),
            Ok(_) => None,
            Err(e) if e.is_transient() => return Err(e),
            Err(_) => None,
        };
        let existed = self.store.delete(key).await?;
        if let Some(fp) = previous {
            if existed {
                self.release(&fp).await;
            }
        }
        Ok(existed)
    }

    pub async fn scan_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        self.store.scan_prefix(prefix, limit).await
    }

    pub fn stats(&self) -> CompressionStats {
        let payload_in = self.counters.payload_in.load(Ordering::Relaxed);
        let bytes_stored = self.counters.bytes_stored.load(Ordering::Relaxed);
        CompressionStats {
            avg_ratio: if payload_in == 0 {
                1.0
            } else {
                bytes_stored as f64 / payload_in as f64
            },
            dedup_savings_bytes: self.counters.dedup_savings_bytes.load(Ordering::Relaxed),
            dedup_hits: self.counters.dedup_hits.load(Ordering::Relaxed),
            compressed_writes: self.counters.compressed_writes.load(Ordering::Relaxed),
            raw_writes: self.counters.raw_writes.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_stored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::{KvBackend, MemoryBackend};
    use crate::cache::topology::TopologyManager;
    use lexicache_core::{CacheNode, NodeId, NodeKind};

    fn codec(config: CompressionConfig) -> (RemoteCodec, Arc<MemoryBackend>) {
        let node = CacheNode::new("a", "eu", NodeKind::Primary, "memory://a");
        let topology = Arc::new(TopologyManager::new(vec![node], 1, 1.25));
        let backend = Arc::new(MemoryBackend::new("a"));
        let store = EntryStore::new(
            topology,
            vec![(NodeId::new("a"), Arc::clone(&backend) as Arc<dyn KvBackend>)],
            Duration::from_secs(1),
            3,
        );
        (RemoteCodec::new(Arc::new(store), config), backend)
    }

    fn translation_text(repeat: usize) -> Vec<u8> {
        "Le renard brun rapide saute par-dessus le chien paresseux. "
            .repeat(repeat)
            .into_bytes()
    }

    #[tokio::test]
    async fn test_identical_values_share_one_blob() {
        let (codec, backend) = codec(CompressionConfig::default());
        let value = translation_text(50);
        let ttl = Duration::from_secs(60);

        codec.put("translation:en:fr:a", &value, ttl).await.unwrap();
        let second = codec.put("translation:en:fr:b", &value, ttl).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(backend.keys_with_prefix("blob:").len(), 1);

        assert!(codec.remove("translation:en:fr:a").await.unwrap());
        let still = codec.fetch("translation:en:fr:b").await.unwrap().unwrap();
        assert_eq!(still.data, value);
        assert_eq!(backend.keys_with_prefix("blob:").len(), 1);

        assert!(codec.remove("translation:en:fr:b").await.unwrap());
        assert!(backend.keys_with_prefix("blob:").is_empty());
        assert!(backend.keys_with_prefix("blobrc:").is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers_share_counted_blob() {
        let (codec, backend) = codec(CompressionConfig::default());
        backend.set_latency(Duration::from_millis(2));
        let value = translation_text(40);
        let ttl = Duration::from_secs(60);

        let (first, second) = tokio::join!(
            codec.put("translation:en:it:a", &value, ttl),
            codec.put("translation:en:it:b", &value, ttl),
        );
        first.unwrap();
        second.unwrap();

        let counters = backend.keys_with_prefix("blobrc:");
        assert_eq!(counters.len(), 1);
        assert_eq!(backend.get(&counters[0]).await.unwrap(), Some(b"2".to_vec()));

        assert!(codec.remove("translation:en:it:a").await.unwrap());
        let still = codec.fetch("translation:en:it:b").await.unwrap().unwrap();
        assert_eq!(still.data, value);

        assert!(codec.remove("translation:en:it:b").await.unwrap());
        assert!(backend.keys_with_prefix("blob:").is_empty());
    }

    #[tokio::test]
    async fn test_large_text_is_compressed_and_restored() {
        let (codec, _backend) = codec(CompressionConfig::default());
        let value = translation_text(100);
        let outcome = codec
            .put("document:1:ocr", &value, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(outcome.compressed);
        assert!(outcome.stored_bytes < value.len() as u64);

        let fetched = codec.fetch("document:1:ocr").await.unwrap().unwrap();
        assert!(fetched.compressed);
        assert_eq!(fetched.data, value);
        assert!(fetched.remaining_ttl <= Duration::from_secs(60));

        let stats = codec.stats();
        assert_eq!(stats.compressed_writes, 1);
        assert!(stats.avg_ratio < 0.5);
    }

    #[tokio::test]
    async fn test_small_values_stay_raw() {
        let (codec, _backend) = codec(CompressionConfig::default());
        let outcome = codec
            .put("user:1:name", b"Ada", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!outcome.compressed);
        assert_eq!(codec.stats().raw_writes, 1);
    }

    #[tokio::test]
    async fn test_incompressible_value_stays_raw() {
        let (codec, _backend) = codec(CompressionConfig::default());
        use rand::{RngCore, SeedableRng};
        let mut value = vec![0u8; 4096];
        rand::rngs::StdRng::seed_from_u64(7).fill_bytes(&mut value);
        let outcome = codec.put("bin", &value, Duration::from_secs(60)).await.unwrap();
        assert!(!outcome.compressed);
        assert_eq!(codec.fetch("bin").await.unwrap().unwrap().data, value);
    }

    #[tokio::test]
    async fn test_overwrite_releases_previous_blob() {
        let (codec, backend) = codec(CompressionConfig::default());
        let ttl = Duration::from_secs(60);
        codec.put("k", b"first", ttl).await.unwrap();
        codec.put("k", b"second", ttl).await.unwrap();
        assert_eq!(backend.keys_with_prefix("blob:").len(), 1);
        assert_eq!(codec.fetch("k").await.unwrap().unwrap().data, b"second");

        // Rewriting the same value keeps a single reference
        codec.put("k", b"second", ttl).await.unwrap();
        assert!(codec.remove("k").await.unwrap());
        assert!(backend.keys_with_prefix("blob:").is_empty());
    }

    #[tokio::test]
    async fn test_dangling_reference_is_miss() {
        let (codec, backend) = codec(CompressionConfig::default());
        codec.put("k", b"value", Duration::from_secs(60)).await.unwrap();
        let blob = backend.keys_with_prefix("blob:").remove(0);
        backend.delete(&blob).await.unwrap();
        assert!(codec.fetch("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inline_mode_without_dedup() {
        let config = CompressionConfig {
            dedup_enabled: false,
            ..CompressionConfig::default()
        };
        let (codec, backend) = codec(config);
        let value = translation_text(40);
        codec.put("a", &value, Duration::from_secs(60)).await.unwrap();
        codec.put("b", &value, Duration::from_secs(60)).await.unwrap();
        assert!(backend.keys_with_prefix("blob:").is_empty());
        assert_eq!(codec.fetch("b").await.unwrap().unwrap().data, value);
        assert!(codec.remove("a").await.unwrap());
        assert!(!codec.remove("a").await.unwrap());
    }

    #[test]
    fn test_frame_rejects_unknown_tag() {
        let mut bytes = vec![9u8];
        bytes.extend_from_slice(&0i64.to_be_bytes());
        assert!(Frame::decode(&bytes).is_err());
        assert!(Frame::decode(&[0u8; 3]).is_err());
    }
}
