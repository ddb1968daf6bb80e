//! Sharded in-memory byte cache keyed by host
//!
//! Values are opaque encoded blobs (see [`crate::entry`]). Keys hash to one
//! of a fixed number of shards, each guarded by its own lock and holding an
//! LRU map plus a byte counter. Writes that would push a shard past its
//! byte budget evict least-recently-used entries first; a background
//! sweeper drops entries past their TTL.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::entry::{CodecError, Entry};

/// Number of shards. Power of two so the hash maps to a shard with a mask.
const SHARD_COUNT: usize = 32;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry lifetime.
    pub ttl: Duration,
    /// Interval between sweeper passes.
    pub clean_frequency: Duration,
    /// Per-shard entry count hint.
    pub max_entries: usize,
    /// Writes above this size are rejected.
    pub max_entry_size: usize,
    /// Total byte budget across all shards, in megabytes.
    pub hard_max_cache_size: usize,
    /// Log every set/del/evict.
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    NotFound,
    TooLarge { size: usize, limit: usize },
    Codec(CodecError),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "entry not found"),
            CacheError::TooLarge { size, limit } => {
                write!(f, "entry of {} bytes exceeds the {} byte limit", size, limit)
            }
            CacheError::Codec(e) => write!(f, "entry codec error: {}", e),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<CodecError> for CacheError {
    fn from(e: CodecError) -> Self {
        CacheError::Codec(e)
    }
}

struct Slot {
    blob: Bytes,
    stored_at: Instant,
}

struct Shard {
    entries: LruCache<Vec<u8>, Slot>,
    bytes: usize,
}

impl Shard {
    fn remove_bytes(&mut self, n: usize) {
        self.bytes = self.bytes.saturating_sub(n);
    }
}

/// The shared cache store. All methods take `&self`; shard locks are held
/// only for the duration of a single map operation.
pub struct Cache {
    shards: Vec<Mutex<Shard>>,
    ttl: Duration,
    clean_frequency: Duration,
    max_entry_size: usize,
    shard_byte_budget: usize,
    verbose: bool,
}

impl Cache {
    pub fn new(config: CacheConfig) -> anyhow::Result<Cache> {
        if config.ttl.is_zero() {
            anyhow::bail!("cache TTL must be greater than 0");
        }
        if config.clean_frequency.is_zero() {
            anyhow::bail!("cache clean frequency must be greater than 0");
        }
        if config.hard_max_cache_size == 0 {
            anyhow::bail!("cache hard max size must be greater than 0");
        }

        let per_shard_entries = NonZeroUsize::new(config.max_entries.max(1))
            .expect("max(1) is non-zero");
        let shard_byte_budget = config.hard_max_cache_size * 1024 * 1024 / SHARD_COUNT;

        let shards = (0..SHARD_COUNT)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruCache::new(per_shard_entries),
                    bytes: 0,
                })
            })
            .collect();

        debug!(
            shards = SHARD_COUNT,
            shard_byte_budget,
            ttl_secs = config.ttl.as_secs(),
            clean_frequency_secs = config.clean_frequency.as_secs(),
            "Cache initialized"
        );

        Ok(Cache {
            shards,
            ttl: config.ttl,
            clean_frequency: config.clean_frequency,
            max_entry_size: config.max_entry_size,
            shard_byte_budget,
            verbose: config.verbose,
        })
    }

    fn shard(&self, key: &[u8]) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (SHARD_COUNT - 1)]
    }

    /// Upsert the blob stored under `host`, resetting its TTL.
    pub fn set(&self, host: &[u8], blob: &[u8]) -> Result<(), CacheError> {
        if self.max_entry_size > 0 && blob.len() > self.max_entry_size {
            return Err(CacheError::TooLarge {
                size: blob.len(),
                limit: self.max_entry_size,
            });
        }

        let slot = Slot {
            blob: Bytes::copy_from_slice(blob),
            stored_at: Instant::now(),
        };

        let mut shard = self.shard(host).lock();
        shard.bytes += slot.blob.len();
        if let Some((_, old)) = shard.entries.push(host.to_vec(), slot) {
            // Either the replaced value for this key or a count-evicted
            // entry; both give their bytes back.
            shard.remove_bytes(old.blob.len());
        }
        while shard.bytes > self.shard_byte_budget {
            match shard.entries.pop_lru() {
                Some((key, old)) => {
                    shard.remove_bytes(old.blob.len());
                    if self.verbose {
                        debug!(
                            cache_key = %String::from_utf8_lossy(&key),
                            "Evicted entry over shard byte budget"
                        );
                    }
                }
                None => break,
            }
        }

        if self.verbose {
            debug!(
                cache_key = %String::from_utf8_lossy(host),
                size = blob.len(),
                "Cache set"
            );
        }
        Ok(())
    }

    /// Encode `entry` and store it under `host`.
    pub fn set_bytes(&self, host: &[u8], entry: &Entry) -> Result<(), CacheError> {
        let mut buf = Vec::new();
        entry.encode(&mut buf);
        self.set(host, &buf)
    }

    /// Blob stored under `host`. Expired entries are dropped on access.
    pub fn get(&self, host: &[u8]) -> Result<Bytes, CacheError> {
        let mut shard = self.shard(host).lock();
        let expired = match shard.entries.get(host) {
            Some(slot) if slot.stored_at.elapsed() <= self.ttl => {
                return Ok(slot.blob.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            if let Some(slot) = shard.entries.pop(host) {
                shard.remove_bytes(slot.blob.len());
            }
        }
        Err(CacheError::NotFound)
    }

    /// Decode the blob stored under `host` into `entry`. A missing key
    /// yields an empty entry, not an error.
    pub fn get_bytes(&self, host: &[u8], entry: &mut Entry) -> Result<(), CacheError> {
        match self.get(host) {
            Ok(blob) => entry.decode(&blob).map_err(CacheError::from),
            Err(CacheError::NotFound) => {
                entry.reset();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove `host` if present. Returns whether a value was removed.
    pub fn del(&self, host: &[u8]) -> bool {
        let mut shard = self.shard(host).lock();
        match shard.entries.pop(host) {
            Some(slot) => {
                shard.remove_bytes(slot.blob.len());
                if self.verbose {
                    debug!(
                        cache_key = %String::from_utf8_lossy(host),
                        "Cache del"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Visit every stored (host, blob) pair. The visitor runs outside the
    /// shard locks against a per-shard snapshot; returning `false` stops
    /// the iteration. Mutating the cache from the visitor is allowed.
    pub fn iter<F>(&self, mut visit: F)
    where
        F: FnMut(&[u8], &Bytes) -> bool,
    {
        for shard in &self.shards {
            let snapshot: Vec<(Vec<u8>, Bytes)> = {
                let shard = shard.lock();
                shard
                    .entries
                    .iter()
                    .map(|(k, slot)| (k.clone(), slot.blob.clone()))
                    .collect()
            };
            for (host, blob) in &snapshot {
                if !visit(host, blob) {
                    return;
                }
            }
        }
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let mut purged = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let expired: Vec<Vec<u8>> = shard
                .entries
                .iter()
                .filter(|(_, slot)| slot.stored_at.elapsed() > self.ttl)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(slot) = shard.entries.pop(&key) {
                    shard.remove_bytes(slot.blob.len());
                    purged += 1;
                }
            }
        }
        purged
    }

    /// Total number of stored entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes under management.
    pub fn bytes(&self) -> usize {
        self.shards.iter().map(|s| s.lock().bytes).sum()
    }

    /// Drop all state.
    pub fn reset(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.entries.clear();
            shard.bytes = 0;
        }
    }
}

/// Background sweeper. Runs until the shutdown signal flips.
pub async fn clean_loop(cache: Arc<Cache>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = cache.clean_frequency;
    info!(interval_secs = interval.as_secs(), "Cache sweeper started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "Cache sweeper removed expired entries");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Cache sweeper shutting down");
                    break;
                }
            }
        }
    }
}
