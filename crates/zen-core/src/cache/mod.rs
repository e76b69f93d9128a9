//! Durable, size-bounded LRU + TTL cache over the local file system.
//!
//! # Layout
//!
//! ```text
//! <base>/
//!   metadata/index.json     authoritative index (entries + stats)
//!   data/<shard>/<name>     raw serializer output, one file per entry
//! ```
//!
//! `<shard>` is the first two hex digits of the SHA-256 of the raw key and
//! `<name>` is the sanitized key suffixed with eight more hex digits, so
//! keys that sanitize to the same string still land in distinct files.
//!
//! Every entry write is tempfile + rename, followed by an index rewrite
//! (also tempfile + rename). Files an update drops from the index are
//! removed only after the new index is on disk, so a failed write never
//! leaves the index pointing at missing files. If the index cannot be
//! parsed on open the cache starts empty and leaves the data tree untouched.

mod error;
mod serializer;

pub use error::CacheError;
pub use serializer::{JsonSerializer, Serializer, StringSerializer};

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::context::Context;
use crate::io;
use crate::paths;

type CacheResult<T> = std::result::Result<T, CacheError>;

const MAX_FILE_STEM: usize = 180;

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub base_path: PathBuf,
    /// Upper bound on the summed size of all entries. 0 disables the bound.
    pub size_limit_bytes: u64,
    /// TTL applied when `put` does not specify one. Zero means never expire.
    pub default_ttl: Duration,
}

impl CacheOptions {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            size_limit_bytes: 100 * 1024 * 1024,
            default_ttl: Duration::ZERO,
        }
    }

    pub fn size_limit_mb(mut self, mb: u64) -> Self {
        self.size_limit_bytes = mb * 1024 * 1024;
        self
    }

    pub fn size_limit_bytes(mut self, bytes: u64) -> Self {
        self.size_limit_bytes = bytes;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub ttl: Option<Duration>,
    pub checksum: Option<String>,
}

impl PutOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            checksum: None,
        }
    }
}

/// A value read from the cache together with its entry metadata.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub data: T,
    pub checksum: String,
    pub age_seconds: f64,
    pub size_bytes: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheInfo {
    pub base_path: PathBuf,
    pub total_bytes: u64,
    pub size_limit_bytes: u64,
    pub entry_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_ratio: f64,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    /// Relative to the cache base directory.
    path: PathBuf,
    size: u64,
    created_at: DateTime<Utc>,
    last_access_at: DateTime<Utc>,
    /// Fractional seconds; 0 means the entry never expires.
    ttl_seconds: f64,
    checksum: String,
    /// Insertion order, used to break last-access ties.
    #[serde(default)]
    seq: u64,
}

impl IndexEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_seconds <= 0.0 {
            return false;
        }
        let age = (now - self.created_at).num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6;
        age >= self.ttl_seconds
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexStats {
    total_size: u64,
    entry_count: u64,
    hit_count: u64,
    miss_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheIndex {
    #[serde(default)]
    entries: BTreeMap<String, IndexEntry>,
    #[serde(default)]
    stats: IndexStats,
    #[serde(default)]
    next_seq: u64,
}

impl CacheIndex {
    fn recount(&mut self) {
        self.stats.total_size = self.entries.values().map(|e| e.size).sum();
        self.stats.entry_count = self.entries.len() as u64;
    }
}

// ---------------------------------------------------------------------------
// FsCache
// ---------------------------------------------------------------------------

/// Typed key → value store. See the module docs for the on-disk layout.
///
/// All methods take `&self` and are safe to call from many threads.
/// Mutations are serialized by `writer` and do their file I/O outside the
/// index lock; the index write side is held only to apply a change.
pub struct FsCache<T, S = JsonSerializer> {
    base: PathBuf,
    data_dir: PathBuf,
    index_path: PathBuf,
    size_limit: u64,
    default_ttl: Duration,
    serializer: S,
    index: RwLock<CacheIndex>,
    writer: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FsCache<T, JsonSerializer>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    pub fn json(opts: CacheOptions) -> CacheResult<Self> {
        Self::open(opts, JsonSerializer)
    }
}

impl FsCache<String, StringSerializer> {
    pub fn raw(opts: CacheOptions) -> CacheResult<Self> {
        Self::open(opts, StringSerializer)
    }
}

impl<T, S> FsCache<T, S>
where
    S: Serializer<T>,
{
    /// Open (or create) a cache rooted at `opts.base_path`.
    pub fn open(opts: CacheOptions, serializer: S) -> CacheResult<Self> {
        let base = paths::expand_tilde(&opts.base_path);
        let data_dir = paths::cache_data_dir(&base);
        let index_path = paths::cache_index_path(&base);
        std::fs::create_dir_all(&data_dir).map_err(|e| CacheError::permission(&data_dir, e))?;
        if let Some(meta) = index_path.parent() {
            std::fs::create_dir_all(meta).map_err(|e| CacheError::permission(meta, e))?;
        }

        let index = load_index(&index_path);
        debug!(
            base = %base.display(),
            entries = index.entries.len(),
            "opened cache"
        );

        Ok(Self {
            hits: AtomicU64::new(index.stats.hit_count),
            misses: AtomicU64::new(index.stats.miss_count),
            base,
            data_dir,
            index_path,
            size_limit: opts.size_limit_bytes,
            default_ttl: opts.default_ttl,
            serializer,
            index: RwLock::new(index),
            writer: Mutex::new(()),
            _marker: PhantomData,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn content_type(&self) -> &'static str {
        self.serializer.content_type()
    }

    /// Read `key`. Absent or expired keys are `NotFound`; an index entry
    /// whose file is missing or has the wrong size is `Corrupted`. The file
    /// is read outside the index lock; an entry replaced or evicted
    /// meanwhile is looked up again.
    pub fn get(&self, key: &str) -> CacheResult<Cached<T>> {
        let now = Utc::now();
        let entry = match self.read_index().entries.get(key) {
            Some(e) if !e.is_expired(now) => e.clone(),
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Err(CacheError::NotFound(key.to_string()));
            }
        };
        let abs = self.base.join(&entry.path);
        let bytes = match std::fs::read(&abs) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !self.still_indexed(key, entry.seq) {
                    return self.get(key);
                }
                return Err(CacheError::Corrupted {
                    key: key.to_string(),
                    reason: format!("missing file {}", abs.display()),
                });
            }
            Err(e) => return Err(CacheError::permission(abs, e)),
        };

        if bytes.len() as u64 != entry.size {
            if !self.still_indexed(key, entry.seq) {
                return self.get(key);
            }
            return Err(CacheError::Corrupted {
                key: key.to_string(),
                reason: format!("size {} does not match index size {}", bytes.len(), entry.size),
            });
        }
        let data = self.serializer.deserialize(&bytes)?;

        self.hits.fetch_add(1, Ordering::Relaxed);
        {
            let mut idx = self.write_index();
            if let Some(e) = idx.entries.get_mut(key) {
                if e.seq == entry.seq {
                    e.last_access_at = Utc::now();
                }
            }
        }

        let age = (now - entry.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        Ok(Cached {
            data,
            checksum: entry.checksum,
            age_seconds: age,
            size_bytes: entry.size,
            cached: true,
        })
    }

    /// Store `value` under `key`, evicting least-recently-used entries when
    /// the size bound would be exceeded.
    pub fn put(&self, key: &str, value: &T, opts: PutOptions) -> CacheResult<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".into()));
        }
        let bytes = self.serializer.serialize(value)?;
        let size = bytes.len() as u64;
        if self.size_limit > 0 && size > self.size_limit {
            return Err(CacheError::TooLarge {
                size,
                limit: self.size_limit,
            });
        }
        let checksum = opts.checksum.unwrap_or_else(|| checksum_of(&bytes));
        let ttl = opts.ttl.unwrap_or(self.default_ttl);
        let rel = entry_path(key);
        let abs = self.base.join(&rel);

        let _writer = self.lock_writer();
        let victims = {
            let idx = self.read_index();
            let existing = idx.entries.get(key).map(|e| e.size).unwrap_or(0);
            let projected = idx.stats.total_size.saturating_sub(existing) + size;
            if self.size_limit > 0 && projected > self.size_limit {
                lru_victims(&idx, projected - self.size_limit, key)
            } else {
                Vec::new()
            }
        };

        io::atomic_write(&abs, &bytes).map_err(|e| CacheError::permission(&abs, e))?;

        let now = Utc::now();
        let evicted = self.commit(|idx| {
            let evicted: Vec<(String, IndexEntry)> = victims
                .iter()
                .filter_map(|k| idx.entries.remove(k).map(|e| (k.clone(), e)))
                .collect();
            let seq = idx.next_seq;
            idx.next_seq += 1;
            idx.entries.insert(
                key.to_string(),
                IndexEntry {
                    path: rel,
                    size,
                    created_at: now,
                    last_access_at: now,
                    ttl_seconds: ttl.as_secs_f64(),
                    checksum,
                    seq,
                },
            );
            evicted
        })?;
        for (victim, entry) in evicted {
            debug!(key = %victim, size = entry.size, "evicted cache entry");
            self.discard_file(&victim, &entry);
        }
        Ok(())
    }

    /// Remove `key`. Deleting an absent key succeeds.
    pub fn delete(&self, key: &str) -> CacheResult<()> {
        let _writer = self.lock_writer();
        let removed = self.commit(|idx| idx.entries.remove(key))?;
        let rel = removed.map(|e| e.path).unwrap_or_else(|| entry_path(key));
        self.remove_file(&self.base.join(rel))
    }

    /// Drop every entry and the whole data tree.
    pub fn clear(&self) -> CacheResult<()> {
        let _writer = self.lock_writer();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.commit(|idx| *idx = CacheIndex::default())?;
        match std::fs::remove_dir_all(&self.data_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::permission(&self.data_dir, e)),
        }
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| CacheError::permission(&self.data_dir, e))
    }

    pub fn info(&self) -> CacheInfo {
        let idx = self.read_index();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheInfo {
            base_path: self.base.clone(),
            total_bytes: idx.stats.total_size,
            size_limit_bytes: self.size_limit,
            entry_count: idx.entries.len() as u64,
            hit_count: hits,
            miss_count: misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Evict every expired entry. Returns how many were removed.
    pub fn cleanup(&self) -> CacheResult<usize> {
        let _writer = self.lock_writer();
        let now = Utc::now();
        let expired: Vec<String> = self
            .read_index()
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        let removed = self.commit(|idx| {
            expired
                .iter()
                .filter_map(|k| idx.entries.remove(k).map(|e| (k.clone(), e)))
                .collect::<Vec<_>>()
        })?;
        for (key, entry) in &removed {
            self.discard_file(key, entry);
        }
        debug!(evicted = removed.len(), "cache cleanup");
        Ok(removed.len())
    }

    /// Live (non-expired) keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let now = Utc::now();
        self.read_index()
            .entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Utc::now();
        self.read_index()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Flush the index to disk.
    pub fn close(&self) -> CacheResult<()> {
        let _writer = self.lock_writer();
        self.commit(|_| ())
    }

    // -- internals ---------------------------------------------------------

    fn read_index(&self) -> RwLockReadGuard<'_, CacheIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, CacheIndex> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    /// The entry read as `seq` has not been replaced or dropped since.
    fn still_indexed(&self, key: &str, seq: u64) -> bool {
        self.read_index()
            .entries
            .get(key)
            .is_some_and(|e| e.seq == seq)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `change` under the index write lock, then write a snapshot of
    /// the result to disk. Callers hold the writer lock.
    fn commit<R>(&self, change: impl FnOnce(&mut CacheIndex) -> R) -> CacheResult<R> {
        let (out, snapshot) = {
            let mut idx = self.write_index();
            let out = change(&mut idx);
            idx.recount();
            idx.stats.hit_count = self.hits.load(Ordering::Relaxed);
            idx.stats.miss_count = self.misses.load(Ordering::Relaxed);
            (out, idx.clone())
        };
        self.persist(&snapshot)?;
        Ok(out)
    }

    /// Remove the file of an entry the index no longer references.
    fn discard_file(&self, key: &str, entry: &IndexEntry) {
        if let Err(e) = self.remove_file(&self.base.join(&entry.path)) {
            warn!(key = %key, error = %e, "failed to remove dropped cache file");
        }
    }

    fn remove_file(&self, abs: &Path) -> CacheResult<()> {
        match std::fs::remove_file(abs) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::permission(abs, e)),
        }
        if let Some(parent) = abs.parent() {
            io::prune_empty_dirs(parent, &self.data_dir);
        }
        Ok(())
    }

    fn persist(&self, idx: &CacheIndex) -> CacheResult<()> {
        let json = serde_json::to_vec_pretty(idx)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        io::atomic_write(&self.index_path, &json)
            .map_err(|e| CacheError::permission(&self.index_path, e))
    }
}

impl<T, S> FsCache<T, S>
where
    T: 'static,
    S: Serializer<T> + 'static,
{
    /// Run [`FsCache::cleanup`] every `interval` until `ctx` is done.
    pub fn spawn_cleanup(
        cache: Arc<Self>,
        interval: Duration,
        ctx: Context,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.done() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cache.cleanup() {
                            warn!(error = %e, "periodic cache cleanup failed");
                        }
                    }
                }
            }
        })
    }
}

fn load_index(path: &Path) -> CacheIndex {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheIndex::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cache index unreadable, starting empty");
            return CacheIndex::default();
        }
    };
    match serde_json::from_slice::<CacheIndex>(&bytes) {
        Ok(mut idx) => {
            idx.recount();
            idx
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cache index corrupted, starting empty");
            CacheIndex::default()
        }
    }
}

/// Keys to drop, in LRU order (last access, then insertion), until at
/// least `needed` bytes are reclaimed. `keep` is never chosen.
fn lru_victims(idx: &CacheIndex, needed: u64, keep: &str) -> Vec<String> {
    let mut order: Vec<(DateTime<Utc>, u64, &String, u64)> = idx
        .entries
        .iter()
        .filter(|(k, _)| k.as_str() != keep)
        .map(|(k, e)| (e.last_access_at, e.seq, k, e.size))
        .collect();
    order.sort();

    let mut reclaimed = 0u64;
    let mut victims = Vec::new();
    for (_, _, key, size) in order {
        if reclaimed >= needed {
            break;
        }
        reclaimed += size;
        victims.push(key.clone());
    }
    victims
}

fn checksum_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn entry_path(key: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    let mut stem = paths::sanitize_key(key);
    if stem.len() > MAX_FILE_STEM {
        let mut cut = MAX_FILE_STEM;
        while !stem.is_char_boundary(cut) {
            cut -= 1;
        }
        stem.truncate(cut);
    }
    PathBuf::from(paths::CACHE_DATA_DIR)
        .join(&digest[..2])
        .join(format!("{stem}_{}", &digest[2..10]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
