//! Tiered response store.
//!
//! Three tiers: a byte-bounded in-memory LRU, gzip-compressed body files
//! (one per key, atomic create-then-rename), and a durable SQLite index.
//! Lookups go memory first, then index + disk with promotion back into
//! memory. Eviction touches memory only; disk follows the index.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::params;
use tracing::{debug, warn};

use crate::cache::types::{CacheMetadata, CacheStats};
use crate::clock::now_ms;
use crate::db::{Database, CACHE_INDEX_SCHEMA};
use crate::router::classifier::Complexity;

struct MemEntry {
    body: Arc<Vec<u8>>,
    meta: CacheMetadata,
    last_used: u64,
}

#[derive(Default)]
struct MemoryTier {
    entries: HashMap<String, MemEntry>,
    total_bytes: u64,
    /// Logical access clock for LRU ordering.
    clock: u64,
}

impl MemoryTier {
    fn touch(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Evict least-recently-used entries until `total_bytes <= budget`.
    fn evict_to(&mut self, budget: u64) {
        while self.total_bytes > budget {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    if let Some(entry) = self.entries.remove(&key) {
                        self.total_bytes -= entry.body.len() as u64;
                        debug!(key = %key, "Evicted from memory cache");
                    }
                }
                None => break,
            }
        }
    }
}

pub struct ResponseCache {
    memory: Mutex<MemoryTier>,
    stats: Mutex<CacheStats>,
    index: Option<Database>,
    responses_dir: Option<PathBuf>,
    max_memory_bytes: u64,
}

impl ResponseCache {
    /// Open the disk-backed cache under `dir` (`index.db` +
    /// `responses/<hash>.gz`). Falls back to memory-only mode with a single
    /// warning when the index cannot be opened; a store failure never fails
    /// a request.
    pub fn open(dir: &Path, max_memory_bytes: u64) -> Self {
        let responses_dir = dir.join("responses");
        let index = match std::fs::create_dir_all(&responses_dir)
            .map_err(anyhow::Error::from)
            .and_then(|()| Database::open(&dir.join("index.db"), CACHE_INDEX_SCHEMA))
        {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(error = %e, "Cache index unavailable, running memory-only");
                None
            }
        };

        let cache = Self {
            responses_dir: index.is_some().then_some(responses_dir),
            index,
            memory: Mutex::new(MemoryTier::default()),
            stats: Mutex::new(CacheStats::default()),
            max_memory_bytes,
        };
        let swept = cache.sweep();
        if swept > 0 {
            debug!(swept, "Expired cache entries removed at startup");
        }
        cache
    }

    /// Memory-only cache (tests, degraded mode).
    pub fn in_memory(max_memory_bytes: u64) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::default()),
            stats: Mutex::new(CacheStats::default()),
            index: None,
            responses_dir: None,
            max_memory_bytes,
        }
    }

    pub fn has_disk(&self) -> bool {
        self.index.is_some()
    }

    // -- lookup --------------------------------------------------------------

    /// Look up a key: memory, then index + disk (promoting into memory).
    /// Expired entries are deleted lazily here.
    pub fn lookup(&self, key: &str) -> Option<(Arc<Vec<u8>>, CacheMetadata)> {
        let now = now_ms();

        // Tier 1: memory.
        {
            let mut mem = self.memory.lock().expect("cache mutex poisoned");
            let expired = match mem.entries.get(key) {
                Some(entry) => entry.meta.expires_at_ms <= now,
                None => false,
            };
            if expired {
                if let Some(entry) = mem.entries.remove(key) {
                    mem.total_bytes -= entry.body.len() as u64;
                }
                self.delete_durable(key);
            } else if mem.entries.contains_key(key) {
                let tick = mem.touch();
                let entry = mem.entries.get_mut(key).expect("checked above");
                entry.last_used = tick;
                entry.meta.hit_count += 1;
                let result = (Arc::clone(&entry.body), entry.meta.clone());
                drop(mem);
                self.record_hit(&result.1);
                return Some(result);
            }
        }

        // Tier 2: index + disk.
        let Some(mut meta) = self.index_row(key) else {
            self.record_miss();
            return None;
        };
        if meta.expires_at_ms <= now {
            self.delete_durable(key);
            self.record_miss();
            return None;
        }
        let body = match self.read_body(key) {
            Some(body) => Arc::new(body),
            None => {
                // Index row without a body file: repair the invariant.
                self.delete_durable(key);
                self.record_miss();
                return None;
            }
        };

        meta.hit_count += 1;
        if let Some(ref db) = self.index {
            let _ = db.with_conn(|conn| {
                conn.execute(
                    "UPDATE cache_index SET hit_count = hit_count + 1 WHERE key = ?1",
                    params![key],
                )?;
                Ok(())
            });
        }

        self.promote(key, Arc::clone(&body), meta.clone());
        self.record_hit(&meta);
        Some((body, meta))
    }

    // -- insert --------------------------------------------------------------

    /// Insert into all tiers. The memory byte budget holds when this
    /// returns.
    pub fn insert(&self, key: &str, body: Vec<u8>, mut meta: CacheMetadata) {
        meta.size_bytes = body.len() as u64;

        // Disk + index first so the durable invariant (file iff index row)
        // is never observed half-set in the common path.
        if let Err(e) = self.write_durable(key, &body, &meta) {
            warn!(error = %e, "Cache disk write failed, entry kept in memory only");
        }

        self.promote(key, Arc::new(body), meta);
    }

    fn promote(&self, key: &str, body: Arc<Vec<u8>>, meta: CacheMetadata) {
        let size = body.len() as u64;
        if size > self.max_memory_bytes {
            return;
        }
        let mut mem = self.memory.lock().expect("cache mutex poisoned");
        if let Some(old) = mem.entries.remove(key) {
            mem.total_bytes -= old.body.len() as u64;
        }
        let tick = mem.touch();
        mem.total_bytes += size;
        mem.entries.insert(
            key.to_string(),
            MemEntry {
                body,
                meta,
                last_used: tick,
            },
        );
        mem.evict_to(self.max_memory_bytes);
    }

    // -- durable tier --------------------------------------------------------

    fn write_durable(&self, key: &str, body: &[u8], meta: &CacheMetadata) -> anyhow::Result<()> {
        let (Some(db), Some(dir)) = (self.index.as_ref(), self.responses_dir.as_ref()) else {
            return Ok(());
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body)?;
        let compressed = encoder.finish()?;

        // Atomic create-then-rename.
        let final_path = dir.join(format!("{key}.gz"));
        let tmp_path = dir.join(format!("{key}.gz.tmp"));
        std::fs::write(&tmp_path, &compressed)?;
        std::fs::rename(&tmp_path, &final_path)?;

        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache_index \
                 (key, model, task_type, tokens_in, tokens_out, cost_usd, \
                  created_at_ms, expires_at_ms, hit_count, size_bytes) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(key) DO UPDATE SET \
                   expires_at_ms = ?8, hit_count = 0, size_bytes = ?10",
                params![
                    key,
                    meta.model,
                    meta.task_type.as_str(),
                    meta.tokens_in as i64,
                    meta.tokens_out as i64,
                    meta.cost_usd,
                    meta.created_at_ms as i64,
                    meta.expires_at_ms as i64,
                    meta.hit_count as i64,
                    meta.size_bytes as i64,
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn index_row(&self, key: &str) -> Option<CacheMetadata> {
        let db = self.index.as_ref()?;
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model, task_type, tokens_in, tokens_out, cost_usd, \
                        created_at_ms, expires_at_ms, hit_count, size_bytes \
                 FROM cache_index WHERE key = ?1",
            )?;
            let row = stmt.query_row(params![key], |row| {
                Ok(CacheMetadata {
                    model: row.get(0)?,
                    task_type: Complexity::parse(&row.get::<_, String>(1)?),
                    tokens_in: row.get::<_, i64>(2)? as u64,
                    tokens_out: row.get::<_, i64>(3)? as u64,
                    cost_usd: row.get(4)?,
                    created_at_ms: row.get::<_, i64>(5)? as u64,
                    expires_at_ms: row.get::<_, i64>(6)? as u64,
                    hit_count: row.get::<_, i64>(7)? as u64,
                    size_bytes: row.get::<_, i64>(8)? as u64,
                })
            });
            match row {
                Ok(meta) => Ok(Some(meta)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .ok()
        .flatten()
    }

    fn read_body(&self, key: &str) -> Option<Vec<u8>> {
        let dir = self.responses_dir.as_ref()?;
        let compressed = std::fs::read(dir.join(format!("{key}.gz"))).ok()?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut body = Vec::new();
        decoder.read_to_end(&mut body).ok()?;
        Some(body)
    }

    fn delete_durable(&self, key: &str) {
        if let Some(ref db) = self.index {
            let _ = db.with_conn(|conn| {
                conn.execute("DELETE FROM cache_index WHERE key = ?1", params![key])?;
                Ok(())
            });
        }
        if let Some(ref dir) = self.responses_dir {
            let _ = std::fs::remove_file(dir.join(format!("{key}.gz")));
        }
    }

    // -- maintenance ---------------------------------------------------------

    /// Delete every expired entry from all tiers. Returns the number of
    /// durable entries removed.
    pub fn sweep(&self) -> usize {
        let now = now_ms();

        {
            let mut mem = self.memory.lock().expect("cache mutex poisoned");
            let expired: Vec<String> = mem
                .entries
                .iter()
                .filter(|(_, e)| e.meta.expires_at_ms <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(entry) = mem.entries.remove(&key) {
                    mem.total_bytes -= entry.body.len() as u64;
                }
            }
        }

        let Some(ref db) = self.index else {
            return 0;
        };
        let expired_keys: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT key FROM cache_index WHERE expires_at_ms <= ?1")?;
                let keys = stmt
                    .query_map(params![now as i64], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(keys)
            })
            .unwrap_or_default();

        for key in &expired_keys {
            self.delete_durable(key);
        }

        // Enforce the file-iff-index-row invariant: orphaned body files are
        // removed too.
        if let Some(ref dir) = self.responses_dir {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let Some(key) = name.strip_suffix(".gz") else {
                        continue;
                    };
                    if self.index_row(key).is_none() {
                        let _ = std::fs::remove_file(entry.path());
                    }
                }
            }
        }

        expired_keys.len()
    }

    /// Drop everything from all tiers.
    pub fn clear(&self) {
        {
            let mut mem = self.memory.lock().expect("cache mutex poisoned");
            mem.entries.clear();
            mem.total_bytes = 0;
        }
        if let Some(ref db) = self.index {
            let _ = db.with_conn(|conn| {
                conn.execute("DELETE FROM cache_index", [])?;
                Ok(())
            });
        }
        if let Some(ref dir) = self.responses_dir {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }

    // -- stats ---------------------------------------------------------------

    fn record_hit(&self, meta: &CacheMetadata) {
        let mut stats = self.stats.lock().expect("stats mutex poisoned");
        stats.hits += 1;
        stats.saved_cost_usd += meta.cost_usd;
        *stats.per_model_hits.entry(meta.model.clone()).or_insert(0) += 1;
        *stats
            .per_task_hits
            .entry(meta.task_type.as_str().to_string())
            .or_insert(0) += 1;
    }

    fn record_miss(&self) {
        self.stats.lock().expect("stats mutex poisoned").misses += 1;
    }

    pub fn record_bypass(&self) {
        self.stats.lock().expect("stats mutex poisoned").bypasses += 1;
    }

    /// Current memory-tier size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.memory.lock().expect("cache mutex poisoned").total_bytes
    }

    /// Snapshot of cache statistics. Per-model and per-task entry counts come
    /// from the durable index when it is available, else from the memory
    /// tier.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().expect("stats mutex poisoned").clone();

        if let Some(ref db) = self.index {
            let rows: Vec<(String, String)> = db
                .with_conn(|conn| {
                    let mut stmt = conn.prepare("SELECT model, task_type FROM cache_index")?;
                    let rows = stmt
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                })
                .unwrap_or_default();
            stats.entries = rows.len() as u64;
            for (model, task) in rows {
                *stats.per_model_entries.entry(model).or_insert(0) += 1;
                *stats.per_task_entries.entry(task).or_insert(0) += 1;
            }
        } else {
            let mem = self.memory.lock().expect("cache mutex poisoned");
            stats.entries = mem.entries.len() as u64;
            for entry in mem.entries.values() {
                *stats
                    .per_model_entries
                    .entry(entry.meta.model.clone())
                    .or_insert(0) += 1;
                *stats
                    .per_task_entries
                    .entry(entry.meta.task_type.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        stats.size_bytes = self.size_bytes();
        stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(model: &str, expires_in_ms: u64) -> CacheMetadata {
        let now = now_ms();
        CacheMetadata {
            model: model.to_string(),
            task_type: Complexity::Simple,
            tokens_in: 100,
            tokens_out: 20,
            cost_usd: 0.01,
            created_at_ms: now,
            expires_at_ms: now + expires_in_ms,
            hit_count: 0,
            size_bytes: 0,
        }
    }

    #[test]
    fn test_memory_roundtrip() {
        let cache = ResponseCache::in_memory(1024 * 1024);
        cache.insert("k1", b"hello".to_vec(), meta("claude-sonnet-4-6", 60_000));

        let (body, m) = cache.lookup("k1").unwrap();
        assert_eq!(body.as_slice(), b"hello");
        assert_eq!(m.model, "claude-sonnet-4-6");
        assert_eq!(m.hit_count, 1);
    }

    #[test]
    fn test_miss() {
        let cache = ResponseCache::in_memory(1024);
        assert!(cache.lookup("absent").is_none());
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let cache = ResponseCache::in_memory(1024);
        let mut m = meta("claude-sonnet-4-6", 0);
        m.expires_at_ms = now_ms().saturating_sub(1);
        cache.insert("k1", b"stale".to_vec(), m);
        assert!(cache.lookup("k1").is_none());
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_byte_budget_never_exceeded() {
        let cache = ResponseCache::in_memory(100);
        for i in 0..20 {
            cache.insert(
                &format!("k{i}"),
                vec![0u8; 30],
                meta("claude-sonnet-4-6", 60_000),
            );
            assert!(cache.size_bytes() <= 100);
        }
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let cache = ResponseCache::in_memory(100);
        cache.insert("a", vec![0u8; 40], meta("m", 60_000));
        cache.insert("b", vec![0u8; 40], meta("m", 60_000));
        // Touch "a" so "b" is the LRU entry.
        assert!(cache.lookup("a").is_some());
        cache.insert("c", vec![0u8; 40], meta("m", 60_000));

        assert!(cache.lookup("a").is_some());
        assert!(cache.lookup("b").is_none());
        assert!(cache.lookup("c").is_some());
    }

    #[test]
    fn test_oversized_body_skips_memory() {
        let cache = ResponseCache::in_memory(10);
        cache.insert("big", vec![0u8; 100], meta("m", 60_000));
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_disk_roundtrip_and_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), 1024 * 1024);
        assert!(cache.has_disk());

        cache.insert("k1", b"persisted".to_vec(), meta("claude-sonnet-4-6", 60_000));
        assert!(dir.path().join("responses").join("k1.gz").exists());

        // New cache over the same directory: memory is cold, disk serves.
        let cache2 = ResponseCache::open(dir.path(), 1024 * 1024);
        let (body, _) = cache2.lookup("k1").unwrap();
        assert_eq!(body.as_slice(), b"persisted");
        // Promoted into memory.
        assert!(cache2.size_bytes() > 0);
    }

    #[test]
    fn test_startup_sweep_removes_expired() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = ResponseCache::open(dir.path(), 1024);
            let mut m = meta("m", 0);
            m.expires_at_ms = now_ms().saturating_sub(1);
            cache.insert("stale", b"old".to_vec(), m);
        }
        let cache = ResponseCache::open(dir.path(), 1024);
        assert!(cache.lookup("stale").is_none());
        assert!(!dir.path().join("responses").join("stale.gz").exists());
    }

    #[test]
    fn test_sweep_removes_orphaned_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), 1024);
        std::fs::write(dir.path().join("responses").join("orphan.gz"), b"junk").unwrap();
        cache.sweep();
        assert!(!dir.path().join("responses").join("orphan.gz").exists());
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), 1024 * 1024);
        cache.insert("k1", b"x".to_vec(), meta("m", 60_000));
        cache.clear();
        assert!(cache.lookup("k1").is_none());
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_stats_counters() {
        let cache = ResponseCache::in_memory(1024 * 1024);
        cache.insert("k1", b"x".to_vec(), meta("claude-sonnet-4-6", 60_000));

        assert!(cache.lookup("k1").is_some());
        assert!(cache.lookup("nope").is_none());
        cache.record_bypass();

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bypasses, 1);
        assert!((stats.saved_cost_usd - 0.01).abs() < 1e-9);
        assert_eq!(stats.per_model_hits.get("claude-sonnet-4-6"), Some(&1));
        assert_eq!(stats.entries, 1);
    }
}
