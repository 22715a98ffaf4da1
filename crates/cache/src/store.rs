use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};
use vigil_interfaces::{MetricsEvent, MetricsSender, Verdict};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: ChronoDuration,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: ChronoDuration::hours(24),
            capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    verdict: Verdict,
    generation: u64,
    inserted_at: DateTime<Utc>,
    seq: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    // Approximate insertion order for eviction. Entries re-inserted under a
    // newer seq leave stale order slots behind; eviction skips those.
    order: VecDeque<(String, u64)>,
    next_seq: u64,
}

/// Content-hash-keyed store of prior verdicts with generation-based
/// invalidation. A generation bump makes older entries unreachable through
/// `lookup` without sweeping the map.
pub struct ResultCache {
    inner: RwLock<CacheInner>,
    config: CacheConfig,
    generation: AtomicU64,
    metrics: MetricsSender,
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    generation: u64,
    entries: Vec<(String, CacheEntry)>,
}

impl ResultCache {
    pub fn new(config: CacheConfig, metrics: MetricsSender) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
            config,
            generation: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns the cached verdict for `hash`, or `None` when absent,
    /// expired, or recorded under a stale engine generation.
    pub fn lookup(&self, hash: &str) -> Option<Verdict> {
        let current = self.generation();
        let now = Utc::now();
        let inner = self.inner.read();

        let found = inner.entries.get(hash).and_then(|entry| {
            if entry.generation != current {
                return None;
            }
            if now - entry.inserted_at > self.config.ttl {
                return None;
            }
            Some(entry.verdict.clone())
        });

        self.metrics.emit(MetricsEvent::CacheLookup {
            hit: found.is_some(),
        });
        found
    }

    /// Inserts or overwrites a verdict. When the entry count exceeds the
    /// configured ceiling the oldest entry is evicted first.
    pub fn insert(&self, hash: &str, verdict: Verdict, generation: u64) {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        inner.entries.insert(
            hash.to_string(),
            CacheEntry {
                verdict,
                generation,
                inserted_at: Utc::now(),
                seq,
            },
        );
        inner.order.push_back((hash.to_string(), seq));

        while inner.entries.len() > self.config.capacity {
            let Some((key, order_seq)) = inner.order.pop_front() else {
                break;
            };
            // A stale slot: the key was overwritten after this slot was
            // recorded, so the live entry is younger than it looks here.
            let live = inner.entries.get(&key).map(|e| e.seq) == Some(order_seq);
            if live {
                inner.entries.remove(&key);
                debug!(evicted = %key, "cache at capacity, evicted oldest entry");
            }
        }
    }

    /// Moves the cache to a new generation. Existing entries are not
    /// deleted; they become unreachable through the generation check in
    /// `lookup`.
    pub fn invalidate_generation(&self, new_generation: u64) {
        self.generation.store(new_generation, Ordering::Release);
        debug!(generation = new_generation, "cache generation advanced");
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the cache to disk. Written atomically (temp file + rename)
    /// so a crash never leaves a half-written snapshot.
    pub async fn save(&self, path: &Path) -> Result<(), CacheError> {
        let persisted = {
            let inner = self.inner.read();
            PersistedCache {
                generation: self.generation(),
                entries: inner
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        let content = serde_json::to_string(&persisted)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Reload a snapshot. Any failure degrades to an empty cache rather
    /// than propagating: persistence is a restart optimization, not a
    /// correctness dependency.
    pub async fn load(&self, path: &Path) {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("failed to read cache snapshot {}: {}", path.display(), e);
                return;
            }
        };

        let persisted: PersistedCache = match serde_json::from_str(&content) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    "cache snapshot {} is corrupt, starting empty: {}",
                    path.display(),
                    e
                );
                return;
            }
        };

        self.generation
            .store(persisted.generation, Ordering::Release);
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.order.clear();
        let mut entries: Vec<(String, CacheEntry)> = persisted.entries;
        entries.sort_by_key(|(_, e)| e.seq);
        for (key, mut entry) in entries {
            entry.seq = inner.next_seq;
            inner.next_seq += 1;
            inner.order.push_back((key.clone(), entry.seq));
            inner.entries.insert(key, entry);
        }
        debug!(entries = inner.entries.len(), "cache snapshot restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_cache(capacity: usize) -> ResultCache {
        let (metrics, _rx) = MetricsSender::new();
        ResultCache::new(
            CacheConfig {
                ttl: ChronoDuration::hours(24),
                capacity,
            },
            metrics,
        )
    }

    #[test]
    fn test_lookup_roundtrip() {
        let cache = test_cache(16);
        cache.insert("abc", Verdict::Clean, 0);
        assert_eq!(cache.lookup("abc"), Some(Verdict::Clean));
        assert_eq!(cache.lookup("missing"), None);
    }

    #[test]
    fn test_generation_mismatch_hides_entry() {
        let cache = test_cache(16);
        cache.insert("abc", Verdict::Clean, 0);
        cache.invalidate_generation(1);
        assert_eq!(cache.lookup("abc"), None);
        // Entry is still resident; only unreachable.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_hidden_by_ttl() {
        let (metrics, _rx) = MetricsSender::new();
        let cache = ResultCache::new(
            CacheConfig {
                ttl: ChronoDuration::seconds(0),
                capacity: 16,
            },
            metrics,
        );
        cache.insert("abc", Verdict::Clean, 0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(cache.lookup("abc"), None);
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let cache = test_cache(2);
        cache.insert("a", Verdict::Clean, 0);
        cache.insert("b", Verdict::Clean, 0);
        cache.insert("c", Verdict::Clean, 0);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup("a"), None);
        assert!(cache.lookup("b").is_some());
        assert!(cache.lookup("c").is_some());
    }

    #[test]
    fn test_reinsert_refreshes_eviction_order() {
        let cache = test_cache(2);
        cache.insert("a", Verdict::Clean, 0);
        cache.insert("b", Verdict::Clean, 0);
        // Refresh "a" so "b" is now the oldest.
        cache.insert("a", Verdict::Clean, 0);
        cache.insert("c", Verdict::Clean, 0);
        assert!(cache.lookup("a").is_some());
        assert_eq!(cache.lookup("b"), None);
    }

    #[test]
    fn test_concurrent_insert_lookup() {
        let cache = Arc::new(test_cache(1024));
        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("{}-{}", t, i);
                    cache.insert(&key, Verdict::Clean, 0);
                    assert!(cache.lookup(&key).is_some());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 1024.min(8 * 200));
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("cache.json");

        let cache = test_cache(16);
        cache.insert("abc", Verdict::Clean, 3);
        cache.invalidate_generation(3);
        cache.save(&snapshot).await.unwrap();

        let restored = test_cache(16);
        restored.load(&snapshot).await;
        assert_eq!(restored.generation(), 3);
        assert_eq!(restored.lookup("abc"), Some(Verdict::Clean));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("cache.json");
        tokio::fs::write(&snapshot, b"not json").await.unwrap();

        let cache = test_cache(16);
        cache.load(&snapshot).await;
        assert!(cache.is_empty());
    }
}
