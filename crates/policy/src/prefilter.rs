use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use vigil_cache::{content_hash, ResultCache};
use vigil_interfaces::{MetricsEvent, MetricsSender, SkipReason};

// Inherently low-risk formats skipped without any engine involvement.
const SAFE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "ico", "webp", "tif", "tiff", "mp3", "wav", "flac", "ogg",
    "m4a",
];

const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024; // 100MB

/// Paths with a scan currently queued or running. Shared between the
/// pre-filter (duplicate check) and the scheduler (cleared on terminal
/// completion).
#[derive(Default)]
pub struct InflightSet {
    inner: Mutex<HashSet<PathBuf>>,
}

impl InflightSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns false if the path was already tracked.
    pub fn insert(&self, path: &Path) -> bool {
        self.inner.lock().insert(path.to_path_buf())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner.lock().contains(path)
    }

    pub fn remove(&self, path: &Path) {
        self.inner.lock().remove(path);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct PreFilterConfig {
    pub max_file_size: u64,
    pub safe_extensions: Vec<String>,
}

impl Default for PreFilterConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            safe_extensions: SAFE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Outcome of pre-filtering one path. When the file survives all checks
/// the content hash computed for the cache consult is carried along so the
/// scanner does not hash twice.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanDecision {
    Scan { content_hash: Option<String> },
    Skip { reason: SkipReason },
}

impl ScanDecision {
    pub fn should_scan(&self) -> bool {
        matches!(self, ScanDecision::Scan { .. })
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            ScanDecision::Skip { reason } => Some(*reason),
            ScanDecision::Scan { .. } => None,
        }
    }
}

/// Fast, allocation-light gate in front of the scheduler. Checks run
/// cheapest-first and short-circuit on the first skip.
pub struct PreFilter {
    config: PreFilterConfig,
    cache: Arc<ResultCache>,
    inflight: Arc<InflightSet>,
    metrics: MetricsSender,
}

impl PreFilter {
    pub fn new(
        config: PreFilterConfig,
        cache: Arc<ResultCache>,
        inflight: Arc<InflightSet>,
        metrics: MetricsSender,
    ) -> Self {
        Self {
            config,
            cache,
            inflight,
            metrics,
        }
    }

    pub async fn should_scan(&self, path: &Path) -> ScanDecision {
        // 1. Gone already (watch events race deletion constantly).
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => return self.skip(path, SkipReason::Missing),
        };
        if !metadata.is_file() {
            return self.skip(path, SkipReason::Missing);
        }

        // 2. Inherently low-risk format.
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            let ext = ext.to_ascii_lowercase();
            if self.config.safe_extensions.iter().any(|s| s == &ext) {
                return self.skip(path, SkipReason::SafeExtension);
            }
        }

        // 3. Already queued or being scanned.
        if self.inflight.contains(path) {
            return self.skip(path, SkipReason::Duplicate);
        }

        // 4. Oversized.
        if metadata.len() > self.config.max_file_size {
            return self.skip(path, SkipReason::TooLarge);
        }

        // 5. Known-clean content under the current engine generation. The
        // hash is the only expensive check, which is why it runs last.
        match content_hash(path).await {
            Ok(hash) => {
                if matches!(self.cache.lookup(&hash), Some(v) if v.is_clean()) {
                    return self.skip(path, SkipReason::CachedClean);
                }
                ScanDecision::Scan {
                    content_hash: Some(hash),
                }
            }
            // Unreadable between metadata and hash: treat as gone.
            Err(_) => self.skip(path, SkipReason::Missing),
        }
    }

    fn skip(&self, path: &Path, reason: SkipReason) -> ScanDecision {
        debug!(path = %path.display(), %reason, "pre-filter skipped path");
        self.metrics.emit(MetricsEvent::ScanSkipped { reason });
        ScanDecision::Skip { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_cache::CacheConfig;
    use vigil_interfaces::Verdict;

    fn test_filter() -> (PreFilter, Arc<ResultCache>, Arc<InflightSet>) {
        let (metrics, _rx) = MetricsSender::new();
        let cache = Arc::new(ResultCache::new(CacheConfig::default(), metrics.clone()));
        let inflight = InflightSet::new();
        let filter = PreFilter::new(
            PreFilterConfig::default(),
            Arc::clone(&cache),
            Arc::clone(&inflight),
            metrics,
        );
        (filter, cache, inflight)
    }

    #[tokio::test]
    async fn test_missing_file_skipped() {
        let (filter, _, _) = test_filter();
        let dir = tempfile::tempdir().unwrap();
        let decision = filter.should_scan(&dir.path().join("gone.exe")).await;
        assert_eq!(decision.skip_reason(), Some(SkipReason::Missing));
    }

    #[tokio::test]
    async fn test_safe_extension_skipped() {
        let (filter, _, _) = test_filter();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.JPG");
        tokio::fs::write(&path, b"not really a jpeg").await.unwrap();
        let decision = filter.should_scan(&path).await;
        assert_eq!(decision.skip_reason(), Some(SkipReason::SafeExtension));
    }

    #[tokio::test]
    async fn test_inflight_duplicate_skipped() {
        let (filter, _, inflight) = test_filter();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        tokio::fs::write(&path, b"payload").await.unwrap();

        inflight.insert(&path);
        let decision = filter.should_scan(&path).await;
        assert_eq!(decision.skip_reason(), Some(SkipReason::Duplicate));
    }

    #[tokio::test]
    async fn test_oversized_file_skipped() {
        let (metrics, _rx) = MetricsSender::new();
        let cache = Arc::new(ResultCache::new(CacheConfig::default(), metrics.clone()));
        let filter = PreFilter::new(
            PreFilterConfig {
                max_file_size: 4,
                ..PreFilterConfig::default()
            },
            cache,
            InflightSet::new(),
            metrics,
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        tokio::fs::write(&path, b"more than four bytes").await.unwrap();
        let decision = filter.should_scan(&path).await;
        assert_eq!(decision.skip_reason(), Some(SkipReason::TooLarge));
    }

    #[tokio::test]
    async fn test_cached_clean_short_circuits() {
        let (filter, cache, _) = test_filter();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known.bin");
        tokio::fs::write(&path, b"known clean content").await.unwrap();

        let hash = content_hash(&path).await.unwrap();
        cache.insert(&hash, Verdict::Clean, cache.generation());

        let decision = filter.should_scan(&path).await;
        assert_eq!(decision.skip_reason(), Some(SkipReason::CachedClean));
    }

    #[tokio::test]
    async fn test_survivor_carries_hash() {
        let (filter, _, _) = test_filter();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.bin");
        tokio::fs::write(&path, b"never seen before").await.unwrap();

        match filter.should_scan(&path).await {
            ScanDecision::Scan { content_hash } => {
                assert_eq!(content_hash.unwrap().len(), 64);
            }
            other => panic!("expected scan decision, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prefilter_is_idempotent() {
        let (filter, _, _) = test_filter();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        tokio::fs::write(&path, b"pixels").await.unwrap();

        let first = filter.should_scan(&path).await;
        let second = filter.should_scan(&path).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_generation_bump_invalidates_cached_clean() {
        let (filter, cache, _) = test_filter();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.bin");
        tokio::fs::write(&path, b"previously clean").await.unwrap();

        let hash = content_hash(&path).await.unwrap();
        cache.insert(&hash, Verdict::Clean, cache.generation());
        cache.invalidate_generation(cache.generation() + 1);

        let decision = filter.should_scan(&path).await;
        assert!(decision.should_scan());
    }
}
