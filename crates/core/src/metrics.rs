use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vigil_interfaces::{MetricsEvent, ScanOutcomeKind};

const SCAN_SAMPLE_CAPACITY: usize = 1_000;
const SNAPSHOT_CAPACITY: usize = 100;
const SCALING_CAPACITY: usize = 50;
const ROLLUP_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSample {
    pub at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: ScanOutcomeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingSample {
    pub at: DateTime<Utc>,
    pub from: usize,
    pub to: usize,
}

/// Periodic point-in-time view of pool health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub at: DateTime<Utc>,
    pub queue_depth: usize,
    pub workers: usize,
    pub cache_hit_rate: f64,
    pub scans_per_minute: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentRollup {
    pub window_secs: i64,
    pub scans: usize,
    pub threats: usize,
    pub avg_duration_ms: f64,
}

/// Running totals plus the recent-window rollup, serializable for
/// dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub scans_completed: u64,
    pub scans_failed: u64,
    pub scans_skipped: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub threats_detected: u64,
    pub tasks_dropped: u64,
    pub tasks_retried: u64,
    pub quarantined: u64,
    pub restored: u64,
    pub scaling_events: u64,
    pub recent: RecentRollup,
}

#[derive(Default)]
struct Totals {
    scans_completed: AtomicU64,
    scans_failed: AtomicU64,
    scans_skipped: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    threats_detected: AtomicU64,
    tasks_dropped: AtomicU64,
    tasks_retried: AtomicU64,
    quarantined: AtomicU64,
    restored: AtomicU64,
    scaling_events: AtomicU64,
}

/// Passive aggregator behind the metrics channel. Every recording call is
/// O(1) amortized: atomic bumps and bounded ring-buffer pushes, no I/O.
pub struct MetricsRecorder {
    started_at: DateTime<Utc>,
    totals: Totals,
    scan_samples: Mutex<VecDeque<ScanSample>>,
    snapshots: Mutex<VecDeque<PoolSnapshot>>,
    scaling: Mutex<VecDeque<ScalingSample>>,
}

impl MetricsRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Utc::now(),
            totals: Totals::default(),
            scan_samples: Mutex::new(VecDeque::with_capacity(SCAN_SAMPLE_CAPACITY)),
            snapshots: Mutex::new(VecDeque::with_capacity(SNAPSHOT_CAPACITY)),
            scaling: Mutex::new(VecDeque::with_capacity(SCALING_CAPACITY)),
        })
    }

    /// Drains the metrics channel into the recorder until every sender is
    /// dropped.
    pub fn spawn_drain(
        recorder: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<MetricsEvent>,
    ) -> JoinHandle<()> {
        let recorder = Arc::clone(recorder);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                recorder.record(event);
            }
        })
    }

    pub fn record(&self, event: MetricsEvent) {
        match event {
            MetricsEvent::ScanFinished { duration, outcome } => {
                match outcome {
                    ScanOutcomeKind::Failed => {
                        self.totals.scans_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    ScanOutcomeKind::Infected | ScanOutcomeKind::Suspicious => {
                        self.totals.scans_completed.fetch_add(1, Ordering::Relaxed);
                        self.totals.threats_detected.fetch_add(1, Ordering::Relaxed);
                    }
                    ScanOutcomeKind::Clean => {
                        self.totals.scans_completed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                push_bounded(
                    &mut self.scan_samples.lock(),
                    ScanSample {
                        at: Utc::now(),
                        duration_ms: duration.as_millis() as u64,
                        outcome,
                    },
                    SCAN_SAMPLE_CAPACITY,
                );
            }
            MetricsEvent::ScanSkipped { .. } => {
                self.totals.scans_skipped.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::CacheLookup { hit } => {
                if hit {
                    self.totals.cache_hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.totals.cache_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
            MetricsEvent::TaskDropped { .. } => {
                self.totals.tasks_dropped.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::TaskRetried => {
                self.totals.tasks_retried.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::TaskFailedPermanently => {
                // Counted under scans_failed when the final attempt lands.
            }
            MetricsEvent::PoolScaled { from, to } => {
                self.totals.scaling_events.fetch_add(1, Ordering::Relaxed);
                push_bounded(
                    &mut self.scaling.lock(),
                    ScalingSample {
                        at: Utc::now(),
                        from,
                        to,
                    },
                    SCALING_CAPACITY,
                );
            }
            MetricsEvent::QuarantineCaptured => {
                self.totals.quarantined.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::QuarantineRestored => {
                self.totals.restored.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Records a periodic point-in-time pool observation.
    pub fn observe_pool(&self, queue_depth: usize, workers: usize) {
        let snapshot = PoolSnapshot {
            at: Utc::now(),
            queue_depth,
            workers,
            cache_hit_rate: self.cache_hit_rate(),
            scans_per_minute: self.recent_rollup().scans as f64
                / (ROLLUP_WINDOW_SECS as f64 / 60.0),
        };
        push_bounded(&mut self.snapshots.lock(), snapshot, SNAPSHOT_CAPACITY);
    }

    fn cache_hit_rate(&self) -> f64 {
        let hits = self.totals.cache_hits.load(Ordering::Relaxed);
        let misses = self.totals.cache_misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    fn recent_rollup(&self) -> RecentRollup {
        let cutoff = Utc::now() - ChronoDuration::seconds(ROLLUP_WINDOW_SECS);
        let samples = self.scan_samples.lock();
        let recent: Vec<&ScanSample> = samples.iter().filter(|s| s.at >= cutoff).collect();
        let scans = recent.len();
        let threats = recent
            .iter()
            .filter(|s| {
                matches!(
                    s.outcome,
                    ScanOutcomeKind::Infected | ScanOutcomeKind::Suspicious
                )
            })
            .count();
        let avg_duration_ms = if scans == 0 {
            0.0
        } else {
            recent.iter().map(|s| s.duration_ms as f64).sum::<f64>() / scans as f64
        };
        RecentRollup {
            window_secs: ROLLUP_WINDOW_SECS,
            scans,
            threats,
            avg_duration_ms,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started_at: self.started_at,
            scans_completed: self.totals.scans_completed.load(Ordering::Relaxed),
            scans_failed: self.totals.scans_failed.load(Ordering::Relaxed),
            scans_skipped: self.totals.scans_skipped.load(Ordering::Relaxed),
            cache_hits: self.totals.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.totals.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            threats_detected: self.totals.threats_detected.load(Ordering::Relaxed),
            tasks_dropped: self.totals.tasks_dropped.load(Ordering::Relaxed),
            tasks_retried: self.totals.tasks_retried.load(Ordering::Relaxed),
            quarantined: self.totals.quarantined.load(Ordering::Relaxed),
            restored: self.totals.restored.load(Ordering::Relaxed),
            scaling_events: self.totals.scaling_events.load(Ordering::Relaxed),
            recent: self.recent_rollup(),
        }
    }

    /// Full export for external dashboards: the snapshot plus the bounded
    /// histories.
    pub fn export(&self) -> serde_json::Value {
        let snapshot = self.snapshot();
        let pool_snapshots: Vec<PoolSnapshot> = self.snapshots.lock().iter().cloned().collect();
        let scaling: Vec<ScalingSample> = self.scaling.lock().iter().cloned().collect();
        serde_json::json!({
            "snapshot": snapshot,
            "pool_snapshots": pool_snapshots,
            "scaling_events": scaling,
        })
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, capacity: usize) {
    if buf.len() == capacity {
        buf.pop_front();
    }
    buf.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vigil_interfaces::{MetricsSender, PriorityTier, SkipReason};

    #[test]
    fn test_totals_accumulate() {
        let recorder = MetricsRecorder::new();
        recorder.record(MetricsEvent::ScanFinished {
            duration: Duration::from_millis(12),
            outcome: ScanOutcomeKind::Clean,
        });
        recorder.record(MetricsEvent::ScanFinished {
            duration: Duration::from_millis(40),
            outcome: ScanOutcomeKind::Infected,
        });
        recorder.record(MetricsEvent::ScanSkipped {
            reason: SkipReason::SafeExtension,
        });
        recorder.record(MetricsEvent::CacheLookup { hit: true });
        recorder.record(MetricsEvent::CacheLookup { hit: false });

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.scans_completed, 2);
        assert_eq!(snapshot.threats_detected, 1);
        assert_eq!(snapshot.scans_skipped, 1);
        assert!((snapshot.cache_hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.recent.scans, 2);
        assert!(snapshot.recent.avg_duration_ms > 0.0);
    }

    #[test]
    fn test_ring_buffers_are_bounded() {
        let recorder = MetricsRecorder::new();
        for i in 0..(SCALING_CAPACITY + 25) {
            recorder.record(MetricsEvent::PoolScaled { from: i, to: i + 1 });
        }
        assert_eq!(recorder.scaling.lock().len(), SCALING_CAPACITY);
        // Oldest entries fell off the front.
        assert_eq!(recorder.scaling.lock().front().unwrap().from, 25);

        for _ in 0..(SCAN_SAMPLE_CAPACITY + 10) {
            recorder.record(MetricsEvent::ScanFinished {
                duration: Duration::from_millis(1),
                outcome: ScanOutcomeKind::Clean,
            });
        }
        assert_eq!(recorder.scan_samples.lock().len(), SCAN_SAMPLE_CAPACITY);
    }

    #[test]
    fn test_pool_snapshots_bounded() {
        let recorder = MetricsRecorder::new();
        for _ in 0..(SNAPSHOT_CAPACITY + 5) {
            recorder.observe_pool(3, 2);
        }
        assert_eq!(recorder.snapshots.lock().len(), SNAPSHOT_CAPACITY);
    }

    #[test]
    fn test_export_is_serializable() {
        let recorder = MetricsRecorder::new();
        recorder.record(MetricsEvent::TaskDropped {
            tier: PriorityTier::Low,
        });
        recorder.observe_pool(0, 2);
        let value = recorder.export();
        let text = serde_json::to_string(&value).unwrap();
        assert!(text.contains("pool_snapshots"));
    }

    #[tokio::test]
    async fn test_drain_task_consumes_channel() {
        let recorder = MetricsRecorder::new();
        let (sender, rx) = MetricsSender::new();
        let handle = MetricsRecorder::spawn_drain(&recorder, rx);

        sender.emit(MetricsEvent::TaskRetried);
        sender.emit(MetricsEvent::QuarantineCaptured);
        drop(sender);
        handle.await.unwrap();

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.tasks_retried, 1);
        assert_eq!(snapshot.quarantined, 1);
    }
}
