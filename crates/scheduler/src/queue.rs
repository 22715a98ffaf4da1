use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;
use vigil_interfaces::{MetricsEvent, MetricsSender, PriorityTier};

/// One unit of scanning work. Created when a path survives pre-filtering;
/// mutated only by the scheduler (boost, retry); destroyed on terminal
/// completion or permanent failure.
#[derive(Debug, Clone)]
pub struct ScanTask {
    pub path: PathBuf,
    pub discovered_at: DateTime<Utc>,
    pub priority: PriorityTier,
    pub retries: u32,
    /// Hash computed by the pre-filter's cache consult, carried along so
    /// workers do not hash the file twice.
    pub content_hash: Option<String>,
    effective: PriorityTier,
    enqueued_at: Instant,
    seq: u64,
}

impl ScanTask {
    pub fn new(path: PathBuf, priority: PriorityTier, content_hash: Option<String>) -> Self {
        Self {
            path,
            discovered_at: Utc::now(),
            priority,
            retries: 0,
            content_hash,
            effective: priority,
            enqueued_at: Instant::now(),
            seq: 0,
        }
    }

    /// Tier after starvation boosts, the one scheduling decisions use.
    pub fn effective_tier(&self) -> PriorityTier {
        self.effective
    }
}

fn tier_index(tier: PriorityTier) -> usize {
    match tier {
        PriorityTier::Low => 0,
        PriorityTier::Normal => 1,
        PriorityTier::High => 2,
        PriorityTier::Immediate => 3,
    }
}

struct QueueInner {
    tiers: [std::collections::VecDeque<ScanTask>; 4],
    len: usize,
    next_seq: u64,
}

/// Bounded shared priority queue. FIFO within a tier; tasks waiting past
/// the boost threshold climb one tier per scheduling pass so nothing
/// starves behind a stream of higher-priority arrivals. Overflow drops the
/// lowest-priority pending task instead of blocking the producer.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    boost_after: Duration,
    metrics: MetricsSender,
}

impl TaskQueue {
    pub fn new(capacity: usize, boost_after: Duration, metrics: MetricsSender) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tiers: Default::default(),
                len: 0,
                next_seq: 0,
            }),
            notify: Notify::new(),
            capacity,
            boost_after,
            metrics,
        }
    }

    /// Non-blocking enqueue. Returns false when the incoming task itself
    /// was the lowest priority in a full queue and was dropped.
    pub fn push(&self, mut task: ScanTask) -> bool {
        let mut inner = self.inner.lock();

        if inner.len >= self.capacity {
            let incoming_idx = tier_index(task.effective);
            let lowest_idx = inner.tiers.iter().position(|t| !t.is_empty());
            match lowest_idx {
                Some(idx) if idx < incoming_idx => {
                    if let Some(dropped) = inner.tiers[idx].pop_back() {
                        inner.len -= 1;
                        debug!(path = %dropped.path.display(), "queue full, dropped pending task");
                        self.metrics.emit(MetricsEvent::TaskDropped {
                            tier: dropped.effective,
                        });
                    }
                }
                _ => {
                    debug!(path = %task.path.display(), "queue full, dropped incoming task");
                    self.metrics.emit(MetricsEvent::TaskDropped {
                        tier: task.effective,
                    });
                    return false;
                }
            }
        }

        task.seq = inner.next_seq;
        inner.next_seq += 1;
        task.enqueued_at = Instant::now();
        let idx = tier_index(task.effective);
        inner.tiers[idx].push_back(task);
        inner.len += 1;
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Pops the highest-priority ready task after applying one starvation
    /// pass. Processing tiers top-down means a task climbs at most one
    /// tier per call.
    pub fn pop(&self) -> Option<ScanTask> {
        let mut inner = self.inner.lock();

        for idx in (0..3).rev() {
            loop {
                let expired = inner.tiers[idx]
                    .front()
                    .map(|t| t.enqueued_at.elapsed() >= self.boost_after)
                    .unwrap_or(false);
                if !expired {
                    break;
                }
                if let Some(mut task) = inner.tiers[idx].pop_front() {
                    task.effective = task.effective.boosted();
                    debug!(
                        path = %task.path.display(),
                        tier = %task.effective,
                        "starvation boost applied"
                    );
                    inner.tiers[idx + 1].push_back(task);
                }
            }
        }

        for idx in (0..4).rev() {
            if let Some(task) = inner.tiers[idx].pop_front() {
                inner.len -= 1;
                return Some(task);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards everything still queued. Used on shutdown (`Draining`
    /// keeps in-flight scans, queued-but-unstarted work is dropped).
    pub fn clear(&self) -> Vec<ScanTask> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::with_capacity(inner.len);
        for tier in inner.tiers.iter_mut() {
            drained.extend(tier.drain(..));
        }
        inner.len = 0;
        drained
    }

    /// Waits until a push happens, or the timeout elapses. Workers wake
    /// periodically even when idle so boost passes keep running.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    /// Wakes every idle worker (used when draining).
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}
