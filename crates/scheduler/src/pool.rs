use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vigil_cache::{content_hash, ResultCache};
use vigil_engines::EngineCoordinator;
use vigil_interfaces::{
    MetricsEvent, MetricsSender, ScanEvent, ScanOutcomeKind, ThreatDescriptor, ThreatLevel,
    Verdict,
};
use vigil_policy::InflightSet;
use vigil_quarantine::{QuarantineError, QuarantineManager};

use crate::load::LoadMonitor;
use crate::queue::{ScanTask, TaskQueue};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub min_workers: usize,
    /// Bounded by CPU core count, capped at 8.
    pub max_workers: usize,
    pub max_retries: u32,
    pub scale_up_depth: usize,
    pub scale_down_depth: usize,
    pub scale_cooldown: Duration,
    pub scale_check_interval: Duration,
    pub pause_backoff: Duration,
    pub idle_wait: Duration,
    pub drain_timeout: Duration,
    /// Threat level at or above which a positive verdict is handed to the
    /// quarantine manager.
    pub quarantine_threshold: ThreatLevel,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: num_cpus::get().min(8),
            max_retries: 3,
            scale_up_depth: 50,
            scale_down_depth: 10,
            scale_cooldown: Duration::from_secs(30),
            scale_check_interval: Duration::from_secs(5),
            pause_backoff: Duration::from_millis(500),
            idle_wait: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(70),
            quarantine_threshold: ThreatLevel::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    Stopped,
    Running,
    Draining,
}

/// Pool sizing state, mutated exclusively by the scaling check.
#[derive(Debug, Clone)]
pub struct WorkerPoolState {
    pub current: usize,
    pub min: usize,
    pub max: usize,
    pub last_scaled_at: Option<DateTime<Utc>>,
}

struct PoolShared {
    phase: Mutex<PoolPhase>,
    desired_workers: AtomicUsize,
    pool_state: Mutex<WorkerPoolState>,
    last_scale: Mutex<Option<Instant>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    scaling_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Adaptive worker pool pulling filtered tasks from the shared queue,
/// consulting the load monitor, and driving the engine coordinator. All
/// collaborators are injected at construction; the scheduler owns no
/// global state.
pub struct ScanScheduler {
    config: SchedulerConfig,
    queue: Arc<TaskQueue>,
    monitor: Arc<LoadMonitor>,
    coordinator: Arc<EngineCoordinator>,
    cache: Arc<ResultCache>,
    quarantine: Arc<QuarantineManager>,
    inflight: Arc<InflightSet>,
    metrics: MetricsSender,
    events: broadcast::Sender<ScanEvent>,
    shared: Arc<PoolShared>,
    weak: Weak<Self>,
}

impl ScanScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        queue: Arc<TaskQueue>,
        monitor: Arc<LoadMonitor>,
        coordinator: Arc<EngineCoordinator>,
        cache: Arc<ResultCache>,
        quarantine: Arc<QuarantineManager>,
        inflight: Arc<InflightSet>,
        metrics: MetricsSender,
        events: broadcast::Sender<ScanEvent>,
    ) -> Arc<Self> {
        let shared = Arc::new(PoolShared {
            phase: Mutex::new(PoolPhase::Stopped),
            desired_workers: AtomicUsize::new(0),
            pool_state: Mutex::new(WorkerPoolState {
                current: 0,
                min: config.min_workers,
                max: config.max_workers,
                last_scaled_at: None,
            }),
            last_scale: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
            scaling_handle: Mutex::new(None),
        });
        Arc::new_cyclic(|weak| Self {
            config,
            queue,
            monitor,
            coordinator,
            cache,
            quarantine,
            inflight,
            metrics,
            events,
            shared,
            weak: weak.clone(),
        })
    }

    pub fn phase(&self) -> PoolPhase {
        *self.shared.phase.lock()
    }

    pub fn pool_state(&self) -> WorkerPoolState {
        self.shared.pool_state.lock().clone()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Starts the minimum worker complement and the periodic scaling
    /// check. Idempotent while running.
    pub fn start(&self) {
        {
            let mut phase = self.shared.phase.lock();
            if *phase != PoolPhase::Stopped {
                return;
            }
            *phase = PoolPhase::Running;
        }

        self.shared
            .desired_workers
            .store(self.config.min_workers, Ordering::Release);
        self.shared.pool_state.lock().current = self.config.min_workers;

        for id in 0..self.config.min_workers {
            self.spawn_worker(id);
        }

        if let Some(scheduler) = self.weak.upgrade() {
            let handle = tokio::spawn(async move {
                scheduler.scaling_loop().await;
            });
            *self.shared.scaling_handle.lock() = Some(handle);
        }

        info!(workers = self.config.min_workers, "scan scheduler started");
    }

    /// Drains the pool: in-flight scans finish (bounded by the drain
    /// timeout), queued-but-unstarted tasks are discarded.
    pub async fn stop(&self) {
        {
            let mut phase = self.shared.phase.lock();
            if *phase != PoolPhase::Running {
                return;
            }
            *phase = PoolPhase::Draining;
        }
        info!("scan scheduler draining");

        if let Some(handle) = self.shared.scaling_handle.lock().take() {
            handle.abort();
        }
        self.queue.wake_all();

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.shared.worker_handles.lock());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.config.drain_timeout, drain)
            .await
            .is_err()
        {
            warn!("drain timeout elapsed with workers still busy");
        }

        for task in self.queue.clear() {
            self.inflight.remove(&task.path);
        }

        {
            let mut phase = self.shared.phase.lock();
            *phase = PoolPhase::Stopped;
        }
        self.shared.pool_state.lock().current = 0;
        self.shared.desired_workers.store(0, Ordering::Release);
        info!("scan scheduler stopped");
    }

    fn spawn_worker(&self, id: usize) {
        let Some(scheduler) = self.weak.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            scheduler.worker_loop(id).await;
        });
        self.shared.worker_handles.lock().push(handle);
    }

    async fn worker_loop(self: Arc<Self>, id: usize) {
        debug!(worker = id, "worker started");
        loop {
            match self.phase() {
                PoolPhase::Running => {}
                PoolPhase::Draining | PoolPhase::Stopped => break,
            }
            // Scaled down: the highest-numbered workers bow out first.
            if id >= self.shared.desired_workers.load(Ordering::Acquire) {
                break;
            }

            // Cooperative backpressure: no dispatch while the host is
            // saturated, a bounded delay while merely throttled.
            if self.monitor.should_pause() {
                tokio::time::sleep(self.config.pause_backoff).await;
                continue;
            }
            let delay = self.monitor.recommended_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.queue.pop() {
                Some(task) => self.process_task(task).await,
                None => self.queue.wait_for_work(self.config.idle_wait).await,
            }
        }
        debug!(worker = id, "worker exited");
    }

    async fn process_task(&self, mut task: ScanTask) {
        let started = Instant::now();
        let path = task.path.clone();

        let hash = match task.content_hash.clone() {
            Some(h) => h,
            None => match content_hash(&path).await {
                Ok(h) => h,
                Err(e) => {
                    // Vanished between enqueue and dispatch.
                    debug!(path = %path.display(), "task target unreadable: {}", e);
                    self.inflight.remove(&path);
                    return;
                }
            },
        };

        let verdict = self.coordinator.scan(&path).await;

        if let Verdict::Error { reason } = &verdict {
            if task.retries < self.config.max_retries {
                task.retries += 1;
                task.content_hash = Some(hash);
                debug!(
                    path = %path.display(),
                    retry = task.retries,
                    "transient engine failure, re-enqueueing"
                );
                self.metrics.emit(MetricsEvent::TaskRetried);
                if !self.queue.push(task) {
                    self.inflight.remove(&path);
                }
            } else {
                warn!(path = %path.display(), "retries exhausted: {}", reason);
                self.metrics.emit(MetricsEvent::TaskFailedPermanently);
                self.metrics.emit(MetricsEvent::ScanFinished {
                    duration: started.elapsed(),
                    outcome: ScanOutcomeKind::Failed,
                });
                let _ = self.events.send(ScanEvent::ScanError {
                    path: path.clone(),
                    reason: reason.to_string(),
                });
                self.inflight.remove(&path);
            }
            return;
        }

        // Only definitive verdicts are worth remembering; Suspicious and
        // Error results must be re-derived next time.
        if verdict.is_definitive() {
            self.cache
                .insert(&hash, verdict.clone(), self.coordinator.generation());
        }

        if let Some(level) = verdict.threat_level() {
            let _ = self.events.send(ScanEvent::ThreatDetected {
                path: path.clone(),
                verdict: verdict.clone(),
            });
            if level >= self.config.quarantine_threshold {
                self.isolate(&path, &verdict).await;
            }
        }

        let _ = self.events.send(ScanEvent::ScanCompleted {
            path: path.clone(),
            verdict: verdict.clone(),
        });
        self.metrics.emit(MetricsEvent::ScanFinished {
            duration: started.elapsed(),
            outcome: ScanOutcomeKind::from(&verdict),
        });
        self.inflight.remove(&path);
    }

    async fn isolate(&self, path: &std::path::Path, verdict: &Verdict) {
        let Some(descriptor) = ThreatDescriptor::from_verdict(verdict) else {
            return;
        };
        match self.quarantine.quarantine(path, descriptor).await {
            Ok(record) => {
                self.metrics.emit(MetricsEvent::QuarantineCaptured);
                let _ = self.events.send(ScanEvent::QuarantineAction {
                    record_id: record.id,
                    path: path.to_path_buf(),
                    restored: false,
                });
            }
            Err(QuarantineError::SecurityViolation(reason)) => {
                warn!(path = %path.display(), "quarantine refused: {}", reason);
                let _ = self.events.send(ScanEvent::ScanError {
                    path: path.to_path_buf(),
                    reason: format!("quarantine refused: {}", reason),
                });
            }
            Err(e) => {
                error!(path = %path.display(), "quarantine failed: {}", e);
                let _ = self.events.send(ScanEvent::ScanError {
                    path: path.to_path_buf(),
                    reason: format!("quarantine failed: {}", e),
                });
            }
        }
    }

    /// Periodic adaptive sizing. Scaling never runs per-task, and both
    /// directions respect the cooldown window so the pool cannot thrash.
    async fn scaling_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.scale_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.phase() != PoolPhase::Running {
                break;
            }
            self.run_scaling_check();
        }
    }

    fn run_scaling_check(&self) {
        let cooldown_over = (*self.shared.last_scale.lock())
            .map_or(true, |at| at.elapsed() >= self.config.scale_cooldown);
        if !cooldown_over {
            return;
        }

        let depth = self.queue.len();
        let current = self.shared.desired_workers.load(Ordering::Acquire);

        if depth > self.config.scale_up_depth
            && current < self.config.max_workers
            && self.monitor.recommended_worker_delta(current) >= 0
        {
            self.apply_scale(current, current + 1);
            // Worker ids are slot numbers: the new worker takes the slot
            // the raised target just opened.
            self.spawn_worker(current);
        } else if depth < self.config.scale_down_depth && current > self.config.min_workers {
            // The worker notices the lowered target on its next pass.
            self.apply_scale(current, current - 1);
            self.queue.wake_all();
        }
    }

    fn apply_scale(&self, from: usize, to: usize) {
        self.shared.desired_workers.store(to, Ordering::Release);
        *self.shared.last_scale.lock() = Some(Instant::now());
        {
            let mut state = self.shared.pool_state.lock();
            state.current = to;
            state.last_scaled_at = Some(Utc::now());
        }
        info!(from, to, depth = self.queue.len(), "worker pool scaled");
        self.metrics.emit(MetricsEvent::PoolScaled { from, to });
    }
}
