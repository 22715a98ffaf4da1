//! Top-level façade tying the engine together: filesystem ingestion,
//! pre-filtering, scheduling, quarantine, and the outward event surface.
//!
//! Everything is constructed here and injected downward; lifecycle is tied
//! to `start`/`stop`, never to process-wide state.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_cache::{CacheError, ResultCache};
use vigil_engines::{
    EngineCoordinator, EngineSet, ProcessMlClassifier, ProcessRuleScanner, ProcessSignatureScanner,
};
use vigil_interfaces::{
    FsChange, MetricsEvent, MetricsSender, PriorityTier, ScanEvent, SkipReason,
};
use vigil_policy::{classify, InflightSet, PreFilter, ScanDecision};
use vigil_quarantine::{QuarantineError, QuarantineManager, QuarantineRecord};
use vigil_scheduler::{
    LoadMonitor, ScanScheduler, ScanTask, TaskQueue, WorkerPoolState,
};

use crate::config::{ConfigError, EngineConfig};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::watch::{collect_files, FsWatchService, WatchError};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What happened to one submitted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    Skipped(SkipReason),
    /// Queue overflow dropped the task (it was the lowest priority
    /// pending).
    Dropped,
}

struct Runtime {
    started: bool,
    watch: Option<FsWatchService>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct WatchCoordinator {
    config: EngineConfig,
    cache: Arc<ResultCache>,
    prefilter: Arc<PreFilter>,
    inflight: Arc<InflightSet>,
    queue: Arc<TaskQueue>,
    engines: Arc<EngineCoordinator>,
    quarantine: Arc<QuarantineManager>,
    scheduler: Arc<ScanScheduler>,
    recorder: Arc<MetricsRecorder>,
    metrics: MetricsSender,
    metrics_rx: Mutex<Option<mpsc::UnboundedReceiver<MetricsEvent>>>,
    events: broadcast::Sender<ScanEvent>,
    runtime: Mutex<Runtime>,
    weak: Weak<Self>,
}

impl WatchCoordinator {
    /// Builds the full engine with injected detection engines. Validates
    /// the configuration up front; an invalid configuration never starts a
    /// pool.
    pub fn new(config: EngineConfig, engine_set: EngineSet) -> Result<Arc<Self>, CoreError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let (metrics, metrics_rx) = MetricsSender::new();
        let recorder = MetricsRecorder::new();

        let cache = Arc::new(ResultCache::new(config.cache_config(), metrics.clone()));
        let inflight = InflightSet::new();
        let prefilter = Arc::new(PreFilter::new(
            config.prefilter_config(),
            Arc::clone(&cache),
            Arc::clone(&inflight),
            metrics.clone(),
        ));
        let queue = Arc::new(TaskQueue::new(
            config.scheduler.queue_capacity,
            Duration::from_secs(config.scheduler.boost_after_secs),
            metrics.clone(),
        ));
        let monitor = Arc::new(LoadMonitor::new(config.load_config()));
        let engines = Arc::new(EngineCoordinator::new(
            engine_set,
            config.coordinator_config(),
        ));
        let quarantine = QuarantineManager::open(config.quarantine_config())?;
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let scheduler = ScanScheduler::new(
            config.scheduler_config(),
            Arc::clone(&queue),
            monitor,
            Arc::clone(&engines),
            Arc::clone(&cache),
            Arc::clone(&quarantine),
            Arc::clone(&inflight),
            metrics.clone(),
            events.clone(),
        );

        Ok(Arc::new_cyclic(|weak| Self {
            config,
            cache,
            prefilter,
            inflight,
            queue,
            engines,
            quarantine,
            scheduler,
            recorder,
            metrics,
            metrics_rx: Mutex::new(Some(metrics_rx)),
            events,
            runtime: Mutex::new(Runtime {
                started: false,
                watch: None,
                tasks: Vec::new(),
            }),
            weak: weak.clone(),
        }))
    }

    /// Builds the engine with process-backed adapters from the
    /// configuration's engine commands.
    pub fn from_config(config: EngineConfig) -> Result<Arc<Self>, CoreError> {
        let mut engine_set = EngineSet::default();
        if let Some(command) = &config.engines.signature_command {
            engine_set.signature = Some(Arc::new(ProcessSignatureScanner::new(
                config.process_engine_config(command, &config.engines.signature_args),
            )));
        }
        if let Some(command) = &config.engines.rule_command {
            engine_set.rules = Some(Arc::new(ProcessRuleScanner::new(
                config.process_engine_config(command, &config.engines.rule_args),
            )));
        }
        if let Some(command) = &config.engines.classifier_command {
            engine_set.classifier = Some(Arc::new(ProcessMlClassifier::new(
                config.process_engine_config(command, &config.engines.classifier_args),
            )));
        }
        Self::new(config, engine_set)
    }

    /// Starts workers, metrics, and (when roots are configured) the
    /// filesystem watcher. Idempotent while running.
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.runtime.lock().started {
            return Ok(());
        }
        let Some(this) = self.weak.upgrade() else {
            return Ok(());
        };

        if self.config.cache.persist {
            self.cache.load(&self.config.cache_snapshot_path()).await;
        }

        let mut tasks = Vec::new();
        if let Some(rx) = self.metrics_rx.lock().take() {
            tasks.push(MetricsRecorder::spawn_drain(&self.recorder, rx));
        }

        self.scheduler.start();

        let watch = if self.config.watch_paths.is_empty() {
            None
        } else {
            let (tx, mut rx) = mpsc::unbounded_channel::<FsChange>();
            let service =
                FsWatchService::start(&self.config.watch_paths, self.config.debounce(), tx)?;
            let coordinator = Arc::clone(&this);
            tasks.push(tokio::spawn(async move {
                while let Some(change) = rx.recv().await {
                    coordinator.ingest(change).await;
                }
            }));
            Some(service)
        };

        let coordinator = this;
        tasks.push(tokio::spawn(async move {
            coordinator.observability_loop().await;
        }));

        {
            let mut runtime = self.runtime.lock();
            runtime.started = true;
            runtime.watch = watch;
            runtime.tasks = tasks;
        }
        info!(
            roots = self.config.watch_paths.len(),
            "watch coordinator started"
        );
        Ok(())
    }

    /// Stops ingestion, drains the pool, and persists cache and metrics.
    pub async fn stop(&self) {
        let (watch, tasks) = {
            let mut runtime = self.runtime.lock();
            if !runtime.started {
                return;
            }
            runtime.started = false;
            (runtime.watch.take(), std::mem::take(&mut runtime.tasks))
        };

        if let Some(watch) = watch {
            watch.stop();
        }
        self.scheduler.stop().await;
        for task in tasks {
            task.abort();
        }

        if self.config.cache.persist {
            if let Err(e) = self.cache.save(&self.config.cache_snapshot_path()).await {
                warn!("failed to persist cache snapshot: {}", e);
            }
        }
        if self.config.metrics.export {
            self.write_metrics_export().await;
        }
        info!("watch coordinator stopped");
    }

    async fn ingest(&self, change: FsChange) {
        debug!(
            path = %change.path.display(),
            kind = ?change.kind,
            "filesystem change"
        );
        // Deletions flow through the same gate; the missing-file check
        // retires them without engine involvement.
        self.submit_path(&change.path, None).await;
    }

    /// Manual or ingested submission. Runs the pre-filter and enqueues a
    /// task classified at `priority` (or by the path classifier).
    pub async fn submit_path(&self, path: &Path, priority: Option<PriorityTier>) -> SubmitOutcome {
        match self.prefilter.should_scan(path).await {
            ScanDecision::Skip { reason } => SubmitOutcome::Skipped(reason),
            ScanDecision::Scan { content_hash } => {
                if !self.inflight.insert(path) {
                    return SubmitOutcome::Skipped(SkipReason::Duplicate);
                }
                let tier = priority.unwrap_or_else(|| classify(path));
                let task = ScanTask::new(path.to_path_buf(), tier, content_hash);
                if self.queue.push(task) {
                    SubmitOutcome::Queued
                } else {
                    self.inflight.remove(path);
                    SubmitOutcome::Dropped
                }
            }
        }
    }

    /// Walks a directory tree and submits every regular file. Returns the
    /// number of tasks queued.
    pub async fn sweep(&self, root: &Path) -> usize {
        let root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_files(&root))
            .await
            .unwrap_or_default();
        let mut queued = 0usize;
        for file in files {
            if self.submit_path(&file, None).await == SubmitOutcome::Queued {
                queued += 1;
            }
        }
        queued
    }

    /// Restores a quarantined file and immediately re-submits it at
    /// `Immediate` priority: a restore is indistinguishable from a fresh
    /// arrival and must not bypass detection through any cached state.
    pub async fn restore(&self, record_id: &str) -> Result<QuarantineRecord, CoreError> {
        let record = self.quarantine.restore(record_id).await?;
        self.metrics.emit(MetricsEvent::QuarantineRestored);
        let _ = self.events.send(ScanEvent::QuarantineAction {
            record_id: record.id.clone(),
            path: record.original_path.clone(),
            restored: true,
        });
        self.submit_path(&record.original_path, Some(PriorityTier::Immediate))
            .await;
        Ok(record)
    }

    /// Signature/rule databases changed: advance the engine generation so
    /// cached verdicts from the old generation stop matching.
    pub fn reload_engines(&self) {
        let generation = self.engines.bump_generation();
        self.cache.invalidate_generation(generation);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.recorder.snapshot()
    }

    pub fn export_metrics(&self) -> serde_json::Value {
        self.recorder.export()
    }

    pub fn pool_state(&self) -> WorkerPoolState {
        self.scheduler.pool_state()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn quarantine_records(&self) -> Vec<QuarantineRecord> {
        self.quarantine.records()
    }

    async fn observability_loop(self: Arc<Self>) {
        let snapshot_every =
            Duration::from_secs(self.config.metrics.snapshot_interval_secs.max(1));
        let export_every = Duration::from_secs(self.config.metrics.export_interval_secs.max(1));
        let mut snapshot_tick = tokio::time::interval(snapshot_every);
        let mut export_tick = tokio::time::interval(export_every);
        snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        export_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = snapshot_tick.tick() => {
                    self.recorder
                        .observe_pool(self.queue.len(), self.scheduler.pool_state().current);
                }
                _ = export_tick.tick() => {
                    if self.config.metrics.export {
                        self.write_metrics_export().await;
                    }
                }
            }
        }
    }

    /// Best-effort: the export path never blocks or fails the scan path.
    async fn write_metrics_export(&self) {
        let value = self.recorder.export();
        let path = self.config.metrics_export_path();
        match serde_json::to_vec_pretty(&value) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!("metrics export to {} failed: {}", path.display(), e);
                }
            }
            Err(e) => warn!("metrics export serialization failed: {}", e),
        }
    }
}
