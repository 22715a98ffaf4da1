use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vigil_core::{EngineConfig, SubmitOutcome, WatchCoordinator};
use vigil_engines::EngineSet;
use vigil_interfaces::{
    EngineFailure, EngineKind, ScanEvent, SignatureReport, SignatureScanner, SkipReason, Verdict,
};

struct CountingSignature {
    infected: bool,
    threat_name: &'static str,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl SignatureScanner for CountingSignature {
    async fn scan(&self, _path: &Path) -> Result<SignatureReport, EngineFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SignatureReport {
            infected: self.infected,
            threat_name: self.infected.then(|| self.threat_name.to_string()),
        })
    }
}

struct Fixture {
    coordinator: Arc<WatchCoordinator>,
    signature_calls: Arc<AtomicUsize>,
    dir: tempfile::TempDir,
}

fn fixture(infected: bool, watch: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.data_dir = dir.path().join("data");
    config.quarantine.forbidden_roots = vec![dir.path().join("protected")];
    config.metrics.export = false;
    config.debounce_ms = 100;
    if watch {
        let watched = dir.path().join("watched");
        std::fs::create_dir_all(&watched).unwrap();
        config.watch_paths = vec![watched];
    }
    // Keep host load out of integration tests.
    config.load.cpu_throttle_percent = 100.0;
    config.load.cpu_pause_percent = 100.0;
    config.load.memory_throttle_percent = 100.0;
    config.load.memory_pause_percent = 100.0;

    let signature_calls = Arc::new(AtomicUsize::new(0));
    let engine_set = EngineSet {
        signature: Some(Arc::new(CountingSignature {
            infected,
            threat_name: "X",
            calls: Arc::clone(&signature_calls),
        })),
        rules: None,
        classifier: None,
    };
    let coordinator = WatchCoordinator::new(config, engine_set).unwrap();
    Fixture {
        coordinator,
        signature_calls,
        dir,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn write_sample(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, content).await.unwrap();
    path
}

// Scenario: a signature hit flows through the scheduler into quarantine
// with a record pointing back at the original path.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_infected_submission_ends_in_quarantine() {
    let f = fixture(true, false);
    let mut events = f.coordinator.subscribe_events();
    let sample = write_sample(f.dir.path(), "payload.exe", b"evil bytes").await;

    f.coordinator.start().await.unwrap();
    assert_eq!(
        f.coordinator.submit_path(&sample, None).await,
        SubmitOutcome::Queued
    );

    let quarantine = Arc::clone(&f.coordinator);
    wait_until(move || !quarantine.quarantine_records().is_empty()).await;
    f.coordinator.stop().await;

    let records = f.coordinator.quarantine_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].threat.name, "X");
    assert_eq!(
        records[0].original_path.file_name().unwrap(),
        sample.file_name().unwrap()
    );
    assert!(!sample.exists());

    let mut saw_threat = false;
    while let Ok(event) = events.try_recv() {
        if let ScanEvent::ThreatDetected { verdict, .. } = event {
            assert_eq!(
                verdict,
                Verdict::Infected {
                    threat_name: "X".to_string(),
                    detecting_engines: vec![EngineKind::Signature],
                }
            );
            saw_threat = true;
        }
    }
    assert!(saw_threat);
}

// Scenario: a .jpg submission is retired by the pre-filter with no task,
// no engine invocation, and one skip event in the metrics.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_safe_extension_short_circuits_before_engines() {
    let f = fixture(false, false);
    let sample = write_sample(f.dir.path(), "holiday.jpg", b"pixels").await;

    f.coordinator.start().await.unwrap();
    let outcome = f.coordinator.submit_path(&sample, None).await;
    assert_eq!(outcome, SubmitOutcome::Skipped(SkipReason::SafeExtension));
    assert_eq!(f.coordinator.queue_depth(), 0);

    // The skip lands in metrics via the async drain.
    let coordinator = Arc::clone(&f.coordinator);
    wait_until(move || coordinator.metrics_snapshot().scans_skipped == 1).await;
    f.coordinator.stop().await;

    assert_eq!(f.signature_calls.load(Ordering::SeqCst), 0);
}

// Scenario: a clean verdict is cached; re-submitting identical content
// short-circuits on CachedClean without invoking the engines again.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cached_clean_suppresses_second_scan() {
    let f = fixture(false, false);
    let sample = write_sample(f.dir.path(), "report.bin", b"clean content").await;

    f.coordinator.start().await.unwrap();
    assert_eq!(
        f.coordinator.submit_path(&sample, None).await,
        SubmitOutcome::Queued
    );

    let calls = Arc::clone(&f.signature_calls);
    wait_until(move || calls.load(Ordering::SeqCst) == 1).await;

    // The first task may still be marked in-flight for a moment after the
    // verdict lands; only CachedClean is an acceptable terminal outcome.
    let mut outcome = f.coordinator.submit_path(&sample, None).await;
    for _ in 0..100 {
        if outcome == SubmitOutcome::Skipped(SkipReason::CachedClean) {
            break;
        }
        assert_eq!(outcome, SubmitOutcome::Skipped(SkipReason::Duplicate));
        tokio::time::sleep(Duration::from_millis(20)).await;
        outcome = f.coordinator.submit_path(&sample, None).await;
    }
    assert_eq!(outcome, SubmitOutcome::Skipped(SkipReason::CachedClean));
    f.coordinator.stop().await;

    assert_eq!(f.signature_calls.load(Ordering::SeqCst), 1);
}

// Scenario: restoring a quarantined file re-submits it once at Immediate
// priority, even though its content is bit-identical to what was captured.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restore_triggers_exactly_one_rescan() {
    let f = fixture(true, false);
    let sample = write_sample(f.dir.path(), "comeback.exe", b"flagged bytes").await;

    f.coordinator.start().await.unwrap();
    f.coordinator.submit_path(&sample, None).await;
    let quarantine = Arc::clone(&f.coordinator);
    wait_until(move || !quarantine.quarantine_records().is_empty()).await;
    f.coordinator.stop().await;

    let record_id = f.coordinator.quarantine_records()[0].id.clone();
    let scans_before = f.signature_calls.load(Ordering::SeqCst);

    let mut events = f.coordinator.subscribe_events();
    let restored = f.coordinator.restore(&record_id).await.unwrap();
    assert!(restored.restored);
    assert!(restored.original_path.exists());

    // Exactly one fresh task was queued for the restored path.
    assert_eq!(f.coordinator.queue_depth(), 1);
    assert_eq!(
        f.coordinator
            .submit_path(&restored.original_path, None)
            .await,
        SubmitOutcome::Skipped(SkipReason::Duplicate)
    );
    assert_eq!(f.coordinator.queue_depth(), 1);

    let mut saw_restore = false;
    while let Ok(event) = events.try_recv() {
        if let ScanEvent::QuarantineAction { restored, .. } = event {
            assert!(restored);
            saw_restore = true;
        }
    }
    assert!(saw_restore);
    assert_eq!(f.signature_calls.load(Ordering::SeqCst), scans_before);
}

// Watch path: a file dropped into a watched root is picked up, debounced,
// scanned, and reported without any manual submission.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watched_root_drives_scans() {
    let f = fixture(false, true);
    let mut events = f.coordinator.subscribe_events();

    f.coordinator.start().await.unwrap();
    // Let the OS watcher arm before the drop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let watched = f.dir.path().join("watched");
    write_sample(&watched, "arrival.exe", b"new arrival").await;

    let calls = Arc::clone(&f.signature_calls);
    wait_until(move || calls.load(Ordering::SeqCst) >= 1).await;
    f.coordinator.stop().await;

    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        if let ScanEvent::ScanCompleted { path, verdict } = event {
            if path.file_name().and_then(|n| n.to_str()) == Some("arrival.exe") {
                assert_eq!(verdict, Verdict::Clean);
                saw_completed = true;
            }
        }
    }
    assert!(saw_completed);
}

// Cache generation invalidation survives the persistence cycle: a reload
// of the engines hides previously cached clean verdicts.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_reload_forces_rescan() {
    let f = fixture(false, false);
    let sample = write_sample(f.dir.path(), "stale.bin", b"content").await;

    f.coordinator.start().await.unwrap();
    f.coordinator.submit_path(&sample, None).await;
    let calls = Arc::clone(&f.signature_calls);
    wait_until(move || calls.load(Ordering::SeqCst) == 1).await;
    // Settle until the cached verdict is visible.
    let mut outcome = f.coordinator.submit_path(&sample, None).await;
    for _ in 0..100 {
        if outcome == SubmitOutcome::Skipped(SkipReason::CachedClean) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        outcome = f.coordinator.submit_path(&sample, None).await;
    }
    assert_eq!(outcome, SubmitOutcome::Skipped(SkipReason::CachedClean));

    f.coordinator.reload_engines();

    // Cached clean verdict is now generation-stale: the engine runs again.
    assert_eq!(
        f.coordinator.submit_path(&sample, None).await,
        SubmitOutcome::Queued
    );
    let calls = Arc::clone(&f.signature_calls);
    wait_until(move || calls.load(Ordering::SeqCst) == 2).await;
    f.coordinator.stop().await;
}
