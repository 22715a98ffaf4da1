//! Filesystem watch ingestion.
//!
//! A thin bridge from `notify`'s callback thread into tokio: raw events
//! land on an unbounded channel, a debounce task coalesces rapid repeated
//! events for the same path within the configured window, and the
//! coalesced changes flow to the coordinator. Ingestion never blocks on
//! worker availability.

use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vigil_interfaces::{FsChange, FsEventKind};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch setup failed: {0}")]
    Notify(#[from] notify::Error),
}

struct PendingChange {
    kind: FsEventKind,
    first_seen: Instant,
}

/// Watches a set of roots and forwards debounced changes to `out`.
pub struct FsWatchService {
    watcher: Mutex<Option<RecommendedWatcher>>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
}

impl FsWatchService {
    pub fn start(
        roots: &[PathBuf],
        debounce: Duration,
        out: mpsc::UnboundedSender<FsChange>,
    ) -> Result<Self, WatchError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        })?;
        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            debug!(root = %root.display(), "watching filesystem root");
        }

        let task = tokio::spawn(debounce_loop(raw_rx, debounce, out));

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            debounce_task: Mutex::new(Some(task)),
        })
    }

    pub fn stop(&self) {
        // Dropping the watcher also drops the raw sender, which lets the
        // debounce task drain and exit on its own.
        self.watcher.lock().take();
        if let Some(task) = self.debounce_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for FsWatchService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn map_event_kind(kind: &EventKind) -> Option<FsEventKind> {
    match kind {
        EventKind::Create(_) => Some(FsEventKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FsEventKind::Moved),
        EventKind::Modify(_) => Some(FsEventKind::Modified),
        EventKind::Remove(_) => Some(FsEventKind::Deleted),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => Some(FsEventKind::Modified),
    }
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    debounce: Duration,
    out: mpsc::UnboundedSender<FsChange>,
) {
    let tick = debounce.checked_div(4).unwrap_or(debounce).max(Duration::from_millis(50));
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut pending: HashMap<PathBuf, PendingChange> = HashMap::new();

    loop {
        tokio::select! {
            raw = raw_rx.recv() => {
                match raw {
                    Some(Ok(event)) => absorb(&mut pending, &event),
                    Some(Err(e)) => warn!("filesystem watch error: {}", e),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                flush_expired(&mut pending, debounce, &out);
            }
        }
    }
    // Watcher gone: flush whatever is left.
    flush_expired(&mut pending, Duration::ZERO, &out);
}

fn absorb(pending: &mut HashMap<PathBuf, PendingChange>, event: &Event) {
    let Some(kind) = map_event_kind(&event.kind) else {
        return;
    };
    for path in &event.paths {
        match pending.get_mut(path) {
            Some(existing) => {
                // Coalesce: the latest kind wins, the window anchors to the
                // first event in the burst.
                existing.kind = kind;
            }
            None => {
                pending.insert(
                    path.clone(),
                    PendingChange {
                        kind,
                        first_seen: Instant::now(),
                    },
                );
            }
        }
    }
}

fn flush_expired(
    pending: &mut HashMap<PathBuf, PendingChange>,
    debounce: Duration,
    out: &mpsc::UnboundedSender<FsChange>,
) {
    let expired: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, change)| change.first_seen.elapsed() >= debounce)
        .map(|(path, _)| path.clone())
        .collect();
    for path in expired {
        if let Some(change) = pending.remove(&path) {
            let _ = out.send(FsChange {
                path,
                kind: change.kind,
                observed_at: chrono::Utc::now(),
            });
        }
    }
}

/// Recursive sweep of a directory tree, used for the initial scan and
/// on-demand sweeps. Returns regular files only.
pub fn collect_files(root: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(entry.into_path()),
            Ok(_) => None,
            Err(e) => {
                debug!("sweep skipped unreadable entry: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_reports_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = FsWatchService::start(
            &[dir.path().to_path_buf()],
            Duration::from_millis(100),
            tx,
        )
        .unwrap();

        // Give the OS watcher a moment to arm before writing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::fs::write(dir.path().join("incoming.bin"), b"payload")
            .await
            .unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change reported")
            .expect("channel closed");
        assert_eq!(
            change.path.file_name().unwrap().to_str().unwrap(),
            "incoming.bin"
        );
        service.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rapid_events_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = FsWatchService::start(
            &[dir.path().to_path_buf()],
            Duration::from_millis(300),
            tx,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let target = dir.path().join("busy.bin");
        for i in 0..5u8 {
            tokio::fs::write(&target, [i]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change reported")
            .expect("channel closed");
        assert_eq!(first.path, target);

        // The burst collapsed into one change; nothing further arrives
        // within another debounce window.
        let second = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(second.is_err(), "burst was not coalesced: {:?}", second);
        service.stop();
    }

    #[test]
    fn test_event_kind_mapping() {
        use notify::event::{CreateKind, RemoveKind};
        assert_eq!(
            map_event_kind(&EventKind::Create(CreateKind::File)),
            Some(FsEventKind::Created)
        );
        assert_eq!(
            map_event_kind(&EventKind::Remove(RemoveKind::File)),
            Some(FsEventKind::Deleted)
        );
        assert_eq!(
            map_event_kind(&EventKind::Access(notify::event::AccessKind::Read)),
            None
        );
    }

    #[test]
    fn test_collect_files_finds_regular_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.bin"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b.bin"), b"b").unwrap();

        let mut files = collect_files(dir.path());
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.is_file()));
    }
}
