//! Race-resistant isolation of confirmed threats.
//!
//! The capture protocol validates a path fail-closed (no symlinks, regular
//! files only, nothing under forbidden system roots), then hashes and
//! moves the file through one open handle so a substitution between
//! validation and action is detected rather than silently followed. The
//! whole capture runs as a single blocking unit with no await points, so
//! pool shutdown can never leave a half-finished move behind.

use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use vigil_interfaces::ThreatDescriptor;

use crate::records::QuarantineRecord;

#[cfg(unix)]
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};

// EXDEV: rename attempted across filesystems.
const CROSS_DEVICE_ERRNO: i32 = 18;

const INDEX_FILE: &str = "quarantine-index.json";

#[derive(Debug, Error)]
pub enum QuarantineError {
    #[error("security violation: {0}")]
    SecurityViolation(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already restored: {0}")]
    AlreadyRestored(String),
    #[error("restore target already exists: {0}")]
    TargetExists(PathBuf),
    #[error("copy integrity check failed")]
    IntegrityMismatch,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct QuarantineConfig {
    pub store_dir: PathBuf,
    /// Roots the manager refuses to quarantine from, resolved paths.
    pub forbidden_roots: Vec<PathBuf>,
}

impl QuarantineConfig {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            forbidden_roots: default_forbidden_roots(),
        }
    }
}

fn default_forbidden_roots() -> Vec<PathBuf> {
    [
        "/boot", "/dev", "/proc", "/sys", "/run", "/etc", "/bin", "/sbin", "/lib", "/lib64",
        "/usr",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

/// Owns the quarantine store directory and its record index.
pub struct QuarantineManager {
    config: QuarantineConfig,
    index_path: PathBuf,
    index: Mutex<Vec<QuarantineRecord>>,
}

impl QuarantineManager {
    /// Opens (or creates) the store, restricts its permissions, reloads
    /// the record index, and re-verifies every unrestored payload. Runs on
    /// every startup: the permission clamp is re-applied, not trusted.
    pub fn open(config: QuarantineConfig) -> Result<Arc<Self>, QuarantineError> {
        fs::create_dir_all(&config.store_dir)?;
        restrict_store_dir(&config.store_dir)?;

        let index_path = config.store_dir.join(INDEX_FILE);
        let index = load_index(&index_path);

        for record in index.iter().filter(|r| !r.restored) {
            if !record.stored_path.exists() {
                warn!(
                    record = %record.id,
                    payload = %record.stored_path.display(),
                    "quarantined payload missing from store"
                );
                continue;
            }
            if let Err(e) = restrict_payload(&record.stored_path) {
                warn!(record = %record.id, "failed to re-apply payload permissions: {}", e);
            }
        }

        Ok(Arc::new(Self {
            config,
            index_path,
            index: Mutex::new(index),
        }))
    }

    /// Moves a confirmed threat into the store and records it. Fails
    /// closed on anything that is not a plain regular file in an allowed
    /// location.
    pub async fn quarantine(
        &self,
        path: &Path,
        threat: ThreatDescriptor,
    ) -> Result<QuarantineRecord, QuarantineError> {
        if path.starts_with(&self.config.store_dir) {
            return Err(QuarantineError::SecurityViolation(
                "refusing to quarantine inside the quarantine store".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let original = path.to_path_buf();
        let stored_path = self.config.store_dir.join(format!("{}.quar", id));
        let forbidden = self.config.forbidden_roots.clone();

        let capture_original = original.clone();
        let capture_dest = stored_path.clone();
        let (content_hash, canonical_original) =
            tokio::task::spawn_blocking(move || capture(&capture_original, &capture_dest, &forbidden))
                .await
                .map_err(|e| QuarantineError::Internal(e.to_string()))??;

        let record = QuarantineRecord {
            id: id.clone(),
            content_hash,
            original_path: canonical_original,
            stored_path,
            threat,
            captured_at: Utc::now(),
            restored: false,
        };

        self.index.lock().push(record.clone());
        self.persist_index().await?;

        info!(
            record = %record.id,
            original = %record.original_path.display(),
            threat = %record.threat.name,
            "file quarantined"
        );
        Ok(record)
    }

    /// Moves a quarantined payload back to its original path and flips the
    /// `restored` flag. Does not rescan; the watch coordinator re-submits
    /// the restored path as a fresh arrival.
    pub async fn restore(&self, record_id: &str) -> Result<QuarantineRecord, QuarantineError> {
        let record = {
            let index = self.index.lock();
            let record = index
                .iter()
                .find(|r| r.id == record_id)
                .ok_or_else(|| QuarantineError::NotFound(record_id.to_string()))?;
            if record.restored {
                return Err(QuarantineError::AlreadyRestored(record_id.to_string()));
            }
            record.clone()
        };

        let stored = record.stored_path.clone();
        let target = record.original_path.clone();
        let expected_hash = record.content_hash.clone();
        tokio::task::spawn_blocking(move || release(&stored, &target, &expected_hash))
            .await
            .map_err(|e| QuarantineError::Internal(e.to_string()))??;

        let restored = {
            let mut index = self.index.lock();
            let entry = index
                .iter_mut()
                .find(|r| r.id == record_id)
                .ok_or_else(|| QuarantineError::NotFound(record_id.to_string()))?;
            entry.restored = true;
            entry.clone()
        };
        self.persist_index().await?;

        info!(
            record = %restored.id,
            target = %restored.original_path.display(),
            "quarantined file restored"
        );
        Ok(restored)
    }

    pub fn records(&self) -> Vec<QuarantineRecord> {
        self.index.lock().clone()
    }

    pub fn get(&self, record_id: &str) -> Option<QuarantineRecord> {
        self.index.lock().iter().find(|r| r.id == record_id).cloned()
    }

    async fn persist_index(&self) -> Result<(), QuarantineError> {
        let snapshot = self.index.lock().clone();
        let content = serde_json::to_string_pretty(&snapshot)?;
        let tmp = self.index_path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.index_path).await?;
        Ok(())
    }
}

fn load_index(path: &Path) -> Vec<QuarantineRecord> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("failed to read quarantine index {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(records) => records,
        Err(e) => {
            warn!(
                "quarantine index {} is corrupt, starting empty: {}",
                path.display(),
                e
            );
            Vec::new()
        }
    }
}

/// Validate, hash, and move one file into the store. Returns the content
/// hash and the canonical original path. No await points: once the move
/// begins it runs to completion or is rolled back.
fn capture(
    original: &Path,
    dest: &Path,
    forbidden: &[PathBuf],
) -> Result<(String, PathBuf), QuarantineError> {
    let lstat = fs::symlink_metadata(original)?;
    if lstat.file_type().is_symlink() {
        return Err(QuarantineError::SecurityViolation(format!(
            "refusing to quarantine symlink {}",
            original.display()
        )));
    }
    if !lstat.is_file() {
        return Err(QuarantineError::SecurityViolation(format!(
            "{} is not a regular file",
            original.display()
        )));
    }

    let canonical = fs::canonicalize(original)?;
    for root in forbidden {
        if canonical.starts_with(root) {
            return Err(QuarantineError::SecurityViolation(format!(
                "{} is under forbidden root {}",
                canonical.display(),
                root.display()
            )));
        }
    }

    // Everything from here operates on this handle, not the path.
    let mut file = File::open(&canonical)?;
    let handle_meta = file.metadata()?;
    if !handle_meta.is_file() {
        return Err(QuarantineError::SecurityViolation(format!(
            "opened handle for {} is not a regular file",
            canonical.display()
        )));
    }
    #[cfg(unix)]
    let source_ino = handle_meta.ino();

    let hash = hash_reader(&mut file)?;

    match fs::rename(&canonical, dest) {
        Ok(()) => {
            // The rename went by path. Confirm the moved inode is the one
            // we hashed; a substitution in between is rolled back.
            #[cfg(unix)]
            {
                let dest_meta = fs::symlink_metadata(dest)?;
                if dest_meta.ino() != source_ino {
                    let _ = fs::rename(dest, &canonical);
                    return Err(QuarantineError::SecurityViolation(format!(
                        "{} was substituted during quarantine",
                        canonical.display()
                    )));
                }
            }
        }
        Err(e) if e.raw_os_error() == Some(CROSS_DEVICE_ERRNO) => {
            copy_across_filesystems(&mut file, &canonical, dest, &hash)?;
        }
        Err(e) => return Err(e.into()),
    }

    restrict_payload(dest)?;
    Ok((hash, canonical))
}

/// Cross-filesystem fallback: copy through the validated handle, re-hash
/// the copy, and only then remove the source.
fn copy_across_filesystems(
    source: &mut File,
    source_path: &Path,
    dest: &Path,
    expected_hash: &str,
) -> Result<(), QuarantineError> {
    source.seek(SeekFrom::Start(0))?;

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut dest_file = options.open(dest)?;

    io::copy(source, &mut dest_file)?;
    dest_file.sync_all()?;
    drop(dest_file);

    let mut copied = File::open(dest)?;
    let copied_hash = hash_reader(&mut copied)?;
    if copied_hash != expected_hash {
        let _ = fs::remove_file(dest);
        return Err(QuarantineError::IntegrityMismatch);
    }

    fs::remove_file(source_path)?;
    Ok(())
}

/// Move a payload out of the store, with the same cross-filesystem
/// fallback and integrity re-check as capture.
fn release(stored: &Path, target: &Path, expected_hash: &str) -> Result<(), QuarantineError> {
    if target.exists() {
        return Err(QuarantineError::TargetExists(target.to_path_buf()));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(stored, target) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(CROSS_DEVICE_ERRNO) => {
            let mut source = File::open(stored)?;
            copy_across_filesystems(&mut source, stored, target, expected_hash)
        }
        Err(e) => Err(e.into()),
    }
}

fn hash_reader(reader: &mut impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn restrict_store_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

fn restrict_payload(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
