use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use vigil_interfaces::ThreatDescriptor;

/// One isolated file. Created atomically with the move into the store;
/// immutable afterwards except for the `restored` flag. The original path
/// is a back-reference only; the store owns the quarantined bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantineRecord {
    pub id: String,
    pub content_hash: String,
    pub original_path: PathBuf,
    pub stored_path: PathBuf,
    pub threat: ThreatDescriptor,
    pub captured_at: DateTime<Utc>,
    pub restored: bool,
}
