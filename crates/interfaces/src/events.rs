use crate::types::{PriorityTier, SkipReason, Verdict};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// How a finished scan turned out, for metrics aggregation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcomeKind {
    Clean,
    Suspicious,
    Infected,
    Failed,
}

impl From<&Verdict> for ScanOutcomeKind {
    fn from(verdict: &Verdict) -> Self {
        match verdict {
            Verdict::Clean => ScanOutcomeKind::Clean,
            Verdict::Suspicious { .. } => ScanOutcomeKind::Suspicious,
            Verdict::Infected { .. } => ScanOutcomeKind::Infected,
            Verdict::Error { .. } => ScanOutcomeKind::Failed,
        }
    }
}

/// Passive observability samples emitted by every component. Delivery is
/// non-blocking; a slow or absent recorder never stalls the scan path.
#[derive(Debug, Clone)]
pub enum MetricsEvent {
    ScanFinished {
        duration: Duration,
        outcome: ScanOutcomeKind,
    },
    ScanSkipped {
        reason: SkipReason,
    },
    CacheLookup {
        hit: bool,
    },
    TaskDropped {
        tier: PriorityTier,
    },
    TaskRetried,
    TaskFailedPermanently,
    PoolScaled {
        from: usize,
        to: usize,
    },
    QuarantineCaptured,
    QuarantineRestored,
}

/// Events broadcast to the external GUI/alerting layer. Fire-and-forget:
/// lagging consumers lose oldest events rather than blocking the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    ThreatDetected {
        path: PathBuf,
        verdict: Verdict,
    },
    ScanCompleted {
        path: PathBuf,
        verdict: Verdict,
    },
    QuarantineAction {
        record_id: String,
        path: PathBuf,
        restored: bool,
    },
    ScanError {
        path: PathBuf,
        reason: String,
    },
}

/// Handle components use to report metrics events.
#[derive(Clone)]
pub struct MetricsSender {
    tx: mpsc::UnboundedSender<MetricsEvent>,
}

impl MetricsSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MetricsEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Best-effort emit. A dropped recorder is not an error.
    pub fn emit(&self, event: MetricsEvent) {
        let _ = self.tx.send(event);
    }
}
