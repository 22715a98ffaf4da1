pub mod engines;
pub mod events;
pub mod types;

pub use engines::{EngineFailure, MlClassifier, RuleScanner, SignatureScanner, SignatureReport};
pub use events::{MetricsEvent, MetricsSender, ScanEvent, ScanOutcomeKind};
pub use types::{
    EngineKind, ErrorReason, FsChange, FsEventKind, PriorityTier, RuleMatch, Severity, SkipReason,
    ThreatDescriptor, ThreatLevel, Verdict,
};
