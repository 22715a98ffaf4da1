use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Scan priority assigned by the path classifier. Ordering matters:
/// `Low < Normal < High < Immediate`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Low,
    Normal,
    High,
    Immediate,
}

impl PriorityTier {
    /// One step toward `Immediate`. `Immediate` stays `Immediate`.
    pub fn boosted(self) -> Self {
        match self {
            PriorityTier::Low => PriorityTier::Normal,
            PriorityTier::Normal => PriorityTier::High,
            PriorityTier::High | PriorityTier::Immediate => PriorityTier::Immediate,
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PriorityTier::Low => "low",
            PriorityTier::Normal => "normal",
            PriorityTier::High => "high",
            PriorityTier::Immediate => "immediate",
        };
        f.write_str(s)
    }
}

/// Severity attached to a rule match by the rule-matching engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Detection engine identity, recorded on verdicts that name their source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Signature,
    Rules,
    Classifier,
}

/// A single rule hit reported by the rule-matching engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleMatch {
    pub rule_id: String,
    pub severity: Severity,
}

/// Why a scan produced no usable verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    NoEnginesAvailable,
    Timeout,
    Io(String),
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::NoEnginesAvailable => f.write_str("no detection engines available"),
            ErrorReason::Timeout => f.write_str("engine call timed out"),
            ErrorReason::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

/// Fused scan result. Closed sum type, matched exhaustively at every
/// consumer; `Infected` always names at least one contributing engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Clean,
    Suspicious {
        severity: Severity,
        matched_rules: Vec<String>,
        confidence: Option<f64>,
    },
    Infected {
        threat_name: String,
        detecting_engines: Vec<EngineKind>,
    },
    Error {
        reason: ErrorReason,
    },
}

impl Verdict {
    /// Definitive verdicts are cacheable; `Suspicious` and `Error` are not.
    pub fn is_definitive(&self) -> bool {
        matches!(self, Verdict::Clean | Verdict::Infected { .. })
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Verdict::Clean)
    }

    /// Graduated threat level per the fusion policy: a signature hit
    /// corroborated by rules (or a critical rule alone) is critical, a
    /// signature hit alone is high, heuristic-only detections rank lower.
    pub fn threat_level(&self) -> Option<ThreatLevel> {
        match self {
            Verdict::Infected {
                detecting_engines, ..
            } => {
                // Rule involvement (corroboration or a critical rule hit)
                // escalates to critical; a signature hit alone ranks high.
                if detecting_engines.contains(&EngineKind::Rules) {
                    Some(ThreatLevel::Critical)
                } else {
                    Some(ThreatLevel::High)
                }
            }
            Verdict::Suspicious { severity, .. } => {
                if *severity >= Severity::High {
                    Some(ThreatLevel::Medium)
                } else {
                    Some(ThreatLevel::Low)
                }
            }
            Verdict::Clean | Verdict::Error { .. } => None,
        }
    }
}

/// Overall threat level attached to quarantine records and alerts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// What the engine knows about a threat when handing a file to quarantine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatDescriptor {
    pub name: String,
    pub level: ThreatLevel,
    pub detecting_engines: Vec<EngineKind>,
}

impl ThreatDescriptor {
    /// Build a descriptor from a positive verdict. Returns `None` for
    /// `Clean` and `Error` verdicts, which never reach quarantine.
    pub fn from_verdict(verdict: &Verdict) -> Option<Self> {
        let level = verdict.threat_level()?;
        match verdict {
            Verdict::Infected {
                threat_name,
                detecting_engines,
            } => Some(Self {
                name: threat_name.clone(),
                level,
                detecting_engines: detecting_engines.clone(),
            }),
            Verdict::Suspicious { matched_rules, .. } => Some(Self {
                name: matched_rules
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "heuristic-detection".to_string()),
                level,
                detecting_engines: vec![EngineKind::Rules],
            }),
            _ => None,
        }
    }
}

/// Reason the pre-filter skipped a path without scanning it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Missing,
    SafeExtension,
    Duplicate,
    TooLarge,
    CachedClean,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::Missing => "missing",
            SkipReason::SafeExtension => "safe_extension",
            SkipReason::Duplicate => "duplicate",
            SkipReason::TooLarge => "too_large",
            SkipReason::CachedClean => "cached_clean",
        };
        f.write_str(s)
    }
}

/// Filesystem change kinds the watch source reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FsEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// A debounced filesystem change handed to the pre-filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FsChange {
    pub path: PathBuf,
    pub kind: FsEventKind,
    pub observed_at: DateTime<Utc>,
}
