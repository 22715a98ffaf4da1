use crate::types::RuleMatch;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Failure modes shared by all engine collaborators. Every variant is
/// transient from the scheduler's point of view: the task is retried, not
/// failed outright.
#[derive(Debug, Error)]
pub enum EngineFailure {
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("engine call timed out")]
    Timeout,
    #[error("engine returned malformed output: {0}")]
    Protocol(String),
}

/// What the signature scanner reports for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureReport {
    pub infected: bool,
    pub threat_name: Option<String>,
}

/// Known-threat detection via byte-pattern databases. Invoked as an
/// external service behind a bounded timeout.
#[async_trait]
pub trait SignatureScanner: Send + Sync {
    async fn scan(&self, path: &Path) -> Result<SignatureReport, EngineFailure>;
}

/// Heuristic/behavioral pattern engine (YARA-style rules).
#[async_trait]
pub trait RuleScanner: Send + Sync {
    async fn scan(&self, path: &Path) -> Result<Vec<RuleMatch>, EngineFailure>;
}

/// Statistical classifier returning a probability of maliciousness.
/// Optional collaborator; absence is tolerated.
#[async_trait]
pub trait MlClassifier: Send + Sync {
    async fn score(&self, path: &Path) -> Result<f64, EngineFailure>;
}
