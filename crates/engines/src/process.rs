//! Process-boundary adapters for the external detection services.
//!
//! Each scanner is an opaque executable invoked per file with a bounded
//! timeout. The wire contract is line-oriented stdout:
//!
//! - signature scanner: `OK`, or `FOUND <threat-name>`
//! - rule scanner: zero or more lines of `<rule-id> <severity>`
//! - classifier: a single float in `[0, 1]`
//!
//! A non-zero exit status, a timeout, or unparseable output is a transient
//! engine failure; the scheduler owns the retry policy.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};
use vigil_interfaces::{
    EngineFailure, MlClassifier, RuleMatch, RuleScanner, Severity, SignatureReport,
    SignatureScanner,
};

const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ProcessEngineConfig {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            timeout: DEFAULT_ENGINE_TIMEOUT,
        }
    }
}

/// Runs the configured command with the target path appended, bounded by
/// the configured timeout, and returns trimmed stdout.
async fn run_engine(config: &ProcessEngineConfig, target: &Path) -> Result<String, EngineFailure> {
    debug!(
        command = %config.command.display(),
        target = %target.display(),
        "invoking detection engine"
    );

    let output = Command::new(&config.command)
        .args(&config.args)
        .arg(target)
        .kill_on_drop(true)
        .output();

    let output = match timeout(config.timeout, output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(EngineFailure::Unavailable(format!(
                "{}: {}",
                config.command.display(),
                e
            )))
        }
        Err(_) => {
            warn!(
                command = %config.command.display(),
                timeout_secs = config.timeout.as_secs(),
                "engine call timed out"
            );
            return Err(EngineFailure::Timeout);
        }
    };

    if !output.status.success() {
        return Err(EngineFailure::Unavailable(format!(
            "{} exited with {}",
            config.command.display(),
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub struct ProcessSignatureScanner {
    config: ProcessEngineConfig,
}

impl ProcessSignatureScanner {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SignatureScanner for ProcessSignatureScanner {
    async fn scan(&self, path: &Path) -> Result<SignatureReport, EngineFailure> {
        let stdout = run_engine(&self.config, path).await?;
        let first_line = stdout.lines().next().unwrap_or("");

        if first_line == "OK" {
            return Ok(SignatureReport {
                infected: false,
                threat_name: None,
            });
        }
        if let Some(name) = first_line.strip_prefix("FOUND ") {
            let name = name.trim();
            if name.is_empty() {
                return Err(EngineFailure::Protocol(
                    "FOUND line without a threat name".to_string(),
                ));
            }
            return Ok(SignatureReport {
                infected: true,
                threat_name: Some(name.to_string()),
            });
        }
        Err(EngineFailure::Protocol(format!(
            "unexpected signature output: {:?}",
            first_line
        )))
    }
}

pub struct ProcessRuleScanner {
    config: ProcessEngineConfig,
}

impl ProcessRuleScanner {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RuleScanner for ProcessRuleScanner {
    async fn scan(&self, path: &Path) -> Result<Vec<RuleMatch>, EngineFailure> {
        let stdout = run_engine(&self.config, path).await?;
        let mut matches = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let mut parts = line.split_whitespace();
            let (Some(rule_id), Some(severity)) = (parts.next(), parts.next()) else {
                return Err(EngineFailure::Protocol(format!(
                    "unexpected rule output line: {:?}",
                    line
                )));
            };
            let Some(severity) = Severity::parse(severity) else {
                return Err(EngineFailure::Protocol(format!(
                    "unknown rule severity: {:?}",
                    severity
                )));
            };
            matches.push(RuleMatch {
                rule_id: rule_id.to_string(),
                severity,
            });
        }
        Ok(matches)
    }
}

pub struct ProcessMlClassifier {
    config: ProcessEngineConfig,
}

impl ProcessMlClassifier {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MlClassifier for ProcessMlClassifier {
    async fn score(&self, path: &Path) -> Result<f64, EngineFailure> {
        let stdout = run_engine(&self.config, path).await?;
        let first_line = stdout.lines().next().unwrap_or("");
        let score: f64 = first_line
            .trim()
            .parse()
            .map_err(|_| EngineFailure::Protocol(format!("not a probability: {:?}", first_line)))?;
        if !(0.0..=1.0).contains(&score) {
            return Err(EngineFailure::Protocol(format!(
                "probability out of range: {}",
                score
            )));
        }
        Ok(score)
    }
}
