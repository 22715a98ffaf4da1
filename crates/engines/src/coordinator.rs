use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vigil_interfaces::{
    EngineKind, ErrorReason, MlClassifier, RuleMatch, RuleScanner, Severity, SignatureScanner,
    Verdict,
};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Run the rule engine after a confirmed signature hit to enrich the
    /// verdict with corroborating matches. Off by default: a confirmed
    /// signature hit should reach quarantine with minimum latency.
    pub corroborate_signature_hits: bool,
    /// Classifier probability at or above which a file with no other
    /// findings is reported `Suspicious`.
    pub ml_suspicious_threshold: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            corroborate_signature_hits: false,
            ml_suspicious_threshold: 0.8,
        }
    }
}

/// The detection engines available to one coordinator. Any subset may be
/// configured; the coordinator degrades to whatever is present and healthy.
#[derive(Default, Clone)]
pub struct EngineSet {
    pub signature: Option<Arc<dyn SignatureScanner>>,
    pub rules: Option<Arc<dyn RuleScanner>>,
    pub classifier: Option<Arc<dyn MlClassifier>>,
}

/// Invokes the external engines in cost order and fuses their reports into
/// one confidence-ranked `Verdict`. Also owns the signature/rule-set
/// generation counter that keys cache validity.
pub struct EngineCoordinator {
    engines: EngineSet,
    config: CoordinatorConfig,
    generation: AtomicU64,
}

impl EngineCoordinator {
    pub fn new(engines: EngineSet, config: CoordinatorConfig) -> Self {
        Self {
            engines,
            config,
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advances the generation after a signature/rule-set update and
    /// returns the new value. Cached verdicts from earlier generations
    /// become stale by comparison.
    pub fn bump_generation(&self) -> u64 {
        let new = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(generation = new, "engine generation advanced");
        new
    }

    pub async fn scan(&self, path: &Path) -> Verdict {
        let mut usable_engines = 0usize;

        // Signature database first: cheapest and most definitive.
        if let Some(signature) = &self.engines.signature {
            match signature.scan(path).await {
                Ok(report) => {
                    usable_engines += 1;
                    if report.infected {
                        let threat_name = report
                            .threat_name
                            .unwrap_or_else(|| "unknown-threat".to_string());
                        let mut detecting_engines = vec![EngineKind::Signature];
                        if self.config.corroborate_signature_hits {
                            if let Some(matches) = self.try_rules(path).await {
                                if !matches.is_empty() {
                                    detecting_engines.push(EngineKind::Rules);
                                }
                            }
                        }
                        return Verdict::Infected {
                            threat_name,
                            detecting_engines,
                        };
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), "signature engine failed: {}", e);
                }
            }
        }

        // Heuristic rules next.
        let mut suspicious: Option<(Severity, Vec<String>)> = None;
        if let Some(matches) = self.try_rules(path).await {
            usable_engines += 1;
            if let Some(critical) = matches.iter().find(|m| m.severity == Severity::Critical) {
                return Verdict::Infected {
                    threat_name: critical.rule_id.clone(),
                    detecting_engines: vec![EngineKind::Rules],
                };
            }
            if let Some(max_severity) = matches.iter().map(|m| m.severity).max() {
                suspicious = Some((
                    max_severity,
                    matches.into_iter().map(|m| m.rule_id).collect(),
                ));
            }
        }

        // Classifier last: folds a probability into heuristic findings but
        // never overrides a definitive result.
        let mut confidence = None;
        if let Some(classifier) = &self.engines.classifier {
            match classifier.score(path).await {
                Ok(score) => {
                    usable_engines += 1;
                    confidence = Some(score);
                    if suspicious.is_none() && score >= self.config.ml_suspicious_threshold {
                        return Verdict::Suspicious {
                            severity: Severity::Medium,
                            matched_rules: Vec::new(),
                            confidence,
                        };
                    }
                }
                Err(e) => {
                    debug!(path = %path.display(), "classifier unavailable: {}", e);
                }
            }
        }

        if let Some((severity, matched_rules)) = suspicious {
            return Verdict::Suspicious {
                severity,
                matched_rules,
                confidence,
            };
        }

        if usable_engines == 0 {
            warn!(path = %path.display(), "no detection engines produced a result");
            return Verdict::Error {
                reason: ErrorReason::NoEnginesAvailable,
            };
        }

        Verdict::Clean
    }

    async fn try_rules(&self, path: &Path) -> Option<Vec<RuleMatch>> {
        let rules = self.engines.rules.as_ref()?;
        match rules.scan(path).await {
            Ok(matches) => Some(matches),
            Err(e) => {
                warn!(path = %path.display(), "rule engine failed: {}", e);
                None
            }
        }
    }
}
