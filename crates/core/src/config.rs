use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use vigil_cache::CacheConfig;
use vigil_engines::{CoordinatorConfig, ProcessEngineConfig};
use vigil_interfaces::ThreatLevel;
use vigil_policy::PreFilterConfig;
use vigil_quarantine::QuarantineConfig;
use vigil_scheduler::{LoadMonitorConfig, LoadThresholds, SchedulerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Full engine configuration. Every tunable has a sensible default so an
/// empty file is a valid configuration; `validate()` runs before the pool
/// starts and is fatal on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Roots watched for filesystem changes. May be empty for a purely
    /// on-demand deployment.
    pub watch_paths: Vec<PathBuf>,
    /// Base directory for the quarantine store, cache snapshot, and
    /// metrics exports.
    pub data_dir: PathBuf,
    pub debounce_ms: u64,
    pub cache: CacheSettings,
    pub prefilter: PreFilterSettings,
    pub engines: EngineSettings,
    pub scheduler: SchedulerSettings,
    pub load: LoadSettings,
    pub metrics: MetricsSettings,
    pub quarantine: QuarantineSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watch_paths: Vec::new(),
            data_dir: PathBuf::from("./data"),
            debounce_ms: 1_000,
            cache: CacheSettings::default(),
            prefilter: PreFilterSettings::default(),
            engines: EngineSettings::default(),
            scheduler: SchedulerSettings::default(),
            load: LoadSettings::default(),
            metrics: MetricsSettings::default(),
            quarantine: QuarantineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_hours: u64,
    pub capacity: usize,
    pub persist: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            capacity: 10_000,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreFilterSettings {
    pub max_file_size: u64,
    /// Overrides the built-in low-risk allow-list when non-empty.
    pub safe_extensions: Vec<String>,
}

impl Default for PreFilterSettings {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            safe_extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub signature_command: Option<PathBuf>,
    pub signature_args: Vec<String>,
    pub rule_command: Option<PathBuf>,
    pub rule_args: Vec<String>,
    pub classifier_command: Option<PathBuf>,
    pub classifier_args: Vec<String>,
    pub timeout_secs: u64,
    pub corroborate_signature_hits: bool,
    pub ml_suspicious_threshold: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            signature_command: None,
            signature_args: Vec::new(),
            rule_command: None,
            rule_args: Vec::new(),
            classifier_command: None,
            classifier_args: Vec::new(),
            timeout_secs: 60,
            corroborate_signature_hits: false,
            ml_suspicious_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub min_workers: usize,
    /// 0 means "derive from CPU count", always capped at 8.
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub boost_after_secs: u64,
    pub max_retries: u32,
    pub scale_up_depth: usize,
    pub scale_down_depth: usize,
    pub scale_cooldown_secs: u64,
    pub quarantine_threshold: ThreatLevel,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 0,
            queue_capacity: 1_000,
            boost_after_secs: 60,
            max_retries: 3,
            scale_up_depth: 50,
            scale_down_depth: 10,
            scale_cooldown_secs: 30,
            quarantine_threshold: ThreatLevel::Medium,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSettings {
    pub cpu_throttle_percent: f32,
    pub cpu_pause_percent: f32,
    pub memory_throttle_percent: f32,
    pub memory_pause_percent: f32,
    pub sample_interval_ms: u64,
    pub throttle_delay_ms: u64,
    pub invasive_probes: bool,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            cpu_throttle_percent: 80.0,
            cpu_pause_percent: 90.0,
            memory_throttle_percent: 85.0,
            memory_pause_percent: 95.0,
            sample_interval_ms: 1_000,
            throttle_delay_ms: 500,
            invasive_probes: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub snapshot_interval_secs: u64,
    pub export_interval_secs: u64,
    pub export: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 10,
            export_interval_secs: 300,
            export: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineSettings {
    /// Extra roots to protect beyond the built-in system directories.
    pub forbidden_roots: Vec<PathBuf>,
}

impl Default for QuarantineSettings {
    fn default() -> Self {
        Self {
            forbidden_roots: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".into()));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be > 0".into()));
        }
        if self.cache.ttl_hours == 0 {
            return Err(ConfigError::Invalid("cache.ttl_hours must be > 0".into()));
        }
        if self.prefilter.max_file_size == 0 {
            return Err(ConfigError::Invalid(
                "prefilter.max_file_size must be > 0".into(),
            ));
        }
        if self.engines.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "engines.timeout_secs must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.engines.ml_suspicious_threshold) {
            return Err(ConfigError::Invalid(
                "engines.ml_suspicious_threshold must be within [0, 1]".into(),
            ));
        }
        if self.scheduler.min_workers == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.min_workers must be >= 1".into(),
            ));
        }
        let max = self.effective_max_workers();
        if self.scheduler.min_workers > max {
            return Err(ConfigError::Invalid(format!(
                "scheduler.min_workers ({}) exceeds effective max workers ({})",
                self.scheduler.min_workers, max
            )));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.queue_capacity must be > 0".into(),
            ));
        }
        if self.scheduler.scale_down_depth >= self.scheduler.scale_up_depth {
            return Err(ConfigError::Invalid(
                "scheduler.scale_down_depth must be below scale_up_depth".into(),
            ));
        }
        for (name, throttle, pause) in [
            (
                "cpu",
                self.load.cpu_throttle_percent,
                self.load.cpu_pause_percent,
            ),
            (
                "memory",
                self.load.memory_throttle_percent,
                self.load.memory_pause_percent,
            ),
        ] {
            if !(0.0..=100.0).contains(&throttle) || !(0.0..=100.0).contains(&pause) {
                return Err(ConfigError::Invalid(format!(
                    "load.{} thresholds must be within [0, 100]",
                    name
                )));
            }
            if throttle > pause {
                return Err(ConfigError::Invalid(format!(
                    "load.{} throttle threshold must not exceed the pause threshold",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Max pool size: configured value if set, else CPU core count, always
    /// capped at 8.
    pub fn effective_max_workers(&self) -> usize {
        let configured = if self.scheduler.max_workers == 0 {
            num_cpus::get()
        } else {
            self.scheduler.max_workers
        };
        configured.min(8).max(1)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engines.timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.max(1))
    }

    pub fn cache_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("cache.json")
    }

    pub fn metrics_export_path(&self) -> PathBuf {
        self.data_dir.join("metrics.json")
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: ChronoDuration::hours(self.cache.ttl_hours as i64),
            capacity: self.cache.capacity,
        }
    }

    pub fn prefilter_config(&self) -> PreFilterConfig {
        let mut config = PreFilterConfig {
            max_file_size: self.prefilter.max_file_size,
            ..PreFilterConfig::default()
        };
        if !self.prefilter.safe_extensions.is_empty() {
            config.safe_extensions = self
                .prefilter
                .safe_extensions
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect();
        }
        config
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            corroborate_signature_hits: self.engines.corroborate_signature_hits,
            ml_suspicious_threshold: self.engines.ml_suspicious_threshold,
        }
    }

    pub fn process_engine_config(
        &self,
        command: &PathBuf,
        args: &[String],
    ) -> ProcessEngineConfig {
        ProcessEngineConfig {
            command: command.clone(),
            args: args.to_vec(),
            timeout: self.engine_timeout(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            min_workers: self.scheduler.min_workers,
            max_workers: self.effective_max_workers(),
            max_retries: self.scheduler.max_retries,
            scale_up_depth: self.scheduler.scale_up_depth,
            scale_down_depth: self.scheduler.scale_down_depth,
            scale_cooldown: Duration::from_secs(self.scheduler.scale_cooldown_secs),
            quarantine_threshold: self.scheduler.quarantine_threshold,
            // Drain waits out one engine timeout plus scheduling slack.
            drain_timeout: self.engine_timeout() + Duration::from_secs(10),
            ..SchedulerConfig::default()
        }
    }

    pub fn load_config(&self) -> LoadMonitorConfig {
        LoadMonitorConfig {
            thresholds: LoadThresholds {
                cpu_throttle: self.load.cpu_throttle_percent,
                cpu_pause: self.load.cpu_pause_percent,
                memory_throttle: self.load.memory_throttle_percent,
                memory_pause: self.load.memory_pause_percent,
            },
            sample_interval: Duration::from_millis(self.load.sample_interval_ms.max(1)),
            throttle_delay: Duration::from_millis(self.load.throttle_delay_ms),
            invasive_probes: self.load.invasive_probes,
        }
    }

    pub fn quarantine_config(&self) -> QuarantineConfig {
        let mut config = QuarantineConfig::new(self.data_dir.join("quarantine"));
        config
            .forbidden_roots
            .extend(self.quarantine.forbidden_roots.iter().cloned());
        config
    }
}
