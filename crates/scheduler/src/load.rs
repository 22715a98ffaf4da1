use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::trace;

const TREND_WINDOW: usize = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadTier {
    Normal,
    Throttle,
    Pause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub sampled_at: DateTime<Utc>,
    pub tier: LoadTier,
    /// Populated only when invasive probes are enabled.
    pub process_count: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct LoadThresholds {
    pub cpu_throttle: f32,
    pub cpu_pause: f32,
    pub memory_throttle: f32,
    pub memory_pause: f32,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            cpu_throttle: 80.0,
            cpu_pause: 90.0,
            memory_throttle: 85.0,
            memory_pause: 95.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadMonitorConfig {
    pub thresholds: LoadThresholds,
    pub sample_interval: Duration,
    pub throttle_delay: Duration,
    /// When set, samples also refresh the process table. More accurate
    /// trend data at a noticeably higher per-sample cost.
    pub invasive_probes: bool,
}

impl Default for LoadMonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: LoadThresholds::default(),
            sample_interval: Duration::from_secs(1),
            throttle_delay: Duration::from_millis(500),
            invasive_probes: false,
        }
    }
}

pub fn tier_for(cpu_percent: f32, memory_percent: f32, thresholds: &LoadThresholds) -> LoadTier {
    if cpu_percent > thresholds.cpu_pause || memory_percent > thresholds.memory_pause {
        LoadTier::Pause
    } else if cpu_percent > thresholds.cpu_throttle || memory_percent > thresholds.memory_throttle
    {
        LoadTier::Throttle
    } else {
        LoadTier::Normal
    }
}

struct MonitorState {
    latest: Option<LoadSample>,
    last_refresh: Option<Instant>,
    window: VecDeque<LoadSample>,
}

/// Samples CPU/memory and turns the readings into throttle/pause/worker
/// recommendations. Cheap enough to consult inline from the dispatch loop;
/// samples are reused within the configured interval.
pub struct LoadMonitor {
    config: LoadMonitorConfig,
    sys: Mutex<System>,
    state: Mutex<MonitorState>,
}

impl LoadMonitor {
    pub fn new(config: LoadMonitorConfig) -> Self {
        Self {
            config,
            sys: Mutex::new(System::new()),
            state: Mutex::new(MonitorState {
                latest: None,
                last_refresh: None,
                window: VecDeque::with_capacity(TREND_WINDOW),
            }),
        }
    }

    /// Takes a fresh sample unconditionally.
    pub fn sample(&self) -> LoadSample {
        let (cpu_percent, memory_percent, process_count) = {
            let mut sys = self.sys.lock();
            sys.refresh_cpu();
            sys.refresh_memory();
            let process_count = if self.config.invasive_probes {
                sys.refresh_processes();
                Some(sys.processes().len())
            } else {
                None
            };
            let cpu = sys.global_cpu_info().cpu_usage();
            let total = sys.total_memory();
            let memory = if total > 0 {
                (sys.used_memory() as f64 / total as f64 * 100.0) as f32
            } else {
                0.0
            };
            (cpu, memory, process_count)
        };

        let sample = LoadSample {
            cpu_percent,
            memory_percent,
            sampled_at: Utc::now(),
            tier: tier_for(cpu_percent, memory_percent, &self.config.thresholds),
            process_count,
        };
        trace!(
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            tier = ?sample.tier,
            "load sampled"
        );

        let mut state = self.state.lock();
        state.latest = Some(sample.clone());
        state.last_refresh = Some(Instant::now());
        if state.window.len() == TREND_WINDOW {
            state.window.pop_front();
        }
        state.window.push_back(sample.clone());
        sample
    }

    /// Latest sample, refreshed when older than the sampling interval.
    pub fn current(&self) -> LoadSample {
        {
            let state = self.state.lock();
            if let (Some(latest), Some(refreshed)) = (&state.latest, state.last_refresh) {
                if refreshed.elapsed() < self.config.sample_interval {
                    return latest.clone();
                }
            }
        }
        self.sample()
    }

    pub fn should_pause(&self) -> bool {
        self.current().tier == LoadTier::Pause
    }

    /// Per-task delay to insert before dequeuing while throttled.
    pub fn recommended_delay(&self) -> Duration {
        match self.current().tier {
            LoadTier::Throttle => self.config.throttle_delay,
            LoadTier::Normal | LoadTier::Pause => Duration::ZERO,
        }
    }

    /// Worker-count adjustment the current load supports: shrink under
    /// pressure, allow growth when comfortably idle.
    pub fn recommended_worker_delta(&self, current_workers: usize) -> i32 {
        let sample = self.current();
        match sample.tier {
            LoadTier::Pause | LoadTier::Throttle => {
                if current_workers > 1 {
                    -1
                } else {
                    0
                }
            }
            LoadTier::Normal => {
                if sample.cpu_percent < 50.0 && sample.memory_percent < 70.0 {
                    1
                } else {
                    0
                }
            }
        }
    }

    /// Recent samples, oldest first, for trend reporting.
    pub fn window(&self) -> Vec<LoadSample> {
        self.state.lock().window.iter().cloned().collect()
    }
}
