pub mod config;
pub mod engine;
pub mod metrics;
pub mod watch;

pub use config::{ConfigError, EngineConfig};
pub use engine::{CoreError, SubmitOutcome, WatchCoordinator};
pub use metrics::{MetricsRecorder, MetricsSnapshot};
pub use watch::{FsWatchService, WatchError};
