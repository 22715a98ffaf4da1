pub mod load;
pub mod pool;
pub mod queue;

pub use load::{LoadMonitor, LoadMonitorConfig, LoadSample, LoadThresholds, LoadTier};
pub use pool::{PoolPhase, ScanScheduler, SchedulerConfig, WorkerPoolState};
pub use queue::{ScanTask, TaskQueue};
