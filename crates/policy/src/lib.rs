pub mod classifier;
pub mod prefilter;

pub use classifier::classify;
pub use prefilter::{InflightSet, PreFilter, PreFilterConfig, ScanDecision};
