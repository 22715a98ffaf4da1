pub mod manager;
pub mod records;

pub use manager::{QuarantineConfig, QuarantineError, QuarantineManager};
pub use records::QuarantineRecord;
