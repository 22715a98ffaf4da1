pub mod coordinator;
pub mod process;

pub use coordinator::{CoordinatorConfig, EngineCoordinator, EngineSet};
pub use process::{ProcessEngineConfig, ProcessMlClassifier, ProcessRuleScanner, ProcessSignatureScanner};
