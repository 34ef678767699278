// Configuration Module
// Job configuration namespace and composable configuration steps

pub mod conf;
pub mod step;

// Re-export key types
pub use conf::{ConfDiff, JobConf};
pub use step::{ConfStep, StepFn};
