// Job Graph Module
// Stage-typed job nodes, dependency-graph construction, and the concurrent
// execution engine

pub mod executor;
pub mod node;

// Re-export key types
pub use executor::{ExecutorConfig, GraphExecutor};
pub use node::{JobNode, Stage};
