// Drover
// Composable job-pipeline orchestration: configuration steps, dual-identity
// distributed collections, multiplexed io, and stage-typed job graphs

pub mod config;
pub mod dux;
pub mod error;
pub mod graph;
pub mod io;
pub mod mux;
pub mod runtime;
pub mod task;

// Re-export the primary surface
pub use config::{ConfDiff, ConfStep, JobConf};
pub use dux::{BoundSink, DemuxHandle, DemuxSink, DemuxState};
pub use error::{DroverError, DroverResult};
pub use graph::{ExecutorConfig, GraphExecutor, JobNode, Stage};
pub use io::dseq::{DSeq, LocalSource};
pub use io::dsink::{DSink, LocalSink};
pub use io::format::{InputFormat, OutputFormat, Record, RecordReader, RecordWriter, Split};
pub use runtime::{ClusterRuntime, LocalRuntime};
pub use task::{Counter, MapFn, ReduceFn, TaskContext};
