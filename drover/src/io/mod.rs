// I/O Module
// Format traits, the format registry, built-in formats, and the
// distributed-sequence / distributed-sink abstractions

pub mod dseq;
pub mod dsink;
pub mod format;
pub mod jsonl;
pub mod mem;

// Re-export key types
pub use dseq::{DSeq, LocalSource};
pub use dsink::{DSink, LocalSink};
pub use format::{
    input_format, output_format, register_input_format, register_output_format, InputFormat,
    OutputFormat, Record, RecordReader, RecordWriter, Split,
};
