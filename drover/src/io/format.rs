// Format Traits & Registry
// Capability traits for split-based input and record-writer output, plus the
// static registry that resolves formats from serialized identifiers

use crate::config::JobConf;
use crate::error::{DroverError, DroverResult};

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key naming the input format of a job
pub const INPUT_FORMAT_KEY: &str = "drover.input.format";
/// Key naming the output format of a job
pub const OUTPUT_FORMAT_KEY: &str = "drover.output.format";
/// Key overriding the file basename of an output (used by demultiplexed
/// outputs to direct tuples at a destination file prefix)
pub const OUTPUT_BASENAME_KEY: &str = "drover.output.basename";

/// A key/value record
pub type Record = (Value, Value);

/// One unit of input data, with a format-specific serializable payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub data: Value,
}

impl Split {
    pub fn new(data: Value) -> Self {
        Self { data }
    }
}

/// Reader over the records of a single split
pub trait RecordReader: Send {
    fn next_record(&mut self) -> Option<DroverResult<Record>>;
}

/// Writer accepting key/value records; must be closed to publish its output
pub trait RecordWriter: Send {
    fn write(&mut self, key: &Value, value: &Value) -> DroverResult<()>;
    fn close(&mut self) -> DroverResult<()>;
}

/// Input side of a data format
pub trait InputFormat: Send + Sync {
    /// Enumerate the splits the configuration describes, in a
    /// deterministic order
    fn list_splits(&self, conf: &JobConf) -> DroverResult<Vec<Split>>;

    /// Open a record reader over one split
    fn open_reader(&self, split: &Split, conf: &JobConf) -> DroverResult<Box<dyn RecordReader>>;
}

/// Output side of a data format
pub trait OutputFormat: Send + Sync {
    /// Construct a record writer for the given (fully merged) configuration
    fn record_writer(&self, conf: &JobConf) -> DroverResult<Box<dyn RecordWriter>>;

    /// Paths this output will materialize under, if any
    fn output_paths(&self, conf: &JobConf) -> DroverResult<Vec<PathBuf>>;
}

// Formats are selected by serialized identifiers stored in the job
// configuration; dispatch is a static table lookup, never dynamic loading.
static INPUT_FORMATS: Lazy<DashMap<String, Arc<dyn InputFormat>>> = Lazy::new(|| {
    let formats: DashMap<String, Arc<dyn InputFormat>> = DashMap::new();
    formats.insert("mem".to_string(), Arc::new(crate::io::mem::MemInput));
    formats.insert("jsonl".to_string(), Arc::new(crate::io::jsonl::JsonlInput));
    formats.insert("mux".to_string(), Arc::new(crate::mux::MuxInput));
    formats
});

static OUTPUT_FORMATS: Lazy<DashMap<String, Arc<dyn OutputFormat>>> = Lazy::new(|| {
    let formats: DashMap<String, Arc<dyn OutputFormat>> = DashMap::new();
    formats.insert("mem".to_string(), Arc::new(crate::io::mem::MemOutput));
    formats.insert("jsonl".to_string(), Arc::new(crate::io::jsonl::JsonlOutput));
    formats.insert("null".to_string(), Arc::new(NullOutput));
    formats
});

/// Register a custom input format under an identifier
pub fn register_input_format(id: impl Into<String>, format: Arc<dyn InputFormat>) {
    INPUT_FORMATS.insert(id.into(), format);
}

/// Register a custom output format under an identifier
pub fn register_output_format(id: impl Into<String>, format: Arc<dyn OutputFormat>) {
    OUTPUT_FORMATS.insert(id.into(), format);
}

/// Look up an input format by identifier
pub fn input_format(id: &str) -> DroverResult<Arc<dyn InputFormat>> {
    INPUT_FORMATS
        .get(id)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| DroverError::config(INPUT_FORMAT_KEY, format!("unknown input format '{id}'")))
}

/// Look up an output format by identifier
pub fn output_format(id: &str) -> DroverResult<Arc<dyn OutputFormat>> {
    OUTPUT_FORMATS
        .get(id)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| {
            DroverError::config(OUTPUT_FORMAT_KEY, format!("unknown output format '{id}'"))
        })
}

/// Resolve the input format a configuration names
pub fn resolve_input(conf: &JobConf) -> DroverResult<Arc<dyn InputFormat>> {
    input_format(&conf.get::<String>(INPUT_FORMAT_KEY)?)
}

/// Resolve the output format a configuration names
pub fn resolve_output(conf: &JobConf) -> DroverResult<Arc<dyn OutputFormat>> {
    output_format(&conf.get::<String>(OUTPUT_FORMAT_KEY)?)
}

/// Output format that discards every record
///
/// Serves as the primary output of demultiplexed jobs, whose real writes go
/// through named sub-outputs.
pub struct NullOutput;

struct NullWriter;

impl RecordWriter for NullWriter {
    fn write(&mut self, _key: &Value, _value: &Value) -> DroverResult<()> {
        Ok(())
    }

    fn close(&mut self) -> DroverResult<()> {
        Ok(())
    }
}

impl OutputFormat for NullOutput {
    fn record_writer(&self, _conf: &JobConf) -> DroverResult<Box<dyn RecordWriter>> {
        Ok(Box::new(NullWriter))
    }

    fn output_paths(&self, _conf: &JobConf) -> DroverResult<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_format_is_config_error() {
        assert!(matches!(
            input_format("no-such-format"),
            Err(DroverError::Config { .. })
        ));
    }

    #[test]
    fn test_builtin_formats_resolve() {
        assert!(input_format("mem").is_ok());
        assert!(input_format("jsonl").is_ok());
        assert!(input_format("mux").is_ok());
        assert!(output_format("null").is_ok());
    }

    #[test]
    fn test_resolve_requires_format_key() {
        let conf = JobConf::new();
        assert!(resolve_input(&conf).is_err());
    }
}
