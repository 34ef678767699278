// Distributed Sink
// A configuration step wiring a job's output side, with a mirror sequence
// of what will have been written and direct local-write capability

use crate::config::{ConfStep, JobConf};
use crate::error::{DroverError, DroverResult};
use crate::io::dseq::DSeq;
use crate::io::format::{self, RecordWriter};

use serde_json::Value;
use tracing::warn;

/// A distributed sink
///
/// Pairs the configuration step that wires a job's output with the mirror
/// DSeq representing the data that will exist once a job using this sink
/// completes. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct DSink {
    step: ConfStep,
    mirror: DSeq,
}

impl DSink {
    pub fn new(step: ConfStep, mirror: DSeq) -> Self {
        Self { step, mirror }
    }

    /// The configuration step wiring this sink into a job
    pub fn as_step(&self) -> ConfStep {
        self.step.clone()
    }

    /// The dseq of what will have been written through this sink
    pub fn mirror(&self) -> DSeq {
        self.mirror.clone()
    }

    /// Materialize a fresh configuration describing only this sink
    pub fn conf(&self) -> DroverResult<JobConf> {
        let mut conf = JobConf::new();
        self.step.apply(&mut conf)?;
        Ok(conf)
    }

    /// Open a scoped local destination for direct writing
    ///
    /// Used both to materialize test fixtures and, inside a running task,
    /// to write real output. The sink must be explicitly closed; writing
    /// after close is an error.
    pub fn open_local(&self) -> DroverResult<LocalSink> {
        let conf = self.conf()?;
        let output = format::resolve_output(&conf)?;
        let writer = output.record_writer(&conf)?;
        Ok(LocalSink {
            writer: Some(writer),
        })
    }
}

/// Scoped local destination accepting key/value tuples
pub struct LocalSink {
    writer: Option<Box<dyn RecordWriter>>,
}

impl LocalSink {
    /// Write one record
    pub fn write(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> DroverResult<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(&key.into(), &value.into()),
            None => Err(DroverError::resource("write to a closed local sink")),
        }
    }

    /// Close the sink, publishing its output; repeated closes are no-ops
    pub fn close(&mut self) -> DroverResult<()> {
        match self.writer.take() {
            Some(mut writer) => writer.close(),
            None => Ok(()),
        }
    }
}

impl Drop for LocalSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.close() {
                warn!(error = %e, "local sink dropped without close; close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mem;
    use serde_json::json;

    #[test]
    fn test_write_after_close_is_an_error() {
        let id = "dsink-closed";
        mem::clear(id);

        let mut sink = mem::dsink(id).open_local().unwrap();
        sink.write(json!("a"), json!(1)).unwrap();
        sink.close().unwrap();

        let err = sink.write(json!("b"), json!(2)).unwrap_err();
        assert!(matches!(err, DroverError::Resource(_)));
        // The close already published; nothing further arrived
        assert_eq!(mem::records(id).len(), 1);
        mem::clear(id);
    }

    #[test]
    fn test_mirror_reads_what_was_written() {
        let id = "dsink-mirror";
        mem::clear(id);

        let sink = mem::dsink(id);
        let mut local = sink.open_local().unwrap();
        local.write(json!("k"), json!("v")).unwrap();
        local.close().unwrap();

        let read = sink.mirror().collect_local().unwrap();
        assert_eq!(read, vec![(json!("k"), json!("v"))]);
        mem::clear(id);
    }
}
