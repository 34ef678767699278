// In-Memory Format
// Process-global record store used for test fixtures and local substitution

use crate::config::{ConfStep, JobConf};
use crate::error::{DroverError, DroverResult};
use crate::io::dseq::DSeq;
use crate::io::dsink::DSink;
use crate::io::format::{
    InputFormat, OutputFormat, Record, RecordReader, RecordWriter, Split, INPUT_FORMAT_KEY,
    OUTPUT_FORMAT_KEY,
};

use std::path::PathBuf;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::{json, Value};

/// Key naming the collection a mem input reads
pub const INPUT_ID_KEY: &str = "drover.mem.input.id";
/// Key naming the collection a mem output publishes into
pub const OUTPUT_ID_KEY: &str = "drover.mem.output.id";

static STORE: Lazy<DashMap<String, Vec<Record>>> = Lazy::new(DashMap::new);

/// Seed a collection with records
pub fn put(id: impl Into<String>, records: Vec<Record>) {
    STORE.insert(id.into(), records);
}

/// Snapshot of a collection's records
pub fn records(id: &str) -> Vec<Record> {
    STORE.get(id).map(|r| r.value().clone()).unwrap_or_default()
}

/// Drop a collection
pub fn clear(id: &str) {
    STORE.remove(id);
}

/// DSeq reading the named in-memory collection
pub fn dseq(id: impl Into<String>) -> DSeq {
    DSeq::new(ConfStep::params([
        (INPUT_FORMAT_KEY, Value::from("mem")),
        (INPUT_ID_KEY, Value::from(id.into())),
    ]))
}

/// DSink publishing into the named in-memory collection
pub fn dsink(id: impl Into<String>) -> DSink {
    let id = id.into();
    let step = ConfStep::params([
        (OUTPUT_FORMAT_KEY, Value::from("mem")),
        (OUTPUT_ID_KEY, Value::from(id.clone())),
    ]);
    DSink::new(step, dseq(id))
}

/// Input side of the in-memory format
pub struct MemInput;

struct MemReader {
    records: std::vec::IntoIter<Record>,
}

impl RecordReader for MemReader {
    fn next_record(&mut self) -> Option<DroverResult<Record>> {
        self.records.next().map(Ok)
    }
}

impl InputFormat for MemInput {
    fn list_splits(&self, conf: &JobConf) -> DroverResult<Vec<Split>> {
        let id: String = conf.get(INPUT_ID_KEY)?;
        Ok(vec![Split::new(json!({ "id": id }))])
    }

    fn open_reader(&self, split: &Split, _conf: &JobConf) -> DroverResult<Box<dyn RecordReader>> {
        let id = split
            .data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DroverError::resource("malformed mem split"))?;
        Ok(Box::new(MemReader {
            records: records(id).into_iter(),
        }))
    }
}

/// Output side of the in-memory format
///
/// Writers buffer locally and publish on close, so partially written output
/// is never observable through the store.
pub struct MemOutput;

struct MemWriter {
    id: String,
    buffer: Vec<Record>,
}

impl RecordWriter for MemWriter {
    fn write(&mut self, key: &Value, value: &Value) -> DroverResult<()> {
        self.buffer.push((key.clone(), value.clone()));
        Ok(())
    }

    fn close(&mut self) -> DroverResult<()> {
        let published = std::mem::take(&mut self.buffer);
        STORE
            .entry(self.id.clone())
            .or_default()
            .extend(published);
        Ok(())
    }
}

impl OutputFormat for MemOutput {
    fn record_writer(&self, conf: &JobConf) -> DroverResult<Box<dyn RecordWriter>> {
        let id: String = conf.get(OUTPUT_ID_KEY)?;
        Ok(Box::new(MemWriter {
            id,
            buffer: Vec::new(),
        }))
    }

    fn output_paths(&self, _conf: &JobConf) -> DroverResult<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}
