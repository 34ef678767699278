// Distributed Sequence
// A configuration step wiring a job's input side, readable locally as one
// lazy concatenated sequence of records

use crate::config::{ConfStep, JobConf};
use crate::error::DroverResult;
use crate::io::format::{self, InputFormat, Record, RecordReader, Split};

use std::sync::Arc;

/// A distributed sequence
///
/// Pairs the configuration step that wires a job's input with the ability
/// to read the same data locally, without a cluster, by opening the input
/// format over each of its splits. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct DSeq {
    step: ConfStep,
}

impl DSeq {
    pub fn new(step: ConfStep) -> Self {
        Self { step }
    }

    /// The configuration step wiring this sequence into a job
    pub fn as_step(&self) -> ConfStep {
        self.step.clone()
    }

    /// Materialize a fresh configuration describing only this sequence
    pub fn conf(&self) -> DroverResult<JobConf> {
        let mut conf = JobConf::new();
        self.step.apply(&mut conf)?;
        Ok(conf)
    }

    /// Open a scoped local source over this sequence
    ///
    /// Splits are enumerated deterministically and their readers
    /// concatenated into one lazy sequence. Dropping the source releases
    /// every reader, even if iteration was abandoned early or an error
    /// occurred mid-read.
    pub fn open_local(&self) -> DroverResult<LocalSource> {
        let conf = self.conf()?;
        let input = format::resolve_input(&conf)?;
        let splits = input.list_splits(&conf)?;
        Ok(LocalSource {
            conf,
            input,
            splits: splits.into_iter(),
            current: None,
        })
    }

    /// Sequential local reduction: fold-left with an accumulator
    pub fn fold<A, F>(&self, init: A, mut f: F) -> DroverResult<A>
    where
        F: FnMut(A, Record) -> DroverResult<A>,
    {
        let mut source = self.open_local()?;
        let mut acc = init;
        for record in &mut source {
            acc = f(acc, record?)?;
        }
        Ok(acc)
    }

    /// Read every record into memory, in split order
    pub fn collect_local(&self) -> DroverResult<Vec<Record>> {
        self.fold(Vec::new(), |mut acc, record| {
            acc.push(record);
            Ok(acc)
        })
    }
}

/// Scoped local reader over a DSeq's splits
pub struct LocalSource {
    conf: JobConf,
    input: Arc<dyn InputFormat>,
    splits: std::vec::IntoIter<Split>,
    current: Option<Box<dyn RecordReader>>,
}

impl LocalSource {
    /// Release the active reader and any remaining splits
    ///
    /// Further iteration yields nothing. Dropping the source has the same
    /// effect.
    pub fn close(&mut self) {
        self.current = None;
        self.splits = Vec::new().into_iter();
    }
}

impl Iterator for LocalSource {
    type Item = DroverResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                match reader.next_record() {
                    Some(Ok(record)) => return Some(Ok(record)),
                    Some(Err(e)) => {
                        self.close();
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            let split = self.splits.next()?;
            match self.input.open_reader(&split, &self.conf) {
                Ok(reader) => self.current = Some(reader),
                Err(e) => {
                    self.close();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Drop for LocalSource {
    fn drop(&mut self) {
        self.close();
    }
}
