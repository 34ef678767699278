// Demultiplexer
// Lets one task write to many independently-configured named outputs
// sharing a single job, each carrying only its diff against the base

use crate::config::{ConfDiff, ConfStep, JobConf};
use crate::error::{DroverError, DroverResult};
use crate::io::format::{self, RecordWriter, OUTPUT_BASENAME_KEY};
use crate::task::{Counter, TaskContext};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

/// Key holding the serialized map of named output diffs
pub const OUTPUTS_KEY: &str = "drover.dux.outputs";
/// Counter group under which per-name record counters are reported
pub const COUNTER_GROUP: &str = "drover.dux";

const BOOKKEEPING_PREFIX: &str = "drover.dux.";

/// Register a named output on a job configuration
///
/// Clones the base, applies `substep` to the clone, and stores the
/// resulting diff (bookkeeping keys excluded) under `name`. Outputs
/// registered on one job never need to share formats or key/value shapes.
pub fn add_output(conf: &mut JobConf, name: &str, substep: &ConfStep) -> DroverResult<()> {
    let mut derived = conf.clone();
    substep.apply(&mut derived)?;
    let mut diff = conf.diff(&derived);
    diff.retain(|key, _| !key.starts_with(BOOKKEEPING_PREFIX));

    let mut outputs: BTreeMap<String, ConfDiff> = conf.get_opt(OUTPUTS_KEY)?.unwrap_or_default();
    outputs.insert(name.to_string(), diff);
    conf.set(OUTPUTS_KEY, serde_json::to_value(&outputs)?);
    Ok(())
}

/// Configuration step registering several named outputs at once
pub fn outputs_step(outputs: Vec<(String, ConfStep)>) -> ConfStep {
    ConfStep::func(move |conf| {
        for (name, substep) in &outputs {
            add_output(conf, name, substep)?;
        }
        Ok(())
    })
}

fn registered(conf: &JobConf) -> DroverResult<BTreeMap<String, ConfDiff>> {
    conf.get_opt(OUTPUTS_KEY)?
        .ok_or_else(|| DroverError::config(OUTPUTS_KEY, "no demultiplexed outputs registered"))
}

/// Names of the outputs registered on a job
pub fn output_names(conf: &JobConf) -> DroverResult<Vec<String>> {
    Ok(registered(conf)?.into_keys().collect())
}

/// Reconstruct the full configuration of one named output
pub fn output_conf(conf: &JobConf, name: &str) -> DroverResult<JobConf> {
    let outputs = registered(conf)?;
    let diff = outputs
        .get(name)
        .ok_or_else(|| DroverError::config(OUTPUTS_KEY, format!("unknown output '{name}'")))?;
    let mut merged = conf.clone();
    merged.merge(diff);
    Ok(merged)
}

/// Every path the job's registered outputs will materialize under
pub fn output_paths(conf: &JobConf) -> DroverResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for name in output_names(conf)? {
        let merged = output_conf(conf, name.as_str())?;
        let output = format::resolve_output(&merged)?;
        paths.extend(output.output_paths(&merged)?);
    }
    Ok(paths)
}

type WriterKey = (String, Option<String>);

/// Memoized handle to one named output's record writer and counter
///
/// State machine: unopened -> open (shared across repeated lookups for the
/// same key) -> closed. No transition back to unopened.
pub struct DemuxHandle {
    writer: Mutex<Option<Box<dyn RecordWriter>>>,
    counter: Counter,
}

impl DemuxHandle {
    /// Write one record, incrementing the underlying writer and the
    /// per-name counter exactly once
    pub fn write(&self, key: &Value, value: &Value) -> DroverResult<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| DroverError::resource("demux writer lock poisoned"))?;
        match guard.as_mut() {
            Some(writer) => {
                writer.write(key, value)?;
                self.counter.increment(1);
                Ok(())
            }
            None => Err(DroverError::resource("write to a closed demux writer")),
        }
    }

    fn close(&self) -> DroverResult<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| DroverError::resource("demux writer lock poisoned"))?;
        match guard.take() {
            Some(mut writer) => writer.close(),
            None => Ok(()),
        }
    }
}

/// Per-job-run cache of named output writers
///
/// Hosted in the task context's committer-scoped slot; created once,
/// lazily, per job run and torn down at job end.
pub struct DemuxState {
    base: JobConf,
    outputs: BTreeMap<String, ConfDiff>,
    writers: DashMap<WriterKey, Arc<DemuxHandle>>,
}

impl DemuxState {
    /// Build the state from a job configuration with registered outputs
    pub fn from_conf(conf: &JobConf) -> DroverResult<Self> {
        Ok(Self {
            base: conf.clone(),
            outputs: registered(conf)?,
            writers: DashMap::new(),
        })
    }

    /// Handle for a named output, constructing its writer at most once
    ///
    /// Concurrent first writes to the same `(name, basename)` race on the
    /// cache entry; the first construction to complete wins and every
    /// caller observes the same handle.
    pub fn get_sink(
        &self,
        ctx: &TaskContext,
        name: &str,
        basename: Option<&str>,
    ) -> DroverResult<Arc<DemuxHandle>> {
        use dashmap::mapref::entry::Entry;

        let key = (name.to_string(), basename.map(String::from));
        match self.writers.entry(key) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let diff = self.outputs.get(name).ok_or_else(|| {
                    DroverError::config(OUTPUTS_KEY, format!("unknown output '{name}'"))
                })?;
                let mut merged = self.base.clone();
                merged.merge(diff);
                if let Some(basename) = basename {
                    merged.set(OUTPUT_BASENAME_KEY, basename);
                }
                let output = format::resolve_output(&merged)?;
                let writer = output.record_writer(&merged)?;
                let counter = ctx.counter(COUNTER_GROUP, name);
                debug!(name, ?basename, "constructed demultiplexed writer");

                let handle = Arc::new(DemuxHandle {
                    writer: Mutex::new(Some(writer)),
                    counter,
                });
                entry.insert(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }

    /// Close every writer created during the run, each exactly once
    ///
    /// All writers are attempted even when one close fails; the first
    /// error is returned.
    pub fn close_all(&self) -> DroverResult<()> {
        let mut first_error = None;
        for entry in self.writers.iter() {
            if let Err(e) = entry.value().close() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Convenience write surface over a task's demux state
pub struct DemuxSink<'a> {
    ctx: &'a TaskContext,
    state: Arc<DemuxState>,
}

impl<'a> DemuxSink<'a> {
    /// Sink over the context's demux state, creating it if needed
    pub fn new(ctx: &'a TaskContext) -> DroverResult<Self> {
        let state = ctx.demux()?;
        Ok(Self { ctx, state })
    }

    /// Write one record to a named output
    pub fn write(
        &self,
        name: &str,
        key: impl Into<Value>,
        value: impl Into<Value>,
    ) -> DroverResult<()> {
        self.state
            .get_sink(self.ctx, name, None)?
            .write(&key.into(), &value.into())
    }

    /// Write one record to a named output under a destination file prefix
    pub fn write_prefixed(
        &self,
        name: &str,
        basename: &str,
        key: impl Into<Value>,
        value: impl Into<Value>,
    ) -> DroverResult<()> {
        self.state
            .get_sink(self.ctx, name, Some(basename))?
            .write(&key.into(), &value.into())
    }

    /// Bind a fixed output name for a whole collection of writes
    pub fn bound(&self, name: impl Into<String>) -> BoundSink<'a, '_> {
        BoundSink {
            demux: self,
            name: name.into(),
        }
    }
}

/// Demux sink bound to one output name
pub struct BoundSink<'a, 'b> {
    demux: &'b DemuxSink<'a>,
    name: String,
}

impl BoundSink<'_, '_> {
    pub fn write(&self, key: impl Into<Value>, value: impl Into<Value>) -> DroverResult<()> {
        self.demux.write(&self.name, key, value)
    }

    pub fn write_prefixed(
        &self,
        basename: &str,
        key: impl Into<Value>,
        value: impl Into<Value>,
    ) -> DroverResult<()> {
        self.demux.write_prefixed(&self.name, basename, key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::format::{OutputFormat, RecordWriter, OUTPUT_FORMAT_KEY};
    use crate::io::mem;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn demux_conf(outputs: Vec<(&str, ConfStep)>) -> JobConf {
        let mut conf = JobConf::new();
        for (name, substep) in outputs {
            add_output(&mut conf, name, &substep).unwrap();
        }
        conf
    }

    #[test]
    fn test_fan_out_then_fan_in_through_mirrors() {
        mem::clear("dux-a");
        mem::clear("dux-b");
        let sink_a = mem::dsink("dux-a");
        let sink_b = mem::dsink("dux-b");

        let conf = demux_conf(vec![("a", sink_a.as_step()), ("b", sink_b.as_step())]);
        let ctx = TaskContext::new(conf);
        let demux = DemuxSink::new(&ctx).unwrap();

        for (name, value) in [("a", 1), ("b", 2), ("a", 3)] {
            demux.write(name, json!(name), json!(value)).unwrap();
        }
        ctx.demux_state().unwrap().close_all().unwrap();

        let read_a: Vec<Value> = sink_a
            .mirror()
            .collect_local()
            .unwrap()
            .into_iter()
            .map(|(_k, v)| v)
            .collect();
        let read_b: Vec<Value> = sink_b
            .mirror()
            .collect_local()
            .unwrap()
            .into_iter()
            .map(|(_k, v)| v)
            .collect();
        assert_eq!(read_a, vec![json!(1), json!(3)]);
        assert_eq!(read_b, vec![json!(2)]);

        assert_eq!(ctx.counter(COUNTER_GROUP, "a").value(), 2);
        assert_eq!(ctx.counter(COUNTER_GROUP, "b").value(), 1);
        mem::clear("dux-a");
        mem::clear("dux-b");
    }

    #[test]
    fn test_outputs_never_share_configuration() {
        let conf = demux_conf(vec![
            ("left", mem::dsink("dux-left").as_step()),
            ("right", mem::dsink("dux-right").as_step()),
        ]);

        let left = output_conf(&conf, "left").unwrap();
        let right = output_conf(&conf, "right").unwrap();
        assert_eq!(left.get::<String>(mem::OUTPUT_ID_KEY).unwrap(), "dux-left");
        assert_eq!(right.get::<String>(mem::OUTPUT_ID_KEY).unwrap(), "dux-right");
    }

    struct CountingOutput;
    static CONSTRUCTIONS: AtomicUsize = AtomicUsize::new(0);

    struct DiscardWriter;
    impl RecordWriter for DiscardWriter {
        fn write(&mut self, _key: &Value, _value: &Value) -> DroverResult<()> {
            Ok(())
        }
        fn close(&mut self) -> DroverResult<()> {
            Ok(())
        }
    }

    impl OutputFormat for CountingOutput {
        fn record_writer(&self, _conf: &JobConf) -> DroverResult<Box<dyn RecordWriter>> {
            CONSTRUCTIONS.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(DiscardWriter))
        }
        fn output_paths(&self, _conf: &JobConf) -> DroverResult<Vec<PathBuf>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_concurrent_first_writes_construct_one_writer() {
        format::register_output_format("test-counting", Arc::new(CountingOutput));
        let conf = demux_conf(vec![(
            "only",
            ConfStep::params([(OUTPUT_FORMAT_KEY, "test-counting")]),
        )]);
        let ctx = TaskContext::new(conf);
        let state = ctx.demux().unwrap();

        CONSTRUCTIONS.store(0, Ordering::SeqCst);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let handle = state.get_sink(&ctx, "only", None).unwrap();
                    handle.write(&json!("k"), &json!(1)).unwrap();
                });
            }
        });

        assert_eq!(CONSTRUCTIONS.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.counter(COUNTER_GROUP, "only").value(), 8);
        state.close_all().unwrap();
    }

    #[test]
    fn test_write_after_close_all_is_an_error() {
        mem::clear("dux-closed");
        let conf = demux_conf(vec![("out", mem::dsink("dux-closed").as_step())]);
        let ctx = TaskContext::new(conf);
        let state = ctx.demux().unwrap();

        let handle = state.get_sink(&ctx, "out", None).unwrap();
        handle.write(&json!("k"), &json!(1)).unwrap();
        state.close_all().unwrap();
        // Closing again is a no-op for every already-closed writer
        state.close_all().unwrap();

        assert!(handle.write(&json!("k"), &json!(2)).is_err());
        assert_eq!(mem::records("dux-closed").len(), 1);
        mem::clear("dux-closed");
    }

    #[test]
    fn test_prefixed_writers_are_cached_per_basename() {
        mem::clear("dux-prefixed");
        let conf = demux_conf(vec![("out", mem::dsink("dux-prefixed").as_step())]);
        let ctx = TaskContext::new(conf);
        let demux = DemuxSink::new(&ctx).unwrap();

        let bound = demux.bound("out");
        bound.write_prefixed("even", json!("k"), json!(0)).unwrap();
        bound.write_prefixed("odd", json!("k"), json!(1)).unwrap();
        bound.write_prefixed("even", json!("k"), json!(2)).unwrap();

        let state = ctx.demux_state().unwrap();
        assert_eq!(state.writers.len(), 2);
        state.close_all().unwrap();
        assert_eq!(mem::records("dux-prefixed").len(), 3);
        mem::clear("dux-prefixed");
    }
}
