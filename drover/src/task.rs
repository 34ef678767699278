// Task Context & Task Registry
// Per-job-run context (configuration, counters, demux slot) and the static
// registry resolving map/reduce logic from serialized identifiers

use crate::config::{ConfStep, JobConf};
use crate::dux::DemuxState;
use crate::error::{DroverError, DroverResult};
use crate::io::format::Record;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;

/// Key naming the map function of a job
pub const MAP_KEY: &str = "drover.task.map";
/// Key naming the combine function of a job
pub const COMBINE_KEY: &str = "drover.task.combine";
/// Key naming the reduce function of a job
pub const REDUCE_KEY: &str = "drover.task.reduce";

/// Map function: one input record to zero or more output records
pub type MapFn = Arc<dyn Fn(&TaskContext, Record) -> DroverResult<Vec<Record>> + Send + Sync>;
/// Reduce function: one key and its grouped values to zero or more records
pub type ReduceFn =
    Arc<dyn Fn(&TaskContext, Value, Vec<Value>) -> DroverResult<Vec<Record>> + Send + Sync>;

// Task logic is selected by identifiers stored in the job configuration;
// dispatch is a static table lookup.
static MAP_FNS: Lazy<DashMap<String, MapFn>> = Lazy::new(|| {
    let fns: DashMap<String, MapFn> = DashMap::new();
    fns.insert(
        "identity".to_string(),
        Arc::new(|_ctx: &TaskContext, record: Record| Ok(vec![record])) as MapFn,
    );
    fns
});

static REDUCE_FNS: Lazy<DashMap<String, ReduceFn>> = Lazy::new(DashMap::new);

/// Register a map function under an identifier
pub fn register_map(
    id: impl Into<String>,
    f: impl Fn(&TaskContext, Record) -> DroverResult<Vec<Record>> + Send + Sync + 'static,
) {
    MAP_FNS.insert(id.into(), Arc::new(f));
}

/// Register a reduce (or combine) function under an identifier
pub fn register_reduce(
    id: impl Into<String>,
    f: impl Fn(&TaskContext, Value, Vec<Value>) -> DroverResult<Vec<Record>> + Send + Sync + 'static,
) {
    REDUCE_FNS.insert(id.into(), Arc::new(f));
}

/// Look up a map function by identifier
pub fn map_fn(id: &str) -> DroverResult<MapFn> {
    MAP_FNS
        .get(id)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| DroverError::config(MAP_KEY, format!("unknown map function '{id}'")))
}

/// Look up a reduce function by identifier
pub fn reduce_fn(id: &str) -> DroverResult<ReduceFn> {
    REDUCE_FNS
        .get(id)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| DroverError::config(REDUCE_KEY, format!("unknown reduce function '{id}'")))
}

/// Configuration step selecting a registered map function
pub fn map_step(id: impl Into<String>) -> ConfStep {
    ConfStep::params([(MAP_KEY, id.into())])
}

/// Configuration step selecting a registered combine function
pub fn combine_step(id: impl Into<String>) -> ConfStep {
    ConfStep::params([(COMBINE_KEY, id.into())])
}

/// Configuration step selecting a registered reduce function
pub fn reduce_step(id: impl Into<String>) -> ConfStep {
    ConfStep::params([(REDUCE_KEY, id.into())])
}

/// Monotonic counter shared across a job run
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn increment(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Context shared by the tasks of one job run
///
/// Owns the active configuration, the counter table, and the lazily
/// populated committer-scoped slot hosting the job's demux state.
pub struct TaskContext {
    conf: JobConf,
    counters: DashMap<(String, String), Counter>,
    demux: OnceLock<Arc<DemuxState>>,
}

impl TaskContext {
    pub fn new(conf: JobConf) -> Self {
        Self {
            conf,
            counters: DashMap::new(),
            demux: OnceLock::new(),
        }
    }

    /// The active job configuration
    pub fn conf(&self) -> &JobConf {
        &self.conf
    }

    /// Counter under a group and name, created on first access
    pub fn counter(&self, group: &str, name: &str) -> Counter {
        self.counters
            .entry((group.to_string(), name.to_string()))
            .or_default()
            .clone()
    }

    /// The job's demux state, created lazily on first access
    ///
    /// Fails with a `Config` error when the job has no demultiplexed
    /// outputs registered.
    pub fn demux(&self) -> DroverResult<Arc<DemuxState>> {
        if self.demux.get().is_none() {
            let state = Arc::new(DemuxState::from_conf(&self.conf)?);
            let _ = self.demux.set(state);
        }
        self.demux
            .get()
            .cloned()
            .ok_or_else(|| DroverError::resource("demux state unavailable"))
    }

    /// The demux state, only if a task already created it
    pub fn demux_state(&self) -> Option<Arc<DemuxState>> {
        self.demux.get().cloned()
    }
}
