// Cluster Runtime
// The narrow submission interface the execution engine drives, and an
// in-process runtime interpreting jobs locally for tests and local runs

use crate::config::JobConf;
use crate::error::{DroverError, DroverResult};
use crate::io::format::{self, Record};
use crate::mux;
use crate::task::{self, TaskContext, COMBINE_KEY, MAP_KEY, REDUCE_KEY};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Key carrying the display name of a submitted job
pub const JOB_NAME_KEY: &str = "drover.job.name";

/// The cluster execution runtime consumed by the execution engine
///
/// A submission blocks until the underlying job completes and fails with an
/// error on job failure. Killing an in-flight job is not a capability of
/// this interface.
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    async fn submit(&self, conf: JobConf) -> DroverResult<()>;
}

/// In-process runtime interpreting a job configuration locally
///
/// Reads the configured input splits, applies the registered map function
/// per record (honoring per-sub map functions for multiplexed splits),
/// optionally groups by key and applies combine then reduce, and writes
/// the finals through the configured output format. A narrow stand-in for
/// a cluster behind the same interface, not a compute engine.
pub struct LocalRuntime;

#[async_trait]
impl ClusterRuntime for LocalRuntime {
    async fn submit(&self, conf: JobConf) -> DroverResult<()> {
        tokio::task::spawn_blocking(move || run_job(conf))
            .await
            .map_err(|e| DroverError::resource(format!("local job task failed: {e}")))?
    }
}

fn run_job(conf: JobConf) -> DroverResult<()> {
    let job = conf
        .get_opt::<String>(JOB_NAME_KEY)?
        .unwrap_or_else(|| "unnamed".to_string());
    debug!(job, "running job locally");

    let ctx = TaskContext::new(conf.clone());
    let mapped = map_phase(&ctx, &conf)?;
    let finals = match conf.get_opt::<String>(REDUCE_KEY)? {
        None => mapped,
        Some(reduce_id) => reduce_phase(&ctx, &conf, &reduce_id, mapped)?,
    };

    let output = format::resolve_output(&conf)?;
    let mut writer = output.record_writer(&conf)?;
    for (key, value) in &finals {
        writer.write(key, value)?;
    }
    writer.close()?;

    // Tear down any demux state the tasks created during this run
    if let Some(state) = ctx.demux_state() {
        state.close_all()?;
    }
    debug!(job, records = finals.len(), "job finished");
    Ok(())
}

fn map_phase(ctx: &TaskContext, conf: &JobConf) -> DroverResult<Vec<Record>> {
    let default_map = conf
        .get_opt::<String>(MAP_KEY)?
        .unwrap_or_else(|| "identity".to_string());
    let input = format::resolve_input(conf)?;

    let mut mapped = Vec::new();
    for split in input.list_splits(conf)? {
        // Multiplexed splits may carry their own map function
        let map_id = match mux::split_conf(conf, &split)? {
            Some(sub) => sub
                .get_opt::<String>(MAP_KEY)?
                .unwrap_or_else(|| default_map.clone()),
            None => default_map.clone(),
        };
        let map = task::map_fn(&map_id)?;

        let mut reader = input.open_reader(&split, conf)?;
        while let Some(record) = reader.next_record() {
            mapped.extend(map(ctx, record?)?);
        }
    }
    Ok(mapped)
}

fn reduce_phase(
    ctx: &TaskContext,
    conf: &JobConf,
    reduce_id: &str,
    mapped: Vec<Record>,
) -> DroverResult<Vec<Record>> {
    let reduce = task::reduce_fn(reduce_id)?;

    let mut groups = group_by_key(mapped)?;
    if let Some(combine_id) = conf.get_opt::<String>(COMBINE_KEY)? {
        let combine = task::reduce_fn(&combine_id)?;
        let mut combined = Vec::new();
        for (_, (key, values)) in groups {
            combined.extend(combine(ctx, key, values)?);
        }
        groups = group_by_key(combined)?;
    }

    let mut finals = Vec::new();
    for (_, (key, values)) in groups {
        finals.extend(reduce(ctx, key, values)?);
    }
    Ok(finals)
}

/// Deterministic grouping: keys ordered by their canonical serialization
fn group_by_key(records: Vec<Record>) -> DroverResult<BTreeMap<String, (Value, Vec<Value>)>> {
    let mut groups: BTreeMap<String, (Value, Vec<Value>)> = BTreeMap::new();
    for (key, value) in records {
        let canonical = serde_json::to_string(&key)?;
        groups
            .entry(canonical)
            .or_insert_with(|| (key, Vec::new()))
            .1
            .push(value);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dux::DemuxSink;
    use crate::graph::{GraphExecutor, JobNode};
    use crate::io::{jsonl, mem};

    use std::sync::Arc;

    use serde_json::json;

    fn sorted(mut records: Vec<Record>) -> Vec<Record> {
        records.sort_by_key(|(k, v)| (k.to_string(), v.to_string()));
        records
    }

    fn register_wordcount_tasks() {
        task::register_map("tokenize", |_ctx, (_k, v)| {
            let line = v.as_str().unwrap_or_default().to_string();
            Ok(line
                .split_whitespace()
                .map(|w| (json!(w), json!(1)))
                .collect())
        });
        task::register_reduce("sum", |_ctx, key, values| {
            let total: i64 = values.iter().filter_map(Value::as_i64).sum();
            Ok(vec![(key, json!(total))])
        });
    }

    #[tokio::test]
    async fn test_wordcount_job_graph() {
        register_wordcount_tasks();
        mem::put(
            "wc-src",
            vec![
                (json!(0), json!("the quick fox")),
                (json!(1), json!("the lazy dog")),
            ],
        );
        mem::clear("wc-out");

        let leaf = JobNode::input(mem::dseq("wc-src"))
            .map(task::map_step("tokenize"))
            .unwrap()
            .partition(crate::config::ConfStep::noop())
            .unwrap()
            .reduce(task::reduce_step("sum"))
            .unwrap()
            .output(mem::dsink("wc-out"))
            .unwrap();

        let executor = GraphExecutor::new(Arc::new(LocalRuntime));
        let results = executor
            .execute(&[leaf], &JobConf::new(), "wordcount")
            .await
            .unwrap();

        let counts = sorted(results[0].collect_local().unwrap());
        assert_eq!(
            counts,
            sorted(vec![
                (json!("the"), json!(2)),
                (json!("quick"), json!(1)),
                (json!("fox"), json!(1)),
                (json!("lazy"), json!(1)),
                (json!("dog"), json!(1)),
            ])
        );
        mem::clear("wc-src");
        mem::clear("wc-out");
    }

    #[tokio::test]
    async fn test_local_and_cluster_materialization_agree() {
        let dir = tempfile::tempdir().unwrap();
        let local_dir = dir.path().join("local");
        let job_dir = dir.path().join("job");
        let records = vec![(json!("a"), json!(1)), (json!("b"), json!(2))];

        // Materialize the sink locally
        let local_sink = jsonl::dsink(&local_dir);
        let mut writer = local_sink.open_local().unwrap();
        for (k, v) in &records {
            writer.write(k.clone(), v.clone()).unwrap();
        }
        writer.close().unwrap();

        // Materialize the same data by running an actual job
        mem::put("equiv-src", records.clone());
        let job_sink = jsonl::dsink(&job_dir);
        let leaf = JobNode::input(mem::dseq("equiv-src"))
            .map(task::map_step("identity"))
            .unwrap()
            .output(job_sink)
            .unwrap();
        let results = GraphExecutor::new(Arc::new(LocalRuntime))
            .execute(&[leaf], &JobConf::new(), "equiv")
            .await
            .unwrap();

        let from_local = sorted(local_sink.mirror().collect_local().unwrap());
        let from_job = sorted(results[0].collect_local().unwrap());
        assert_eq!(from_local, from_job);
        mem::clear("equiv-src");
    }

    #[tokio::test]
    async fn test_demultiplexed_job_writes_named_outputs() {
        task::register_map("split-parity", |ctx, (_k, v)| {
            let n = v.as_i64().unwrap_or(0);
            let demux = DemuxSink::new(ctx)?;
            let name = if n % 2 == 0 { "even" } else { "odd" };
            demux.write(name, json!(name), json!(n))?;
            Ok(Vec::new())
        });
        mem::put(
            "parity-src",
            (0..5).map(|n| (json!(n), json!(n))).collect(),
        );
        mem::clear("parity-even");
        mem::clear("parity-odd");

        let leaves = JobNode::input(mem::dseq("parity-src"))
            .map(task::map_step("split-parity"))
            .unwrap()
            .output_many(vec![
                ("even".to_string(), mem::dsink("parity-even")),
                ("odd".to_string(), mem::dsink("parity-odd")),
            ])
            .unwrap();

        let results = GraphExecutor::new(Arc::new(LocalRuntime))
            .execute(&leaves, &JobConf::new(), "parity")
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        let evens: Vec<Value> = results[0]
            .collect_local()
            .unwrap()
            .into_iter()
            .map(|(_k, v)| v)
            .collect();
        let odds: Vec<Value> = results[1]
            .collect_local()
            .unwrap()
            .into_iter()
            .map(|(_k, v)| v)
            .collect();
        assert_eq!(sorted_values(evens), vec![json!(0), json!(2), json!(4)]);
        assert_eq!(sorted_values(odds), vec![json!(1), json!(3)]);
        mem::clear("parity-src");
        mem::clear("parity-even");
        mem::clear("parity-odd");
    }

    fn sorted_values(mut values: Vec<Value>) -> Vec<Value> {
        values.sort_by_key(|v| v.as_i64());
        values
    }

    #[tokio::test]
    async fn test_combine_runs_before_reduce() {
        register_wordcount_tasks();
        mem::put(
            "combine-src",
            vec![(json!(0), json!("a a a")), (json!(1), json!("a b"))],
        );
        mem::clear("combine-out");

        let leaf = JobNode::input(mem::dseq("combine-src"))
            .map(task::map_step("tokenize"))
            .unwrap()
            .partition(crate::config::ConfStep::noop())
            .unwrap()
            .combine(task::combine_step("sum"))
            .unwrap()
            .reduce(task::reduce_step("sum"))
            .unwrap()
            .output(mem::dsink("combine-out"))
            .unwrap();

        let results = GraphExecutor::new(Arc::new(LocalRuntime))
            .execute(&[leaf], &JobConf::new(), "combine")
            .await
            .unwrap();

        let counts = sorted(results[0].collect_local().unwrap());
        assert_eq!(counts, vec![(json!("a"), json!(4)), (json!("b"), json!(1))]);
        mem::clear("combine-src");
        mem::clear("combine-out");
    }
}
