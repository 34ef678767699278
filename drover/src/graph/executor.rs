// Graph Executor
// Walks the dependency closure of the leaf nodes and runs every job as soon
// as its dependencies have completed, propagating the first failure

use crate::config::JobConf;
use crate::error::{DroverError, DroverResult};
use crate::graph::node::{JobNode, Stage};
use crate::io::dseq::DSeq;
use crate::runtime::{ClusterRuntime, JOB_NAME_KEY};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Configuration for graph execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum concurrently submitted jobs (0 = unlimited)
    pub max_parallel_jobs: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 0,
        }
    }
}

/// Executes job graphs against a cluster runtime
pub struct GraphExecutor {
    runtime: Arc<dyn ClusterRuntime>,
    config: ExecutorConfig,
}

impl GraphExecutor {
    /// Create an executor over a cluster runtime
    pub fn new(runtime: Arc<dyn ClusterRuntime>) -> Self {
        Self {
            runtime,
            config: ExecutorConfig::default(),
        }
    }

    /// Set executor configuration
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute the dependency closure of the given leaf nodes
    ///
    /// A job is submitted once every job it depends on has completed
    /// successfully; mutually independent jobs run concurrently. On the
    /// first failure no further jobs are submitted, in-flight submissions
    /// drain, and the original failure surfaces identifying the job. On
    /// success, returns each leaf's result dseqs flattened in caller
    /// order.
    pub async fn execute(
        &self,
        leaves: &[JobNode],
        base: &JobConf,
        name: &str,
    ) -> DroverResult<Vec<DSeq>> {
        for leaf in leaves {
            if !matches!(leaf.stage(), Stage::Input | Stage::Output) {
                return Err(DroverError::StageSequence {
                    operation: "execute".to_string(),
                    expected: "input or output".to_string(),
                    found: leaf.stage().to_string(),
                });
            }
        }

        let jobs = collect_jobs(leaves);
        let index: HashMap<u64, usize> = jobs
            .iter()
            .enumerate()
            .map(|(idx, job)| (job.id(), idx))
            .collect();

        let mut indegree = vec![0usize; jobs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); jobs.len()];
        for (idx, job) in jobs.iter().enumerate() {
            for dep in job.deps() {
                indegree[idx] += 1;
                dependents[index[&dep.id()]].push(idx);
            }
        }

        let semaphore = (self.config.max_parallel_jobs > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_parallel_jobs)));

        info!(graph = name, jobs = jobs.len(), "executing job graph");

        let mut join_set: JoinSet<(usize, DroverResult<()>)> = JoinSet::new();
        for (idx, degree) in indegree.iter().enumerate() {
            if *degree == 0 {
                self.spawn_job(&mut join_set, &jobs, idx, base, name, &semaphore);
            }
        }

        let mut failure: Option<DroverError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Err(e) => {
                    failure.get_or_insert_with(|| {
                        DroverError::resource(format!("job task panicked: {e}"))
                    });
                }
                Ok((_idx, Err(e))) => {
                    warn!(graph = name, error = %e, "job failed; draining in-flight jobs");
                    failure.get_or_insert(e);
                }
                Ok((idx, Ok(()))) => {
                    debug!(graph = name, job = idx, "job completed");
                    if failure.is_none() {
                        for &dependent in &dependents[idx] {
                            indegree[dependent] -= 1;
                            if indegree[dependent] == 0 {
                                self.spawn_job(
                                    &mut join_set,
                                    &jobs,
                                    dependent,
                                    base,
                                    name,
                                    &semaphore,
                                );
                            }
                        }
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        Ok(leaves
            .iter()
            .flat_map(|leaf| leaf.results().iter().cloned())
            .collect())
    }

    fn spawn_job(
        &self,
        join_set: &mut JoinSet<(usize, DroverResult<()>)>,
        jobs: &[JobNode],
        idx: usize,
        base: &JobConf,
        name: &str,
        semaphore: &Option<Arc<Semaphore>>,
    ) {
        let node = jobs[idx].clone();
        let job_name = match node.label() {
            Some(label) => format!("{name}/{label}"),
            None => format!("{name}/job-{idx}"),
        };
        let runtime = Arc::clone(&self.runtime);
        let base = base.clone();
        let semaphore = semaphore.clone();

        join_set.spawn(async move {
            let _permit = match semaphore {
                Some(s) => s.acquire_owned().await.ok(),
                None => None,
            };
            let result = submit_one(runtime, base, &job_name, &node).await;
            (idx, result.map_err(|e| DroverError::job_failed(job_name, e)))
        });
    }
}

/// Materialize a job's full configuration and submit it
async fn submit_one(
    runtime: Arc<dyn ClusterRuntime>,
    base: JobConf,
    job_name: &str,
    node: &JobNode,
) -> DroverResult<()> {
    let mut conf = base;
    conf.set(JOB_NAME_KEY, job_name);
    for step in node.steps() {
        step.apply(&mut conf)?;
    }
    info!(job = job_name, "submitting job");
    runtime.submit(conf).await
}

/// Transitive closure of executable jobs reachable from the leaves
fn collect_jobs(leaves: &[JobNode]) -> Vec<JobNode> {
    let mut jobs = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<JobNode> = Vec::new();

    for leaf in leaves {
        if leaf.stage() == Stage::Output {
            stack.push(leaf.clone());
        }
        stack.extend(leaf.deps().iter().cloned());
    }
    while let Some(node) = stack.pop() {
        if !seen.insert(node.id()) {
            continue;
        }
        stack.extend(node.deps().iter().cloned());
        jobs.push(node);
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mem;
    use crate::task;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    /// Runtime recording submission order and peak concurrency
    #[derive(Default)]
    struct TracingRuntime {
        current: AtomicUsize,
        peak: AtomicUsize,
        completed: Mutex<Vec<String>>,
        fail_substring: Option<String>,
    }

    impl TracingRuntime {
        fn failing_on(substring: &str) -> Self {
            Self {
                fail_substring: Some(substring.to_string()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ClusterRuntime for TracingRuntime {
        async fn submit(&self, conf: JobConf) -> DroverResult<()> {
            let job: String = conf.get(JOB_NAME_KEY)?;
            let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(25)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.completed.lock().unwrap().push(job.clone());

            match &self.fail_substring {
                Some(s) if job.contains(s) => Err(DroverError::resource("injected failure")),
                _ => Ok(()),
            }
        }
    }

    fn diamond_leaf() -> JobNode {
        let source = JobNode::input(mem::dseq("exec-diamond-src"));

        let left = source
            .map(task::map_step("identity"))
            .unwrap()
            .with_label("left")
            .output(mem::dsink("exec-diamond-left"))
            .unwrap();
        let right = source
            .map(task::map_step("identity"))
            .unwrap()
            .with_label("right")
            .output(mem::dsink("exec-diamond-right"))
            .unwrap();

        JobNode::map_mux(&[left, right], task::map_step("identity"))
            .unwrap()
            .partition(crate::config::ConfStep::noop())
            .unwrap()
            .reduce(task::reduce_step("identity-reduce"))
            .unwrap()
            .with_label("join")
            .output(mem::dsink("exec-diamond-out"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_diamond_branches_run_concurrently_join_runs_last() {
        task::register_reduce("identity-reduce", |_ctx, key, values| {
            Ok(values.into_iter().map(|v| (key.clone(), v)).collect())
        });

        let runtime = Arc::new(TracingRuntime::default());
        let executor = GraphExecutor::new(runtime.clone() as Arc<dyn ClusterRuntime>);

        let leaf = diamond_leaf();
        let results = executor
            .execute(&[leaf], &JobConf::new(), "diamond")
            .await
            .unwrap();

        // Exactly one dseq for the single leaf
        assert_eq!(results.len(), 1);

        let completed = runtime.completed.lock().unwrap().clone();
        assert_eq!(completed.len(), 3);
        assert_eq!(completed.last().unwrap(), "diamond/join");
        // The independent branches overlapped
        assert!(runtime.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_failure_stops_unstarted_dependents() {
        let runtime = Arc::new(TracingRuntime::failing_on("boom"));
        let executor = GraphExecutor::new(runtime.clone() as Arc<dyn ClusterRuntime>);

        let leaf = JobNode::input(mem::dseq("exec-fail-src"))
            .map(task::map_step("identity"))
            .unwrap()
            .with_label("boom")
            .output(mem::dsink("exec-fail-mid"))
            .unwrap()
            .map(task::map_step("identity"))
            .unwrap()
            .with_label("downstream")
            .output(mem::dsink("exec-fail-out"))
            .unwrap();

        let err = executor
            .execute(&[leaf], &JobConf::new(), "failing")
            .await
            .unwrap_err();

        match err {
            DroverError::JobFailed { job, .. } => assert_eq!(job, "failing/boom"),
            other => panic!("unexpected error: {other}"),
        }
        let completed = runtime.completed.lock().unwrap().clone();
        assert!(!completed.iter().any(|j| j.contains("downstream")));
    }

    #[tokio::test]
    async fn test_input_only_graph_returns_its_dseq() {
        mem::put("exec-input-only", vec![(json!("k"), json!(1))]);

        let runtime = Arc::new(TracingRuntime::default());
        let executor = GraphExecutor::new(runtime.clone() as Arc<dyn ClusterRuntime>);

        let leaf = JobNode::input(mem::dseq("exec-input-only"));
        let results = executor
            .execute(&[leaf], &JobConf::new(), "input-only")
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].collect_local().unwrap().len(), 1);
        assert!(runtime.completed.lock().unwrap().is_empty());
        mem::clear("exec-input-only");
    }

    #[tokio::test]
    async fn test_open_node_is_not_executable() {
        let runtime = Arc::new(TracingRuntime::default());
        let executor = GraphExecutor::new(runtime as Arc<dyn ClusterRuntime>);

        let open = JobNode::input(mem::dseq("exec-open"))
            .map(task::map_step("identity"))
            .unwrap();
        let err = executor
            .execute(&[open], &JobConf::new(), "open")
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::StageSequence { .. }));
    }
}
