// Job Nodes
// Immutable stage-tagged bundles of configuration steps with explicit
// dependencies; every graph-building call returns a brand-new node

use crate::config::ConfStep;
use crate::dux;
use crate::error::{DroverError, DroverResult};
use crate::io::dseq::DSeq;
use crate::io::dsink::DSink;
use crate::io::format::OUTPUT_FORMAT_KEY;
use crate::mux;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stage of a job node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Input,
    Map,
    Partition,
    Combine,
    Reduce,
    Output,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Map => "map",
            Self::Partition => "partition",
            Self::Combine => "combine",
            Self::Reduce => "reduce",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct NodeInner {
    id: u64,
    stage: Stage,
    label: Option<String>,
    steps: Vec<ConfStep>,
    deps: Vec<JobNode>,
    results: Vec<DSeq>,
}

/// An immutable node of the job graph
///
/// Carries a stage tag, the ordered configuration steps accumulated so
/// far, and the closed jobs it depends on. Nodes are cheap to clone and
/// never mutated; one node can feed several downstream branches.
#[derive(Clone, Debug)]
pub struct JobNode {
    inner: Arc<NodeInner>,
}

impl JobNode {
    fn build(
        stage: Stage,
        label: Option<String>,
        steps: Vec<ConfStep>,
        deps: Vec<JobNode>,
        results: Vec<DSeq>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                stage,
                label,
                steps,
                deps,
                results,
            }),
        }
    }

    /// Graph entry point: an input node consuming a dseq
    pub fn input(dseq: DSeq) -> Self {
        Self::build(
            Stage::Input,
            None,
            vec![dseq.as_step()],
            Vec::new(),
            vec![dseq],
        )
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn stage(&self) -> Stage {
        self.inner.stage
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    pub fn steps(&self) -> &[ConfStep] {
        &self.inner.steps
    }

    pub fn deps(&self) -> &[JobNode] {
        &self.inner.deps
    }

    /// The dseqs this node stands for: the consumed dseq of an input node,
    /// or every sink mirror of a closed job
    pub fn results(&self) -> &[DSeq] {
        &self.inner.results
    }

    /// Copy of this node carrying a label, keeping its identity
    pub fn with_label(&self, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id: self.inner.id,
                stage: self.inner.stage,
                label: Some(label.into()),
                steps: self.inner.steps.clone(),
                deps: self.inner.deps.clone(),
                results: self.inner.results.clone(),
            }),
        }
    }

    fn require(&self, operation: &str, allowed: &[Stage]) -> DroverResult<()> {
        if allowed.contains(&self.inner.stage) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(Stage::name)
            .collect::<Vec<_>>()
            .join(" or ");
        Err(DroverError::StageSequence {
            operation: operation.to_string(),
            expected,
            found: self.inner.stage.to_string(),
        })
    }

    fn extend(&self, stage: Stage, extra: Vec<ConfStep>, results: Vec<DSeq>) -> Self {
        let mut steps = self.inner.steps.clone();
        steps.extend(extra);
        Self::build(
            stage,
            self.inner.label.clone(),
            steps,
            self.inner.deps.clone(),
            results,
        )
    }

    fn union_deps(nodes: &[JobNode]) -> Vec<JobNode> {
        let mut deps: Vec<JobNode> = Vec::new();
        for node in nodes {
            for dep in node.deps() {
                if !deps.iter().any(|d| d.id() == dep.id()) {
                    deps.push(dep.clone());
                }
            }
        }
        deps
    }

    /// Open the map stage of a job
    pub fn map(&self, step: ConfStep) -> DroverResult<Self> {
        self.require("map", &[Stage::Input])?;
        Ok(self.extend(Stage::Map, vec![step], Vec::new()))
    }

    /// Open the map stage over several multiplexed input nodes
    pub fn map_mux(inputs: &[JobNode], step: ConfStep) -> DroverResult<Self> {
        for input in inputs {
            input.require("map", &[Stage::Input])?;
        }
        let muxed = mux::dseq(
            inputs
                .iter()
                .flat_map(|n| n.results().iter().cloned())
                .collect(),
        );
        Ok(Self::build(
            Stage::Map,
            None,
            vec![muxed.as_step(), step],
            Self::union_deps(inputs),
            Vec::new(),
        ))
    }

    /// Declare the shuffle of a job
    pub fn partition(&self, step: ConfStep) -> DroverResult<Self> {
        self.require("partition", &[Stage::Map])?;
        Ok(self.extend(Stage::Partition, vec![step], Vec::new()))
    }

    /// Declare the shuffle over several multiplexed map nodes
    ///
    /// Each map node's accumulated steps become one mux sub-configuration,
    /// so every branch keeps its own input wiring and map function.
    pub fn partition_mux(maps: &[JobNode], step: ConfStep) -> DroverResult<Self> {
        for map in maps {
            map.require("partition", &[Stage::Map])?;
        }
        let substeps = maps
            .iter()
            .map(|n| ConfStep::seq(n.steps().to_vec()))
            .collect();
        Ok(Self::build(
            Stage::Partition,
            None,
            vec![mux::step(substeps), step],
            Self::union_deps(maps),
            Vec::new(),
        ))
    }

    /// Declare the optional combine stage
    pub fn combine(&self, step: ConfStep) -> DroverResult<Self> {
        self.require("combine", &[Stage::Partition])?;
        Ok(self.extend(Stage::Combine, vec![step], Vec::new()))
    }

    /// Open the reduce stage of a job
    pub fn reduce(&self, step: ConfStep) -> DroverResult<Self> {
        self.require("reduce", &[Stage::Partition, Stage::Combine])?;
        Ok(self.extend(Stage::Reduce, vec![step], Vec::new()))
    }

    /// Close the job with one sink
    ///
    /// Returns a new input node consuming the sink's mirror dseq and
    /// depending on the job just closed.
    pub fn output(&self, sink: DSink) -> DroverResult<Self> {
        self.require("output", &[Stage::Map, Stage::Reduce])?;
        let mirror = sink.mirror();
        let job = self.extend(Stage::Output, vec![sink.as_step()], vec![mirror.clone()]);
        Ok(Self::build(
            Stage::Input,
            None,
            vec![mirror.as_step()],
            vec![job],
            vec![mirror],
        ))
    }

    /// Close the job with several named, demultiplexed sinks
    ///
    /// The job's primary output is the null format; every real write goes
    /// through a named sub-output. Returns one input node per sink, in
    /// declaration order.
    pub fn output_many(&self, sinks: Vec<(String, DSink)>) -> DroverResult<Vec<Self>> {
        self.require("output", &[Stage::Map, Stage::Reduce])?;
        let mirrors: Vec<DSeq> = sinks.iter().map(|(_, sink)| sink.mirror()).collect();
        let registrations = sinks
            .iter()
            .map(|(name, sink)| (name.clone(), sink.as_step()))
            .collect();
        let job = self.extend(
            Stage::Output,
            vec![
                dux::outputs_step(registrations),
                ConfStep::params([(OUTPUT_FORMAT_KEY, "null")]),
            ],
            mirrors.clone(),
        );
        Ok(mirrors
            .into_iter()
            .map(|mirror| {
                Self::build(
                    Stage::Input,
                    None,
                    vec![mirror.as_step()],
                    vec![job.clone()],
                    vec![mirror],
                )
            })
            .collect())
    }
}
