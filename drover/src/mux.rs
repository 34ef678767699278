// Multiplexer
// Presents several independently-configured inputs as one logical input,
// storing each sub-configuration as a diff against the job's base

use crate::config::{ConfDiff, ConfStep, JobConf};
use crate::error::{DroverError, DroverResult};
use crate::io::dseq::DSeq;
use crate::io::format::{self, InputFormat, RecordReader, Split, INPUT_FORMAT_KEY};

use serde_json::{json, Value};

/// Key holding the number of multiplexed sub-inputs
pub const COUNT_KEY: &str = "drover.mux.count";

fn sub_key(index: usize) -> String {
    format!("drover.mux.sub.{index}")
}

/// Combine several input-wiring steps into one multiplexing step
///
/// Applied to a base configuration, the step assigns each sub-step an
/// index, stores the sub's configuration as a diff against the base, and
/// installs the mux input format. A sub may itself be multiplexed; its
/// count and sub keys travel inside its own diff and shadow the enclosing
/// ones on reconstruction, so muxes nest.
pub fn step(substeps: Vec<ConfStep>) -> ConfStep {
    ConfStep::func(move |conf| {
        for (index, substep) in substeps.iter().enumerate() {
            let mut derived = conf.clone();
            substep.apply(&mut derived)?;
            let mut diff = conf.diff(&derived);
            // The sub's input format belongs in the diff even when it equals
            // the base's, or reconstruction would resolve the enclosing mux
            if let Some(format) = derived.raw(INPUT_FORMAT_KEY) {
                diff.insert(INPUT_FORMAT_KEY.to_string(), format.clone());
            }
            conf.set(sub_key(index), serde_json::to_value(&diff)?);
        }
        conf.set(COUNT_KEY, substeps.len());
        conf.set(INPUT_FORMAT_KEY, "mux");
        Ok(())
    })
}

/// Combine several dseqs into one logical dseq
///
/// The result reads exactly the multiset concatenation of the inputs:
/// splits are listed in declaration order of the sub-dseqs, each sub's
/// internal split order is its own format's business, and no reordering or
/// deduplication is performed.
pub fn dseq(subs: Vec<DSeq>) -> DSeq {
    DSeq::new(step(subs.iter().map(DSeq::as_step).collect()))
}

/// Reconstruct the full configuration of one sub-input
fn sub_conf(conf: &JobConf, index: usize) -> DroverResult<JobConf> {
    let diff: ConfDiff = conf.get(&sub_key(index))?;
    let mut sub = conf.clone();
    sub.merge(&diff);
    Ok(sub)
}

fn parse_split(split: &Split) -> DroverResult<(usize, Split)> {
    let index = split
        .data
        .get("sub")
        .and_then(Value::as_u64)
        .ok_or_else(|| DroverError::resource("malformed mux split: missing sub index"))?;
    let inner = split
        .data
        .get("split")
        .cloned()
        .ok_or_else(|| DroverError::resource("malformed mux split: missing inner split"))?;
    Ok((index as usize, Split::new(inner)))
}

/// Effective configuration for a split, honoring mux sub-configurations
///
/// Returns `Some` merged sub-configuration when the job reads multiplexed
/// input and the split carries a sub tag; `None` for plain inputs. Lets a
/// runtime honor per-sub parameters such as per-sub map functions.
pub fn split_conf(conf: &JobConf, split: &Split) -> DroverResult<Option<JobConf>> {
    if conf.get_opt::<String>(INPUT_FORMAT_KEY)?.as_deref() != Some("mux") {
        return Ok(None);
    }
    let (index, _) = parse_split(split)?;
    sub_conf(conf, index).map(Some)
}

/// Input format dispatching splits to their owning sub-input
pub struct MuxInput;

impl InputFormat for MuxInput {
    fn list_splits(&self, conf: &JobConf) -> DroverResult<Vec<Split>> {
        let count: usize = conf.get(COUNT_KEY)?;
        let mut splits = Vec::new();
        for index in 0..count {
            let sub = sub_conf(conf, index)?;
            let input = format::resolve_input(&sub)?;
            for inner in input.list_splits(&sub)? {
                splits.push(Split::new(json!({ "sub": index, "split": inner.data })));
            }
        }
        Ok(splits)
    }

    fn open_reader(&self, split: &Split, conf: &JobConf) -> DroverResult<Box<dyn RecordReader>> {
        let (index, inner) = parse_split(split)?;
        let sub = sub_conf(conf, index)?;
        let input = format::resolve_input(&sub)?;
        input.open_reader(&inner, &sub)
    }
}
