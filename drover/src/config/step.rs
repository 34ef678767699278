// Configuration Steps
// Composable units of job-configuration mutation

use crate::config::conf::JobConf;
use crate::error::DroverResult;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Function shape of a configuration step
pub type StepFn = Arc<dyn Fn(&mut JobConf) -> DroverResult<()> + Send + Sync>;

/// A composable unit of job configuration
///
/// Applying a step mutates the configuration it is given. Composition is
/// closed: a sequence of steps is itself a step. Ordering within a sequence
/// is the only ordering guarantee provided; no step may observe steps
/// applied after it.
#[derive(Clone)]
pub enum ConfStep {
    /// Arbitrary transformation of the configuration
    Func(StepFn),
    /// Direct parameter sets, applied key by key
    Params(BTreeMap<String, Value>),
    /// Ordered sequence of steps, applied left to right
    Seq(Vec<ConfStep>),
}

impl ConfStep {
    /// Step from a transformation function
    pub fn func(f: impl Fn(&mut JobConf) -> DroverResult<()> + Send + Sync + 'static) -> Self {
        Self::Func(Arc::new(f))
    }

    /// Step from key/value parameter pairs
    pub fn params<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self::Params(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Step from an ordered sequence of steps
    pub fn seq(steps: impl IntoIterator<Item = ConfStep>) -> Self {
        Self::Seq(steps.into_iter().collect())
    }

    /// Step that leaves the configuration untouched
    pub fn noop() -> Self {
        Self::Seq(Vec::new())
    }

    /// Apply this step to a configuration
    pub fn apply(&self, conf: &mut JobConf) -> DroverResult<()> {
        match self {
            Self::Func(f) => f(conf),
            Self::Params(params) => {
                for (key, value) in params {
                    conf.set(key.clone(), value.clone());
                }
                Ok(())
            }
            Self::Seq(steps) => {
                for step in steps {
                    step.apply(conf)?;
                }
                Ok(())
            }
        }
    }
}

impl From<Vec<ConfStep>> for ConfStep {
    fn from(steps: Vec<ConfStep>) -> Self {
        Self::Seq(steps)
    }
}

impl fmt::Debug for ConfStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Func(_) => f.write_str("ConfStep::Func"),
            Self::Params(params) => f.debug_tuple("ConfStep::Params").field(params).finish(),
            Self::Seq(steps) => f.debug_tuple("ConfStep::Seq").field(steps).finish(),
        }
    }
}
