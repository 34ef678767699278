// Error Types
// Crate-wide error taxonomy for configuration, graph building, and execution

use thiserror::Error;

/// Result alias used throughout the crate
pub type DroverResult<T> = Result<T, DroverError>;

/// Errors raised by configuration access, graph building, local I/O, and
/// job execution
#[derive(Debug, Error)]
pub enum DroverError {
    /// Invalid, missing, or type-mismatched configuration key
    #[error("configuration error for '{key}': {message}")]
    Config { key: String, message: String },

    /// Graph-building call applied to a node whose stage does not satisfy
    /// the required predecessor stage
    #[error("invalid stage for {operation}: expected {expected}, found {found}")]
    StageSequence {
        operation: String,
        expected: String,
        found: String,
    },

    /// A submitted job failed; carries the identity of the failing node
    #[error("job '{job}' failed: {source}")]
    JobFailed {
        job: String,
        #[source]
        source: Box<DroverError>,
    },

    /// Failure opening or closing a local source/sink, or constructing a
    /// demultiplexed record writer
    #[error("resource error: {0}")]
    Resource(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DroverError {
    /// Configuration error for a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Configuration error for a key that is required but absent
    pub fn missing_key(key: impl Into<String>) -> Self {
        Self::config(key, "required key is not set")
    }

    /// Resource error with a free-form message
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource(message.into())
    }

    /// Job failure wrapping the underlying error
    pub fn job_failed(job: impl Into<String>, source: DroverError) -> Self {
        Self::JobFailed {
            job: job.into(),
            source: Box::new(source),
        }
    }
}
