//! Error type shared by every stage of the clustering run.

use thiserror::Error;

/// Unified error for extraction, clustering and cleaning.
///
/// Any error aborts the whole run; there is no partial-result mode.
#[derive(Error, Debug)]
pub enum ClusteringError {
    /// A required external capability (clusterer, duplicate resolver) is not available.
    #[error("missing capability: {0}")]
    MissingCapability(&'static str),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Sparsity method name is not one of ptp / snr / best_channels / radius.
    #[error("unsupported sparsity method '{0}'")]
    UnsupportedSparsityMethod(String),

    /// Peaks or recording do not satisfy the input contract.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The recording could not serve a trace request.
    #[error("recording error: {0}")]
    Recording(String),

    /// The node graph is malformed (cycle, unknown parent, empty).
    #[error("pipeline graph error: {0}")]
    Graph(String),

    /// A node failed while processing a chunk.
    #[error("node '{node}' failed on chunk {chunk}: {message}")]
    Node {
        node: String,
        chunk: usize,
        message: String,
    },

    /// An external capability returned a result breaking its contract.
    #[error("{capability} broke its contract: {message}")]
    Contract {
        capability: &'static str,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusteringError {
    /// Wrap a failure raised inside a pipeline node.
    pub fn node(node: impl Into<String>, chunk: usize, message: impl Into<String>) -> Self {
        Self::Node {
            node: node.into(),
            chunk,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ClusteringError>;
