pub mod error;
pub mod recording;
pub mod job;
pub mod pipeline;
pub mod peaks;

// Feature extraction nodes
pub mod waveforms;
pub mod savgol;
pub mod projection;

// Clustering and cleaning
pub mod noise;
pub mod clusterer;
#[cfg(feature = "hdbscan")]
pub mod hdbscan;
pub mod templates;
pub mod sparsity;
pub mod dedup;

pub mod config;
pub mod clustering;
pub mod synthetic;
pub mod run_metadata;
pub mod cli;

pub use clusterer::{DensityClusterer, HdbscanParams, NOISE_LABEL};
pub use clustering::{ClusteringOutcome, RandomProjectionClustering};
pub use config::ClusteringParams;
pub use dedup::{CleaningParams, DuplicateResolver, MergeResult};
pub use error::{ClusteringError, Result};
pub use job::JobConfig;
pub use peaks::Peak;
pub use recording::{InMemoryRecording, Recording, RecordingFile};
