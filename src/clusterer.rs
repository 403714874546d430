//! Density clustering capability.
//!
//! The orchestration only needs "feature matrix in, one label per row out".
//! Implementations are injected; the built-in HDBSCAN is available when the
//! `hdbscan` feature is enabled.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ClusteringError, Result};
use crate::projection::FeatureMatrix;

/// Label of a peak that belongs to no unit.
pub const NOISE_LABEL: i64 = -1;

/// How flat clusters are picked from the cluster hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Excess of mass: the most stable clusters.
    Eom,
    /// The leaves of the cluster tree.
    Leaf,
}

fn default_min_cluster_size() -> usize {
    20
}

fn default_allow_single_cluster() -> bool {
    true
}

fn default_core_dist_n_jobs() -> i64 {
    -1
}

fn default_selection_method() -> SelectionMethod {
    SelectionMethod::Leaf
}

/// Parameters handed to the clusterer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HdbscanParams {
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,

    /// Neighbour count for core distances; falls back to `min_cluster_size`.
    #[serde(default)]
    pub min_samples: Option<usize>,

    #[serde(default = "default_allow_single_cluster")]
    pub allow_single_cluster: bool,

    /// Parallelism hint for core distances, same convention as `n_jobs`.
    #[serde(default = "default_core_dist_n_jobs")]
    pub core_dist_n_jobs: i64,

    #[serde(default = "default_selection_method")]
    pub cluster_selection_method: SelectionMethod,
}

impl Default for HdbscanParams {
    fn default() -> Self {
        Self {
            min_cluster_size: default_min_cluster_size(),
            min_samples: None,
            allow_single_cluster: default_allow_single_cluster(),
            core_dist_n_jobs: default_core_dist_n_jobs(),
            cluster_selection_method: default_selection_method(),
        }
    }
}

impl HdbscanParams {
    pub fn validate(&self) -> Result<()> {
        if self.min_cluster_size < 2 {
            return Err(ClusteringError::config("min_cluster_size must be at least 2"));
        }
        if self.min_samples == Some(0) {
            return Err(ClusteringError::config("min_samples must be at least 1"));
        }
        if self.core_dist_n_jobs == 0 {
            return Err(ClusteringError::config("core_dist_n_jobs must be non-zero"));
        }
        Ok(())
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples.unwrap_or(self.min_cluster_size)
    }
}

/// Groups feature rows into clusters.
///
/// Returns one label per row: `0..K` for cluster members, [`NOISE_LABEL`] for
/// unassigned rows. `K` may be zero.
pub trait DensityClusterer: Send + Sync {
    fn name(&self) -> &str;

    fn cluster(&self, features: &FeatureMatrix, params: &HdbscanParams) -> Result<Vec<i64>>;
}

/// The clusterer compiled into this build, if any.
pub fn default_clusterer() -> Option<Arc<dyn DensityClusterer>> {
    #[cfg(feature = "hdbscan")]
    {
        Some(Arc::new(crate::hdbscan::Hdbscan))
    }
    #[cfg(not(feature = "hdbscan"))]
    {
        None
    }
}

/// Check a clusterer's output against the row count and label conventions.
pub fn check_labels(labels: &[i64], num_rows: usize) -> Result<()> {
    if labels.len() != num_rows {
        return Err(ClusteringError::Contract {
            capability: "density clusterer",
            message: format!("{} labels for {num_rows} rows", labels.len()),
        });
    }
    if let Some(bad) = labels.iter().find(|&&l| l < NOISE_LABEL) {
        return Err(ClusteringError::Contract {
            capability: "density clusterer",
            message: format!("label {bad} is below the noise label"),
        });
    }
    Ok(())
}
