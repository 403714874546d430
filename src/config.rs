//! Parameters of a clustering run.
//!
//! Every field has a default, so `{}` is a complete configuration. Values are
//! checked by [`ClusteringParams::validate`] before anything is computed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::clusterer::HdbscanParams;
use crate::dedup::CleaningParams;
use crate::error::{ClusteringError, Result};
use crate::job::JobConfig;
use crate::sparsity::{SparsityMethod, SparsityParams};
use crate::waveforms::{ms_to_samples, BoundaryPolicy};

fn default_template_ms() -> f64 {
    2.0
}

fn default_feature_ms() -> f64 {
    0.5
}

fn default_radius_um() -> f64 {
    50.0
}

fn default_nb_projections() -> usize {
    10
}

fn default_random_seed() -> u64 {
    42
}

fn default_window_length_ms() -> f64 {
    0.25
}

fn default_smoothing_order() -> usize {
    3
}

fn default_feature_boundary() -> BoundaryPolicy {
    BoundaryPolicy::Pad
}

fn default_template_boundary() -> BoundaryPolicy {
    BoundaryPolicy::Exclude
}

/// Window used for template estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformWindow {
    #[serde(default = "default_template_ms")]
    pub ms_before: f64,
    #[serde(default = "default_template_ms")]
    pub ms_after: f64,
}

impl Default for WaveformWindow {
    fn default() -> Self {
        Self {
            ms_before: default_template_ms(),
            ms_after: default_template_ms(),
        }
    }
}

/// Savitzky-Golay smoothing of feature snippets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingParams {
    #[serde(default = "default_window_length_ms")]
    pub window_length_ms: f64,
    /// Polynomial order.
    #[serde(default = "default_smoothing_order")]
    pub order: usize,
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            window_length_ms: default_window_length_ms(),
            order: default_smoothing_order(),
        }
    }
}

/// Complete configuration of a random-projection clustering run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringParams {
    #[serde(default)]
    pub hdbscan: HdbscanParams,

    #[serde(default)]
    pub cleaning: CleaningParams,

    /// Template estimation window.
    #[serde(default)]
    pub waveforms: WaveformWindow,

    #[serde(default)]
    pub sparsity: SparsityParams,

    /// Neighbourhood radius for feature snippets.
    #[serde(default = "default_radius_um")]
    pub radius_um: f64,

    /// Requested projection count, capped at the channel count.
    #[serde(default = "default_nb_projections")]
    pub nb_projections: usize,

    /// Feature snippet window.
    #[serde(default = "default_feature_ms")]
    pub ms_before: f64,
    #[serde(default = "default_feature_ms")]
    pub ms_after: f64,

    #[serde(default = "default_random_seed")]
    pub random_seed: u64,

    /// Per-channel noise levels; estimated from the recording when absent.
    #[serde(default)]
    pub noise_levels: Option<Vec<f32>>,

    #[serde(default)]
    pub smoothing: SmoothingParams,

    /// Parent of the scratch directory used by cleaning; system temp when absent.
    #[serde(default)]
    pub tmp_folder: Option<PathBuf>,

    #[serde(default)]
    pub job: JobConfig,

    /// Feature snippets crossing a segment edge.
    #[serde(default = "default_feature_boundary")]
    pub feature_boundary: BoundaryPolicy,

    /// Template windows crossing a segment edge.
    #[serde(default = "default_template_boundary")]
    pub template_boundary: BoundaryPolicy,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            hdbscan: HdbscanParams::default(),
            cleaning: CleaningParams::default(),
            waveforms: WaveformWindow::default(),
            sparsity: SparsityParams::default(),
            radius_um: default_radius_um(),
            nb_projections: default_nb_projections(),
            ms_before: default_feature_ms(),
            ms_after: default_feature_ms(),
            random_seed: default_random_seed(),
            noise_levels: None,
            smoothing: SmoothingParams::default(),
            tmp_folder: None,
            job: JobConfig::default(),
            feature_boundary: default_feature_boundary(),
            template_boundary: default_template_boundary(),
        }
    }
}

impl ClusteringParams {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Check every option; returns the parsed sparsity method.
    pub fn validate(&self) -> Result<SparsityMethod> {
        self.hdbscan.validate()?;
        self.cleaning.validate()?;
        self.job.validate()?;
        let method = self.sparsity.validate()?;

        if !(self.radius_um > 0.0) {
            return Err(ClusteringError::config("radius_um must be positive"));
        }
        if self.nb_projections == 0 {
            return Err(ClusteringError::config("nb_projections must be at least 1"));
        }
        for (name, v) in [
            ("ms_before", self.ms_before),
            ("ms_after", self.ms_after),
            ("waveforms.ms_before", self.waveforms.ms_before),
            ("waveforms.ms_after", self.waveforms.ms_after),
        ] {
            if !(v >= 0.0) || !v.is_finite() {
                return Err(ClusteringError::config(format!("{name} must be a finite value >= 0")));
            }
        }
        if self.waveforms.ms_before + self.waveforms.ms_after == 0.0 {
            return Err(ClusteringError::config("template window is empty"));
        }
        if !(self.smoothing.window_length_ms > 0.0) {
            return Err(ClusteringError::config(
                "smoothing window_length_ms must be positive",
            ));
        }
        if let Some(levels) = &self.noise_levels {
            if levels.iter().any(|v| !(*v >= 0.0)) {
                return Err(ClusteringError::config("noise levels must be >= 0"));
            }
        }
        Ok(method)
    }

    /// [`validate`](Self::validate) plus the checks that depend on the
    /// recording's sampling rate.
    pub fn validate_for(&self, sampling_frequency: f64) -> Result<SparsityMethod> {
        let method = self.validate()?;
        let nbefore = ms_to_samples(self.waveforms.ms_before, sampling_frequency);
        let nafter = ms_to_samples(self.waveforms.ms_after, sampling_frequency);
        if nbefore + nafter == 0 {
            return Err(ClusteringError::config(format!(
                "template window of {} + {} ms is shorter than one sample at {} Hz",
                self.waveforms.ms_before, self.waveforms.ms_after, sampling_frequency
            )));
        }
        Ok(method)
    }
}
