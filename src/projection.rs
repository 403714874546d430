//! Random-projection features.
//!
//! Each peak is summarised by the peak-to-peak amplitude of its snippet on
//! every channel of its neighbourhood, projected onto a fixed random basis and
//! normalised by the total amplitude. The result has the same length for every
//! peak whatever the size of its channel subset.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::{ClusteringError, Result};
use crate::pipeline::{parent, ChunkContext, NodeOutput, PipelineNode};

/// Channels × projections weight matrix, fixed for a whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomProjectionBasis {
    num_channels: usize,
    num_projections: usize,
    /// Row-major (channels × projections).
    weights: Vec<f64>,
}

impl RandomProjectionBasis {
    /// Build a basis from `seed`. The projection count is capped at the channel count.
    pub fn new(num_channels: usize, nb_projections: usize, seed: u64) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Self::from_rng(num_channels, nb_projections, &mut rng)
    }

    /// Build a basis drawing from an explicit generator.
    ///
    /// With more than one channel every column is centred and scaled to unit
    /// standard deviation across channels.
    pub fn from_rng<R: Rng>(
        num_channels: usize,
        nb_projections: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if num_channels == 0 {
            return Err(ClusteringError::input("recording has no channels"));
        }
        if nb_projections == 0 {
            return Err(ClusteringError::config("nb_projections must be at least 1"));
        }
        let num_projections = nb_projections.min(num_channels);
        let mut weights: Vec<f64> = (0..num_channels * num_projections)
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();

        if num_channels > 1 {
            let n = num_channels as f64;
            for p in 0..num_projections {
                let column = |c: usize| c * num_projections + p;
                let mean = (0..num_channels).map(|c| weights[column(c)]).sum::<f64>() / n;
                let var = (0..num_channels)
                    .map(|c| (weights[column(c)] - mean).powi(2))
                    .sum::<f64>()
                    / n;
                let std = var.sqrt();
                for c in 0..num_channels {
                    weights[column(c)] -= mean;
                    if std > 0.0 {
                        weights[column(c)] /= std;
                    }
                }
            }
        }

        Ok(Self {
            num_channels,
            num_projections,
            weights,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_projections(&self) -> usize {
        self.num_projections
    }

    /// Weights of one recording channel.
    pub fn row(&self, channel: usize) -> &[f64] {
        let start = channel * self.num_projections;
        &self.weights[start..start + self.num_projections]
    }

    /// One projection across all channels.
    pub fn column(&self, projection: usize) -> Vec<f64> {
        (0..self.num_channels).map(|c| self.row(c)[projection]).collect()
    }

    /// Amplitude-weighted projection of per-channel `ptp` values measured on `channels`.
    pub fn project(&self, channels: &[usize], ptp: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f64; self.num_projections];
        let denom: f64 = ptp.iter().map(|&v| v as f64).sum();
        if denom == 0.0 {
            return vec![0.0; self.num_projections];
        }
        for (&chan, &amp) in channels.iter().zip(ptp) {
            for (o, w) in out.iter_mut().zip(self.row(chan)) {
                *o += amp as f64 * w;
            }
        }
        out.into_iter().map(|v| (v / denom) as f32).collect()
    }
}

/// Feature rows of one chunk's peaks; `None` where the peak has no snippet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureBatch {
    pub offset: usize,
    pub num_features: usize,
    pub rows: Vec<Option<Vec<f32>>>,
}

impl FeatureBatch {
    pub(crate) fn extend(&mut self, next: FeatureBatch) -> Result<()> {
        if self.rows.is_empty() {
            self.offset = next.offset;
            self.num_features = next.num_features;
        } else if !next.rows.is_empty() && next.num_features != self.num_features {
            return Err(ClusteringError::Graph(format!(
                "feature width changed from {} to {}",
                self.num_features, next.num_features
            )));
        }
        self.rows.extend(next.rows);
        Ok(())
    }

    /// Dense matrix of the present rows, and the peak index of each row.
    pub fn to_matrix(&self) -> (FeatureMatrix, Vec<usize>) {
        let mut data = Vec::with_capacity(self.rows.len() * self.num_features);
        let mut index = Vec::with_capacity(self.rows.len());
        for (i, row) in self.rows.iter().enumerate() {
            if let Some(row) = row {
                data.extend_from_slice(row);
                index.push(self.offset + i);
            }
        }
        let matrix = FeatureMatrix {
            num_rows: index.len(),
            num_features: self.num_features,
            data,
        };
        (matrix, index)
    }
}

/// Row-major peaks × features matrix handed to the clusterer.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    num_rows: usize,
    num_features: usize,
    data: Vec<f32>,
}

impl FeatureMatrix {
    pub fn new(data: Vec<f32>, num_rows: usize, num_features: usize) -> Result<Self> {
        if data.len() != num_rows * num_features {
            return Err(ClusteringError::input(format!(
                "feature buffer holds {} values, expected {num_rows} x {num_features}",
                data.len()
            )));
        }
        Ok(Self {
            num_rows,
            num_features,
            data,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.num_features..(i + 1) * self.num_features]
    }
}

/// Projects denoised snippets; parents are `[peaks, waveforms]`.
pub struct RandomProjectionFeatures {
    basis: Arc<RandomProjectionBasis>,
}

impl RandomProjectionFeatures {
    pub fn new(basis: Arc<RandomProjectionBasis>) -> Self {
        Self { basis }
    }
}

impl PipelineNode for RandomProjectionFeatures {
    fn name(&self) -> &str {
        "random_projection_features"
    }

    fn compute(&self, _ctx: &ChunkContext, parents: &[&NodeOutput]) -> Result<NodeOutput> {
        let peaks = parent(self.name(), parents, 0, NodeOutput::as_peaks)?;
        let waveforms = parent(self.name(), parents, 1, NodeOutput::as_waveforms)?;
        if peaks.len() != waveforms.waveforms.len() {
            return Err(ClusteringError::Graph(format!(
                "{} peaks but {} snippets",
                peaks.len(),
                waveforms.waveforms.len()
            )));
        }

        let rows = waveforms
            .waveforms
            .iter()
            .map(|wf| {
                wf.as_ref()
                    .map(|wf| self.basis.project(&wf.channels, &wf.ptp()))
            })
            .collect();

        Ok(NodeOutput::Features(FeatureBatch {
            offset: peaks.offset,
            num_features: self.basis.num_projections(),
            rows,
        }))
    }
}
