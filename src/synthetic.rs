//! Synthetic recordings with known ground truth.
//!
//! Each unit fires a fixed trough-then-bump waveform centred on its own
//! channel, decaying with distance along the probe. Spikes never overlap:
//! they sit on a regular grid in a shuffled unit order.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{ClusteringError, Result};
use crate::peaks::Peak;
use crate::recording::{InMemoryRecording, Recording, RecordingFile};
use crate::waveforms::ms_to_samples;

fn default_num_channels() -> usize {
    8
}

fn default_pitch_um() -> f64 {
    20.0
}

fn default_sampling_frequency() -> f64 {
    10_000.0
}

fn default_num_units() -> usize {
    2
}

fn default_spikes_per_unit() -> usize {
    50
}

fn default_spacing_ms() -> f64 {
    6.0
}

fn default_amplitude() -> f32 {
    50.0
}

fn default_spatial_decay_um() -> f64 {
    25.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticParams {
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_pitch_um")]
    pub pitch_um: f64,
    #[serde(default = "default_sampling_frequency")]
    pub sampling_frequency: f64,
    #[serde(default = "default_num_units")]
    pub num_units: usize,
    #[serde(default = "default_spikes_per_unit")]
    pub spikes_per_unit: usize,
    /// Distance between consecutive spikes; widened if the waveform needs more.
    #[serde(default = "default_spacing_ms")]
    pub spacing_ms: f64,
    /// Trough depth on the centre channel.
    #[serde(default = "default_amplitude")]
    pub amplitude: f32,
    #[serde(default = "default_spatial_decay_um")]
    pub spatial_decay_um: f64,
    /// Standard deviation of additive Gaussian noise; 0 gives clean traces.
    #[serde(default)]
    pub noise_std: f32,
    #[serde(default)]
    pub seed: u64,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            num_channels: default_num_channels(),
            pitch_um: default_pitch_um(),
            sampling_frequency: default_sampling_frequency(),
            num_units: default_num_units(),
            spikes_per_unit: default_spikes_per_unit(),
            spacing_ms: default_spacing_ms(),
            amplitude: default_amplitude(),
            spatial_decay_um: default_spatial_decay_um(),
            noise_std: 0.0,
            seed: 0,
        }
    }
}

/// A generated recording, its peaks and the unit behind each peak.
#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub recording: InMemoryRecording,
    pub peaks: Vec<Peak>,
    pub ground_truth: Vec<i64>,
    /// Centre channel of each unit.
    pub unit_channels: Vec<usize>,
}

impl SyntheticData {
    /// Write `recording.json`, `peaks.json` and `ground_truth.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        RecordingFile::from_recording(&self.recording)?.save(&dir.join("recording.json"))?;
        std::fs::write(dir.join("peaks.json"), serde_json::to_string(&self.peaks)?)?;
        std::fs::write(
            dir.join("ground_truth.json"),
            serde_json::to_string(&self.ground_truth)?,
        )?;
        Ok(())
    }
}

/// Unit waveform sampled at `fs`, trough at index `half`.
fn unit_waveform(fs: f64, half: usize, amplitude: f32) -> Vec<f32> {
    let trough_sigma = 0.1e-3 * fs;
    let bump_sigma = 0.25e-3 * fs;
    let bump_at = 0.4e-3 * fs;
    (0..2 * half + 1)
        .map(|i| {
            let t = i as f64 - half as f64;
            let trough = (-t * t / (2.0 * trough_sigma * trough_sigma)).exp();
            let bump = (-(t - bump_at).powi(2) / (2.0 * bump_sigma * bump_sigma)).exp();
            (amplitude as f64 * (0.4 * bump - trough)) as f32
        })
        .collect()
}

pub fn generate(params: &SyntheticParams) -> Result<SyntheticData> {
    if params.num_channels == 0 || params.num_units == 0 {
        return Err(ClusteringError::config("need at least one channel and one unit"));
    }
    if !(params.sampling_frequency > 0.0) || !(params.pitch_um > 0.0) {
        return Err(ClusteringError::config(
            "sampling frequency and pitch must be positive",
        ));
    }
    if !(params.noise_std >= 0.0) || !(params.spatial_decay_um > 0.0) {
        return Err(ClusteringError::config(
            "noise_std must be >= 0 and spatial_decay_um positive",
        ));
    }

    let fs = params.sampling_frequency;
    let nc = params.num_channels;
    let half = ms_to_samples(1.5, fs).max(1);
    let waveform = unit_waveform(fs, half, params.amplitude);
    let step = ms_to_samples(params.spacing_ms, fs).max(2 * half + 2);

    let unit_channels: Vec<usize> = (0..params.num_units)
        .map(|u| (((u as f64 + 0.5) * nc as f64 / params.num_units as f64) as usize).min(nc - 1))
        .collect();
    let gains: Vec<Vec<f32>> = unit_channels
        .iter()
        .map(|&centre| {
            (0..nc)
                .map(|c| {
                    let d = (c as f64 - centre as f64).abs() * params.pitch_um;
                    (-(d / params.spatial_decay_um).powi(2)).exp() as f32
                })
                .collect()
        })
        .collect();

    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
    let mut order: Vec<usize> = (0..params.num_units)
        .flat_map(|u| std::iter::repeat(u).take(params.spikes_per_unit))
        .collect();
    order.shuffle(&mut rng);

    let num_samples = (order.len() + 2) * step;
    let mut data = vec![0.0f32; num_samples * nc];
    if params.noise_std > 0.0 {
        for v in data.iter_mut() {
            *v = rng.sample::<f32, _>(StandardNormal) * params.noise_std;
        }
    }

    let mut peaks = Vec::with_capacity(order.len());
    let mut ground_truth = Vec::with_capacity(order.len());
    for (k, &unit) in order.iter().enumerate() {
        let trough = step + k * step;
        for (i, &w) in waveform.iter().enumerate() {
            let row = (trough - half + i) * nc;
            for c in 0..nc {
                data[row + c] += w * gains[unit][c];
            }
        }
        let centre = unit_channels[unit];
        peaks.push(Peak::new(trough, centre, 0).with_amplitude(data[trough * nc + centre]));
        ground_truth.push(unit as i64);
    }

    let recording = InMemoryRecording::linear_probe(fs, nc, params.pitch_um, vec![data])?;
    log::debug!(
        "generated {} spikes of {} units over {} samples",
        peaks.len(),
        params.num_units,
        recording.num_samples(0)
    );
    Ok(SyntheticData {
        recording,
        peaks,
        ground_truth,
        unit_channels,
    })
}
