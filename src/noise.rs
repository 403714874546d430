//! Per-channel noise estimate from randomly placed chunks of the recording.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{ClusteringError, Result};
use crate::recording::{Recording, Traces};

/// MAD of a standard normal distribution.
const MAD_TO_STD: f64 = 0.6744897501960817;

/// Where and how much to sample for the noise estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomChunksParams {
    pub num_chunks_per_segment: usize,
    pub chunk_size: usize,
    pub seed: u64,
}

impl Default for RandomChunksParams {
    fn default() -> Self {
        Self {
            num_chunks_per_segment: 20,
            chunk_size: 10_000,
            seed: 0,
        }
    }
}

/// Concatenate randomly placed chunks from every segment.
///
/// A segment shorter than one chunk contributes all of its samples once.
pub fn get_random_data_chunks(recording: &dyn Recording, params: &RandomChunksParams) -> Result<Traces> {
    if params.chunk_size == 0 || params.num_chunks_per_segment == 0 {
        return Err(ClusteringError::config(
            "random chunks need a positive count and size",
        ));
    }
    let num_channels = recording.num_channels();
    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
    let mut data = Vec::new();
    let mut num_samples = 0;

    for segment in 0..recording.num_segments() {
        let len = recording.num_samples(segment);
        if len == 0 {
            continue;
        }
        if len <= params.chunk_size {
            let t = recording.get_traces(segment, 0, len, None)?;
            data.extend_from_slice(t.as_slice());
            num_samples += len;
            continue;
        }
        for _ in 0..params.num_chunks_per_segment {
            let start = rng.gen_range(0..len - params.chunk_size);
            let t = recording.get_traces(segment, start, start + params.chunk_size, None)?;
            data.extend_from_slice(t.as_slice());
            num_samples += params.chunk_size;
        }
    }

    Traces::new(data, num_samples, num_channels)
}

/// Median of `values`, averaging the two middle elements for even lengths.
fn median(values: &mut [f32]) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let mid = n / 2;
    let (_, upper, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
    let upper = *upper as f64;
    if n % 2 == 1 {
        return upper;
    }
    let lower = values[..mid]
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    (lower + upper) / 2.0
}

/// Robust noise level per channel: median absolute deviation scaled to a
/// standard deviation.
pub fn noise_levels_from_traces(traces: &Traces) -> Vec<f32> {
    (0..traces.num_channels())
        .map(|c| {
            let mut x = traces.channel(c);
            let med = median(&mut x) as f32;
            let mut dev: Vec<f32> = x.iter().map(|v| (v - med).abs()).collect();
            (median(&mut dev) / MAD_TO_STD) as f32
        })
        .collect()
}

pub fn get_noise_levels(recording: &dyn Recording, params: &RandomChunksParams) -> Result<Vec<f32>> {
    let chunks = get_random_data_chunks(recording, params)?;
    let levels = noise_levels_from_traces(&chunks);
    log::debug!(
        "noise levels from {} random samples: {:?}",
        chunks.num_samples(),
        levels
    );
    Ok(levels)
}
