//! Sparse waveform snippets and their extraction node.
//!
//! A snippet keeps the list of channels it was cut on next to its samples, so
//! peaks with different neighbourhoods can travel through the same batch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ClusteringError, Result};
use crate::pipeline::{parent, ChunkContext, NodeOutput, PipelineNode};
use crate::recording::{radius_neighbours, Recording};

/// What to do with a window that runs past a segment edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Samples outside the segment read as zero.
    Pad,
    /// The peak gets no snippet.
    Exclude,
}

/// Convert a duration in ms to a whole number of samples (truncating).
pub fn ms_to_samples(ms: f64, sampling_frequency: f64) -> usize {
    (ms * sampling_frequency / 1000.0) as usize
}

/// Samples × channels block restricted to `channels`.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseWaveform {
    /// Recording channel indices, one per column.
    pub channels: Vec<usize>,
    pub num_samples: usize,
    /// Row-major (samples × channels.len()).
    pub data: Vec<f32>,
}

impl SparseWaveform {
    #[inline]
    pub fn get(&self, sample: usize, column: usize) -> f32 {
        self.data[sample * self.channels.len() + column]
    }

    /// One column as a contiguous series.
    pub fn column(&self, column: usize) -> Vec<f32> {
        (0..self.num_samples).map(|s| self.get(s, column)).collect()
    }

    /// Overwrite one column.
    pub fn set_column(&mut self, column: usize, values: &[f32]) {
        let width = self.channels.len();
        for (s, &v) in values.iter().enumerate().take(self.num_samples) {
            self.data[s * width + column] = v;
        }
    }

    /// Peak-to-peak amplitude of every column.
    pub fn ptp(&self) -> Vec<f32> {
        (0..self.channels.len())
            .map(|c| {
                let (lo, hi) = (0..self.num_samples)
                    .map(|s| self.get(s, c))
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                        (lo.min(v), hi.max(v))
                    });
                if lo.is_finite() {
                    hi - lo
                } else {
                    0.0
                }
            })
            .collect()
    }
}

/// Snippets for one chunk's peaks; `None` marks a peak excluded at a segment edge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaveformBatch {
    pub offset: usize,
    pub waveforms: Vec<Option<SparseWaveform>>,
}

impl WaveformBatch {
    pub(crate) fn extend(&mut self, next: WaveformBatch) {
        if self.waveforms.is_empty() {
            self.offset = next.offset;
        }
        self.waveforms.extend(next.waveforms);
    }
}

/// Whether `[sample - nbefore, sample + nafter)` lies inside a segment of `segment_len`.
pub fn window_in_segment(sample: usize, nbefore: usize, nafter: usize, segment_len: usize) -> bool {
    sample >= nbefore && sample + nafter <= segment_len
}

/// Cut `[sample - nbefore, sample + nafter)` on `channels` out of the chunk traces.
pub fn cut_window(
    ctx: &ChunkContext,
    sample: usize,
    nbefore: usize,
    nafter: usize,
    channels: &[usize],
) -> Option<SparseWaveform> {
    let first = ctx.row_of(sample as isize - nbefore as isize)?;
    let last = ctx.row_of(sample as isize + nafter as isize - 1)?;
    let num_samples = last + 1 - first;
    let mut data = Vec::with_capacity(num_samples * channels.len());
    for r in first..=last {
        let row = ctx.traces.row(r);
        data.extend(channels.iter().map(|&c| row[c]));
    }
    Some(SparseWaveform {
        channels: channels.to_vec(),
        num_samples,
        data,
    })
}

/// Cuts a snippet around each peak on the channels within a radius of its anchor.
pub struct ExtractSparseWaveforms {
    nbefore: usize,
    nafter: usize,
    neighbours: Arc<Vec<Vec<usize>>>,
    boundary: BoundaryPolicy,
}

impl ExtractSparseWaveforms {
    pub fn new(
        recording: &dyn Recording,
        ms_before: f64,
        ms_after: f64,
        radius_um: f64,
        boundary: BoundaryPolicy,
    ) -> Result<Self> {
        if !(radius_um > 0.0) {
            return Err(ClusteringError::config("radius_um must be positive"));
        }
        let fs = recording.sampling_frequency();
        let nbefore = ms_to_samples(ms_before, fs);
        let nafter = ms_to_samples(ms_after, fs);
        if nbefore + nafter == 0 {
            return Err(ClusteringError::config(
                "waveform window is shorter than one sample",
            ));
        }
        Ok(Self {
            nbefore,
            nafter,
            neighbours: Arc::new(radius_neighbours(recording, radius_um)),
            boundary,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.nbefore + self.nafter
    }

    /// Channel neighbourhood used for peaks anchored on `channel`.
    pub fn neighbours(&self, channel: usize) -> &[usize] {
        &self.neighbours[channel]
    }
}

impl PipelineNode for ExtractSparseWaveforms {
    fn name(&self) -> &str {
        "extract_sparse_waveforms"
    }

    fn margin(&self) -> usize {
        self.nbefore.max(self.nafter)
    }

    fn compute(&self, ctx: &ChunkContext, parents: &[&NodeOutput]) -> Result<NodeOutput> {
        let peaks = parent(self.name(), parents, 0, NodeOutput::as_peaks)?;

        let waveforms = peaks
            .peaks
            .iter()
            .map(|p| {
                let inside = window_in_segment(p.sample_index, self.nbefore, self.nafter, ctx.segment_len);
                if !inside && self.boundary == BoundaryPolicy::Exclude {
                    return Ok(None);
                }
                let channels = self.neighbours.get(p.channel_index).ok_or_else(|| {
                    ClusteringError::input(format!("anchor channel {} out of range", p.channel_index))
                })?;
                cut_window(ctx, p.sample_index, self.nbefore, self.nafter, channels)
                    .map(Some)
                    .ok_or_else(|| {
                        ClusteringError::Recording(format!(
                            "chunk margin does not cover the window of sample {}",
                            p.sample_index
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(NodeOutput::Waveforms(WaveformBatch {
            offset: peaks.offset,
            waveforms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ChunkRange;
    use crate::peaks::{Peak, PeakBatch};
    use crate::recording::{get_chunk_with_margin, InMemoryRecording};

    /// 4 channels at 0/10/20/30 µm; value = sample * 10 + channel.
    fn line_recording(num_samples: usize) -> InMemoryRecording {
        let data = (0..num_samples)
            .flat_map(|s| (0..4).map(move |c| (s * 10 + c) as f32))
            .collect();
        InMemoryRecording::linear_probe(1000.0, 4, 10.0, vec![data]).unwrap()
    }

    fn run(
        node: &ExtractSparseWaveforms,
        rec: &InMemoryRecording,
        peaks: Vec<Peak>,
    ) -> WaveformBatch {
        let len = rec.num_samples(0);
        let traces = get_chunk_with_margin(rec, 0, 0, len, node.margin()).unwrap();
        let ctx = ChunkContext {
            chunk: ChunkRange {
                index: 0,
                segment: 0,
                start: 0,
                end: len,
            },
            traces: &traces,
            margin: node.margin(),
            segment_len: len,
        };
        let peaks = NodeOutput::Peaks(PeakBatch { offset: 0, peaks });
        match node.compute(&ctx, &[&peaks]).unwrap() {
            NodeOutput::Waveforms(w) => w,
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_radius_selects_neighbourhood() {
        let rec = line_recording(20);
        // 2 samples before, 3 after at 1 kHz
        let node = ExtractSparseWaveforms::new(&rec, 2.0, 3.0, 15.0, BoundaryPolicy::Pad).unwrap();
        let batch = run(&node, &rec, vec![Peak::new(10, 1, 0)]);
        let wf = batch.waveforms[0].as_ref().unwrap();
        assert_eq!(wf.channels, vec![0, 1, 2]);
        assert_eq!(wf.num_samples, 5);
        assert_eq!(wf.get(0, 0), 80.0);
        assert_eq!(wf.get(4, 2), 122.0);
    }

    #[test]
    fn test_variable_width_in_one_batch() {
        let rec = line_recording(20);
        let node = ExtractSparseWaveforms::new(&rec, 1.0, 1.0, 15.0, BoundaryPolicy::Pad).unwrap();
        let batch = run(&node, &rec, vec![Peak::new(5, 0, 0), Peak::new(6, 1, 0)]);
        assert_eq!(batch.waveforms[0].as_ref().unwrap().channels.len(), 2);
        assert_eq!(batch.waveforms[1].as_ref().unwrap().channels.len(), 3);
    }

    #[test]
    fn test_edge_pad_policy_zero_fills() {
        let rec = line_recording(20);
        let node = ExtractSparseWaveforms::new(&rec, 3.0, 2.0, 5.0, BoundaryPolicy::Pad).unwrap();
        let batch = run(&node, &rec, vec![Peak::new(1, 0, 0), Peak::new(19, 3, 0)]);

        let head = batch.waveforms[0].as_ref().unwrap();
        assert_eq!(head.column(0), vec![0.0, 0.0, 0.0, 10.0, 20.0]);

        let tail = batch.waveforms[1].as_ref().unwrap();
        assert_eq!(tail.column(0), vec![163.0, 173.0, 183.0, 193.0, 0.0]);
    }

    #[test]
    fn test_edge_exclude_policy_drops_snippet() {
        let rec = line_recording(20);
        let node =
            ExtractSparseWaveforms::new(&rec, 3.0, 2.0, 5.0, BoundaryPolicy::Exclude).unwrap();
        let batch = run(
            &node,
            &rec,
            vec![Peak::new(1, 0, 0), Peak::new(10, 0, 0), Peak::new(19, 0, 0)],
        );
        assert!(batch.waveforms[0].is_none());
        assert!(batch.waveforms[1].is_some());
        assert!(batch.waveforms[2].is_none());
    }

    #[test]
    fn test_rejects_non_positive_radius() {
        let rec = line_recording(5);
        assert!(ExtractSparseWaveforms::new(&rec, 1.0, 1.0, 0.0, BoundaryPolicy::Pad).is_err());
        assert!(ExtractSparseWaveforms::new(&rec, 1.0, 1.0, -3.0, BoundaryPolicy::Pad).is_err());
    }

    #[test]
    fn test_ptp_per_column() {
        let wf = SparseWaveform {
            channels: vec![3, 7],
            num_samples: 3,
            data: vec![0.0, 1.0, -2.0, 1.0, 4.0, 1.0],
        };
        assert_eq!(wf.ptp(), vec![6.0, 0.0]);
    }
}
