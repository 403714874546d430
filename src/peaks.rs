//! Peak list and the pipeline's root node.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ClusteringError, Result};
use crate::pipeline::{ChunkContext, NodeOutput, PipelineNode};
use crate::recording::Recording;

/// A detected candidate spike.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub sample_index: usize,
    /// Anchor channel, as an index into the recording's channel list.
    pub channel_index: usize,
    #[serde(default)]
    pub amplitude: f32,
    #[serde(default)]
    pub segment_index: usize,
}

impl Peak {
    pub fn new(sample_index: usize, channel_index: usize, segment_index: usize) -> Self {
        Self {
            sample_index,
            channel_index,
            amplitude: 0.0,
            segment_index,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    fn sort_key(&self) -> (usize, usize) {
        (self.segment_index, self.sample_index)
    }
}

/// Check the peak list against the recording: ordered by (segment, sample) and
/// every index in range.
pub fn validate_peaks(peaks: &[Peak], recording: &dyn Recording) -> Result<()> {
    for (i, p) in peaks.iter().enumerate() {
        if p.segment_index >= recording.num_segments() {
            return Err(ClusteringError::input(format!(
                "peak {i}: segment {} does not exist",
                p.segment_index
            )));
        }
        if p.sample_index >= recording.num_samples(p.segment_index) {
            return Err(ClusteringError::input(format!(
                "peak {i}: sample {} past the end of segment {}",
                p.sample_index, p.segment_index
            )));
        }
        if p.channel_index >= recording.num_channels() {
            return Err(ClusteringError::input(format!(
                "peak {i}: channel {} out of range",
                p.channel_index
            )));
        }
    }
    if let Some(i) = peaks
        .windows(2)
        .position(|w| w[1].sort_key() < w[0].sort_key())
    {
        return Err(ClusteringError::input(format!(
            "peaks must be sorted by segment then sample (peak {} precedes peak {})",
            i,
            i + 1
        )));
    }
    Ok(())
}

/// Read a JSON array of peaks.
pub fn load_peaks(path: &Path) -> Result<Vec<Peak>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// The peaks of one chunk and their position in the global list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeakBatch {
    /// Global index of `peaks[0]`.
    pub offset: usize,
    pub peaks: Vec<Peak>,
}

impl PeakBatch {
    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub(crate) fn extend(&mut self, next: PeakBatch) {
        if self.peaks.is_empty() {
            self.offset = next.offset;
        }
        self.peaks.extend(next.peaks);
    }
}

/// Root node: selects the peaks whose sample falls inside the chunk.
pub struct PeakRetriever {
    peaks: Arc<Vec<Peak>>,
}

impl PeakRetriever {
    /// `peaks` must already be validated as sorted.
    pub fn new(peaks: Arc<Vec<Peak>>) -> Self {
        Self { peaks }
    }
}

impl PipelineNode for PeakRetriever {
    fn name(&self) -> &str {
        "peak_retriever"
    }

    fn compute(&self, ctx: &ChunkContext, _parents: &[&NodeOutput]) -> Result<NodeOutput> {
        let seg = ctx.chunk.segment;
        let lo = self
            .peaks
            .partition_point(|p| p.sort_key() < (seg, ctx.chunk.start));
        let hi = self
            .peaks
            .partition_point(|p| p.sort_key() < (seg, ctx.chunk.end));
        Ok(NodeOutput::Peaks(PeakBatch {
            offset: lo,
            peaks: self.peaks[lo..hi].to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ChunkRange;
    use crate::recording::{InMemoryRecording, Traces};

    fn recording() -> InMemoryRecording {
        InMemoryRecording::linear_probe(1000.0, 2, 10.0, vec![vec![0.0; 200], vec![0.0; 100]])
            .unwrap()
    }

    #[test]
    fn test_validate_accepts_sorted_peaks() {
        let peaks = vec![Peak::new(5, 0, 0), Peak::new(5, 1, 0), Peak::new(2, 0, 1)];
        assert!(validate_peaks(&peaks, &recording()).is_ok());
    }

    #[test]
    fn test_validate_rejects_unsorted_and_out_of_range() {
        let rec = recording();
        assert!(validate_peaks(&[Peak::new(9, 0, 0), Peak::new(3, 0, 0)], &rec).is_err());
        assert!(validate_peaks(&[Peak::new(100, 0, 0)], &rec).is_err());
        assert!(validate_peaks(&[Peak::new(1, 2, 0)], &rec).is_err());
        assert!(validate_peaks(&[Peak::new(1, 0, 2)], &rec).is_err());
    }

    #[test]
    fn test_retriever_selects_chunk_window() {
        let peaks = Arc::new(vec![
            Peak::new(1, 0, 0),
            Peak::new(10, 0, 0),
            Peak::new(19, 1, 0),
            Peak::new(20, 1, 0),
            Peak::new(10, 0, 1),
        ]);
        let node = PeakRetriever::new(peaks);
        let traces = Traces::zeros(10, 2);
        let ctx = ChunkContext {
            chunk: ChunkRange {
                index: 1,
                segment: 0,
                start: 10,
                end: 20,
            },
            traces: &traces,
            margin: 0,
            segment_len: 100,
        };
        let out = node.compute(&ctx, &[]).unwrap();
        let batch = out.as_peaks().unwrap();
        assert_eq!(batch.offset, 1);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.peaks[1].sample_index, 19);
    }

    #[test]
    fn test_peaks_json_defaults() {
        let peaks: Vec<Peak> =
            serde_json::from_str(r#"[{"sample_index": 4, "channel_index": 1}]"#).unwrap();
        assert_eq!(peaks[0].segment_index, 0);
        assert_eq!(peaks[0].amplitude, 0.0);
    }
}
