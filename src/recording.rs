//! Recording collaborator: multichannel sample access and probe geometry.
//!
//! The clustering run only ever reads from a recording. File formats and probe
//! management live elsewhere; [`InMemoryRecording`] and its JSON form
//! [`RecordingFile`] are enough for tests, demos and the CLI.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ClusteringError, Result};

/// Read-only access to a segmented multichannel recording.
///
/// Implementations must be shareable across chunk workers.
pub trait Recording: Send + Sync {
    /// Sampling frequency in Hz.
    fn sampling_frequency(&self) -> f64;

    fn channel_ids(&self) -> &[String];

    /// Channel positions in µm, one `[x, y]` per channel.
    fn channel_locations(&self) -> &[[f64; 2]];

    fn num_segments(&self) -> usize;

    /// Number of samples in `segment`.
    fn num_samples(&self, segment: usize) -> usize;

    /// Fetch samples `[start, end)` of `segment`, restricted to `channels`
    /// (all channels when `None`).
    fn get_traces(
        &self,
        segment: usize,
        start: usize,
        end: usize,
        channels: Option<&[usize]>,
    ) -> Result<Traces>;

    fn num_channels(&self) -> usize {
        self.channel_ids().len()
    }

    /// Total sample count across segments.
    fn total_samples(&self) -> usize {
        (0..self.num_segments()).map(|s| self.num_samples(s)).sum()
    }
}

/// A block of samples, row-major (samples × channels).
#[derive(Debug, Clone, PartialEq)]
pub struct Traces {
    data: Vec<f32>,
    num_samples: usize,
    num_channels: usize,
}

impl Traces {
    pub fn new(data: Vec<f32>, num_samples: usize, num_channels: usize) -> Result<Self> {
        if data.len() != num_samples * num_channels {
            return Err(ClusteringError::Recording(format!(
                "trace buffer holds {} values, expected {} x {}",
                data.len(),
                num_samples,
                num_channels
            )));
        }
        Ok(Self {
            data,
            num_samples,
            num_channels,
        })
    }

    pub fn zeros(num_samples: usize, num_channels: usize) -> Self {
        Self {
            data: vec![0.0; num_samples * num_channels],
            num_samples,
            num_channels,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    #[inline]
    pub fn get(&self, sample: usize, channel: usize) -> f32 {
        self.data[sample * self.num_channels + channel]
    }

    /// All channels at one sample.
    pub fn row(&self, sample: usize) -> &[f32] {
        let start = sample * self.num_channels;
        &self.data[start..start + self.num_channels]
    }

    fn row_mut(&mut self, sample: usize) -> &mut [f32] {
        let start = sample * self.num_channels;
        &mut self.data[start..start + self.num_channels]
    }

    /// One channel as a contiguous vector.
    pub fn channel(&self, channel: usize) -> Vec<f32> {
        (0..self.num_samples).map(|s| self.get(s, channel)).collect()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Recording held entirely in memory, one flat row-major buffer per segment.
#[derive(Debug, Clone)]
pub struct InMemoryRecording {
    sampling_frequency: f64,
    channel_ids: Vec<String>,
    channel_locations: Vec<[f64; 2]>,
    segments: Vec<Vec<f32>>,
}

impl InMemoryRecording {
    pub fn new(
        sampling_frequency: f64,
        channel_ids: Vec<String>,
        channel_locations: Vec<[f64; 2]>,
        segments: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if !(sampling_frequency > 0.0) {
            return Err(ClusteringError::input("sampling frequency must be positive"));
        }
        if channel_ids.is_empty() {
            return Err(ClusteringError::input("recording has no channels"));
        }
        if channel_locations.len() != channel_ids.len() {
            return Err(ClusteringError::input(format!(
                "{} channel locations for {} channels",
                channel_locations.len(),
                channel_ids.len()
            )));
        }
        let num_channels = channel_ids.len();
        for (i, seg) in segments.iter().enumerate() {
            if seg.len() % num_channels != 0 {
                return Err(ClusteringError::input(format!(
                    "segment {i} holds {} values, not a multiple of {num_channels} channels",
                    seg.len()
                )));
            }
        }
        Ok(Self {
            sampling_frequency,
            channel_ids,
            channel_locations,
            segments,
        })
    }

    /// Channels named `ch0..chN` laid out on a vertical line with `pitch_um` spacing.
    pub fn linear_probe(
        sampling_frequency: f64,
        num_channels: usize,
        pitch_um: f64,
        segments: Vec<Vec<f32>>,
    ) -> Result<Self> {
        let channel_ids = (0..num_channels).map(|c| format!("ch{c}")).collect();
        let locations = (0..num_channels)
            .map(|c| [0.0, c as f64 * pitch_um])
            .collect();
        Self::new(sampling_frequency, channel_ids, locations, segments)
    }
}

impl Recording for InMemoryRecording {
    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn channel_ids(&self) -> &[String] {
        &self.channel_ids
    }

    fn channel_locations(&self) -> &[[f64; 2]] {
        &self.channel_locations
    }

    fn num_segments(&self) -> usize {
        self.segments.len()
    }

    fn num_samples(&self, segment: usize) -> usize {
        self.segments
            .get(segment)
            .map(|s| s.len() / self.channel_ids.len())
            .unwrap_or(0)
    }

    fn get_traces(
        &self,
        segment: usize,
        start: usize,
        end: usize,
        channels: Option<&[usize]>,
    ) -> Result<Traces> {
        let seg = self.segments.get(segment).ok_or_else(|| {
            ClusteringError::Recording(format!("segment {segment} does not exist"))
        })?;
        let num_channels = self.channel_ids.len();
        let len = seg.len() / num_channels;
        if start > end || end > len {
            return Err(ClusteringError::Recording(format!(
                "sample range {start}..{end} outside segment {segment} of length {len}"
            )));
        }

        match channels {
            None => Traces::new(
                seg[start * num_channels..end * num_channels].to_vec(),
                end - start,
                num_channels,
            ),
            Some(subset) => {
                if let Some(&bad) = subset.iter().find(|&&c| c >= num_channels) {
                    return Err(ClusteringError::Recording(format!(
                        "channel index {bad} out of range ({num_channels} channels)"
                    )));
                }
                let mut data = Vec::with_capacity((end - start) * subset.len());
                for s in start..end {
                    let row = &seg[s * num_channels..(s + 1) * num_channels];
                    data.extend(subset.iter().map(|&c| row[c]));
                }
                Traces::new(data, end - start, subset.len())
            }
        }
    }
}

/// JSON form of a recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFile {
    pub sampling_frequency: f64,
    pub channel_ids: Vec<String>,
    pub channel_locations: Vec<[f64; 2]>,
    /// One row-major (samples × channels) buffer per segment.
    pub segments: Vec<Vec<f32>>,
}

impl RecordingFile {
    /// Snapshot any recording into its JSON form.
    pub fn from_recording(recording: &dyn Recording) -> Result<Self> {
        let segments = (0..recording.num_segments())
            .map(|s| {
                recording
                    .get_traces(s, 0, recording.num_samples(s), None)
                    .map(|t| t.as_slice().to_vec())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            sampling_frequency: recording.sampling_frequency(),
            channel_ids: recording.channel_ids().to_vec(),
            channel_locations: recording.channel_locations().to_vec(),
            segments,
        })
    }

    pub fn into_recording(self) -> Result<InMemoryRecording> {
        InMemoryRecording::new(
            self.sampling_frequency,
            self.channel_ids,
            self.channel_locations,
            self.segments,
        )
    }

    pub fn load(path: &Path) -> Result<InMemoryRecording> {
        let content = std::fs::read_to_string(path)?;
        let file: RecordingFile = serde_json::from_str(&content)?;
        file.into_recording()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Pairwise Euclidean distances between channel positions.
pub fn channel_distances(recording: &dyn Recording) -> Vec<Vec<f64>> {
    let locs = recording.channel_locations();
    locs.iter()
        .map(|a| {
            locs.iter()
                .map(|b| ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt())
                .collect()
        })
        .collect()
}

/// For every channel, the ascending list of channels within `radius_um` of it
/// (the channel itself included).
pub fn radius_neighbours(recording: &dyn Recording, radius_um: f64) -> Vec<Vec<usize>> {
    channel_distances(recording)
        .into_iter()
        .map(|row| {
            row.into_iter()
                .enumerate()
                .filter(|&(_, d)| d <= radius_um)
                .map(|(c, _)| c)
                .collect()
        })
        .collect()
}

/// Read `[start - margin, end + margin)` of a segment on all channels.
///
/// Samples outside the segment are zero, so row `r` of the result is always
/// sample `start - margin + r`.
pub fn get_chunk_with_margin(
    recording: &dyn Recording,
    segment: usize,
    start: usize,
    end: usize,
    margin: usize,
) -> Result<Traces> {
    let len = recording.num_samples(segment);
    let num_channels = recording.num_channels();
    let total = end - start + 2 * margin;

    if start >= margin && end + margin <= len {
        return recording.get_traces(segment, start - margin, end + margin, None);
    }

    let first = start.saturating_sub(margin);
    let last = (end + margin).min(len);
    let inner = recording.get_traces(segment, first, last, None)?;
    let mut out = Traces::zeros(total, num_channels);
    let offset = margin - (start - first);
    for r in 0..inner.num_samples() {
        out.row_mut(offset + r).copy_from_slice(inner.row(r));
    }
    Ok(out)
}
