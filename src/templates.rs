//! Unit templates: per-unit average waveforms, dense or channel-sparse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clusterer::NOISE_LABEL;
use crate::error::{ClusteringError, Result};
use crate::job::{divide_into_chunks, map_chunks, JobConfig};
use crate::peaks::Peak;
use crate::pipeline::ChunkContext;
use crate::recording::{get_chunk_with_margin, Recording};
use crate::waveforms::{window_in_segment, BoundaryPolicy};

/// Average waveform of one unit on its channel subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseTemplate {
    /// Recording channel indices, one per column.
    pub channels: Vec<usize>,
    /// Row-major (samples × channels.len()).
    pub data: Vec<f32>,
}

impl SparseTemplate {
    pub fn num_samples(&self) -> usize {
        if self.channels.is_empty() {
            0
        } else {
            self.data.len() / self.channels.len()
        }
    }

    #[inline]
    pub fn get(&self, sample: usize, column: usize) -> f32 {
        self.data[sample * self.channels.len() + column]
    }

    /// Peak-to-peak amplitude per column.
    pub fn ptp(&self) -> Vec<f32> {
        let n = self.num_samples();
        (0..self.channels.len())
            .map(|c| {
                let (lo, hi) = (0..n).map(|s| self.get(s, c)).fold(
                    (f32::INFINITY, f32::NEG_INFINITY),
                    |(lo, hi), v| (lo.min(v), hi.max(v)),
                );
                if n == 0 {
                    0.0
                } else {
                    hi - lo
                }
            })
            .collect()
    }

    /// Keep only `channels`, which must be a subset of the current ones.
    pub fn restrict(&self, channels: &[usize]) -> Result<SparseTemplate> {
        let columns = channels
            .iter()
            .map(|ch| {
                self.channels.iter().position(|c| c == ch).ok_or_else(|| {
                    ClusteringError::input(format!("channel {ch} is not part of the template"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let n = self.num_samples();
        let mut data = Vec::with_capacity(n * columns.len());
        for s in 0..n {
            data.extend(columns.iter().map(|&c| self.get(s, c)));
        }
        Ok(SparseTemplate {
            channels: channels.to_vec(),
            data,
        })
    }

    /// Expand to every recording channel, zero where the template is absent.
    pub fn to_dense(&self, num_channels: usize, num_samples: usize) -> Vec<f32> {
        let mut dense = vec![0.0; num_samples * num_channels];
        for s in 0..self.num_samples().min(num_samples) {
            for (col, &ch) in self.channels.iter().enumerate() {
                dense[s * num_channels + ch] = self.get(s, col);
            }
        }
        dense
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() || self.data.iter().all(|&v| v == 0.0)
    }
}

/// A bank of unit templates sharing one time axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Templates {
    pub sampling_frequency: f64,
    /// Samples before the peak; the peak sits at row `nbefore`.
    pub nbefore: usize,
    pub num_samples: usize,
    pub num_channels: usize,
    pub unit_ids: Vec<i64>,
    pub templates: Vec<SparseTemplate>,
}

impl Templates {
    pub fn len(&self) -> usize {
        self.unit_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unit_ids.is_empty()
    }

    pub fn template_of(&self, unit_id: i64) -> Option<&SparseTemplate> {
        self.unit_ids
            .iter()
            .position(|&u| u == unit_id)
            .map(|i| &self.templates[i])
    }

    /// Keep the units for which `keep` is true, in their current order.
    pub fn retain_units(&self, keep: impl Fn(i64) -> bool) -> Templates {
        let (unit_ids, templates) = self
            .unit_ids
            .iter()
            .zip(&self.templates)
            .filter(|(u, _)| keep(**u))
            .map(|(u, t)| (*u, t.clone()))
            .unzip();
        Templates {
            unit_ids,
            templates,
            ..self.clone_header()
        }
    }

    fn clone_header(&self) -> Templates {
        Templates {
            sampling_frequency: self.sampling_frequency,
            nbefore: self.nbefore,
            num_samples: self.num_samples,
            num_channels: self.num_channels,
            unit_ids: Vec::new(),
            templates: Vec::new(),
        }
    }
}

/// Sorted, de-duplicated non-noise labels.
pub fn unique_units(labels: &[i64]) -> Vec<i64> {
    let mut units: Vec<i64> = labels.iter().copied().filter(|&l| l != NOISE_LABEL).collect();
    units.sort_unstable();
    units.dedup();
    units
}

#[derive(Debug, Clone)]
struct UnitSum {
    sum: Vec<f64>,
    count: usize,
}

/// Average the raw traces around every labelled peak, per unit, on all channels.
///
/// Peaks whose window crosses a segment edge are skipped under
/// [`BoundaryPolicy::Exclude`] and zero-padded under [`BoundaryPolicy::Pad`].
/// A unit with no usable peak gets an all-zero template.
#[allow(clippy::too_many_arguments)]
pub fn estimate_templates(
    recording: &dyn Recording,
    peaks: &[Peak],
    labels: &[i64],
    unit_ids: &[i64],
    nbefore: usize,
    nafter: usize,
    boundary: BoundaryPolicy,
    job: &JobConfig,
) -> Result<Templates> {
    if peaks.len() != labels.len() {
        return Err(ClusteringError::input(format!(
            "{} labels for {} peaks",
            labels.len(),
            peaks.len()
        )));
    }
    let num_channels = recording.num_channels();
    let num_samples = nbefore + nafter;
    let width = num_samples * num_channels;
    let margin = nbefore.max(nafter);

    let unit_index = |label: i64| unit_ids.binary_search(&label).ok();
    let spikes: Vec<(Peak, usize)> = peaks
        .iter()
        .zip(labels)
        .filter_map(|(p, &l)| unit_index(l).map(|u| (*p, u)))
        .collect();

    let chunks = divide_into_chunks(recording, job.chunk_size_for(recording)?);
    let partials = map_chunks(&chunks, job, "estimating templates", |chunk| {
        let lo = spikes.partition_point(|(p, _)| {
            (p.segment_index, p.sample_index) < (chunk.segment, chunk.start)
        });
        let hi = spikes.partition_point(|(p, _)| {
            (p.segment_index, p.sample_index) < (chunk.segment, chunk.end)
        });
        let mut sums: BTreeMap<usize, UnitSum> = BTreeMap::new();
        if lo == hi {
            return Ok(sums);
        }

        let traces = get_chunk_with_margin(recording, chunk.segment, chunk.start, chunk.end, margin)?;
        let ctx = ChunkContext {
            chunk: *chunk,
            traces: &traces,
            margin,
            segment_len: recording.num_samples(chunk.segment),
        };

        for (peak, unit) in &spikes[lo..hi] {
            let inside = window_in_segment(peak.sample_index, nbefore, nafter, ctx.segment_len);
            if !inside && boundary == BoundaryPolicy::Exclude {
                continue;
            }
            let first = ctx
                .row_of(peak.sample_index as isize - nbefore as isize)
                .ok_or_else(|| {
                    ClusteringError::Recording(format!(
                        "chunk margin does not cover sample {}",
                        peak.sample_index
                    ))
                })?;
            let acc = sums.entry(*unit).or_insert_with(|| UnitSum {
                sum: vec![0.0; width],
                count: 0,
            });
            for s in 0..num_samples {
                let row = traces.row(first + s);
                for (a, &v) in acc.sum[s * num_channels..(s + 1) * num_channels]
                    .iter_mut()
                    .zip(row)
                {
                    *a += v as f64;
                }
            }
            acc.count += 1;
        }
        Ok(sums)
    })?;

    let mut totals: Vec<UnitSum> = vec![
        UnitSum {
            sum: vec![0.0; width],
            count: 0,
        };
        unit_ids.len()
    ];
    for partial in partials {
        for (unit, part) in partial {
            let total = &mut totals[unit];
            for (t, p) in total.sum.iter_mut().zip(&part.sum) {
                *t += p;
            }
            total.count += part.count;
        }
    }

    let all_channels: Vec<usize> = (0..num_channels).collect();
    let templates = totals
        .into_iter()
        .zip(unit_ids)
        .map(|(total, unit)| {
            if total.count == 0 {
                log::debug!("unit {unit} has no peak with a complete window");
            }
            let data = total
                .sum
                .iter()
                .map(|&v| if total.count > 0 { (v / total.count as f64) as f32 } else { 0.0 })
                .collect();
            SparseTemplate {
                channels: all_channels.clone(),
                data,
            }
        })
        .collect();

    Ok(Templates {
        sampling_frequency: recording.sampling_frequency(),
        nbefore,
        num_samples,
        num_channels,
        unit_ids: unit_ids.to_vec(),
        templates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::InMemoryRecording;

    /// One channel: a +1/-1 pulse pair at every multiple of 10.
    fn pulse_recording(len: usize) -> InMemoryRecording {
        let data = (0..len)
            .map(|s| match s % 10 {
                5 => 4.0,
                6 => -2.0,
                _ => 0.0,
            })
            .collect();
        InMemoryRecording::linear_probe(1000.0, 1, 10.0, vec![data]).unwrap()
    }

    #[test]
    fn test_average_over_chunks() {
        let rec = pulse_recording(100);
        let peaks: Vec<Peak> = (0..10).map(|i| Peak::new(i * 10 + 5, 0, 0)).collect();
        let labels = vec![0, 0, 1, 1, 0, 0, 1, 1, -1, 0];
        let units = unique_units(&labels);
        let job = JobConfig::sequential(7);
        let t = estimate_templates(&rec, &peaks, &labels, &units, 1, 2, BoundaryPolicy::Exclude, &job)
            .unwrap();
        assert_eq!(t.unit_ids, vec![0, 1]);
        assert_eq!(t.num_samples, 3);
        assert_eq!(t.templates[0].data, vec![0.0, 4.0, -2.0]);
        assert_eq!(t.templates[1].data, vec![0.0, 4.0, -2.0]);
    }

    #[test]
    fn test_edge_peaks_excluded_or_padded() {
        // peak at 0 with nbefore 2 crosses the segment start
        let data = vec![6.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0];
        let rec = InMemoryRecording::linear_probe(1000.0, 1, 10.0, vec![data]).unwrap();
        let peaks = vec![Peak::new(0, 0, 0), Peak::new(4, 0, 0)];
        let labels = vec![0, 0];
        let job = JobConfig::sequential(100);

        let excl =
            estimate_templates(&rec, &peaks, &labels, &[0], 2, 1, BoundaryPolicy::Exclude, &job).unwrap();
        assert_eq!(excl.templates[0].data, vec![0.0, 0.0, 2.0]);

        let pad = estimate_templates(&rec, &peaks, &labels, &[0], 2, 1, BoundaryPolicy::Pad, &job).unwrap();
        assert_eq!(pad.templates[0].data, vec![0.0, 0.0, 4.0]);
    }

    #[test]
    fn test_unit_with_no_usable_peak_is_zero() {
        let rec = pulse_recording(20);
        let peaks = vec![Peak::new(0, 0, 0)];
        let t = estimate_templates(
            &rec,
            &peaks,
            &[3],
            &[3],
            2,
            2,
            BoundaryPolicy::Exclude,
            &JobConfig::sequential(10),
        )
        .unwrap();
        assert!(t.templates[0].is_empty());
    }

    #[test]
    fn test_restrict_and_dense_expansion() {
        let t = SparseTemplate {
            channels: vec![0, 1, 2],
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        };
        let r = t.restrict(&[2, 0]).unwrap();
        assert_eq!(r.data, vec![3.0, 1.0, 6.0, 4.0]);
        assert_eq!(r.ptp(), vec![3.0, 3.0]);
        assert!(t.restrict(&[5]).is_err());

        let dense = r.to_dense(4, 2);
        assert_eq!(dense, vec![1.0, 0.0, 3.0, 0.0, 4.0, 0.0, 6.0, 0.0]);
    }

    #[test]
    fn test_unique_units_skip_noise() {
        assert_eq!(unique_units(&[3, -1, 0, 3, 1]), vec![0, 1, 3]);
        assert!(unique_units(&[-1, -1]).is_empty());
    }
}
