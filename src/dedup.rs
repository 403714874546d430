//! Duplicate unit removal by template matching.
//!
//! The template bank is laid out as a synthetic recording, one template per
//! block with silent gaps between blocks. That recording is scanned with the
//! node pipeline: at each template's block every other template is fitted over
//! a range of shifts. A greedy pass over the fits then folds a unit into
//! another one when the other template explains it with a small residual and
//! a plausible amplitude.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clusterer::NOISE_LABEL;
use crate::error::{ClusteringError, Result};
use crate::job::JobConfig;
use crate::peaks::{Peak, PeakRetriever};
use crate::pipeline::{parent, run_node_pipeline, ChunkContext, NodeOutput, PipelineBuilder, PipelineNode};
use crate::recording::{InMemoryRecording, Recording, RecordingFile};
use crate::templates::Templates;
use crate::waveforms::ms_to_samples;

fn default_residual_threshold() -> f64 {
    0.2
}

fn default_amplitude_range() -> [f64; 2] {
    [0.5, 1.5]
}

fn default_max_shift_ms() -> f64 {
    0.25
}

/// Options of the template-matching cleaner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleaningParams {
    /// Largest accepted residual energy, relative to the template's energy.
    #[serde(default = "default_residual_threshold")]
    pub residual_threshold: f64,

    /// Accepted scaling of the explaining template, inclusive.
    #[serde(default = "default_amplitude_range")]
    pub amplitude_range: [f64; 2],

    /// Largest time shift tried in either direction.
    #[serde(default = "default_max_shift_ms")]
    pub max_shift_ms: f64,
}

impl Default for CleaningParams {
    fn default() -> Self {
        Self {
            residual_threshold: default_residual_threshold(),
            amplitude_range: default_amplitude_range(),
            max_shift_ms: default_max_shift_ms(),
        }
    }
}

impl CleaningParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.residual_threshold >= 0.0) {
            return Err(ClusteringError::config("residual_threshold must be >= 0"));
        }
        let [lo, hi] = self.amplitude_range;
        if !(lo > 0.0 && lo <= hi) {
            return Err(ClusteringError::config(format!(
                "amplitude_range [{lo}, {hi}] is not a positive interval"
            )));
        }
        if !(self.max_shift_ms >= 0.0) {
            return Err(ClusteringError::config("max_shift_ms must be >= 0"));
        }
        Ok(())
    }
}

/// Surviving units and the peak labels after cleaning.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub unit_ids: Vec<i64>,
    pub peak_labels: Vec<i64>,
}

/// Merges or discards units that duplicate another unit.
///
/// The returned labels must keep the peak count, only use surviving unit ids,
/// and never give a label to a peak that had none.
pub trait DuplicateResolver: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(
        &self,
        templates: &Templates,
        peak_labels: &[i64],
        params: &CleaningParams,
        job: &JobConfig,
        tmp_folder: &Path,
    ) -> Result<MergeResult>;
}

/// Best fit of one template by another.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateFit {
    /// Index of the explaining template in the bank.
    pub template: usize,
    pub shift: isize,
    pub amplitude: f64,
    /// Residual energy over the fitted signal's energy.
    pub residual: f64,
}

/// Fits found at each template block of a chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchBatch {
    pub offset: usize,
    pub fits: Vec<Vec<TemplateFit>>,
}

impl MatchBatch {
    pub(crate) fn extend(&mut self, next: MatchBatch) {
        if self.fits.is_empty() {
            self.offset = next.offset;
        }
        self.fits.extend(next.fits);
    }
}

/// Dense template bank, row-major (samples × channels) per template.
struct DenseBank {
    nbefore: usize,
    num_samples: usize,
    num_channels: usize,
    templates: Vec<Vec<f32>>,
    energies: Vec<f64>,
}

impl DenseBank {
    fn new(templates: &Templates) -> Self {
        let dense: Vec<Vec<f32>> = templates
            .templates
            .iter()
            .map(|t| t.to_dense(templates.num_channels, templates.num_samples))
            .collect();
        let energies = dense
            .iter()
            .map(|d| d.iter().map(|&v| (v as f64).powi(2)).sum())
            .collect();
        Self {
            nbefore: templates.nbefore,
            num_samples: templates.num_samples,
            num_channels: templates.num_channels,
            templates: dense,
            energies,
        }
    }
}

/// Block length of one template in the synthetic recording.
fn block_len(num_samples: usize, max_shift: usize) -> usize {
    2 * (num_samples + max_shift)
}

/// Lay the bank out as a one-segment recording; returns it with the block
/// anchors (peak sample of each template).
fn bank_recording(
    templates: &Templates,
    bank: &DenseBank,
    max_shift: usize,
) -> Result<(InMemoryRecording, Vec<Peak>)> {
    let block = block_len(bank.num_samples, max_shift);
    let lead = bank.num_samples + max_shift;
    let num_channels = bank.num_channels;
    let mut data = vec![0.0f32; (templates.len() * block + lead) * num_channels];
    let mut anchors = Vec::with_capacity(templates.len());

    for (i, dense) in bank.templates.iter().enumerate() {
        let start = lead + i * block;
        data[start * num_channels..(start + bank.num_samples) * num_channels].copy_from_slice(dense);
        let best_channel = (0..num_channels)
            .max_by(|&a, &b| {
                let ptp = |c: usize| {
                    let col = (0..bank.num_samples).map(|s| dense[s * num_channels + c]);
                    let (lo, hi) = col.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                        (lo.min(v), hi.max(v))
                    });
                    hi - lo
                };
                ptp(a).total_cmp(&ptp(b)).then(b.cmp(&a))
            })
            .unwrap_or(0);
        anchors.push(Peak::new(start + bank.nbefore, best_channel, 0));
    }

    let channel_ids = (0..num_channels).map(|c| format!("ch{c}")).collect();
    let locations = (0..num_channels).map(|c| [0.0, c as f64]).collect();
    let recording = InMemoryRecording::new(templates.sampling_frequency, channel_ids, locations, vec![data])?;
    Ok((recording, anchors))
}

/// At each anchor, fits every other template of the bank over `±max_shift`.
pub struct TemplateMatch {
    bank: Arc<DenseBank>,
    max_shift: usize,
    anchors: Arc<Vec<Peak>>,
}

impl TemplateMatch {
    fn best_fit(&self, ctx: &ChunkContext, own: usize, start: usize) -> Result<Vec<TemplateFit>> {
        let bank = &*self.bank;
        let nc = bank.num_channels;
        let own_energy = bank.energies[own];
        if own_energy == 0.0 {
            return Ok(Vec::new());
        }

        let mut fits = Vec::with_capacity(bank.templates.len().saturating_sub(1));
        for (j, other) in bank.templates.iter().enumerate() {
            if j == own || bank.energies[j] == 0.0 {
                continue;
            }
            let mut best: Option<TemplateFit> = None;
            for shift in -(self.max_shift as isize)..=(self.max_shift as isize) {
                let first = ctx.row_of(start as isize + shift).ok_or_else(|| {
                    ClusteringError::Recording(format!("template block {own} is not covered by the chunk"))
                })?;
                if first + bank.num_samples > ctx.traces.num_samples() {
                    return Err(ClusteringError::Recording(format!(
                        "template block {own} is not covered by the chunk"
                    )));
                }
                let mut dot = 0.0f64;
                for s in 0..bank.num_samples {
                    let row = ctx.traces.row(first + s);
                    let tpl = &other[s * nc..(s + 1) * nc];
                    dot += row.iter().zip(tpl).map(|(&a, &b)| a as f64 * b as f64).sum::<f64>();
                }
                let amplitude = dot / bank.energies[j];
                // ||x - a t||² = ||x||² - a <x, t> for the optimal a
                let residual = ((own_energy - amplitude * dot) / own_energy).max(0.0);
                if best.map_or(true, |b| residual < b.residual) {
                    best = Some(TemplateFit {
                        template: j,
                        shift,
                        amplitude,
                        residual,
                    });
                }
            }
            fits.extend(best);
        }
        Ok(fits)
    }
}

impl PipelineNode for TemplateMatch {
    fn name(&self) -> &str {
        "template_match"
    }

    fn margin(&self) -> usize {
        self.bank.num_samples + self.max_shift
    }

    fn compute(&self, ctx: &ChunkContext, parents: &[&NodeOutput]) -> Result<NodeOutput> {
        let peaks = parent(self.name(), parents, 0, NodeOutput::as_peaks)?;
        let fits = peaks
            .peaks
            .iter()
            .enumerate()
            .map(|(k, p)| {
                let own = peaks.offset + k;
                if own >= self.anchors.len() {
                    return Err(ClusteringError::Graph(format!("no template for anchor {own}")));
                }
                self.best_fit(ctx, own, p.sample_index - self.bank.nbefore)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(NodeOutput::Matches(MatchBatch {
            offset: peaks.offset,
            fits,
        }))
    }
}

/// Greedy sequential merge: returns, for every template, the template it was
/// folded into (itself when kept).
pub fn greedy_merge(fits: &[Vec<TemplateFit>], params: &CleaningParams) -> Vec<usize> {
    let n = fits.len();
    let [lo, hi] = params.amplitude_range;
    let mut merged_into: Vec<usize> = (0..n).collect();
    let mut removed = vec![false; n];

    for i in 0..n {
        let target = fits[i]
            .iter()
            .filter(|f| f.template < n && f.template != i && !removed[f.template])
            .filter(|f| f.residual <= params.residual_threshold)
            .filter(|f| f.amplitude >= lo && f.amplitude <= hi)
            .min_by(|a, b| a.residual.total_cmp(&b.residual).then(a.template.cmp(&b.template)));
        if let Some(f) = target {
            removed[i] = true;
            merged_into[i] = f.template;
        }
    }

    // follow chains to a surviving template
    (0..n)
        .map(|i| {
            let mut t = i;
            let mut steps = 0;
            while merged_into[t] != t && steps < n {
                t = merged_into[t];
                steps += 1;
            }
            t
        })
        .collect()
}

/// Template-matching cleaner running on the chunked pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateMatchingDeduplicator;

impl TemplateMatchingDeduplicator {
    /// Fits of every template by every other, in bank order.
    pub fn match_templates(
        &self,
        templates: &Templates,
        params: &CleaningParams,
        job: &JobConfig,
        tmp_folder: &Path,
    ) -> Result<Vec<Vec<TemplateFit>>> {
        let max_shift = ms_to_samples(params.max_shift_ms, templates.sampling_frequency);
        let bank = Arc::new(DenseBank::new(templates));
        let (recording, anchors) = bank_recording(templates, &bank, max_shift)?;

        let path = tmp_folder.join("templates_recording.json");
        RecordingFile::from_recording(&recording)?.save(&path)?;
        let recording = RecordingFile::load(&path)?;
        log::debug!(
            "template bank written to {} ({} samples)",
            path.display(),
            recording.num_samples(0)
        );

        let anchors = Arc::new(anchors);
        let mut builder = PipelineBuilder::new();
        let root = builder.add(PeakRetriever::new(anchors.clone()), &[], false);
        let matcher = builder.add(
            TemplateMatch {
                bank,
                max_shift,
                anchors,
            },
            &[root],
            true,
        );
        let pipeline = builder.build()?;
        let mut output = run_node_pipeline(&recording, &pipeline, job, "matching templates")?;

        let batch = output
            .take(matcher)
            .and_then(NodeOutput::into_matches)
            .unwrap_or_default();
        if batch.fits.len() != templates.len() {
            return Err(ClusteringError::Graph(format!(
                "{} fits for {} templates",
                batch.fits.len(),
                templates.len()
            )));
        }
        Ok(batch.fits)
    }
}

impl DuplicateResolver for TemplateMatchingDeduplicator {
    fn name(&self) -> &str {
        "template_matching"
    }

    fn resolve(
        &self,
        templates: &Templates,
        peak_labels: &[i64],
        params: &CleaningParams,
        job: &JobConfig,
        tmp_folder: &Path,
    ) -> Result<MergeResult> {
        params.validate()?;
        if templates.is_empty() {
            return Ok(MergeResult {
                unit_ids: Vec::new(),
                peak_labels: vec![NOISE_LABEL; peak_labels.len()],
            });
        }

        let fits = self.match_templates(templates, params, job, tmp_folder)?;
        let target = greedy_merge(&fits, params);

        let unit_ids: Vec<i64> = (0..templates.len())
            .filter(|&i| target[i] == i)
            .map(|i| templates.unit_ids[i])
            .collect();
        let peak_labels = peak_labels
            .iter()
            .map(|&l| match templates.unit_ids.iter().position(|&u| u == l) {
                Some(i) => templates.unit_ids[target[i]],
                None => NOISE_LABEL,
            })
            .collect();

        for (i, &t) in target.iter().enumerate() {
            if t != i {
                log::debug!(
                    "unit {} folded into unit {}",
                    templates.unit_ids[i],
                    templates.unit_ids[t]
                );
            }
        }

        Ok(MergeResult {
            unit_ids,
            peak_labels,
        })
    }
}
