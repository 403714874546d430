//! Random-projection clustering of detected peaks.
//!
//! Features are extracted by streaming the recording through
//! `PeakRetriever → ExtractSparseWaveforms → SavGolDenoiser → RandomProjectionFeatures`,
//! clustered by the density clusterer, turned into sparse unit templates and
//! finally cleaned of duplicate units.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::clusterer::{check_labels, default_clusterer, DensityClusterer, NOISE_LABEL};
use crate::config::ClusteringParams;
use crate::dedup::{DuplicateResolver, MergeResult, TemplateMatchingDeduplicator};
use crate::error::{ClusteringError, Result};
use crate::noise::{get_noise_levels, RandomChunksParams};
use crate::peaks::{validate_peaks, Peak, PeakRetriever};
use crate::pipeline::{run_node_pipeline, NodeOutput, PipelineBuilder};
use crate::projection::{FeatureBatch, RandomProjectionBasis, RandomProjectionFeatures};
use crate::recording::{channel_distances, Recording};
use crate::savgol::SavGolDenoiser;
use crate::sparsity::{compute_sparsity, relabel_removed, remove_empty_templates, to_sparse};
use crate::templates::{estimate_templates, unique_units, Templates};
use crate::waveforms::{ms_to_samples, ExtractSparseWaveforms};

/// Result of a clustering run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusteringOutcome {
    /// Final unit ids, `0..K`.
    pub unit_ids: Vec<i64>,
    /// One label per input peak, in input order.
    pub peak_labels: Vec<i64>,
    /// Clusters returned by the density clusterer.
    pub raw_cluster_count: usize,
    /// Units dropped because their sparse template was empty.
    pub empty_templates_removed: usize,
    /// Units handed to the duplicate resolver.
    pub units_before_merge: usize,
    /// Sparse templates of the final units, in `unit_ids` order.
    #[serde(skip)]
    pub templates: Option<Templates>,
}

impl ClusteringOutcome {
    fn empty(num_peaks: usize, raw_cluster_count: usize, empty_templates_removed: usize) -> Self {
        Self {
            unit_ids: Vec::new(),
            peak_labels: vec![NOISE_LABEL; num_peaks],
            raw_cluster_count,
            empty_templates_removed,
            units_before_merge: 0,
            templates: None,
        }
    }
}

/// Orchestrates a run with injected clustering and cleaning capabilities.
#[derive(Clone)]
pub struct RandomProjectionClustering {
    clusterer: Option<Arc<dyn DensityClusterer>>,
    resolver: Option<Arc<dyn DuplicateResolver>>,
}

impl Default for RandomProjectionClustering {
    /// The capabilities built into this crate.
    fn default() -> Self {
        Self {
            clusterer: default_clusterer(),
            resolver: Some(Arc::new(TemplateMatchingDeduplicator)),
        }
    }
}

impl RandomProjectionClustering {
    pub fn new(
        clusterer: Option<Arc<dyn DensityClusterer>>,
        resolver: Option<Arc<dyn DuplicateResolver>>,
    ) -> Self {
        Self { clusterer, resolver }
    }

    pub fn with_clusterer(mut self, clusterer: Arc<dyn DensityClusterer>) -> Self {
        self.clusterer = Some(clusterer);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DuplicateResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Per-peak feature rows (`None` for peaks without a snippet), in peak order.
    pub fn extract_features(
        &self,
        recording: &dyn Recording,
        peaks: &[Peak],
        params: &ClusteringParams,
    ) -> Result<FeatureBatch> {
        let basis = Arc::new(RandomProjectionBasis::new(
            recording.num_channels(),
            params.nb_projections,
            params.random_seed,
        )?);

        let mut builder = PipelineBuilder::new();
        let retriever = builder.add(PeakRetriever::new(Arc::new(peaks.to_vec())), &[], false);
        let extractor = builder.add(
            ExtractSparseWaveforms::new(
                recording,
                params.ms_before,
                params.ms_after,
                params.radius_um,
                params.feature_boundary,
            )?,
            &[retriever],
            false,
        );
        let denoiser = builder.add(
            SavGolDenoiser::new(
                recording,
                params.smoothing.window_length_ms,
                params.smoothing.order,
            )?,
            &[retriever, extractor],
            false,
        );
        let projector = builder.add(
            RandomProjectionFeatures::new(basis.clone()),
            &[retriever, denoiser],
            true,
        );
        let pipeline = builder.build()?;

        let mut output = run_node_pipeline(recording, &pipeline, &params.job, "extracting features")?;
        let features = output
            .take(projector)
            .and_then(NodeOutput::into_features)
            .unwrap_or_else(|| FeatureBatch {
                offset: 0,
                num_features: basis.num_projections(),
                rows: Vec::new(),
            });
        if features.rows.len() != peaks.len() {
            return Err(ClusteringError::Graph(format!(
                "{} feature rows for {} peaks",
                features.rows.len(),
                peaks.len()
            )));
        }
        Ok(features)
    }

    /// Cluster `peaks` into units.
    pub fn run(
        &self,
        recording: &dyn Recording,
        peaks: &[Peak],
        params: &ClusteringParams,
    ) -> Result<ClusteringOutcome> {
        let clusterer = self
            .clusterer
            .as_ref()
            .ok_or(ClusteringError::MissingCapability("density clusterer"))?;
        let resolver = self
            .resolver
            .as_ref()
            .ok_or(ClusteringError::MissingCapability("duplicate resolver"))?;
        params.validate_for(recording.sampling_frequency())?;
        if let Some(levels) = &params.noise_levels {
            if levels.len() != recording.num_channels() {
                return Err(ClusteringError::config(format!(
                    "{} noise levels for {} channels",
                    levels.len(),
                    recording.num_channels()
                )));
            }
        }
        validate_peaks(peaks, recording)?;

        let verbose = params.job.verbose;

        // features and raw clusters
        let features = self.extract_features(recording, peaks, params)?;
        let (matrix, rows) = features.to_matrix();
        let row_labels = clusterer.cluster(&matrix, &params.hdbscan)?;
        check_labels(&row_labels, matrix.num_rows())?;

        let mut peak_labels = vec![NOISE_LABEL; peaks.len()];
        for (&peak, &label) in rows.iter().zip(&row_labels) {
            peak_labels[peak] = label;
        }
        let raw_units = unique_units(&peak_labels);
        log::debug!(
            "{} clustered {} of {} peaks into {} clusters",
            clusterer.name(),
            rows.len(),
            peaks.len(),
            raw_units.len()
        );
        if raw_units.is_empty() {
            return Ok(ClusteringOutcome::empty(peaks.len(), 0, 0));
        }

        // templates and sparsity
        let fs = recording.sampling_frequency();
        let templates = estimate_templates(
            recording,
            peaks,
            &peak_labels,
            &raw_units,
            ms_to_samples(params.waveforms.ms_before, fs),
            ms_to_samples(params.waveforms.ms_after, fs),
            params.template_boundary,
            &params.job,
        )?;
        let noise_levels = match &params.noise_levels {
            Some(levels) => levels.clone(),
            None => get_noise_levels(recording, &RandomChunksParams::default())?,
        };
        let masks = compute_sparsity(
            &templates,
            &noise_levels,
            &channel_distances(recording),
            &params.sparsity,
        )?;
        let (templates, removed) = remove_empty_templates(&to_sparse(&templates, &masks)?);
        relabel_removed(&mut peak_labels, &removed);

        if verbose {
            log::info!("found {} raw clusters, cleaning with matching", templates.len());
        } else {
            log::debug!("found {} raw clusters, cleaning with matching", templates.len());
        }
        if templates.is_empty() {
            return Ok(ClusteringOutcome::empty(peaks.len(), raw_units.len(), removed.len()));
        }

        // duplicate cleaning in a scratch directory removed on every path
        let scratch = scratch_dir(params.tmp_folder.as_deref())?;
        let merged = resolver.resolve(
            &templates,
            &peak_labels,
            &params.cleaning,
            &params.job.for_merge(),
            scratch.path(),
        )?;
        drop(scratch);
        check_merge(&templates, &peak_labels, &merged)?;

        if verbose {
            log::info!("kept {} non-duplicated clusters", merged.unit_ids.len());
        } else {
            log::debug!("kept {} non-duplicated clusters", merged.unit_ids.len());
        }

        // compact ids to 0..K
        let mut survivors = merged.unit_ids.clone();
        survivors.sort_unstable();
        let final_labels = merged
            .peak_labels
            .iter()
            .map(|&l| match survivors.binary_search(&l) {
                Ok(i) => i as i64,
                Err(_) => NOISE_LABEL,
            })
            .collect();
        let mut final_templates = templates.retain_units(|u| survivors.binary_search(&u).is_ok());
        final_templates.unit_ids = final_templates
            .unit_ids
            .iter()
            .filter_map(|u| survivors.binary_search(u).ok().map(|i| i as i64))
            .collect();

        Ok(ClusteringOutcome {
            unit_ids: (0..survivors.len() as i64).collect(),
            peak_labels: final_labels,
            raw_cluster_count: raw_units.len(),
            empty_templates_removed: removed.len(),
            units_before_merge: templates.len(),
            templates: Some(final_templates),
        })
    }
}

fn scratch_dir(parent: Option<&Path>) -> Result<tempfile::TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("rpclust-");
    match parent {
        Some(parent) => {
            std::fs::create_dir_all(parent)?;
            Ok(builder.tempdir_in(parent)?)
        }
        None => Ok(builder.tempdir()?),
    }
}

/// Check a resolver's answer against the labels it was given.
fn check_merge(templates: &Templates, before: &[i64], merged: &MergeResult) -> Result<()> {
    let contract = |message: String| ClusteringError::Contract {
        capability: "duplicate resolver",
        message,
    };
    if merged.peak_labels.len() != before.len() {
        return Err(contract(format!(
            "{} labels returned for {} peaks",
            merged.peak_labels.len(),
            before.len()
        )));
    }
    if let Some(u) = merged.unit_ids.iter().find(|u| !templates.unit_ids.contains(u)) {
        return Err(contract(format!("unknown unit {u} in the result")));
    }
    for (i, (&old, &new)) in before.iter().zip(&merged.peak_labels).enumerate() {
        if new == NOISE_LABEL {
            continue;
        }
        if old == NOISE_LABEL {
            return Err(contract(format!("peak {i} gained label {new}")));
        }
        if !merged.unit_ids.contains(&new) {
            return Err(contract(format!("peak {i} labelled with dropped unit {new}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusterer::HdbscanParams;
    use crate::dedup::CleaningParams;
    use crate::job::JobConfig;
    use crate::projection::FeatureMatrix;
    use crate::recording::InMemoryRecording;
    use crate::templates::SparseTemplate;

    /// Puts every row in cluster 0.
    struct OneCluster;

    impl DensityClusterer for OneCluster {
        fn name(&self) -> &str {
            "one_cluster"
        }

        fn cluster(&self, features: &FeatureMatrix, _params: &HdbscanParams) -> Result<Vec<i64>> {
            Ok(vec![0; features.num_rows()])
        }
    }

    /// Labels every peak, breaking the no-new-label rule.
    struct Greedy;

    impl DuplicateResolver for Greedy {
        fn name(&self) -> &str {
            "greedy"
        }

        fn resolve(
            &self,
            templates: &Templates,
            peak_labels: &[i64],
            _params: &CleaningParams,
            _job: &JobConfig,
            _tmp_folder: &Path,
        ) -> Result<MergeResult> {
            Ok(MergeResult {
                unit_ids: templates.unit_ids.clone(),
                peak_labels: vec![templates.unit_ids[0]; peak_labels.len()],
            })
        }
    }

    fn bank() -> Templates {
        Templates {
            sampling_frequency: 1000.0,
            nbefore: 0,
            num_samples: 1,
            num_channels: 1,
            unit_ids: vec![4, 7],
            templates: vec![
                SparseTemplate {
                    channels: vec![0],
                    data: vec![1.0],
                },
                SparseTemplate {
                    channels: vec![0],
                    data: vec![2.0],
                },
            ],
        }
    }

    #[test]
    fn test_missing_clusterer_fails_before_work() {
        let rec = InMemoryRecording::linear_probe(1000.0, 2, 10.0, vec![vec![0.0; 20]]).unwrap();
        // peaks are invalid too; the capability check must come first
        let peaks = vec![Peak::new(99, 0, 0)];
        let rpc = RandomProjectionClustering::new(None, Some(Arc::new(TemplateMatchingDeduplicator)));
        assert!(matches!(
            rpc.run(&rec, &peaks, &ClusteringParams::default()),
            Err(ClusteringError::MissingCapability("density clusterer"))
        ));

        let rpc = RandomProjectionClustering::new(Some(Arc::new(OneCluster)), None);
        assert!(matches!(
            rpc.run(&rec, &peaks, &ClusteringParams::default()),
            Err(ClusteringError::MissingCapability("duplicate resolver"))
        ));
    }

    #[test]
    fn test_merge_contract_checks() {
        let t = bank();
        let before = vec![4, -1, 7];
        let ok = MergeResult {
            unit_ids: vec![7],
            peak_labels: vec![7, -1, 7],
        };
        assert!(check_merge(&t, &before, &ok).is_ok());

        let gained = MergeResult {
            unit_ids: vec![4, 7],
            peak_labels: vec![4, 4, 7],
        };
        assert!(matches!(check_merge(&t, &before, &gained), Err(ClusteringError::Contract { .. })));

        let dangling = MergeResult {
            unit_ids: vec![7],
            peak_labels: vec![4, -1, 7],
        };
        assert!(check_merge(&t, &before, &dangling).is_err());

        let short = MergeResult {
            unit_ids: vec![7],
            peak_labels: vec![7],
        };
        assert!(check_merge(&t, &before, &short).is_err());
    }

    /// Clusters even rows, leaves odd rows as noise.
    struct EvenRows;

    impl DensityClusterer for EvenRows {
        fn name(&self) -> &str {
            "even_rows"
        }

        fn cluster(&self, features: &FeatureMatrix, _params: &HdbscanParams) -> Result<Vec<i64>> {
            Ok((0..features.num_rows())
                .map(|i| if i % 2 == 0 { 0 } else { NOISE_LABEL })
                .collect())
        }
    }

    fn spike_train() -> (InMemoryRecording, Vec<Peak>, ClusteringParams) {
        // one spike shape on a single channel, a silent peak after each spike
        let mut data = vec![0.0f32; 400];
        let mut peaks = Vec::new();
        for k in 0..10 {
            let s = 20 + k * 30;
            data[s] = -10.0;
            data[s + 1] = 5.0;
            peaks.push(Peak::new(s, 0, 0));
            peaks.push(Peak::new(s + 15, 0, 0));
        }
        let rec = InMemoryRecording::linear_probe(1000.0, 1, 10.0, vec![data]).unwrap();
        let mut params = ClusteringParams::default();
        params.noise_levels = Some(vec![1.0]);
        params.ms_before = 2.0;
        params.ms_after = 2.0;
        params.waveforms.ms_before = 2.0;
        params.waveforms.ms_after = 3.0;
        params.job = JobConfig::sequential(100);
        (rec, peaks, params)
    }

    #[test]
    fn test_single_unit_with_noise_peaks() {
        let (rec, peaks, params) = spike_train();
        let rpc = RandomProjectionClustering::new(
            Some(Arc::new(EvenRows)),
            Some(Arc::new(TemplateMatchingDeduplicator)),
        );
        let outcome = rpc.run(&rec, &peaks, &params).unwrap();
        assert_eq!(outcome.unit_ids, vec![0]);
        assert_eq!(outcome.raw_cluster_count, 1);
        assert_eq!(outcome.units_before_merge, 1);
        for (i, &l) in outcome.peak_labels.iter().enumerate() {
            assert_eq!(l, if i % 2 == 0 { 0 } else { NOISE_LABEL });
        }
        let templates = outcome.templates.unwrap();
        assert_eq!(templates.unit_ids, vec![0]);
    }

    #[test]
    fn test_resolver_contract_violation_aborts_run() {
        let (rec, peaks, params) = spike_train();
        let rpc = RandomProjectionClustering::new(Some(Arc::new(EvenRows)), Some(Arc::new(Greedy)));
        assert!(matches!(
            rpc.run(&rec, &peaks, &params),
            Err(ClusteringError::Contract { capability: "duplicate resolver", .. })
        ));
    }

    #[test]
    fn test_scratch_dir_is_removed() {
        let parent = tempfile::tempdir().unwrap();
        let path = {
            let dir = scratch_dir(Some(parent.path())).unwrap();
            assert!(dir.path().starts_with(parent.path()));
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
