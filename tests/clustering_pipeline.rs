use std::sync::Arc;

use rpclust::clusterer::DensityClusterer;
use rpclust::dedup::TemplateMatchingDeduplicator;
use rpclust::projection::{FeatureMatrix, RandomProjectionBasis};
use rpclust::synthetic::{generate, SyntheticData, SyntheticParams};
use rpclust::{
    ClusteringError, ClusteringParams, HdbscanParams, JobConfig, RandomProjectionClustering,
    Recording, Result, NOISE_LABEL,
};

fn clean_data(num_units: usize, spikes_per_unit: usize) -> SyntheticData {
    generate(&SyntheticParams {
        num_units,
        spikes_per_unit,
        ..Default::default()
    })
    .unwrap()
}

fn noisy_data() -> SyntheticData {
    generate(&SyntheticParams {
        num_units: 3,
        spikes_per_unit: 40,
        noise_std: 2.0,
        seed: 3,
        ..Default::default()
    })
    .unwrap()
}

/// Fixed unit noise so sparsity does not depend on the estimate.
fn params_for(data: &SyntheticData) -> ClusteringParams {
    ClusteringParams {
        noise_levels: Some(vec![1.0; data.recording.num_channels()]),
        ..Default::default()
    }
}

fn assert_well_formed(outcome: &rpclust::ClusteringOutcome, num_peaks: usize) {
    assert_eq!(outcome.peak_labels.len(), num_peaks);
    let k = outcome.unit_ids.len() as i64;
    assert_eq!(outcome.unit_ids, (0..k).collect::<Vec<_>>());
    assert!(outcome
        .peak_labels
        .iter()
        .all(|&l| l == NOISE_LABEL || (0..k).contains(&l)));
}

#[test]
fn test_two_units_are_recovered() {
    let data = clean_data(2, 50);
    let outcome = RandomProjectionClustering::default()
        .run(&data.recording, &data.peaks, &params_for(&data))
        .unwrap();
    assert_well_formed(&outcome, data.peaks.len());
    assert_eq!(outcome.unit_ids.len(), 2);
    assert_eq!(outcome.raw_cluster_count, 2);

    // labels are a relabelling of the ground truth
    let label_of = |unit: i64| {
        let labels: Vec<i64> = data
            .ground_truth
            .iter()
            .zip(&outcome.peak_labels)
            .filter(|(&g, _)| g == unit)
            .map(|(_, &l)| l)
            .collect();
        assert!(labels.iter().all(|&l| l == labels[0]));
        labels[0]
    };
    let (a, b) = (label_of(0), label_of(1));
    assert_ne!(a, NOISE_LABEL);
    assert_ne!(b, NOISE_LABEL);
    assert_ne!(a, b);
}

#[test]
fn test_identical_spikes_form_one_unit() {
    let data = clean_data(1, 100);
    let outcome = RandomProjectionClustering::default()
        .run(&data.recording, &data.peaks, &params_for(&data))
        .unwrap();
    assert_eq!(outcome.units_before_merge, 1);
    assert_eq!(outcome.unit_ids, vec![0]);
    assert!(outcome.peak_labels.iter().all(|&l| l == 0));
}

#[test]
fn test_no_peaks_gives_empty_outcome() {
    let data = clean_data(1, 5);
    let outcome = RandomProjectionClustering::default()
        .run(&data.recording, &[], &params_for(&data))
        .unwrap();
    assert!(outcome.unit_ids.is_empty());
    assert!(outcome.peak_labels.is_empty());
    assert_eq!(outcome.raw_cluster_count, 0);
}

#[test]
fn test_runs_are_deterministic() {
    let data = noisy_data();
    let params = params_for(&data);
    let rpc = RandomProjectionClustering::default();
    let first = rpc.run(&data.recording, &data.peaks, &params).unwrap();
    let second = rpc.run(&data.recording, &data.peaks, &params).unwrap();
    assert_well_formed(&first, data.peaks.len());
    assert_eq!(first, second);
}

#[test]
fn test_features_do_not_depend_on_chunking() {
    let data = noisy_data();
    let rpc = RandomProjectionClustering::default();

    let mut small = params_for(&data);
    small.job = JobConfig::sequential(97);
    let mut large = params_for(&data);
    large.job = JobConfig {
        n_jobs: 3,
        chunk_size: Some(2000),
        ..Default::default()
    };

    let a = rpc.extract_features(&data.recording, &data.peaks, &small).unwrap();
    let b = rpc.extract_features(&data.recording, &data.peaks, &large).unwrap();
    assert_eq!(a.rows.len(), data.peaks.len());
    assert_eq!(a.rows, b.rows);
}

#[test]
fn test_projection_basis_is_normalised() {
    let basis = RandomProjectionBasis::new(16, 10, 42).unwrap();
    assert_eq!(basis.num_projections(), 10);
    for p in 0..basis.num_projections() {
        let column = basis.column(p);
        let n = column.len() as f64;
        let mean = column.iter().sum::<f64>() / n;
        let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 1e-9);
        assert!((var.sqrt() - 1.0).abs() < 1e-9);
    }
    // capped at the channel count
    assert_eq!(RandomProjectionBasis::new(4, 10, 42).unwrap().num_projections(), 4);
}

#[test]
fn test_sparse_templates_stay_on_the_probe() {
    let data = clean_data(2, 30);
    let mut params = params_for(&data);
    params.hdbscan.min_cluster_size = 10;
    params.sparsity.method = "radius".into();
    params.sparsity.radius_um = Some(30.0);
    let outcome = RandomProjectionClustering::default()
        .run(&data.recording, &data.peaks, &params)
        .unwrap();
    let templates = outcome.templates.unwrap();
    assert_eq!(templates.len(), outcome.unit_ids.len());
    for t in &templates.templates {
        assert!(!t.channels.is_empty());
        assert!(t.channels.len() <= 3);
        assert!(t.channels.windows(2).all(|w| w[0] < w[1]));
        assert!(t.channels.iter().all(|&c| c < data.recording.num_channels()));
    }
}

/// Splits every cluster in two by row parity.
struct Halves;

impl DensityClusterer for Halves {
    fn name(&self) -> &str {
        "halves"
    }

    fn cluster(&self, features: &FeatureMatrix, _params: &HdbscanParams) -> Result<Vec<i64>> {
        Ok((0..features.num_rows()).map(|i| (i % 2) as i64).collect())
    }
}

#[test]
fn test_duplicate_units_are_merged() {
    let data = clean_data(1, 40);
    let dir = tempfile::tempdir().unwrap();
    let mut params = params_for(&data);
    params.tmp_folder = Some(dir.path().join("scratch"));

    let rpc = RandomProjectionClustering::new(
        Some(Arc::new(Halves)),
        Some(Arc::new(TemplateMatchingDeduplicator)),
    );
    let outcome = rpc.run(&data.recording, &data.peaks, &params).unwrap();
    assert_eq!(outcome.raw_cluster_count, 2);
    assert_eq!(outcome.units_before_merge, 2);
    assert_eq!(outcome.unit_ids, vec![0]);
    // every labelled peak keeps a label after the merge
    assert!(outcome.peak_labels.iter().all(|&l| l == 0));
    // the scratch directory is gone, its parent stays
    assert_eq!(std::fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
}

#[test]
fn test_missing_capability_is_reported() {
    let data = clean_data(1, 5);
    let rpc = RandomProjectionClustering::new(None, None);
    let err = rpc
        .run(&data.recording, &data.peaks, &params_for(&data))
        .unwrap_err();
    assert!(matches!(err, ClusteringError::MissingCapability(_)));
}

#[test]
fn test_unsupported_sparsity_method_is_rejected() {
    let data = clean_data(1, 5);
    let mut params = params_for(&data);
    params.sparsity.method = "amplitude".into();
    let err = RandomProjectionClustering::default()
        .run(&data.recording, &data.peaks, &params)
        .unwrap_err();
    match err {
        ClusteringError::UnsupportedSparsityMethod(name) => assert_eq!(name, "amplitude"),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_unsorted_peaks_are_rejected() {
    let data = clean_data(2, 5);
    let mut peaks = data.peaks.clone();
    peaks.swap(0, 1);
    let err = RandomProjectionClustering::default()
        .run(&data.recording, &peaks, &params_for(&data))
        .unwrap_err();
    assert!(matches!(err, ClusteringError::InvalidInput(_)));
}

/// Leaves every row unassigned.
struct NoClusters;

impl DensityClusterer for NoClusters {
    fn name(&self) -> &str {
        "no_clusters"
    }

    fn cluster(&self, features: &FeatureMatrix, _params: &HdbscanParams) -> Result<Vec<i64>> {
        Ok(vec![NOISE_LABEL; features.num_rows()])
    }
}

#[test]
fn test_no_clusters_labels_every_peak_as_noise() {
    let data = clean_data(2, 10);
    let rpc = RandomProjectionClustering::new(
        Some(Arc::new(NoClusters)),
        Some(Arc::new(TemplateMatchingDeduplicator)),
    );
    let outcome = rpc
        .run(&data.recording, &data.peaks, &params_for(&data))
        .unwrap();
    assert!(outcome.unit_ids.is_empty());
    assert_eq!(outcome.peak_labels.len(), data.peaks.len());
    assert!(outcome.peak_labels.iter().all(|&l| l == NOISE_LABEL));
    assert_eq!(outcome.raw_cluster_count, 0);
}

#[test]
fn test_zero_sample_template_window_is_rejected() {
    let data = clean_data(1, 40);
    let mut params = params_for(&data);
    params.sparsity.method = "snr".into();
    params.waveforms.ms_before = 0.0;
    params.waveforms.ms_after = 0.0;
    let err = RandomProjectionClustering::default()
        .run(&data.recording, &data.peaks, &params)
        .unwrap_err();
    assert!(matches!(err, ClusteringError::InvalidConfig(_)));

    // shorter than one sample at 10 kHz
    params.waveforms.ms_before = 0.05;
    params.waveforms.ms_after = 0.05;
    let err = RandomProjectionClustering::default()
        .run(&data.recording, &data.peaks, &params)
        .unwrap_err();
    assert!(matches!(err, ClusteringError::InvalidConfig(_)));
}
