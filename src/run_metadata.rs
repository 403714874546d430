//! Metadata written next to the clustering output.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clustering::ClusteringOutcome;
use crate::config::ClusteringParams;
use crate::error::Result;

/// Record of a completed clustering run.
/// Written as metadata.json alongside the labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    /// Parameters the run used, after defaults were filled in.
    pub params: ClusteringParams,

    /// Timestamp when the run started (ISO 8601).
    pub started_at: DateTime<Utc>,

    /// Timestamp when the run completed (ISO 8601).
    pub completed_at: DateTime<Utc>,

    pub run_duration_secs: f64,

    pub recording_path: PathBuf,

    /// SHA-256 hash of the recording file.
    pub recording_hash: String,

    pub peaks_path: PathBuf,

    /// SHA-256 hash of the peaks file.
    pub peaks_hash: String,

    /// SHA-256 hash of the parameter file, if one was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_hash: Option<String>,

    pub num_peaks: usize,
    pub raw_cluster_count: usize,
    pub empty_templates_removed: usize,
    pub units_before_merge: usize,
    pub num_units: usize,

    /// Peaks left unlabelled.
    pub num_noise_peaks: usize,

    /// rpclust version.
    pub rpclust_version: String,
}

impl RunMetadata {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: ClusteringParams,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        recording_path: &Path,
        peaks_path: &Path,
        params_path: Option<&Path>,
        outcome: &ClusteringOutcome,
    ) -> Result<Self> {
        let run_duration_secs = (completed_at - started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(Self {
            params,
            started_at,
            completed_at,
            run_duration_secs,
            recording_path: recording_path.to_path_buf(),
            recording_hash: sha256_file(recording_path)?,
            peaks_path: peaks_path.to_path_buf(),
            peaks_hash: sha256_file(peaks_path)?,
            params_hash: params_path.map(sha256_file).transpose()?,
            num_peaks: outcome.peak_labels.len(),
            raw_cluster_count: outcome.raw_cluster_count,
            empty_templates_removed: outcome.empty_templates_removed,
            units_before_merge: outcome.units_before_merge,
            num_units: outcome.unit_ids.len(),
            num_noise_peaks: outcome.peak_labels.iter().filter(|&&l| l < 0).count(),
            rpclust_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Hex SHA-256 digest of a file, streamed through the hasher.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(hex_digest(&hasher.finalize()))
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> ClusteringOutcome {
        ClusteringOutcome {
            unit_ids: vec![0, 1],
            peak_labels: vec![0, -1, 1, 1],
            raw_cluster_count: 3,
            empty_templates_removed: 0,
            units_before_merge: 3,
            templates: None,
        }
    }

    #[test]
    fn test_hash_file_is_sha256_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_streams_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        // larger than one read buffer
        std::fs::write(&path, vec![b'x'; 20_000]).unwrap();
        assert_eq!(sha256_file(&path).unwrap().len(), 64);
    }

    #[test]
    fn test_metadata_counts_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let rec = dir.path().join("recording.json");
        let peaks = dir.path().join("peaks.json");
        std::fs::write(&rec, "{}").unwrap();
        std::fs::write(&peaks, "[]").unwrap();

        let start = Utc::now();
        let meta = RunMetadata::new(
            ClusteringParams::default(),
            start,
            start + chrono::Duration::milliseconds(1500),
            &rec,
            &peaks,
            None,
            &outcome(),
        )
        .unwrap();
        assert_eq!(meta.num_units, 2);
        assert_eq!(meta.num_noise_peaks, 1);
        assert!((meta.run_duration_secs - 1.5).abs() < 1e-9);
        assert!(meta.params_hash.is_none());

        let out = dir.path().join("metadata.json");
        meta.save(&out).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(json["rawClusterCount"], 3);
        assert!(json.get("paramsHash").is_none());
    }

    #[test]
    fn test_missing_input_is_io_error() {
        let err = sha256_file(Path::new("/nonexistent/peaks.json")).unwrap_err();
        assert!(matches!(err, crate::error::ClusteringError::Io(_)));
    }
}
