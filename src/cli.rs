use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::clustering::RandomProjectionClustering;
use crate::config::ClusteringParams;
use crate::peaks::load_peaks;
use crate::recording::RecordingFile;
use crate::run_metadata::RunMetadata;
use crate::synthetic::{generate, SyntheticParams};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster detected peaks into units
    Run {
        /// Recording JSON file
        #[arg(long)]
        recording: PathBuf,

        /// Peaks JSON file (array of peaks sorted by segment and sample)
        #[arg(long)]
        peaks: PathBuf,

        /// Clustering parameters JSON file; defaults when omitted
        #[arg(long)]
        params: Option<PathBuf>,

        /// Output directory for labels.json and metadata.json
        #[arg(long)]
        out: PathBuf,

        /// Worker count (overrides the parameter file)
        #[arg(long, allow_hyphen_values = true)]
        n_jobs: Option<i64>,

        /// Chunk duration, e.g. "1s" or "500ms" (overrides the parameter file)
        #[arg(long)]
        chunk_duration: Option<String>,

        /// Show a progress bar while extracting features
        #[arg(long)]
        progress: bool,
    },
    /// Write a synthetic recording with known ground truth
    Simulate {
        /// Output directory
        #[arg(long)]
        out_dir: PathBuf,

        /// Number of units
        #[arg(long, default_value_t = 3)]
        units: usize,

        /// Spikes fired by each unit
        #[arg(long, default_value_t = 100)]
        spikes_per_unit: usize,

        /// Standard deviation of additive noise
        #[arg(long, default_value_t = 1.0)]
        noise_std: f32,

        /// Random seed
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

/// What `run` writes as labels.json.
#[derive(Serialize)]
struct Labels<'a> {
    unit_ids: &'a [i64],
    peak_labels: &'a [i64],
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            recording,
            peaks,
            params,
            out,
            n_jobs,
            chunk_duration,
            progress,
        } => {
            let mut config = match &params {
                Some(path) => ClusteringParams::from_file(path)
                    .with_context(|| format!("Failed to load parameters from {:?}", path))?,
                None => ClusteringParams::default(),
            };
            if let Some(n) = n_jobs {
                config.job.n_jobs = n;
            }
            if let Some(d) = chunk_duration {
                config.job.chunk_size = None;
                config.job.chunk_duration = Some(d);
            }
            config.job.progress_bar |= progress;
            cluster_files(&recording, &peaks, params.as_deref(), config, &out)?;
        }
        Commands::Simulate {
            out_dir,
            units,
            spikes_per_unit,
            noise_std,
            seed,
        } => {
            let params = SyntheticParams {
                num_units: units,
                spikes_per_unit,
                noise_std,
                seed,
                ..Default::default()
            };
            let data = generate(&params)?;
            data.save(&out_dir)
                .with_context(|| format!("Failed to write synthetic data to {:?}", out_dir))?;
            println!(
                "Wrote {} peaks from {} units to {:?}",
                data.peaks.len(),
                units,
                out_dir
            );
        }
    }
    Ok(())
}

fn cluster_files(
    recording_path: &Path,
    peaks_path: &Path,
    params_path: Option<&Path>,
    params: ClusteringParams,
    out_dir: &Path,
) -> Result<()> {
    let started_at = chrono::Utc::now();
    let recording = RecordingFile::load(recording_path)
        .with_context(|| format!("Failed to load recording {:?}", recording_path))?;
    let peaks = load_peaks(peaks_path)
        .with_context(|| format!("Failed to load peaks {:?}", peaks_path))?;
    log::info!("Clustering {} peaks", peaks.len());

    let outcome = RandomProjectionClustering::default().run(&recording, &peaks, &params)?;
    let completed_at = chrono::Utc::now();

    std::fs::create_dir_all(out_dir)?;
    let labels = Labels {
        unit_ids: &outcome.unit_ids,
        peak_labels: &outcome.peak_labels,
    };
    std::fs::write(out_dir.join("labels.json"), serde_json::to_string(&labels)?)?;

    let metadata = RunMetadata::new(
        params,
        started_at,
        completed_at,
        recording_path,
        peaks_path,
        params_path,
        &outcome,
    )?;
    metadata.save(&out_dir.join("metadata.json"))?;

    println!(
        "Found {} units ({} raw clusters) in {:.2}s",
        outcome.unit_ids.len(),
        outcome.raw_cluster_count,
        metadata.run_duration_secs
    );
    Ok(())
}
