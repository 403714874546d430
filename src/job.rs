//! Job execution parameters and the chunked executor.
//!
//! A recording is cut into fixed-size chunks per segment. Chunks are independent
//! units of work; [`map_chunks`] runs them on a worker pool and returns their
//! results in chunk order whatever the completion order was.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ClusteringError, Result};
use crate::recording::Recording;

/// Chunk duration used when no sizing option is given.
const DEFAULT_CHUNK_DURATION_S: f64 = 1.0;

/// Chunk duration forced on the duplicate-merge pass.
pub const MERGE_CHUNK_DURATION: &str = "100ms";

fn default_n_jobs() -> i64 {
    -1
}

/// Worker count for an `n_jobs` setting; negative values count back from the core count.
pub fn resolve_n_jobs(n_jobs: i64) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as i64;
    let n = if n_jobs < 0 { cores + 1 + n_jobs } else { n_jobs };
    n.max(1) as usize
}

/// How a chunked job is sized and scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobConfig {
    /// Worker count. `-1` uses every core, `-k` leaves `k - 1` cores free.
    #[serde(default = "default_n_jobs")]
    pub n_jobs: i64,

    /// Chunk length in samples. Takes precedence over every other sizing option.
    #[serde(default)]
    pub chunk_size: Option<usize>,

    /// Chunk length as a duration string ("1s", "100ms", "500us").
    #[serde(default)]
    pub chunk_duration: Option<String>,

    /// Memory per chunk ("10M", "500k", "1G"), converted with the sample width.
    #[serde(default)]
    pub chunk_memory: Option<String>,

    /// Memory across all workers; divided by the worker count.
    #[serde(default)]
    pub total_memory: Option<String>,

    #[serde(default)]
    pub progress_bar: bool,

    #[serde(default)]
    pub verbose: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            n_jobs: default_n_jobs(),
            chunk_size: None,
            chunk_duration: None,
            chunk_memory: None,
            total_memory: None,
            progress_bar: false,
            verbose: false,
        }
    }
}

impl JobConfig {
    /// Single worker, whole-chunk sizing given in samples.
    pub fn sequential(chunk_size: usize) -> Self {
        Self {
            n_jobs: 1,
            chunk_size: Some(chunk_size),
            ..Default::default()
        }
    }

    /// The conservative configuration used by duplicate merging: one worker,
    /// 100 ms chunks, silent.
    pub fn for_merge(&self) -> Self {
        Self {
            n_jobs: 1,
            chunk_size: None,
            chunk_duration: Some(MERGE_CHUNK_DURATION.to_string()),
            chunk_memory: None,
            total_memory: None,
            progress_bar: false,
            verbose: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_jobs == 0 {
            return Err(ClusteringError::config("n_jobs must be non-zero"));
        }
        if self.chunk_size == Some(0) {
            return Err(ClusteringError::config("chunk_size must be positive"));
        }
        if let Some(d) = &self.chunk_duration {
            parse_duration(d)?;
        }
        if let Some(m) = &self.chunk_memory {
            parse_memory(m)?;
        }
        if let Some(m) = &self.total_memory {
            parse_memory(m)?;
        }
        Ok(())
    }

    /// Concrete worker count.
    pub fn resolved_n_jobs(&self) -> usize {
        resolve_n_jobs(self.n_jobs)
    }

    /// Chunk length in samples for a recording.
    pub fn chunk_size_for(&self, recording: &dyn Recording) -> Result<usize> {
        let fs = recording.sampling_frequency();
        let bytes_per_frame = recording.num_channels() * std::mem::size_of::<f32>();

        let size = if let Some(size) = self.chunk_size {
            size
        } else if let Some(d) = &self.chunk_duration {
            (parse_duration(d)? * fs).round() as usize
        } else if let Some(m) = &self.chunk_memory {
            parse_memory(m)? / bytes_per_frame
        } else if let Some(m) = &self.total_memory {
            parse_memory(m)? / (bytes_per_frame * self.resolved_n_jobs())
        } else {
            (DEFAULT_CHUNK_DURATION_S * fs).round() as usize
        };

        Ok(size.max(1))
    }
}

/// Parse "1s", "100ms", "250us" or a bare number of seconds.
pub fn parse_duration(text: &str) -> Result<f64> {
    let t = text.trim();
    let (number, scale) = if let Some(v) = t.strip_suffix("ms") {
        (v, 1e-3)
    } else if let Some(v) = t.strip_suffix("us") {
        (v, 1e-6)
    } else if let Some(v) = t.strip_suffix('s') {
        (v, 1.0)
    } else {
        (t, 1.0)
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| ClusteringError::config(format!("cannot parse duration '{text}'")))?;
    if value <= 0.0 {
        return Err(ClusteringError::config(format!(
            "duration '{text}' must be positive"
        )));
    }
    Ok(value * scale)
}

/// Parse "500k", "10M", "1G" or a bare byte count.
pub fn parse_memory(text: &str) -> Result<usize> {
    let t = text.trim();
    let (number, scale) = match t.chars().last() {
        Some('k') => (&t[..t.len() - 1], 1e3),
        Some('M') => (&t[..t.len() - 1], 1e6),
        Some('G') => (&t[..t.len() - 1], 1e9),
        _ => (t, 1.0),
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| ClusteringError::config(format!("cannot parse memory size '{text}'")))?;
    if value <= 0.0 {
        return Err(ClusteringError::config(format!(
            "memory size '{text}' must be positive"
        )));
    }
    Ok((value * scale) as usize)
}

/// One unit of work: samples `[start, end)` of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Position in the global chunk order.
    pub index: usize,
    pub segment: usize,
    pub start: usize,
    pub end: usize,
}

/// Cut every segment into consecutive chunks of `chunk_size` samples.
/// Chunks are ordered by segment then time.
pub fn divide_into_chunks(recording: &dyn Recording, chunk_size: usize) -> Vec<ChunkRange> {
    let mut chunks = Vec::new();
    for segment in 0..recording.num_segments() {
        let len = recording.num_samples(segment);
        let mut start = 0;
        while start < len {
            let end = (start + chunk_size).min(len);
            chunks.push(ChunkRange {
                index: chunks.len(),
                segment,
                start,
                end,
            });
            start = end;
        }
    }
    chunks
}

/// Run `work` on every chunk and return the results in chunk order.
///
/// The first failing chunk aborts the job and its error is returned; no
/// partial results escape.
pub fn map_chunks<T, F>(
    chunks: &[ChunkRange],
    job: &JobConfig,
    job_name: &str,
    work: F,
) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(&ChunkRange) -> Result<T> + Sync,
{
    let n_jobs = job.resolved_n_jobs().min(chunks.len().max(1));
    let started = Instant::now();

    let progress = job.progress_bar.then(|| {
        let pb = ProgressBar::new(chunks.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} {bar:40.cyan/blue} {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb.set_message(job_name.to_string());
        pb
    });

    let run_one = |chunk: &ChunkRange| {
        let out = work(chunk);
        if let Some(pb) = &progress {
            pb.inc(1);
        }
        out
    };

    let results = if n_jobs == 1 {
        chunks.iter().map(run_one).collect::<Result<Vec<T>>>()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_jobs)
            .build()
            .map_err(|e| ClusteringError::config(format!("cannot start worker pool: {e}")))?;
        pool.install(|| chunks.par_iter().map(run_one).collect::<Result<Vec<T>>>())
    };

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    if job.verbose {
        log::info!(
            "{job_name}: {} chunks on {n_jobs} worker(s) in {:.2?}",
            chunks.len(),
            started.elapsed()
        );
    } else {
        log::debug!(
            "{job_name}: {} chunks on {n_jobs} worker(s) in {:.2?}",
            chunks.len(),
            started.elapsed()
        );
    }

    results
}
