//! Savitzky-Golay smoothing of sparse snippets.
//!
//! Every sample is replaced by the value at that position of the least-squares
//! polynomial fitted over a sliding window. Near the ends of a snippet, where a
//! centred window does not fit, the polynomial fitted to the first (or last)
//! full window is evaluated instead.

use crate::error::{ClusteringError, Result};
use crate::pipeline::{parent, ChunkContext, NodeOutput, PipelineNode};
use crate::recording::Recording;
use crate::waveforms::{ms_to_samples, WaveformBatch};

/// Projection matrix of a polynomial least-squares fit over a fixed window.
///
/// Row `i` holds the weights that produce the fitted value at window position
/// `i` from the window's samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SavgolKernel {
    window: usize,
    hat: Vec<f64>,
}

impl SavgolKernel {
    /// `window` must be odd. The polynomial order is capped at `window - 1`.
    pub fn new(window: usize, order: usize) -> Result<Self> {
        if window == 0 || window % 2 == 0 {
            return Err(ClusteringError::config(format!(
                "savgol window must be a positive odd length, got {window}"
            )));
        }
        let m = order.min(window - 1) + 1;
        let half = (window / 2) as f64;

        // Vandermonde matrix on centred abscissae
        let a: Vec<Vec<f64>> = (0..window)
            .map(|i| {
                let x = i as f64 - half;
                let mut xi = 1.0;
                (0..m)
                    .map(|_| {
                        let v = xi;
                        xi *= x;
                        v
                    })
                    .collect()
            })
            .collect();

        let mut ata = vec![vec![0.0; m]; m];
        for (i, row) in ata.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = (0..window).map(|k| a[k][i] * a[k][j]).sum();
            }
        }
        let at: Vec<Vec<f64>> = (0..m).map(|j| (0..window).map(|k| a[k][j]).collect()).collect();

        // X = (A^T A)^-1 A^T, then H = A X
        let x = gauss_jordan(ata, at)?;
        let mut hat = vec![0.0; window * window];
        for i in 0..window {
            for k in 0..window {
                hat[i * window + k] = (0..m).map(|j| a[i][j] * x[j][k]).sum();
            }
        }
        Ok(Self { window, hat })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    #[inline]
    fn weight(&self, row: usize, col: usize) -> f64 {
        self.hat[row * self.window + col]
    }

    /// Smooth `signal`, which must hold at least `window` samples.
    pub fn apply(&self, signal: &[f32]) -> Vec<f32> {
        let n = signal.len();
        let w = self.window;
        if n < w {
            return signal.to_vec();
        }
        let half = w / 2;
        (0..n)
            .map(|i| {
                let (start, row) = if i < half {
                    (0, i)
                } else if i >= n - half {
                    (n - w, i - (n - w))
                } else {
                    (i - half, half)
                };
                (0..w)
                    .map(|k| self.weight(row, k) * signal[start + k] as f64)
                    .sum::<f64>() as f32
            })
            .collect()
    }
}

/// Solve `lhs · X = rhs` for a square `lhs` with partial pivoting.
fn gauss_jordan(mut lhs: Vec<Vec<f64>>, mut rhs: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>> {
    let m = lhs.len();
    for i in 0..m {
        let pivot_row = (i..m)
            .max_by(|&p, &q| lhs[p][i].abs().total_cmp(&lhs[q][i].abs()))
            .unwrap_or(i);
        lhs.swap(i, pivot_row);
        rhs.swap(i, pivot_row);

        let pivot = lhs[i][i];
        if pivot.abs() < 1e-12 {
            return Err(ClusteringError::config(
                "savgol normal equations are singular",
            ));
        }
        for v in lhs[i].iter_mut() {
            *v /= pivot;
        }
        for v in rhs[i].iter_mut() {
            *v /= pivot;
        }

        for r in 0..m {
            if r == i {
                continue;
            }
            let factor = lhs[r][i];
            if factor == 0.0 {
                continue;
            }
            for c in 0..m {
                lhs[r][c] -= factor * lhs[i][c];
            }
            for c in 0..rhs[r].len() {
                rhs[r][c] -= factor * rhs[i][c];
            }
        }
    }
    Ok(rhs)
}

/// Odd window length in samples for `window_length_ms`, at least 1.
pub fn window_samples(window_length_ms: f64, sampling_frequency: f64) -> usize {
    let w = ms_to_samples(window_length_ms, sampling_frequency).max(1);
    if w % 2 == 0 {
        w + 1
    } else {
        w
    }
}

/// Largest odd length not above `limit` (0 when `limit` is 0).
fn shrink_to_odd(window: usize, limit: usize) -> usize {
    let w = window.min(limit);
    if w % 2 == 0 {
        w.saturating_sub(1)
    } else {
        w
    }
}

/// Smooths every channel of every snippet; parents are `[peaks, waveforms]`.
pub struct SavGolDenoiser {
    kernel: SavgolKernel,
    order: usize,
}

impl SavGolDenoiser {
    pub fn new(recording: &dyn Recording, window_length_ms: f64, order: usize) -> Result<Self> {
        if !(window_length_ms > 0.0) {
            return Err(ClusteringError::config(
                "smoothing window_length_ms must be positive",
            ));
        }
        let window = window_samples(window_length_ms, recording.sampling_frequency());
        Ok(Self {
            kernel: SavgolKernel::new(window, order)?,
            order,
        })
    }

    fn kernel_for(&self, num_samples: usize) -> Result<Option<SavgolKernel>> {
        if num_samples >= self.kernel.window() {
            return Ok(Some(self.kernel.clone()));
        }
        match shrink_to_odd(self.kernel.window(), num_samples) {
            0 | 1 => Ok(None),
            w => SavgolKernel::new(w, self.order).map(Some),
        }
    }

    fn smooth(&self, batch: &WaveformBatch) -> Result<WaveformBatch> {
        let mut out = batch.clone();
        let mut kernels: Vec<(usize, Option<SavgolKernel>)> = Vec::new();
        for wf in out.waveforms.iter_mut().flatten() {
            if !kernels.iter().any(|(n, _)| *n == wf.num_samples) {
                kernels.push((wf.num_samples, self.kernel_for(wf.num_samples)?));
            }
            let Some((_, Some(kernel))) = kernels.iter().find(|(n, _)| *n == wf.num_samples) else {
                continue;
            };
            for c in 0..wf.channels.len() {
                let smoothed = kernel.apply(&wf.column(c));
                wf.set_column(c, &smoothed);
            }
        }
        Ok(out)
    }
}

impl PipelineNode for SavGolDenoiser {
    fn name(&self) -> &str {
        "savgol_denoiser"
    }

    fn compute(&self, _ctx: &ChunkContext, parents: &[&NodeOutput]) -> Result<NodeOutput> {
        let peaks = parent(self.name(), parents, 0, NodeOutput::as_peaks)?;
        let waveforms = parent(self.name(), parents, 1, NodeOutput::as_waveforms)?;
        if peaks.len() != waveforms.waveforms.len() {
            return Err(ClusteringError::Graph(format!(
                "{} peaks but {} snippets",
                peaks.len(),
                waveforms.waveforms.len()
            )));
        }
        Ok(NodeOutput::Waveforms(self.smooth(waveforms)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::InMemoryRecording;
    use crate::waveforms::SparseWaveform;

    #[test]
    fn test_cubic_is_reproduced_including_edges() {
        let kernel = SavgolKernel::new(7, 3).unwrap();
        let signal: Vec<f32> = (0..20)
            .map(|i| {
                let x = i as f32 * 0.1;
                0.5 * x * x * x - x * x + 2.0 * x - 1.0
            })
            .collect();
        let smoothed = kernel.apply(&signal);
        for (a, b) in signal.iter().zip(&smoothed) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_linear_fit_averages_noise() {
        // order 1 over 3 samples is a 3-point moving average in the interior
        let kernel = SavgolKernel::new(3, 1).unwrap();
        let out = kernel.apply(&[0.0, 3.0, 0.0, 3.0, 0.0]);
        assert!((out[1] - 1.0).abs() < 1e-6);
        assert!((out[2] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_even_window_is_rejected() {
        assert!(SavgolKernel::new(4, 2).is_err());
        assert!(SavgolKernel::new(0, 0).is_err());
    }

    #[test]
    fn test_window_samples_forced_odd() {
        // 0.25 ms at 30 kHz = 7.5 -> 7
        assert_eq!(window_samples(0.25, 30_000.0), 7);
        // 0.2 ms at 30 kHz = 6 -> 7
        assert_eq!(window_samples(0.2, 30_000.0), 7);
        assert_eq!(window_samples(0.01, 1000.0), 1);
    }

    #[test]
    fn test_denoiser_keeps_shape_and_channels() {
        let rec = InMemoryRecording::linear_probe(30_000.0, 4, 10.0, vec![vec![0.0; 400]]).unwrap();
        let node = SavGolDenoiser::new(&rec, 0.25, 3).unwrap();
        let wf = SparseWaveform {
            channels: vec![1, 3],
            num_samples: 10,
            data: (0..20).map(|i| if i % 3 == 0 { 1.0 } else { 0.0 }).collect(),
        };
        let batch = WaveformBatch {
            offset: 4,
            waveforms: vec![Some(wf), None],
        };
        let out = node.smooth(&batch).unwrap();
        assert_eq!(out.offset, 4);
        assert!(out.waveforms[1].is_none());
        let smoothed = out.waveforms[0].as_ref().unwrap();
        assert_eq!(smoothed.channels, vec![1, 3]);
        assert_eq!(smoothed.data.len(), 20);
    }

    #[test]
    fn test_short_snippet_uses_shrunk_window() {
        let rec = InMemoryRecording::linear_probe(30_000.0, 1, 10.0, vec![vec![0.0; 10]]).unwrap();
        let node = SavGolDenoiser::new(&rec, 0.25, 3).unwrap();
        let k = node.kernel_for(4).unwrap().unwrap();
        assert_eq!(k.window(), 3);
        assert!(node.kernel_for(1).unwrap().is_none());
    }
}
