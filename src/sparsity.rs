//! Channel sparsity of unit templates.
//!
//! A unit keeps the channels where its template stands out from the noise.
//! Units left with nothing are removed and their peaks become noise.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clusterer::NOISE_LABEL;
use crate::error::{ClusteringError, Result};
use crate::templates::Templates;

/// How the channel subset of a unit is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparsityMethod {
    /// Peak-to-peak amplitude over noise level at least `threshold`.
    Ptp,
    /// Amplitude at the peak sample over noise level at least `threshold`.
    Snr,
    /// The `num_channels` channels with the largest peak-to-peak amplitude.
    BestChannels,
    /// Channels within `radius_um` of the unit's largest channel.
    Radius,
}

impl FromStr for SparsityMethod {
    type Err = ClusteringError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ptp" => Ok(Self::Ptp),
            "snr" => Ok(Self::Snr),
            "best_channels" => Ok(Self::BestChannels),
            "radius" => Ok(Self::Radius),
            other => Err(ClusteringError::UnsupportedSparsityMethod(other.to_string())),
        }
    }
}

impl fmt::Display for SparsityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ptp => "ptp",
            Self::Snr => "snr",
            Self::BestChannels => "best_channels",
            Self::Radius => "radius",
        };
        write!(f, "{name}")
    }
}

/// Polarity looked at by the `snr` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakSign {
    Neg,
    Pos,
    Both,
}

fn default_method() -> String {
    "ptp".to_string()
}

fn default_threshold() -> f64 {
    0.25
}

fn default_peak_sign() -> PeakSign {
    PeakSign::Neg
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparsityParams {
    /// One of `ptp`, `snr`, `best_channels`, `radius`.
    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Channel count for `best_channels`.
    #[serde(default)]
    pub num_channels: Option<usize>,

    /// Radius for `radius`.
    #[serde(default)]
    pub radius_um: Option<f64>,

    #[serde(default = "default_peak_sign")]
    pub peak_sign: PeakSign,
}

impl Default for SparsityParams {
    fn default() -> Self {
        Self {
            method: default_method(),
            threshold: default_threshold(),
            num_channels: None,
            radius_um: None,
            peak_sign: default_peak_sign(),
        }
    }
}

impl SparsityParams {
    /// Parse the method name and check the options it needs.
    pub fn validate(&self) -> Result<SparsityMethod> {
        let method: SparsityMethod = self.method.parse()?;
        match method {
            SparsityMethod::Ptp | SparsityMethod::Snr if !self.threshold.is_finite() => Err(
                ClusteringError::config("sparsity threshold must be finite"),
            ),
            SparsityMethod::BestChannels if self.num_channels.unwrap_or(0) == 0 => Err(
                ClusteringError::config("best_channels sparsity needs num_channels >= 1"),
            ),
            SparsityMethod::Radius if !(self.radius_um.unwrap_or(0.0) > 0.0) => Err(
                ClusteringError::config("radius sparsity needs a positive radius_um"),
            ),
            _ => Ok(method),
        }
    }
}

fn ratio_passes(value: f32, noise: f32, threshold: f64) -> bool {
    // 0/0 is NaN and never passes
    (value as f64 / noise as f64) >= threshold
}

/// Channel subset per unit, ascending channel order.
pub fn compute_sparsity(
    templates: &Templates,
    noise_levels: &[f32],
    distances: &[Vec<f64>],
    params: &SparsityParams,
) -> Result<Vec<Vec<usize>>> {
    let method = params.validate()?;
    if noise_levels.len() != templates.num_channels {
        return Err(ClusteringError::input(format!(
            "{} noise levels for {} channels",
            noise_levels.len(),
            templates.num_channels
        )));
    }

    let masks = templates
        .templates
        .iter()
        .map(|t| {
            let ptp = t.ptp();
            let mut kept: Vec<usize> = match method {
                SparsityMethod::Ptp => t
                    .channels
                    .iter()
                    .zip(&ptp)
                    .filter(|(&ch, &v)| ratio_passes(v, noise_levels[ch], params.threshold))
                    .map(|(&ch, _)| ch)
                    .collect(),
                SparsityMethod::Snr if t.num_samples() == 0 => Vec::new(),
                SparsityMethod::Snr => {
                    let row = templates.nbefore.min(t.num_samples() - 1);
                    t.channels
                        .iter()
                        .enumerate()
                        .filter(|&(col, &ch)| {
                            let v = t.get(row, col);
                            let amp = match params.peak_sign {
                                PeakSign::Neg => -v,
                                PeakSign::Pos => v,
                                PeakSign::Both => v.abs(),
                            };
                            ratio_passes(amp, noise_levels[ch], params.threshold)
                        })
                        .map(|(_, &ch)| ch)
                        .collect()
                }
                SparsityMethod::BestChannels => {
                    let mut order: Vec<usize> = (0..t.channels.len()).collect();
                    order.sort_by(|&a, &b| ptp[b].total_cmp(&ptp[a]).then(a.cmp(&b)));
                    order
                        .into_iter()
                        .take(params.num_channels.unwrap_or(0))
                        .map(|col| t.channels[col])
                        .collect()
                }
                SparsityMethod::Radius => {
                    let radius = params.radius_um.unwrap_or(0.0);
                    let best = (0..t.channels.len())
                        .max_by(|&a, &b| ptp[a].total_cmp(&ptp[b]).then(b.cmp(&a)))
                        .map(|col| t.channels[col]);
                    match best {
                        Some(best) => t
                            .channels
                            .iter()
                            .copied()
                            .filter(|&ch| distances[best][ch] <= radius)
                            .collect(),
                        None => Vec::new(),
                    }
                }
            };
            kept.sort_unstable();
            kept
        })
        .collect();
    Ok(masks)
}

/// Restrict every template to its mask.
pub fn to_sparse(templates: &Templates, masks: &[Vec<usize>]) -> Result<Templates> {
    if masks.len() != templates.len() {
        return Err(ClusteringError::input(format!(
            "{} sparsity masks for {} units",
            masks.len(),
            templates.len()
        )));
    }
    let restricted = templates
        .templates
        .iter()
        .zip(masks)
        .map(|(t, m)| t.restrict(m))
        .collect::<Result<Vec<_>>>()?;
    Ok(Templates {
        templates: restricted,
        ..templates.clone()
    })
}

/// Drop units whose template has no channel or no signal. Returns the kept
/// templates and the removed unit ids.
pub fn remove_empty_templates(templates: &Templates) -> (Templates, Vec<i64>) {
    let removed: Vec<i64> = templates
        .unit_ids
        .iter()
        .zip(&templates.templates)
        .filter(|(_, t)| t.is_empty())
        .map(|(&u, _)| u)
        .collect();
    let kept = templates.retain_units(|u| !removed.contains(&u));
    (kept, removed)
}

/// Send the peaks of removed units to noise.
pub fn relabel_removed(labels: &mut [i64], removed: &[i64]) {
    if removed.is_empty() {
        return;
    }
    for l in labels.iter_mut() {
        if removed.contains(l) {
            *l = NOISE_LABEL;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::SparseTemplate;

    /// Two units on 4 channels, 3 samples, peak at row 1.
    fn bank() -> Templates {
        let dense = |cols: [[f32; 4]; 3]| SparseTemplate {
            channels: vec![0, 1, 2, 3],
            data: cols.concat(),
        };
        Templates {
            sampling_frequency: 1000.0,
            nbefore: 1,
            num_samples: 3,
            num_channels: 4,
            unit_ids: vec![0, 1],
            templates: vec![
                dense([[0.0, 0.0, 0.0, 0.0], [-8.0, -2.0, 0.5, 0.0], [2.0, 1.0, 0.0, 0.0]]),
                dense([[0.0; 4], [0.0, 0.0, 0.0, 0.1], [0.0; 4]]),
            ],
        }
    }

    fn distances() -> Vec<Vec<f64>> {
        (0..4)
            .map(|a| (0..4).map(|b| 10.0 * (a as f64 - b as f64).abs()).collect())
            .collect()
    }

    #[test]
    fn test_method_names() {
        assert_eq!("best_channels".parse::<SparsityMethod>().unwrap(), SparsityMethod::BestChannels);
        match "energy".parse::<SparsityMethod>() {
            Err(ClusteringError::UnsupportedSparsityMethod(name)) => assert_eq!(name, "energy"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ptp_threshold() {
        let params = SparsityParams {
            threshold: 2.0,
            ..Default::default()
        };
        let masks = compute_sparsity(&bank(), &[1.0; 4], &distances(), &params).unwrap();
        // ptp: 10, 3, 0.5, 0
        assert_eq!(masks[0], vec![0, 1]);
        assert!(masks[1].is_empty());
    }

    #[test]
    fn test_snr_uses_peak_sample_and_sign() {
        let mut params = SparsityParams {
            method: "snr".into(),
            threshold: 1.0,
            ..Default::default()
        };
        let masks = compute_sparsity(&bank(), &[1.0; 4], &distances(), &params).unwrap();
        assert_eq!(masks[0], vec![0, 1]);

        params.peak_sign = PeakSign::Pos;
        let masks = compute_sparsity(&bank(), &[0.25; 4], &distances(), &params).unwrap();
        assert_eq!(masks[0], vec![2]);
    }

    #[test]
    fn test_snr_on_zero_length_templates_is_empty() {
        let t = Templates {
            sampling_frequency: 1000.0,
            nbefore: 0,
            num_samples: 0,
            num_channels: 2,
            unit_ids: vec![0],
            templates: vec![SparseTemplate {
                channels: vec![0, 1],
                data: Vec::new(),
            }],
        };
        let params = SparsityParams {
            method: "snr".into(),
            ..Default::default()
        };
        let d = vec![vec![0.0, 10.0], vec![10.0, 0.0]];
        let masks = compute_sparsity(&t, &[1.0; 2], &d, &params).unwrap();
        assert_eq!(masks, vec![Vec::<usize>::new()]);
    }

    #[test]
    fn test_best_channels_and_radius() {
        let best = SparsityParams {
            method: "best_channels".into(),
            num_channels: Some(3),
            ..Default::default()
        };
        let masks = compute_sparsity(&bank(), &[1.0; 4], &distances(), &best).unwrap();
        assert_eq!(masks[0], vec![0, 1, 2]);

        let radius = SparsityParams {
            method: "radius".into(),
            radius_um: Some(15.0),
            ..Default::default()
        };
        let masks = compute_sparsity(&bank(), &[1.0; 4], &distances(), &radius).unwrap();
        assert_eq!(masks[0], vec![0, 1]);
        assert_eq!(masks[1], vec![2, 3]);
    }

    #[test]
    fn test_missing_options_rejected() {
        let best = SparsityParams {
            method: "best_channels".into(),
            ..Default::default()
        };
        assert!(matches!(best.validate(), Err(ClusteringError::InvalidConfig(_))));
    }

    #[test]
    fn test_masks_never_expand_and_empty_units_dropped() {
        let t = bank();
        let masks = compute_sparsity(&t, &[1.0; 4], &distances(), &SparsityParams::default()).unwrap();
        for m in &masks {
            assert!(m.iter().all(|&c| c < t.num_channels));
        }
        let sparse = to_sparse(&t, &masks).unwrap();
        let (kept, removed) = remove_empty_templates(&sparse);
        assert_eq!(kept.unit_ids, vec![0]);
        assert_eq!(removed, vec![1]);

        let mut labels = vec![0, 1, -1, 1];
        relabel_removed(&mut labels, &removed);
        assert_eq!(labels, vec![0, -1, -1, -1]);
    }
}
