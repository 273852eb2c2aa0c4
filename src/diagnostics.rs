//! Fitted versus empirical covariance, the genetic distances derived from them, and
//! outlier pairs whose empirical distance falls well short of the fit.

use crate::error::{ConfigurationError, DataError, MigrationError};
use crate::graph::spatial::SpatialGraph;
use crate::objective::Objective;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

// Added to every mixture component variance.
const MIXTURE_VARIANCE_FLOOR: f64 = 1e-6;
const MIXTURE_MAX_ITER: usize = 500;

/// `D_ij = C_ii + C_jj - 2 C_ij`.
pub fn covariance_to_distance(covariance: &Array2<f64>) -> Array2<f64> {
    let diag = covariance.diag();
    Array2::from_shape_fn(covariance.raw_dim(), |(i, j)| {
        diag[i] + diag[j] - 2.0 * covariance[[i, j]]
    })
}

/// Double centering, `S = -1/2 (D - r_i - c_j + m)`. Inverts
/// [`covariance_to_distance`] for centered covariances.
pub fn distance_to_covariance(distance: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = distance.dim();
    if rows == 0 || cols == 0 {
        return Array2::zeros((rows, cols));
    }
    let row_mean = distance.sum_axis(Axis(1)) / cols as f64;
    let col_mean = distance.sum_axis(Axis(0)) / rows as f64;
    let total = distance.sum() / (rows * cols) as f64;
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        -0.5 * (distance[[i, j]] - row_mean[i] - col_mean[j] + total)
    })
}

#[derive(Debug, Clone)]
pub struct FitDiagnostics {
    pub fitted_covariance: Array2<f64>,
    pub empirical_covariance: Array2<f64>,
    pub fitted_distance: Array2<f64>,
    pub empirical_distance: Array2<f64>,
}

impl FitDiagnostics {
    /// Diagnostics at the graph's current weights.
    pub fn compute(graph: &SpatialGraph, objective: &Objective) -> Result<Self, MigrationError> {
        let fitted_covariance = objective.model_covariance(graph)?;
        let empirical_covariance = objective.empirical_covariance().clone();
        Ok(Self {
            fitted_distance: covariance_to_distance(&fitted_covariance),
            empirical_distance: covariance_to_distance(&empirical_covariance),
            fitted_covariance,
            empirical_covariance,
        })
    }

    /// `(fitted, empirical)` distances for every observed pair `i < j`.
    pub fn distance_pairs(&self) -> Vec<(f64, f64)> {
        let o = self.fitted_distance.nrows();
        let mut pairs = Vec::with_capacity(o * o.saturating_sub(1) / 2);
        for i in 0..o {
            for j in (i + 1)..o {
                pairs.push((self.fitted_distance[[i, j]], self.empirical_distance[[i, j]]));
            }
        }
        pairs
    }

    /// Pearson correlation of fitted and empirical pairwise distances. `None` when
    /// either side has no variance.
    pub fn distance_correlation(&self) -> Option<f64> {
        let pairs = self.distance_pairs();
        if pairs.len() < 2 {
            return None;
        }
        let n = pairs.len() as f64;
        let mean_f = pairs.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_e = pairs.iter().map(|p| p.1).sum::<f64>() / n;
        let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
        for &(f, e) in &pairs {
            sxy += (f - mean_f) * (e - mean_e);
            sxx += (f - mean_f).powi(2);
            syy += (e - mean_e).powi(2);
        }
        if sxx <= 0.0 || syy <= 0.0 {
            return None;
        }
        Some(sxy / (sxx * syy).sqrt())
    }
}

/// One observed pair, `nodes` as graph node ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierPair {
    pub nodes: (usize, usize),
    pub fitted: f64,
    pub empirical: f64,
    /// `log(empirical / fitted)`, centered and scaled to unit sample variance.
    pub scaled_log_ratio: f64,
    /// Lower-tail standard normal probability of `scaled_log_ratio`.
    pub p_value: f64,
    /// Selected by Benjamini-Hochberg at the report's FDR.
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierReport {
    /// Sorted by `scaled_log_ratio`, most negative first.
    pub pairs: Vec<OutlierPair>,
    pub fdr: f64,
    /// `2 (ll_2 - ll_1)` for two- versus one-component Gaussian fits to the scaled ratios.
    pub mixture_statistic: f64,
}

impl OutlierReport {
    pub fn significant(&self) -> impl Iterator<Item = &OutlierPair> {
        self.pairs.iter().filter(|pair| pair.significant)
    }
}

/// Pairs whose empirical distance is much shorter than the fit predicts, at the graph's
/// current state. Candidates for long-range gene flow the surface cannot express.
pub fn extract_outliers(
    graph: &SpatialGraph,
    objective: &Objective,
    fdr: f64,
) -> Result<OutlierReport, MigrationError> {
    FitDiagnostics::compute(graph, objective)?.outliers(graph.observed(), fdr)
}

/// `Φ(x)` via Abramowitz-Stegun 26.2.17; the lower tail is computed directly.
fn normal_cdf(x: f64) -> f64 {
    let z = x.abs().min(30.0);
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let poly = ((((1.330_274_429 * t - 1.821_255_978) * t + 1.781_477_937) * t - 0.356_563_782)
        * t
        + 0.319_381_530)
        * t;
    let tail = (-0.5 * z * z).exp() / (2.0 * PI).sqrt() * poly;
    if x >= 0.0 { 1.0 - tail } else { tail }
}

/// Step-up Benjamini-Hochberg: rejects the `k` smallest p-values for the largest `k`
/// with `p_(k) <= k fdr / m`.
fn benjamini_hochberg(p_values: &[f64], fdr: f64) -> Vec<bool> {
    let m = p_values.len();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));
    let cutoff = order
        .iter()
        .enumerate()
        .filter(|&(rank, &idx)| p_values[idx] <= fdr * (rank + 1) as f64 / m as f64)
        .map(|(rank, _)| rank + 1)
        .last()
        .unwrap_or(0);
    let mut significant = vec![false; m];
    for &idx in &order[..cutoff] {
        significant[idx] = true;
    }
    significant
}

fn log_normal_density(x: f64, mean: f64, var: f64) -> f64 {
    -0.5 * ((2.0 * PI * var).ln() + (x - mean).powi(2) / var)
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let hi = a.max(b);
    if hi == f64::NEG_INFINITY {
        return hi;
    }
    hi + ((a - hi).exp() + (b - hi).exp()).ln()
}

/// Likelihood-ratio statistic of a two-component over a one-component Gaussian fit.
///
/// EM starts from the lower and upper halves of the sorted data, so the result is
/// deterministic.
fn mixture_statistic(x: &[f64]) -> f64 {
    let n = x.len();
    if n < 4 {
        return 0.0;
    }
    let mean = x.iter().sum::<f64>() / n as f64;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64 + MIXTURE_VARIANCE_FLOOR;
    let ll1: f64 = x.iter().map(|&v| log_normal_density(v, mean, var)).sum();

    let mut sorted = x.to_vec();
    sorted.sort_by(f64::total_cmp);
    let (lower, upper) = sorted.split_at(n / 2);
    let moments = |part: &[f64]| {
        let m = part.iter().sum::<f64>() / part.len() as f64;
        let v = part.iter().map(|p| (p - m).powi(2)).sum::<f64>() / part.len() as f64;
        (m, v + MIXTURE_VARIANCE_FLOOR)
    };
    let mut components = [moments(lower), moments(upper)];
    let mut weights: [f64; 2] = [0.5, 0.5];
    let mut resp = vec![0.0; n];
    let mut ll2 = f64::NEG_INFINITY;
    for _ in 0..MIXTURE_MAX_ITER {
        // E step: responsibility of the first component.
        let mut ll = 0.0;
        for (r, &v) in resp.iter_mut().zip(x) {
            let a = weights[0].ln() + log_normal_density(v, components[0].0, components[0].1);
            let b = weights[1].ln() + log_normal_density(v, components[1].0, components[1].1);
            let total = log_sum_exp(a, b);
            *r = (a - total).exp();
            ll += total;
        }
        let converged = ll - ll2 < 1e-10 * ll.abs().max(1.0);
        ll2 = ll2.max(ll);
        if converged {
            break;
        }
        // M step.
        for (k, component) in components.iter_mut().enumerate() {
            let w = |r: f64| if k == 0 { r } else { 1.0 - r };
            let mass: f64 = resp.iter().map(|&r| w(r)).sum();
            if mass <= f64::EPSILON {
                continue;
            }
            let m = resp.iter().zip(x).map(|(&r, &v)| w(r) * v).sum::<f64>() / mass;
            let v = resp
                .iter()
                .zip(x)
                .map(|(&r, &v)| w(r) * (v - m).powi(2))
                .sum::<f64>()
                / mass;
            *component = (m, v + MIXTURE_VARIANCE_FLOOR);
            weights[k] = mass / n as f64;
        }
    }
    (2.0 * (ll2 - ll1)).max(0.0)
}

impl FitDiagnostics {
    /// Outlier scan over every observed pair; `observed` maps rows to node ids.
    ///
    /// Pairs with a non-positive or non-finite distance on either side are left out.
    pub fn outliers(&self, observed: &[usize], fdr: f64) -> Result<OutlierReport, MigrationError> {
        if !(fdr > 0.0 && fdr < 1.0) {
            return Err(ConfigurationError::InvalidOption {
                name: "fdr",
                reason: format!("must lie in (0, 1), got {fdr}"),
            }
            .into());
        }
        let o = self.fitted_distance.nrows();
        if observed.len() != o {
            return Err(ConfigurationError::LengthMismatch {
                what: "observed node ids",
                expected: o,
                found: observed.len(),
            }
            .into());
        }
        if o < 3 {
            return Err(DataError::TooFewObservedNodes(o).into());
        }

        let mut kept = Vec::with_capacity(o * (o - 1) / 2);
        for i in 0..o {
            for j in (i + 1)..o {
                let fitted = self.fitted_distance[[i, j]];
                let empirical = self.empirical_distance[[i, j]];
                if fitted > 0.0 && empirical > 0.0 && fitted.is_finite() && empirical.is_finite() {
                    kept.push((i, j, fitted, empirical, (empirical / fitted).ln()));
                } else {
                    log::warn!(
                        "outlier scan skips nodes {} and {}: distances {fitted:.3e} (fit), {empirical:.3e} (data)",
                        observed[i],
                        observed[j]
                    );
                }
            }
        }

        let n = kept.len();
        let mean = kept.iter().map(|k| k.4).sum::<f64>() / n.max(1) as f64;
        let sd = if n > 1 {
            (kept.iter().map(|k| (k.4 - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            0.0
        };
        let scaled: Vec<f64> = kept
            .iter()
            .map(|k| if sd > 0.0 { (k.4 - mean) / sd } else { 0.0 })
            .collect();
        let p_values: Vec<f64> = scaled.iter().map(|&z| normal_cdf(z)).collect();
        let significant = benjamini_hochberg(&p_values, fdr);
        let mixture_statistic = if sd > 0.0 { mixture_statistic(&scaled) } else { 0.0 };

        let mut pairs: Vec<OutlierPair> = kept
            .iter()
            .zip(scaled.iter().zip(p_values.iter().zip(significant.iter())))
            .map(|(&(i, j, fitted, empirical, _), (&z, (&p, &sig)))| OutlierPair {
                nodes: (observed[i], observed[j]),
                fitted,
                empirical,
                scaled_log_ratio: z,
                p_value: p,
                significant: sig,
            })
            .collect();
        pairs.sort_by(|a, b| a.scaled_log_ratio.total_cmp(&b.scaled_log_ratio));
        let report = OutlierReport {
            pairs,
            fdr,
            mixture_statistic,
        };
        log::info!(
            "outlier scan: {} of {} pairs significant at FDR {fdr}, mixture statistic {:.3}",
            report.significant().count(),
            report.pairs.len(),
            report.mixture_statistic
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn diagnostics(empirical: Array2<f64>) -> FitDiagnostics {
        let o = empirical.nrows();
        let fitted = Array2::from_shape_fn((o, o), |(i, j)| if i == j { 0.0 } else { 1.0 });
        FitDiagnostics {
            fitted_covariance: Array2::zeros((o, o)),
            empirical_covariance: Array2::zeros((o, o)),
            fitted_distance: fitted,
            empirical_distance: empirical,
        }
    }

    // Off-diagonal distances near one, with the (1, 5) pair pulled in to 0.2.
    fn one_short_pair(o: usize) -> Array2<f64> {
        let mut d = Array2::from_shape_fn((o, o), |(i, j)| {
            if i == j { 0.0 } else { 1.0 + 0.02 * ((i + j) as f64 + (i * j) as f64).sin() }
        });
        d[[1, 5]] = 0.2;
        d[[5, 1]] = 0.2;
        d
    }

    #[test]
    fn normal_cdf_matches_reference_values() {
        assert_abs_diff_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-7);
        assert_abs_diff_eq!(normal_cdf(-1.959_963_985), 0.025, epsilon = 1e-7);
        assert_abs_diff_eq!(normal_cdf(1.0), 0.841_344_746, epsilon = 1e-7);
        // Deep lower tail does not cancel to zero; Φ(-8) = 6.22e-16.
        let p = normal_cdf(-8.0);
        assert!(p > 5e-16 && p < 7.5e-16, "{p}");
    }

    #[test]
    fn benjamini_hochberg_steps_up() {
        assert_eq!(
            benjamini_hochberg(&[0.01, 0.04, 0.03, 0.2], 0.1),
            vec![true, true, true, false]
        );
        // 0.02 misses its own threshold but is carried by 0.03 at rank two.
        assert_eq!(benjamini_hochberg(&[0.9, 0.03, 0.02], 0.05), vec![false, true, true]);
        assert_eq!(benjamini_hochberg(&[0.5, 0.6], 0.05), vec![false, false]);
    }

    #[test]
    fn mixture_statistic_separates_bimodal_from_unimodal() {
        let unimodal: Vec<f64> = (0..40).map(|k| (k as f64 - 19.5) / 11.0).collect();
        let bimodal: Vec<f64> = (0..40)
            .map(|k| if k % 2 == 0 { -1.0 } else { 1.0 } + 0.01 * (k as f64).sin())
            .collect();
        let flat = mixture_statistic(&unimodal);
        let split = mixture_statistic(&bimodal);
        assert!(flat >= 0.0);
        assert!(split > 100.0, "bimodal statistic {split}");
        assert!(split > flat);
    }

    #[test]
    fn short_pair_is_flagged_and_sorted_first() {
        let ids: Vec<usize> = (10..18).collect();
        let report = diagnostics(one_short_pair(8)).outliers(&ids, 0.1).expect("outliers");
        assert_eq!(report.pairs.len(), 28);
        let first = &report.pairs[0];
        assert_eq!(first.nodes, (11, 15));
        assert!(first.significant);
        assert!(first.p_value < 1e-4);
        assert_eq!(report.significant().count(), 1);
        for w in report.pairs.windows(2) {
            assert!(w[0].scaled_log_ratio <= w[1].scaled_log_ratio);
        }
        let mean: f64 = report.pairs.iter().map(|p| p.scaled_log_ratio).sum::<f64>() / 28.0;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
        assert!(report.mixture_statistic >= 0.0);
    }

    #[test]
    fn degenerate_pairs_and_bad_input_are_handled() {
        let mut d = one_short_pair(6);
        d[[0, 2]] = 0.0;
        d[[2, 0]] = 0.0;
        let ids: Vec<usize> = (0..6).collect();
        let report = diagnostics(d.clone()).outliers(&ids, 0.05).expect("outliers");
        assert_eq!(report.pairs.len(), 14);
        assert!(report.pairs.iter().all(|p| p.nodes != (0, 2)));

        assert!(matches!(
            diagnostics(d.clone()).outliers(&ids, 1.0),
            Err(MigrationError::Configuration(ConfigurationError::InvalidOption { name: "fdr", .. }))
        ));
        assert!(matches!(
            diagnostics(d).outliers(&ids[..5], 0.1),
            Err(MigrationError::Configuration(ConfigurationError::LengthMismatch { .. }))
        ));
        let small = array![[0.0, 1.0], [1.0, 0.0]];
        assert!(matches!(
            diagnostics(small).outliers(&[0, 1], 0.1),
            Err(MigrationError::Data(DataError::TooFewObservedNodes(2)))
        ));
    }

    #[test]
    fn distance_and_covariance_round_trip_for_centered_input() {
        let s = array![[0.5, -0.2, -0.3], [-0.2, 0.4, -0.2], [-0.3, -0.2, 0.5]];
        let d = covariance_to_distance(&s);
        assert_abs_diff_eq!(d[[0, 0]], 0.0, epsilon = 0.0);
        assert_abs_diff_eq!(d[[0, 1]], 1.3, epsilon = 1e-14);
        let back = distance_to_covariance(&d);
        for (a, b) in back.iter().zip(s.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-14);
        }
    }
}
