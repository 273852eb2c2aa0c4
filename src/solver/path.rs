//! Regularization paths over a grid of penalty strengths.

use crate::error::{ConfigurationError, MigrationError, NumericalError};
use crate::graph::spatial::SpatialGraph;
use crate::objective::Objective;
use crate::solver::{fit, null_model};
use crate::types::{FitOptions, FitResult};
use ndarray::Array1;
use rayon::prelude::*;

/// Scores a fitted path point; lower is better.
pub trait PathCriterion {
    fn score(&mut self, lambda: f64, graph: &SpatialGraph, result: &FitResult) -> f64;
}

impl<F> PathCriterion for F
where
    F: FnMut(f64, &SpatialGraph, &FitResult) -> f64,
{
    fn score(&mut self, lambda: f64, graph: &SpatialGraph, result: &FitResult) -> f64 {
        self(lambda, graph, result)
    }
}

/// One λ on a path: either a fit with its score, or the numerical failure that stopped it.
#[derive(Debug, Clone)]
pub struct PathPoint {
    pub lambda: f64,
    pub result: Option<FitResult>,
    pub score: Option<f64>,
    pub failure: Option<NumericalError>,
}

impl PathPoint {
    fn fitted(lambda: f64, result: FitResult, score: f64) -> Self {
        Self {
            lambda,
            result: Some(result),
            score: Some(score),
            failure: None,
        }
    }

    fn failed(lambda: f64, failure: NumericalError) -> Self {
        Self {
            lambda,
            result: None,
            score: None,
            failure: Some(failure),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RegularizationPath {
    pub points: Vec<PathPoint>,
    /// Index into `points` of the lowest finite score.
    pub best: Option<usize>,
}

impl RegularizationPath {
    fn from_points(points: Vec<PathPoint>) -> Self {
        let best = points
            .iter()
            .enumerate()
            .filter_map(|(idx, point)| point.score.filter(|s| s.is_finite()).map(|s| (idx, s)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(idx, _)| idx);
        Self { points, best }
    }

    pub fn best_point(&self) -> Option<&PathPoint> {
        self.best.map(|idx| &self.points[idx])
    }

    pub fn best_lambda(&self) -> Option<f64> {
        self.best_point().map(|point| point.lambda)
    }

    /// Fitted result at the best λ.
    pub fn best_result(&self) -> Option<&FitResult> {
        self.best_point().and_then(|point| point.result.as_ref())
    }
}

fn check_lambdas(lambdas: &[f64]) -> Result<(), ConfigurationError> {
    if lambdas.is_empty() {
        return Err(ConfigurationError::InvalidOption {
            name: "lambdas",
            reason: "at least one penalty strength is required".to_string(),
        });
    }
    if let Some(bad) = lambdas.iter().find(|l| !(l.is_finite() && **l >= 0.0)) {
        return Err(ConfigurationError::InvalidOption {
            name: "lambdas",
            reason: format!("penalty strengths must be finite and >= 0, got {bad}"),
        });
    }
    Ok(())
}

/// `count` log-spaced values from `max` down to `min`.
pub fn lambda_grid(min: f64, max: f64, count: usize) -> Result<Vec<f64>, ConfigurationError> {
    if count == 0 || !(min.is_finite() && max.is_finite() && min > 0.0 && min <= max) {
        return Err(ConfigurationError::InvalidOption {
            name: "lambda_grid",
            reason: format!("need 0 < min <= max and count >= 1, got ({min}, {max}, {count})"),
        });
    }
    if count == 1 {
        return Ok(vec![max]);
    }
    let (lo, hi) = (min.ln(), max.ln());
    let step = (hi - lo) / (count - 1) as f64;
    Ok((0..count)
        .map(|k| if k + 1 == count { min } else { (hi - k as f64 * step).exp() })
        .collect())
}

/// Fits every λ in order, warm-starting each fit from the previous successful one
/// (edge weights and, when fitted, node residual variances).
///
/// Each fit runs on its own clone of `graph`. A numerical failure at the first λ aborts
/// the path; later failures are recorded and the path continues from the last success.
pub fn fit_regularization_path<C>(
    graph: &SpatialGraph,
    objective: &Objective,
    lambdas: &[f64],
    criterion: &mut C,
    options: &FitOptions,
) -> Result<RegularizationPath, MigrationError>
where
    C: PathCriterion + ?Sized,
{
    check_lambdas(lambdas)?;
    options.validate()?;
    let mut warm: Option<Array1<f64>> = None;
    let mut warm_residuals: Option<Array1<f64>> = None;
    let mut points = Vec::with_capacity(lambdas.len());
    for (idx, &lambda) in lambdas.iter().enumerate() {
        let mut local = graph.clone();
        if let Some(z) = &warm_residuals {
            local.set_node_log_residuals(z)?;
        }
        match fit(&mut local, objective, lambda, warm.as_ref(), options) {
            Ok(result) => {
                let score = criterion.score(lambda, &local, &result);
                log::debug!(
                    "path point {}/{}: lambda {:.4e}, nll {:.6e}, score {:.6e}",
                    idx + 1,
                    lambdas.len(),
                    lambda,
                    result.value,
                    score
                );
                warm = Some(result.log_weights.clone());
                warm_residuals = result.log_residual_variances.clone();
                points.push(PathPoint::fitted(lambda, result, score));
            }
            Err(MigrationError::Numerical(err)) if idx > 0 => {
                log::warn!("path point lambda {lambda:.4e} failed: {err}");
                points.push(PathPoint::failed(lambda, err));
            }
            Err(err) => return Err(err),
        }
    }
    let path = RegularizationPath::from_points(points);
    if let Some(best) = path.best_lambda() {
        log::info!("regularization path: best lambda {best:.4e}");
    }
    Ok(path)
}

/// Fits every λ independently from the null start, in parallel.
///
/// Numerical failures are recorded per point; other errors abort.
pub fn fit_lambda_grid_parallel<C>(
    graph: &SpatialGraph,
    objective: &Objective,
    lambdas: &[f64],
    criterion: &C,
    options: &FitOptions,
) -> Result<RegularizationPath, MigrationError>
where
    C: Fn(f64, &SpatialGraph, &FitResult) -> f64 + Sync,
{
    check_lambdas(lambdas)?;
    options.validate()?;
    let rate = null_model::null_log_rate(graph, objective, &options.bounds)?;
    let start = Array1::from_elem(graph.n_edges(), rate);
    let outcomes: Vec<Result<PathPoint, MigrationError>> = lambdas
        .par_iter()
        .map(|&lambda| {
            let mut local = graph.clone();
            match fit(&mut local, objective, lambda, Some(&start), options) {
                Ok(result) => {
                    let score = criterion(lambda, &local, &result);
                    Ok(PathPoint::fitted(lambda, result, score))
                }
                Err(MigrationError::Numerical(err)) => {
                    log::warn!("grid point lambda {lambda:.4e} failed: {err}");
                    Ok(PathPoint::failed(lambda, err))
                }
                Err(err) => Err(err),
            }
        })
        .collect();
    let points = outcomes.into_iter().collect::<Result<Vec<_>, _>>()?;
    Ok(RegularizationPath::from_points(points))
}
