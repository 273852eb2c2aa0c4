//! Fitting: L-BFGS over log edge weights, the null model, and regularization paths.

pub mod lbfgs;
pub mod null_model;
pub mod path;

use crate::error::{ConfigurationError, MigrationError};
use crate::graph::spatial::SpatialGraph;
use crate::objective::{Evaluation, Objective};
use crate::types::{FitOptions, FitResult};
use lbfgs::BoxBounds;
use ndarray::{Array1, s};

/// Fits log edge weights at penalty strength `lambda`.
///
/// Starts from `init` when given, otherwise from the null-model rate on every edge; the
/// start is projected into `options.bounds`. With [`crate::ResidualVariance::PerNode`]
/// the node log residual variances are fitted jointly, starting from the graph's own
/// values or the null estimate. On success `graph` holds the fitted state; on error it is
/// left as it was before the call. Hitting the iteration cap still returns `Ok`, flagged
/// by [`crate::Termination::MaxIterations`].
pub fn fit(
    graph: &mut SpatialGraph,
    objective: &Objective,
    lambda: f64,
    init: Option<&Array1<f64>>,
    options: &FitOptions,
) -> Result<FitResult, MigrationError> {
    let saved = graph.clone();
    let outcome = fit_in_place(graph, objective, lambda, init, options);
    if outcome.is_err() {
        *graph = saved;
    }
    outcome
}

fn fit_in_place(
    graph: &mut SpatialGraph,
    objective: &Objective,
    lambda: f64,
    init: Option<&Array1<f64>>,
    options: &FitOptions,
) -> Result<FitResult, MigrationError> {
    options.validate()?;
    let n_edges = graph.n_edges();
    let x0 = match init {
        Some(x) if x.len() != n_edges => {
            return Err(ConfigurationError::LengthMismatch {
                what: "initial log weights",
                expected: n_edges,
                found: x.len(),
            }
            .into());
        }
        Some(x) => x.clone(),
        None => Array1::from_elem(
            n_edges,
            null_model::null_log_rate(graph, objective, &options.bounds)?,
        ),
    };
    let start: Array1<f64> = if objective.fits_node_residuals() {
        let z0 = objective.node_log_residuals(graph)?;
        x0.iter().chain(z0.iter()).copied().collect()
    } else {
        x0
    };
    let bounds = BoxBounds::leading(&options.bounds, n_edges, start.len());

    let solution = lbfgs::minimize(
        start,
        &bounds,
        |theta| {
            apply(graph, theta, n_edges)?;
            let eval = objective.evaluate(graph, lambda)?;
            let gradient = eval.stacked_gradient();
            Ok(Evaluation {
                gradient,
                residual_gradient: None,
                ..eval
            })
        },
        options,
    )?;
    apply(graph, &solution.x, n_edges)?;
    log::info!(
        "fit at lambda {:.4e}: nll {:.10e} (data {:.10e}, penalty {:.4e}), {} iterations, |g| {:.3e}, {:?}",
        lambda,
        solution.evaluation.value,
        solution.evaluation.data_term,
        solution.evaluation.penalty_term,
        solution.iterations,
        solution.grad_norm,
        solution.termination
    );
    let log_weights = solution.x.slice(s![..n_edges]).to_owned();
    let log_residual_variances = objective
        .fits_node_residuals()
        .then(|| solution.x.slice(s![n_edges..]).to_owned());
    Ok(FitResult {
        log_weights,
        lambda,
        value: solution.evaluation.value,
        data_term: solution.evaluation.data_term,
        penalty_term: solution.evaluation.penalty_term,
        iterations: solution.iterations,
        grad_norm: solution.grad_norm,
        termination: solution.termination,
        residual_variance: objective.residual_variance(),
        log_residual_variances,
    })
}

/// Writes `[x; z]` (or `x` alone) into the graph.
fn apply(
    graph: &mut SpatialGraph,
    theta: &Array1<f64>,
    n_edges: usize,
) -> Result<(), MigrationError> {
    graph.set_weights(&theta.slice(s![..n_edges]).to_owned())?;
    if theta.len() > n_edges {
        graph.set_node_log_residuals(&theta.slice(s![n_edges..]).to_owned())?;
    }
    Ok(())
}
