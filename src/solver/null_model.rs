//! Null model: one migration rate shared by every edge, optionally with a residual
//! variance.
//!
//! Without residual variance the optimal rate has a closed form; the likelihood is
//! convex in the log-rate, so clamping it into the log-weight bounds gives the bounded
//! optimum. Otherwise the one or two log-parameters are fitted with `wolfe_bfgs` inside
//! a box.

use crate::error::{MigrationError, NumericalError};
use crate::graph::spatial::SpatialGraph;
use crate::objective::Objective;
use crate::types::{LogWeightBounds, NullModelOptions};
use ndarray::{Array1, array};
use serde::{Deserialize, Serialize};
use wolfe_bfgs::{Bfgs, BfgsError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullModelFit {
    pub log_rate: f64,
    pub rate: f64,
    pub residual_variance: Option<f64>,
    /// Unpenalized negative log-likelihood at the fitted parameters.
    pub value: f64,
    pub iterations: usize,
    pub grad_norm: f64,
}

#[derive(Clone, Copy)]
enum Residual {
    Fixed(f64),
    Estimate,
}

fn approx_same_point(a: &Array1<f64>, b: &Array1<f64>) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= 1e-12)
}

// Failed evaluations become a steep quadratic barrier so the line search backs off.
fn barrier_sample(z: &Array1<f64>) -> (f64, Array1<f64>) {
    const COST_BARRIER: f64 = 1e50;
    const GRAD_SCALE: f64 = 1e6;
    let mut grad = z.clone();
    for g in grad.iter_mut() {
        if !g.is_finite() || g.abs() < 1e-6 {
            *g = 1.0;
        }
    }
    grad *= GRAD_SCALE;
    (COST_BARRIER + 0.5 * z.dot(z), grad)
}

fn run_bfgs(
    graph: &SpatialGraph,
    objective: &Objective,
    residual: Residual,
    mut seed: Array1<f64>,
    bounds: &LogWeightBounds,
    options: &NullModelOptions,
) -> Result<NullModelFit, MigrationError> {
    let evaluate = |z: &Array1<f64>| -> Result<(f64, Array1<f64>), MigrationError> {
        match residual {
            Residual::Fixed(s2) => {
                let eval = objective.evaluate_null(graph, z[0], Some(s2))?;
                Ok((eval.value, array![eval.d_log_rate]))
            }
            Residual::Estimate => {
                let eval = objective.evaluate_null(graph, z[0], Some(z[1].exp()))?;
                let d_res = eval
                    .d_log_residual
                    .ok_or(NumericalError::NonFiniteValue("residual variance partial"))?;
                Ok((eval.value, array![eval.d_log_rate, d_res]))
            }
        }
    };

    let dim = seed.len();
    let mut lower = Array1::<f64>::from_elem(dim, -options.log_bound);
    let mut upper = Array1::<f64>::from_elem(dim, options.log_bound);
    lower[0] = lower[0].max(bounds.lower_or(f64::NEG_INFINITY));
    upper[0] = upper[0].min(bounds.upper_or(f64::INFINITY));
    for i in 0..dim {
        seed[i] = seed[i].max(lower[i]).min(upper[i]);
    }
    let mut last_eval: Option<(Array1<f64>, f64, Array1<f64>)> = None;
    let mut optimizer = Bfgs::new(seed, |z| {
        if let Some((z_c, cost_c, grad_c)) = &last_eval
            && approx_same_point(z, z_c)
        {
            return (*cost_c, grad_c.clone());
        }
        let sample = match evaluate(z) {
            Ok((cost, grad)) if cost.is_finite() && grad.iter().all(|v| v.is_finite()) => {
                (cost, grad)
            }
            Ok(_) => barrier_sample(z),
            Err(err) => {
                log::debug!("null model evaluation failed at {z}: {err}");
                barrier_sample(z)
            }
        };
        last_eval = Some((z.clone(), sample.0, sample.1.clone()));
        sample
    })
    .with_bounds(lower, upper, 1e-6)
    .with_tolerance(options.tolerance)
    .with_max_iterations(options.max_iterations)
    .with_no_improve_stop(1e-10, 8);

    let solution = match optimizer.run() {
        Ok(sol) => sol,
        Err(BfgsError::MaxIterationsReached { last_solution }) => {
            log::warn!("null model reached the iteration cap; using the last iterate");
            *last_solution
        }
        Err(BfgsError::LineSearchFailed { last_solution, .. }) => *last_solution,
        Err(err) => return Err(NumericalError::NullModelFailed(format!("{err:?}")).into()),
    };

    let z = solution.final_point.clone();
    let (value, grad) = evaluate(&z)?;
    let residual_variance = match residual {
        Residual::Fixed(s2) => Some(s2),
        Residual::Estimate => Some(z[1].exp()),
    };
    Ok(NullModelFit {
        log_rate: z[0],
        rate: z[0].exp(),
        residual_variance,
        value,
        iterations: solution.iterations,
        grad_norm: grad.dot(&grad).sqrt(),
    })
}

/// Fits the null model.
///
/// With [`crate::ResidualVariance::EstimateWithNull`] or
/// [`crate::ResidualVariance::PerNode`] the estimated `σ²` is stored back into
/// `objective`. The former uses it unchanged in later full fits; the latter starts every
/// node's residual variance from it.
pub fn fit_null_model(
    graph: &SpatialGraph,
    objective: &mut Objective,
    options: &NullModelOptions,
) -> Result<NullModelFit, MigrationError> {
    options.validate()?;
    let bounds = &options.bounds;
    let closed = bounds.clamp(objective.null_rate_closed_form(graph)?.ln());
    let fit = if objective.options().residual_variance.estimated_with_null() {
        let seed = array![closed, 0.0];
        let fit = run_bfgs(graph, objective, Residual::Estimate, seed, bounds, options)?;
        objective.set_residual_variance(fit.residual_variance)?;
        fit
    } else if let Some(s2) = objective.residual_variance() {
        run_bfgs(graph, objective, Residual::Fixed(s2), array![closed], bounds, options)?
    } else {
        let eval = objective.evaluate_null(graph, closed, None)?;
        NullModelFit {
            log_rate: closed,
            rate: closed.exp(),
            residual_variance: None,
            value: eval.value,
            iterations: 0,
            grad_norm: eval.d_log_rate.abs(),
        }
    };
    log::info!(
        "null model: w0 = {:.6e}, residual variance = {:?}, nll = {:.10e}",
        fit.rate,
        fit.residual_variance,
        fit.value
    );
    Ok(fit)
}

/// Log-rate of the null model under the objective's current residual variance and
/// within `bounds`, used to start a full fit.
pub(crate) fn null_log_rate(
    graph: &SpatialGraph,
    objective: &Objective,
    bounds: &LogWeightBounds,
) -> Result<f64, MigrationError> {
    let closed = bounds.clamp(objective.null_rate_closed_form(graph)?.ln());
    let Some(s2) = objective.active_residual_variance()? else {
        return Ok(closed);
    };
    // Keep the rate box wide enough to contain the caller's bounds.
    let mut options = NullModelOptions::default();
    for bound in [bounds.lower, bounds.upper].into_iter().flatten() {
        options.log_bound = options.log_bound.max(bound.abs() + 1.0);
    }
    let fit = run_bfgs(graph, objective, Residual::Fixed(s2), array![closed], bounds, &options)?;
    Ok(fit.log_rate)
}
