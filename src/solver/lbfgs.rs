use crate::error::{MigrationError, NumericalError};
use crate::objective::Evaluation;
use crate::types::{FitOptions, LogWeightBounds, Termination};
use ndarray::{Array1, Zip};
use std::collections::VecDeque;

/// Per-coordinate box `lower <= x <= upper`; infinite ends leave a side open.
#[derive(Debug, Clone)]
pub struct BoxBounds {
    lower: Array1<f64>,
    upper: Array1<f64>,
}

impl BoxBounds {
    pub fn unbounded(n: usize) -> Self {
        Self {
            lower: Array1::from_elem(n, f64::NEG_INFINITY),
            upper: Array1::from_elem(n, f64::INFINITY),
        }
    }

    /// `bounds` on the first `n_bounded` coordinates, the rest free.
    pub fn leading(bounds: &LogWeightBounds, n_bounded: usize, n: usize) -> Self {
        let mut out = Self::unbounded(n);
        for i in 0..n_bounded.min(n) {
            out.lower[i] = bounds.lower_or(f64::NEG_INFINITY);
            out.upper[i] = bounds.upper_or(f64::INFINITY);
        }
        out
    }

    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    pub fn project(&self, x: &mut Array1<f64>) {
        Zip::from(x)
            .and(&self.lower)
            .and(&self.upper)
            .for_each(|v, &lo, &hi| *v = v.max(lo).min(hi));
    }

    fn blocked(&self, x: &Array1<f64>, grad: &Array1<f64>, i: usize) -> bool {
        (x[i] <= self.lower[i] && grad[i] > 0.0) || (x[i] >= self.upper[i] && grad[i] < 0.0)
    }

    /// Gradient with the components that push against an active bound removed.
    fn projected_gradient(&self, x: &Array1<f64>, grad: &Array1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(grad.len(), |i| {
            if self.blocked(x, grad, i) { 0.0 } else { grad[i] }
        })
    }
}

/// Final state of an L-BFGS run.
#[derive(Debug, Clone)]
pub struct LbfgsSolution {
    pub x: Array1<f64>,
    pub evaluation: Evaluation,
    pub iterations: usize,
    pub grad_norm: f64,
    pub termination: Termination,
}

struct CurvaturePair {
    s: Array1<f64>,
    y: Array1<f64>,
    rho: f64,
}

fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

/// Two-loop recursion: returns `-H g` for the implicit inverse-Hessian `H`.
fn search_direction(grad: &Array1<f64>, history: &VecDeque<CurvaturePair>) -> Array1<f64> {
    let mut q = grad.clone();
    let mut alphas = Vec::with_capacity(history.len());
    for pair in history.iter().rev() {
        let a = pair.rho * pair.s.dot(&q);
        q.scaled_add(-a, &pair.y);
        alphas.push(a);
    }
    let gamma = history
        .back()
        .map(|pair| pair.s.dot(&pair.y) / pair.y.dot(&pair.y))
        .unwrap_or(1.0);
    let mut r = q * gamma;
    for (pair, &a) in history.iter().zip(alphas.iter().rev()) {
        let b = pair.rho * pair.y.dot(&r);
        r.scaled_add(a - b, &pair.s);
    }
    r.mapv_inplace(|v| -v);
    r
}

/// Minimizes a smooth function over a box with projected L-BFGS and Armijo backtracking.
///
/// `x0` is projected into `bounds` first. Coordinates held at a bound by the gradient are
/// left out of the search direction, trial points are projected back into the box, and
/// convergence is judged on the projected gradient.
///
/// An error at the starting point is returned as is. During the line search, numerical
/// errors are treated like a rejected step and halve the step length; other errors are
/// returned. If no step passes the sufficient-decrease test the run fails with
/// [`NumericalError::LineSearchFailed`]. Running out of iterations is not an error.
pub fn minimize<F>(
    x0: Array1<f64>,
    bounds: &BoxBounds,
    mut evaluate: F,
    options: &FitOptions,
) -> Result<LbfgsSolution, MigrationError>
where
    F: FnMut(&Array1<f64>) -> Result<Evaluation, MigrationError>,
{
    options.validate()?;
    if bounds.dim() != x0.len() {
        return Err(crate::error::ConfigurationError::LengthMismatch {
            what: "bounds",
            expected: x0.len(),
            found: bounds.dim(),
        }
        .into());
    }
    let mut x = x0;
    bounds.project(&mut x);
    let mut current = evaluate(&x)?;
    let mut history: VecDeque<CurvaturePair> = VecDeque::with_capacity(options.history);

    for iter in 0..options.max_iterations {
        let projected = bounds.projected_gradient(&x, &current.gradient);
        let grad_norm = norm(&projected);
        if grad_norm <= options.grad_tol {
            log::debug!(
                "L-BFGS converged after {iter} iterations: value {:.10e}, |g| {:.3e}",
                current.value,
                grad_norm
            );
            return Ok(LbfgsSolution {
                x,
                evaluation: current,
                iterations: iter,
                grad_norm,
                termination: Termination::Converged,
            });
        }

        let mut direction = search_direction(&current.gradient, &history);
        for i in 0..direction.len() {
            if bounds.blocked(&x, &current.gradient, i) {
                direction[i] = 0.0;
            }
        }
        let slope = current.gradient.dot(&direction);
        if !(slope.is_finite() && slope < 0.0) {
            log::debug!("L-BFGS iter {iter}: direction is not a descent direction; resetting");
            history.clear();
            direction = projected.mapv(|v| -v);
        }
        let direction_norm = norm(&direction);
        let mut alpha = (options.max_step / direction_norm).min(1.0);

        let mut accepted = None;
        for _ in 0..options.max_line_search {
            if alpha * direction_norm < options.min_step {
                break;
            }
            let mut trial = x.clone();
            trial.scaled_add(alpha, &direction);
            bounds.project(&mut trial);
            let step = &trial - &x;
            if norm(&step) < options.min_step {
                break;
            }
            // Armijo on the projected step; equals `alpha * slope` away from the bounds.
            let decrease = current.gradient.dot(&step);
            match evaluate(&trial) {
                Ok(eval) if eval.value <= current.value + options.armijo_c1 * decrease => {
                    accepted = Some((trial, eval));
                    break;
                }
                Ok(_) => {}
                Err(err) if err.is_numerical() => {
                    log::debug!("L-BFGS iter {iter}: trial step {alpha:.3e} failed: {err}");
                }
                Err(err) => return Err(err),
            }
            alpha *= 0.5;
        }
        let Some((trial, eval)) = accepted else {
            return Err(NumericalError::LineSearchFailed {
                iteration: iter + 1,
                grad_norm,
            }
            .into());
        };

        let s = &trial - &x;
        let y = &eval.gradient - &current.gradient;
        let sy = s.dot(&y);
        if sy > f64::EPSILON * norm(&s) * norm(&y) && sy > 0.0 {
            if history.len() == options.history {
                history.pop_front();
            }
            history.push_back(CurvaturePair { s, y, rho: 1.0 / sy });
        }
        log::debug!(
            "L-BFGS iter {}: value {:.10e} -> {:.10e}, step {:.3e}, |g| {:.3e}",
            iter + 1,
            current.value,
            eval.value,
            alpha,
            grad_norm
        );
        x = trial;
        current = eval;
    }

    let grad_norm = norm(&bounds.projected_gradient(&x, &current.gradient));
    let termination = if grad_norm <= options.grad_tol {
        Termination::Converged
    } else {
        log::warn!(
            "L-BFGS stopped at the iteration cap ({}) with |g| {:.3e}",
            options.max_iterations,
            grad_norm
        );
        Termination::MaxIterations
    };
    Ok(LbfgsSolution {
        x,
        evaluation: current,
        iterations: options.max_iterations,
        grad_norm,
        termination,
    })
}
