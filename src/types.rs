use crate::error::ConfigurationError;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

pub fn default_snap_tolerance() -> f64 {
    0.0
}

pub fn default_history() -> usize {
    10
}

pub fn default_max_iterations() -> usize {
    500
}

pub fn default_grad_tol() -> f64 {
    1e-6
}

pub fn default_max_line_search() -> usize {
    50
}

pub fn default_max_step() -> f64 {
    5.0
}

pub fn default_min_step() -> f64 {
    1e-14
}

pub fn default_armijo_c1() -> f64 {
    1e-4
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidOption {
        name,
        reason: reason.into(),
    }
}

/// Options controlling graph construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOptions {
    /// Samples within this distance of the habitat boundary are accepted even when
    /// they fall outside the polygon. Zero disables snapping.
    #[serde(default = "default_snap_tolerance")]
    pub snap_tolerance: f64,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            snap_tolerance: default_snap_tolerance(),
        }
    }
}

impl GridOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.snap_tolerance.is_finite() || self.snap_tolerance < 0.0 {
            return Err(invalid(
                "snap_tolerance",
                format!("must be finite and non-negative, got {}", self.snap_tolerance),
            ));
        }
        Ok(())
    }
}

/// Binomial scaling of markers: each one is divided by `sqrt(mu (1 - mu))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrequencyScaling {
    /// Leave node frequencies unscaled.
    None,
    /// `mu` is the unweighted mean of the observed-node frequencies, so every node counts
    /// once however many samples it holds.
    #[default]
    NodeMean,
    /// `mu` is the allele frequency pooled over all samples.
    SampleMean,
}

/// Options for turning genotypes into the observed-node covariance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CovarianceOptions {
    #[serde(default)]
    pub scaling: FrequencyScaling,
}

/// Regularizer applied to the log-weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Penalty {
    /// `lambda * ||x||^2`
    #[default]
    Ridge,
    /// `lambda * sum over adjacent edge pairs (x_a - x_b)^2`
    EdgeSmoothness,
}

/// Treatment of node-level residual variance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum ResidualVariance {
    /// Pure graph covariance; the pseudo-determinant likelihood.
    #[default]
    None,
    /// Fixed `sigma^2`, scaled per node by `1 / n_i`.
    Fixed(f64),
    /// `sigma^2` is estimated jointly with the null rate and then held fixed.
    EstimateWithNull,
    /// One `sigma_i^2` per node, fitted on the log scale together with the edge
    /// weights and started from the null-model estimate. Neighbouring nodes are tied by
    /// `residual_lambda * sum over edges (z_i - z_j)^2`.
    PerNode,
}

impl ResidualVariance {
    /// Whether a shared `sigma^2` has to come from the null model before fitting.
    pub fn estimated_with_null(&self) -> bool {
        matches!(self, Self::EstimateWithNull | Self::PerNode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectiveOptions {
    #[serde(default)]
    pub penalty: Penalty,
    #[serde(default)]
    pub residual_variance: ResidualVariance,
    /// Smoothness strength for per-node log residual variances. `None` reuses the
    /// edge penalty's `lambda`.
    #[serde(default)]
    pub residual_lambda: Option<f64>,
}

impl ObjectiveOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let ResidualVariance::Fixed(value) = self.residual_variance
            && (!value.is_finite() || value < 0.0)
        {
            return Err(invalid(
                "residual_variance",
                format!("fixed residual variance must be finite and >= 0, got {value}"),
            ));
        }
        if let Some(value) = self.residual_lambda
            && !(value.is_finite() && value >= 0.0)
        {
            return Err(invalid(
                "residual_lambda",
                format!("must be finite and >= 0, got {value}"),
            ));
        }
        Ok(())
    }
}

/// Optional box on log edge weights, `lower <= x_e <= upper`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LogWeightBounds {
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

impl LogWeightBounds {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    pub fn lower_or(&self, fallback: f64) -> f64 {
        self.lower.unwrap_or(fallback)
    }

    pub fn upper_or(&self, fallback: f64) -> f64 {
        self.upper.unwrap_or(fallback)
    }

    pub fn clamp(&self, x: f64) -> f64 {
        x.max(self.lower_or(f64::NEG_INFINITY))
            .min(self.upper_or(f64::INFINITY))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, bound) in [("bounds.lower", self.lower), ("bounds.upper", self.upper)] {
            if let Some(value) = bound
                && !value.is_finite()
            {
                return Err(invalid(name, format!("must be finite, got {value}")));
            }
        }
        if let (Some(lower), Some(upper)) = (self.lower, self.upper)
            && lower >= upper
        {
            return Err(invalid(
                "bounds",
                format!("lower ({lower}) must be below upper ({upper})"),
            ));
        }
        Ok(())
    }
}

/// L-BFGS settings for the full edge-weight fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    #[serde(default = "default_history")]
    pub history: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_grad_tol")]
    pub grad_tol: f64,
    #[serde(default = "default_max_line_search")]
    pub max_line_search: usize,
    /// Upper bound on the Euclidean length of a trial step.
    #[serde(default = "default_max_step")]
    pub max_step: f64,
    /// Trial steps shorter than this end the line search unsuccessfully.
    #[serde(default = "default_min_step")]
    pub min_step: f64,
    #[serde(default = "default_armijo_c1")]
    pub armijo_c1: f64,
    /// Box on the log edge weights. Per-node residual variances are never bounded.
    #[serde(default)]
    pub bounds: LogWeightBounds,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            history: default_history(),
            max_iterations: default_max_iterations(),
            grad_tol: default_grad_tol(),
            max_line_search: default_max_line_search(),
            max_step: default_max_step(),
            min_step: default_min_step(),
            armijo_c1: default_armijo_c1(),
            bounds: LogWeightBounds::default(),
        }
    }
}

impl FitOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.history == 0 {
            return Err(invalid("history", "must be at least 1"));
        }
        if self.max_line_search == 0 {
            return Err(invalid("max_line_search", "must be at least 1"));
        }
        if !(self.grad_tol.is_finite() && self.grad_tol > 0.0) {
            return Err(invalid("grad_tol", format!("must be > 0, got {}", self.grad_tol)));
        }
        if !(self.max_step.is_finite() && self.max_step > 0.0) {
            return Err(invalid("max_step", format!("must be > 0, got {}", self.max_step)));
        }
        if !(self.min_step.is_finite() && self.min_step >= 0.0 && self.min_step < self.max_step)
        {
            return Err(invalid(
                "min_step",
                format!("must lie in [0, max_step), got {}", self.min_step),
            ));
        }
        if !(self.armijo_c1 > 0.0 && self.armijo_c1 < 1.0) {
            return Err(invalid(
                "armijo_c1",
                format!("must lie in (0, 1), got {}", self.armijo_c1),
            ));
        }
        self.bounds.validate()
    }
}

pub fn default_null_tolerance() -> f64 {
    1e-8
}

pub fn default_null_max_iterations() -> usize {
    200
}

pub fn default_log_bound() -> f64 {
    30.0
}

/// Settings for the low-dimensional null-model optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullModelOptions {
    #[serde(default = "default_null_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_null_max_iterations")]
    pub max_iterations: usize,
    /// Box bound on `|log w0|` and `|log sigma^2|`.
    #[serde(default = "default_log_bound")]
    pub log_bound: f64,
    /// Further restricts `log w0`, matching the box used by the full fit.
    #[serde(default)]
    pub bounds: LogWeightBounds,
}

impl Default for NullModelOptions {
    fn default() -> Self {
        Self {
            tolerance: default_null_tolerance(),
            max_iterations: default_null_max_iterations(),
            log_bound: default_log_bound(),
            bounds: LogWeightBounds::default(),
        }
    }
}

impl NullModelOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(invalid("tolerance", format!("must be > 0, got {}", self.tolerance)));
        }
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations", "must be at least 1"));
        }
        if !(self.log_bound.is_finite() && self.log_bound > 0.0) {
            return Err(invalid("log_bound", format!("must be > 0, got {}", self.log_bound)));
        }
        self.bounds.validate()?;
        if self.bounds.lower_or(-self.log_bound) >= self.log_bound
            || self.bounds.upper_or(self.log_bound) <= -self.log_bound
        {
            return Err(invalid("bounds", "does not intersect [-log_bound, log_bound]"));
        }
        Ok(())
    }
}

/// Why the optimizer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    Converged,
    MaxIterations,
}

/// Outcome of one penalized fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub log_weights: Array1<f64>,
    pub lambda: f64,
    /// Penalized negative log-likelihood at `log_weights`.
    pub value: f64,
    pub data_term: f64,
    pub penalty_term: f64,
    pub iterations: usize,
    pub grad_norm: f64,
    pub termination: Termination,
    #[serde(default)]
    pub residual_variance: Option<f64>,
    /// Fitted `log sigma_i^2` for every node, in node-id order, when residual variances
    /// are fitted per node.
    #[serde(default)]
    pub log_residual_variances: Option<Array1<f64>>,
}

impl FitResult {
    pub fn converged(&self) -> bool {
        self.termination == Termination::Converged
    }

    pub fn weights(&self) -> Array1<f64> {
        self.log_weights.mapv(f64::exp)
    }
}
