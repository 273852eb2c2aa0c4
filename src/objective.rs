//! Penalized negative log-likelihood of the observed-node covariance under the
//! graph Laplacian precision, with its closed-form gradient in log-weights.
//!
//! With `p` markers, `S̄` the centered empirical covariance, and `L_eff` the Schur
//! complement of the unobserved block,
//!
//! ```text
//! NLL(x) = p/2 [ tr(L_eff S̄) - log pdet(L_eff) ] + penalty(x)
//! ```
//!
//! When a residual variance `σ²` is in play the likelihood is taken over node contrasts
//! instead, which reduces to the form above at `σ² = 0`.

use crate::covariance::CovarianceModel;
use crate::error::{ConfigurationError, DataError, MigrationError, NumericalError};
use crate::graph::spatial::{GraphTopology, NodeBlock, SpatialGraph};
use crate::linalg::faer_ndarray::{FaerCholesky, fast_ab};
use crate::linalg::sparse_exact::{factorize_sparse_spd, solve_sparse_spd_multi};
use crate::linalg::utils::{symmetrize, trace_of_product};
use crate::types::{ObjectiveOptions, Penalty, ResidualVariance};
use faer::Side;
use ndarray::{Array1, Array2};
use std::sync::Arc;

/// Objective value and gradient at one weight state.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub value: f64,
    pub data_term: f64,
    pub penalty_term: f64,
    /// With respect to the log edge weights.
    pub gradient: Array1<f64>,
    /// With respect to per-node `log sigma_i^2`, node-id order. Only set when residual
    /// variances are fitted per node.
    pub residual_gradient: Option<Array1<f64>>,
}

impl Evaluation {
    /// Gradient over the stacked parameters `[x; z]`, or over `x` alone.
    pub fn stacked_gradient(&self) -> Array1<f64> {
        match &self.residual_gradient {
            None => self.gradient.clone(),
            Some(r) => self.gradient.iter().chain(r.iter()).copied().collect(),
        }
    }
}

/// Data term of the null model (all edges share one rate) and its partials.
#[derive(Debug, Clone, Copy)]
pub struct NullEvaluation {
    pub value: f64,
    pub d_log_rate: f64,
    pub d_log_residual: Option<f64>,
}

/// `L_eff` and `X = L_uu^{-1} L_uo`.
struct ReducedSystem {
    l_eff: Array2<f64>,
    harmonic: Array2<f64>,
}

struct DataTerm {
    value: f64,
    /// `∂/∂L_eff` of the data term.
    g: Array2<f64>,
    /// `∂/∂ log sigma_k^2` per observed node.
    d_log_residual: Option<Array1<f64>>,
}

/// Penalized NLL bound to one empirical covariance.
#[derive(Debug, Clone)]
pub struct Objective {
    empirical: Array2<f64>,
    n_markers: usize,
    samples_per_node: Array1<f64>,
    options: ObjectiveOptions,
    residual_variance: Option<f64>,
    topology: Arc<GraphTopology>,
}

fn check_lambda(lambda: f64) -> Result<(), ConfigurationError> {
    if !(lambda.is_finite() && lambda >= 0.0) {
        return Err(ConfigurationError::InvalidOption {
            name: "lambda",
            reason: format!("must be finite and >= 0, got {lambda}"),
        });
    }
    Ok(())
}

/// `C M C^T` for the contrast matrix `C` whose row `a` is `e_{a+1} - e_0`.
fn contrast(m: &Array2<f64>) -> Array2<f64> {
    let k = m.nrows() - 1;
    Array2::from_shape_fn((k, k), |(a, b)| {
        m[[a + 1, b + 1]] - m[[a + 1, 0]] - m[[0, b + 1]] + m[[0, 0]]
    })
}

/// `C^T M C`, the adjoint of [`contrast`].
fn lift(m: &Array2<f64>) -> Array2<f64> {
    let k = m.nrows();
    let mut out = Array2::<f64>::zeros((k + 1, k + 1));
    let row_sums = m.sum_axis(ndarray::Axis(1));
    let col_sums = m.sum_axis(ndarray::Axis(0));
    out[[0, 0]] = m.sum();
    for a in 0..k {
        out[[a + 1, 0]] = -row_sums[a];
        out[[0, a + 1]] = -col_sums[a];
        for b in 0..k {
            out[[a + 1, b + 1]] = m[[a, b]];
        }
    }
    out
}

fn reduce(graph: &SpatialGraph) -> Result<ReducedSystem, NumericalError> {
    let l_oo = graph.laplacian_block(NodeBlock::Observed, NodeBlock::Observed);
    let o = l_oo.nrows();
    if graph.unobserved().is_empty() {
        return Ok(ReducedSystem {
            l_eff: l_oo,
            harmonic: Array2::zeros((0, o)),
        });
    }
    let l_uo = graph.laplacian_block(NodeBlock::Unobserved, NodeBlock::Observed);
    let factor = factorize_sparse_spd(graph.unobserved_laplacian(), "L_uu")?;
    let harmonic = solve_sparse_spd_multi(&factor, &l_uo)?;
    let mut l_eff = l_oo - fast_ab(&l_uo.t(), &harmonic);
    symmetrize(&mut l_eff);
    Ok(ReducedSystem { l_eff, harmonic })
}

/// `(L_eff^+, log pdet L_eff)` through the SPD system `L_eff + J/o`.
fn pseudo_inverse(l_eff: &Array2<f64>) -> Result<(Array2<f64>, f64), NumericalError> {
    let o = l_eff.nrows();
    let shift = 1.0 / o as f64;
    let shifted = l_eff.mapv(|v| v + shift);
    let factor = shifted
        .cholesky(Side::Lower)
        .map_err(|_| NumericalError::NotPositiveDefinite {
            block: "L_eff + J/o",
        })?;
    let log_det = factor.log_det();
    if !log_det.is_finite() {
        return Err(NumericalError::NonFiniteValue("log pdet(L_eff)"));
    }
    let sigma = factor.inverse().mapv(|v| v - shift);
    Ok((sigma, log_det))
}

impl Objective {
    pub fn new(
        covariance: &CovarianceModel,
        options: ObjectiveOptions,
    ) -> Result<Self, MigrationError> {
        options.validate()?;
        let o = covariance.empirical_covariance().nrows();
        if o < 2 {
            return Err(DataError::TooFewObservedNodes(o).into());
        }
        let residual_variance = match options.residual_variance {
            ResidualVariance::Fixed(value) => Some(value),
            ResidualVariance::None
            | ResidualVariance::EstimateWithNull
            | ResidualVariance::PerNode => None,
        };
        Ok(Self {
            empirical: covariance.empirical_covariance().clone(),
            n_markers: covariance.n_markers(),
            samples_per_node: covariance.samples_per_node().clone(),
            options,
            residual_variance,
            topology: Arc::clone(covariance.topology()),
        })
    }

    pub fn options(&self) -> &ObjectiveOptions {
        &self.options
    }

    pub fn n_markers(&self) -> usize {
        self.n_markers
    }

    pub fn n_observed(&self) -> usize {
        self.empirical.nrows()
    }

    pub fn empirical_covariance(&self) -> &Array2<f64> {
        &self.empirical
    }

    /// Topology `S̄` was built on; every evaluated graph must match it.
    pub fn topology(&self) -> &GraphTopology {
        &self.topology
    }

    /// Whether per-node residual variances are fitted alongside the edge weights.
    pub fn fits_node_residuals(&self) -> bool {
        self.options.residual_variance == ResidualVariance::PerNode
    }

    /// Residual variance currently in use, if any.
    pub fn residual_variance(&self) -> Option<f64> {
        self.residual_variance
    }

    /// Overrides the residual variance. `None` drops back to the pure graph model.
    pub fn set_residual_variance(&mut self, value: Option<f64>) -> Result<(), ConfigurationError> {
        if let Some(v) = value
            && !(v.is_finite() && v >= 0.0)
        {
            return Err(ConfigurationError::InvalidOption {
                name: "residual_variance",
                reason: format!("must be finite and >= 0, got {v}"),
            });
        }
        self.residual_variance = value;
        Ok(())
    }

    /// Shared `sigma^2`: the fixed value, or the null-model estimate when one is required.
    pub(crate) fn active_residual_variance(&self) -> Result<Option<f64>, ConfigurationError> {
        if self.options.residual_variance.estimated_with_null() && self.residual_variance.is_none()
        {
            return Err(ConfigurationError::InvalidOption {
                name: "residual_variance",
                reason: "not estimated yet; fit the null model first".to_string(),
            });
        }
        Ok(self.residual_variance)
    }

    /// Per-node `log sigma_i^2` in node-id order: the graph's own values, or the shared
    /// null estimate on every node.
    pub(crate) fn node_log_residuals(
        &self,
        graph: &SpatialGraph,
    ) -> Result<Array1<f64>, ConfigurationError> {
        if let Some(z) = graph.node_log_residuals() {
            return Ok(z.clone());
        }
        match self.active_residual_variance()? {
            Some(s2) if s2 > 0.0 => Ok(Array1::from_elem(graph.topology().n_nodes(), s2.ln())),
            _ => Err(ConfigurationError::InvalidOption {
                name: "residual_variance",
                reason: "per-node fitting needs a positive starting variance".to_string(),
            }),
        }
    }

    /// `sigma_k^2` for each observed node, or `None` for the pure graph model.
    fn observed_residuals(
        &self,
        graph: &SpatialGraph,
    ) -> Result<Option<Array1<f64>>, ConfigurationError> {
        if self.fits_node_residuals() {
            let z = self.node_log_residuals(graph)?;
            return Ok(Some(Array1::from_iter(
                graph.observed().iter().map(|&node| z[node].exp()),
            )));
        }
        Ok(self
            .active_residual_variance()?
            .map(|s2| Array1::from_elem(self.n_observed(), s2)))
    }

    fn check_graph(&self, graph: &SpatialGraph) -> Result<(), ConfigurationError> {
        let topology = graph.topology();
        if std::ptr::eq(topology, self.topology.as_ref()) {
            return Ok(());
        }
        if topology.n_nodes() != self.topology.n_nodes() {
            return Err(ConfigurationError::TopologyMismatch("node counts"));
        }
        if topology.edges() != self.topology.edges() {
            return Err(ConfigurationError::TopologyMismatch("edges"));
        }
        if topology.observed() != self.topology.observed() {
            return Err(ConfigurationError::TopologyMismatch("observed nodes"));
        }
        if topology.samples_per_node() != self.topology.samples_per_node() {
            return Err(ConfigurationError::TopologyMismatch("sample counts"));
        }
        Ok(())
    }

    fn data_term(
        &self,
        reduced: &ReducedSystem,
        residuals: Option<&Array1<f64>>,
    ) -> Result<DataTerm, NumericalError> {
        let half_p = 0.5 * self.n_markers as f64;
        let (sigma, log_pdet) = pseudo_inverse(&reduced.l_eff)?;
        let Some(s2) = residuals else {
            let value = half_p * (trace_of_product(&reduced.l_eff, &self.empirical) - log_pdet);
            let g = (&self.empirical - &sigma) * half_p;
            return Ok(DataTerm {
                value,
                g,
                d_log_residual: None,
            });
        };

        let o = self.n_observed();
        let mut sigma0 = sigma.clone();
        for i in 0..o {
            sigma0[[i, i]] += s2[i] / self.samples_per_node[i];
        }
        let k = contrast(&sigma0);
        let s_hat = contrast(&self.empirical);
        let factor = k
            .cholesky(Side::Lower)
            .map_err(|_| NumericalError::NotPositiveDefinite {
                block: "contrast covariance",
            })?;
        let k_inv = factor.inverse();
        let k_inv_s = k_inv.dot(&s_hat);
        let value = half_p
            * (k_inv_s.diag().sum() + factor.log_det() - (o as f64).ln());
        let mut m = &k_inv - &k_inv_s.dot(&k_inv);
        symmetrize(&mut m);
        let h = lift(&m);
        let g = fast_ab(&sigma, &fast_ab(&h, &sigma)) * (-half_p);
        let d_log_residual =
            Array1::from_shape_fn(o, |i| half_p * s2[i] * h[[i, i]] / self.samples_per_node[i]);
        Ok(DataTerm {
            value,
            g,
            d_log_residual: Some(d_log_residual),
        })
    }

    /// `∂/∂x_e = w_e (t_i - t_j)^T G (t_i - t_j)` with `t` the harmonic-extension rows.
    fn edge_gradient(
        &self,
        graph: &SpatialGraph,
        reduced: &ReducedSystem,
        g: &Array2<f64>,
    ) -> Array1<f64> {
        let topology = graph.topology();
        let o = self.n_observed();
        let n = topology.n_nodes();
        let mut t = Array2::<f64>::zeros((n, o));
        for node in 0..n {
            match topology.block_of(node) {
                (NodeBlock::Observed, k) => t[[node, k]] = 1.0,
                (NodeBlock::Unobserved, m) => {
                    t.row_mut(node).assign(&reduced.harmonic.row(m).mapv(|v| -v));
                }
            }
        }
        let r = fast_ab(&t, g);
        let self_terms: Array1<f64> =
            Array1::from_iter((0..n).map(|node| r.row(node).dot(&t.row(node))));
        Array1::from_iter(graph.edges().iter().zip(graph.weights().iter()).map(|(edge, &w)| {
            let cross = r.row(edge.i).dot(&t.row(edge.j));
            w * (self_terms[edge.i] + self_terms[edge.j] - 2.0 * cross)
        }))
    }

    fn penalty(&self, log_weights: &Array1<f64>, graph: &SpatialGraph, lambda: f64) -> (f64, Array1<f64>) {
        match self.options.penalty {
            Penalty::Ridge => (
                lambda * log_weights.dot(log_weights),
                log_weights * (2.0 * lambda),
            ),
            Penalty::EdgeSmoothness => {
                let mut value = 0.0;
                let mut grad = Array1::<f64>::zeros(log_weights.len());
                for &(a, b) in graph.topology().adjacent_edge_pairs() {
                    let diff = log_weights[a] - log_weights[b];
                    value += diff * diff;
                    grad[a] += 2.0 * lambda * diff;
                    grad[b] -= 2.0 * lambda * diff;
                }
                (lambda * value, grad)
            }
        }
    }

    /// `residual_lambda * sum over edges (z_i - z_j)^2` on node log residual variances.
    fn residual_penalty(
        &self,
        z: &Array1<f64>,
        graph: &SpatialGraph,
        lambda: f64,
    ) -> (f64, Array1<f64>) {
        let strength = self.options.residual_lambda.unwrap_or(lambda);
        let mut value = 0.0;
        let mut grad = Array1::<f64>::zeros(z.len());
        for edge in graph.edges() {
            let diff = z[edge.i] - z[edge.j];
            value += diff * diff;
            grad[edge.i] += 2.0 * strength * diff;
            grad[edge.j] -= 2.0 * strength * diff;
        }
        (strength * value, grad)
    }

    /// Penalized NLL and gradient at the graph's current weights (and, when fitted per
    /// node, its residual variances).
    pub fn evaluate(&self, graph: &SpatialGraph, lambda: f64) -> Result<Evaluation, MigrationError> {
        check_lambda(lambda)?;
        self.check_graph(graph)?;
        let residuals = self.observed_residuals(graph)?;
        let reduced = reduce(graph)?;
        let data = self.data_term(&reduced, residuals.as_ref())?;
        let mut gradient = self.edge_gradient(graph, &reduced, &data.g);
        let (mut penalty_term, penalty_grad) = self.penalty(graph.log_weights(), graph, lambda);
        gradient += &penalty_grad;

        let residual_gradient = if self.fits_node_residuals() {
            let z = self.node_log_residuals(graph)?;
            let (value, mut grad) = self.residual_penalty(&z, graph, lambda);
            penalty_term += value;
            if let Some(d) = &data.d_log_residual {
                for (k, &node) in graph.observed().iter().enumerate() {
                    grad[node] += d[k];
                }
            }
            Some(grad)
        } else {
            None
        };

        let value = data.value + penalty_term;
        if !value.is_finite() {
            return Err(NumericalError::NonFiniteValue("objective value").into());
        }
        let all_finite = gradient
            .iter()
            .chain(residual_gradient.iter().flatten())
            .all(|g| g.is_finite());
        if !all_finite {
            return Err(NumericalError::NonFiniteValue("objective gradient").into());
        }
        Ok(Evaluation {
            value,
            data_term: data.value,
            penalty_term,
            gradient,
            residual_gradient,
        })
    }

    /// Unpenalized data term of the null model at `log_rate` on every edge, with
    /// `residual_variance` overriding the objective's own setting.
    pub fn evaluate_null(
        &self,
        graph: &SpatialGraph,
        log_rate: f64,
        residual_variance: Option<f64>,
    ) -> Result<NullEvaluation, MigrationError> {
        self.check_graph(graph)?;
        let mut uniform = graph.clone();
        uniform.set_uniform_log_weight(log_rate)?;
        let reduced = reduce(&uniform)?;
        let residuals = residual_variance.map(|s2| Array1::from_elem(self.n_observed(), s2));
        let data = self.data_term(&reduced, residuals.as_ref())?;
        let d_log_rate = self.edge_gradient(&uniform, &reduced, &data.g).sum();
        if !(data.value.is_finite() && d_log_rate.is_finite()) {
            return Err(NumericalError::NonFiniteValue("null model").into());
        }
        Ok(NullEvaluation {
            value: data.value,
            d_log_rate,
            d_log_residual: data.d_log_residual.map(|d| d.sum()),
        })
    }

    /// Closed-form null rate without residual variance: `w0 = (o - 1) / tr(L1_eff S̄)`,
    /// where `L1_eff` is the reduced Laplacian at unit weights.
    pub fn null_rate_closed_form(&self, graph: &SpatialGraph) -> Result<f64, MigrationError> {
        self.check_graph(graph)?;
        let mut unit = graph.clone();
        unit.set_uniform_log_weight(0.0)?;
        let reduced = reduce(&unit)?;
        let trace = trace_of_product(&reduced.l_eff, &self.empirical);
        if !(trace.is_finite() && trace > 0.0) {
            return Err(NumericalError::NonFiniteValue("null rate").into());
        }
        Ok((self.n_observed() as f64 - 1.0) / trace)
    }

    /// Fitted covariance of observed-node frequencies: `L_eff^+ + diag(σ_i²/n_i)`.
    pub fn model_covariance(&self, graph: &SpatialGraph) -> Result<Array2<f64>, MigrationError> {
        self.check_graph(graph)?;
        let residuals = self.observed_residuals(graph)?;
        let reduced = reduce(graph)?;
        let (mut sigma, _) = pseudo_inverse(&reduced.l_eff)?;
        if let Some(s2) = residuals {
            for i in 0..self.n_observed() {
                sigma[[i, i]] += s2[i] / self.samples_per_node[i];
            }
        }
        Ok(sigma)
    }

    /// Reduced Laplacian `L_eff` at the graph's current weights.
    pub fn effective_laplacian(&self, graph: &SpatialGraph) -> Result<Array2<f64>, MigrationError> {
        self.check_graph(graph)?;
        Ok(reduce(graph)?.l_eff)
    }

    /// Harmonic extension `-L_uu^{-1} L_uo` (unobserved x observed). Rows sum to one.
    pub fn harmonic_extension(&self, graph: &SpatialGraph) -> Result<Array2<f64>, MigrationError> {
        self.check_graph(graph)?;
        Ok(reduce(graph)?.harmonic.mapv(|v| -v))
    }
}
