//! Empirical covariance of allele frequencies at observed nodes.

use crate::error::{DataError, MigrationError};
use crate::graph::spatial::{GraphTopology, SpatialGraph};
use crate::linalg::faer_ndarray::fast_ata;
use crate::types::{CovarianceOptions, FrequencyScaling};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::sync::Arc;

/// Centered observed-node covariance `S̄ = Xc^T Xc / p` built from a genotype matrix.
///
/// Genotypes are consumed once; only per-node frequencies and `S̄` are retained.
#[derive(Debug, Clone)]
pub struct CovarianceModel {
    empirical: Array2<f64>,
    frequencies: Array2<f64>,
    samples_per_node: Array1<f64>,
    n_markers: usize,
    n_dropped: usize,
    topology: Arc<GraphTopology>,
}

impl CovarianceModel {
    /// `genotypes` is markers x samples with entries in `[0, 2]`; `NaN` marks a missing
    /// call. Columns follow the sample order used to build `graph`.
    pub fn new(
        genotypes: ArrayView2<'_, f64>,
        graph: &SpatialGraph,
        options: &CovarianceOptions,
    ) -> Result<Self, MigrationError> {
        let topology = graph.topology();
        let (n_markers_in, n_samples) = genotypes.dim();
        if n_markers_in == 0 {
            return Err(DataError::NoMarkers.into());
        }
        if n_samples != topology.n_samples() {
            return Err(DataError::SampleCountMismatch {
                expected: topology.n_samples(),
                found: n_samples,
            }
            .into());
        }

        let mut kept = Vec::with_capacity(n_markers_in);
        let mut sample_freq = Vec::with_capacity(n_markers_in);
        for (marker, row) in genotypes.axis_iter(Axis(0)).enumerate() {
            if row.iter().all(|g| g.is_nan()) {
                return Err(DataError::AllMissingMarker { marker }.into());
            }
            for (sample, &g) in row.iter().enumerate() {
                if g.is_nan() {
                    return Err(DataError::MissingGenotype { marker, sample }.into());
                }
                if !g.is_finite() || !(0.0..=2.0).contains(&g) {
                    return Err(DataError::InvalidGenotype {
                        marker,
                        sample,
                        value: g,
                    }
                    .into());
                }
            }
            if row.iter().all(|&g| g == 0.0) || row.iter().all(|&g| g == 2.0) {
                continue;
            }
            kept.push(marker);
            sample_freq.push(row.sum() / (2.0 * n_samples as f64));
        }
        let n_dropped = n_markers_in - kept.len();
        if n_dropped > 0 {
            log::warn!("dropping {n_dropped} of {n_markers_in} monomorphic markers");
        }
        if kept.is_empty() {
            return Err(DataError::NoPolymorphicMarkers.into());
        }

        let observed = topology.observed();
        let p = kept.len();
        let mut frequencies = Array2::<f64>::zeros((p, observed.len()));
        for (k, &node) in observed.iter().enumerate() {
            let samples = &topology.nodes()[node].samples;
            if samples.is_empty() {
                return Err(DataError::EmptyObservedNode { node }.into());
            }
            let inv = 1.0 / (2.0 * samples.len() as f64);
            for (j, &marker) in kept.iter().enumerate() {
                let total: f64 = samples.iter().map(|&s| genotypes[[marker, s]]).sum();
                frequencies[[j, k]] = total * inv;
            }
        }

        let mut centered = frequencies.clone();
        let scaling_mu = match options.scaling {
            FrequencyScaling::None => None,
            FrequencyScaling::NodeMean => {
                Some(frequencies.sum_axis(Axis(1)) / observed.len().max(1) as f64)
            }
            FrequencyScaling::SampleMean => Some(Array1::from(sample_freq)),
        };
        if let Some(mu) = scaling_mu {
            for (mut row, &m) in centered.axis_iter_mut(Axis(0)).zip(mu.iter()) {
                row /= (m * (1.0 - m)).sqrt();
            }
        }
        for mut row in centered.axis_iter_mut(Axis(0)) {
            let mean = row.mean().unwrap_or(0.0);
            row -= mean;
        }
        let empirical = fast_ata(&centered) / p as f64;

        log::debug!(
            "empirical covariance over {} observed nodes from {} markers",
            observed.len(),
            p
        );

        Ok(Self {
            empirical,
            frequencies,
            samples_per_node: topology.samples_per_node().clone(),
            n_markers: p,
            n_dropped,
            topology: graph.shared_topology(),
        })
    }

    /// Wraps a precomputed observed-node covariance. `empirical` must be square over the
    /// graph's observed nodes, symmetric, and finite.
    pub fn from_empirical(
        empirical: Array2<f64>,
        n_markers: usize,
        graph: &SpatialGraph,
    ) -> Result<Self, MigrationError> {
        let o = graph.observed().len();
        let (rows, cols) = empirical.dim();
        if rows != o || cols != o {
            return Err(DataError::CovarianceShape {
                rows,
                cols,
                observed: o,
            }
            .into());
        }
        if n_markers == 0 {
            return Err(DataError::NoMarkers.into());
        }
        for ((row, col), &v) in empirical.indexed_iter() {
            if !v.is_finite() {
                return Err(DataError::NonFiniteCovariance { row, col }.into());
            }
            if col > row && (v - empirical[[col, row]]).abs() > 1e-10 * (1.0 + v.abs()) {
                return Err(DataError::AsymmetricCovariance { row, col }.into());
            }
        }
        Ok(Self {
            empirical,
            frequencies: Array2::zeros((0, o)),
            samples_per_node: graph.topology().samples_per_node().clone(),
            n_markers,
            n_dropped: 0,
            topology: graph.shared_topology(),
        })
    }

    /// `S̄`, o x o in observed-node order.
    pub fn empirical_covariance(&self) -> &Array2<f64> {
        &self.empirical
    }

    /// Markers retained after dropping monomorphic ones.
    pub fn n_markers(&self) -> usize {
        self.n_markers
    }

    pub fn n_dropped_markers(&self) -> usize {
        self.n_dropped
    }

    pub fn samples_per_node(&self) -> &Array1<f64> {
        &self.samples_per_node
    }

    /// Topology whose observed nodes index the rows and columns of `S̄`.
    pub fn topology(&self) -> &Arc<GraphTopology> {
        &self.topology
    }

    /// Unscaled per-node allele frequencies, retained markers x observed nodes. Empty
    /// when built from a precomputed covariance.
    pub fn allele_frequencies(&self) -> &Array2<f64> {
        &self.frequencies
    }
}
