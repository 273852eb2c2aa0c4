//! Error taxonomy for graph construction, data preparation, and fitting.
//!
//! Three families, each a `thiserror` enum, unified by [`MigrationError`]:
//! configuration problems in caller-supplied topology or options, data problems in the
//! genotype input, and numerical failures raised while evaluating or optimizing the
//! objective.

use thiserror::Error;

/// Invalid or inconsistent topology inputs and options.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("habitat polygon must have at least 3 finite vertices (got {0})")]
    InvalidHabitat(usize),

    #[error("sample {sample} at ({x:.6}, {y:.6}) lies outside the habitat")]
    SampleOutsideHabitat { sample: usize, x: f64, y: f64 },

    #[error("graph has {components} connected components; a connected graph is required")]
    DisconnectedGraph { components: usize },

    #[error("graph has no {0} inside the habitat")]
    EmptyGraph(&'static str),

    #[error("edge ({0}, {1}) is invalid: {2}")]
    InvalidEdge(usize, usize, &'static str),

    #[error("sample {sample} is mapped to unknown node {node}")]
    UnknownNode { sample: usize, node: usize },

    #[error("expected {expected} {what}, found {found}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid option `{name}`: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("graph {0} differ from the topology the covariance was built on")]
    TopologyMismatch(&'static str),
}

/// Malformed or insufficient genotype / covariance input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("genotype matrix has no markers")]
    NoMarkers,

    #[error("genotype matrix has {found} sample columns but {expected} samples were assigned")]
    SampleCountMismatch { expected: usize, found: usize },

    #[error("marker {marker} is missing in every sample")]
    AllMissingMarker { marker: usize },

    #[error(
        "genotype for marker {marker}, sample {sample} is missing; impute before fitting"
    )]
    MissingGenotype { marker: usize, sample: usize },

    #[error("genotype {value} for marker {marker}, sample {sample} is outside [0, 2]")]
    InvalidGenotype {
        marker: usize,
        sample: usize,
        value: f64,
    },

    #[error("every marker is monomorphic; no variance left to model")]
    NoPolymorphicMarkers,

    #[error("observed node {node} has no assigned samples")]
    EmptyObservedNode { node: usize },

    #[error("at least 2 observed nodes are required (found {0})")]
    TooFewObservedNodes(usize),

    #[error("empirical covariance is {rows}x{cols} but the graph has {observed} observed nodes")]
    CovarianceShape {
        rows: usize,
        cols: usize,
        observed: usize,
    },

    #[error("empirical covariance is not symmetric at ({row}, {col})")]
    AsymmetricCovariance { row: usize, col: usize },

    #[error("empirical covariance has a non-finite entry at ({row}, {col})")]
    NonFiniteCovariance { row: usize, col: usize },
}

/// Numerical failures during objective evaluation or optimization.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericalError {
    #[error("edge {edge} has non-positive or non-finite weight {weight:e}")]
    NonPositiveWeight { edge: usize, weight: f64 },

    #[error("the {block} system is not positive definite")]
    NotPositiveDefinite { block: &'static str },

    #[error("non-finite value produced in {0}")]
    NonFiniteValue(&'static str),

    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("sparse assembly failed: {0}")]
    SparseAssembly(String),

    #[error(
        "line search found no decreasing step at iteration {iteration} (gradient norm {grad_norm:.3e})"
    )]
    LineSearchFailed { iteration: usize, grad_norm: f64 },

    #[error("null-model optimization failed: {0}")]
    NullModelFailed(String),
}

/// Crate-wide error.
#[derive(Error)]
pub enum MigrationError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("numerical error: {0}")]
    Numerical(#[from] NumericalError),
}

// Debug prints the readable message, matching Display.
impl core::fmt::Debug for MigrationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self)
    }
}

impl MigrationError {
    pub fn is_numerical(&self) -> bool {
        matches!(self, MigrationError::Numerical(_))
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
