#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

pub mod covariance;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod linalg;
pub mod objective;
pub mod solver;
pub mod types;

pub use covariance::CovarianceModel;
pub use diagnostics::{
    FitDiagnostics, OutlierPair, OutlierReport, covariance_to_distance, distance_to_covariance,
    extract_outliers,
};
pub use error::{ConfigurationError, DataError, MigrationError, NumericalError};
pub use graph::builder::{CandidateGrid, GraphBuilder, SampleAssignment};
pub use graph::spatial::{Edge, GraphTopology, Node, SpatialGraph};
pub use objective::{Evaluation, Objective};
pub use solver::null_model::{NullModelFit, fit_null_model};
pub use solver::path::{
    PathCriterion, PathPoint, RegularizationPath, fit_lambda_grid_parallel,
    fit_regularization_path, lambda_grid,
};
pub use solver::fit;
pub use types::{
    CovarianceOptions, FitOptions, FitResult, FrequencyScaling, GridOptions, LogWeightBounds,
    NullModelOptions, ObjectiveOptions, Penalty, ResidualVariance, Termination,
};
