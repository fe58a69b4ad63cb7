//! Error types for the hog-solver library
//!
//! Each module reports its own error enum (`GraphError`, `LinAlgError`, `OptimizerError`,
//! `IoError`, `ManifoldError`). `HogError` collects them for callers that drive the whole
//! pipeline, such as the command-line front-end.

use crate::{
    core::graph::GraphError, io::IoError, linalg::LinAlgError, manifold::ManifoldError,
    optimizer::OptimizerError,
};
use std::num::{ParseFloatError, ParseIntError};
use thiserror::Error;

/// Main result type used throughout the hog-solver library
pub type HogResult<T> = Result<T, HogError>;

/// Main error type for the hog-solver library
#[derive(Debug, Clone, Error)]
pub enum HogError {
    /// Structural graph errors (duplicate ids, missing endpoints)
    #[error("Graph error: {0}")]
    Graph(String),

    /// Sparse factorization and matrix assembly errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// IO related errors (file loading, parsing, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// Manifold operations errors
    #[error("Manifold error: {0}")]
    Manifold(String),

    /// Optimizer failures
    #[error("Optimizer error: {0}")]
    Optimizer(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<std::io::Error> for HogError {
    fn from(err: std::io::Error) -> Self {
        HogError::Io(err.to_string())
    }
}

impl From<ParseFloatError> for HogError {
    fn from(err: ParseFloatError) -> Self {
        HogError::InvalidInput(format!("Failed to parse float: {err}"))
    }
}

impl From<ParseIntError> for HogError {
    fn from(err: ParseIntError) -> Self {
        HogError::InvalidInput(format!("Failed to parse integer: {err}"))
    }
}

impl From<GraphError> for HogError {
    fn from(err: GraphError) -> Self {
        HogError::Graph(err.to_string())
    }
}

impl From<LinAlgError> for HogError {
    fn from(err: LinAlgError) -> Self {
        HogError::LinearAlgebra(err.to_string())
    }
}

impl From<OptimizerError> for HogError {
    fn from(err: OptimizerError) -> Self {
        HogError::Optimizer(err.to_string())
    }
}

impl From<ManifoldError> for HogError {
    fn from(err: ManifoldError) -> Self {
        HogError::Manifold(err.to_string())
    }
}

impl From<IoError> for HogError {
    fn from(err: IoError) -> Self {
        HogError::Io(err.to_string())
    }
}
