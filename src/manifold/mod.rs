//! Pose manifolds consumed by the pose graph and the optimizers.
//!
//! Two rigid-motion groups are provided:
//! - **SE(2)**: planar poses, chart `[x, y, θ]`
//! - **SE(3)**: spatial poses, chart `[x, y, z, φx, φy, φz]` (translation + rotation vector)
//!
//! Group   | DIM | DOF | chart                  | retraction
//! ------- | --- | --- | ---------------------- | -----------------------------------
//! SE(2)   | 2   | 3   | [t, θ]                 | t + δt, θ + δθ
//! SE(3)   | 3   | 6   | [t, Log(R)]            | t + δt, R · Exp(δφ)
//!
//! Every solver in the crate perturbs poses the same way: the translation is updated in
//! the global frame and the rotation is right-multiplied by the exponential of the
//! rotational step. The rotational step is clamped to ±π so a single update can never
//! wrap around.
//!
//! The residual of an edge `(i, j)` with measurement `Z` is
//!
//! ```text
//! e = to_vector(Z⁻¹ · Tᵢ⁻¹ · Tⱼ)
//! ```
//!
//! and [`PoseManifold::manifold_error`] returns it together with its analytic Jacobians
//! with respect to the retraction parameters of both endpoints.
//! [`PoseManifold::linearized_error`] is the cheaper first-order variant whose
//! translational part lives in the global frame.

use nalgebra::{DMatrix, DVector};
use std::fmt::Debug;

pub mod se2;
pub mod se3;

pub use se2::SE2;
pub use se3::SE3;

/// Errors that can occur during manifold operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifoldError {
    /// Invalid chart vector dimension
    InvalidDimension { expected: usize, actual: usize },
    /// Numerical instability in computation
    NumericalInstability(String),
}

impl std::fmt::Display for ManifoldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifoldError::InvalidDimension { expected, actual } => {
                write!(f, "Invalid chart dimension: expected {expected}, got {actual}")
            }
            ManifoldError::NumericalInstability(msg) => {
                write!(f, "Numerical instability: {msg}")
            }
        }
    }
}

impl std::error::Error for ManifoldError {}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Residual of one edge together with its Jacobians.
///
/// `jacobian_from` and `jacobian_to` are `DOF x DOF` and are taken with respect to the
/// retraction parameters of the edge's `from` and `to` vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct Linearization {
    pub error: DVector<f64>,
    pub jacobian_from: DMatrix<f64>,
    pub jacobian_to: DMatrix<f64>,
}

/// Pose algebra required by the pose graph.
///
/// Implementors are small value types; all Jacobian calculators are associated functions
/// without state.
pub trait PoseManifold: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Dimension of the space the pose acts on
    const DIM: usize;

    /// Degrees of freedom (chart and tangent dimension)
    const DOF: usize;

    /// Number of rotational components in the chart
    const ROTATION_DOF: usize = Self::DOF - Self::DIM;

    fn identity() -> Self;

    fn compose(&self, other: &Self) -> Self;

    fn inverse(&self) -> Self;

    /// `self⁻¹ · other`
    fn between(&self, other: &Self) -> Self {
        self.inverse().compose(other)
    }

    /// Chart coordinates, translation first.
    fn to_vector(&self) -> DVector<f64>;

    fn from_vector(vector: &DVector<f64>) -> ManifoldResult<Self>;

    /// Apply a `DOF`-dimensional update step.
    fn retract(&self, delta: &DVector<f64>) -> Self;

    fn translation_vector(&self) -> DVector<f64>;

    fn rotation_vector(&self) -> DVector<f64>;

    /// `DIM x DIM` rotation matrix.
    fn rotation_matrix(&self) -> DMatrix<f64>;

    /// Residual `to_vector(Z⁻¹ · from⁻¹ · to)` with analytic Jacobians.
    fn manifold_error(from: &Self, to: &Self, measurement: &Self) -> Linearization;

    /// First-order residual `[t_to - t_pred, Log(R_predᵀ R_to)]` with `pred = from · Z`.
    fn linearized_error(from: &Self, to: &Self, measurement: &Self) -> Linearization;

    /// Jacobians of `child = parent · Z` with respect to the parent's retraction
    /// parameters and to the residual of the measurement.
    fn motion_jacobians(parent: &Self, measurement: &Self) -> (DMatrix<f64>, DMatrix<f64>);

    /// Residual of an edge, without Jacobians.
    fn relative_error(from: &Self, to: &Self, measurement: &Self) -> DVector<f64> {
        measurement
            .inverse()
            .compose(&from.between(to))
            .to_vector()
    }

    /// Map the covariance of a vertex's retraction parameters into the residual chart of
    /// an edge ending in that vertex.
    fn transform_covariance(covariance: &DMatrix<f64>, to: &Self) -> DMatrix<f64> {
        let mut jacobian = DMatrix::<f64>::identity(Self::DOF, Self::DOF);
        let rotation = to.rotation_matrix();
        jacobian
            .view_mut((0, 0), (Self::DIM, Self::DIM))
            .copy_from(&rotation.transpose());
        &jacobian * covariance * jacobian.transpose()
    }
}

/// Clamp an angle step to `[-π, π]`.
pub(crate) fn clamp_angle_step(step: f64) -> f64 {
    step.clamp(-std::f64::consts::PI, std::f64::consts::PI)
}

/// Wrap an angle into `(-π, π]`.
pub fn normalize_angle(angle: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut a = angle % two_pi;
    if a > std::f64::consts::PI {
        a -= two_pi;
    } else if a <= -std::f64::consts::PI {
        a += two_pi;
    }
    a
}
