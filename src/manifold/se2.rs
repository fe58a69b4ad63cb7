//! SE(2) - rigid transformations in the plane.
//!
//! Poses are stored as a translation and a unit complex rotation. The chart is
//! `[x, y, θ]` with `θ` wrapped into `(-π, π]`.

use crate::manifold::{
    Linearization, ManifoldError, ManifoldResult, PoseManifold, clamp_angle_step, normalize_angle,
};
use nalgebra::{DMatrix, DVector, Matrix2, UnitComplex, Vector2};
use std::fmt;

/// SE(2) group element.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SE2 {
    translation: Vector2<f64>,
    rotation: UnitComplex<f64>,
}

impl fmt::Display for SE2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SE2(translation: [{:.4}, {:.4}], rotation: {:.4})",
            self.translation.x,
            self.translation.y,
            self.angle()
        )
    }
}

impl Default for SE2 {
    fn default() -> Self {
        <Self as PoseManifold>::identity()
    }
}

/// `d/dθ R(θ) = S · R(θ)`
fn generator() -> Matrix2<f64> {
    Matrix2::new(0.0, -1.0, 1.0, 0.0)
}

impl SE2 {
    pub fn new(translation: Vector2<f64>, rotation: UnitComplex<f64>) -> Self {
        SE2 {
            translation,
            rotation,
        }
    }

    pub fn from_xy_angle(x: f64, y: f64, theta: f64) -> Self {
        SE2 {
            translation: Vector2::new(x, y),
            rotation: UnitComplex::new(theta),
        }
    }

    pub fn translation(&self) -> Vector2<f64> {
        self.translation
    }

    pub fn x(&self) -> f64 {
        self.translation.x
    }

    pub fn y(&self) -> f64 {
        self.translation.y
    }

    pub fn angle(&self) -> f64 {
        normalize_angle(self.rotation.angle())
    }

    fn rotation2(&self) -> Matrix2<f64> {
        *self.rotation.to_rotation_matrix().matrix()
    }

    /// Transform a point from the local frame into the global frame.
    pub fn act(&self, point: &Vector2<f64>) -> Vector2<f64> {
        self.rotation * point + self.translation
    }
}

fn block3(top_left: Matrix2<f64>, top_right: Vector2<f64>, bottom_right: f64) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(3, 3);
    m.view_mut((0, 0), (2, 2)).copy_from(&top_left);
    m[(0, 2)] = top_right.x;
    m[(1, 2)] = top_right.y;
    m[(2, 2)] = bottom_right;
    m
}

impl PoseManifold for SE2 {
    const DIM: usize = 2;
    const DOF: usize = 3;

    fn identity() -> Self {
        SE2 {
            translation: Vector2::zeros(),
            rotation: UnitComplex::identity(),
        }
    }

    fn compose(&self, other: &Self) -> Self {
        SE2 {
            translation: self.translation + self.rotation * other.translation,
            rotation: self.rotation * other.rotation,
        }
    }

    fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        SE2 {
            translation: -(rotation * self.translation),
            rotation,
        }
    }

    fn to_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.translation.x, self.translation.y, self.angle()])
    }

    fn from_vector(vector: &DVector<f64>) -> ManifoldResult<Self> {
        if vector.len() != 3 {
            return Err(ManifoldError::InvalidDimension {
                expected: 3,
                actual: vector.len(),
            });
        }
        Ok(SE2::from_xy_angle(vector[0], vector[1], vector[2]))
    }

    fn retract(&self, delta: &DVector<f64>) -> Self {
        SE2 {
            translation: self.translation + Vector2::new(delta[0], delta[1]),
            rotation: self.rotation * UnitComplex::new(clamp_angle_step(delta[2])),
        }
    }

    fn translation_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.translation.as_slice())
    }

    fn rotation_vector(&self) -> DVector<f64> {
        DVector::from_element(1, self.angle())
    }

    fn rotation_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_column_slice(2, 2, self.rotation2().as_slice())
    }

    fn manifold_error(from: &Self, to: &Self, measurement: &Self) -> Linearization {
        let ri_t = from.rotation2().transpose();
        let rz_t = measurement.rotation2().transpose();
        let delta = to.translation - from.translation;
        let m = rz_t * ri_t;
        let d_theta_i = rz_t * (-generator() * (ri_t * delta));

        Linearization {
            error: Self::relative_error(from, to, measurement),
            jacobian_from: block3(-m, d_theta_i, -1.0),
            jacobian_to: block3(m, Vector2::zeros(), 1.0),
        }
    }

    fn linearized_error(from: &Self, to: &Self, measurement: &Self) -> Linearization {
        let predicted = from.compose(measurement);
        let error = DVector::from_vec(vec![
            to.translation.x - predicted.translation.x,
            to.translation.y - predicted.translation.y,
            normalize_angle(to.angle() - predicted.angle()),
        ]);
        let d_theta_i = -generator() * (from.rotation * measurement.translation);

        Linearization {
            error,
            jacobian_from: block3(-Matrix2::identity(), d_theta_i, -1.0),
            jacobian_to: block3(Matrix2::identity(), Vector2::zeros(), 1.0),
        }
    }

    fn motion_jacobians(parent: &Self, measurement: &Self) -> (DMatrix<f64>, DMatrix<f64>) {
        let jx = block3(
            Matrix2::identity(),
            generator() * (parent.rotation * measurement.translation),
            1.0,
        );
        let child_rotation = (parent.rotation * measurement.rotation)
            .to_rotation_matrix()
            .into_inner();
        let ju = block3(child_rotation, Vector2::zeros(), 1.0);
        (jx, ju)
    }
}
