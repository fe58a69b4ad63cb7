//! SE(3) - rigid transformations in space.
//!
//! Poses are a unit quaternion rotation and a `Vector3` translation. The chart is the
//! translation followed by the rotation vector (axis · angle, angle in `[0, π]`).
//! Text files carry roll/pitch/yaw, see [`SE3::from_translation_euler`].

use crate::manifold::{Linearization, ManifoldError, ManifoldResult, PoseManifold};
use nalgebra::{DMatrix, DVector, Matrix3, UnitQuaternion, Vector3};
use std::f64::consts::PI;
use std::fmt;

/// SE(3) group element.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SE3 {
    rotation: UnitQuaternion<f64>,
    translation: Vector3<f64>,
}

impl fmt::Display for SE3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.translation;
        let q = self.rotation;
        write!(
            f,
            "SE3(translation: [{:.4}, {:.4}, {:.4}], rotation: [w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4}])",
            t.x, t.y, t.z, q.w, q.i, q.j, q.k
        )
    }
}

impl Default for SE3 {
    fn default() -> Self {
        <Self as PoseManifold>::identity()
    }
}

/// Skew-symmetric matrix `[v]ₓ`.
pub fn hat(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Inverse of the right Jacobian of the SO(3) exponential map.
///
/// J_R⁻¹(θ) = I + ½[θ]ₓ + (1/θ² - (1 + cos θ)/(2θ sin θ)) [θ]ₓ²
pub fn right_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let angle_sq = phi.norm_squared();
    let skew = hat(phi);
    if angle_sq <= f64::EPSILON {
        return Matrix3::identity() + 0.5 * skew;
    }
    let theta = angle_sq.sqrt();
    Matrix3::identity()
        + 0.5 * skew
        + (1.0 / angle_sq - (1.0 + theta.cos()) / (2.0 * theta * theta.sin())) * skew * skew
}

fn block6(
    top_left: Matrix3<f64>,
    top_right: Matrix3<f64>,
    bottom_right: Matrix3<f64>,
) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(6, 6);
    m.view_mut((0, 0), (3, 3)).copy_from(&top_left);
    m.view_mut((0, 3), (3, 3)).copy_from(&top_right);
    m.view_mut((3, 3), (3, 3)).copy_from(&bottom_right);
    m
}

impl SE3 {
    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        SE3 {
            rotation,
            translation,
        }
    }

    /// Create SE3 from translation components and Euler angles.
    pub fn from_translation_euler(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(roll, pitch, yaw),
            translation: Vector3::new(x, y, z),
        }
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.translation
    }

    pub fn rotation_quaternion(&self) -> UnitQuaternion<f64> {
        self.rotation
    }

    /// (roll, pitch, yaw)
    pub fn euler_angles(&self) -> (f64, f64, f64) {
        self.rotation.euler_angles()
    }

    fn rotation3(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }
}

impl PoseManifold for SE3 {
    const DIM: usize = 3;
    const DOF: usize = 6;

    fn identity() -> Self {
        SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    fn compose(&self, other: &Self) -> Self {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.translation + self.rotation * other.translation,
        }
    }

    fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        SE3 {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    fn to_vector(&self) -> DVector<f64> {
        let phi = self.rotation.scaled_axis();
        DVector::from_vec(vec![
            self.translation.x,
            self.translation.y,
            self.translation.z,
            phi.x,
            phi.y,
            phi.z,
        ])
    }

    fn from_vector(vector: &DVector<f64>) -> ManifoldResult<Self> {
        if vector.len() != 6 {
            return Err(ManifoldError::InvalidDimension {
                expected: 6,
                actual: vector.len(),
            });
        }
        Ok(SE3 {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(
                vector[3], vector[4], vector[5],
            )),
            translation: Vector3::new(vector[0], vector[1], vector[2]),
        })
    }

    fn retract(&self, delta: &DVector<f64>) -> Self {
        let mut phi = Vector3::new(delta[3], delta[4], delta[5]);
        let angle = phi.norm();
        if angle > PI {
            phi *= PI / angle;
        }
        let mut rotation = self.rotation * UnitQuaternion::from_scaled_axis(phi);
        rotation.renormalize();
        SE3 {
            rotation,
            translation: self.translation + Vector3::new(delta[0], delta[1], delta[2]),
        }
    }

    fn translation_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.translation.as_slice())
    }

    fn rotation_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.rotation.scaled_axis().as_slice())
    }

    fn rotation_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_column_slice(3, 3, self.rotation3().as_slice())
    }

    fn manifold_error(from: &Self, to: &Self, measurement: &Self) -> Linearization {
        let ri = from.rotation3();
        let rj = to.rotation3();
        let rz_t = measurement.rotation3().transpose();
        let local = ri.transpose() * (to.translation - from.translation);
        let m = rz_t * ri.transpose();

        let error = Self::relative_error(from, to, measurement);
        let jr_inv = right_jacobian_inv(&Vector3::new(error[3], error[4], error[5]));

        Linearization {
            jacobian_from: block6(-m, rz_t * hat(&local), -jr_inv * rj.transpose() * ri),
            jacobian_to: block6(m, Matrix3::zeros(), jr_inv),
            error,
        }
    }

    fn linearized_error(from: &Self, to: &Self, measurement: &Self) -> Linearization {
        let ri = from.rotation3();
        let rj = to.rotation3();
        let predicted = from.compose(measurement);
        let rotation_error = (predicted.rotation.inverse() * to.rotation).scaled_axis();
        let jr_inv = right_jacobian_inv(&rotation_error);
        let dt = to.translation - predicted.translation;

        Linearization {
            error: DVector::from_vec(vec![
                dt.x,
                dt.y,
                dt.z,
                rotation_error.x,
                rotation_error.y,
                rotation_error.z,
            ]),
            jacobian_from: block6(
                -Matrix3::identity(),
                ri * hat(&measurement.translation),
                -jr_inv * rj.transpose() * ri,
            ),
            jacobian_to: block6(Matrix3::identity(), Matrix3::zeros(), jr_inv),
        }
    }

    fn motion_jacobians(parent: &Self, measurement: &Self) -> (DMatrix<f64>, DMatrix<f64>) {
        let rp = parent.rotation3();
        let rz = measurement.rotation3();
        let jx = block6(
            Matrix3::identity(),
            -rp * hat(&measurement.translation),
            rz.transpose(),
        );
        let ju = block6(rp * rz, Matrix3::zeros(), Matrix3::identity());
        (jx, ju)
    }
}
