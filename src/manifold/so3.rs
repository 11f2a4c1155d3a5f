//! SO(3) - Special Orthogonal Group in 3D
//!
//! Rotations are stored as nalgebra `UnitQuaternion<f64>`; tangent elements are axis-angle
//! vectors `θ ∈ R³`. SO(3) is the rotational block of [`SE3`](super::SE3), which reuses its
//! exponential map and Jacobians.

use crate::manifold::{
    LieGroup, ManifoldResult, SMALL_ANGLE_THRESHOLD, Tangent, check_tangent_len, skew,
};
use nalgebra::{DVector, Matrix3, Quaternion, UnitQuaternion, Vector3};
use rand::Rng;
use std::fmt;

/// SO(3) group element.
#[derive(Clone, Debug, PartialEq)]
pub struct SO3 {
    quaternion: UnitQuaternion<f64>,
}

impl fmt::Display for SO3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.quaternion.quaternion();
        write!(
            f,
            "SO3(quaternion: [w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4}])",
            q.w, q.i, q.j, q.k
        )
    }
}

/// so(3) tangent element, an axis-angle vector `[θx, θy, θz]`.
#[derive(Clone, Debug, PartialEq)]
pub struct SO3Tangent {
    data: Vector3<f64>,
}

impl SO3 {
    pub fn new(quaternion: UnitQuaternion<f64>) -> Self {
        SO3 { quaternion }
    }

    /// Build from raw quaternion coefficients, normalizing them.
    pub fn from_quaternion_coeffs(x: f64, y: f64, z: f64, w: f64) -> Self {
        SO3 {
            quaternion: UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
        }
    }

    pub fn from_euler_angles(roll: f64, pitch: f64, yaw: f64) -> Self {
        SO3 {
            quaternion: UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        }
    }

    pub fn from_scaled_axis(axis_angle: Vector3<f64>) -> Self {
        SO3Tangent::new(axis_angle).exp(None)
    }

    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        self.quaternion
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.quaternion.to_rotation_matrix().into_inner()
    }

    /// Rotate a point.
    pub fn act(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.quaternion * point
    }
}

impl LieGroup for SO3 {
    type TangentVector = SO3Tangent;
    type JacobianMatrix = Matrix3<f64>;

    const DOF: usize = 3;
    const REP_SIZE: usize = 4;

    fn identity() -> Self {
        SO3 {
            quaternion: UnitQuaternion::identity(),
        }
    }

    /// J_R⁻¹_R = -Ad(R) = -R
    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        if let Some(jac) = jacobian {
            *jac = -self.rotation_matrix();
        }
        SO3 {
            quaternion: self.quaternion.inverse(),
        }
    }

    /// J_RQ_R = Qᵀ, J_RQ_Q = I
    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        if let Some(jac_self) = jacobian_self {
            *jac_self = other.rotation_matrix().transpose();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = Matrix3::identity();
        }
        SO3 {
            quaternion: self.quaternion * other.quaternion,
        }
    }

    /// θu = Log(q) = 2 v atan2(‖v‖, w) / ‖v‖, taking the shortest rotation.
    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector {
        let q = self.quaternion.quaternion();
        let sin_half_sq = q.i * q.i + q.j * q.j + q.k * q.k;

        let log_coeff = if sin_half_sq > f64::EPSILON {
            let sin_half = sin_half_sq.sqrt();
            let cos_half = q.w;
            let two_angle = 2.0
                * if cos_half < 0.0 {
                    f64::atan2(-sin_half, -cos_half)
                } else {
                    f64::atan2(sin_half, cos_half)
                };
            two_angle / sin_half
        } else {
            // q and -q are the same rotation; keep the sign consistent with w
            2.0 * q.w.signum()
        };

        let tangent = SO3Tangent::new(Vector3::new(
            q.i * log_coeff,
            q.j * log_coeff,
            q.k * log_coeff,
        ));
        if let Some(jac) = jacobian {
            *jac = tangent.right_jacobian_inv();
        }
        tangent
    }

    fn adjoint(&self) -> Self::JacobianMatrix {
        self.rotation_matrix()
    }

    fn random() -> Self {
        let mut rng = rand::rng();
        let axis_angle = Vector3::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
        );
        SO3::from_scaled_axis(axis_angle * std::f64::consts::PI / 3f64.sqrt())
    }

    fn normalize(&mut self) {
        self.quaternion.renormalize();
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        (self.quaternion.quaternion().norm() - 1.0).abs() < tolerance
    }
}

impl SO3Tangent {
    pub fn new(axis_angle: Vector3<f64>) -> Self {
        SO3Tangent { data: axis_angle }
    }

    pub fn coefficients(&self) -> Vector3<f64> {
        self.data
    }

    pub fn angle(&self) -> f64 {
        self.data.norm()
    }

    /// Left Jacobian `Jl(θ) = I + (1 - cos θ)/θ² [θ]ₓ + (θ - sin θ)/θ³ [θ]ₓ²`.
    pub fn left_jacobian(&self) -> Matrix3<f64> {
        let theta_sq = self.data.norm_squared();
        let hat = skew(&self.data);
        if theta_sq < SMALL_ANGLE_THRESHOLD {
            return Matrix3::identity() + 0.5 * hat + hat * hat / 6.0;
        }
        let theta = theta_sq.sqrt();
        Matrix3::identity()
            + (1.0 - theta.cos()) / theta_sq * hat
            + (theta - theta.sin()) / (theta_sq * theta) * hat * hat
    }

    /// `Jl⁻¹(θ) = I - ½[θ]ₓ + (1/θ² - (1 + cos θ)/(2θ sin θ)) [θ]ₓ²`.
    pub fn left_jacobian_inv(&self) -> Matrix3<f64> {
        let theta_sq = self.data.norm_squared();
        let hat = skew(&self.data);
        if theta_sq < SMALL_ANGLE_THRESHOLD {
            return Matrix3::identity() - 0.5 * hat + hat * hat / 12.0;
        }
        let theta = theta_sq.sqrt();
        Matrix3::identity() - 0.5 * hat
            + (1.0 / theta_sq - (1.0 + theta.cos()) / (2.0 * theta * theta.sin())) * hat * hat
    }
}

impl Tangent<SO3> for SO3Tangent {
    fn exp(&self, jacobian: Option<&mut Matrix3<f64>>) -> SO3 {
        let theta_sq = self.data.norm_squared();
        let quaternion = if theta_sq > f64::EPSILON {
            UnitQuaternion::from_scaled_axis(self.data)
        } else {
            UnitQuaternion::from_quaternion(Quaternion::new(
                1.0,
                self.data.x / 2.0,
                self.data.y / 2.0,
                self.data.z / 2.0,
            ))
        };
        if let Some(jac) = jacobian {
            *jac = self.right_jacobian();
        }
        SO3 { quaternion }
    }

    /// Jr(θ) = Jl(-θ) = Jl(θ)ᵀ
    fn right_jacobian(&self) -> Matrix3<f64> {
        self.left_jacobian().transpose()
    }

    fn right_jacobian_inv(&self) -> Matrix3<f64> {
        self.left_jacobian_inv().transpose()
    }

    fn zero() -> Self {
        SO3Tangent::new(Vector3::zeros())
    }

    fn random() -> Self {
        let mut rng = rand::rng();
        SO3Tangent::new(Vector3::new(
            rng.random_range(-0.1..0.1),
            rng.random_range(-0.1..0.1),
            rng.random_range(-0.1..0.1),
        ))
    }

    fn norm(&self) -> f64 {
        self.data.norm()
    }

    fn to_dvector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.data.as_slice())
    }

    fn from_slice(coefficients: &[f64]) -> ManifoldResult<Self> {
        check_tangent_len(3, coefficients.len())?;
        Ok(SO3Tangent::new(Vector3::from_column_slice(coefficients)))
    }
}
