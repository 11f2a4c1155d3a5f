//! SE(3) - Special Euclidean Group in 3D
//!
//! Rigid transformations in space, stored as an [`SO3`] rotation plus a `Vector3`
//! translation. Tangent elements are `[ρ, θ]` with the translational part `ρ` first.
//!
//! ```text
//! Exp([ρ, θ]) = [Exp(θ), Jl(θ) ρ]
//! Ad([R, t])  = [[R, [t]ₓ R], [0, R]]
//! Jl([ρ, θ])  = [[Jl(θ), Q(ρ, θ)], [0, Jl(θ)]]
//! Jr(τ)       = Jl(-τ)
//! ```
//!
//! `Q(ρ, θ)` is the coupling block from Barfoot, "State Estimation for Robotics", eq. 7.86.

use crate::manifold::so3::{SO3, SO3Tangent};
use crate::manifold::{
    LieGroup, ManifoldResult, SMALL_ANGLE_THRESHOLD, Tangent, check_tangent_len, skew,
};
use nalgebra::{DVector, Matrix3, Matrix6, Quaternion, UnitQuaternion, Vector3, Vector6};
use rand::Rng;
use std::fmt;

/// SE(3) group element.
#[derive(Clone, Debug, PartialEq)]
pub struct SE3 {
    rotation: SO3,
    translation: Vector3<f64>,
}

impl fmt::Display for SE3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.translation;
        let q = self.rotation.quaternion();
        write!(f, "SE3(translation: [{:.4}, {:.4}, {:.4}], ", t.x, t.y, t.z)?;
        write!(
            f,
            "rotation: [w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4}])",
            q.w, q.i, q.j, q.k
        )
    }
}

/// se(3) tangent element `[ρx, ρy, ρz, θx, θy, θz]`.
#[derive(Clone, Debug, PartialEq)]
pub struct SE3Tangent {
    data: Vector6<f64>,
}

impl SE3 {
    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        SE3 {
            rotation: SO3::new(rotation),
            translation,
        }
    }

    /// Build from a possibly non-normalized quaternion (as read from files).
    pub fn from_translation_quaternion(
        translation: Vector3<f64>,
        quaternion: Quaternion<f64>,
    ) -> Self {
        SE3 {
            rotation: SO3::new(UnitQuaternion::from_quaternion(quaternion)),
            translation,
        }
    }

    /// Build from a translation and roll / pitch / yaw angles in radians.
    pub fn from_translation_euler(
        translation: Vector3<f64>,
        roll: f64,
        pitch: f64,
        yaw: f64,
    ) -> Self {
        SE3 {
            rotation: SO3::from_euler_angles(roll, pitch, yaw),
            translation,
        }
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.translation
    }

    pub fn rotation_quaternion(&self) -> UnitQuaternion<f64> {
        self.rotation.quaternion()
    }

    pub fn rotation_so3(&self) -> &SO3 {
        &self.rotation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.rotation_matrix()
    }

    pub fn x(&self) -> f64 {
        self.translation.x
    }

    pub fn y(&self) -> f64 {
        self.translation.y
    }

    pub fn z(&self) -> f64 {
        self.translation.z
    }

    /// Transform a point: `R p + t`.
    pub fn act(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.act(point) + self.translation
    }
}

impl LieGroup for SE3 {
    type TangentVector = SE3Tangent;
    type JacobianMatrix = Matrix6<f64>;

    const DOF: usize = 6;
    const REP_SIZE: usize = 7;

    fn identity() -> Self {
        SE3 {
            rotation: SO3::identity(),
            translation: Vector3::zeros(),
        }
    }

    fn inverse(&self, jacobian: Option<&mut Matrix6<f64>>) -> Self {
        if let Some(jac) = jacobian {
            *jac = -self.adjoint();
        }
        let rotation = self.rotation.inverse(None);
        SE3 {
            translation: -rotation.act(&self.translation),
            rotation,
        }
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Matrix6<f64>>,
        jacobian_other: Option<&mut Matrix6<f64>>,
    ) -> Self {
        if let Some(jac_self) = jacobian_self {
            *jac_self = other.inverse(None).adjoint();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = Matrix6::identity();
        }
        SE3 {
            rotation: self.rotation.compose(&other.rotation, None, None),
            translation: self.translation + self.rotation.act(&other.translation),
        }
    }

    fn log(&self, jacobian: Option<&mut Matrix6<f64>>) -> SE3Tangent {
        let theta = self.rotation.log(None);
        let rho = theta.left_jacobian_inv() * self.translation;
        let tangent = SE3Tangent::new(rho, theta.coefficients());
        if let Some(jac) = jacobian {
            *jac = tangent.right_jacobian_inv();
        }
        tangent
    }

    fn adjoint(&self) -> Matrix6<f64> {
        let r = self.rotation_matrix();
        let mut adj = Matrix6::zeros();
        adj.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        adj.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(skew(&self.translation) * r));
        adj.fixed_view_mut::<3, 3>(3, 3).copy_from(&r);
        adj
    }

    fn random() -> Self {
        let mut rng = rand::rng();
        SE3 {
            rotation: SO3::random(),
            translation: Vector3::new(
                rng.random_range(-5.0..5.0),
                rng.random_range(-5.0..5.0),
                rng.random_range(-5.0..5.0),
            ),
        }
    }

    fn normalize(&mut self) {
        self.rotation.normalize();
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        self.rotation.is_valid(tolerance)
    }
}

impl SE3Tangent {
    pub fn new(rho: Vector3<f64>, theta: Vector3<f64>) -> Self {
        SE3Tangent {
            data: Vector6::new(rho.x, rho.y, rho.z, theta.x, theta.y, theta.z),
        }
    }

    pub fn coefficients(&self) -> Vector6<f64> {
        self.data
    }

    pub fn rho(&self) -> Vector3<f64> {
        self.data.fixed_rows::<3>(0).into_owned()
    }

    pub fn theta(&self) -> Vector3<f64> {
        self.data.fixed_rows::<3>(3).into_owned()
    }

    /// Coupling block `Q(ρ, θ)` of the SE(3) left Jacobian.
    fn q_block(rho: &Vector3<f64>, theta: &Vector3<f64>) -> Matrix3<f64> {
        let rho_x = skew(rho);
        let th_x = skew(theta);
        let angle_sq = theta.norm_squared();

        let (c1, c2, c3) = if angle_sq < SMALL_ANGLE_THRESHOLD {
            (1.0 / 6.0, 1.0 / 24.0, 1.0 / 120.0)
        } else {
            let angle = angle_sq.sqrt();
            let (s, c) = angle.sin_cos();
            (
                (angle - s) / (angle_sq * angle),
                (angle_sq + 2.0 * c - 2.0) / (2.0 * angle_sq * angle_sq),
                (2.0 * angle - 3.0 * s + angle * c) / (2.0 * angle_sq * angle_sq * angle),
            )
        };

        let th_rho = th_x * rho_x;
        let rho_th = rho_x * th_x;
        let th_rho_th = th_rho * th_x;
        0.5 * rho_x
            + c1 * (th_rho + rho_th + th_rho_th)
            + c2 * (th_x * th_rho + rho_th * th_x - 3.0 * th_rho_th)
            + c3 * (th_rho_th * th_x + th_x * th_rho_th)
    }
}

impl Tangent<SE3> for SE3Tangent {
    fn exp(&self, jacobian: Option<&mut Matrix6<f64>>) -> SE3 {
        let theta = SO3Tangent::new(self.theta());
        if let Some(jac) = jacobian {
            *jac = self.right_jacobian();
        }
        SE3 {
            translation: theta.left_jacobian() * self.rho(),
            rotation: theta.exp(None),
        }
    }

    fn right_jacobian(&self) -> Matrix6<f64> {
        let theta = SO3Tangent::new(self.theta());
        let jr = theta.right_jacobian();
        let q = Self::q_block(&(-self.rho()), &(-self.theta()));
        let mut jac = Matrix6::zeros();
        jac.fixed_view_mut::<3, 3>(0, 0).copy_from(&jr);
        jac.fixed_view_mut::<3, 3>(0, 3).copy_from(&q);
        jac.fixed_view_mut::<3, 3>(3, 3).copy_from(&jr);
        jac
    }

    fn right_jacobian_inv(&self) -> Matrix6<f64> {
        let theta = SO3Tangent::new(self.theta());
        let jr_inv = theta.right_jacobian_inv();
        let q = Self::q_block(&(-self.rho()), &(-self.theta()));
        let mut jac = Matrix6::zeros();
        jac.fixed_view_mut::<3, 3>(0, 0).copy_from(&jr_inv);
        jac.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(-jr_inv * q * jr_inv));
        jac.fixed_view_mut::<3, 3>(3, 3).copy_from(&jr_inv);
        jac
    }

    fn zero() -> Self {
        SE3Tangent {
            data: Vector6::zeros(),
        }
    }

    fn random() -> Self {
        let mut rng = rand::rng();
        SE3Tangent::new(
            Vector3::new(
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
            ),
            SO3Tangent::random().coefficients(),
        )
    }

    fn norm(&self) -> f64 {
        self.data.norm()
    }

    fn to_dvector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.data.as_slice())
    }

    fn from_slice(coefficients: &[f64]) -> ManifoldResult<Self> {
        check_tangent_len(6, coefficients.len())?;
        Ok(SE3Tangent {
            data: Vector6::from_column_slice(coefficients),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const TOLERANCE: f64 = 1e-10;

    fn sample_pose() -> SE3 {
        SE3::from_translation_euler(Vector3::new(1.0, -2.0, 0.5), 0.3, -0.2, 1.1)
    }

    #[test]
    fn test_se3_from_unnormalized_quaternion() {
        let pose = SE3::from_translation_quaternion(
            Vector3::new(1.0, 2.0, 3.0),
            Quaternion::new(2.0, 0.0, 0.0, 0.0),
        );
        assert!(pose.is_valid(1e-12));
        assert!(pose.rotation_so3().is_approx(&SO3::identity(), TOLERANCE));
        assert_relative_eq!(pose.z(), 3.0);
    }

    #[test]
    fn test_se3_inverse_composes_to_identity() {
        let pose = sample_pose();
        let id = pose.inverse(None).compose(&pose, None, None);
        assert!(id.is_approx(&SE3::identity(), TOLERANCE));
    }

    #[test]
    fn test_se3_exp_log_round_trip() {
        for _ in 0..20 {
            let tangent = SE3Tangent::random();
            let recovered = tangent.exp(None).log(None);
            assert_relative_eq!(
                recovered.coefficients(),
                tangent.coefficients(),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_se3_act_matches_matrix_form() {
        let pose = sample_pose();
        let p = Vector3::new(0.2, 0.4, -1.0);
        let expected = pose.rotation_matrix() * p + pose.translation();
        assert_relative_eq!(pose.act(&p), expected, epsilon = TOLERANCE);
    }

    #[test]
    fn test_se3_right_jacobian_numerical() {
        let tangent = SE3Tangent::new(Vector3::new(0.5, -0.3, 0.8), Vector3::new(0.2, 0.4, -0.6));
        let jr = tangent.right_jacobian();
        let base = tangent.exp(None);
        let eps = 1e-7;
        for k in 0..6 {
            let mut coeffs = tangent.coefficients();
            coeffs[k] += eps;
            let perturbed = SE3Tangent::from_slice(coeffs.as_slice()).unwrap().exp(None);
            let column = perturbed.right_minus(&base).coefficients() / eps;
            assert_relative_eq!(column, jr.column(k).into_owned(), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_se3_right_jacobian_inverse() {
        for _ in 0..10 {
            let tangent = SE3Tangent::random();
            let product = tangent.right_jacobian() * tangent.right_jacobian_inv();
            assert_relative_eq!(product, Matrix6::identity(), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_se3_compose_jacobians_numerical() {
        let a = sample_pose();
        let b = SE3::from_translation_euler(Vector3::new(-0.4, 0.9, 2.0), -0.7, 0.1, 0.3);
        let mut j_a = Matrix6::zeros();
        let mut j_b = Matrix6::zeros();
        let ab = a.compose(&b, Some(&mut j_a), Some(&mut j_b));
        let eps = 1e-7;
        for k in 0..6 {
            let mut d = [0.0; 6];
            d[k] = eps;
            let delta = SE3Tangent::from_slice(&d).unwrap();
            let col_a = a.right_plus(&delta).compose(&b, None, None).right_minus(&ab);
            let col_b = a.compose(&b.right_plus(&delta), None, None).right_minus(&ab);
            assert_relative_eq!(
                col_a.coefficients() / eps,
                j_a.column(k).into_owned(),
                epsilon = 1e-6
            );
            assert_relative_eq!(
                col_b.coefficients() / eps,
                j_b.column(k).into_owned(),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_se3_retract_local_round_trip() {
        for _ in 0..20 {
            let pose = SE3::random();
            let delta = SE3Tangent::random();
            let moved = pose.right_plus(&delta);
            assert!(moved.is_valid(1e-12));
            assert_relative_eq!(
                moved.right_minus(&pose).coefficients(),
                delta.coefficients(),
                epsilon = 1e-9
            );
        }
    }
}
