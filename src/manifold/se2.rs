//! SE(2) - Special Euclidean Group in 2D
//!
//! Planar rigid transformations, stored as a `UnitComplex` rotation plus a `Vector2`
//! translation. Tangent elements are `[x, y, θ]`.
//!
//! The closed forms follow "A micro Lie theory for state estimation in robotics"
//! (Solà et al.), section on SE(2):
//!
//! ```text
//! Exp([ρ, θ]) = [R(θ), V(θ)ρ],   V(θ) = 1/θ [[sin θ, -(1 - cos θ)], [1 - cos θ, sin θ]]
//! Ad([R, t])  = [[R, (t_y, -t_x)ᵀ], [0, 0, 1]]
//! ```

use crate::manifold::{LieGroup, ManifoldResult, SMALL_ANGLE_THRESHOLD, Tangent, check_tangent_len};
use nalgebra::{DVector, Matrix2, Matrix3, UnitComplex, Vector2, Vector3};
use rand::Rng;
use std::fmt;

/// SE(2) group element.
#[derive(Clone, Debug, PartialEq)]
pub struct SE2 {
    rotation: UnitComplex<f64>,
    translation: Vector2<f64>,
}

impl fmt::Display for SE2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SE2(translation: [{:.4}, {:.4}], angle: {:.4})",
            self.translation.x,
            self.translation.y,
            self.angle()
        )
    }
}

/// se(2) tangent element `[x, y, θ]`.
#[derive(Clone, Debug, PartialEq)]
pub struct SE2Tangent {
    data: Vector3<f64>,
}

impl fmt::Display for SE2Tangent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "se2([{:.4}, {:.4}, {:.4}])",
            self.data.x, self.data.y, self.data.z
        )
    }
}

impl SE2 {
    pub fn new(translation: Vector2<f64>, rotation: UnitComplex<f64>) -> Self {
        SE2 {
            rotation,
            translation,
        }
    }

    pub fn from_xy_angle(x: f64, y: f64, theta: f64) -> Self {
        SE2 {
            rotation: UnitComplex::new(theta),
            translation: Vector2::new(x, y),
        }
    }

    pub fn x(&self) -> f64 {
        self.translation.x
    }

    pub fn y(&self) -> f64 {
        self.translation.y
    }

    /// Rotation angle in `(-π, π]`.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }

    pub fn translation(&self) -> Vector2<f64> {
        self.translation
    }

    pub fn rotation(&self) -> UnitComplex<f64> {
        self.rotation
    }

    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Transform a point: `R p + t`.
    pub fn act(&self, point: &Vector2<f64>) -> Vector2<f64> {
        self.rotation * point + self.translation
    }
}

impl LieGroup for SE2 {
    type TangentVector = SE2Tangent;
    type JacobianMatrix = Matrix3<f64>;

    const DOF: usize = 3;
    const REP_SIZE: usize = 4;

    fn identity() -> Self {
        SE2 {
            rotation: UnitComplex::identity(),
            translation: Vector2::zeros(),
        }
    }

    fn inverse(&self, jacobian: Option<&mut Matrix3<f64>>) -> Self {
        if let Some(jac) = jacobian {
            *jac = -self.adjoint();
        }
        let rotation = self.rotation.inverse();
        SE2 {
            translation: -(rotation * self.translation),
            rotation,
        }
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Matrix3<f64>>,
        jacobian_other: Option<&mut Matrix3<f64>>,
    ) -> Self {
        if let Some(jac_self) = jacobian_self {
            *jac_self = other.inverse(None).adjoint();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = Matrix3::identity();
        }
        SE2 {
            rotation: self.rotation * other.rotation,
            translation: self.translation + self.rotation * other.translation,
        }
    }

    fn log(&self, jacobian: Option<&mut Matrix3<f64>>) -> SE2Tangent {
        let theta = self.angle();
        let half = 0.5 * theta;
        // V⁻¹ = [[a, b], [-b, a]] with a = (θ/2) cot(θ/2), b = θ/2
        let a = if theta.abs() < SMALL_ANGLE_THRESHOLD.sqrt() {
            1.0 - theta * theta / 12.0
        } else {
            half * half.cos() / half.sin()
        };
        let t = self.translation;
        let tangent = SE2Tangent::new(a * t.x + half * t.y, -half * t.x + a * t.y, theta);
        if let Some(jac) = jacobian {
            *jac = tangent.right_jacobian_inv();
        }
        tangent
    }

    fn adjoint(&self) -> Matrix3<f64> {
        let r = self.rotation_matrix();
        Matrix3::new(
            r[(0, 0)],
            r[(0, 1)],
            self.translation.y,
            r[(1, 0)],
            r[(1, 1)],
            -self.translation.x,
            0.0,
            0.0,
            1.0,
        )
    }

    fn random() -> Self {
        let mut rng = rand::rng();
        SE2::from_xy_angle(
            rng.random_range(-5.0..5.0),
            rng.random_range(-5.0..5.0),
            rng.random_range(-std::f64::consts::PI..std::f64::consts::PI),
        )
    }

    fn normalize(&mut self) {
        self.rotation.renormalize();
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        (self.rotation.complex().norm() - 1.0).abs() < tolerance
    }
}

impl SE2Tangent {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        SE2Tangent {
            data: Vector3::new(x, y, theta),
        }
    }

    pub fn coefficients(&self) -> Vector3<f64> {
        self.data
    }

    pub fn translation(&self) -> Vector2<f64> {
        Vector2::new(self.data.x, self.data.y)
    }

    pub fn angle(&self) -> f64 {
        self.data.z
    }

    /// `(sin θ / θ, (1 - cos θ) / θ)`
    fn sinc_terms(theta: f64) -> (f64, f64) {
        if theta.abs() < SMALL_ANGLE_THRESHOLD.sqrt() {
            let theta_sq = theta * theta;
            (1.0 - theta_sq / 6.0, 0.5 * theta - theta * theta_sq / 24.0)
        } else {
            (theta.sin() / theta, (1.0 - theta.cos()) / theta)
        }
    }
}

impl Tangent<SE2> for SE2Tangent {
    fn exp(&self, jacobian: Option<&mut Matrix3<f64>>) -> SE2 {
        let theta = self.angle();
        let (a, b) = Self::sinc_terms(theta);
        let (x, y) = (self.data.x, self.data.y);
        if let Some(jac) = jacobian {
            *jac = self.right_jacobian();
        }
        SE2 {
            rotation: UnitComplex::new(theta),
            translation: Vector2::new(a * x - b * y, b * x + a * y),
        }
    }

    fn right_jacobian(&self) -> Matrix3<f64> {
        let theta = self.angle();
        let (a, b) = Self::sinc_terms(theta);
        let (x, y) = (self.data.x, self.data.y);
        let (j02, j12) = if theta.abs() < SMALL_ANGLE_THRESHOLD.sqrt() {
            (-0.5 * y + theta * x / 6.0, 0.5 * x + theta * y / 6.0)
        } else {
            let (s, c) = theta.sin_cos();
            let theta_sq = theta * theta;
            (
                (theta * x - y + y * c - x * s) / theta_sq,
                (x + theta * y - x * c - y * s) / theta_sq,
            )
        };
        Matrix3::new(a, b, j02, -b, a, j12, 0.0, 0.0, 1.0)
    }

    /// Block inverse of `[[M, c], [0, 1]]`: `[[M⁻¹, -M⁻¹c], [0, 1]]`.
    fn right_jacobian_inv(&self) -> Matrix3<f64> {
        let jr = self.right_jacobian();
        let (a, b) = (jr[(0, 0)], jr[(0, 1)]);
        let det = a * a + b * b;
        let m_inv = Matrix2::new(a, -b, b, a) / det;
        let c = Vector2::new(jr[(0, 2)], jr[(1, 2)]);
        let top_right = -(m_inv * c);
        Matrix3::new(
            m_inv[(0, 0)],
            m_inv[(0, 1)],
            top_right.x,
            m_inv[(1, 0)],
            m_inv[(1, 1)],
            top_right.y,
            0.0,
            0.0,
            1.0,
        )
    }

    fn zero() -> Self {
        SE2Tangent::new(0.0, 0.0, 0.0)
    }

    fn random() -> Self {
        let mut rng = rand::rng();
        SE2Tangent::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-0.2..0.2),
        )
    }

    fn norm(&self) -> f64 {
        self.data.norm()
    }

    fn to_dvector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.data.as_slice())
    }

    fn from_slice(coefficients: &[f64]) -> ManifoldResult<Self> {
        check_tangent_len(3, coefficients.len())?;
        Ok(SE2Tangent::new(
            coefficients[0],
            coefficients[1],
            coefficients[2],
        ))
    }
}
