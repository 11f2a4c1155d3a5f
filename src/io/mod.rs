//! Pose-graph file I/O.
//!
//! The g2o text format is read into a [`G2oGraph`] (vertices and edges exactly as stored in the
//! file) which is then turned into an optimization problem with [`G2oGraph::into_problem`].

use nalgebra::{DMatrix, Matrix3, Matrix6, Quaternion, Vector3};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::core::graph::FactorGraph;
use crate::core::key::Key;
use crate::core::noise::GaussianNoise;
use crate::core::values::Values;
use crate::error::PoseGraphResult;
use crate::factors::{BetweenFactor, PriorFactor};
use crate::manifold::se2::SE2;
use crate::manifold::se3::SE3;

pub mod g2o;

pub use g2o::G2oLoader;

/// Errors that can occur during graph file parsing
#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid number format at line {line}: {value}")]
    InvalidNumber { line: usize, value: String },

    #[error("Missing required fields at line {line}")]
    MissingFields { line: usize },

    #[error("Duplicate vertex ID: {id}")]
    DuplicateVertex { id: usize },

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),
}

/// SE2 vertex with ID (x, y, theta)
#[derive(Debug, Clone, PartialEq)]
pub struct VertexSE2 {
    pub id: usize,
    pub pose: SE2,
}

impl VertexSE2 {
    pub fn new(id: usize, x: f64, y: f64, theta: f64) -> Self {
        Self {
            id,
            pose: SE2::from_xy_angle(x, y, theta),
        }
    }
}

impl fmt::Display for VertexSE2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VertexSE2 [ id: {}, pose: {} ]", self.id, self.pose)
    }
}

/// SE3 vertex with ID (x, y, z, qx, qy, qz, qw)
#[derive(Debug, Clone, PartialEq)]
pub struct VertexSE3 {
    pub id: usize,
    pub pose: SE3,
}

impl VertexSE3 {
    pub fn new(id: usize, translation: Vector3<f64>, quaternion: Quaternion<f64>) -> Self {
        Self {
            id,
            pose: SE3::from_translation_quaternion(translation, quaternion),
        }
    }
}

impl fmt::Display for VertexSE3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VertexSE3 [ id: {}, pose: {} ]", self.id, self.pose)
    }
}

/// 2D edge constraint between two SE2 vertices
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSE2 {
    pub from: usize,
    pub to: usize,
    /// Relative transformation `from⁻¹ ∘ to`
    pub measurement: SE2,
    /// Information over `(x, y, theta)`
    pub information: Matrix3<f64>,
}

/// 3D edge constraint between two SE3 vertices
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSE3 {
    pub from: usize,
    pub to: usize,
    /// Relative transformation `from⁻¹ ∘ to`
    pub measurement: SE3,
    /// Information over `(x, y, z, rx, ry, rz)`
    pub information: Matrix6<f64>,
}

/// Vertices and edges of a g2o file, keyed by vertex ID.
#[derive(Debug, Clone, Default)]
pub struct G2oGraph {
    pub vertices_se2: BTreeMap<usize, VertexSE2>,
    pub vertices_se3: BTreeMap<usize, VertexSE3>,
    pub edges_se2: Vec<EdgeSE2>,
    pub edges_se3: Vec<EdgeSE3>,
}

impl G2oGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices_se2.len() + self.vertices_se3.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges_se2.len() + self.edges_se3.len()
    }

    /// Build the factor graph and initial values.
    ///
    /// Vertex `id` becomes `Key(id)`. Every edge becomes a [`BetweenFactor`] whose noise model is
    /// the edge information. When `options.add_prior` is set, the lowest vertex ID of each pose
    /// type is anchored at its initial estimate with the configured prior noise.
    ///
    /// # Errors
    /// `DuplicateKey` if an ID is used by both an SE2 and an SE3 vertex, `InvalidInput` for a
    /// non positive-definite information matrix or a self-loop, and `MissingVariable` for an
    /// edge that references an unknown vertex.
    pub fn into_problem(self, options: &LoaderOptions) -> PoseGraphResult<(FactorGraph, Values)> {
        let mut graph = FactorGraph::new();
        let mut values = Values::new();

        if options.add_prior {
            if let Some((&id, vertex)) = self.vertices_se2.first_key_value() {
                graph.add(PriorFactor::new(
                    key_of(id),
                    vertex.pose.clone(),
                    options.prior_noise_se2.clone(),
                )?);
            }
            if let Some((&id, vertex)) = self.vertices_se3.first_key_value() {
                graph.add(PriorFactor::new(
                    key_of(id),
                    vertex.pose.clone(),
                    options.prior_noise_se3.clone(),
                )?);
            }
        }

        for (id, vertex) in self.vertices_se2 {
            values.insert(key_of(id), vertex.pose)?;
        }
        for (id, vertex) in self.vertices_se3 {
            values.insert(key_of(id), vertex.pose)?;
        }

        for edge in self.edges_se2 {
            let information = DMatrix::from_iterator(3, 3, edge.information.iter().copied());
            graph.add(BetweenFactor::new(
                key_of(edge.from),
                key_of(edge.to),
                edge.measurement,
                GaussianNoise::from_information(information)?,
            )?);
        }
        for edge in self.edges_se3 {
            let information = DMatrix::from_iterator(6, 6, edge.information.iter().copied());
            graph.add(BetweenFactor::new(
                key_of(edge.from),
                key_of(edge.to),
                edge.measurement,
                GaussianNoise::from_information(information)?,
            )?);
        }

        graph.validate(&values)?;
        Ok((graph, values))
    }
}

impl fmt::Display for G2oGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "G2oGraph [ vertices_se2: {}, vertices_se3: {}, edges_se2: {}, edges_se3: {} ]",
            self.vertices_se2.len(),
            self.vertices_se3.len(),
            self.edges_se2.len(),
            self.edges_se3.len()
        )
    }
}

fn key_of(id: usize) -> Key {
    Key(id as u64)
}

/// Options for turning a loaded graph into a problem.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Anchor the lowest vertex ID with a prior factor
    pub add_prior: bool,
    pub prior_noise_se2: GaussianNoise,
    pub prior_noise_se3: GaussianNoise,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            add_prior: true,
            prior_noise_se2: GaussianNoise::from_diagonal_sigmas(&[1e-3; 3])
                .unwrap_or_else(|_| GaussianNoise::identity(3)),
            prior_noise_se3: GaussianNoise::from_diagonal_variances(&[
                1e-6, 1e-6, 1e-6, 1e-4, 1e-4, 1e-4,
            ])
            .unwrap_or_else(|_| GaussianNoise::identity(6)),
        }
    }
}

impl LoaderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prior(mut self, add_prior: bool) -> Self {
        self.add_prior = add_prior;
        self
    }

    pub fn with_prior_noise_se2(mut self, noise: GaussianNoise) -> Self {
        self.prior_noise_se2 = noise;
        self
    }

    pub fn with_prior_noise_se3(mut self, noise: GaussianNoise) -> Self {
        self.prior_noise_se3 = noise;
        self
    }
}
