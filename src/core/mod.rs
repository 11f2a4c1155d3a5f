//! Core building blocks of a pose-graph problem
//!
//! - Keys and the ordered store of variable values
//! - Gaussian noise models and robust loss functions
//! - The factor graph and its sparse linearization

pub mod corrector;
pub mod graph;
pub mod key;
pub mod loss_functions;
pub mod noise;
pub mod values;
pub mod variable;
