//! Variable storage.
//!
//! [`Values`] maps keys to manifold values and is the only state an optimizer mutates. It is
//! backed by a `BTreeMap`, so iteration (and everything derived from it, such as column
//! ordering) is deterministic. Retraction never modifies the receiver: it returns a fresh store,
//! which keeps the pre-step and post-step states apart while a candidate step is evaluated.

use crate::core::key::Key;
use crate::core::variable::{Variable, VariableType};
use crate::error::{PoseGraphError, PoseGraphResult};
use crate::manifold::ManifoldError;
use nalgebra::DVector;
use std::collections::BTreeMap;
use std::collections::btree_map;

/// Mapping from [`Key`] to [`Variable`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Values {
    variables: BTreeMap<Key, Variable>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new variable, failing with `DuplicateKey` if the key is taken.
    pub fn insert(&mut self, key: Key, value: impl Into<Variable>) -> PoseGraphResult<()> {
        match self.variables.entry(key) {
            btree_map::Entry::Occupied(_) => Err(PoseGraphError::DuplicateKey(key)),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(value.into());
                Ok(())
            }
        }
    }

    /// Replace an existing variable. The manifold type must not change.
    pub fn update(&mut self, key: Key, value: impl Into<Variable>) -> PoseGraphResult<()> {
        let value = value.into();
        let slot = self
            .variables
            .get_mut(&key)
            .ok_or(PoseGraphError::KeyNotFound(key))?;
        if slot.manifold_type() != value.manifold_type() {
            return Err(PoseGraphError::DimensionMismatch {
                key,
                expected: slot.manifold_type().to_string(),
                found: value.manifold_type().to_string(),
            });
        }
        *slot = value;
        Ok(())
    }

    /// Untyped access to the stored variable.
    pub fn at(&self, key: Key) -> PoseGraphResult<&Variable> {
        self.variables
            .get(&key)
            .ok_or(PoseGraphError::KeyNotFound(key))
    }

    /// Typed lookup.
    ///
    /// # Errors
    /// `KeyNotFound` if the key is absent, `DimensionMismatch` if it holds another manifold.
    pub fn get<T: VariableType>(&self, key: Key) -> PoseGraphResult<&T> {
        let variable = self.at(key)?;
        T::from_variable(variable).ok_or_else(|| PoseGraphError::DimensionMismatch {
            key,
            expected: T::MANIFOLD_TYPE.to_string(),
            found: variable.manifold_type().to_string(),
        })
    }

    pub fn contains(&self, key: Key) -> bool {
        self.variables.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Keys in ascending order
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.variables.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &Variable)> {
        self.variables.iter().map(|(key, value)| (*key, value))
    }

    /// Total tangent dimension over all stored variables
    pub fn total_dof(&self) -> usize {
        self.variables.values().map(Variable::dof).sum()
    }

    /// Apply a tangent step to every key in `delta`, returning a new store.
    ///
    /// Keys not mentioned in `delta` are copied unchanged. On error nothing is returned, so a
    /// step is applied to all of its keys or to none.
    pub fn retract(&self, delta: &Delta) -> PoseGraphResult<Values> {
        let mut variables = self.variables.clone();
        for (key, step) in delta.iter() {
            let slot = variables
                .get_mut(&key)
                .ok_or(PoseGraphError::KeyNotFound(key))?;
            *slot = slot
                .retract(step.as_slice())
                .map_err(|err| dimension_error(key, err))?;
        }
        Ok(Values { variables })
    }

    /// Tangent difference of `key` between `self` and `other`, `Log(selfᵏ⁻¹ ∘ otherᵏ)`.
    pub fn local(&self, key: Key, other: &Values) -> PoseGraphResult<DVector<f64>> {
        self.at(key)?
            .local(other.at(key)?)
            .map_err(|err| dimension_error(key, err))
    }
}

impl FromIterator<(Key, Variable)> for Values {
    fn from_iter<I: IntoIterator<Item = (Key, Variable)>>(iter: I) -> Self {
        Values {
            variables: iter.into_iter().collect(),
        }
    }
}

fn dimension_error(key: Key, err: ManifoldError) -> PoseGraphError {
    match err {
        ManifoldError::InvalidTangentDimension { expected, actual } => {
            PoseGraphError::DimensionMismatch {
                key,
                expected: format!("tangent of length {expected}"),
                found: format!("length {actual}"),
            }
        }
        ManifoldError::TypeMismatch { expected, found } => PoseGraphError::DimensionMismatch {
            key,
            expected: expected.to_string(),
            found: found.to_string(),
        },
        other => PoseGraphError::Manifold(other),
    }
}

/// Tangent-space step, one vector per key
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Delta {
    steps: BTreeMap<Key, DVector<f64>>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Key, step: DVector<f64>) {
        self.steps.insert(key, step);
    }

    pub fn get(&self, key: Key) -> Option<&DVector<f64>> {
        self.steps.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &DVector<f64>)> {
        self.steps.iter().map(|(key, step)| (*key, step))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Euclidean norm of the stacked step
    pub fn norm(&self) -> f64 {
        self.steps
            .values()
            .map(|step| step.norm_squared())
            .sum::<f64>()
            .sqrt()
    }
}
