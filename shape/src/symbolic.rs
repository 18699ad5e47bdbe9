//! Symbolic dimensions.
//!
//! A dimension extent is either a fixed integer or a named [`Variable`]. A
//! variable inside a live tracker always carries its runtime binding; `unbind`
//! strips the binding off for AST embedding and reports the `(variable, value)`
//! pairs so the scheduler can merge them into its binding map.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named symbolic dimension with an inclusive value range.
///
/// Identity and ordering are by name (then range), so two bindings of the same
/// variable collapse in sorted, deduplicated collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub min: usize,
    pub max: usize,
}

impl Variable {
    pub fn new(name: impl Into<String>, min: usize, max: usize) -> Self {
        Self { name: name.into(), min, max }
    }

    /// Bind this variable to a concrete value, producing a dimension.
    pub fn bind(self, val: usize) -> Dim {
        debug_assert!(self.min <= val && val <= self.max, "binding outside variable range");
        Dim::Bound(self, val)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{},{}]", self.name, self.min, self.max)
    }
}

/// A single dimension extent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    /// Concrete extent.
    Fixed(usize),
    /// Variable carrying its runtime binding.
    Bound(Variable, usize),
    /// Variable with the binding stripped (only appears in unbound trackers
    /// embedded in lowered ASTs).
    Unbound(Variable),
}

impl Dim {
    /// The numeric extent. For an unbound variable this is its maximum, which
    /// makes downstream size arithmetic an upper bound.
    pub fn value(&self) -> usize {
        match self {
            Dim::Fixed(n) => *n,
            Dim::Bound(_, v) => *v,
            Dim::Unbound(v) => v.max,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, Dim::Fixed(_))
    }

    pub fn var(&self) -> Option<&Variable> {
        match self {
            Dim::Fixed(_) => None,
            Dim::Bound(v, _) | Dim::Unbound(v) => Some(v),
        }
    }

    /// Strip the binding, reporting it if one was present.
    pub fn unbind(&self) -> (Dim, Option<(Variable, usize)>) {
        match self {
            Dim::Bound(v, val) => (Dim::Unbound(v.clone()), Some((v.clone(), *val))),
            other => (other.clone(), None),
        }
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Fixed(n)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{}", n),
            Dim::Bound(v, val) => write!(f, "{}={}", v.name, val),
            Dim::Unbound(v) => write!(f, "{}", v.name),
        }
    }
}

/// Fixed dimensions from plain extents.
pub fn dims_of(shape: &[usize]) -> Vec<Dim> {
    shape.iter().map(|&s| Dim::Fixed(s)).collect()
}

/// Numeric extents of a dim slice.
pub fn values_of(shape: &[Dim]) -> Vec<usize> {
    shape.iter().map(Dim::value).collect()
}

/// Product of the numeric extents.
pub fn prod_dims(shape: &[Dim]) -> usize {
    shape.iter().map(Dim::value).product()
}

/// True when no symbolic dimensions are present.
pub fn all_fixed(shape: &[Dim]) -> bool {
    shape.iter().all(Dim::is_fixed)
}
