//! Stacked-view shape algebra.
//!
//! A [`ShapeTracker`] describes how a flat backing buffer is interpreted as an
//! N-dimensional tensor through a stack of [`View`]s. Movement operations
//! (reshape/pad/expand/permute/shrink/stride) rewrite the top view in place
//! when a single view can express the result, and push a fresh view otherwise.
//! Trackers compose, simplify, unbind their symbolic dimensions, and
//! (conservatively) invert.

pub mod symbolic;
pub mod tracker;
pub mod view;

pub use symbolic::{all_fixed, dims_of, prod_dims, values_of, Dim, Variable};
pub use tracker::ShapeTracker;
pub use view::View;

use std::fmt;

/// Errors raised by shape algebra operations.
///
/// All of these indicate a contract violation by the caller; the tracker is
/// never left in a partially-modified state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// Reshape target has a different element count than the source.
    ReshapeSizeMismatch { from: Vec<usize>, to: Vec<usize> },

    /// Expand on an axis that is neither equal-sized nor of size 1.
    ExpandMismatch { from: Vec<usize>, to: Vec<usize> },

    /// Permutation is not a bijection over the axes.
    InvalidPermutation(Vec<usize>),

    /// Shrink range out of bounds or inverted.
    ShrinkOutOfRange { axis: usize, range: (usize, usize), size: usize },

    /// Stride multiplier of zero.
    ZeroStride(usize),

    /// Argument arity does not match the tracker's dimensionality.
    AxisCountMismatch { expected: usize, got: usize },
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeError::ReshapeSizeMismatch { from, to } => {
                write!(f, "cannot reshape {:?} ({} elements) to {:?}", from, from.iter().product::<usize>(), to)
            }
            ShapeError::ExpandMismatch { from, to } => {
                write!(f, "cannot expand {:?} to {:?}", from, to)
            }
            ShapeError::InvalidPermutation(axes) => {
                write!(f, "invalid permutation {:?}", axes)
            }
            ShapeError::ShrinkOutOfRange { axis, range, size } => {
                write!(f, "shrink range {:?} out of bounds for axis {} of size {}", range, axis, size)
            }
            ShapeError::ZeroStride(axis) => write!(f, "stride multiplier on axis {} must be nonzero", axis),
            ShapeError::AxisCountMismatch { expected, got } => {
                write!(f, "expected {} axis arguments, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for ShapeError {}
