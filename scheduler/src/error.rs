//! Error types for graph construction and scheduling.

use shape::ShapeError;
use std::fmt;

/// Contract violations raised eagerly by LazyBuffer constructors.
#[derive(Debug, Clone, PartialEq)]
pub enum LazyError {
    /// Elementwise operands do not share a shape.
    ShapeMismatch(Vec<Vec<usize>>),

    /// Elementwise operands do not share a scalar dtype.
    DtypeMismatch(String),

    /// NEG does not accept a boolean operand.
    NegOnBool,

    /// The WHERE predicate must be boolean.
    WherePredicateNotBool,

    /// Non-bitcast cast attempted on a disk buffer.
    CastOnDiskBuffer,

    /// Shape-changing bitcast precondition failed.
    ShapeChangingBitcast(String),

    /// Assign target has no realized backing buffer.
    UnrealizedAssignTarget,

    /// Assign source and target element counts differ.
    AssignSizeMismatch { dst: usize, src: usize },

    /// Reduce axis out of range.
    AxisOutOfRange { axis: usize, ndim: usize },

    /// Underlying shape algebra error.
    Shape(ShapeError),
}

impl fmt::Display for LazyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LazyError::ShapeMismatch(shapes) => write!(f, "all shapes must be the same {:?}", shapes),
            LazyError::DtypeMismatch(msg) => write!(f, "all dtypes must match: {}", msg),
            LazyError::NegOnBool => write!(f, "NEG does not accept dtype bool"),
            LazyError::WherePredicateNotBool => write!(f, "WHERE must have a bool first operand"),
            LazyError::CastOnDiskBuffer => write!(f, "attempted to cast disk buffer (bitcast only)"),
            LazyError::ShapeChangingBitcast(msg) => write!(f, "shape changing bitcast: {}", msg),
            LazyError::UnrealizedAssignTarget => write!(f, "assign target must be realized"),
            LazyError::AssignSizeMismatch { dst, src } => {
                write!(f, "assign target must have same size, {} != {}", dst, src)
            }
            LazyError::AxisOutOfRange { axis, ndim } => {
                write!(f, "reduce axis {} out of range for {} dimensions", axis, ndim)
            }
            LazyError::Shape(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LazyError {}

impl From<ShapeError> for LazyError {
    fn from(e: ShapeError) -> Self {
        LazyError::Shape(e)
    }
}

/// Failures surfacing at the `create_schedule*` boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleError {
    /// An assign view is neither contiguous nor an equivalent masked shrink.
    NonContiguousAssign(String),

    /// Integrity failure in grouping or ordering; indicates a scheduler bug.
    Internal(String),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::NonContiguousAssign(st) => {
                write!(f, "must be contiguous for assign {}", st)
            }
            ScheduleError::Internal(msg) => write!(f, "internal scheduler error: {}", msg),
        }
    }
}

impl std::error::Error for ScheduleError {}
