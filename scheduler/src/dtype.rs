//! Scalar and image data types, and host-side constant values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An image-backed dtype: float32 data laid out as a 2D image with 4-wide
/// texels. The scheduler may silently downgrade it to plain float32 when the
/// shape cannot satisfy the layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDType {
    pub shape: Vec<usize>,
}

impl ImageDType {
    pub fn pixels(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,
    Image(ImageDType),
}

impl DType {
    pub fn itemsize(&self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::UInt8 => 1,
            DType::Int16 | DType::UInt16 | DType::Float16 => 2,
            DType::Int32 | DType::UInt32 | DType::Float32 | DType::Image(_) => 4,
            DType::Int64 | DType::UInt64 | DType::Float64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float16 | DType::Float32 | DType::Float64 | DType::Image(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(
            self,
            DType::Int8
                | DType::Int16
                | DType::Int32
                | DType::Int64
                | DType::UInt8
                | DType::UInt16
                | DType::UInt32
                | DType::UInt64
        )
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, DType::UInt8 | DType::UInt16 | DType::UInt32 | DType::UInt64)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, DType::Bool)
    }

    /// The scalar dtype this computes as; images compute as float32.
    pub fn scalar(&self) -> DType {
        match self {
            DType::Image(_) => DType::Float32,
            other => other.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Image(_) => "image",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A scalar literal carried by const nodes and folded on the host.
///
/// Floats compare and hash bitwise so the structural cache can key on them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ConstValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            ConstValue::Bool(b) => *b as u8 as f64,
            ConstValue::Int(i) => *i as f64,
            ConstValue::Float(f) => *f,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            ConstValue::Bool(b) => *b as i64,
            ConstValue::Int(i) => *i,
            ConstValue::Float(f) => *f as i64,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            ConstValue::Bool(b) => *b,
            ConstValue::Int(i) => *i != 0,
            ConstValue::Float(f) => *f != 0.0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_f64() == 0.0
    }

    pub fn is_one(&self) -> bool {
        self.as_f64() == 1.0
    }
}

impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstValue::Bool(a), ConstValue::Bool(b)) => a == b,
            (ConstValue::Int(a), ConstValue::Int(b)) => a == b,
            (ConstValue::Float(a), ConstValue::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for ConstValue {}

impl std::hash::Hash for ConstValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            ConstValue::Bool(b) => {
                state.write_u8(0);
                b.hash(state);
            }
            ConstValue::Int(i) => {
                state.write_u8(1);
                i.hash(state);
            }
            ConstValue::Float(f) => {
                state.write_u8(2);
                state.write_u64(f.to_bits());
            }
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Bool(b) => write!(f, "{}", b),
            ConstValue::Int(i) => write!(f, "{}", i),
            ConstValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Coerce a host scalar into the domain of `dtype`, truncating the way the
/// target type would.
pub fn as_const(val: ConstValue, dtype: &DType) -> ConstValue {
    match dtype {
        DType::Bool => ConstValue::Bool(val.truthy()),
        DType::Int8 => ConstValue::Int(val.as_i64() as i8 as i64),
        DType::Int16 => ConstValue::Int(val.as_i64() as i16 as i64),
        DType::Int32 => ConstValue::Int(val.as_i64() as i32 as i64),
        DType::Int64 => ConstValue::Int(val.as_i64()),
        DType::UInt8 => ConstValue::Int(val.as_i64() as u8 as i64),
        DType::UInt16 => ConstValue::Int(val.as_i64() as u16 as i64),
        DType::UInt32 => ConstValue::Int(val.as_i64() as u32 as i64),
        DType::UInt64 => ConstValue::Int(val.as_i64() as u64 as i64),
        DType::Float16 | DType::Float32 | DType::Image(_) => ConstValue::Float(val.as_f64() as f32 as f64),
        DType::Float64 => ConstValue::Float(val.as_f64()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_const_truncates() {
        assert_eq!(as_const(ConstValue::Int(300), &DType::UInt8), ConstValue::Int(44));
        assert_eq!(as_const(ConstValue::Int(-1), &DType::UInt8), ConstValue::Int(255));
        assert_eq!(as_const(ConstValue::Float(2.7), &DType::Int32), ConstValue::Int(2));
        assert_eq!(as_const(ConstValue::Int(5), &DType::Bool), ConstValue::Bool(true));
        assert_eq!(as_const(ConstValue::Float(1.5), &DType::Float64), ConstValue::Float(1.5));
    }

    #[test]
    fn test_const_value_numeric_predicates() {
        assert!(ConstValue::Float(0.0).is_zero());
        assert!(ConstValue::Float(-0.0).is_zero());
        assert!(ConstValue::Int(1).is_one());
        assert!(ConstValue::Bool(true).is_one());
        assert!(!ConstValue::Float(f64::NAN).is_zero());
    }

    #[test]
    fn test_image_scalar() {
        let im = DType::Image(ImageDType { shape: vec![8, 8, 4] });
        assert_eq!(im.scalar(), DType::Float32);
        assert_eq!(im.itemsize(), 4);
        assert!(im.is_float());
    }
}
