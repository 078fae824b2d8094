//! Grid element types and the reduction operators defined over them.

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{HaloError, Result};

/// Element type tag of a grid, as declared by the translator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Float,
    Double,
    Int,
    Long,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::Float | ElementType::Int => 4,
            ElementType::Double | ElementType::Long => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::Float => "f32",
            ElementType::Double => "f64",
            ElementType::Int => "i32",
            ElementType::Long => "i64",
        }
    }
}

/// Rust element types that may be stored in a grid.
pub trait Element: bytemuck::Pod {
    const TYPE: ElementType;
}

impl Element for f32 {
    const TYPE: ElementType = ElementType::Float;
}
impl Element for f64 {
    const TYPE: ElementType = ElementType::Double;
}
impl Element for i32 {
    const TYPE: ElementType = ElementType::Int;
}
impl Element for i64 {
    const TYPE: ElementType = ElementType::Long;
}

/// A single tagged element value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
}

impl Scalar {
    pub fn element_type(&self) -> ElementType {
        match self {
            Scalar::F32(_) => ElementType::Float,
            Scalar::F64(_) => ElementType::Double,
            Scalar::I32(_) => ElementType::Int,
            Scalar::I64(_) => ElementType::Long,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
            Scalar::I32(v) => v as f64,
            Scalar::I64(v) => v as f64,
        }
    }

    /// Decode one element of type `ty` from its native-endian bytes.
    pub fn from_bytes(ty: ElementType, bytes: &[u8]) -> Scalar {
        match ty {
            ElementType::Float => Scalar::F32(bytemuck::pod_read_unaligned(bytes)),
            ElementType::Double => Scalar::F64(bytemuck::pod_read_unaligned(bytes)),
            ElementType::Int => Scalar::I32(bytemuck::pod_read_unaligned(bytes)),
            ElementType::Long => Scalar::I64(bytemuck::pod_read_unaligned(bytes)),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::F32(v) => write!(f, "{v}"),
            Scalar::F64(v) => write!(f, "{v}"),
            Scalar::I32(v) => write!(f, "{v}"),
            Scalar::I64(v) => write!(f, "{v}"),
        }
    }
}

/// Associative reduction operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Max,
    Min,
    Sum,
    Prod,
}

macro_rules! combine {
    ($op:expr, $a:expr, $b:expr) => {
        match $op {
            ReduceOp::Max => if $a > $b { $a } else { $b },
            ReduceOp::Min => if $a < $b { $a } else { $b },
            ReduceOp::Sum => $a + $b,
            ReduceOp::Prod => $a * $b,
        }
    };
}

impl ReduceOp {
    /// Value every rank contributes when it owns no elements.
    pub fn identity(self, ty: ElementType) -> Scalar {
        match (self, ty) {
            (ReduceOp::Sum, ElementType::Float) => Scalar::F32(0.0),
            (ReduceOp::Prod, ElementType::Float) => Scalar::F32(1.0),
            (ReduceOp::Max, ElementType::Float) => Scalar::F32(f32::MIN),
            (ReduceOp::Min, ElementType::Float) => Scalar::F32(f32::MAX),
            (ReduceOp::Sum, ElementType::Double) => Scalar::F64(0.0),
            (ReduceOp::Prod, ElementType::Double) => Scalar::F64(1.0),
            (ReduceOp::Max, ElementType::Double) => Scalar::F64(f64::MIN),
            (ReduceOp::Min, ElementType::Double) => Scalar::F64(f64::MAX),
            (ReduceOp::Sum, ElementType::Int) => Scalar::I32(0),
            (ReduceOp::Prod, ElementType::Int) => Scalar::I32(1),
            (ReduceOp::Max, ElementType::Int) => Scalar::I32(i32::MIN),
            (ReduceOp::Min, ElementType::Int) => Scalar::I32(i32::MAX),
            (ReduceOp::Sum, ElementType::Long) => Scalar::I64(0),
            (ReduceOp::Prod, ElementType::Long) => Scalar::I64(1),
            (ReduceOp::Max, ElementType::Long) => Scalar::I64(i64::MIN),
            (ReduceOp::Min, ElementType::Long) => Scalar::I64(i64::MAX),
        }
    }

    /// Combine two values of the same type. Integer sums and products wrap.
    /// Operands of different element types are a `TypeMismatch`.
    pub fn apply(self, a: Scalar, b: Scalar) -> Result<Scalar> {
        Ok(match (a, b) {
            (Scalar::F32(x), Scalar::F32(y)) => Scalar::F32(combine!(self, x, y)),
            (Scalar::F64(x), Scalar::F64(y)) => Scalar::F64(combine!(self, x, y)),
            (Scalar::I32(x), Scalar::I32(y)) => Scalar::I32(match self {
                ReduceOp::Sum => x.wrapping_add(y),
                ReduceOp::Prod => x.wrapping_mul(y),
                _ => combine!(self, x, y),
            }),
            (Scalar::I64(x), Scalar::I64(y)) => Scalar::I64(match self {
                ReduceOp::Sum => x.wrapping_add(y),
                ReduceOp::Prod => x.wrapping_mul(y),
                _ => combine!(self, x, y),
            }),
            (a, b) => {
                return Err(HaloError::TypeMismatch {
                    expected: a.element_type().name(),
                    found: b.element_type().name(),
                })
            }
        })
    }

    /// Reduce a packed buffer of elements of type `ty`. Returns `None` for an
    /// empty buffer.
    pub fn fold(self, ty: ElementType, bytes: &[u8]) -> Result<Option<Scalar>> {
        bytes
            .par_chunks_exact(ty.size())
            .map(|chunk| Ok(Scalar::from_bytes(ty, chunk)))
            .try_reduce_with(|a, b| self.apply(a, b))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack<T: bytemuck::Pod>(values: &[T]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    #[test]
    fn fold_matches_sequential() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let bytes = pack(&values);
        assert_eq!(ReduceOp::Sum.fold(ElementType::Double, &bytes).unwrap(), Some(Scalar::F64(55.0)));
        assert_eq!(ReduceOp::Max.fold(ElementType::Double, &bytes).unwrap(), Some(Scalar::F64(10.0)));
        assert_eq!(ReduceOp::Min.fold(ElementType::Double, &bytes).unwrap(), Some(Scalar::F64(1.0)));
        assert_eq!(
            ReduceOp::Prod.fold(ElementType::Double, &bytes).unwrap(),
            Some(Scalar::F64(3_628_800.0))
        );
    }

    #[test]
    fn fold_of_empty_is_none() {
        assert_eq!(ReduceOp::Sum.fold(ElementType::Int, &[]).unwrap(), None);
    }

    #[test]
    fn identity_is_neutral() {
        for op in [ReduceOp::Max, ReduceOp::Min, ReduceOp::Sum, ReduceOp::Prod] {
            let v = Scalar::I32(-7);
            assert_eq!(op.apply(op.identity(ElementType::Int), v).unwrap(), v);
            let v = Scalar::F32(3.5);
            assert_eq!(op.apply(v, op.identity(ElementType::Float)).unwrap(), v);
        }
    }

    #[test]
    fn mixed_types_do_not_combine() {
        let err = ReduceOp::Sum.apply(Scalar::F32(1.0), Scalar::I32(1)).unwrap_err();
        assert!(matches!(
            err,
            HaloError::TypeMismatch {
                expected: "f32",
                found: "i32"
            }
        ));
        assert!(ReduceOp::Max.apply(Scalar::I64(2), Scalar::F64(2.0)).is_err());
    }

    #[test]
    fn element_sizes() {
        assert_eq!(ElementType::Float.size(), std::mem::size_of::<f32>());
        assert_eq!(ElementType::Long.size(), std::mem::size_of::<i64>());
        assert_eq!(<f64 as Element>::TYPE, ElementType::Double);
    }
}
