//! Host-resident values
//!
//! A [`Literal`] is the host-side twin of a device buffer tree: dense arrays
//! stored as raw little-endian bytes, nested in tuples. Typed access goes
//! through [`NativeType`] and `bytemuck`.

use crate::error::{DeviceError, Result};
use crate::shape::{ArrayShape, PrimitiveType, Shape};

/// Rust scalar types with a matching [`PrimitiveType`].
pub trait NativeType: bytemuck::Pod + Send + Sync {
    const PRIMITIVE_TYPE: PrimitiveType;
}

macro_rules! native_type {
    ($($ty:ty => $prim:ident),+ $(,)?) => {
        $(impl NativeType for $ty {
            const PRIMITIVE_TYPE: PrimitiveType = PrimitiveType::$prim;
        })+
    };
}

native_type! {
    i8 => S8,
    i16 => S16,
    i32 => S32,
    i64 => S64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Array { shape: ArrayShape, data: Vec<u8> },
    Tuple(Vec<Literal>),
}

impl Literal {
    pub fn scalar<T: NativeType>(value: T) -> Self {
        Self::Array {
            shape: ArrayShape::new(T::PRIMITIVE_TYPE, Vec::new()),
            data: bytemuck::bytes_of(&value).to_vec(),
        }
    }

    pub fn vector<T: NativeType>(values: &[T]) -> Self {
        Self::Array {
            shape: ArrayShape::new(T::PRIMITIVE_TYPE, vec![values.len()]),
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// Row-major matrix; every row must have the same length.
    pub fn matrix<T: NativeType>(rows: &[Vec<T>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().position(|row| row.len() != cols) {
            return Err(DeviceError::InvalidArgument(format!(
                "matrix row {bad} has {} elements, expected {cols}",
                rows[bad].len()
            )));
        }
        let flat: Vec<T> = rows.iter().flatten().copied().collect();
        Self::from_vec(vec![rows.len(), cols], &flat)
    }

    pub fn from_vec<T: NativeType>(dimensions: Vec<usize>, values: &[T]) -> Result<Self> {
        let shape = ArrayShape::new(T::PRIMITIVE_TYPE, dimensions);
        if shape.element_count() != values.len() {
            return Err(DeviceError::InvalidArgument(format!(
                "{} values supplied for shape {shape}",
                values.len()
            )));
        }
        Ok(Self::Array {
            shape,
            data: bytemuck::cast_slice(values).to_vec(),
        })
    }

    /// Array literal over raw bytes; the length must match the shape.
    pub fn from_bytes(shape: ArrayShape, data: Vec<u8>) -> Result<Self> {
        if data.len() != shape.byte_size() {
            return Err(DeviceError::InvalidArgument(format!(
                "{} bytes supplied for shape {shape} ({} expected)",
                data.len(),
                shape.byte_size()
            )));
        }
        Ok(Self::Array { shape, data })
    }

    pub fn tuple(elements: Vec<Literal>) -> Self {
        Self::Tuple(elements)
    }

    /// Zero-filled literal of the given shape.
    pub fn zeros(shape: &Shape) -> Self {
        match shape {
            Shape::Array(array) => Self::Array {
                shape: array.clone(),
                data: vec![0; array.byte_size()],
            },
            Shape::Tuple(elements) => Self::Tuple(elements.iter().map(Literal::zeros).collect()),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Self::Array { shape, .. } => Shape::Array(shape.clone()),
            Self::Tuple(elements) => Shape::Tuple(elements.iter().map(Literal::shape).collect()),
        }
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    pub fn tuple_elements(&self) -> &[Literal] {
        match self {
            Self::Tuple(elements) => elements,
            Self::Array { .. } => &[],
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Array { data, .. } => Some(data),
            Self::Tuple(_) => None,
        }
    }

    /// Total payload bytes across all leaves.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Array { data, .. } => data.len(),
            Self::Tuple(elements) => elements.iter().map(Literal::size_bytes).sum(),
        }
    }

    pub fn to_vec<T: NativeType>(&self) -> Result<Vec<T>> {
        match self {
            Self::Array { shape, data } if shape.element_type == T::PRIMITIVE_TYPE => Ok(data
                .chunks_exact(std::mem::size_of::<T>())
                .map(bytemuck::pod_read_unaligned)
                .collect()),
            Self::Array { shape, .. } => Err(DeviceError::shape_mismatch(T::PRIMITIVE_TYPE, shape.element_type)),
            Self::Tuple(_) => Err(DeviceError::InvalidArgument(
                "cannot read elements of a tuple literal".to_string(),
            )),
        }
    }

    pub fn get_scalar<T: NativeType>(&self) -> Result<T> {
        let values = self.to_vec::<T>()?;
        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(DeviceError::InvalidArgument(format!(
                "literal of shape {} is not a scalar",
                self.shape()
            ))),
        }
    }

    /// Array leaves in depth-first order.
    pub fn leaves(&self) -> Vec<&Literal> {
        match self {
            Self::Array { .. } => vec![self],
            Self::Tuple(elements) => elements.iter().flat_map(Literal::leaves).collect(),
        }
    }

    pub fn into_leaves(self) -> Vec<Literal> {
        match self {
            Self::Array { .. } => vec![self],
            Self::Tuple(elements) => elements.into_iter().flat_map(Literal::into_leaves).collect(),
        }
    }

    /// Rebuild a literal of `shape` from its array leaves in depth-first order.
    ///
    /// Leaves take the array shape (including layout) found in `shape`.
    pub fn from_leaves(shape: &Shape, leaves: Vec<Literal>) -> Result<Self> {
        let expected = shape.leaf_count();
        if leaves.len() != expected {
            return Err(DeviceError::InvalidArgument(format!(
                "shape {shape} has {expected} leaves, {} supplied",
                leaves.len()
            )));
        }
        let mut leaves = leaves.into_iter();
        Self::build(shape, &mut leaves)
    }

    fn build(shape: &Shape, leaves: &mut impl Iterator<Item = Literal>) -> Result<Self> {
        match shape {
            Shape::Tuple(elements) => elements
                .iter()
                .map(|element| Self::build(element, &mut *leaves))
                .collect::<Result<Vec<_>>>()
                .map(Self::Tuple),
            Shape::Array(array) => match leaves.next() {
                Some(Self::Array { shape: leaf, data }) if leaf.compatible(array) => Ok(Self::Array {
                    shape: array.clone(),
                    data,
                }),
                Some(other) => Err(DeviceError::shape_mismatch(array, other.shape())),
                None => Err(DeviceError::Internal(format!("ran out of leaves while building {shape}"))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scalar_and_vector() {
        assert_eq!(Literal::scalar(7i32).get_scalar::<i32>().unwrap(), 7);
        let v = Literal::vector(&[1.0f32, 2.5, -3.0]);
        assert_eq!(v.shape(), Shape::array(PrimitiveType::F32, [3]));
        assert_eq!(v.to_vec::<f32>().unwrap(), vec![1.0, 2.5, -3.0]);
        assert_eq!(v.size_bytes(), 12);
    }

    #[test]
    fn test_matrix_rejects_ragged_rows() {
        let m = Literal::matrix(&[vec![1u16, 2], vec![3, 4], vec![5, 6]]).unwrap();
        assert_eq!(m.shape(), Shape::array(PrimitiveType::U16, [3, 2]));
        assert!(Literal::matrix(&[vec![1u16, 2], vec![3]]).is_err());
    }

    #[test]
    fn test_type_mismatch() {
        let v = Literal::vector(&[1i64, 2]);
        assert!(matches!(v.to_vec::<f64>(), Err(DeviceError::ShapeMismatch { .. })));
        assert!(Literal::tuple(vec![]).to_vec::<f64>().is_err());
    }

    #[test]
    fn test_from_bytes_checks_length() {
        let shape = ArrayShape::new(PrimitiveType::F32, vec![2]);
        assert!(Literal::from_bytes(shape.clone(), vec![0; 8]).is_ok());
        assert!(Literal::from_bytes(shape, vec![0; 7]).is_err());
    }

    #[test]
    fn test_leaves_and_rebuild() {
        let literal = Literal::tuple(vec![
            Literal::scalar(1u8),
            Literal::tuple(vec![Literal::vector(&[2.0f64, 3.0]), Literal::tuple(vec![])]),
        ]);
        let shape = literal.shape();
        assert_eq!(literal.leaves().len(), 2);
        let rebuilt = Literal::from_leaves(&shape, literal.clone().into_leaves()).unwrap();
        assert_eq!(rebuilt, literal);
    }

    #[test]
    fn test_from_leaves_rejects_wrong_leaf() {
        let shape = Shape::tuple(vec![Shape::scalar(PrimitiveType::F32)]);
        let err = Literal::from_leaves(&shape, vec![Literal::scalar(1i32)]).unwrap_err();
        assert!(matches!(err, DeviceError::ShapeMismatch { .. }));
        assert!(Literal::from_leaves(&shape, vec![]).is_err());
    }

    #[test]
    fn test_zeros() {
        let shape = Shape::tuple(vec![Shape::array(PrimitiveType::S32, [2, 2]), Shape::tuple(vec![])]);
        let zeros = Literal::zeros(&shape);
        assert_eq!(zeros.shape(), shape);
        assert_eq!(zeros.tuple_elements()[0].to_vec::<i32>().unwrap(), vec![0; 4]);
    }

    proptest! {
        #[test]
        fn vector_roundtrips_through_bytes(values in prop::collection::vec(any::<i32>(), 0..64)) {
            let literal = Literal::vector(&values);
            prop_assert_eq!(literal.to_vec::<i32>().unwrap(), values);
        }
    }
}
