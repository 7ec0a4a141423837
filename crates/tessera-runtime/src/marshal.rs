//! Conversion between host values and flat leaf lists
//!
//! A host value is flattened into a [`HostBufferTree`]: its logical shape plus
//! the array leaves in depth-first order. `unflatten` reverses this for
//! values read back from a device.

use crate::error::{Error, Result};
use std::sync::Arc;
use tessera_device::{Literal, NativeType, Shape};

/// Shape and depth-first array leaves of a host value.
#[derive(Debug, Clone)]
pub struct HostBufferTree {
    pub shape: Shape,
    pub leaves: Vec<Arc<Literal>>,
}

impl HostBufferTree {
    pub fn size_bytes(&self) -> usize {
        self.leaves.iter().map(|leaf| leaf.size_bytes()).sum()
    }
}

/// Host values that can be moved to and from device buffers.
pub trait Marshal: Sized {
    fn flatten(&self) -> Result<HostBufferTree>;

    fn unflatten(shape: &Shape, leaves: Vec<Literal>) -> Result<Self>;
}

impl Marshal for Literal {
    fn flatten(&self) -> Result<HostBufferTree> {
        Ok(HostBufferTree {
            shape: self.shape(),
            leaves: self.leaves().into_iter().cloned().map(Arc::new).collect(),
        })
    }

    fn unflatten(shape: &Shape, leaves: Vec<Literal>) -> Result<Self> {
        Literal::from_leaves(shape, leaves).map_err(Error::transfer)
    }
}

fn single_leaf(shape: &Shape, leaves: Vec<Literal>) -> Result<Literal> {
    let mut leaves = leaves.into_iter();
    match (shape, leaves.next(), leaves.next()) {
        (Shape::Array(_), Some(leaf), None) => Ok(leaf),
        _ => Err(Error::Transfer(format!("expected a single array, got {shape}"))),
    }
}

impl<T: NativeType> Marshal for Vec<T> {
    fn flatten(&self) -> Result<HostBufferTree> {
        Literal::vector(self).flatten()
    }

    fn unflatten(shape: &Shape, leaves: Vec<Literal>) -> Result<Self> {
        single_leaf(shape, leaves)?.to_vec().map_err(Error::transfer)
    }
}

macro_rules! marshal_scalar {
    ($($ty:ty),+ $(,)?) => {
        $(impl Marshal for $ty {
            fn flatten(&self) -> Result<HostBufferTree> {
                Literal::scalar(*self).flatten()
            }

            fn unflatten(shape: &Shape, leaves: Vec<Literal>) -> Result<Self> {
                single_leaf(shape, leaves)?.get_scalar().map_err(Error::transfer)
            }
        })+
    };
}

marshal_scalar!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl<A: Marshal, B: Marshal> Marshal for (A, B) {
    fn flatten(&self) -> Result<HostBufferTree> {
        let first = self.0.flatten()?;
        let second = self.1.flatten()?;
        let mut leaves = first.leaves;
        leaves.extend(second.leaves);
        Ok(HostBufferTree {
            shape: Shape::tuple(vec![first.shape, second.shape]),
            leaves,
        })
    }

    fn unflatten(shape: &Shape, mut leaves: Vec<Literal>) -> Result<Self> {
        let [first, second] = shape.tuple_shapes() else {
            return Err(Error::Transfer(format!("expected a 2-tuple, got {shape}")));
        };
        if leaves.len() != shape.leaf_count() {
            return Err(Error::Transfer(format!(
                "shape {shape} has {} leaves, {} supplied",
                shape.leaf_count(),
                leaves.len()
            )));
        }
        let rest = leaves.split_off(first.leaf_count());
        Ok((A::unflatten(first, leaves)?, B::unflatten(second, rest)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tessera_device::PrimitiveType;

    fn roundtrip<T: Marshal>(value: &T) -> T {
        let tree = value.flatten().unwrap();
        let leaves = tree.leaves.iter().map(|leaf| Literal::clone(leaf)).collect();
        T::unflatten(&tree.shape, leaves).unwrap()
    }

    #[test]
    fn test_literal_flatten_orders_leaves_depth_first() {
        let literal = Literal::tuple(vec![
            Literal::scalar(1i32),
            Literal::tuple(vec![Literal::vector(&[2.0f32, 3.0]), Literal::scalar(4u8)]),
        ]);
        let tree = literal.flatten().unwrap();
        assert_eq!(tree.leaves.len(), 3);
        assert_eq!(*tree.leaves[1], Literal::vector(&[2.0f32, 3.0]));
        assert_eq!(tree.size_bytes(), 4 + 8 + 1);
        assert_eq!(roundtrip(&literal), literal);
    }

    #[test]
    fn test_native_values() {
        assert_eq!(roundtrip(&vec![1i64, -2, 3]), vec![1, -2, 3]);
        assert_eq!(roundtrip(&2.5f64), 2.5);
        assert_eq!(roundtrip(&(7u32, vec![0.5f32, 1.5])), (7, vec![0.5, 1.5]));
    }

    #[test]
    fn test_unflatten_rejects_wrong_structure() {
        let tuple = Shape::tuple(vec![Shape::scalar(PrimitiveType::S32)]);
        let err = Vec::<i32>::unflatten(&tuple, vec![Literal::scalar(1i32)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);

        let scalar = Shape::scalar(PrimitiveType::F32);
        let err = <(f32, f32)>::unflatten(&scalar, vec![Literal::scalar(1.0f32)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);

        let err = f32::unflatten(&Shape::scalar(PrimitiveType::S32), vec![Literal::scalar(1i32)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
    }
}
