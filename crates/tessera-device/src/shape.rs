//! Shapes, layouts and shape indices
//!
//! A [`Shape`] is either a dense array of one [`PrimitiveType`] or a tuple of
//! nested shapes. Device-side trees of allocations mirror shapes exactly, so
//! most of the runtime walks shapes in pre-order through [`Shape::subshapes`].
//!
//! ```text
//! (f32[2,3], (s32[], u8[0]))
//!  ├── {0}    f32[2,3]
//!  └── {1}    (s32[], u8[0])
//!       ├── {1,0}  s32[]
//!       └── {1,1}  u8[0]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element types a dense array can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Pred,
    S8,
    S16,
    S32,
    S64,
    U8,
    U16,
    U32,
    U64,
    F16,
    Bf16,
    F32,
    F64,
}

impl PrimitiveType {
    /// Size of one element in bytes.
    pub const fn byte_width(self) -> usize {
        match self {
            Self::Pred | Self::S8 | Self::U8 => 1,
            Self::S16 | Self::U16 | Self::F16 | Self::Bf16 => 2,
            Self::S32 | Self::U32 | Self::F32 => 4,
            Self::S64 | Self::U64 | Self::F64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Pred => "pred",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical ordering of an array's dimensions, fastest-varying first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Layout {
    pub minor_to_major: Vec<usize>,
}

impl Layout {
    pub fn new(minor_to_major: Vec<usize>) -> Self {
        Self { minor_to_major }
    }

    /// Row-major layout for an array of `rank` dimensions.
    pub fn major_to_minor(rank: usize) -> Self {
        Self {
            minor_to_major: (0..rank).rev().collect(),
        }
    }
}

/// Dense array shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayShape {
    pub element_type: PrimitiveType,
    pub dimensions: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Layout>,
}

impl ArrayShape {
    pub fn new(element_type: PrimitiveType, dimensions: Vec<usize>) -> Self {
        Self {
            element_type,
            dimensions,
            layout: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn element_count(&self) -> usize {
        self.dimensions.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.element_type.byte_width()
    }

    /// Equality ignoring layout.
    pub fn compatible(&self, other: &ArrayShape) -> bool {
        self.element_type == other.element_type && self.dimensions == other.dimensions
    }
}

impl fmt::Display for ArrayShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.element_type)?;
        for (i, dim) in self.dimensions.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")?;
        if let Some(layout) = &self.layout {
            if !layout.minor_to_major.is_empty() {
                write!(f, "{{{}}}", join(&layout.minor_to_major))?;
            }
        }
        Ok(())
    }
}

fn join(values: &[usize]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",")
}

/// Path from the root of a shape to one of its subshapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeIndex(Vec<usize>);

impl ShapeIndex {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(path: Vec<usize>) -> Self {
        Self(path)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the `i`th child of this node.
    pub fn child(&self, i: usize) -> Self {
        let mut path = self.0.clone();
        path.push(i);
        Self(path)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl fmt::Display for ShapeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", join(&self.0))
    }
}

/// Array or (possibly nested, possibly empty) tuple shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Array(ArrayShape),
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn array(element_type: PrimitiveType, dimensions: impl Into<Vec<usize>>) -> Self {
        Self::Array(ArrayShape::new(element_type, dimensions.into()))
    }

    pub fn array_with_layout(element_type: PrimitiveType, dimensions: impl Into<Vec<usize>>, layout: Layout) -> Self {
        Self::Array(ArrayShape {
            element_type,
            dimensions: dimensions.into(),
            layout: Some(layout),
        })
    }

    pub fn scalar(element_type: PrimitiveType) -> Self {
        Self::array(element_type, Vec::new())
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Self::Tuple(elements)
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    pub fn as_array(&self) -> Option<&ArrayShape> {
        match self {
            Self::Array(array) => Some(array),
            Self::Tuple(_) => None,
        }
    }

    /// Element shapes of a tuple; empty for arrays.
    pub fn tuple_shapes(&self) -> &[Shape] {
        match self {
            Self::Tuple(elements) => elements,
            Self::Array(_) => &[],
        }
    }

    pub fn tuple_element_count(&self) -> usize {
        self.tuple_shapes().len()
    }

    /// Number of array elements; tuples count the elements of all their leaves.
    pub fn element_count(&self) -> usize {
        match self {
            Self::Array(array) => array.element_count(),
            Self::Tuple(elements) => elements.iter().map(Shape::element_count).sum(),
        }
    }

    /// Every subshape including `self`, in pre-order.
    pub fn subshapes(&self) -> Vec<(ShapeIndex, &Shape)> {
        let mut out = Vec::new();
        self.collect_subshapes(ShapeIndex::root(), &mut out);
        out
    }

    fn collect_subshapes<'a>(&'a self, index: ShapeIndex, out: &mut Vec<(ShapeIndex, &'a Shape)>) {
        if let Self::Tuple(elements) = self {
            out.push((index.clone(), self));
            for (i, element) in elements.iter().enumerate() {
                element.collect_subshapes(index.child(i), out);
            }
        } else {
            out.push((index, self));
        }
    }

    /// Array leaves in depth-first order.
    pub fn leaf_shapes(&self) -> Vec<&ArrayShape> {
        match self {
            Self::Array(array) => vec![array],
            Self::Tuple(elements) => elements.iter().flat_map(Shape::leaf_shapes).collect(),
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Array(_) => 1,
            Self::Tuple(elements) => elements.iter().map(Shape::leaf_count).sum(),
        }
    }

    pub fn subshape(&self, index: &ShapeIndex) -> Option<&Shape> {
        index
            .as_slice()
            .iter()
            .try_fold(self, |shape, &i| shape.tuple_shapes().get(i))
    }

    /// Structural equality ignoring layouts.
    pub fn compatible(&self, other: &Shape) -> bool {
        match (self, other) {
            (Self::Array(a), Self::Array(b)) => a.compatible(b),
            (Self::Tuple(a), Self::Tuple(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.compatible(y)),
            _ => false,
        }
    }

    /// True when every array subshape carries a layout.
    pub fn has_layout(&self) -> bool {
        self.leaf_shapes().iter().all(|leaf| leaf.layout.is_some())
    }

    /// Copy of this shape with major-to-minor layouts filled in where missing.
    pub fn with_default_layouts(&self) -> Shape {
        match self {
            Self::Array(array) => {
                let mut array = array.clone();
                if array.layout.is_none() {
                    array.layout = Some(Layout::major_to_minor(array.rank()));
                }
                Self::Array(array)
            }
            Self::Tuple(elements) => Self::Tuple(elements.iter().map(Shape::with_default_layouts).collect()),
        }
    }

    /// Copy of this shape with every layout removed.
    pub fn without_layouts(&self) -> Shape {
        match self {
            Self::Array(array) => Self::Array(ArrayShape {
                layout: None,
                ..array.clone()
            }),
            Self::Tuple(elements) => Self::Tuple(elements.iter().map(Shape::without_layouts).collect()),
        }
    }

    pub fn human_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(array) => write!(f, "{array}"),
            Self::Tuple(elements) => {
                f.write_str("(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<ArrayShape> for Shape {
    fn from(array: ArrayShape) -> Self {
        Self::Array(array)
    }
}

/// Parameter and result shapes of a computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramShape {
    pub parameters: Vec<Shape>,
    pub result: Shape,
}

impl ProgramShape {
    pub fn new(parameters: Vec<Shape>, result: Shape) -> Self {
        Self { parameters, result }
    }
}

impl fmt::Display for ProgramShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, parameter) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{parameter}")?;
        }
        write!(f, ") -> {}", self.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn nested() -> Shape {
        Shape::tuple(vec![
            Shape::array(PrimitiveType::F32, [2, 3]),
            Shape::tuple(vec![Shape::scalar(PrimitiveType::S32), Shape::array(PrimitiveType::U8, [0])]),
        ])
    }

    #[test]
    fn test_human_string() {
        assert_eq!(nested().human_string(), "(f32[2,3], (s32[], u8[0]))");
        assert_eq!(Shape::tuple(vec![]).to_string(), "()");
        let laid_out = Shape::array_with_layout(PrimitiveType::F64, [4, 5], Layout::major_to_minor(2));
        assert_eq!(laid_out.to_string(), "f64[4,5]{1,0}");
    }

    #[test]
    fn test_subshapes_are_preorder() {
        let shape = nested();
        let indices: Vec<String> = shape.subshapes().iter().map(|(i, _)| i.to_string()).collect();
        assert_eq!(indices, vec!["{}", "{0}", "{1}", "{1,0}", "{1,1}"]);
        assert_eq!(shape.leaf_count(), 3);
        assert_eq!(shape.tuple_element_count(), 2);
    }

    #[test]
    fn test_subshape_lookup() {
        let shape = nested();
        let leaf = shape.subshape(&ShapeIndex::new(vec![1, 0])).and_then(Shape::as_array);
        assert_eq!(leaf.map(|a| a.element_type), Some(PrimitiveType::S32));
        assert!(shape.subshape(&ShapeIndex::new(vec![0, 0])).is_none());
        assert!(shape.subshape(&ShapeIndex::new(vec![7])).is_none());
    }

    #[test]
    fn test_compatible_ignores_layout() {
        let shape = nested();
        let with_layouts = shape.with_default_layouts();
        assert!(with_layouts.has_layout());
        assert!(!shape.has_layout());
        assert_ne!(shape, with_layouts);
        assert!(shape.compatible(&with_layouts));
        assert_eq!(with_layouts.without_layouts(), shape);
        assert!(!shape.compatible(&Shape::array(PrimitiveType::F32, [2, 3])));
    }

    #[test]
    fn test_shape_serde() {
        let shape = nested().with_default_layouts();
        let json = serde_json::to_string(&shape).unwrap();
        let back: Shape = serde_json::from_str(&json).unwrap();
        assert_eq!(back, shape);
    }

    #[test]
    fn test_zero_element_array() {
        let shape = Shape::array(PrimitiveType::F32, [3, 0]);
        assert_eq!(shape.element_count(), 0);
        assert_eq!(shape.as_array().map(ArrayShape::byte_size), Some(0));
    }

    fn primitive() -> impl Strategy<Value = PrimitiveType> {
        prop_oneof![
            Just(PrimitiveType::Pred),
            Just(PrimitiveType::S16),
            Just(PrimitiveType::S64),
            Just(PrimitiveType::U32),
            Just(PrimitiveType::Bf16),
            Just(PrimitiveType::F32),
            Just(PrimitiveType::F64),
        ]
    }

    proptest! {
        #[test]
        fn array_byte_size_is_count_times_width(ty in primitive(), dims in prop::collection::vec(0usize..6, 0..4)) {
            let array = ArrayShape::new(ty, dims.clone());
            prop_assert_eq!(array.byte_size(), dims.iter().product::<usize>() * ty.byte_width());
        }

        #[test]
        fn default_layout_is_reverse_iota(rank in 0usize..6) {
            let layout = Layout::major_to_minor(rank);
            prop_assert_eq!(layout.minor_to_major.len(), rank);
            if rank > 0 {
                prop_assert_eq!(layout.minor_to_major[0], rank - 1);
                prop_assert_eq!(layout.minor_to_major[rank - 1], 0);
            }
        }
    }
}
