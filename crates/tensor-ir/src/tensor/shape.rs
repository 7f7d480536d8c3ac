//! Tensor shapes and the element-kind + shape pair used throughout the IR.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::dtype::ElemKind;

/// Stores the logical dimensions of a tensor.
///
/// Rank-0 shapes are not used by the graph; every value carries at least one axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        Shape { dims: dims.into() }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Row-major strides, in elements.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![0; self.dims.len()];
        let mut acc = 1usize;
        for (i, dim) in self.dims.iter().enumerate().rev() {
            strides[i] = acc;
            acc *= *dim;
        }
        strides
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", dims.join("x"))
    }
}

/// Element kind plus shape; the static type of every graph value and buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub elem: ElemKind,
    pub shape: Shape,
}

impl TensorType {
    pub fn new(elem: ElemKind, dims: &[usize]) -> Self {
        Self {
            elem,
            shape: Shape::new(dims.to_vec()),
        }
    }

    pub fn float(dims: &[usize]) -> Self {
        Self::new(ElemKind::Float, dims)
    }

    pub fn index(dims: &[usize]) -> Self {
        Self::new(ElemKind::Index, dims)
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    /// Total storage size in bytes.
    pub fn byte_len(&self) -> usize {
        self.num_elements() * self.elem.size_in_bytes()
    }

    /// Same element kind with a different shape.
    pub fn with_dims(&self, dims: &[usize]) -> Self {
        Self::new(self.elem, dims)
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{} x {}>", self.elem.as_str(), self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_row_major() {
        let shape = Shape::new(vec![2, 3, 4]);
        assert_eq!(shape.strides(), vec![12, 4, 1]);
        assert_eq!(shape.num_elements(), 24);
    }

    #[test]
    fn display_matches_dump_format() {
        let ty = TensorType::float(&[1, 2, 3]);
        assert_eq!(ty.to_string(), "tensor<float x 1x2x3>");
        assert_eq!(ty.byte_len(), 24);
    }
}
