//! Defines the scalar element trait implemented by host-side tensors.

use std::fmt;

use super::dtype::ElemKind;
use super::host_tensor::TensorData;

/// Scalar types that can back a [`Tensor`](super::Tensor).
///
/// The trait maps a Rust scalar to its [`ElemKind`] and gives typed access to the matching
/// [`TensorData`] variant, so handles can be generic over the element type.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Element kind this scalar represents.
    const KIND: ElemKind;
    /// Borrows the payload when it holds this element type.
    fn slice(data: &TensorData) -> Option<&[Self]>;
    /// Mutably borrows the payload when it holds this element type.
    fn slice_mut(data: &mut TensorData) -> Option<&mut [Self]>;
}

impl Element for f32 {
    const KIND: ElemKind = ElemKind::Float;

    fn slice(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::Float(values) => Some(values),
            TensorData::Index(_) => None,
        }
    }

    fn slice_mut(data: &mut TensorData) -> Option<&mut [Self]> {
        match data {
            TensorData::Float(values) => Some(values),
            TensorData::Index(_) => None,
        }
    }
}

impl Element for i64 {
    const KIND: ElemKind = ElemKind::Index;

    fn slice(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::Index(values) => Some(values),
            TensorData::Float(_) => None,
        }
    }

    fn slice_mut(data: &mut TensorData) -> Option<&mut [Self]> {
        match data {
            TensorData::Index(values) => Some(values),
            TensorData::Float(_) => None,
        }
    }
}
