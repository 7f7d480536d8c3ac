//! Host tensors, element kinds, and shapes.

mod dtype;
mod host_tensor;
mod shape;
mod storage;

pub use dtype::ElemKind;
pub use host_tensor::{Handle, HandleMut, Tensor, TensorData};
pub use shape::{Shape, TensorType};
pub use storage::Element;
