//! Host-backed tensor and typed, strided element handles.

use rand::Rng;

use super::dtype::ElemKind;
use super::shape::{Shape, TensorType};
use super::storage::Element;
use crate::error::{Error, Result};

/// Typed payload of a [`Tensor`].
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(Vec<f32>),
    Index(Vec<i64>),
}

impl TensorData {
    /// Zero-filled payload for the given type.
    pub fn zeros(ty: &TensorType) -> Self {
        let len = ty.num_elements();
        match ty.elem {
            ElemKind::Float => TensorData::Float(vec![0.0; len]),
            ElemKind::Index => TensorData::Index(vec![0; len]),
        }
    }

    pub fn elem_kind(&self) -> ElemKind {
        match self {
            TensorData::Float(_) => ElemKind::Float,
            TensorData::Index(_) => ElemKind::Index,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Float(values) => values.len(),
            TensorData::Index(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dense, row-major host tensor owned by a Variable, a Context binding, or the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    ty: TensorType,
    data: TensorData,
}

impl Tensor {
    /// Returns a zero-initialized tensor of the requested type.
    pub fn zeros(ty: TensorType) -> Self {
        let data = TensorData::zeros(&ty);
        Tensor { ty, data }
    }

    /// Constructs a float tensor from raw values, validating the length against the shape.
    pub fn from_f32(dims: &[usize], values: Vec<f32>) -> Result<Self> {
        Self::from_data(TensorType::float(dims), TensorData::Float(values))
    }

    /// Constructs an index tensor, ensuring the payload matches the expected element count.
    pub fn from_i64(dims: &[usize], values: Vec<i64>) -> Result<Self> {
        Self::from_data(TensorType::index(dims), TensorData::Index(values))
    }

    /// Pairs a type with a payload, rejecting kind or length disagreements.
    pub fn from_data(ty: TensorType, data: TensorData) -> Result<Self> {
        if data.elem_kind() != ty.elem {
            return Err(Error::ElemKindMismatch {
                expected: ty.elem,
                found: data.elem_kind(),
            });
        }
        if data.len() != ty.num_elements() {
            return Err(Error::ShapeMismatch {
                op: "tensor".to_string(),
                detail: format!(
                    "payload has {} elements but {} requires {}",
                    data.len(),
                    ty,
                    ty.num_elements()
                ),
            });
        }
        Ok(Tensor { ty, data })
    }

    /// Float tensor filled with samples from `U(-sqrt(3 / fan_in), sqrt(3 / fan_in))`.
    pub fn xavier(dims: &[usize], fan_in: usize, rng: &mut impl Rng) -> Self {
        let ty = TensorType::float(dims);
        let scale = (3.0 / fan_in.max(1) as f32).sqrt();
        let values = (0..ty.num_elements())
            .map(|_| rng.gen_range(-scale..=scale))
            .collect();
        Tensor {
            ty,
            data: TensorData::Float(values),
        }
    }

    pub fn ty(&self) -> &TensorType {
        &self.ty
    }

    pub fn dims(&self) -> &[usize] {
        self.ty.dims()
    }

    pub fn elem_kind(&self) -> ElemKind {
        self.ty.elem
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    /// Replaces the payload, keeping the declared type.
    pub fn set_data(&mut self, data: TensorData) -> Result<()> {
        let checked = Tensor::from_data(self.ty.clone(), data)?;
        self.data = checked.data;
        Ok(())
    }

    /// Read-only typed view addressed by multi-dimensional coordinates.
    pub fn handle<T: Element>(&self) -> Result<Handle<'_, T>> {
        let data = T::slice(&self.data).ok_or(Error::ElemKindMismatch {
            expected: T::KIND,
            found: self.ty.elem,
        })?;
        Ok(Handle {
            shape: &self.ty.shape,
            strides: self.ty.shape.strides(),
            data,
        })
    }

    /// Mutable typed view addressed by multi-dimensional coordinates.
    pub fn handle_mut<T: Element>(&mut self) -> Result<HandleMut<'_, T>> {
        let found = self.ty.elem;
        let strides = self.ty.shape.strides();
        let data = T::slice_mut(&mut self.data).ok_or(Error::ElemKindMismatch {
            expected: T::KIND,
            found,
        })?;
        Ok(HandleMut {
            shape: &self.ty.shape,
            strides,
            data,
        })
    }

    /// Bitwise equality of payloads, treating `NaN` patterns as distinct values.
    pub fn bitwise_eq(&self, other: &Tensor) -> bool {
        if self.ty != other.ty {
            return false;
        }
        match (&self.data, &other.data) {
            (TensorData::Float(a), TensorData::Float(b)) => a
                .iter()
                .zip(b.iter())
                .all(|(x, y)| x.to_bits() == y.to_bits()),
            (TensorData::Index(a), TensorData::Index(b)) => a == b,
            _ => false,
        }
    }
}

fn flat_index(shape: &Shape, strides: &[usize], coords: &[usize]) -> Option<usize> {
    if coords.len() != shape.rank() {
        return None;
    }
    let mut offset = 0usize;
    for ((&coord, &dim), &stride) in coords.iter().zip(shape.dims()).zip(strides) {
        if coord >= dim {
            return None;
        }
        offset += coord * stride;
    }
    Some(offset)
}

/// Immutable strided accessor over a tensor payload.
#[derive(Debug)]
pub struct Handle<'a, T: Element> {
    shape: &'a Shape,
    strides: Vec<usize>,
    data: &'a [T],
}

impl<'a, T: Element> Handle<'a, T> {
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn raw(&self) -> &'a [T] {
        self.data
    }

    /// Returns the element at `coords`, or `None` when any coordinate is out of range.
    pub fn get(&self, coords: &[usize]) -> Option<T> {
        flat_index(self.shape, &self.strides, coords).map(|idx| self.data[idx])
    }

    /// Returns the element at `coords`.
    ///
    /// Panics when the coordinates do not address an element, like slice indexing.
    pub fn at(&self, coords: &[usize]) -> T {
        match self.get(coords) {
            Some(value) => value,
            None => panic!(
                "coordinates {coords:?} out of range for shape {:?}",
                self.shape.dims()
            ),
        }
    }
}

/// Mutable strided accessor over a tensor payload.
#[derive(Debug)]
pub struct HandleMut<'a, T: Element> {
    shape: &'a Shape,
    strides: Vec<usize>,
    data: &'a mut [T],
}

impl<'a, T: Element> HandleMut<'a, T> {
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn raw(&self) -> &[T] {
        &*self.data
    }

    pub fn raw_mut(&mut self) -> &mut [T] {
        &mut *self.data
    }

    pub fn get(&self, coords: &[usize]) -> Option<T> {
        flat_index(self.shape, &self.strides, coords).map(|idx| self.data[idx])
    }

    /// Returns the element at `coords`; panics when out of range.
    pub fn at(&self, coords: &[usize]) -> T {
        match self.get(coords) {
            Some(value) => value,
            None => panic!(
                "coordinates {coords:?} out of range for shape {:?}",
                self.shape.dims()
            ),
        }
    }

    /// Writes `value` at `coords`; panics when out of range.
    pub fn set(&mut self, coords: &[usize], value: T) {
        match flat_index(self.shape, &self.strides, coords) {
            Some(idx) => self.data[idx] = value,
            None => panic!(
                "coordinates {coords:?} out of range for shape {:?}",
                self.shape.dims()
            ),
        }
    }

    /// Fills every element with `value`.
    pub fn clear(&mut self, value: T) {
        self.data.iter_mut().for_each(|slot| *slot = value);
    }

    /// Copies `values` into the payload in row-major order.
    pub fn assign(&mut self, values: &[T]) -> Result<()> {
        if values.len() != self.data.len() {
            return Err(Error::ShapeMismatch {
                op: "assign".to_string(),
                detail: format!(
                    "{} values for a tensor of {} elements",
                    values.len(),
                    self.data.len()
                ),
            });
        }
        self.data.copy_from_slice(values);
        Ok(())
    }
}
