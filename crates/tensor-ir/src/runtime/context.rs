use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::graph::{Module, PlaceholderId};
use crate::tensor::Tensor;

/// Placeholder bindings for one or more runs.
///
/// Inputs are bound by the caller; outputs written by Save nodes and SGD
/// updates of trainable placeholders land in the bound tensors.
#[derive(Debug, Clone, Default)]
pub struct Context {
    bindings: BTreeMap<PlaceholderId, Tensor>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `tensor` to `placeholder`, returning the previous binding.
    ///
    /// Types are checked against the placeholder declaration when a run starts.
    pub fn bind(&mut self, placeholder: PlaceholderId, tensor: Tensor) -> Option<Tensor> {
        self.bindings.insert(placeholder, tensor)
    }

    /// Binds a zero tensor of the placeholder's declared type.
    pub fn allocate(&mut self, module: &Module, placeholder: PlaceholderId) -> Result<&mut Tensor> {
        let ty = module.placeholder(placeholder)?.ty().clone();
        let tensor = Tensor::zeros(ty);
        match self.bindings.entry(placeholder) {
            Entry::Occupied(mut entry) => {
                entry.insert(tensor);
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => Ok(entry.insert(tensor)),
        }
    }

    pub fn unbind(&mut self, placeholder: PlaceholderId) -> Option<Tensor> {
        self.bindings.remove(&placeholder)
    }

    pub fn get(&self, placeholder: PlaceholderId) -> Option<&Tensor> {
        self.bindings.get(&placeholder)
    }

    pub fn get_mut(&mut self, placeholder: PlaceholderId) -> Option<&mut Tensor> {
        self.bindings.get_mut(&placeholder)
    }

    pub fn contains(&self, placeholder: PlaceholderId) -> bool {
        self.bindings.contains_key(&placeholder)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PlaceholderId, &Tensor)> + '_ {
        self.bindings.iter().map(|(id, tensor)| (*id, tensor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{ElemKind, TensorData};

    #[test]
    fn bindings_can_be_replaced_and_removed() {
        let mut module = Module::with_seed(0);
        let x = module.create_placeholder(ElemKind::Float, &[2], "x", false);
        let mut ctx = Context::new();

        let first = Tensor::from_f32(&[2], vec![1.0, 2.0]).expect("valid tensor");
        assert!(ctx.bind(x, first).is_none());
        let zeroed = ctx.allocate(&module, x).expect("declared placeholder");
        assert_eq!(zeroed.data(), &TensorData::Float(vec![0.0, 0.0]));
        assert_eq!(ctx.len(), 1);

        let removed = ctx.unbind(x).expect("was bound");
        assert_eq!(removed.data(), &TensorData::Float(vec![0.0, 0.0]));
        assert!(!ctx.contains(x));
        assert!(ctx.unbind(x).is_none());
        assert!(ctx.is_empty());
    }
}
