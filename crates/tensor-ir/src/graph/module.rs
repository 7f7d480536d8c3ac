//! Module: owner of storage declarations and of every function built over them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::builder::FunctionBuilder;
use super::function::Function;
use super::storage::{
    unique_name, Placeholder, PlaceholderId, StorageRef, StorageTable, Variable, VariableId,
    Visibility,
};
use crate::env;
use crate::error::{Error, Result};
use crate::tensor::{ElemKind, Tensor, TensorType};

/// Handle to a function owned by a [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Container of variables, placeholders, and functions.
///
/// Functions reference storage by handle, so cloning a function or deriving a
/// gradient function shares the same variables.
#[derive(Debug)]
pub struct Module {
    storage: StorageTable,
    functions: BTreeMap<FunctionId, Function>,
    function_names: HashSet<String>,
    next_function: u32,
    rng: StdRng,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    /// Empty module whose weight initialisation is seeded from `TENSOR_IR_SEED`.
    pub fn new() -> Self {
        Self::with_seed(env::init_seed())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            storage: StorageTable::new(),
            functions: BTreeMap::new(),
            function_names: HashSet::new(),
            next_function: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn create_function(&mut self, name: &str) -> FunctionId {
        self.insert_function(Function::new(name))
    }

    /// Trainable, zero-initialised variable.
    pub fn create_variable(
        &mut self,
        elem: ElemKind,
        dims: &[usize],
        name: &str,
        visibility: Visibility,
    ) -> VariableId {
        self.create_variable_with(elem, dims, name, visibility, true)
    }

    pub fn create_variable_with(
        &mut self,
        elem: ElemKind,
        dims: &[usize],
        name: &str,
        visibility: Visibility,
        trainable: bool,
    ) -> VariableId {
        let payload = Tensor::zeros(TensorType::new(elem, dims));
        self.storage
            .add_variable(name, payload, visibility, trainable)
    }

    /// Variable initialised from an existing tensor.
    pub fn create_variable_from(
        &mut self,
        name: &str,
        payload: Tensor,
        visibility: Visibility,
        trainable: bool,
    ) -> VariableId {
        self.storage
            .add_variable(name, payload, visibility, trainable)
    }

    pub fn create_placeholder(
        &mut self,
        elem: ElemKind,
        dims: &[usize],
        name: &str,
        trainable: bool,
    ) -> PlaceholderId {
        self.storage
            .add_placeholder(name, TensorType::new(elem, dims), trainable)
    }

    pub fn storage(&self) -> &StorageTable {
        &self.storage
    }

    pub(crate) fn storage_mut(&mut self) -> &mut StorageTable {
        &mut self.storage
    }

    pub fn variables(&self) -> &[Variable] {
        self.storage.variables()
    }

    pub fn placeholders(&self) -> &[Placeholder] {
        self.storage.placeholders()
    }

    pub fn variable(&self, id: VariableId) -> Result<&Variable> {
        self.storage
            .variable(id)
            .ok_or_else(|| Error::UnknownStorage(StorageRef::from(id).to_string()))
    }

    pub fn variable_mut(&mut self, id: VariableId) -> Result<&mut Variable> {
        self.storage
            .variable_mut(id)
            .ok_or_else(|| Error::UnknownStorage(StorageRef::from(id).to_string()))
    }

    pub fn placeholder(&self, id: PlaceholderId) -> Result<&Placeholder> {
        self.storage
            .placeholder(id)
            .ok_or_else(|| Error::UnknownStorage(StorageRef::from(id).to_string()))
    }

    pub fn function(&self, id: FunctionId) -> Result<&Function> {
        self.functions
            .get(&id)
            .ok_or_else(|| Error::UnknownFunction(id.to_string()))
    }

    /// Builder over the function, with access to this module's storage.
    pub fn function_mut(&mut self, id: FunctionId) -> Result<FunctionBuilder<'_>> {
        let function = self
            .functions
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownFunction(id.to_string()))?;
        Ok(FunctionBuilder::new(
            &mut self.storage,
            &mut self.rng,
            function,
        ))
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .find(|(_, function)| function.name() == name)
            .map(|(id, _)| *id)
    }

    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &Function)> + '_ {
        self.functions.iter().map(|(id, function)| (*id, function))
    }

    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    /// Copies the arena of `id` into a new function. Node indices are preserved
    /// and storage handles are shared with the original.
    pub fn clone_function(&mut self, id: FunctionId, new_name: &str) -> Result<FunctionId> {
        let mut copy = self.function(id)?.clone();
        copy.set_name(new_name.to_string());
        Ok(self.insert_function(copy))
    }

    pub fn verify_function(&self, id: FunctionId) -> Result<()> {
        self.function(id)?.verify(&self.storage)
    }

    /// Uses of `storage` across every function of the module.
    pub fn storage_users(&self, storage: impl Into<StorageRef>) -> usize {
        let storage = storage.into();
        self.functions
            .values()
            .map(|function| function.storage_uses(storage))
            .sum()
    }

    pub fn erase_function(&mut self, id: FunctionId) -> Result<Function> {
        let function = self
            .functions
            .remove(&id)
            .ok_or_else(|| Error::UnknownFunction(id.to_string()))?;
        self.function_names.remove(function.name());
        Ok(function)
    }

    /// Registers `function`, uniquing its name against the other functions.
    pub(crate) fn insert_function(&mut self, mut function: Function) -> FunctionId {
        let name = unique_name(&mut self.function_names, function.name());
        function.set_name(name);
        let id = FunctionId(self.next_function);
        self.next_function += 1;
        self.functions.insert(id, function);
        id
    }
}
