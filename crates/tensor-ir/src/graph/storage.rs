//! Module-scoped storage declarations: persistent Variables and externally bound Placeholders.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorType};

/// Handle to a [`Variable`] owned by a [`Module`](super::Module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableId(pub u32);

/// Handle to a [`Placeholder`] owned by a [`Module`](super::Module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlaceholderId(pub u32);

/// Non-owning reference from a function (or a lowered buffer) to module storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StorageRef {
    Variable(VariableId),
    Placeholder(PlaceholderId),
}

impl From<VariableId> for StorageRef {
    fn from(id: VariableId) -> Self {
        StorageRef::Variable(id)
    }
}

impl From<PlaceholderId> for StorageRef {
    fn from(id: PlaceholderId) -> Self {
        StorageRef::Placeholder(id)
    }
}

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageRef::Variable(id) => write!(f, "var#{}", id.0),
            StorageRef::Placeholder(id) => write!(f, "placeholder#{}", id.0),
        }
    }
}

/// Whether a variable is visible to callers of the compiled artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    Private,
}

/// Module-owned persistent tensor. Only SGD updates mutate it, and only at execution time.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    visibility: Visibility,
    trainable: bool,
    payload: Tensor,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &TensorType {
        self.payload.ty()
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    pub fn payload(&self) -> &Tensor {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Tensor {
        &mut self.payload
    }
}

/// Named, typed slot without storage of its own; bound to a tensor per execution.
#[derive(Debug, Clone)]
pub struct Placeholder {
    name: String,
    ty: TensorType,
    trainable: bool,
}

impl Placeholder {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &TensorType {
        &self.ty
    }

    /// Whether differentiation emits an update for this placeholder.
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }
}

/// Owns every variable and placeholder of a module and keeps their names unique.
#[derive(Debug, Default)]
pub struct StorageTable {
    variables: Vec<Variable>,
    placeholders: Vec<Placeholder>,
    variable_names: HashSet<String>,
    placeholder_names: HashSet<String>,
}

impl StorageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_variable(
        &mut self,
        name: &str,
        payload: Tensor,
        visibility: Visibility,
        trainable: bool,
    ) -> VariableId {
        let name = unique_name(&mut self.variable_names, name);
        let id = VariableId(self.variables.len() as u32);
        self.variables.push(Variable {
            name,
            visibility,
            trainable,
            payload,
        });
        id
    }

    pub(crate) fn add_placeholder(
        &mut self,
        name: &str,
        ty: TensorType,
        trainable: bool,
    ) -> PlaceholderId {
        let name = unique_name(&mut self.placeholder_names, name);
        let id = PlaceholderId(self.placeholders.len() as u32);
        self.placeholders.push(Placeholder {
            name,
            ty,
            trainable,
        });
        id
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    pub fn variable(&self, id: VariableId) -> Option<&Variable> {
        self.variables.get(id.0 as usize)
    }

    pub fn variable_mut(&mut self, id: VariableId) -> Option<&mut Variable> {
        self.variables.get_mut(id.0 as usize)
    }

    pub fn placeholder(&self, id: PlaceholderId) -> Option<&Placeholder> {
        self.placeholders.get(id.0 as usize)
    }

    pub fn variable_by_name(&self, name: &str) -> Option<VariableId> {
        self.variables
            .iter()
            .position(|var| var.name == name)
            .map(|idx| VariableId(idx as u32))
    }

    pub fn placeholder_by_name(&self, name: &str) -> Option<PlaceholderId> {
        self.placeholders
            .iter()
            .position(|ph| ph.name == name)
            .map(|idx| PlaceholderId(idx as u32))
    }

    pub fn contains(&self, storage: StorageRef) -> bool {
        match storage {
            StorageRef::Variable(id) => self.variable(id).is_some(),
            StorageRef::Placeholder(id) => self.placeholder(id).is_some(),
        }
    }

    /// Declared type of the referenced storage.
    pub fn ty(&self, storage: StorageRef) -> Result<&TensorType> {
        let ty = match storage {
            StorageRef::Variable(id) => self.variable(id).map(Variable::ty),
            StorageRef::Placeholder(id) => self.placeholder(id).map(Placeholder::ty),
        };
        ty.ok_or_else(|| Error::UnknownStorage(storage.to_string()))
    }

    pub fn name(&self, storage: StorageRef) -> Result<&str> {
        let name = match storage {
            StorageRef::Variable(id) => self.variable(id).map(Variable::name),
            StorageRef::Placeholder(id) => self.placeholder(id).map(Placeholder::name),
        };
        name.ok_or_else(|| Error::UnknownStorage(storage.to_string()))
    }

    pub fn is_trainable(&self, storage: StorageRef) -> bool {
        match storage {
            StorageRef::Variable(id) => self.variable(id).is_some_and(Variable::is_trainable),
            StorageRef::Placeholder(id) => {
                self.placeholder(id).is_some_and(Placeholder::is_trainable)
            }
        }
    }
}

/// Returns `name` if unused, otherwise `name__N` for the smallest free `N`.
pub(crate) fn unique_name(taken: &mut HashSet<String>, name: &str) -> String {
    let base = if name.is_empty() { "anon" } else { name };
    if taken.insert(base.to_string()) {
        return base.to_string();
    }
    let mut suffix = 1usize;
    loop {
        let candidate = format!("{base}__{suffix}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        suffix += 1;
    }
}
