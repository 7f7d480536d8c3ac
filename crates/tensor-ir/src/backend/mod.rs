//! Boundary between the execution engine and instruction interpreters.

use std::collections::BTreeMap;
use std::fmt;

use crate::graph::{PlaceholderId, StorageRef, StorageTable, VariableId};
use crate::ir::{BufferId, BufferKind, Instruction, LoweredFunction};
use crate::runtime::Context;
use crate::tensor::{Tensor, TensorType};

#[derive(Debug)]
pub enum BackendError {
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Interpreter of lowered instruction streams.
pub trait Backend: Send + Sync {
    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Executes one instruction against the run's memory.
    fn execute_instruction(
        &self,
        instruction: &Instruction,
        memory: &mut ExecutionMemory<'_>,
    ) -> BackendResult<()>;

    /// Executes the whole stream in order.
    fn run_function(
        &self,
        function: &LoweredFunction,
        memory: &mut ExecutionMemory<'_>,
    ) -> BackendResult<()> {
        for instruction in &function.instructions {
            self.execute_instruction(instruction, memory)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Location {
    Variable(VariableId),
    Placeholder(PlaceholderId),
    State(BufferId),
    Slot(usize),
}

/// Buffer storage for one run: module variables, context bindings, the
/// artifact's optimizer state, and the activation slots of the buffer plan.
///
/// Reads return owned copies typed as the requested buffer, so a view reads
/// the bytes of its source under its own shape.
pub struct ExecutionMemory<'a> {
    function: &'a LoweredFunction,
    storage: &'a mut StorageTable,
    context: &'a mut Context,
    state: &'a mut BTreeMap<BufferId, Tensor>,
    slots: Vec<Tensor>,
}

impl<'a> ExecutionMemory<'a> {
    pub fn new(
        function: &'a LoweredFunction,
        storage: &'a mut StorageTable,
        context: &'a mut Context,
        state: &'a mut BTreeMap<BufferId, Tensor>,
    ) -> Self {
        let slots = function
            .plan
            .slots
            .iter()
            .map(|slot| Tensor::zeros(TensorType::new(slot.elem, &[slot.len])))
            .collect();
        Self {
            function,
            storage,
            context,
            state,
            slots,
        }
    }

    pub fn buffer_type(&self, buffer: BufferId) -> BackendResult<&'a TensorType> {
        let function = self.function;
        function
            .buffer(buffer)
            .map(|declared| &declared.ty)
            .ok_or_else(|| BackendError::execution(format!("unknown buffer {}", buffer.0)))
    }

    fn locate(&self, buffer: BufferId) -> BackendResult<Location> {
        let root = self.function.plan.root(buffer);
        let declared = self
            .function
            .buffer(root)
            .ok_or_else(|| BackendError::execution(format!("unknown buffer {}", root.0)))?;
        match declared.kind {
            BufferKind::Weight(StorageRef::Variable(id)) => Ok(Location::Variable(id)),
            BufferKind::Weight(StorageRef::Placeholder(id)) => Ok(Location::Placeholder(id)),
            BufferKind::State => Ok(Location::State(root)),
            BufferKind::Activation => self
                .function
                .plan
                .assignments
                .get(&root)
                .map(|slot| Location::Slot(*slot))
                .ok_or_else(|| {
                    BackendError::execution(format!("activation '{}' has no slot", declared.name))
                }),
            BufferKind::View { .. } => Err(BackendError::execution(format!(
                "view '{}' does not resolve to a storage buffer",
                declared.name
            ))),
        }
    }

    fn tensor(&self, location: Location) -> BackendResult<&Tensor> {
        let found = match location {
            Location::Variable(id) => self.storage.variable(id).map(|var| var.payload()),
            Location::Placeholder(id) => self.context.get(id),
            Location::State(id) => self.state.get(&id),
            Location::Slot(slot) => self.slots.get(slot),
        };
        found.ok_or_else(|| BackendError::execution(format!("{location:?} is not materialised")))
    }

    fn tensor_mut(&mut self, location: Location) -> BackendResult<&mut Tensor> {
        let found = match location {
            Location::Variable(id) => self.storage.variable_mut(id).map(|var| var.payload_mut()),
            Location::Placeholder(id) => self.context.get_mut(id),
            Location::State(id) => self.state.get_mut(&id),
            Location::Slot(slot) => self.slots.get_mut(slot),
        };
        found.ok_or_else(|| BackendError::execution(format!("{location:?} is not materialised")))
    }

    /// Copy of the buffer's contents, typed as the buffer.
    pub fn read(&self, buffer: BufferId) -> BackendResult<Tensor> {
        let ty = self.buffer_type(buffer)?.clone();
        let source = self.tensor(self.locate(buffer)?)?;
        Tensor::from_data(ty, source.data().clone())
            .map_err(|err| BackendError::execution(err.to_string()))
    }

    /// Overwrites the buffer's contents; kind and element count must match.
    pub fn write(&mut self, buffer: BufferId, value: Tensor) -> BackendResult<()> {
        let expected = self.buffer_type(buffer)?;
        if value.ty() != expected {
            return Err(BackendError::execution(format!(
                "writing {} into buffer of type {expected}",
                value.ty()
            )));
        }
        let location = self.locate(buffer)?;
        self.tensor_mut(location)?
            .set_data(value.into_data())
            .map_err(|err| BackendError::execution(err.to_string()))
    }
}
