//! Error taxonomy shared by graph construction, the compilation passes, and execution.

use thiserror::Error;

use crate::backend::BackendError;
use crate::tensor::{ElemKind, TensorType};

/// Failure raised anywhere in the build → verify → differentiate → lower → run pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Operand types violate an operator's shape rule; raised at the factory call.
    #[error("shape mismatch in {op}: {detail}")]
    ShapeMismatch { op: String, detail: String },
    #[error("element kind mismatch: expected {expected:?}, found {found:?}")]
    ElemKindMismatch { expected: ElemKind, found: ElemKind },
    /// Structural problem found after construction (dangling edge, shape drift, dead node, ...).
    #[error("verification of function '{function}' failed at node '{node}': {reason}")]
    Verification {
        function: String,
        node: String,
        reason: String,
    },
    #[error("cannot differentiate function '{function}': {reason}")]
    Differentiation { function: String, reason: String },
    /// Missing lowering rule or a violated buffer-lifetime contract.
    #[error("lowering of function '{function}' failed: {reason}")]
    Lowering { function: String, reason: String },
    #[error("placeholder '{name}' is not bound in the context")]
    UnboundPlaceholder { name: String },
    #[error("placeholder '{name}' is bound to {found}, expected {expected}")]
    BindingMismatch {
        name: String,
        expected: TensorType,
        found: TensorType,
    },
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown storage {0}")]
    UnknownStorage(String),
    #[error("training compilation requires a training configuration")]
    MissingTrainingConfig,
    #[error("no compiled artifact named '{0}'")]
    NotCompiled(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
