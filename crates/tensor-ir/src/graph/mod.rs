//! High-level graph IR: modules, functions, nodes, and their construction API.

pub mod builder;
pub mod function;
pub mod infer;
pub mod module;
pub mod node;
pub mod storage;
pub mod verify;

pub use builder::FunctionBuilder;
pub use function::Function;
pub use module::{FunctionId, Module};
pub use node::{
    BatchedArithmeticMode, BatchedReduceMode, ConvParams, LrnParams, Node, NodeId, NodeKind,
    NodeValue, PoolParams, SgdParams, Value,
};
pub use storage::{
    Placeholder, PlaceholderId, StorageRef, StorageTable, Variable, VariableId, Visibility,
};
