//! Execution: placeholder bindings and the compile/run engine.

mod context;
mod engine;

pub use context::Context;
pub use engine::{CompilationMode, ExecutionEngine};
