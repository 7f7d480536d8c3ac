//! Graph IR for tensor programs.
//!
//! A [`Module`](graph::Module) owns variables, placeholders, and functions.
//! Functions are built through [`FunctionBuilder`](graph::FunctionBuilder),
//! differentiated into training functions by [`train::differentiate`], lowered
//! into buffer-explicit instruction streams by [`ir::lower_function`], and run
//! by an [`ExecutionEngine`](runtime::ExecutionEngine) on any [`Backend`](backend::Backend).

pub mod backend;
mod env;
pub mod error;
pub mod graph;
pub mod ir;
pub mod runtime;
pub mod tensor;
pub mod train;

pub use error::{Error, Result};
