//! Low-level IR: explicit buffers, instructions, and activation planning.

pub mod bufferize;
pub mod instr;
pub mod lower;
pub mod text;

pub use bufferize::{BufferPlan, BufferSlot, BufferizeError, LiveRange};
pub use instr::{Access, BinaryOp, Buffer, BufferId, BufferKind, Instruction, Op, Operand, UnaryOp};
pub use lower::{lower_function, LowerOptions, LoweredFunction};
pub use text::{ArtifactIoError, ArtifactSerdeError};
