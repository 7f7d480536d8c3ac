//! Enumerates the scalar element kinds a tensor can hold.

use serde::{Deserialize, Serialize};

/// Logical element kind shared by graph types, host tensors, and lowered buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElemKind {
    /// 32-bit floating point following IEEE-754 semantics.
    Float,
    /// 64-bit signed integer, used for label and index tensors.
    Index,
}

impl ElemKind {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            ElemKind::Float => 4,
            ElemKind::Index => 8,
        }
    }

    /// Short lowercase label used by textual dumps.
    pub fn as_str(self) -> &'static str {
        match self {
            ElemKind::Float => "float",
            ElemKind::Index => "index",
        }
    }
}
