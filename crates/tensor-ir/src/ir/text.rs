//! Textual dump and serialized forms of a [`LoweredFunction`].

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use super::instr::{BufferKind, Instruction, Op};
use super::lower::LoweredFunction;

#[derive(Debug, Error)]
pub enum ArtifactSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum ArtifactIoError {
    #[error(transparent)]
    Serialization(#[from] ArtifactSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl LoweredFunction {
    pub fn to_json_string(&self) -> Result<String, ArtifactSerdeError> {
        serde_json::to_string_pretty(self).map_err(ArtifactSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ArtifactSerdeError> {
        serde_json::from_str(src).map_err(ArtifactSerdeError::from)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, ArtifactSerdeError> {
        bincode::serialize(self).map_err(ArtifactSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, ArtifactSerdeError> {
        bincode::deserialize(bytes).map_err(ArtifactSerdeError::from)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ArtifactIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(ArtifactIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ArtifactIoError> {
        let contents = fs::read_to_string(path).map_err(ArtifactIoError::from)?;
        LoweredFunction::from_json_str(&contents).map_err(ArtifactIoError::from)
    }
}

impl fmt::Display for LoweredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "function @{} {{", self.name)?;
        writeln!(f, "  declare {{")?;
        for buffer in &self.buffers {
            write!(f, "    %{} = ", buffer.id.0)?;
            match buffer.kind {
                BufferKind::Weight(storage) => write!(f, "weight {storage}")?,
                BufferKind::Activation => write!(f, "activation")?,
                BufferKind::View { of } => write!(f, "view %{}", of.0)?,
                BufferKind::State => write!(f, "state")?,
            }
            write!(f, " \"{}\" : {}", buffer.name, buffer.ty)?;
            if buffer.is_activation() {
                if let Some(slot) = self.plan.slot_for(buffer.id) {
                    write!(f, " slot {} @ {}", slot.id, slot.byte_offset)?;
                }
            }
            writeln!(f)?;
        }
        writeln!(f, "  }}")?;
        writeln!(f, "  code {{")?;
        for (pos, inst) in self.instructions.iter().enumerate() {
            writeln!(f, "    {pos}: {}", DisplayInstruction(inst))?;
        }
        writeln!(f, "  }}")?;
        writeln!(f, "}}")
    }
}

struct DisplayInstruction<'a>(&'a Instruction);

impl fmt::Display for DisplayInstruction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inst = self.0;
        write!(f, "{}", inst.op.name())?;
        for (idx, operand) in inst.operands.iter().enumerate() {
            let sep = if idx == 0 { " " } else { ", " };
            write!(f, "{sep}@{} %{}", operand.access.as_str(), operand.buffer.0)?;
        }
        match &inst.op {
            Op::Splat { value } => write!(f, " {{value: {value}}}"),
            Op::Transpose { perm } => write!(f, " {{perm: {perm:?}}}"),
            Op::Convolution(p) | Op::ConvolutionGrad(p) => write!(
                f,
                " {{depth: {}, kernel: {}, stride: {}, pad: {}}}",
                p.depth, p.kernel, p.stride, p.pad
            ),
            Op::MaxPool(p) | Op::MaxPoolGrad(p) => write!(
                f,
                " {{kernel: {}, stride: {}, pad: {}}}",
                p.kernel, p.stride, p.pad
            ),
            Op::LocalResponseNormalization(p) | Op::LocalResponseNormalizationGrad(p) => write!(
                f,
                " {{half_window: {}, alpha: {}, beta: {}, k: {}}}",
                p.half_window, p.alpha, p.beta, p.k
            ),
            Op::Sgd(p) => write!(
                f,
                " {{lr: {}, momentum: {}, l1: {}, l2: {}, batch: {}}}",
                p.learning_rate, p.momentum, p.l1_decay, p.l2_decay, p.batch_size
            ),
            _ => Ok(()),
        }
    }
}
