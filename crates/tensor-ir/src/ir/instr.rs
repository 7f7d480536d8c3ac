//! Buffer-explicit instruction set produced by lowering.

use serde::{Deserialize, Serialize};

use crate::graph::{
    BatchedArithmeticMode, BatchedReduceMode, ConvParams, LrnParams, PoolParams, SgdParams,
    StorageRef,
};
use crate::tensor::TensorType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u32);

impl BufferId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where the bytes of a buffer live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    /// Module variable or context-bound placeholder.
    Weight(StorageRef),
    /// Transient value with an explicit alloc/dealloc pair.
    Activation,
    /// Reinterpretation of another buffer's bytes with a different type.
    View { of: BufferId },
    /// Zero-initialised optimizer state owned by the compiled artifact.
    State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buffer {
    pub id: BufferId,
    pub name: String,
    pub ty: TensorType,
    pub kind: BufferKind,
}

impl Buffer {
    pub fn is_activation(&self) -> bool {
        matches!(self.kind, BufferKind::Activation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Access::Read => "in",
            Access::Write => "out",
            Access::ReadWrite => "inout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operand {
    pub buffer: BufferId,
    pub access: Access,
}

impl Operand {
    pub fn read(buffer: BufferId) -> Self {
        Self {
            buffer,
            access: Access::Read,
        }
    }

    pub fn write(buffer: BufferId) -> Self {
        Self {
            buffer,
            access: Access::Write,
        }
    }

    pub fn read_write(buffer: BufferId) -> Self {
        Self {
            buffer,
            access: Access::ReadWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    Tanh,
}

/// Low-level operation. Destinations come first in the operand list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    AllocActivation,
    DeallocActivation,
    TensorView,
    Copy,
    Splat { value: f32 },
    ElementwiseBinary(BinaryOp),
    ElementwiseUnary(UnaryOp),
    ReluGrad,
    Convolution(ConvParams),
    ConvolutionGrad(ConvParams),
    MaxPool(PoolParams),
    MaxPoolGrad(PoolParams),
    FullyConnected,
    FullyConnectedGrad,
    SoftMax,
    SoftMaxGrad,
    LocalResponseNormalization(LrnParams),
    LocalResponseNormalizationGrad(LrnParams),
    BatchedMatMul,
    BatchedReduce(BatchedReduceMode),
    BatchedArithmetic(BatchedArithmeticMode),
    Transpose { perm: Vec<usize> },
    /// Operands: weight (inout), gradient (in), momentum state (inout).
    Sgd(SgdParams),
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::AllocActivation => "alloc_activation",
            Op::DeallocActivation => "dealloc_activation",
            Op::TensorView => "tensor_view",
            Op::Copy => "copy",
            Op::Splat { .. } => "splat",
            Op::ElementwiseBinary(BinaryOp::Add) => "element_add",
            Op::ElementwiseBinary(BinaryOp::Sub) => "element_sub",
            Op::ElementwiseBinary(BinaryOp::Mul) => "element_mul",
            Op::ElementwiseUnary(UnaryOp::Relu) => "relu",
            Op::ElementwiseUnary(UnaryOp::Sigmoid) => "sigmoid",
            Op::ElementwiseUnary(UnaryOp::Tanh) => "tanh",
            Op::ReluGrad => "relu_grad",
            Op::Convolution(_) => "convolution",
            Op::ConvolutionGrad(_) => "convolution_grad",
            Op::MaxPool(_) => "max_pool",
            Op::MaxPoolGrad(_) => "max_pool_grad",
            Op::FullyConnected => "fully_connected",
            Op::FullyConnectedGrad => "fully_connected_grad",
            Op::SoftMax => "softmax",
            Op::SoftMaxGrad => "softmax_grad",
            Op::LocalResponseNormalization(_) => "local_response_normalization",
            Op::LocalResponseNormalizationGrad(_) => "local_response_normalization_grad",
            Op::BatchedMatMul => "batched_matmul",
            Op::BatchedReduce(_) => "batched_reduce_add",
            Op::BatchedArithmetic(BatchedArithmeticMode::Add) => "batched_add",
            Op::BatchedArithmetic(BatchedArithmeticMode::Mul) => "batched_mul",
            Op::Transpose { .. } => "transpose",
            Op::Sgd(_) => "sgd",
        }
    }

    /// Expected access mode of each operand position.
    pub fn signature(&self) -> &'static [Access] {
        use Access::{Read as R, ReadWrite as RW, Write as W};
        match self {
            Op::AllocActivation | Op::DeallocActivation | Op::Splat { .. } => &[W],
            Op::TensorView
            | Op::Copy
            | Op::ElementwiseUnary(_)
            | Op::MaxPool(_)
            | Op::LocalResponseNormalization(_)
            | Op::BatchedReduce(_)
            | Op::Transpose { .. } => &[W, R],
            Op::ElementwiseBinary(_)
            | Op::ReluGrad
            | Op::MaxPoolGrad(_)
            | Op::SoftMax
            | Op::SoftMaxGrad
            | Op::LocalResponseNormalizationGrad(_)
            | Op::BatchedMatMul
            | Op::BatchedArithmetic(_) => &[W, R, R],
            Op::Convolution(_) | Op::FullyConnected => &[W, R, R, R],
            Op::ConvolutionGrad(_) | Op::FullyConnectedGrad => &[W, W, W, R, R, R],
            Op::Sgd(_) => &[RW, R, RW],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Op,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(op: Op, operands: Vec<Operand>) -> Self {
        Self { op, operands }
    }

    pub fn is_lifetime_marker(&self) -> bool {
        matches!(self.op, Op::AllocActivation | Op::DeallocActivation)
    }

    pub fn buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.operands.iter().map(|operand| operand.buffer)
    }
}
