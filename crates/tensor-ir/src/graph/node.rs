//! Graph nodes: the closed operator variant, operand references, and use-lists.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::storage::{PlaceholderId, StorageRef, VariableId};
use crate::tensor::TensorType;

/// Stable index of a node inside its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One result of a (possibly multi-result) node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeValue {
    pub node: NodeId,
    pub result: u32,
}

impl NodeValue {
    pub fn new(node: NodeId, result: u32) -> Self {
        Self { node, result }
    }
}

impl From<NodeId> for NodeValue {
    fn from(node: NodeId) -> Self {
        NodeValue::new(node, 0)
    }
}

/// Operand of a node: either another node's result or a read of module storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Node(NodeValue),
    Storage(StorageRef),
}

impl Value {
    pub fn as_node(self) -> Option<NodeValue> {
        match self {
            Value::Node(value) => Some(value),
            Value::Storage(_) => None,
        }
    }

    pub fn as_storage(self) -> Option<StorageRef> {
        match self {
            Value::Storage(storage) => Some(storage),
            Value::Node(_) => None,
        }
    }
}

impl From<NodeId> for Value {
    fn from(node: NodeId) -> Self {
        Value::Node(node.into())
    }
}

impl From<NodeValue> for Value {
    fn from(value: NodeValue) -> Self {
        Value::Node(value)
    }
}

impl From<StorageRef> for Value {
    fn from(storage: StorageRef) -> Self {
        Value::Storage(storage)
    }
}

impl From<VariableId> for Value {
    fn from(id: VariableId) -> Self {
        Value::Storage(StorageRef::Variable(id))
    }
}

impl From<PlaceholderId> for Value {
    fn from(id: PlaceholderId) -> Self {
        Value::Storage(StorageRef::Placeholder(id))
    }
}

/// Square-window convolution parameters (NHWC input, `[depth, k, k, C]` filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvParams {
    pub depth: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
}

/// Square-window pooling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolParams {
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
}

/// Cross-channel local response normalization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrnParams {
    pub half_window: usize,
    pub alpha: f32,
    pub beta: f32,
    pub k: f32,
}

impl Default for LrnParams {
    fn default() -> Self {
        Self {
            half_window: 2,
            alpha: 1e-4,
            beta: 0.75,
            k: 2.0,
        }
    }
}

/// Optimizer coefficients baked into an SGD node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdParams {
    pub learning_rate: f32,
    pub momentum: f32,
    pub l1_decay: f32,
    pub l2_decay: f32,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchedReduceMode {
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchedArithmeticMode {
    Add,
    Mul,
}

/// Closed set of operator kinds. Operand order for each kind is fixed:
///
/// | kind | operands | results |
/// |------|----------|---------|
/// | `Add`, `Sub`, `Mul` | lhs, rhs | out |
/// | `Relu`, `Sigmoid`, `Tanh` | input | out |
/// | `Splat` | - | out |
/// | `Reshape`, `Transpose` | input | out |
/// | `Conv` | input, filter, bias | out |
/// | `MaxPool`, `LocalResponseNormalization` | input | out |
/// | `FullyConnected` | input, weights, bias | out |
/// | `SoftMax` | input, selected | out |
/// | `Regression` | input, expected | out |
/// | `BatchedMatMul` | lhs, rhs | out |
/// | `BatchedReduce` | batch | out |
/// | `BatchedArithmetic` | batch, slice | out |
/// | `Save` | value | - |
/// | `Sgd` | gradient, weight | - |
/// | `ReluGrad` | output, output_grad | input_grad |
/// | `ConvGrad` | input, filter, output_grad | input_grad, filter_grad, bias_grad |
/// | `MaxPoolGrad`, `LocalResponseNormalizationGrad` | input, output_grad | input_grad |
/// | `FullyConnectedGrad` | input, weights, output_grad | input_grad, weights_grad, bias_grad |
/// | `SoftMaxGrad` | output, selected | input_grad |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Add,
    Sub,
    Mul,
    Relu,
    Sigmoid,
    Tanh,
    Splat { value: f32, ty: TensorType },
    Reshape { dims: Vec<usize> },
    Transpose { perm: Vec<usize> },
    Conv(ConvParams),
    MaxPool(PoolParams),
    FullyConnected,
    SoftMax,
    LocalResponseNormalization(LrnParams),
    Regression,
    BatchedMatMul,
    BatchedReduce(BatchedReduceMode),
    BatchedArithmetic(BatchedArithmeticMode),
    Save { destination: StorageRef },
    Sgd(SgdParams),
    ReluGrad,
    ConvGrad(ConvParams),
    MaxPoolGrad(PoolParams),
    FullyConnectedGrad,
    SoftMaxGrad,
    LocalResponseNormalizationGrad(LrnParams),
}

impl NodeKind {
    /// Stable operator label used by dumps and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Add => "Add",
            NodeKind::Sub => "Sub",
            NodeKind::Mul => "Mul",
            NodeKind::Relu => "Relu",
            NodeKind::Sigmoid => "Sigmoid",
            NodeKind::Tanh => "Tanh",
            NodeKind::Splat { .. } => "Splat",
            NodeKind::Reshape { .. } => "Reshape",
            NodeKind::Transpose { .. } => "Transpose",
            NodeKind::Conv(_) => "Conv",
            NodeKind::MaxPool(_) => "MaxPool",
            NodeKind::FullyConnected => "FullyConnected",
            NodeKind::SoftMax => "SoftMax",
            NodeKind::LocalResponseNormalization(_) => "LocalResponseNormalization",
            NodeKind::Regression => "Regression",
            NodeKind::BatchedMatMul => "BatchedMatMul",
            NodeKind::BatchedReduce(_) => "BatchedReduce",
            NodeKind::BatchedArithmetic(_) => "BatchedArithmetic",
            NodeKind::Save { .. } => "Save",
            NodeKind::Sgd(_) => "Sgd",
            NodeKind::ReluGrad => "ReluGrad",
            NodeKind::ConvGrad(_) => "ConvGrad",
            NodeKind::MaxPoolGrad(_) => "MaxPoolGrad",
            NodeKind::FullyConnectedGrad => "FullyConnectedGrad",
            NodeKind::SoftMaxGrad => "SoftMaxGrad",
            NodeKind::LocalResponseNormalizationGrad(_) => "LocalResponseNormalizationGrad",
        }
    }

    /// Sinks produce no results and are kept alive without consumers.
    pub fn is_sink(&self) -> bool {
        matches!(self, NodeKind::Save { .. } | NodeKind::Sgd(_))
    }

    /// Loss terminals derive their input gradient from a label operand.
    pub fn is_loss(&self) -> bool {
        matches!(self, NodeKind::SoftMax | NodeKind::Regression)
    }

    /// Number of operands the kind expects.
    pub fn arity(&self) -> usize {
        match self {
            NodeKind::Splat { .. } => 0,
            NodeKind::Relu
            | NodeKind::Sigmoid
            | NodeKind::Tanh
            | NodeKind::Reshape { .. }
            | NodeKind::Transpose { .. }
            | NodeKind::MaxPool(_)
            | NodeKind::LocalResponseNormalization(_)
            | NodeKind::BatchedReduce(_)
            | NodeKind::Save { .. } => 1,
            NodeKind::Add
            | NodeKind::Sub
            | NodeKind::Mul
            | NodeKind::SoftMax
            | NodeKind::Regression
            | NodeKind::BatchedMatMul
            | NodeKind::BatchedArithmetic(_)
            | NodeKind::Sgd(_)
            | NodeKind::ReluGrad
            | NodeKind::MaxPoolGrad(_)
            | NodeKind::SoftMaxGrad
            | NodeKind::LocalResponseNormalizationGrad(_) => 2,
            NodeKind::Conv(_)
            | NodeKind::FullyConnected
            | NodeKind::ConvGrad(_)
            | NodeKind::FullyConnectedGrad => 3,
        }
    }
}

/// A computation unit inside a [`Function`](super::Function).
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) inputs: Vec<Value>,
    pub(crate) results: Vec<TensorType>,
    pub(crate) users: Vec<NodeId>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[Value] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> Option<Value> {
        self.inputs.get(index).copied()
    }

    pub fn results(&self) -> &[TensorType] {
        &self.results
    }

    /// Type of the first result; `None` for sinks.
    pub fn ty(&self) -> Option<&TensorType> {
        self.results.first()
    }

    /// Consumers of this node, one entry per operand use.
    pub fn users(&self) -> &[NodeId] {
        &self.users
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.result == 0 {
            write!(f, "%{}", self.node.0)
        } else {
            write!(f, "%{}#{}", self.node.0, self.result)
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Node(value) => write!(f, "{value}"),
            Value::Storage(storage) => write!(f, "{storage}"),
        }
    }
}
