//! Lowering of a verified graph function into a buffer-explicit instruction stream.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bufferize::{compute_live_ranges, plan_buffers, BufferPlan, BufferizeOptions};
use super::instr::{
    Access, BinaryOp, Buffer, BufferId, BufferKind, Instruction, Op, Operand, UnaryOp,
};
use crate::env;
use crate::error::{Error, Result};
use crate::graph::{
    Function, FunctionId, Module, NodeId, NodeKind, NodeValue, StorageRef, StorageTable, Value,
};
use crate::tensor::TensorType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowerOptions {
    /// Let activations with disjoint live ranges share arena slots.
    pub reuse_buffers: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            reuse_buffers: env::reuse_buffers(),
        }
    }
}

/// Instruction stream plus its buffer declarations and activation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoweredFunction {
    pub name: String,
    pub buffers: Vec<Buffer>,
    pub instructions: Vec<Instruction>,
    pub plan: BufferPlan,
}

impl LoweredFunction {
    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(id.index())
    }

    /// Storage slots the stream reads or writes, with their buffers.
    pub fn weights(&self) -> impl Iterator<Item = (BufferId, StorageRef)> + '_ {
        self.buffers.iter().filter_map(|buffer| match buffer.kind {
            BufferKind::Weight(storage) => Some((buffer.id, storage)),
            _ => None,
        })
    }

    pub fn state_buffers(&self) -> impl Iterator<Item = &Buffer> + '_ {
        self.buffers
            .iter()
            .filter(|buffer| matches!(buffer.kind, BufferKind::State))
    }

    pub fn count_ops(&self, predicate: impl Fn(&Op) -> bool) -> usize {
        self.instructions
            .iter()
            .filter(|inst| predicate(&inst.op))
            .count()
    }

    /// Checks operand signatures, activation lifetimes, and the buffer plan.
    pub fn verify(&self) -> Result<()> {
        let fail = |reason: String| Error::Lowering {
            function: self.name.clone(),
            reason,
        };

        for (idx, buffer) in self.buffers.iter().enumerate() {
            if buffer.id.index() != idx {
                return Err(fail(format!("buffer {} is declared at index {idx}", buffer.id.0)));
            }
        }

        for (pos, inst) in self.instructions.iter().enumerate() {
            let signature = inst.op.signature();
            if inst.operands.len() != signature.len() {
                return Err(fail(format!(
                    "instruction {pos} ({}) has {} operands, expected {}",
                    inst.op.name(),
                    inst.operands.len(),
                    signature.len()
                )));
            }
            for (operand, expected) in inst.operands.iter().zip(signature) {
                if operand.access != *expected {
                    return Err(fail(format!(
                        "instruction {pos} ({}) accesses buffer {} as {:?}, expected {:?}",
                        inst.op.name(),
                        operand.buffer.0,
                        operand.access,
                        expected
                    )));
                }
                if self.buffer(operand.buffer).is_none() {
                    return Err(fail(format!(
                        "instruction {pos} references undeclared buffer {}",
                        operand.buffer.0
                    )));
                }
            }
        }

        let ranges = compute_live_ranges(&self.buffers, &self.instructions)
            .map_err(|err| fail(err.to_string()))?;
        if ranges != self.plan.live_ranges {
            return Err(fail("buffer plan is stale for this instruction stream".to_string()));
        }
        for buffer in self.buffers.iter().filter(|buffer| buffer.is_activation()) {
            if !ranges.contains_key(&buffer.id) {
                return Err(fail(format!("activation '{}' is never allocated", buffer.name)));
            }
        }

        for (pos, inst) in self.instructions.iter().enumerate() {
            if inst.is_lifetime_marker() {
                continue;
            }
            for operand in &inst.operands {
                let root = self.plan.root(operand.buffer);
                let Some(range) = ranges.get(&root) else {
                    continue;
                };
                if !range.covers(pos) {
                    return Err(fail(format!(
                        "instruction {pos} ({}) accesses '{}' outside its live range [{}, {}]",
                        inst.op.name(),
                        self.buffers[operand.buffer.index()].name,
                        range.start,
                        range.end
                    )));
                }
            }
        }

        self.plan.verify().map_err(|err| fail(err.to_string()))
    }
}

/// Lowers function `id` of `module`. The function is verified first.
pub fn lower_function(
    module: &Module,
    id: FunctionId,
    options: &LowerOptions,
) -> Result<LoweredFunction> {
    let function = module.function(id)?;
    function.verify(module.storage())?;

    let mut lowering = Lowering::new(function, module.storage());
    for node_id in function.node_ids() {
        lowering.lower_node(node_id)?;
    }
    let Lowering {
        buffers,
        body,
        view_roots,
        ..
    } = lowering;
    let instructions = place_lifetimes(&buffers, &view_roots, body);
    let plan = plan_buffers(
        &buffers,
        &instructions,
        &BufferizeOptions {
            reuse_slots: options.reuse_buffers,
        },
    )
    .map_err(|err| Error::Lowering {
        function: function.name().to_string(),
        reason: err.to_string(),
    })?;

    let lowered = LoweredFunction {
        name: function.name().to_string(),
        buffers,
        instructions,
        plan,
    };
    lowered.verify()?;
    debug!(
        function = %lowered.name,
        instructions = lowered.instructions.len(),
        buffers = lowered.buffers.len(),
        slots = lowered.plan.slots.len(),
        arena_bytes = lowered.plan.total_bytes,
        "lowered function"
    );
    Ok(lowered)
}

struct Lowering<'a> {
    function: &'a Function,
    storage: &'a StorageTable,
    buffers: Vec<Buffer>,
    weights: BTreeMap<StorageRef, BufferId>,
    values: HashMap<NodeValue, BufferId>,
    view_roots: HashMap<BufferId, BufferId>,
    body: Vec<Instruction>,
}

impl<'a> Lowering<'a> {
    fn new(function: &'a Function, storage: &'a StorageTable) -> Self {
        Self {
            function,
            storage,
            buffers: Vec::new(),
            weights: BTreeMap::new(),
            values: HashMap::new(),
            view_roots: HashMap::new(),
            body: Vec::new(),
        }
    }

    fn fail(&self, reason: String) -> Error {
        Error::Lowering {
            function: self.function.name().to_string(),
            reason,
        }
    }

    fn declare(&mut self, name: String, ty: TensorType, kind: BufferKind) -> BufferId {
        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(Buffer { id, name, ty, kind });
        id
    }

    fn weight(&mut self, storage_ref: StorageRef) -> Result<BufferId> {
        if let Some(id) = self.weights.get(&storage_ref) {
            return Ok(*id);
        }
        let ty = self.storage.ty(storage_ref)?.clone();
        let name = self.storage.name(storage_ref)?.to_string();
        let id = self.declare(name, ty, BufferKind::Weight(storage_ref));
        self.weights.insert(storage_ref, id);
        Ok(id)
    }

    fn operand(&mut self, value: Value) -> Result<BufferId> {
        match value {
            Value::Storage(storage_ref) => self.weight(storage_ref),
            Value::Node(node_value) => self
                .values
                .get(&node_value)
                .copied()
                .ok_or_else(|| self.fail(format!("value {node_value} has no buffer"))),
        }
    }

    /// Declares activations for every result of `node` and returns them in order.
    fn results(&mut self, node_id: NodeId) -> Result<Vec<BufferId>> {
        let function = self.function;
        let node = function
            .node(node_id)
            .ok_or_else(|| self.fail(format!("node {} does not exist", node_id.0)))?;
        let mut ids = Vec::with_capacity(node.results().len());
        for (index, ty) in node.results().iter().enumerate() {
            let name = if node.results().len() == 1 {
                node.name().to_string()
            } else {
                format!("{}.{index}", node.name())
            };
            let id = self.declare(name, ty.clone(), BufferKind::Activation);
            self.values
                .insert(NodeValue::new(node_id, index as u32), id);
            ids.push(id);
        }
        Ok(ids)
    }

    fn emit(&mut self, op: Op, outputs: &[BufferId], inputs: &[BufferId]) {
        let operands = outputs
            .iter()
            .map(|id| Operand::write(*id))
            .chain(inputs.iter().map(|id| Operand::read(*id)))
            .collect();
        self.body.push(Instruction::new(op, operands));
    }

    fn lower_node(&mut self, node_id: NodeId) -> Result<()> {
        let function = self.function;
        let node = function
            .node(node_id)
            .ok_or_else(|| self.fail(format!("node {} does not exist", node_id.0)))?;
        let inputs = node
            .inputs()
            .iter()
            .map(|value| self.operand(*value))
            .collect::<Result<Vec<_>>>()?;

        let op = match node.kind() {
            NodeKind::Add => Op::ElementwiseBinary(BinaryOp::Add),
            NodeKind::Sub => Op::ElementwiseBinary(BinaryOp::Sub),
            NodeKind::Mul => Op::ElementwiseBinary(BinaryOp::Mul),
            NodeKind::Relu => Op::ElementwiseUnary(UnaryOp::Relu),
            NodeKind::Sigmoid => Op::ElementwiseUnary(UnaryOp::Sigmoid),
            NodeKind::Tanh => Op::ElementwiseUnary(UnaryOp::Tanh),
            NodeKind::Splat { value, .. } => Op::Splat { value: *value },
            NodeKind::Reshape { .. } => {
                let source = inputs[0];
                let ty = node
                    .ty()
                    .cloned()
                    .ok_or_else(|| self.fail(format!("reshape '{}' has no result", node.name())))?;
                let view = self.declare(
                    node.name().to_string(),
                    ty,
                    BufferKind::View { of: source },
                );
                let root = self.view_roots.get(&source).copied().unwrap_or(source);
                self.view_roots.insert(view, root);
                self.values.insert(NodeValue::new(node_id, 0), view);
                self.emit(Op::TensorView, &[view], &[source]);
                return Ok(());
            }
            NodeKind::Transpose { perm } => Op::Transpose { perm: perm.clone() },
            NodeKind::Conv(params) => Op::Convolution(*params),
            NodeKind::MaxPool(params) => Op::MaxPool(*params),
            NodeKind::FullyConnected => Op::FullyConnected,
            NodeKind::SoftMax => Op::SoftMax,
            NodeKind::LocalResponseNormalization(params) => Op::LocalResponseNormalization(*params),
            NodeKind::Regression => {
                let outputs = self.results(node_id)?;
                self.emit(Op::Copy, &outputs, &inputs[..1]);
                return Ok(());
            }
            NodeKind::BatchedMatMul => Op::BatchedMatMul,
            NodeKind::BatchedReduce(mode) => Op::BatchedReduce(*mode),
            NodeKind::BatchedArithmetic(mode) => Op::BatchedArithmetic(*mode),
            NodeKind::Save { destination } => {
                let target = self.weight(*destination)?;
                self.emit(Op::Copy, &[target], &inputs);
                return Ok(());
            }
            NodeKind::Sgd(params) => {
                let (gradient, weight) = (inputs[0], inputs[1]);
                let ty = self.buffers[weight.index()].ty.clone();
                let state = self.declare(
                    format!("{}.momentum", node.name()),
                    ty,
                    BufferKind::State,
                );
                self.body.push(Instruction::new(
                    Op::Sgd(*params),
                    vec![
                        Operand::read_write(weight),
                        Operand::read(gradient),
                        Operand::read_write(state),
                    ],
                ));
                return Ok(());
            }
            NodeKind::ReluGrad => Op::ReluGrad,
            NodeKind::ConvGrad(params) => Op::ConvolutionGrad(*params),
            NodeKind::MaxPoolGrad(params) => Op::MaxPoolGrad(*params),
            NodeKind::FullyConnectedGrad => Op::FullyConnectedGrad,
            NodeKind::SoftMaxGrad => Op::SoftMaxGrad,
            NodeKind::LocalResponseNormalizationGrad(params) => {
                Op::LocalResponseNormalizationGrad(*params)
            }
        };

        let outputs = self.results(node_id)?;
        self.emit(op, &outputs, &inputs);
        Ok(())
    }
}

/// Wraps every activation's defining instruction with an alloc and its last
/// access (through the buffer itself or any view of it) with a dealloc.
fn place_lifetimes(
    buffers: &[Buffer],
    view_roots: &HashMap<BufferId, BufferId>,
    body: Vec<Instruction>,
) -> Vec<Instruction> {
    let mut first_write: BTreeMap<BufferId, usize> = BTreeMap::new();
    let mut last_use: BTreeMap<BufferId, usize> = BTreeMap::new();
    for (pos, inst) in body.iter().enumerate() {
        for operand in &inst.operands {
            let root = view_roots
                .get(&operand.buffer)
                .copied()
                .unwrap_or(operand.buffer);
            if !buffers[root.index()].is_activation() {
                continue;
            }
            if operand.buffer == root && operand.access == Access::Write {
                first_write.entry(root).or_insert(pos);
            }
            last_use.insert(root, pos);
        }
    }

    let mut allocs: BTreeMap<usize, Vec<BufferId>> = BTreeMap::new();
    for (buffer, pos) in &first_write {
        allocs.entry(*pos).or_default().push(*buffer);
    }
    let mut deallocs: BTreeMap<usize, Vec<BufferId>> = BTreeMap::new();
    for (buffer, pos) in &last_use {
        if first_write.contains_key(buffer) {
            deallocs.entry(*pos).or_default().push(*buffer);
        }
    }

    let mut instructions = Vec::with_capacity(body.len() * 3);
    for (pos, inst) in body.into_iter().enumerate() {
        for buffer in allocs.get(&pos).into_iter().flatten() {
            instructions.push(Instruction::new(
                Op::AllocActivation,
                vec![Operand::write(*buffer)],
            ));
        }
        instructions.push(inst);
        for buffer in deallocs.get(&pos).into_iter().flatten() {
            instructions.push(Instruction::new(
                Op::DeallocActivation,
                vec![Operand::write(*buffer)],
            ));
        }
    }
    instructions
}
