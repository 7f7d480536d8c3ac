//! Reverse-mode differentiation of a forward function into a training function.

use std::collections::BTreeMap;

use tracing::debug;

use super::config::TrainingConfig;
use crate::error::{Error, Result};
use crate::graph::{
    BatchedArithmeticMode, BatchedReduceMode, Function, FunctionId, Module, NodeId, NodeKind,
    NodeValue, PlaceholderId, StorageRef, StorageTable, Value, VariableId,
};
use crate::tensor::{ElemKind, TensorType};

/// Builds `<name>_grad`: a copy of the forward function followed by gradient
/// nodes and one `Sgd` node per trainable storage slot that receives a gradient.
///
/// The source function is only read. On failure the module is left unchanged.
pub fn differentiate(
    module: &mut Module,
    id: FunctionId,
    config: &TrainingConfig,
) -> Result<FunctionId> {
    module.verify_function(id)?;
    let source = module.function(id)?;
    config.validate().map_err(|reason| Error::Differentiation {
        function: source.name().to_string(),
        reason,
    })?;

    let mut pass = GradientPass::new(source, module.storage(), config);
    pass.backpropagate()?;
    let sgd_count = pass.emit_updates()?;
    let mut function = pass.function;
    let removed = function.eliminate_dead_nodes();
    function.verify(module.storage())?;

    debug!(
        source = source.name(),
        nodes = function.len(),
        sgd = sgd_count,
        removed,
        "differentiated function"
    );
    Ok(module.insert_function(function))
}

struct GradientPass<'a> {
    source: &'a Function,
    storage: &'a StorageTable,
    config: &'a TrainingConfig,
    function: Function,
    requires: Vec<bool>,
    contributions: BTreeMap<Value, Vec<NodeValue>>,
}

impl<'a> GradientPass<'a> {
    fn new(source: &'a Function, storage: &'a StorageTable, config: &'a TrainingConfig) -> Self {
        let mut function = source.clone();
        function.set_name(format!("{}_grad", source.name()));

        let mut requires = Vec::with_capacity(source.len());
        for node in source.nodes() {
            let float_result = node.ty().is_some_and(|ty| ty.elem == ElemKind::Float);
            let depends = node.inputs().iter().any(|value| match value {
                Value::Storage(storage_ref) => trainable_float(storage, *storage_ref),
                Value::Node(NodeValue { node, .. }) => requires[node.index()],
            });
            requires.push(float_result && depends);
        }

        Self {
            source,
            storage,
            config,
            function,
            requires,
            contributions: BTreeMap::new(),
        }
    }

    fn fail(&self, reason: String) -> Error {
        Error::Differentiation {
            function: self.source.name().to_string(),
            reason,
        }
    }

    fn requires_grad(&self, value: Value) -> bool {
        match value {
            Value::Storage(storage_ref) => trainable_float(self.storage, storage_ref),
            Value::Node(NodeValue { node, .. }) => self.requires[node.index()],
        }
    }

    fn emit(&mut self, name: &str, kind: NodeKind, inputs: Vec<Value>) -> Result<NodeValue> {
        let id = self.function.add_node(self.storage, name, kind, inputs)?;
        Ok(id.into())
    }

    fn splat(&mut self, name: &str, ty: TensorType, value: f32) -> Result<NodeValue> {
        self.emit(name, NodeKind::Splat { value, ty }, Vec::new())
    }

    fn value_type(&self, value: Value) -> Result<TensorType> {
        self.function.value_type(self.storage, value)
    }

    /// Records `gradient` as one contribution to the gradient of `value`.
    fn contribute(&mut self, value: Value, gradient: NodeValue) {
        if self.requires_grad(value) {
            self.contributions.entry(value).or_default().push(gradient);
        }
    }

    /// Sums every contribution recorded for `value`, in recording order.
    fn take_gradient(&mut self, value: Value, label: &str) -> Result<Option<NodeValue>> {
        let Some(parts) = self.contributions.remove(&value) else {
            return Ok(None);
        };
        let mut parts = parts.into_iter();
        let Some(mut total) = parts.next() else {
            return Ok(None);
        };
        for part in parts {
            total = self.emit(
                &format!("{label}_grad_sum"),
                NodeKind::Add,
                vec![total.into(), part.into()],
            )?;
        }
        Ok(Some(total))
    }

    fn backpropagate(&mut self) -> Result<()> {
        let source = self.source;
        for id in source.node_ids().rev() {
            let Some(node) = source.node(id) else {
                continue;
            };
            let name = node.name();
            let inputs = node.inputs();
            let out = Value::Node(NodeValue::new(id, 0));

            match node.kind() {
                NodeKind::Save { .. } => {
                    if self.requires_grad(inputs[0]) {
                        let ty = self.value_type(inputs[0])?;
                        let zero = self.splat(&format!("{name}_zero_grad"), ty, 0.0)?;
                        self.contribute(inputs[0], zero);
                    }
                    continue;
                }
                NodeKind::SoftMax => {
                    self.contributions.remove(&out);
                    if self.requires_grad(inputs[0]) {
                        let grad = self.emit(
                            &format!("{name}_grad"),
                            NodeKind::SoftMaxGrad,
                            vec![out, inputs[1]],
                        )?;
                        self.contribute(inputs[0], grad);
                    }
                    continue;
                }
                NodeKind::Regression => {
                    self.contributions.remove(&out);
                    if self.requires_grad(inputs[0]) {
                        let grad =
                            self.emit(&format!("{name}_grad"), NodeKind::Sub, inputs.to_vec())?;
                        self.contribute(inputs[0], grad);
                    }
                    continue;
                }
                NodeKind::Sgd(_)
                | NodeKind::ReluGrad
                | NodeKind::ConvGrad(_)
                | NodeKind::MaxPoolGrad(_)
                | NodeKind::FullyConnectedGrad
                | NodeKind::SoftMaxGrad
                | NodeKind::LocalResponseNormalizationGrad(_) => {
                    return Err(self.fail(format!(
                        "no gradient rule for {} node '{name}'",
                        node.kind().name()
                    )));
                }
                _ => {}
            }

            let Some(grad) = self.take_gradient(out, name)? else {
                continue;
            };
            self.apply_rule(id, grad)?;
        }
        Ok(())
    }

    fn apply_rule(&mut self, id: NodeId, grad: NodeValue) -> Result<()> {
        let source = self.source;
        let Some(node) = source.node(id) else {
            return Ok(());
        };
        let name = node.name();
        let inputs = node.inputs();
        let out = Value::Node(NodeValue::new(id, 0));
        let g = Value::Node(grad);

        match node.kind() {
            NodeKind::Add => {
                self.contribute(inputs[0], grad);
                self.contribute(inputs[1], grad);
            }
            NodeKind::Sub => {
                self.contribute(inputs[0], grad);
                if self.requires_grad(inputs[1]) {
                    let ty = self.value_type(g)?;
                    let zero = self.splat(&format!("{name}_zero"), ty, 0.0)?;
                    let neg = self.emit(
                        &format!("{name}_rhs_grad"),
                        NodeKind::Sub,
                        vec![zero.into(), g],
                    )?;
                    self.contribute(inputs[1], neg);
                }
            }
            NodeKind::Mul => {
                if self.requires_grad(inputs[0]) {
                    let lhs = self.emit(
                        &format!("{name}_lhs_grad"),
                        NodeKind::Mul,
                        vec![g, inputs[1]],
                    )?;
                    self.contribute(inputs[0], lhs);
                }
                if self.requires_grad(inputs[1]) {
                    let rhs = self.emit(
                        &format!("{name}_rhs_grad"),
                        NodeKind::Mul,
                        vec![g, inputs[0]],
                    )?;
                    self.contribute(inputs[1], rhs);
                }
            }
            NodeKind::Relu => {
                if self.requires_grad(inputs[0]) {
                    let dx =
                        self.emit(&format!("{name}_grad"), NodeKind::ReluGrad, vec![out, g])?;
                    self.contribute(inputs[0], dx);
                }
            }
            NodeKind::Sigmoid => {
                if self.requires_grad(inputs[0]) {
                    // g * out * (1 - out)
                    let ty = self.value_type(out)?;
                    let one = self.splat(&format!("{name}_one"), ty, 1.0)?;
                    let rest =
                        self.emit(&format!("{name}_rest"), NodeKind::Sub, vec![one.into(), out])?;
                    let slope = self.emit(
                        &format!("{name}_slope"),
                        NodeKind::Mul,
                        vec![out, rest.into()],
                    )?;
                    let dx = self.emit(
                        &format!("{name}_grad"),
                        NodeKind::Mul,
                        vec![g, slope.into()],
                    )?;
                    self.contribute(inputs[0], dx);
                }
            }
            NodeKind::Tanh => {
                if self.requires_grad(inputs[0]) {
                    // g * (1 - out^2)
                    let ty = self.value_type(out)?;
                    let one = self.splat(&format!("{name}_one"), ty, 1.0)?;
                    let square =
                        self.emit(&format!("{name}_square"), NodeKind::Mul, vec![out, out])?;
                    let slope = self.emit(
                        &format!("{name}_slope"),
                        NodeKind::Sub,
                        vec![one.into(), square.into()],
                    )?;
                    let dx = self.emit(
                        &format!("{name}_grad"),
                        NodeKind::Mul,
                        vec![g, slope.into()],
                    )?;
                    self.contribute(inputs[0], dx);
                }
            }
            NodeKind::Splat { .. } => {}
            NodeKind::Reshape { .. } => {
                if self.requires_grad(inputs[0]) {
                    let dims = self.value_type(inputs[0])?.dims().to_vec();
                    let dx = self.emit(
                        &format!("{name}_grad"),
                        NodeKind::Reshape { dims },
                        vec![g],
                    )?;
                    self.contribute(inputs[0], dx);
                }
            }
            NodeKind::Transpose { perm } => {
                if self.requires_grad(inputs[0]) {
                    let mut inverse = vec![0; perm.len()];
                    for (axis, &source_axis) in perm.iter().enumerate() {
                        inverse[source_axis] = axis;
                    }
                    let dx = self.emit(
                        &format!("{name}_grad"),
                        NodeKind::Transpose { perm: inverse },
                        vec![g],
                    )?;
                    self.contribute(inputs[0], dx);
                }
            }
            NodeKind::Conv(params) => {
                let grads = self.emit(
                    &format!("{name}_grad"),
                    NodeKind::ConvGrad(*params),
                    vec![inputs[0], inputs[1], g],
                )?;
                for (index, input) in inputs.iter().enumerate() {
                    self.contribute(*input, NodeValue::new(grads.node, index as u32));
                }
            }
            NodeKind::MaxPool(params) => {
                if self.requires_grad(inputs[0]) {
                    let dx = self.emit(
                        &format!("{name}_grad"),
                        NodeKind::MaxPoolGrad(*params),
                        vec![inputs[0], g],
                    )?;
                    self.contribute(inputs[0], dx);
                }
            }
            NodeKind::FullyConnected => {
                let grads = self.emit(
                    &format!("{name}_grad"),
                    NodeKind::FullyConnectedGrad,
                    vec![inputs[0], inputs[1], g],
                )?;
                for (index, input) in inputs.iter().enumerate() {
                    self.contribute(*input, NodeValue::new(grads.node, index as u32));
                }
            }
            NodeKind::LocalResponseNormalization(params) => {
                if self.requires_grad(inputs[0]) {
                    let dx = self.emit(
                        &format!("{name}_grad"),
                        NodeKind::LocalResponseNormalizationGrad(*params),
                        vec![inputs[0], g],
                    )?;
                    self.contribute(inputs[0], dx);
                }
            }
            NodeKind::BatchedMatMul => self.batched_matmul_rule(name, inputs, g)?,
            NodeKind::BatchedReduce(BatchedReduceMode::Add) => {
                if self.requires_grad(inputs[0]) {
                    let ty = self.value_type(inputs[0])?;
                    let zero = self.splat(&format!("{name}_zero"), ty, 0.0)?;
                    let dx = self.emit(
                        &format!("{name}_grad"),
                        NodeKind::BatchedArithmetic(BatchedArithmeticMode::Add),
                        vec![zero.into(), g],
                    )?;
                    self.contribute(inputs[0], dx);
                }
            }
            NodeKind::BatchedArithmetic(mode) => {
                let (batch, slice) = (inputs[0], inputs[1]);
                let (batch_grad, slice_source) = match mode {
                    BatchedArithmeticMode::Add => (grad, g),
                    BatchedArithmeticMode::Mul => {
                        let batch_grad = if self.requires_grad(batch) {
                            self.emit(
                                &format!("{name}_batch_grad"),
                                NodeKind::BatchedArithmetic(BatchedArithmeticMode::Mul),
                                vec![g, slice],
                            )?
                        } else {
                            grad
                        };
                        let scaled = if self.requires_grad(slice) {
                            self.emit(&format!("{name}_scaled"), NodeKind::Mul, vec![g, batch])?
                                .into()
                        } else {
                            g
                        };
                        (batch_grad, scaled)
                    }
                };
                self.contribute(batch, batch_grad);
                if self.requires_grad(slice) {
                    let ds = self.emit(
                        &format!("{name}_slice_grad"),
                        NodeKind::BatchedReduce(BatchedReduceMode::Add),
                        vec![slice_source],
                    )?;
                    self.contribute(slice, ds);
                }
            }
            other => {
                return Err(self.fail(format!(
                    "no gradient rule for {} node '{name}'",
                    other.name()
                )));
            }
        }
        Ok(())
    }

    /// `d lhs = g x rhs^T`, `d rhs = lhs^T x g` (reduced over the batch for a shared rhs).
    fn batched_matmul_rule(&mut self, name: &str, inputs: &[Value], g: Value) -> Result<()> {
        let (lhs, rhs) = (inputs[0], inputs[1]);
        let shared_rhs = self.value_type(rhs)?.dims().len() == 2;
        if self.requires_grad(lhs) {
            let perm = if shared_rhs { vec![1, 0] } else { vec![0, 2, 1] };
            let rhs_t = self.emit(
                &format!("{name}_rhs_t"),
                NodeKind::Transpose { perm },
                vec![rhs],
            )?;
            let dlhs = self.emit(
                &format!("{name}_lhs_grad"),
                NodeKind::BatchedMatMul,
                vec![g, rhs_t.into()],
            )?;
            self.contribute(lhs, dlhs);
        }
        if self.requires_grad(rhs) {
            let lhs_t = self.emit(
                &format!("{name}_lhs_t"),
                NodeKind::Transpose {
                    perm: vec![0, 2, 1],
                },
                vec![lhs],
            )?;
            let mut drhs = self.emit(
                &format!("{name}_rhs_grad"),
                NodeKind::BatchedMatMul,
                vec![lhs_t.into(), g],
            )?;
            if shared_rhs {
                drhs = self.emit(
                    &format!("{name}_rhs_grad_sum"),
                    NodeKind::BatchedReduce(BatchedReduceMode::Add),
                    vec![drhs.into()],
                )?;
            }
            self.contribute(rhs, drhs);
        }
        Ok(())
    }

    /// One `Sgd` per trainable variable, then per trainable placeholder, in id order.
    fn emit_updates(&mut self) -> Result<usize> {
        let storage = self.storage;
        let params = self.config.sgd_params();
        let targets = storage
            .variables()
            .iter()
            .enumerate()
            .map(|(idx, var)| (StorageRef::Variable(VariableId(idx as u32)), var.name()))
            .chain(
                storage
                    .placeholders()
                    .iter()
                    .enumerate()
                    .map(|(idx, ph)| (StorageRef::Placeholder(PlaceholderId(idx as u32)), ph.name())),
            );

        let mut count = 0;
        for (target, target_name) in targets {
            if !storage.is_trainable(target) {
                continue;
            }
            let Some(grad) = self.take_gradient(Value::Storage(target), target_name)? else {
                continue;
            };
            self.emit(
                &format!("{target_name}_sgd"),
                NodeKind::Sgd(params),
                vec![grad.into(), Value::Storage(target)],
            )?;
            count += 1;
        }
        Ok(count)
    }
}

fn trainable_float(storage: &StorageTable, storage_ref: StorageRef) -> bool {
    storage.is_trainable(storage_ref)
        && storage
            .ty(storage_ref)
            .is_ok_and(|ty| ty.elem == ElemKind::Float)
}
