//! Typed node factories for building functions against a module's storage.

use rand::rngs::StdRng;

use super::function::Function;
use super::infer::infer_results;
use super::node::{
    BatchedArithmeticMode, BatchedReduceMode, ConvParams, LrnParams, NodeId, NodeKind, PoolParams,
    SgdParams, Value,
};
use super::storage::{PlaceholderId, StorageRef, StorageTable, Visibility};
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorType};

/// Factory API for one function, with access to the storage of its module.
///
/// Every `create_*` call infers the result types, rejects invalid operand types
/// with [`Error::ShapeMismatch`], and updates the operands' use-lists.
pub struct FunctionBuilder<'m> {
    storage: &'m mut StorageTable,
    rng: &'m mut StdRng,
    function: &'m mut Function,
}

impl<'m> FunctionBuilder<'m> {
    pub(crate) fn new(
        storage: &'m mut StorageTable,
        rng: &'m mut StdRng,
        function: &'m mut Function,
    ) -> Self {
        Self {
            storage,
            rng,
            function,
        }
    }

    /// Function under construction.
    pub fn function(&self) -> &Function {
        self.function
    }

    /// Storage declarations of the owning module.
    pub fn storage(&self) -> &StorageTable {
        self.storage
    }

    /// Type of a node result or storage read.
    pub fn value_type(&self, value: impl Into<Value>) -> Result<TensorType> {
        self.function.value_type(self.storage, value.into())
    }

    /// Generic entry point used by the typed factories below.
    pub fn create_node(&mut self, name: &str, kind: NodeKind, inputs: Vec<Value>) -> Result<NodeId> {
        self.function.add_node(self.storage, name, kind, inputs)
    }

    /// Removes nodes whose results nobody reads; returns how many were dropped.
    pub fn eliminate_dead_nodes(&mut self) -> usize {
        self.function.eliminate_dead_nodes()
    }

    fn unary(&mut self, name: &str, kind: NodeKind, input: impl Into<Value>) -> Result<NodeId> {
        self.create_node(name, kind, vec![input.into()])
    }

    fn binary(
        &mut self,
        name: &str,
        kind: NodeKind,
        lhs: impl Into<Value>,
        rhs: impl Into<Value>,
    ) -> Result<NodeId> {
        self.create_node(name, kind, vec![lhs.into(), rhs.into()])
    }

    /// Elementwise `lhs + rhs`; operands must have the same float type.
    pub fn create_add(
        &mut self,
        name: &str,
        lhs: impl Into<Value>,
        rhs: impl Into<Value>,
    ) -> Result<NodeId> {
        self.binary(name, NodeKind::Add, lhs, rhs)
    }

    /// Elementwise `lhs - rhs`.
    pub fn create_sub(
        &mut self,
        name: &str,
        lhs: impl Into<Value>,
        rhs: impl Into<Value>,
    ) -> Result<NodeId> {
        self.binary(name, NodeKind::Sub, lhs, rhs)
    }

    /// Elementwise `lhs * rhs`.
    pub fn create_mul(
        &mut self,
        name: &str,
        lhs: impl Into<Value>,
        rhs: impl Into<Value>,
    ) -> Result<NodeId> {
        self.binary(name, NodeKind::Mul, lhs, rhs)
    }

    /// `max(x, 0)` per element.
    pub fn create_relu(&mut self, name: &str, input: impl Into<Value>) -> Result<NodeId> {
        self.unary(name, NodeKind::Relu, input)
    }

    /// Logistic function per element.
    pub fn create_sigmoid(&mut self, name: &str, input: impl Into<Value>) -> Result<NodeId> {
        self.unary(name, NodeKind::Sigmoid, input)
    }

    /// Hyperbolic tangent per element.
    pub fn create_tanh(&mut self, name: &str, input: impl Into<Value>) -> Result<NodeId> {
        self.unary(name, NodeKind::Tanh, input)
    }

    /// Tensor of type `ty` with every element set to `value`.
    pub fn create_splat(&mut self, name: &str, ty: TensorType, value: f32) -> Result<NodeId> {
        self.create_node(name, NodeKind::Splat { value, ty }, Vec::new())
    }

    /// Same elements under new dims; the element count must not change.
    pub fn create_reshape(
        &mut self,
        name: &str,
        input: impl Into<Value>,
        dims: &[usize],
    ) -> Result<NodeId> {
        self.unary(
            name,
            NodeKind::Reshape {
                dims: dims.to_vec(),
            },
            input,
        )
    }

    /// Reorders axes: output axis `i` is input axis `perm[i]`.
    pub fn create_transpose(
        &mut self,
        name: &str,
        input: impl Into<Value>,
        perm: &[usize],
    ) -> Result<NodeId> {
        self.unary(
            name,
            NodeKind::Transpose {
                perm: perm.to_vec(),
            },
            input,
        )
    }

    /// Convolution over an NHWC input. Creates a trainable private filter
    /// (`<name>.filter`, Xavier-initialised) and a zero bias (`<name>.bias`).
    pub fn create_conv(
        &mut self,
        name: &str,
        input: impl Into<Value>,
        depth: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Result<NodeId> {
        let input = input.into();
        let input_ty = self.value_type(input)?;
        let channels = match input_ty.dims() {
            [_, _, _, channels] => *channels,
            _ => {
                return Err(Error::ShapeMismatch {
                    op: "Conv".to_string(),
                    detail: format!("input must be NHWC, found {input_ty}"),
                })
            }
        };
        let params = ConvParams {
            depth,
            kernel,
            stride,
            pad,
        };
        let filter_ty = TensorType::float(&[depth, kernel, kernel, channels]);
        let bias_ty = TensorType::float(&[depth]);
        infer_results(
            &NodeKind::Conv(params),
            &[input_ty, filter_ty, bias_ty.clone()],
            self.storage,
        )?;

        let fan_in = kernel * kernel * channels;
        let filter = Tensor::xavier(&[depth, kernel, kernel, channels], fan_in, &mut *self.rng);
        let filter = self.storage.add_variable(
            &format!("{name}.filter"),
            filter,
            Visibility::Private,
            true,
        );
        let bias = self.storage.add_variable(
            &format!("{name}.bias"),
            Tensor::zeros(bias_ty),
            Visibility::Private,
            true,
        );
        self.create_conv_with(name, input, filter, bias, params)
    }

    /// Convolution with caller-supplied filter and bias operands.
    pub fn create_conv_with(
        &mut self,
        name: &str,
        input: impl Into<Value>,
        filter: impl Into<Value>,
        bias: impl Into<Value>,
        params: ConvParams,
    ) -> Result<NodeId> {
        self.create_node(
            name,
            NodeKind::Conv(params),
            vec![input.into(), filter.into(), bias.into()],
        )
    }

    /// Square-window max pooling over an NHWC input.
    pub fn create_max_pool(
        &mut self,
        name: &str,
        input: impl Into<Value>,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Result<NodeId> {
        self.unary(
            name,
            NodeKind::MaxPool(PoolParams {
                kernel,
                stride,
                pad,
            }),
            input,
        )
    }

    /// Fully connected layer producing `[N, depth]`. Creates trainable private
    /// weights (`<name>.weights`, Xavier-initialised) and a zero bias (`<name>.bias`).
    pub fn create_fully_connected(
        &mut self,
        name: &str,
        input: impl Into<Value>,
        depth: usize,
    ) -> Result<NodeId> {
        let input = input.into();
        let input_ty = self.value_type(input)?;
        if input_ty.dims().len() < 2 {
            return Err(Error::ShapeMismatch {
                op: "FullyConnected".to_string(),
                detail: format!("input must have rank >= 2, found {input_ty}"),
            });
        }
        let flat: usize = input_ty.dims()[1..].iter().product();
        let bias_ty = TensorType::float(&[depth]);
        infer_results(
            &NodeKind::FullyConnected,
            &[input_ty, TensorType::float(&[flat, depth]), bias_ty.clone()],
            self.storage,
        )?;

        let weights = Tensor::xavier(&[flat, depth], flat, &mut *self.rng);
        let weights = self.storage.add_variable(
            &format!("{name}.weights"),
            weights,
            Visibility::Private,
            true,
        );
        let bias = self.storage.add_variable(
            &format!("{name}.bias"),
            Tensor::zeros(bias_ty),
            Visibility::Private,
            true,
        );
        self.create_fully_connected_with(name, input, weights, bias)
    }

    /// Fully connected layer with caller-supplied `[flat, depth]` weights and `[depth]` bias.
    pub fn create_fully_connected_with(
        &mut self,
        name: &str,
        input: impl Into<Value>,
        weights: impl Into<Value>,
        bias: impl Into<Value>,
    ) -> Result<NodeId> {
        self.create_node(
            name,
            NodeKind::FullyConnected,
            vec![input.into(), weights.into(), bias.into()],
        )
    }

    /// Row-wise softmax; `selected` holds the expected class of each row.
    pub fn create_softmax(
        &mut self,
        name: &str,
        input: impl Into<Value>,
        selected: impl Into<Value>,
    ) -> Result<NodeId> {
        self.binary(name, NodeKind::SoftMax, input, selected)
    }

    /// Cross-channel normalisation of an NHWC input.
    pub fn create_local_response_normalization(
        &mut self,
        name: &str,
        input: impl Into<Value>,
        params: LrnParams,
    ) -> Result<NodeId> {
        self.unary(name, NodeKind::LocalResponseNormalization(params), input)
    }

    /// Identity in the forward direction; its gradient is `input - expected`.
    pub fn create_regression(
        &mut self,
        name: &str,
        input: impl Into<Value>,
        expected: impl Into<Value>,
    ) -> Result<NodeId> {
        self.binary(name, NodeKind::Regression, input, expected)
    }

    /// `[N, A, B] x [B, C]` (shared rhs) or `[N, A, B] x [N, B, C]`, giving `[N, A, C]`.
    pub fn create_batched_matmul(
        &mut self,
        name: &str,
        lhs: impl Into<Value>,
        rhs: impl Into<Value>,
    ) -> Result<NodeId> {
        self.binary(name, NodeKind::BatchedMatMul, lhs, rhs)
    }

    /// Sums a `[N, ...]` batch over its leading dimension.
    pub fn create_batched_reduce_add(
        &mut self,
        name: &str,
        batch: impl Into<Value>,
    ) -> Result<NodeId> {
        self.unary(name, NodeKind::BatchedReduce(BatchedReduceMode::Add), batch)
    }

    /// Adds `slice` to every entry of `batch`.
    pub fn create_batched_add(
        &mut self,
        name: &str,
        batch: impl Into<Value>,
        slice: impl Into<Value>,
    ) -> Result<NodeId> {
        self.binary(
            name,
            NodeKind::BatchedArithmetic(BatchedArithmeticMode::Add),
            batch,
            slice,
        )
    }

    /// Multiplies every entry of `batch` elementwise by `slice`.
    pub fn create_batched_mul(
        &mut self,
        name: &str,
        batch: impl Into<Value>,
        slice: impl Into<Value>,
    ) -> Result<NodeId> {
        self.binary(
            name,
            NodeKind::BatchedArithmetic(BatchedArithmeticMode::Mul),
            batch,
            slice,
        )
    }

    /// Writes `value` into `destination` when the function runs.
    pub fn create_save(
        &mut self,
        name: &str,
        value: impl Into<Value>,
        destination: impl Into<StorageRef>,
    ) -> Result<NodeId> {
        self.unary(
            name,
            NodeKind::Save {
                destination: destination.into(),
            },
            value,
        )
    }

    /// Saves `value` into a new non-trainable placeholder named `name`.
    pub fn create_save_output(
        &mut self,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<PlaceholderId> {
        let value = value.into();
        let ty = self.value_type(value)?;
        let placeholder = self.storage.add_placeholder(name, ty, false);
        self.create_save(&format!("save_{name}"), value, placeholder)?;
        Ok(placeholder)
    }

    /// In-place update of `weight` from `gradient`. Emitted by differentiation.
    pub fn create_sgd(
        &mut self,
        name: &str,
        gradient: impl Into<Value>,
        weight: impl Into<StorageRef>,
        params: SgdParams,
    ) -> Result<NodeId> {
        self.create_node(
            name,
            NodeKind::Sgd(params),
            vec![gradient.into(), Value::Storage(weight.into())],
        )
    }
}
