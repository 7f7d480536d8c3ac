//! Result-type rules, one per [`NodeKind`].
//!
//! The same rules run at the factory call and again during verification, so a
//! function whose recorded types drift from its operands is always caught.

use super::node::{ConvParams, NodeKind, PoolParams};
use super::storage::StorageTable;
use crate::error::{Error, Result};
use crate::tensor::{ElemKind, TensorType};

/// Computes the result types of `kind` applied to operands of the given types.
pub fn infer_results(
    kind: &NodeKind,
    operands: &[TensorType],
    storage: &StorageTable,
) -> Result<Vec<TensorType>> {
    let ctx = RuleContext { kind, operands };
    if operands.len() != kind.arity() {
        return Err(ctx.mismatch(format!(
            "expected {} operands, found {}",
            kind.arity(),
            operands.len()
        )));
    }

    match kind {
        NodeKind::Add | NodeKind::Sub | NodeKind::Mul | NodeKind::Regression => {
            ctx.require_float(0)?;
            ctx.require_same(0, 1)?;
            Ok(vec![operands[0].clone()])
        }
        NodeKind::Relu | NodeKind::Sigmoid | NodeKind::Tanh => {
            ctx.require_float(0)?;
            Ok(vec![operands[0].clone()])
        }
        NodeKind::Splat { ty, .. } => Ok(vec![ty.clone()]),
        NodeKind::Reshape { dims } => {
            let target = operands[0].with_dims(dims);
            if target.num_elements() != operands[0].num_elements() {
                return Err(ctx.mismatch(format!(
                    "cannot reshape {} elements into {:?}",
                    operands[0].num_elements(),
                    dims
                )));
            }
            Ok(vec![target])
        }
        NodeKind::Transpose { perm } => {
            let input = operands[0].dims();
            if !is_permutation(perm, input.len()) {
                return Err(ctx.mismatch(format!(
                    "{perm:?} is not a permutation of rank {}",
                    input.len()
                )));
            }
            let dims: Vec<usize> = perm.iter().map(|&axis| input[axis]).collect();
            Ok(vec![operands[0].with_dims(&dims)])
        }
        NodeKind::Conv(params) => {
            let out = conv_output(&ctx, params, 0, 1)?;
            ctx.require_float(2)?;
            if operands[2].dims() != [params.depth] {
                return Err(ctx.mismatch(format!("bias must be [{}]", params.depth)));
            }
            Ok(vec![out])
        }
        NodeKind::MaxPool(params) => Ok(vec![pool_output(&ctx, params, 0)?]),
        NodeKind::FullyConnected => {
            let (out, _) = fully_connected_output(&ctx)?;
            Ok(vec![out])
        }
        NodeKind::SoftMax | NodeKind::SoftMaxGrad => {
            ctx.require_float(0)?;
            ctx.require_rank(0, 2)?;
            let batch = operands[0].dims()[0];
            if operands[1].elem != ElemKind::Index || operands[1].dims() != [batch, 1] {
                return Err(ctx.mismatch(format!("selected must be index [{batch}, 1]")));
            }
            Ok(vec![operands[0].clone()])
        }
        NodeKind::LocalResponseNormalization(_) => {
            ctx.require_float(0)?;
            ctx.require_rank(0, 4)?;
            Ok(vec![operands[0].clone()])
        }
        NodeKind::BatchedMatMul => {
            ctx.require_float(0)?;
            ctx.require_float(1)?;
            ctx.require_rank(0, 3)?;
            let lhs = operands[0].dims();
            let rhs = operands[1].dims();
            let (rhs_rows, rhs_cols) = match rhs {
                [rows, cols] => (*rows, *cols),
                [batch, rows, cols] if *batch == lhs[0] => (*rows, *cols),
                _ => {
                    return Err(ctx.mismatch(
                        "rhs must be [B, C] or share the lhs batch as [N, B, C]".to_string(),
                    ))
                }
            };
            if rhs_rows != lhs[2] {
                return Err(ctx.mismatch(format!(
                    "contracting dimensions differ ({} vs {rhs_rows})",
                    lhs[2]
                )));
            }
            Ok(vec![operands[0].with_dims(&[lhs[0], lhs[1], rhs_cols])])
        }
        NodeKind::BatchedReduce(_) => {
            ctx.require_float(0)?;
            let dims = operands[0].dims();
            if dims.is_empty() {
                return Err(ctx.mismatch("batch operand must have rank >= 1".to_string()));
            }
            Ok(vec![operands[0].with_dims(&dims[1..])])
        }
        NodeKind::BatchedArithmetic(_) => {
            let batch = &operands[0];
            let slice = &operands[1];
            ctx.require_float(0)?;
            if batch.dims().is_empty()
                || batch.elem != slice.elem
                || slice.dims() != &batch.dims()[1..]
            {
                return Err(ctx.mismatch(
                    "slice must match the batch type without its leading dimension".to_string(),
                ));
            }
            Ok(vec![batch.clone()])
        }
        NodeKind::Save { destination } => {
            let expected = storage.ty(*destination)?;
            if expected != &operands[0] {
                return Err(ctx.mismatch(format!(
                    "destination {} has type {expected}",
                    storage.name(*destination)?
                )));
            }
            Ok(Vec::new())
        }
        NodeKind::Sgd(_) => {
            ctx.require_float(0)?;
            ctx.require_same(0, 1)?;
            Ok(Vec::new())
        }
        NodeKind::ReluGrad => {
            ctx.require_float(0)?;
            ctx.require_same(0, 1)?;
            Ok(vec![operands[0].clone()])
        }
        NodeKind::ConvGrad(params) => {
            let out = conv_output(&ctx, params, 0, 1)?;
            if operands[2] != out {
                return Err(ctx.mismatch(format!("output gradient must be {out}")));
            }
            Ok(vec![
                operands[0].clone(),
                operands[1].clone(),
                TensorType::float(&[params.depth]),
            ])
        }
        NodeKind::MaxPoolGrad(params) => {
            let out = pool_output(&ctx, params, 0)?;
            if operands[1] != out {
                return Err(ctx.mismatch(format!("output gradient must be {out}")));
            }
            Ok(vec![operands[0].clone()])
        }
        NodeKind::FullyConnectedGrad => {
            let (out, depth) = fully_connected_output(&ctx)?;
            if operands[2] != out {
                return Err(ctx.mismatch(format!("output gradient must be {out}")));
            }
            Ok(vec![
                operands[0].clone(),
                operands[1].clone(),
                TensorType::float(&[depth]),
            ])
        }
        NodeKind::LocalResponseNormalizationGrad(_) => {
            ctx.require_float(0)?;
            ctx.require_rank(0, 4)?;
            ctx.require_same(0, 1)?;
            Ok(vec![operands[0].clone()])
        }
    }
}

/// Spatial output extent of a sliding window, or `None` when the window does not fit.
pub fn window_output(input: usize, kernel: usize, stride: usize, pad: usize) -> Option<usize> {
    if kernel == 0 || stride == 0 || input + 2 * pad < kernel {
        return None;
    }
    Some((input + 2 * pad - kernel) / stride + 1)
}

fn is_permutation(perm: &[usize], rank: usize) -> bool {
    if perm.len() != rank {
        return false;
    }
    let mut seen = vec![false; rank];
    for &axis in perm {
        if axis >= rank || seen[axis] {
            return false;
        }
        seen[axis] = true;
    }
    true
}

fn conv_output(
    ctx: &RuleContext<'_>,
    params: &ConvParams,
    input: usize,
    filter: usize,
) -> Result<TensorType> {
    ctx.require_float(input)?;
    ctx.require_float(filter)?;
    ctx.require_rank(input, 4)?;
    let dims = ctx.operands[input].dims();
    let (n, h, w, c) = (dims[0], dims[1], dims[2], dims[3]);
    let expected_filter = [params.depth, params.kernel, params.kernel, c];
    if ctx.operands[filter].dims() != expected_filter {
        return Err(ctx.mismatch(format!("filter must be {expected_filter:?}")));
    }
    let oh = window_output(h, params.kernel, params.stride, params.pad);
    let ow = window_output(w, params.kernel, params.stride, params.pad);
    match (oh, ow) {
        (Some(oh), Some(ow)) => Ok(TensorType::float(&[n, oh, ow, params.depth])),
        _ => Err(ctx.mismatch(format!(
            "kernel {} with stride {} and pad {} does not fit {h}x{w}",
            params.kernel, params.stride, params.pad
        ))),
    }
}

fn pool_output(ctx: &RuleContext<'_>, params: &PoolParams, input: usize) -> Result<TensorType> {
    ctx.require_float(input)?;
    ctx.require_rank(input, 4)?;
    let dims = ctx.operands[input].dims();
    let oh = window_output(dims[1], params.kernel, params.stride, params.pad);
    let ow = window_output(dims[2], params.kernel, params.stride, params.pad);
    match (oh, ow) {
        (Some(oh), Some(ow)) => Ok(TensorType::float(&[dims[0], oh, ow, dims[3]])),
        _ => Err(ctx.mismatch(format!(
            "window {} with stride {} and pad {} does not fit {}x{}",
            params.kernel, params.stride, params.pad, dims[1], dims[2]
        ))),
    }
}

/// Operands 0..3 are input, weights, and bias (or output gradient); returns `[N, D]` and `D`.
fn fully_connected_output(ctx: &RuleContext<'_>) -> Result<(TensorType, usize)> {
    ctx.require_float(0)?;
    ctx.require_float(1)?;
    let input = ctx.operands[0].dims();
    if input.len() < 2 {
        return Err(ctx.mismatch("input must have rank >= 2".to_string()));
    }
    let flat: usize = input[1..].iter().product();
    let (rows, depth) = match ctx.operands[1].dims() {
        [rows, depth] => (*rows, *depth),
        _ => return Err(ctx.mismatch("weights must be rank 2".to_string())),
    };
    if rows != flat {
        return Err(ctx.mismatch(format!(
            "weights rows {rows} do not match flattened input width {flat}"
        )));
    }
    if matches!(ctx.kind, NodeKind::FullyConnected) && ctx.operands[2].dims() != [depth] {
        return Err(ctx.mismatch(format!("bias must be [{depth}]")));
    }
    Ok((TensorType::float(&[input[0], depth]), depth))
}

struct RuleContext<'a> {
    kind: &'a NodeKind,
    operands: &'a [TensorType],
}

impl RuleContext<'_> {
    fn mismatch(&self, detail: String) -> Error {
        let types = self
            .operands
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Error::ShapeMismatch {
            op: self.kind.name().to_string(),
            detail: format!("{detail} (operands: [{types}])"),
        }
    }

    fn require_float(&self, index: usize) -> Result<()> {
        if self.operands[index].elem != ElemKind::Float {
            return Err(self.mismatch(format!("operand {index} must be float")));
        }
        Ok(())
    }

    fn require_rank(&self, index: usize, rank: usize) -> Result<()> {
        if self.operands[index].dims().len() != rank {
            return Err(self.mismatch(format!("operand {index} must have rank {rank}")));
        }
        Ok(())
    }

    fn require_same(&self, lhs: usize, rhs: usize) -> Result<()> {
        if self.operands[lhs] != self.operands[rhs] {
            return Err(self.mismatch(format!("operands {lhs} and {rhs} must have the same type")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::BatchedReduceMode;

    fn infer(kind: NodeKind, operands: &[TensorType]) -> Result<Vec<TensorType>> {
        infer_results(&kind, operands, &StorageTable::new())
    }

    #[test]
    fn conv_output_uses_window_formula() {
        let params = ConvParams {
            depth: 4,
            kernel: 3,
            stride: 2,
            pad: 1,
        };
        let out = infer(
            NodeKind::Conv(params),
            &[
                TensorType::float(&[2, 7, 5, 3]),
                TensorType::float(&[4, 3, 3, 3]),
                TensorType::float(&[4]),
            ],
        )
        .expect("conv shapes are valid");
        assert_eq!(out, vec![TensorType::float(&[2, 4, 3, 4])]);
    }

    #[test]
    fn fully_connected_flattens_trailing_dims() {
        let out = infer(
            NodeKind::FullyConnected,
            &[
                TensorType::float(&[2, 3, 4]),
                TensorType::float(&[12, 5]),
                TensorType::float(&[5]),
            ],
        )
        .expect("fc shapes are valid");
        assert_eq!(out, vec![TensorType::float(&[2, 5])]);
    }

    #[test]
    fn batched_matmul_accepts_shared_and_batched_rhs() {
        let lhs = TensorType::float(&[2, 3, 4]);
        let shared = infer(NodeKind::BatchedMatMul, &[lhs.clone(), TensorType::float(&[4, 5])])
            .expect("shared rhs");
        let batched = infer(
            NodeKind::BatchedMatMul,
            &[lhs.clone(), TensorType::float(&[2, 4, 5])],
        )
        .expect("batched rhs");
        assert_eq!(shared, batched);
        assert_eq!(shared, vec![TensorType::float(&[2, 3, 5])]);

        let err = infer(NodeKind::BatchedMatMul, &[lhs, TensorType::float(&[3, 4, 5])])
            .expect_err("batch mismatch");
        assert!(matches!(err, Error::ShapeMismatch { ref op, .. } if op == "BatchedMatMul"));
    }

    #[test]
    fn batched_reduce_drops_leading_dim() {
        let out = infer(
            NodeKind::BatchedReduce(BatchedReduceMode::Add),
            &[TensorType::float(&[3, 4])],
        )
        .expect("reduce");
        assert_eq!(out, vec![TensorType::float(&[4])]);
    }

    #[test]
    fn mismatched_add_names_operator_and_types() {
        let err = infer(
            NodeKind::Add,
            &[TensorType::float(&[2]), TensorType::float(&[3])],
        )
        .expect_err("add of different shapes");
        let message = err.to_string();
        assert!(message.contains("Add"), "{message}");
        assert!(message.contains("tensor<float x 2>"), "{message}");
    }

    #[test]
    fn transpose_rejects_repeated_axes() {
        let err = infer(
            NodeKind::Transpose { perm: vec![0, 0] },
            &[TensorType::float(&[2, 3])],
        );
        assert!(err.is_err());
        let out = infer(
            NodeKind::Transpose { perm: vec![1, 0] },
            &[TensorType::float(&[2, 3])],
        )
        .expect("valid permutation");
        assert_eq!(out, vec![TensorType::float(&[3, 2])]);
    }
}
