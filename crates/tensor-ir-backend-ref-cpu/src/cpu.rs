use tensor_ir::backend::{Backend, BackendError, BackendResult, ExecutionMemory};
use tensor_ir::graph::{
    BatchedArithmeticMode, BatchedReduceMode, ConvParams, LrnParams, PoolParams, SgdParams,
};
use tensor_ir::ir::{BinaryOp, BufferId, Instruction, Op, UnaryOp};
use tensor_ir::tensor::{ElemKind, Tensor, TensorData};
use tracing::trace;

/// Reference interpreter: every instruction reads its operands, computes on the
/// host, and writes whole destination buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl Backend for CpuBackend {
    fn backend_name(&self) -> &str {
        "cpu-ref"
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        memory: &mut ExecutionMemory<'_>,
    ) -> BackendResult<()> {
        trace!(op = instruction.op.name(), "execute");
        execute_operation(instruction, memory)
            .map_err(|err| augment_backend_error(err, instruction))
    }
}

/// Dense float operand with its dimensions.
#[derive(Debug, Clone)]
struct Dense {
    dims: Vec<usize>,
    values: Vec<f32>,
}

fn execute_operation(instruction: &Instruction, memory: &mut ExecutionMemory<'_>) -> BackendResult<()> {
    let op_name = instruction.op.name();
    let buffers: Vec<BufferId> = instruction.buffers().collect();
    let expected = instruction.op.signature().len();
    if buffers.len() != expected {
        return Err(BackendError::execution(format!(
            "expected {expected} operands, found {}",
            buffers.len()
        )));
    }

    match &instruction.op {
        // Slots are owned by the run's memory and views alias their source.
        Op::AllocActivation | Op::DeallocActivation | Op::TensorView => Ok(()),
        Op::Copy => op_copy(memory, buffers[0], buffers[1]),
        Op::Splat { value } => op_splat(memory, buffers[0], *value),
        Op::ElementwiseBinary(op) => {
            let lhs = read_f32(op_name, memory, buffers[1])?;
            let rhs = read_f32(op_name, memory, buffers[2])?;
            let result = op_elementwise_binary(&lhs, &rhs, *op)?;
            write_f32(memory, buffers[0], result)
        }
        Op::ElementwiseUnary(op) => {
            let input = read_f32(op_name, memory, buffers[1])?;
            write_f32(memory, buffers[0], op_elementwise_unary(&input, *op))
        }
        Op::ReluGrad => {
            let output = read_f32(op_name, memory, buffers[1])?;
            let grad = read_f32(op_name, memory, buffers[2])?;
            let result = output
                .values
                .iter()
                .zip(&grad.values)
                .map(|(&y, &g)| if y > 0.0 { g } else { 0.0 })
                .collect();
            write_f32(memory, buffers[0], result)
        }
        Op::Convolution(params) => {
            let input = read_f32(op_name, memory, buffers[1])?;
            let filter = read_f32(op_name, memory, buffers[2])?;
            let bias = read_f32(op_name, memory, buffers[3])?;
            let out_dims = memory.buffer_type(buffers[0])?.dims().to_vec();
            let result = op_convolution(&input, &filter, &bias, params, &out_dims);
            write_f32(memory, buffers[0], result)
        }
        Op::ConvolutionGrad(params) => {
            let input = read_f32(op_name, memory, buffers[3])?;
            let filter = read_f32(op_name, memory, buffers[4])?;
            let grad = read_f32(op_name, memory, buffers[5])?;
            let (d_input, d_filter, d_bias) = op_convolution_grad(&input, &filter, &grad, params);
            write_f32(memory, buffers[0], d_input)?;
            write_f32(memory, buffers[1], d_filter)?;
            write_f32(memory, buffers[2], d_bias)
        }
        Op::MaxPool(params) => {
            let input = read_f32(op_name, memory, buffers[1])?;
            let out_dims = memory.buffer_type(buffers[0])?.dims().to_vec();
            let result = pool_windows(&input, params, &out_dims)
                .into_iter()
                .map(|(_, value)| value)
                .collect();
            write_f32(memory, buffers[0], result)
        }
        Op::MaxPoolGrad(params) => {
            let input = read_f32(op_name, memory, buffers[1])?;
            let grad = read_f32(op_name, memory, buffers[2])?;
            let mut result = vec![0.0f32; input.values.len()];
            for ((argmax, _), g) in pool_windows(&input, params, &grad.dims)
                .into_iter()
                .zip(&grad.values)
            {
                if let Some(index) = argmax {
                    result[index] += g;
                }
            }
            write_f32(memory, buffers[0], result)
        }
        Op::FullyConnected => {
            let input = read_f32(op_name, memory, buffers[1])?;
            let weights = read_f32(op_name, memory, buffers[2])?;
            let bias = read_f32(op_name, memory, buffers[3])?;
            write_f32(
                memory,
                buffers[0],
                op_fully_connected(&input, &weights, &bias),
            )
        }
        Op::FullyConnectedGrad => {
            let input = read_f32(op_name, memory, buffers[3])?;
            let weights = read_f32(op_name, memory, buffers[4])?;
            let grad = read_f32(op_name, memory, buffers[5])?;
            let (d_input, d_weights, d_bias) = op_fully_connected_grad(&input, &weights, &grad);
            write_f32(memory, buffers[0], d_input)?;
            write_f32(memory, buffers[1], d_weights)?;
            write_f32(memory, buffers[2], d_bias)
        }
        Op::SoftMax => {
            let input = read_f32(op_name, memory, buffers[1])?;
            write_f32(memory, buffers[0], op_softmax(&input))
        }
        Op::SoftMaxGrad => {
            let output = read_f32(op_name, memory, buffers[1])?;
            let selected = read_i64(memory, buffers[2])?;
            let result = op_softmax_grad(&output, &selected)?;
            write_f32(memory, buffers[0], result)
        }
        Op::LocalResponseNormalization(params) => {
            let input = read_f32(op_name, memory, buffers[1])?;
            write_f32(memory, buffers[0], op_lrn(&input, params))
        }
        Op::LocalResponseNormalizationGrad(params) => {
            let input = read_f32(op_name, memory, buffers[1])?;
            let grad = read_f32(op_name, memory, buffers[2])?;
            write_f32(memory, buffers[0], op_lrn_grad(&input, &grad, params))
        }
        Op::BatchedMatMul => {
            let lhs = read_f32(op_name, memory, buffers[1])?;
            let rhs = read_f32(op_name, memory, buffers[2])?;
            write_f32(memory, buffers[0], op_batched_matmul(&lhs, &rhs)?)
        }
        Op::BatchedReduce(BatchedReduceMode::Add) => {
            let batch = read_f32(op_name, memory, buffers[1])?;
            write_f32(memory, buffers[0], op_batched_reduce_add(&batch))
        }
        Op::BatchedArithmetic(mode) => {
            let batch = read_f32(op_name, memory, buffers[1])?;
            let slice = read_f32(op_name, memory, buffers[2])?;
            let result = op_batched_arithmetic(&batch, &slice, *mode)?;
            write_f32(memory, buffers[0], result)
        }
        Op::Transpose { perm } => op_transpose(memory, buffers[0], buffers[1], perm),
        Op::Sgd(params) => {
            let mut weight = read_f32(op_name, memory, buffers[0])?;
            let grad = read_f32(op_name, memory, buffers[1])?;
            let mut gsum = read_f32(op_name, memory, buffers[2])?;
            op_sgd(&mut weight.values, &grad.values, &mut gsum.values, params)?;
            write_f32(memory, buffers[0], weight.values)?;
            write_f32(memory, buffers[2], gsum.values)
        }
    }
}

fn augment_backend_error(err: BackendError, instruction: &Instruction) -> BackendError {
    match err {
        BackendError::Execution { message } => {
            let operands = instruction
                .operands
                .iter()
                .map(|operand| format!("@{} %{}", operand.access.as_str(), operand.buffer.0))
                .collect::<Vec<_>>()
                .join(", ");
            BackendError::execution(format!(
                "{} ({operands}): {message}",
                instruction.op.name()
            ))
        }
        other => other,
    }
}

/// Reads a float operand. The interpreter only carries float kernels for
/// arithmetic, so index operands surface as unimplemented.
fn read_f32(
    op_name: &'static str,
    memory: &ExecutionMemory<'_>,
    buffer: BufferId,
) -> BackendResult<Dense> {
    let tensor = memory.read(buffer)?;
    let dims = tensor.dims().to_vec();
    match tensor.into_data() {
        TensorData::Float(values) => Ok(Dense { dims, values }),
        TensorData::Index(_) => Err(BackendError::unimplemented(
            op_name,
            format!("index elements in buffer {}", buffer.0),
        )),
    }
}

fn read_i64(memory: &ExecutionMemory<'_>, buffer: BufferId) -> BackendResult<Vec<i64>> {
    match memory.read(buffer)?.into_data() {
        TensorData::Index(values) => Ok(values),
        TensorData::Float(_) => Err(BackendError::execution(format!(
            "buffer {} holds float elements, expected index",
            buffer.0
        ))),
    }
}

fn write_f32(memory: &mut ExecutionMemory<'_>, buffer: BufferId, values: Vec<f32>) -> BackendResult<()> {
    let ty = memory.buffer_type(buffer)?.clone();
    let tensor = Tensor::from_data(ty, TensorData::Float(values))
        .map_err(|err| BackendError::execution(err.to_string()))?;
    memory.write(buffer, tensor)
}

fn op_copy(memory: &mut ExecutionMemory<'_>, dst: BufferId, src: BufferId) -> BackendResult<()> {
    let ty = memory.buffer_type(dst)?.clone();
    let data = memory.read(src)?.into_data();
    let tensor =
        Tensor::from_data(ty, data).map_err(|err| BackendError::execution(err.to_string()))?;
    memory.write(dst, tensor)
}

fn op_splat(memory: &mut ExecutionMemory<'_>, dst: BufferId, value: f32) -> BackendResult<()> {
    let ty = memory.buffer_type(dst)?.clone();
    let len = ty.num_elements();
    let data = match ty.elem {
        ElemKind::Float => TensorData::Float(vec![value; len]),
        ElemKind::Index => TensorData::Index(vec![value as i64; len]),
    };
    let tensor =
        Tensor::from_data(ty, data).map_err(|err| BackendError::execution(err.to_string()))?;
    memory.write(dst, tensor)
}

fn op_elementwise_binary(lhs: &Dense, rhs: &Dense, op: BinaryOp) -> BackendResult<Vec<f32>> {
    if lhs.values.len() != rhs.values.len() {
        return Err(BackendError::execution("elementwise size mismatch"));
    }
    Ok(lhs
        .values
        .iter()
        .zip(&rhs.values)
        .map(|(&x, &y)| match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
        })
        .collect())
}

fn op_elementwise_unary(input: &Dense, op: UnaryOp) -> Vec<f32> {
    match op {
        UnaryOp::Relu => input.values.iter().map(|&x| x.max(0.0)).collect(),
        UnaryOp::Sigmoid => input
            .values
            .iter()
            .map(|&x| 1.0 / (1.0 + (-x).exp()))
            .collect(),
        UnaryOp::Tanh => input.values.iter().map(|&x| x.tanh()).collect(),
    }
}

/// Input coordinate for output position `out` and kernel offset `k`, if inside the image.
fn window_coord(out: usize, k: usize, stride: usize, pad: usize, extent: usize) -> Option<usize> {
    let pos = (out * stride + k).checked_sub(pad)?;
    (pos < extent).then_some(pos)
}

fn op_convolution(
    input: &Dense,
    filter: &Dense,
    bias: &Dense,
    params: &ConvParams,
    out_dims: &[usize],
) -> Vec<f32> {
    let (h, w, c) = (input.dims[1], input.dims[2], input.dims[3]);
    let k = params.kernel;
    let in_strides = compute_strides(&input.dims);
    let f_strides = compute_strides(&filter.dims);
    let mut result = vec![0.0f32; out_dims.iter().product()];
    for (idx, slot) in result.iter_mut().enumerate() {
        let coord = unravel_index(idx, out_dims);
        let (n, oy, ox, d) = (coord[0], coord[1], coord[2], coord[3]);
        let mut acc = bias.values[d];
        for ky in 0..k {
            let Some(iy) = window_coord(oy, ky, params.stride, params.pad, h) else {
                continue;
            };
            for kx in 0..k {
                let Some(ix) = window_coord(ox, kx, params.stride, params.pad, w) else {
                    continue;
                };
                let in_base = n * in_strides[0] + iy * in_strides[1] + ix * in_strides[2];
                let f_base = d * f_strides[0] + ky * f_strides[1] + kx * f_strides[2];
                for ch in 0..c {
                    acc += input.values[in_base + ch] * filter.values[f_base + ch];
                }
            }
        }
        *slot = acc;
    }
    result
}

fn op_convolution_grad(
    input: &Dense,
    filter: &Dense,
    grad: &Dense,
    params: &ConvParams,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let (h, w, c) = (input.dims[1], input.dims[2], input.dims[3]);
    let k = params.kernel;
    let in_strides = compute_strides(&input.dims);
    let f_strides = compute_strides(&filter.dims);
    let mut d_input = vec![0.0f32; input.values.len()];
    let mut d_filter = vec![0.0f32; filter.values.len()];
    let mut d_bias = vec![0.0f32; params.depth];
    for (idx, &g) in grad.values.iter().enumerate() {
        let coord = unravel_index(idx, &grad.dims);
        let (n, oy, ox, d) = (coord[0], coord[1], coord[2], coord[3]);
        d_bias[d] += g;
        for ky in 0..k {
            let Some(iy) = window_coord(oy, ky, params.stride, params.pad, h) else {
                continue;
            };
            for kx in 0..k {
                let Some(ix) = window_coord(ox, kx, params.stride, params.pad, w) else {
                    continue;
                };
                let in_base = n * in_strides[0] + iy * in_strides[1] + ix * in_strides[2];
                let f_base = d * f_strides[0] + ky * f_strides[1] + kx * f_strides[2];
                for ch in 0..c {
                    d_input[in_base + ch] += filter.values[f_base + ch] * g;
                    d_filter[f_base + ch] += input.values[in_base + ch] * g;
                }
            }
        }
    }
    (d_input, d_filter, d_bias)
}

/// For every output position: flat index of the first maximum in its window, and that maximum.
fn pool_windows(input: &Dense, params: &PoolParams, out_dims: &[usize]) -> Vec<(Option<usize>, f32)> {
    let (h, w) = (input.dims[1], input.dims[2]);
    let in_strides = compute_strides(&input.dims);
    let total: usize = out_dims.iter().product();
    let mut result = Vec::with_capacity(total);
    for idx in 0..total {
        let coord = unravel_index(idx, out_dims);
        let (n, oy, ox, ch) = (coord[0], coord[1], coord[2], coord[3]);
        let mut best: Option<(usize, f32)> = None;
        for ky in 0..params.kernel {
            let Some(iy) = window_coord(oy, ky, params.stride, params.pad, h) else {
                continue;
            };
            for kx in 0..params.kernel {
                let Some(ix) = window_coord(ox, kx, params.stride, params.pad, w) else {
                    continue;
                };
                let flat = n * in_strides[0] + iy * in_strides[1] + ix * in_strides[2] + ch;
                let value = input.values[flat];
                if best.map_or(true, |(_, current)| value > current) {
                    best = Some((flat, value));
                }
            }
        }
        result.push(match best {
            Some((flat, value)) => (Some(flat), value),
            None => (None, 0.0),
        });
    }
    result
}

fn op_fully_connected(input: &Dense, weights: &Dense, bias: &Dense) -> Vec<f32> {
    let batch = input.dims[0];
    let (rows, depth) = (weights.dims[0], weights.dims[1]);
    let mut result = vec![0.0f32; batch * depth];
    for n in 0..batch {
        for d in 0..depth {
            let mut acc = bias.values[d];
            for k in 0..rows {
                acc += input.values[n * rows + k] * weights.values[k * depth + d];
            }
            result[n * depth + d] = acc;
        }
    }
    result
}

fn op_fully_connected_grad(
    input: &Dense,
    weights: &Dense,
    grad: &Dense,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let batch = input.dims[0];
    let (rows, depth) = (weights.dims[0], weights.dims[1]);
    let mut d_input = vec![0.0f32; input.values.len()];
    let mut d_weights = vec![0.0f32; weights.values.len()];
    let mut d_bias = vec![0.0f32; depth];
    for n in 0..batch {
        for d in 0..depth {
            let g = grad.values[n * depth + d];
            d_bias[d] += g;
            for k in 0..rows {
                d_input[n * rows + k] += g * weights.values[k * depth + d];
                d_weights[k * depth + d] += g * input.values[n * rows + k];
            }
        }
    }
    (d_input, d_weights, d_bias)
}

fn op_softmax(input: &Dense) -> Vec<f32> {
    let width = input.dims[1];
    let mut result = Vec::with_capacity(input.values.len());
    for row in input.values.chunks(width.max(1)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = row.iter().map(|&x| (x - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        result.extend(exps.into_iter().map(|e| e / sum));
    }
    result
}

fn op_softmax_grad(output: &Dense, selected: &[i64]) -> BackendResult<Vec<f32>> {
    let width = output.dims[1];
    let mut result = output.values.clone();
    for (row, &class) in selected.iter().enumerate() {
        let class = usize::try_from(class)
            .ok()
            .filter(|class| *class < width)
            .ok_or_else(|| {
                BackendError::execution(format!(
                    "selected class {class} out of range for width {width}"
                ))
            })?;
        result[row * width + class] -= 1.0;
    }
    Ok(result)
}

/// Per-element normalisation scale `k + alpha / window * sum(x^2)` over neighbouring channels.
fn lrn_scales(input: &Dense, params: &LrnParams) -> Vec<f32> {
    let channels = input.dims[3];
    let window = (2 * params.half_window + 1) as f32;
    let normed_alpha = params.alpha / window;
    let mut scales = Vec::with_capacity(input.values.len());
    for pixel in input.values.chunks(channels.max(1)) {
        for c in 0..channels {
            let lo = c.saturating_sub(params.half_window);
            let hi = (c + params.half_window).min(channels - 1);
            let sum: f32 = pixel[lo..=hi].iter().map(|x| x * x).sum();
            scales.push(params.k + normed_alpha * sum);
        }
    }
    scales
}

fn op_lrn(input: &Dense, params: &LrnParams) -> Vec<f32> {
    lrn_scales(input, params)
        .into_iter()
        .zip(&input.values)
        .map(|(scale, &x)| x * scale.powf(-params.beta))
        .collect()
}

fn op_lrn_grad(input: &Dense, grad: &Dense, params: &LrnParams) -> Vec<f32> {
    let channels = input.dims[3];
    let window = (2 * params.half_window + 1) as f32;
    let coeff = 2.0 * params.alpha * params.beta / window;
    let scales = lrn_scales(input, params);
    let mut result = Vec::with_capacity(input.values.len());
    for (base, pixel) in (0..input.values.len())
        .step_by(channels.max(1))
        .zip(input.values.chunks(channels.max(1)))
    {
        // sum over neighbours j of g_j * y_j / scale_j, with y_j = x_j * scale_j^-beta
        let ratio: Vec<f32> = (0..channels)
            .map(|j| {
                let scale = scales[base + j];
                grad.values[base + j] * pixel[j] * scale.powf(-params.beta) / scale
            })
            .collect();
        for c in 0..channels {
            let lo = c.saturating_sub(params.half_window);
            let hi = (c + params.half_window).min(channels - 1);
            let neighbours: f32 = ratio[lo..=hi].iter().sum();
            let scale = scales[base + c];
            result.push(
                grad.values[base + c] * scale.powf(-params.beta) - coeff * pixel[c] * neighbours,
            );
        }
    }
    result
}

fn op_batched_matmul(lhs: &Dense, rhs: &Dense) -> BackendResult<Vec<f32>> {
    let (batch, rows, inner) = match lhs.dims.as_slice() {
        [n, a, b] => (*n, *a, *b),
        _ => return Err(BackendError::execution("batched matmul lhs must be rank 3")),
    };
    let (rhs_stride, cols) = match rhs.dims.as_slice() {
        [b, c] if *b == inner => (0, *c),
        [n, b, c] if *n == batch && *b == inner => (inner * *c, *c),
        _ => return Err(BackendError::execution("batched matmul rhs shape mismatch")),
    };
    let mut result = vec![0.0f32; batch * rows * cols];
    for n in 0..batch {
        let lhs_base = n * rows * inner;
        let rhs_base = n * rhs_stride;
        for i in 0..rows {
            for j in 0..cols {
                let mut acc = 0.0f32;
                for k in 0..inner {
                    acc += lhs.values[lhs_base + i * inner + k] * rhs.values[rhs_base + k * cols + j];
                }
                result[(n * rows + i) * cols + j] = acc;
            }
        }
    }
    Ok(result)
}

fn op_batched_reduce_add(batch: &Dense) -> Vec<f32> {
    let slice_len: usize = batch.dims[1..].iter().product();
    let mut result = vec![0.0f32; slice_len];
    for entry in batch.values.chunks(slice_len.max(1)) {
        for (acc, value) in result.iter_mut().zip(entry) {
            *acc += value;
        }
    }
    result
}

fn op_batched_arithmetic(
    batch: &Dense,
    slice: &Dense,
    mode: BatchedArithmeticMode,
) -> BackendResult<Vec<f32>> {
    let slice_len = slice.values.len();
    if slice_len == 0 || batch.values.len() % slice_len != 0 {
        return Err(BackendError::execution("slice does not tile the batch"));
    }
    Ok(batch
        .values
        .chunks(slice_len)
        .flat_map(|entry| {
            entry.iter().zip(&slice.values).map(move |(&x, &s)| match mode {
                BatchedArithmeticMode::Add => x + s,
                BatchedArithmeticMode::Mul => x * s,
            })
        })
        .collect())
}

fn op_transpose(
    memory: &mut ExecutionMemory<'_>,
    dst: BufferId,
    src: BufferId,
    perm: &[usize],
) -> BackendResult<()> {
    let input = memory.read(src)?;
    let in_dims = input.dims().to_vec();
    if perm.len() != in_dims.len() {
        return Err(BackendError::execution("transpose rank mismatch"));
    }
    let ty = memory.buffer_type(dst)?.clone();
    let out_dims = ty.dims().to_vec();
    let data = match input.into_data() {
        TensorData::Float(values) => {
            TensorData::Float(permute(&values, &in_dims, &out_dims, perm))
        }
        TensorData::Index(values) => {
            TensorData::Index(permute(&values, &in_dims, &out_dims, perm))
        }
    };
    let tensor =
        Tensor::from_data(ty, data).map_err(|err| BackendError::execution(err.to_string()))?;
    memory.write(dst, tensor)
}

fn permute<T: Copy + Default>(
    values: &[T],
    in_dims: &[usize],
    out_dims: &[usize],
    perm: &[usize],
) -> Vec<T> {
    let in_strides = compute_strides(in_dims);
    let mut result = vec![T::default(); values.len()];
    for (idx, slot) in result.iter_mut().enumerate() {
        let out_coord = unravel_index(idx, out_dims);
        let in_index: usize = out_coord
            .iter()
            .enumerate()
            .map(|(out_axis, &c)| c * in_strides[perm[out_axis]])
            .sum();
        *slot = values[in_index];
    }
    result
}

/// `g' = (l1 * sign(w) + l2 * w + g) / batch`; with momentum `gsum = m * gsum - lr * g'`
/// and `w += gsum`, otherwise `w -= lr * g'`.
fn op_sgd(
    weight: &mut [f32],
    grad: &[f32],
    gsum: &mut [f32],
    params: &SgdParams,
) -> BackendResult<()> {
    if weight.len() != grad.len() || weight.len() != gsum.len() {
        return Err(BackendError::execution("sgd operand sizes differ"));
    }
    let batch = params.batch_size.max(1) as f32;
    for ((w, &g), sum) in weight.iter_mut().zip(grad).zip(gsum.iter_mut()) {
        let sign = if *w > 0.0 {
            1.0
        } else if *w < 0.0 {
            -1.0
        } else {
            0.0
        };
        let gij = (params.l1_decay * sign + params.l2_decay * *w + g) / batch;
        if params.momentum > 0.0 {
            *sum = params.momentum * *sum - params.learning_rate * gij;
            *w += *sum;
        } else {
            *w -= params.learning_rate * gij;
        }
    }
    Ok(())
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}
