//! Batch-dimension propagation through individual primitives.
//!
//! Each rule receives tracers whose batch axis may sit anywhere (or be
//! absent), moves batched operands so the batch axis leads, rewrites the
//! primitive's axis parameters for the extra leading dimension, and
//! evaluates once. Rules that cannot be expressed structurally fall back to
//! evaluating the primitive slice by slice.

use bc_core::{
    Atom, Params, Primitive, Program, Shape, TensorValue, Value, ValueError, VarId, format_csv,
};
use bc_interpreters::InterpreterError;
use bc_lax::{EvalError, eval_primitive};
use log::trace;
use rustc_hash::FxHashMap;

// ── BatchTracer ────────────────────────────────────────────────────

/// A value carrying an optional batch dimension.
///
/// When `batch_dim` is `Some(i)`, axis `i` of `value` enumerates the batch.
/// When it is `None`, the value is shared by every batch element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTracer {
    pub value: Value,
    pub batch_dim: Option<usize>,
}

impl BatchTracer {
    #[must_use]
    pub fn batched(value: Value, batch_dim: usize) -> Self {
        Self {
            value,
            batch_dim: Some(batch_dim),
        }
    }

    #[must_use]
    pub fn unbatched(value: Value) -> Self {
        Self {
            value,
            batch_dim: None,
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.value.rank()
    }

    /// Rank of one batch element.
    #[must_use]
    pub fn example_rank(&self) -> usize {
        match self.batch_dim {
            Some(_) => self.rank().saturating_sub(1),
            None => self.rank(),
        }
    }

    #[must_use]
    pub fn batch_size(&self) -> Option<usize> {
        let axis = self.batch_dim?;
        self.value
            .as_tensor()
            .and_then(|tensor| tensor.shape.dims.get(axis))
            .map(|&dim| dim as usize)
    }
}

// ── Batching Errors ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Batch dimension out of bounds.
    BatchDimOutOfBounds { batch_dim: usize, rank: usize },
    /// Batched operands disagree on the batch size.
    MismatchedBatchSize {
        arg_index: usize,
        expected: usize,
        actual: usize,
    },
    /// No operand is batched and no explicit axis size was given.
    UnknownBatchSize,
    /// `in_axes` does not have one entry per argument.
    AxesCountMismatch { expected: usize, actual: usize },
    InputArity { expected: usize, actual: usize },
    MissingVariable(VarId),
    UnexpectedOutputArity { primitive: Primitive, actual: usize },
    /// Evaluation error from the underlying primitive.
    Eval(EvalError),
    /// Tensor construction or layout error.
    Tensor(ValueError),
    /// Error from the unbatched interpreter.
    Interpreter(InterpreterError),
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BatchDimOutOfBounds { batch_dim, rank } => {
                write!(
                    f,
                    "batch dimension {} out of bounds for rank {}",
                    batch_dim, rank
                )
            }
            Self::MismatchedBatchSize {
                arg_index,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "argument {} has batch size {}, expected {}",
                    arg_index, actual, expected
                )
            }
            Self::UnknownBatchSize => {
                write!(f, "no batched argument and no explicit axis size")
            }
            Self::AxesCountMismatch { expected, actual } => {
                write!(
                    f,
                    "in_axes has {} entries, expected one per argument ({})",
                    actual, expected
                )
            }
            Self::InputArity { expected, actual } => {
                write!(
                    f,
                    "input arity mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::MissingVariable(var) => write!(f, "missing variable v{}", var.0),
            Self::UnexpectedOutputArity { primitive, actual } => write!(
                f,
                "expected single-output primitive {}, got {} outputs",
                primitive.as_str(),
                actual
            ),
            Self::Eval(err) => write!(f, "batch eval error: {err}"),
            Self::Tensor(err) => write!(f, "batch tensor error: {err}"),
            Self::Interpreter(err) => write!(f, "batch interpreter error: {err}"),
        }
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Eval(err) => Some(err),
            Self::Tensor(err) => Some(err),
            Self::Interpreter(err) => Some(err),
            _ => None,
        }
    }
}

impl From<EvalError> for BatchError {
    fn from(value: EvalError) -> Self {
        Self::Eval(value)
    }
}

impl From<ValueError> for BatchError {
    fn from(value: ValueError) -> Self {
        Self::Tensor(value)
    }
}

impl From<InterpreterError> for BatchError {
    fn from(value: InterpreterError) -> Self {
        Self::Interpreter(value)
    }
}

// ── Batch Dimension Manipulation ───────────────────────────────────

/// Move the batch dimension of a value to position 0.
/// Returns the value unchanged if `batch_dim` is already 0.
pub fn move_batch_dim_to_front(value: &Value, batch_dim: usize) -> Result<Value, BatchError> {
    let rank = value.rank();
    if batch_dim >= rank {
        return Err(BatchError::BatchDimOutOfBounds { batch_dim, rank });
    }
    if batch_dim == 0 {
        return Ok(value.clone());
    }
    Ok(Value::Tensor(value.to_tensor().move_axis(batch_dim, 0)?))
}

/// Move the batch dimension from position 0 to `target_dim`.
pub fn move_batch_dim_from_front(value: &Value, target_dim: usize) -> Result<Value, BatchError> {
    let rank = value.rank();
    if target_dim >= rank {
        return Err(BatchError::BatchDimOutOfBounds {
            batch_dim: target_dim,
            rank,
        });
    }
    if target_dim == 0 {
        return Ok(value.clone());
    }
    Ok(Value::Tensor(value.to_tensor().move_axis(0, target_dim)?))
}

/// Replicate an unbatched value `batch_size` times along a new axis at
/// `batch_dim`.
pub fn broadcast_unbatched(
    value: &Value,
    batch_size: usize,
    batch_dim: usize,
) -> Result<Value, BatchError> {
    let tensor = value.to_tensor();
    let with_unit_axis = tensor.shape.with_inserted_axis(batch_dim, 1)?;
    let target = tensor.shape.with_inserted_axis(batch_dim, batch_size as u32)?;
    Ok(Value::Tensor(
        tensor.reshape(with_unit_axis)?.broadcast_to(&target)?,
    ))
}

/// Batched operand as a tensor with the batch axis leading.
fn leading(tracer: &BatchTracer) -> Result<TensorValue, BatchError> {
    match tracer.batch_dim {
        Some(axis) => Ok(move_batch_dim_to_front(&tracer.value, axis)?.into_tensor()),
        None => Ok(tracer.value.to_tensor()),
    }
}

fn common_batch_size(inputs: &[BatchTracer]) -> Result<Option<usize>, BatchError> {
    let mut size: Option<usize> = None;
    for (arg_index, tracer) in inputs.iter().enumerate() {
        let Some(axis) = tracer.batch_dim else {
            continue;
        };
        let actual = tracer.batch_size().ok_or(BatchError::BatchDimOutOfBounds {
            batch_dim: axis,
            rank: tracer.rank(),
        })?;
        match size {
            None => size = Some(actual),
            Some(expected) if expected != actual => {
                return Err(BatchError::MismatchedBatchSize {
                    arg_index,
                    expected,
                    actual,
                });
            }
            Some(_) => {}
        }
    }
    Ok(size)
}

fn eval_tensor(
    primitive: Primitive,
    inputs: &[Value],
    params: &Params,
) -> Result<TensorValue, BatchError> {
    Ok(eval_primitive(primitive, inputs, params)?.into_tensor())
}

fn shifted(axes: &[usize]) -> Vec<usize> {
    axes.iter().map(|&axis| axis + 1).collect()
}

fn parse_usize_list(raw: &str) -> Option<Vec<usize>> {
    if raw.trim().is_empty() {
        return Some(Vec::new());
    }
    raw.split(',')
        .map(|item| item.trim().parse::<usize>().ok())
        .collect()
}

const AXIS_LIST_KEYS: [&str; 9] = [
    "axes",
    "dimensions",
    "permutation",
    "shape",
    "broadcast_dimensions",
    "sizes",
    "start_indices",
    "limit_indices",
    "strides",
];

/// Whether an axis-valued parameter fails to parse. Such equations take the
/// loop path so the primitive reports its own error.
fn has_malformed_axis_params(params: &Params) -> bool {
    let bad_list = AXIS_LIST_KEYS
        .iter()
        .filter_map(|key| params.get(*key))
        .any(|raw| parse_usize_list(raw).is_none());
    let bad_axis = ["axis", "dimension"]
        .iter()
        .filter_map(|key| params.get(*key))
        .any(|raw| raw.trim().parse::<usize>().is_err());
    bad_list || bad_axis
}

fn param_usize_list(params: &Params, key: &str) -> Option<Vec<usize>> {
    params.get(key).and_then(|raw| parse_usize_list(raw))
}

fn param_usize(params: &Params, key: &str) -> Option<usize> {
    params.get(key).and_then(|raw| raw.trim().parse().ok())
}

// ── Rule Dispatch ──────────────────────────────────────────────────

/// Apply the batching rule for `primitive` to batched inputs.
pub fn apply_batch_rule(
    primitive: Primitive,
    inputs: &[BatchTracer],
    params: &Params,
) -> Result<BatchTracer, BatchError> {
    if inputs.iter().all(|tracer| tracer.batch_dim.is_none()) {
        let values: Vec<Value> = inputs.iter().map(|tracer| tracer.value.clone()).collect();
        return Ok(BatchTracer::unbatched(eval_primitive(
            primitive, &values, params,
        )?));
    }

    if has_malformed_axis_params(params) {
        return batch_by_loop(primitive, inputs, params);
    }

    match primitive {
        p if p.is_elementwise() => batch_elementwise(primitive, inputs, params),
        Primitive::Dot => batch_dot(inputs, params),
        Primitive::Pad => batch_pad(inputs, params),
        Primitive::Concatenate => batch_concatenate(inputs, params),
        // The remaining rules rewrite a single operand.
        _ if inputs.len() != 1 => batch_by_loop(primitive, inputs, params),
        Primitive::ReduceSum
        | Primitive::ReduceProd
        | Primitive::ReduceMax
        | Primitive::ReduceMin => batch_reduce(primitive, inputs, params),
        Primitive::Argmax | Primitive::Argmin => {
            batch_single_axis(primitive, inputs, params, "axis", |_| 0)
        }
        Primitive::Cumsum | Primitive::Cumprod | Primitive::Cummax | Primitive::Cummin => {
            batch_single_axis(primitive, inputs, params, "axis", |_| 0)
        }
        Primitive::Sort | Primitive::Argsort => {
            batch_single_axis(primitive, inputs, params, "dimension", |rank| {
                rank.saturating_sub(1)
            })
        }
        Primitive::Rev | Primitive::Squeeze | Primitive::ExpandDims => {
            batch_axis_list(primitive, inputs, params, "dimensions")
        }
        Primitive::Reshape => batch_reshape(inputs, params),
        Primitive::Broadcast => batch_broadcast(inputs, params),
        Primitive::BroadcastInDim => batch_broadcast_in_dim(inputs, params),
        Primitive::Transpose => batch_transpose(inputs, params),
        Primitive::Slice => batch_slice(inputs, params),
        _ => batch_by_loop(primitive, inputs, params),
    }
}

// ── Elementwise ────────────────────────────────────────────────────

/// Batched operands move their batch axis to the front and gain unit axes
/// up to the widest example rank; unbatched operands stay as they are and
/// broadcast from the right.
fn batch_elementwise(
    primitive: Primitive,
    inputs: &[BatchTracer],
    params: &Params,
) -> Result<BatchTracer, BatchError> {
    let out_rank = inputs
        .iter()
        .map(BatchTracer::example_rank)
        .max()
        .unwrap_or(0);

    let mut operands = Vec::with_capacity(inputs.len());
    for tracer in inputs {
        if tracer.batch_dim.is_none() {
            operands.push(tracer.value.clone());
            continue;
        }
        let tensor = leading(tracer)?;
        let mut dims = Vec::with_capacity(out_rank + 1);
        dims.push(tensor.shape.dims[0]);
        dims.extend(std::iter::repeat_n(1, out_rank - tracer.example_rank()));
        dims.extend_from_slice(&tensor.shape.dims[1..]);
        operands.push(Value::Tensor(tensor.reshape(Shape { dims })?));
    }

    let result = eval_primitive(primitive, &operands, params)?;
    Ok(BatchTracer::batched(result, 0))
}

// ── Reductions and axis-parameterized primitives ───────────────────

fn batch_reduce(
    primitive: Primitive,
    inputs: &[BatchTracer],
    params: &Params,
) -> Result<BatchTracer, BatchError> {
    let input = &inputs[0];
    if input.example_rank() == 0 {
        return batch_by_loop(primitive, inputs, params);
    }
    let value = leading(input)?;
    let axes = match param_usize_list(params, "axes") {
        Some(axes) if !axes.is_empty() => axes,
        _ => (0..input.example_rank()).collect(),
    };

    let mut new_params = params.clone();
    new_params.insert("axes".to_owned(), format_csv(&shifted(&axes)));
    let result = eval_primitive(primitive, &[Value::Tensor(value)], &new_params)?;
    Ok(BatchTracer::batched(result, 0))
}

/// Rules for primitives parameterized by one axis (`axis` or `dimension`).
fn batch_single_axis(
    primitive: Primitive,
    inputs: &[BatchTracer],
    params: &Params,
    key: &str,
    default: impl Fn(usize) -> usize,
) -> Result<BatchTracer, BatchError> {
    let input = &inputs[0];
    if input.example_rank() == 0 {
        return batch_by_loop(primitive, inputs, params);
    }
    let value = leading(input)?;
    let axis = param_usize(params, key).unwrap_or_else(|| default(input.example_rank()));

    let mut new_params = params.clone();
    new_params.insert(key.to_owned(), (axis + 1).to_string());
    let result = eval_primitive(primitive, &[Value::Tensor(value)], &new_params)?;
    Ok(BatchTracer::batched(result, 0))
}

fn batch_axis_list(
    primitive: Primitive,
    inputs: &[BatchTracer],
    params: &Params,
    key: &str,
) -> Result<BatchTracer, BatchError> {
    let Some(axes) = param_usize_list(params, key) else {
        return batch_by_loop(primitive, inputs, params);
    };
    let value = leading(&inputs[0])?;
    let mut new_params = params.clone();
    new_params.insert(key.to_owned(), format_csv(&shifted(&axes)));
    let result = eval_primitive(primitive, &[Value::Tensor(value)], &new_params)?;
    Ok(BatchTracer::batched(result, 0))
}

// ── Shape manipulation ─────────────────────────────────────────────

fn batch_reshape(inputs: &[BatchTracer], params: &Params) -> Result<BatchTracer, BatchError> {
    let value = leading(&inputs[0])?;
    let batch_size = value.shape.dims[0];
    let example = value.shape.with_removed_axis(0)?;

    // Resolve -1 against one example so an empty batch stays well defined.
    let resolved = eval_tensor(
        Primitive::Reshape,
        &[Value::Tensor(TensorValue::zeros(value.dtype, example)?)],
        params,
    )?;
    let mut dims = Vec::with_capacity(resolved.rank() + 1);
    dims.push(batch_size);
    dims.extend_from_slice(&resolved.shape.dims);
    Ok(BatchTracer::batched(
        Value::Tensor(value.reshape(Shape { dims })?),
        0,
    ))
}

fn batch_broadcast(inputs: &[BatchTracer], params: &Params) -> Result<BatchTracer, BatchError> {
    let Some(sizes) = param_usize_list(params, "sizes") else {
        return batch_by_loop(Primitive::Broadcast, inputs, params);
    };
    let value = leading(&inputs[0])?;
    let example_rank = value.rank() - 1;

    let mut shape = vec![value.shape.dims[0] as usize];
    shape.extend_from_slice(&sizes);
    shape.extend(value.shape.dims[1..].iter().map(|&dim| dim as usize));
    let mut broadcast_dims = vec![0_usize];
    broadcast_dims.extend((0..example_rank).map(|axis| axis + 1 + sizes.len()));

    let new_params = Params::from([
        ("shape".to_owned(), format_csv(&shape)),
        ("broadcast_dimensions".to_owned(), format_csv(&broadcast_dims)),
    ]);
    let result = eval_primitive(Primitive::BroadcastInDim, &[Value::Tensor(value)], &new_params)?;
    Ok(BatchTracer::batched(result, 0))
}

fn batch_broadcast_in_dim(
    inputs: &[BatchTracer],
    params: &Params,
) -> Result<BatchTracer, BatchError> {
    let input = &inputs[0];
    let Some(target) = param_usize_list(params, "shape") else {
        return batch_by_loop(Primitive::BroadcastInDim, inputs, params);
    };
    let value = leading(input)?;
    let example_rank = input.example_rank();
    let broadcast_dims = param_usize_list(params, "broadcast_dimensions").unwrap_or_else(|| {
        (target.len().saturating_sub(example_rank)..target.len()).collect()
    });

    let mut shape = vec![value.shape.dims[0] as usize];
    shape.extend_from_slice(&target);
    let mut new_dims = vec![0_usize];
    new_dims.extend(shifted(&broadcast_dims));

    let mut new_params = params.clone();
    new_params.insert("shape".to_owned(), format_csv(&shape));
    new_params.insert("broadcast_dimensions".to_owned(), format_csv(&new_dims));
    let result = eval_primitive(Primitive::BroadcastInDim, &[Value::Tensor(value)], &new_params)?;
    Ok(BatchTracer::batched(result, 0))
}

fn batch_transpose(inputs: &[BatchTracer], params: &Params) -> Result<BatchTracer, BatchError> {
    let input = &inputs[0];
    let value = leading(input)?;
    let permutation = param_usize_list(params, "permutation")
        .unwrap_or_else(|| (0..input.example_rank()).rev().collect());

    let mut new_perm = vec![0_usize];
    new_perm.extend(shifted(&permutation));
    let new_params = Params::from([("permutation".to_owned(), format_csv(&new_perm))]);
    let result = eval_primitive(Primitive::Transpose, &[Value::Tensor(value)], &new_params)?;
    Ok(BatchTracer::batched(result, 0))
}

fn batch_slice(inputs: &[BatchTracer], params: &Params) -> Result<BatchTracer, BatchError> {
    let value = leading(&inputs[0])?;
    let batch_size = value.shape.dims[0] as usize;
    let mut new_params = params.clone();
    let prefix = |key: &str, lead: usize| {
        params.get(key).map(|raw| {
            if raw.trim().is_empty() {
                lead.to_string()
            } else {
                format!("{lead},{raw}")
            }
        })
    };
    for (key, lead) in [
        ("start_indices", 0),
        ("limit_indices", batch_size),
        ("strides", 1),
    ] {
        if let Some(raw) = prefix(key, lead) {
            new_params.insert(key.to_owned(), raw);
        }
    }
    let result = eval_primitive(Primitive::Slice, &[Value::Tensor(value)], &new_params)?;
    Ok(BatchTracer::batched(result, 0))
}

fn batch_pad(inputs: &[BatchTracer], params: &Params) -> Result<BatchTracer, BatchError> {
    // A batched padding value differs per example; no single pad covers it.
    if inputs.len() != 2 || inputs[0].batch_dim.is_none() || inputs[1].batch_dim.is_some() {
        return batch_by_loop(Primitive::Pad, inputs, params);
    }
    let value = leading(&inputs[0])?;
    let mut new_params = params.clone();
    for key in ["padding_low", "padding_high", "padding_interior"] {
        if let Some(raw) = params.get(key) {
            let joined = if raw.trim().is_empty() {
                "0".to_owned()
            } else {
                format!("0,{raw}")
            };
            new_params.insert(key.to_owned(), joined);
        }
    }
    let result = eval_primitive(
        Primitive::Pad,
        &[Value::Tensor(value), inputs[1].value.clone()],
        &new_params,
    )?;
    Ok(BatchTracer::batched(result, 0))
}

fn batch_concatenate(inputs: &[BatchTracer], params: &Params) -> Result<BatchTracer, BatchError> {
    let batch_size = common_batch_size(inputs)?.unwrap_or(0);
    let operands = inputs
        .iter()
        .map(|tracer| match tracer.batch_dim {
            Some(_) => leading(tracer).map(Value::Tensor),
            None => broadcast_unbatched(&tracer.value, batch_size, 0),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let dimension = param_usize(params, "dimension").unwrap_or(0);
    let mut new_params = params.clone();
    new_params.insert("dimension".to_owned(), (dimension + 1).to_string());
    let result = eval_primitive(Primitive::Concatenate, &operands, &new_params)?;
    Ok(BatchTracer::batched(result, 0))
}

// ── Dot ────────────────────────────────────────────────────────────

/// One-sided batching folds the batch axis into a matrix dimension of the
/// batched operand; two-sided batching loops.
fn batch_dot(inputs: &[BatchTracer], params: &Params) -> Result<BatchTracer, BatchError> {
    if inputs.len() != 2 {
        return batch_by_loop(Primitive::Dot, inputs, params);
    }
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let dot = |a: TensorValue, b: TensorValue| {
        eval_tensor(Primitive::Dot, &[Value::Tensor(a), Value::Tensor(b)], params)
    };

    match (lhs.batch_dim, rhs.batch_dim) {
        (Some(_), None) => {
            let batched = leading(lhs)?;
            let other = rhs.value.to_tensor();
            let batch = batched.shape.dims[0];
            match batched.shape.dims[1..] {
                // [B,n] . [n] -> [B];  [B,n] . [n,m] -> [B,m]
                [_] => Ok(BatchTracer::batched(Value::Tensor(dot(batched, other)?), 0)),
                // [B,k,n] -> [B*k,n], then split the leading axis back out
                [k, n] => {
                    let folded = batched.reshape(Shape::new(&[batch * k, n]))?;
                    let out = dot(folded, other)?;
                    let mut dims = vec![batch, k];
                    dims.extend_from_slice(&out.shape.dims[1..]);
                    Ok(BatchTracer::batched(
                        Value::Tensor(out.reshape(Shape { dims })?),
                        0,
                    ))
                }
                _ => batch_by_loop(Primitive::Dot, inputs, params),
            }
        }
        (None, Some(_)) => {
            let batched = leading(rhs)?;
            let other = lhs.value.to_tensor();
            let batch = batched.shape.dims[0];
            match (other.rank(), &batched.shape.dims[1..]) {
                // [n] . [B,n] -> [B]
                (1, [_]) => Ok(BatchTracer::batched(Value::Tensor(dot(batched, other)?), 0)),
                // [k,n] . [B,n]^T -> [k,B] -> [B,k]
                (2, [_]) => {
                    let out = dot(other, batched.permute(&[1, 0])?)?;
                    Ok(BatchTracer::batched(Value::Tensor(out.permute(&[1, 0])?), 0))
                }
                // [n] or [k,n] . [n,B*m] -> [B*m] or [k,B*m]
                (1 | 2, [n, m]) => {
                    let (n, m) = (*n, *m);
                    let folded = batched
                        .move_axis(0, 1)?
                        .reshape(Shape::new(&[n, batch * m]))?;
                    let out = dot(other.clone(), folded)?;
                    if other.rank() == 1 {
                        let out = out.reshape(Shape::new(&[batch, m]))?;
                        Ok(BatchTracer::batched(Value::Tensor(out), 0))
                    } else {
                        let k = other.shape.dims[0];
                        let out = out.reshape(Shape::new(&[k, batch, m]))?.move_axis(1, 0)?;
                        Ok(BatchTracer::batched(Value::Tensor(out), 0))
                    }
                }
                _ => batch_by_loop(Primitive::Dot, inputs, params),
            }
        }
        _ => batch_by_loop(Primitive::Dot, inputs, params),
    }
}

// ── Loop-and-stack fallback ────────────────────────────────────────

/// Evaluate the primitive once per batch element and stack the results.
///
/// An empty batch evaluates once on zero-filled examples to learn the
/// output shape and dtype.
pub(crate) fn batch_by_loop(
    primitive: Primitive,
    inputs: &[BatchTracer],
    params: &Params,
) -> Result<BatchTracer, BatchError> {
    let batch_size = common_batch_size(inputs)?.unwrap_or(0);
    trace!("loop fallback for {primitive} over {batch_size} elements");

    if batch_size == 0 {
        let template_inputs = inputs
            .iter()
            .map(|tracer| match tracer.batch_dim {
                Some(axis) => {
                    let tensor = tracer.value.to_tensor();
                    let example = tensor.shape.with_removed_axis(axis)?;
                    Ok(Value::Tensor(TensorValue::zeros(tensor.dtype, example)?))
                }
                None => Ok(tracer.value.clone()),
            })
            .collect::<Result<Vec<_>, BatchError>>()?;
        let template = eval_tensor(primitive, &template_inputs, params)?;
        let empty = TensorValue::stack_axis0_with_template(&[], template.dtype, &template.shape)?;
        return Ok(BatchTracer::batched(Value::Tensor(empty), 0));
    }

    let mut results = Vec::with_capacity(batch_size);
    for index in 0..batch_size {
        let slice_inputs = inputs
            .iter()
            .map(|tracer| match tracer.batch_dim {
                Some(axis) => Ok(Value::Tensor(
                    tracer.value.to_tensor().slice_along_axis(axis, index)?,
                )),
                None => Ok(tracer.value.clone()),
            })
            .collect::<Result<Vec<_>, BatchError>>()?;
        results.push(eval_primitive(primitive, &slice_inputs, params)?);
    }
    Ok(BatchTracer::batched(
        Value::Tensor(TensorValue::stack_axis0(&results)?),
        0,
    ))
}

// ── Batch Evaluation of a Program ──────────────────────────────────

/// Evaluate a program on batch tracers, propagating batch dimensions
/// through each equation via batching rules.
pub fn batch_eval_program(
    program: &Program,
    args: &[BatchTracer],
) -> Result<Vec<BatchTracer>, BatchError> {
    if args.len() != program.invars.len() {
        return Err(BatchError::InputArity {
            expected: program.invars.len(),
            actual: args.len(),
        });
    }
    program
        .validate_well_formed()
        .map_err(|err| BatchError::Interpreter(InterpreterError::InvalidProgram(err)))?;

    let mut env: FxHashMap<VarId, BatchTracer> = FxHashMap::with_capacity_and_hasher(
        program.invars.len() + program.equations.len(),
        Default::default(),
    );
    for (var, arg) in program.invars.iter().zip(args) {
        env.insert(*var, arg.clone());
    }

    for eqn in &program.equations {
        if eqn.outputs.len() != 1 {
            return Err(BatchError::UnexpectedOutputArity {
                primitive: eqn.primitive,
                actual: eqn.outputs.len(),
            });
        }
        let inputs = eqn
            .inputs
            .iter()
            .map(|atom| match atom {
                Atom::Var(var) => env
                    .get(var)
                    .cloned()
                    .ok_or(BatchError::MissingVariable(*var)),
                Atom::Lit(lit) => Ok(BatchTracer::unbatched(Value::Scalar(*lit))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let result = apply_batch_rule(eqn.primitive, &inputs, &eqn.params)?;
        trace!(
            "batch {} -> v{} shape={} batch_dim={:?}",
            eqn.primitive,
            eqn.outputs[0].0,
            result.value.shape(),
            result.batch_dim
        );
        env.insert(eqn.outputs[0], result);
    }

    program
        .outvars
        .iter()
        .map(|var| {
            env.get(var)
                .cloned()
                .ok_or(BatchError::MissingVariable(*var))
        })
        .collect()
}
