use bc_core::{DType, Literal, Params, Primitive, Shape, TensorValue, Value};
use std::str::FromStr;

use crate::EvalError;
use crate::type_promotion::{expect_arity, lane_extents, total_cmp_literal};

fn parse_list<T: FromStr>(primitive: Primitive, key: &str, raw: &str) -> Result<Vec<T>, EvalError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|s| {
            s.trim().parse::<T>().map_err(|_| EvalError::Unsupported {
                primitive,
                detail: format!("invalid value in param '{key}': '{s}'"),
            })
        })
        .collect()
}

fn required<'a>(primitive: Primitive, key: &str, params: &'a Params) -> Result<&'a str, EvalError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| EvalError::Unsupported {
            primitive,
            detail: format!("missing required param '{key}'"),
        })
}

/// Parse a comma-separated list of i64 values from a required param.
pub(crate) fn parse_i64_param(
    primitive: Primitive,
    key: &str,
    params: &Params,
) -> Result<Vec<i64>, EvalError> {
    parse_list(primitive, key, required(primitive, key, params)?)
}

/// Parse a comma-separated list of usize values from a required param.
pub(crate) fn parse_usize_param(
    primitive: Primitive,
    key: &str,
    params: &Params,
) -> Result<Vec<usize>, EvalError> {
    parse_list(primitive, key, required(primitive, key, params)?)
}

/// Like [`parse_usize_param`] but `None` when the param is absent.
pub(crate) fn parse_optional_usize_param(
    primitive: Primitive,
    key: &str,
    params: &Params,
) -> Result<Option<Vec<usize>>, EvalError> {
    params
        .get(key)
        .map(|raw| parse_list(primitive, key, raw))
        .transpose()
}

pub(crate) fn parse_axis_param(
    primitive: Primitive,
    key: &str,
    params: &Params,
    default: usize,
) -> Result<usize, EvalError> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<usize>().map_err(|_| EvalError::Unsupported {
            primitive,
            detail: format!("invalid axis in param '{key}': '{raw}'"),
        }),
    }
}

pub(crate) fn parse_bool_param(
    primitive: Primitive,
    key: &str,
    params: &Params,
) -> Result<bool, EvalError> {
    match params.get(key).map(|raw| raw.trim()) {
        None | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(EvalError::Unsupported {
            primitive,
            detail: format!("invalid bool in param '{key}': '{other}'"),
        }),
    }
}

pub(crate) fn parse_dtype_param(
    primitive: Primitive,
    key: &str,
    params: &Params,
) -> Result<Option<DType>, EvalError> {
    params
        .get(key)
        .map(|raw| {
            DType::parse(raw).ok_or_else(|| EvalError::Unsupported {
                primitive,
                detail: format!("unknown dtype in param '{key}': '{raw}'"),
            })
        })
        .transpose()
}

fn check_axis(primitive: Primitive, axis: usize, rank: usize) -> Result<(), EvalError> {
    if axis >= rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("axis {axis} out of bounds for rank {rank}"),
        });
    }
    Ok(())
}

/// Build a tensor by evaluating `element_at` for every output multi-index in
/// row-major order.
fn build_tensor(
    dtype: DType,
    shape: Shape,
    mut element_at: impl FnMut(&[usize]) -> Literal,
) -> Result<TensorValue, EvalError> {
    let count = shape.element_count_usize()?;
    let rank = shape.rank();
    let mut elements = Vec::with_capacity(count);
    let mut index = vec![0_usize; rank];
    for _ in 0..count {
        elements.push(element_at(&index));
        for dim in (0..rank).rev() {
            index[dim] += 1;
            if index[dim] < shape.dims[dim] as usize {
                break;
            }
            index[dim] = 0;
        }
    }
    Ok(TensorValue::new(dtype, shape, elements)?)
}

fn flat_index(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(i, s)| i * s).sum()
}

/// Reshape: change the shape of a tensor without changing its data.
/// Params: `new_shape` (comma-separated dims, -1 for a single inferred axis).
pub(crate) fn eval_reshape(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::Reshape;
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let spec = parse_i64_param(primitive, "new_shape", params)?;

    let inferred: Vec<usize> = spec
        .iter()
        .enumerate()
        .filter(|(_, dim)| **dim == -1)
        .map(|(idx, _)| idx)
        .collect();
    if inferred.len() > 1 || spec.iter().any(|&dim| dim < -1) {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("invalid new_shape {spec:?}"),
        });
    }
    let known: u64 = spec
        .iter()
        .filter(|&&dim| dim >= 0)
        .map(|&dim| dim as u64)
        .product();
    let total = tensor.len() as u64;
    let mut dims: Vec<u32> = spec.iter().map(|&dim| dim.max(0) as u32).collect();
    if let Some(&slot) = inferred.first() {
        if known == 0 || total % known != 0 {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("cannot infer -1 in new_shape {spec:?} for {total} elements"),
            });
        }
        dims[slot] = (total / known) as u32;
    }
    Ok(Value::Tensor(tensor.reshape(Shape { dims })?))
}

/// Squeeze: drop size-1 axes. Params: `dimensions`.
pub(crate) fn eval_squeeze(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::Squeeze;
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let dimensions = parse_usize_param(primitive, "dimensions", params)?;
    for &axis in &dimensions {
        check_axis(primitive, axis, tensor.rank())?;
        if tensor.shape.dims[axis] != 1 {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!(
                    "cannot squeeze axis {axis} of size {}",
                    tensor.shape.dims[axis]
                ),
            });
        }
    }
    let dims = tensor
        .shape
        .dims
        .iter()
        .enumerate()
        .filter(|(axis, _)| !dimensions.contains(axis))
        .map(|(_, &dim)| dim)
        .collect();
    Ok(Value::Tensor(tensor.reshape(Shape { dims })?))
}

/// Expand dims: insert size-1 axes. Params: `dimensions`, positions in the
/// output shape.
pub(crate) fn eval_expand_dims(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::ExpandDims;
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let mut dimensions = parse_usize_param(primitive, "dimensions", params)?;
    dimensions.sort_unstable();
    dimensions.dedup();
    let out_rank = tensor.rank() + dimensions.len();
    if let Some(&axis) = dimensions.last() {
        check_axis(primitive, axis, out_rank)?;
    }
    let mut source = tensor.shape.dims.iter();
    let dims = (0..out_rank)
        .map(|axis| {
            if dimensions.contains(&axis) {
                1
            } else {
                source.next().copied().unwrap_or(1)
            }
        })
        .collect();
    Ok(Value::Tensor(tensor.reshape(Shape { dims })?))
}

/// Broadcast: prepend new leading axes. Params: `sizes`.
pub(crate) fn eval_broadcast(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::Broadcast;
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let sizes = parse_usize_param(primitive, "sizes", params)?;
    let mut dims: Vec<u32> = sizes.iter().map(|&size| size as u32).collect();
    dims.extend_from_slice(&tensor.shape.dims);
    Ok(Value::Tensor(tensor.broadcast_to(&Shape { dims })?))
}

/// Broadcast in dim. Params: `shape`, `broadcast_dimensions` (strictly
/// increasing, one per operand axis; defaults to the trailing axes).
pub(crate) fn eval_broadcast_in_dim(
    inputs: &[Value],
    params: &Params,
) -> Result<Value, EvalError> {
    let primitive = Primitive::BroadcastInDim;
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let target = parse_usize_param(primitive, "shape", params)?;
    let rank = tensor.rank();
    let broadcast_dims = match parse_optional_usize_param(primitive, "broadcast_dimensions", params)? {
        Some(dims) => dims,
        None => (target.len().saturating_sub(rank)..target.len()).collect(),
    };

    let valid = broadcast_dims.len() == rank
        && broadcast_dims.windows(2).all(|pair| pair[0] < pair[1])
        && broadcast_dims.iter().all(|&axis| axis < target.len());
    if !valid {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!(
                "broadcast_dimensions {broadcast_dims:?} invalid for operand rank {rank} and shape {target:?}"
            ),
        });
    }

    let mut expanded = vec![1_u32; target.len()];
    for (axis, &out_axis) in broadcast_dims.iter().enumerate() {
        let dim = tensor.shape.dims[axis];
        if dim != 1 && dim as usize != target[out_axis] {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: tensor.shape.clone(),
                right: Shape {
                    dims: target.iter().map(|&d| d as u32).collect(),
                },
            });
        }
        expanded[out_axis] = dim;
    }
    let target_shape = Shape {
        dims: target.iter().map(|&d| d as u32).collect(),
    };
    let reshaped = tensor.reshape(Shape { dims: expanded })?;
    Ok(Value::Tensor(reshaped.broadcast_to(&target_shape)?))
}

/// Transpose. Params: `permutation` (defaults to reversing the axes).
pub(crate) fn eval_transpose(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::Transpose;
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let permutation = parse_optional_usize_param(primitive, "permutation", params)?
        .unwrap_or_else(|| (0..tensor.rank()).rev().collect());
    Ok(Value::Tensor(tensor.permute(&permutation)?))
}

/// Static slice. Params: `start_indices`, `limit_indices`, optional `strides`.
pub(crate) fn eval_slice(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::Slice;
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let rank = tensor.rank();
    let starts = parse_usize_param(primitive, "start_indices", params)?;
    let limits = parse_usize_param(primitive, "limit_indices", params)?;
    let strides = parse_optional_usize_param(primitive, "strides", params)?
        .unwrap_or_else(|| vec![1; rank]);
    if starts.len() != rank || limits.len() != rank || strides.len() != rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("slice params must have one entry per axis (rank {rank})"),
        });
    }

    let mut dims = Vec::with_capacity(rank);
    for axis in 0..rank {
        let size = tensor.shape.dims[axis] as usize;
        if starts[axis] > limits[axis] || limits[axis] > size || strides[axis] == 0 {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!(
                    "invalid slice [{}:{}:{}] for axis {axis} of size {size}",
                    starts[axis], limits[axis], strides[axis]
                ),
            });
        }
        dims.push((limits[axis] - starts[axis]).div_ceil(strides[axis]) as u32);
    }

    let source_strides = tensor.shape.strides();
    let mut source_index = vec![0_usize; rank];
    let sliced = build_tensor(tensor.dtype, Shape { dims }, |index| {
        for axis in 0..rank {
            source_index[axis] = starts[axis] + index[axis] * strides[axis];
        }
        tensor.elements[flat_index(&source_index, &source_strides)]
    })?;
    Ok(Value::Tensor(sliced))
}

/// Pad with a scalar value. Params: `padding_low`, `padding_high`, optional
/// `padding_interior`. Negative low/high padding crops.
pub(crate) fn eval_pad(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::Pad;
    expect_arity(primitive, inputs, 2)?;
    let tensor = inputs[0].to_tensor();
    let pad_literal = match &inputs[1] {
        Value::Scalar(literal) => *literal,
        Value::Tensor(pad) if pad.rank() == 0 && pad.dtype == tensor.dtype => pad.elements[0],
        Value::Tensor(_) => {
            return Err(EvalError::TypeMismatch {
                primitive,
                detail: "padding value must be a scalar of the operand dtype",
            });
        }
    };
    let pad_literal = tensor.dtype.quantize(pad_literal);

    let rank = tensor.rank();
    let lows = parse_i64_param(primitive, "padding_low", params)?;
    let highs = parse_i64_param(primitive, "padding_high", params)?;
    let interiors = if params.contains_key("padding_interior") {
        parse_i64_param(primitive, "padding_interior", params)?
    } else {
        vec![0; rank]
    };
    if lows.len() != rank || highs.len() != rank || interiors.len() != rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("padding config must have one entry per axis (rank {rank})"),
        });
    }
    if interiors.iter().any(|&interior| interior < 0) {
        return Err(EvalError::Unsupported {
            primitive,
            detail: "interior padding must be non-negative".to_owned(),
        });
    }

    let mut dims = Vec::with_capacity(rank);
    for axis in 0..rank {
        let size = i64::from(tensor.shape.dims[axis]);
        let dilated = if size == 0 {
            0
        } else {
            size + (size - 1) * interiors[axis]
        };
        let out = lows[axis] + dilated + highs[axis];
        if out < 0 {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("padding produces negative size on axis {axis}"),
            });
        }
        dims.push(out as u32);
    }

    let source_strides = tensor.shape.strides();
    let padded = build_tensor(tensor.dtype, Shape { dims }, |index| {
        let mut offset = 0_usize;
        for axis in 0..rank {
            let pos = index[axis] as i64 - lows[axis];
            let step = interiors[axis] + 1;
            if pos < 0 || pos % step != 0 {
                return pad_literal;
            }
            let source = pos / step;
            if source >= i64::from(tensor.shape.dims[axis]) {
                return pad_literal;
            }
            offset += source as usize * source_strides[axis];
        }
        tensor.elements[offset]
    })?;
    Ok(Value::Tensor(padded))
}

/// Concatenate along an existing axis. Params: `dimension`.
pub(crate) fn eval_concatenate(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::Concatenate;
    if inputs.is_empty() {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 1,
            actual: 0,
        });
    }
    let tensors: Vec<TensorValue> = inputs.iter().map(Value::to_tensor).collect();
    let first = &tensors[0];
    let axis = parse_axis_param(primitive, "dimension", params, 0)?;
    check_axis(primitive, axis, first.rank())?;

    let mut total = 0_u32;
    for tensor in &tensors {
        if tensor.dtype != first.dtype {
            return Err(EvalError::TypeMismatch {
                primitive,
                detail: "operand dtypes differ",
            });
        }
        let compatible = tensor.rank() == first.rank()
            && tensor
                .shape
                .dims
                .iter()
                .zip(&first.shape.dims)
                .enumerate()
                .all(|(idx, (a, b))| idx == axis || a == b);
        if !compatible {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: first.shape.clone(),
                right: tensor.shape.clone(),
            });
        }
        total += tensor.shape.dims[axis];
    }

    let mut dims = first.shape.dims.clone();
    dims[axis] = total;
    let (outer, _, inner) = lane_extents(&first.shape, axis);
    let mut elements = Vec::new();
    for block in 0..outer {
        for tensor in &tensors {
            let slab = tensor.shape.dims[axis] as usize * inner;
            elements.extend_from_slice(&tensor.elements[block * slab..(block + 1) * slab]);
        }
    }
    Ok(Value::Tensor(TensorValue::new(
        first.dtype,
        Shape { dims },
        elements,
    )?))
}

/// Reverse along the given axes. Params: `dimensions`.
pub(crate) fn eval_rev(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::Rev;
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let rank = tensor.rank();
    let dimensions = parse_usize_param(primitive, "dimensions", params)?;
    for &axis in &dimensions {
        check_axis(primitive, axis, rank)?;
    }
    let source_strides = tensor.shape.strides();
    let mut source_index = vec![0_usize; rank];
    let reversed = build_tensor(tensor.dtype, tensor.shape.clone(), |index| {
        for axis in 0..rank {
            source_index[axis] = if dimensions.contains(&axis) {
                tensor.shape.dims[axis] as usize - 1 - index[axis]
            } else {
                index[axis]
            };
        }
        tensor.elements[flat_index(&source_index, &source_strides)]
    })?;
    Ok(Value::Tensor(reversed))
}

/// Stable ordering of every lane along `dimension`; returns per-lane source
/// positions.
fn sort_permutation(
    primitive: Primitive,
    tensor: &TensorValue,
    params: &Params,
) -> Result<(usize, Vec<usize>), EvalError> {
    if tensor.dtype.is_complex() {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "complex values are unordered",
        });
    }
    let rank = tensor.rank();
    if rank == 0 {
        return Err(EvalError::Unsupported {
            primitive,
            detail: "cannot sort a rank-0 value".to_owned(),
        });
    }
    let axis = parse_axis_param(primitive, "dimension", params, rank - 1)?;
    check_axis(primitive, axis, rank)?;
    let descending = parse_bool_param(primitive, "descending", params)?;

    let (outer, len, inner) = lane_extents(&tensor.shape, axis);
    let mut order = vec![0_usize; tensor.len()];
    let mut lane: Vec<usize> = Vec::with_capacity(len);
    for block in 0..outer {
        for col in 0..inner {
            let at = |k: usize| (block * len + k) * inner + col;
            lane.clear();
            lane.extend(0..len);
            lane.sort_by(|&a, &b| {
                let ordering =
                    total_cmp_literal(tensor.dtype, tensor.elements[at(a)], tensor.elements[at(b)]);
                if descending { ordering.reverse() } else { ordering }
            });
            for (k, &source) in lane.iter().enumerate() {
                order[at(k)] = source;
            }
        }
    }
    Ok((axis, order))
}

/// Sort along `dimension` (default last). Params: `dimension`, `descending`.
pub(crate) fn eval_sort(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::Sort;
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let (axis, order) = sort_permutation(primitive, &tensor, params)?;
    let (_, len, inner) = lane_extents(&tensor.shape, axis);
    let elements = order
        .iter()
        .enumerate()
        .map(|(flat, &source)| {
            let col = flat % inner;
            let block = flat / (len * inner);
            tensor.elements[(block * len + source) * inner + col]
        })
        .collect();
    Ok(Value::Tensor(TensorValue::new(
        tensor.dtype,
        tensor.shape.clone(),
        elements,
    )?))
}

/// Indices that sort along `dimension`. Params: `dimension`, `descending`,
/// `index_dtype` (default int32).
pub(crate) fn eval_argsort(inputs: &[Value], params: &Params) -> Result<Value, EvalError> {
    let primitive = Primitive::Argsort;
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let index_dtype = parse_dtype_param(primitive, "index_dtype", params)?.unwrap_or(DType::I32);
    let (_, order) = sort_permutation(primitive, &tensor, params)?;
    let elements = order
        .iter()
        .map(|&source| index_dtype.literal_from_i128(source as i128))
        .collect();
    Ok(Value::Tensor(TensorValue::new(
        index_dtype,
        tensor.shape.clone(),
        elements,
    )?))
}
