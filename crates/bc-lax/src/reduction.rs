use bc_core::{DType, Literal, Params, Primitive, Shape, TensorValue, Value};

use crate::EvalError;
use crate::tensor_ops::{
    parse_axis_param, parse_bool_param, parse_dtype_param, parse_optional_usize_param,
};
use crate::type_promotion::{
    expect_arity, int_of, lane_extents, nan_max, nan_min, real_of, total_cmp_literal,
};

#[derive(Debug, Clone, Copy)]
pub(crate) enum ReduceKind {
    Sum,
    Prod,
    Max,
    Min,
}

impl ReduceKind {
    fn int_init(self, dtype: DType) -> i128 {
        let (lo, hi) = dtype.integer_range().unwrap_or((i128::MIN, i128::MAX));
        match self {
            Self::Sum => 0,
            Self::Prod => 1,
            Self::Max => lo,
            Self::Min => hi,
        }
    }

    fn float_init(self) -> f64 {
        match self {
            Self::Sum => 0.0,
            Self::Prod => 1.0,
            Self::Max => f64::NEG_INFINITY,
            Self::Min => f64::INFINITY,
        }
    }

    fn int_step(self, acc: i128, value: i128) -> i128 {
        match self {
            Self::Sum => acc.wrapping_add(value),
            Self::Prod => acc.wrapping_mul(value),
            Self::Max => acc.max(value),
            Self::Min => acc.min(value),
        }
    }

    fn float_step(self, acc: f64, value: f64) -> f64 {
        match self {
            Self::Sum => acc + value,
            Self::Prod => acc * value,
            Self::Max => nan_max(acc, value),
            Self::Min => nan_min(acc, value),
        }
    }
}

fn reduce_literals(
    primitive: Primitive,
    kind: ReduceKind,
    dtype: DType,
    literals: impl Iterator<Item = Literal>,
) -> Result<Literal, EvalError> {
    if dtype.is_floating() {
        let mut acc = kind.float_init();
        for literal in literals {
            acc = kind.float_step(acc, real_of(primitive, literal)?);
        }
        Ok(dtype.literal_from_f64(acc))
    } else {
        let mut acc = kind.int_init(dtype);
        for literal in literals {
            acc = kind.int_step(acc, int_of(primitive, literal)?);
        }
        Ok(dtype.literal_from_i128(acc))
    }
}

/// Parse `axes`; absent or empty means every axis.
fn reduction_axes(primitive: Primitive, params: &Params, rank: usize) -> Result<Vec<usize>, EvalError> {
    let mut axes = match parse_optional_usize_param(primitive, "axes", params)? {
        Some(axes) if !axes.is_empty() => axes,
        _ => (0..rank).collect(),
    };
    axes.sort_unstable();
    axes.dedup();
    if let Some(&axis) = axes.last()
        && axis >= rank
    {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("axis {axis} out of bounds for rank {rank}"),
        });
    }
    Ok(axes)
}

/// Axis-aware reduction. Params: `axes` (comma-separated; absent reduces all).
/// The result keeps the operand dtype; a full reduction yields rank 0.
pub(crate) fn eval_reduce_axes(
    primitive: Primitive,
    inputs: &[Value],
    params: &Params,
    kind: ReduceKind,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let dtype = tensor.dtype;
    if dtype.is_complex() {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "complex operands unsupported",
        });
    }
    let rank = tensor.rank();
    let axes = reduction_axes(primitive, params, rank)?;

    let out_dims: Vec<u32> = tensor
        .shape
        .dims
        .iter()
        .enumerate()
        .filter(|(axis, _)| !axes.contains(axis))
        .map(|(_, &dim)| dim)
        .collect();
    let out_shape = Shape { dims: out_dims };
    let out_count = out_shape.element_count_usize()?;

    // Group input positions by their projection onto the kept axes.
    let out_strides = out_shape.strides();
    let mut groups: Vec<Vec<Literal>> = vec![Vec::new(); out_count];
    let mut index = vec![0_usize; rank];
    for literal in &tensor.elements {
        let mut out_flat = 0_usize;
        let mut kept = 0_usize;
        for (axis, &pos) in index.iter().enumerate() {
            if !axes.contains(&axis) {
                out_flat += pos * out_strides[kept];
                kept += 1;
            }
        }
        groups[out_flat].push(*literal);
        for dim in (0..rank).rev() {
            index[dim] += 1;
            if index[dim] < tensor.shape.dims[dim] as usize {
                break;
            }
            index[dim] = 0;
        }
    }

    let elements = groups
        .into_iter()
        .map(|group| reduce_literals(primitive, kind, dtype, group.into_iter()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Tensor(TensorValue::new(dtype, out_shape, elements)?))
}

/// Index of the extreme element along `axis`, first occurrence on ties.
/// NaN counts as the extreme value. Params: `axis`, `index_dtype`
/// (default int32).
pub(crate) fn eval_argminmax(
    primitive: Primitive,
    inputs: &[Value],
    params: &Params,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
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
            detail: "argmin/argmax need at least one axis".to_owned(),
        });
    }
    let axis = parse_axis_param(primitive, "axis", params, 0)?;
    if axis >= rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("axis {axis} out of bounds for rank {rank}"),
        });
    }
    let index_dtype = parse_dtype_param(primitive, "index_dtype", params)?.unwrap_or(DType::I32);
    let (outer, len, inner) = lane_extents(&tensor.shape, axis);
    if len == 0 {
        return Err(EvalError::Unsupported {
            primitive,
            detail: "argmin/argmax of an empty axis".to_owned(),
        });
    }

    let want_max = primitive == Primitive::Argmax;
    let mut elements = Vec::with_capacity(outer * inner);
    for block in 0..outer {
        for col in 0..inner {
            let at = |k: usize| tensor.elements[(block * len + k) * inner + col];
            let mut best = 0_usize;
            for k in 1..len {
                if at(best).is_nan() {
                    break;
                }
                let candidate = at(k);
                if candidate.is_nan() {
                    best = k;
                    break;
                }
                let ordering = total_cmp_literal(tensor.dtype, candidate, at(best));
                let better = if want_max {
                    ordering.is_gt()
                } else {
                    ordering.is_lt()
                };
                if better {
                    best = k;
                }
            }
            elements.push(index_dtype.literal_from_i128(best as i128));
        }
    }
    let out_shape = tensor.shape.with_removed_axis(axis)?;
    Ok(Value::Tensor(TensorValue::new(
        index_dtype,
        out_shape,
        elements,
    )?))
}

/// Cumulative scan along `axis`. Params: `axis` (default 0), `reverse`.
pub(crate) fn eval_cumulative(
    primitive: Primitive,
    inputs: &[Value],
    params: &Params,
    kind: ReduceKind,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 1)?;
    let tensor = inputs[0].to_tensor();
    let dtype = tensor.dtype;
    if dtype.is_complex() {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "complex operands unsupported",
        });
    }
    let rank = tensor.rank();
    if rank == 0 {
        return Ok(Value::Tensor(tensor));
    }
    let axis = parse_axis_param(primitive, "axis", params, 0)?;
    if axis >= rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("axis {axis} out of bounds for rank {rank}"),
        });
    }
    let reverse = parse_bool_param(primitive, "reverse", params)?;

    let (outer, len, inner) = lane_extents(&tensor.shape, axis);
    let mut elements = tensor.elements.clone();
    for block in 0..outer {
        for col in 0..inner {
            let at = |k: usize| (block * len + k) * inner + col;
            let positions: Vec<usize> = if reverse {
                (0..len).rev().collect()
            } else {
                (0..len).collect()
            };
            if dtype.is_floating() {
                let mut acc = kind.float_init();
                for k in positions {
                    acc = kind.float_step(acc, real_of(primitive, tensor.elements[at(k)])?);
                    elements[at(k)] = dtype.literal_from_f64(acc);
                }
            } else {
                let mut acc = kind.int_init(dtype);
                for k in positions {
                    acc = kind.int_step(acc, int_of(primitive, tensor.elements[at(k)])?);
                    elements[at(k)] = dtype.literal_from_i128(acc);
                }
            }
        }
    }
    Ok(Value::Tensor(TensorValue::new(
        dtype,
        tensor.shape.clone(),
        elements,
    )?))
}
