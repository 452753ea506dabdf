use bc_core::{DType, Literal, Params, Primitive, Shape, TensorValue, Value};

use crate::EvalError;
use crate::tensor_ops::parse_dtype_param;
use crate::type_promotion::{
    broadcast_operands, common_dtype, complex_of, expect_arity, finish_elementwise, int_of,
    real_of,
};

/// Unary elementwise operation defined only on real floating dtypes
/// (exp, log, sqrt, trigonometric, ...).
pub(crate) fn eval_unary_float(
    primitive: Primitive,
    inputs: &[Value],
    float_op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 1)?;
    let dtype = common_dtype(primitive, &[&inputs[0]])?;
    if !dtype.is_floating() {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "expected floating-point operand",
        });
    }
    map_unary(&inputs[0], dtype, |literal| {
        Ok(dtype.literal_from_f64(float_op(real_of(primitive, literal)?)))
    })
}

/// Unary elementwise operation that keeps integer dtypes integral
/// (neg, abs, sign, square). Complex operands support `neg` only.
pub(crate) fn eval_unary_int_or_float(
    primitive: Primitive,
    inputs: &[Value],
    int_op: impl Fn(i128) -> i128,
    float_op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 1)?;
    let dtype = common_dtype(primitive, &[&inputs[0]])?;
    map_unary(&inputs[0], dtype, |literal| {
        if dtype.is_complex() {
            if primitive != Primitive::Neg {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: "complex operands unsupported",
                });
            }
            let (re, im) = complex_of(primitive, literal)?;
            Ok(dtype.literal_from_complex(-re, -im))
        } else if dtype.is_floating() {
            Ok(dtype.literal_from_f64(float_op(real_of(primitive, literal)?)))
        } else {
            Ok(dtype.literal_from_i128(int_op(int_of(primitive, literal)?)))
        }
    })
}

/// Unary elementwise rounding (floor, ceil, round): identity on integers.
pub(crate) fn eval_rounding(
    primitive: Primitive,
    inputs: &[Value],
    float_op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    eval_unary_int_or_float(primitive, inputs, |x| x, float_op)
}

fn map_unary(
    input: &Value,
    dtype: DType,
    op: impl Fn(Literal) -> Result<Literal, EvalError>,
) -> Result<Value, EvalError> {
    match input {
        Value::Scalar(literal) => Ok(Value::Scalar(op(dtype.quantize(*literal))?)),
        Value::Tensor(tensor) => {
            let elements = tensor
                .elements
                .iter()
                .map(|literal| op(dtype.quantize(*literal)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Tensor(TensorValue::new(
                dtype,
                tensor.shape.clone(),
                elements,
            )?))
        }
    }
}

/// Binary elementwise arithmetic with broadcasting.
///
/// `int_op` of `None` marks the primitive as float-only. Integer math runs
/// in `i128` and wraps to the operand width.
pub(crate) fn eval_binary_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    int_op: Option<fn(i128, i128) -> i128>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 2)?;
    let operands = [&inputs[0], &inputs[1]];
    let dtype = common_dtype(primitive, &operands)?;
    let (shape, tensors, all_scalar) = broadcast_operands(primitive, &operands)?;

    let elements = tensors[0]
        .elements
        .iter()
        .zip(&tensors[1].elements)
        .map(|(&lhs, &rhs)| {
            binary_literal_op(
                primitive,
                dtype,
                dtype.quantize(lhs),
                dtype.quantize(rhs),
                int_op,
                float_op,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    finish_elementwise(dtype, shape, elements, all_scalar)
}

fn binary_literal_op(
    primitive: Primitive,
    dtype: DType,
    lhs: Literal,
    rhs: Literal,
    int_op: Option<fn(i128, i128) -> i128>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Literal, EvalError> {
    if dtype.is_complex() {
        let (a, b) = complex_of(primitive, lhs)?;
        let (c, d) = complex_of(primitive, rhs)?;
        let (re, im) = match primitive {
            Primitive::Add => (a + c, b + d),
            Primitive::Sub => (a - c, b - d),
            Primitive::Mul => (a * c - b * d, a * d + b * c),
            _ => {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: "complex operands unsupported",
                });
            }
        };
        return Ok(dtype.literal_from_complex(re, im));
    }
    if dtype.is_floating() {
        let value = float_op(real_of(primitive, lhs)?, real_of(primitive, rhs)?);
        return Ok(dtype.literal_from_f64(value));
    }
    let int_op = int_op.ok_or(EvalError::TypeMismatch {
        primitive,
        detail: "expected floating-point operands",
    })?;
    Ok(dtype.literal_from_i128(int_op(int_of(primitive, lhs)?, int_of(primitive, rhs)?)))
}

pub(crate) fn int_div(a: i128, b: i128) -> i128 {
    if b == 0 { 0 } else { a.wrapping_div(b) }
}

pub(crate) fn int_rem(a: i128, b: i128) -> i128 {
    if b == 0 { 0 } else { a.wrapping_rem(b) }
}

pub(crate) fn int_pow(base: i128, exponent: i128) -> i128 {
    if exponent < 0 {
        return match base {
            1 => 1,
            -1 if exponent % 2 == 0 => 1,
            -1 => -1,
            _ => 0,
        };
    }
    let exponent = u32::try_from(exponent).unwrap_or(u32::MAX);
    base.wrapping_pow(exponent)
}

pub(crate) fn int_sign(x: i128) -> i128 {
    x.signum()
}

pub(crate) fn float_sign(x: f64) -> f64 {
    if x.is_nan() || x == 0.0 { x } else { x.signum() }
}

pub(crate) fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// `select(pred, on_true, on_false)` with broadcasting; `pred` must be bool.
pub(crate) fn eval_select(primitive: Primitive, inputs: &[Value]) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 3)?;
    if inputs[0].dtype() != DType::Bool {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "select predicate must be bool",
        });
    }
    let dtype = common_dtype(primitive, &[&inputs[1], &inputs[2]])?;
    let (shape, tensors, all_scalar) =
        broadcast_operands(primitive, &[&inputs[0], &inputs[1], &inputs[2]])?;

    let elements = tensors[0]
        .elements
        .iter()
        .zip(&tensors[1].elements)
        .zip(&tensors[2].elements)
        .map(|((pred, on_true), on_false)| {
            let pick = pred.as_bool().ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "select predicate must be bool",
            })?;
            Ok(dtype.quantize(if pick { *on_true } else { *on_false }))
        })
        .collect::<Result<Vec<_>, EvalError>>()?;
    finish_elementwise(dtype, shape, elements, all_scalar)
}

/// `clamp(min, x, max)` with broadcasting.
pub(crate) fn eval_clamp(primitive: Primitive, inputs: &[Value]) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 3)?;
    let operands = [&inputs[0], &inputs[1], &inputs[2]];
    let dtype = common_dtype(primitive, &operands)?;
    if dtype.is_complex() {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "complex operands unsupported",
        });
    }
    let (shape, tensors, all_scalar) = broadcast_operands(primitive, &operands)?;

    let elements = tensors[0]
        .elements
        .iter()
        .zip(&tensors[1].elements)
        .zip(&tensors[2].elements)
        .map(|((lo, x), hi)| {
            let (lo, x, hi) = (dtype.quantize(*lo), dtype.quantize(*x), dtype.quantize(*hi));
            if dtype.is_floating() {
                let (lo, x, hi) = (
                    real_of(primitive, lo)?,
                    real_of(primitive, x)?,
                    real_of(primitive, hi)?,
                );
                let clamped = if x < lo {
                    lo
                } else if x > hi {
                    hi
                } else {
                    x
                };
                Ok(dtype.literal_from_f64(clamped))
            } else {
                let (lo, x, hi) = (
                    int_of(primitive, lo)?,
                    int_of(primitive, x)?,
                    int_of(primitive, hi)?,
                );
                Ok(dtype.literal_from_i128(x.max(lo).min(hi)))
            }
        })
        .collect::<Result<Vec<_>, EvalError>>()?;
    finish_elementwise(dtype, shape, elements, all_scalar)
}

/// Elementwise dtype conversion. Params: `new_dtype`.
pub(crate) fn eval_convert_element_type(
    inputs: &[Value],
    params: &Params,
) -> Result<Value, EvalError> {
    let primitive = Primitive::ConvertElementType;
    expect_arity(primitive, inputs, 1)?;
    let target = parse_dtype_param(primitive, "new_dtype", params)?.ok_or_else(|| {
        EvalError::Unsupported {
            primitive,
            detail: "missing required param 'new_dtype'".to_owned(),
        }
    })?;
    let source = inputs[0].dtype();
    let convert = |literal: Literal| {
        let literal = source.quantize(literal);
        if source.is_complex() && !target.is_complex() {
            let (re, _) = literal.as_complex128().unwrap_or((f64::NAN, 0.0));
            target.literal_from_f64(re)
        } else {
            target.quantize(literal)
        }
    };
    match &inputs[0] {
        Value::Scalar(literal) => Ok(Value::Tensor(TensorValue::scalar(
            target,
            convert(*literal),
        ))),
        Value::Tensor(tensor) => Ok(Value::Tensor(TensorValue::new(
            target,
            tensor.shape.clone(),
            tensor.elements.iter().copied().map(convert).collect(),
        )?)),
    }
}

/// Vector/matrix products: `[n]·[n] -> []`, `[m,n]·[n] -> [m]`,
/// `[n]·[n,k] -> [k]`, `[m,n]·[n,k] -> [m,k]`.
pub(crate) fn eval_dot(primitive: Primitive, inputs: &[Value]) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 2)?;
    let lhs = inputs[0].to_tensor();
    let rhs = inputs[1].to_tensor();
    if lhs.dtype != rhs.dtype {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "operand dtypes differ",
        });
    }
    let dtype = lhs.dtype;
    if dtype.is_complex() || dtype.is_bool() {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "dot expects integer or floating-point operands",
        });
    }

    let shape_mismatch = || EvalError::ShapeMismatch {
        primitive,
        left: lhs.shape.clone(),
        right: rhs.shape.clone(),
    };
    let (m, n, lhs_matrix) = match lhs.shape.dims.as_slice() {
        [n] => (1_usize, *n as usize, false),
        [m, n] => (*m as usize, *n as usize, true),
        _ => return Err(shape_mismatch()),
    };
    let (rn, k, rhs_matrix) = match rhs.shape.dims.as_slice() {
        [n] => (*n as usize, 1_usize, false),
        [n, k] => (*n as usize, *k as usize, true),
        _ => return Err(shape_mismatch()),
    };
    if rn != n {
        return Err(shape_mismatch());
    }

    let mut elements = Vec::with_capacity(m * k);
    for row in 0..m {
        for col in 0..k {
            let lhs_at = |idx: usize| lhs.elements[row * n + idx];
            let rhs_at = |idx: usize| rhs.elements[idx * k + col];
            let literal = if dtype.is_floating() {
                let mut acc = 0.0_f64;
                for idx in 0..n {
                    acc += real_of(primitive, lhs_at(idx))? * real_of(primitive, rhs_at(idx))?;
                }
                dtype.literal_from_f64(acc)
            } else {
                let mut acc = 0_i128;
                for idx in 0..n {
                    acc = acc.wrapping_add(
                        int_of(primitive, lhs_at(idx))?.wrapping_mul(int_of(primitive, rhs_at(idx))?),
                    );
                }
                dtype.literal_from_i128(acc)
            };
            elements.push(literal);
        }
    }

    let mut dims = Vec::with_capacity(2);
    if lhs_matrix {
        dims.push(m as u32);
    }
    if rhs_matrix {
        dims.push(k as u32);
    }
    Ok(Value::Tensor(TensorValue::new(
        dtype,
        Shape { dims },
        elements,
    )?))
}
