use bc_core::{DType, Literal, Primitive, Shape, TensorValue, Value};

use crate::EvalError;

/// Result dtype shared by a group of elementwise operands.
///
/// Tensor operands must agree on dtype. Bare scalar literals are weakly
/// typed: they take the tensor dtype when one is present, and otherwise
/// promote among themselves (bool < int < float < complex).
pub(crate) fn common_dtype(primitive: Primitive, inputs: &[&Value]) -> Result<DType, EvalError> {
    let mut tensor_dtype: Option<DType> = None;
    for value in inputs {
        if let Value::Tensor(tensor) = value {
            match tensor_dtype {
                None => tensor_dtype = Some(tensor.dtype),
                Some(dtype) if dtype != tensor.dtype => {
                    return Err(EvalError::TypeMismatch {
                        primitive,
                        detail: "operand dtypes differ",
                    });
                }
                Some(_) => {}
            }
        }
    }
    if let Some(dtype) = tensor_dtype {
        return Ok(dtype);
    }

    Ok(inputs
        .iter()
        .map(|value| value.dtype())
        .max_by_key(|dtype| promotion_rank(*dtype))
        .unwrap_or(DType::F64))
}

fn promotion_rank(dtype: DType) -> u8 {
    if dtype.is_complex() {
        3
    } else if dtype.is_floating() {
        2
    } else if dtype.is_integral() {
        1
    } else {
        0
    }
}

/// Broadcast every operand to the common shape, returning that shape, the
/// broadcast tensors, and whether every operand was a bare scalar.
pub(crate) fn broadcast_operands(
    primitive: Primitive,
    inputs: &[&Value],
) -> Result<(Shape, Vec<TensorValue>, bool), EvalError> {
    let shapes: Vec<Shape> = inputs.iter().map(|value| value.shape()).collect();
    let shape_refs: Vec<&Shape> = shapes.iter().collect();
    let out_shape = Shape::broadcast_shapes(&shape_refs).map_err(|_| {
        let left = shapes.first().cloned().unwrap_or_else(Shape::scalar);
        let right = shapes
            .iter()
            .find(|shape| **shape != left)
            .cloned()
            .unwrap_or_else(Shape::scalar);
        EvalError::ShapeMismatch {
            primitive,
            left,
            right,
        }
    })?;
    let all_scalar = inputs
        .iter()
        .all(|value| matches!(value, Value::Scalar(_)));
    let tensors = inputs
        .iter()
        .map(|value| value.to_tensor().broadcast_to(&out_shape))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((out_shape, tensors, all_scalar))
}

/// Package elementwise results as a scalar when every operand was scalar.
pub(crate) fn finish_elementwise(
    dtype: DType,
    shape: Shape,
    elements: Vec<Literal>,
    all_scalar: bool,
) -> Result<Value, EvalError> {
    if all_scalar && let [literal] = elements.as_slice() {
        return Ok(Value::Scalar(*literal));
    }
    Ok(Value::Tensor(TensorValue::new(dtype, shape, elements)?))
}

pub(crate) fn expect_arity(
    primitive: Primitive,
    inputs: &[Value],
    expected: usize,
) -> Result<(), EvalError> {
    if inputs.len() != expected {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

pub(crate) fn real_of(primitive: Primitive, literal: Literal) -> Result<f64, EvalError> {
    literal.as_f64().ok_or(EvalError::TypeMismatch {
        primitive,
        detail: "expected real operand",
    })
}

pub(crate) fn int_of(primitive: Primitive, literal: Literal) -> Result<i128, EvalError> {
    literal.as_i128().ok_or(EvalError::TypeMismatch {
        primitive,
        detail: "expected integral operand",
    })
}

pub(crate) fn complex_of(primitive: Primitive, literal: Literal) -> Result<(f64, f64), EvalError> {
    literal.as_complex128().ok_or(EvalError::TypeMismatch {
        primitive,
        detail: "expected complex operand",
    })
}

/// Maximum that propagates NaN.
pub(crate) fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

/// Minimum that propagates NaN.
pub(crate) fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

/// Total order on real literals of one dtype with NaN sorted last.
pub(crate) fn total_cmp_literal(dtype: DType, a: Literal, b: Literal) -> std::cmp::Ordering {
    if dtype.is_floating() {
        let x = a.as_f64().unwrap_or(f64::NAN);
        let y = b.as_f64().unwrap_or(f64::NAN);
        match (x.is_nan(), y.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        }
    } else {
        a.as_i128().cmp(&b.as_i128())
    }
}

/// Outer/axis/inner extents for iterating the lanes of `shape` along `axis`.
pub(crate) fn lane_extents(shape: &Shape, axis: usize) -> (usize, usize, usize) {
    let outer = shape.dims[..axis].iter().map(|&d| d as usize).product();
    let len = shape.dims[axis] as usize;
    let inner = shape.dims[axis + 1..].iter().map(|&d| d as usize).product();
    (outer, len, inner)
}
