use bc_core::{DType, Literal, Primitive, Value};

use crate::EvalError;
use crate::type_promotion::{
    broadcast_operands, common_dtype, complex_of, expect_arity, finish_elementwise, int_of,
    real_of,
};

/// Elementwise comparison producing a bool result with broadcasting.
///
/// Floating comparisons follow IEEE semantics (NaN compares unequal to
/// everything). Complex operands support `eq`/`ne` only.
pub(crate) fn eval_comparison(
    primitive: Primitive,
    inputs: &[Value],
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
            compare_literals(primitive, dtype, dtype.quantize(lhs), dtype.quantize(rhs))
                .map(Literal::Bool)
        })
        .collect::<Result<Vec<_>, _>>()?;
    finish_elementwise(DType::Bool, shape, elements, all_scalar)
}

fn compare_literals(
    primitive: Primitive,
    dtype: DType,
    lhs: Literal,
    rhs: Literal,
) -> Result<bool, EvalError> {
    if dtype.is_complex() {
        let left = complex_of(primitive, lhs)?;
        let right = complex_of(primitive, rhs)?;
        return match primitive {
            Primitive::Eq => Ok(left == right),
            Primitive::Ne => Ok(left != right),
            _ => Err(EvalError::TypeMismatch {
                primitive,
                detail: "complex values are unordered",
            }),
        };
    }
    if dtype.is_floating() {
        let (a, b) = (real_of(primitive, lhs)?, real_of(primitive, rhs)?);
        return Ok(match primitive {
            Primitive::Eq => a == b,
            Primitive::Ne => a != b,
            Primitive::Lt => a < b,
            Primitive::Le => a <= b,
            Primitive::Gt => a > b,
            _ => a >= b,
        });
    }
    let (a, b) = (int_of(primitive, lhs)?, int_of(primitive, rhs)?);
    Ok(match primitive {
        Primitive::Eq => a == b,
        Primitive::Ne => a != b,
        Primitive::Lt => a < b,
        Primitive::Le => a <= b,
        Primitive::Gt => a > b,
        _ => a >= b,
    })
}
