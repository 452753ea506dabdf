#![forbid(unsafe_code)]

mod arithmetic;
mod comparison;
mod reduction;
mod tensor_ops;
mod type_promotion;

use bc_core::{Params, Primitive, Shape, Value, ValueError};

use arithmetic::{
    eval_binary_elementwise, eval_clamp, eval_convert_element_type, eval_dot, eval_rounding,
    eval_select, eval_unary_float, eval_unary_int_or_float, float_sign, int_div, int_pow,
    int_rem, int_sign, logistic,
};
use comparison::eval_comparison;
use reduction::{ReduceKind, eval_argminmax, eval_cumulative, eval_reduce_axes};
use tensor_ops::{
    eval_argsort, eval_broadcast, eval_broadcast_in_dim, eval_concatenate, eval_expand_dims,
    eval_pad, eval_reshape, eval_rev, eval_slice, eval_sort, eval_squeeze, eval_transpose,
};
use type_promotion::{nan_max, nan_min};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    ArityMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    TypeMismatch {
        primitive: Primitive,
        detail: &'static str,
    },
    ShapeMismatch {
        primitive: Primitive,
        left: Shape,
        right: Shape,
    },
    Unsupported {
        primitive: Primitive,
        detail: String,
    },
    InvalidTensor(ValueError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                primitive,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "arity mismatch for {}: expected {}, got {}",
                    primitive.as_str(),
                    expected,
                    actual
                )
            }
            Self::TypeMismatch { primitive, detail } => {
                write!(f, "type mismatch for {}: {}", primitive.as_str(), detail)
            }
            Self::ShapeMismatch {
                primitive,
                left,
                right,
            } => {
                write!(
                    f,
                    "shape mismatch for {}: left={:?} right={:?}",
                    primitive.as_str(),
                    left.dims,
                    right.dims
                )
            }
            Self::Unsupported { primitive, detail } => {
                write!(f, "unsupported {} behavior: {}", primitive.as_str(), detail)
            }
            Self::InvalidTensor(err) => write!(f, "invalid tensor: {err}"),
        }
    }
}

impl std::error::Error for EvalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidTensor(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValueError> for EvalError {
    fn from(value: ValueError) -> Self {
        Self::InvalidTensor(value)
    }
}

/// Evaluate one primitive on concrete, unbatched operands.
#[inline]
pub fn eval_primitive(
    primitive: Primitive,
    inputs: &[Value],
    params: &Params,
) -> Result<Value, EvalError> {
    match primitive {
        // Unary arithmetic
        Primitive::Neg => eval_unary_int_or_float(primitive, inputs, |x| -x, |x| -x),
        Primitive::Abs => eval_unary_int_or_float(primitive, inputs, i128::abs, f64::abs),
        Primitive::Sign => eval_unary_int_or_float(primitive, inputs, int_sign, float_sign),
        Primitive::Square => eval_unary_int_or_float(primitive, inputs, |x| x.wrapping_mul(x), |x| x * x),
        Primitive::Floor => eval_rounding(primitive, inputs, f64::floor),
        Primitive::Ceil => eval_rounding(primitive, inputs, f64::ceil),
        Primitive::Round => eval_rounding(primitive, inputs, f64::round),
        Primitive::Exp => eval_unary_float(primitive, inputs, f64::exp),
        Primitive::Log => eval_unary_float(primitive, inputs, f64::ln),
        Primitive::Log1p => eval_unary_float(primitive, inputs, f64::ln_1p),
        Primitive::Expm1 => eval_unary_float(primitive, inputs, f64::exp_m1),
        Primitive::Sqrt => eval_unary_float(primitive, inputs, f64::sqrt),
        Primitive::Rsqrt => eval_unary_float(primitive, inputs, |x| 1.0 / x.sqrt()),
        Primitive::Sin => eval_unary_float(primitive, inputs, f64::sin),
        Primitive::Cos => eval_unary_float(primitive, inputs, f64::cos),
        Primitive::Tan => eval_unary_float(primitive, inputs, f64::tan),
        Primitive::Tanh => eval_unary_float(primitive, inputs, f64::tanh),
        Primitive::Logistic => eval_unary_float(primitive, inputs, logistic),
        // Binary arithmetic
        Primitive::Add => eval_binary_elementwise(
            primitive,
            inputs,
            Some(i128::wrapping_add),
            |a, b| a + b,
        ),
        Primitive::Sub => eval_binary_elementwise(
            primitive,
            inputs,
            Some(i128::wrapping_sub),
            |a, b| a - b,
        ),
        Primitive::Mul => eval_binary_elementwise(
            primitive,
            inputs,
            Some(i128::wrapping_mul),
            |a, b| a * b,
        ),
        Primitive::Div => eval_binary_elementwise(primitive, inputs, Some(int_div), |a, b| a / b),
        Primitive::Rem => eval_binary_elementwise(primitive, inputs, Some(int_rem), |a, b| a % b),
        Primitive::Pow => eval_binary_elementwise(primitive, inputs, Some(int_pow), f64::powf),
        Primitive::Max => eval_binary_elementwise(primitive, inputs, Some(i128::max), nan_max),
        Primitive::Min => eval_binary_elementwise(primitive, inputs, Some(i128::min), nan_min),
        Primitive::Atan2 => eval_binary_elementwise(primitive, inputs, None, f64::atan2),
        // Comparison
        Primitive::Eq
        | Primitive::Ne
        | Primitive::Lt
        | Primitive::Le
        | Primitive::Gt
        | Primitive::Ge => eval_comparison(primitive, inputs),
        // Selection, clamping, conversion
        Primitive::Select => eval_select(primitive, inputs),
        Primitive::Clamp => eval_clamp(primitive, inputs),
        Primitive::ConvertElementType => eval_convert_element_type(inputs, params),
        Primitive::Dot => eval_dot(primitive, inputs),
        // Reduction
        Primitive::ReduceSum => eval_reduce_axes(primitive, inputs, params, ReduceKind::Sum),
        Primitive::ReduceProd => eval_reduce_axes(primitive, inputs, params, ReduceKind::Prod),
        Primitive::ReduceMax => eval_reduce_axes(primitive, inputs, params, ReduceKind::Max),
        Primitive::ReduceMin => eval_reduce_axes(primitive, inputs, params, ReduceKind::Min),
        Primitive::Argmax | Primitive::Argmin => eval_argminmax(primitive, inputs, params),
        // Cumulative
        Primitive::Cumsum => eval_cumulative(primitive, inputs, params, ReduceKind::Sum),
        Primitive::Cumprod => eval_cumulative(primitive, inputs, params, ReduceKind::Prod),
        Primitive::Cummax => eval_cumulative(primitive, inputs, params, ReduceKind::Max),
        Primitive::Cummin => eval_cumulative(primitive, inputs, params, ReduceKind::Min),
        // Sorting
        Primitive::Sort => eval_sort(inputs, params),
        Primitive::Argsort => eval_argsort(inputs, params),
        // Shape manipulation
        Primitive::Reshape => eval_reshape(inputs, params),
        Primitive::Squeeze => eval_squeeze(inputs, params),
        Primitive::ExpandDims => eval_expand_dims(inputs, params),
        Primitive::Broadcast => eval_broadcast(inputs, params),
        Primitive::BroadcastInDim => eval_broadcast_in_dim(inputs, params),
        Primitive::Transpose => eval_transpose(inputs, params),
        Primitive::Slice => eval_slice(inputs, params),
        Primitive::Pad => eval_pad(inputs, params),
        Primitive::Concatenate => eval_concatenate(inputs, params),
        Primitive::Rev => eval_rev(inputs, params),
    }
}

#[cfg(test)]
mod tests {
    use super::{EvalError, eval_primitive};
    use bc_core::{DType, Literal, Params, Primitive, Shape, TensorValue, Value};

    fn params(entries: &[(&str, &str)]) -> Params {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn tensor(dtype: DType, dims: &[u32], values: &[f64]) -> Value {
        Value::from_f64s(dtype, dims, values).expect("tensor")
    }

    fn floats(value: &Value) -> Vec<f64> {
        value.to_tensor().to_f64_vec().expect("real values")
    }

    fn ints(value: &Value) -> Vec<i64> {
        value.to_tensor().to_i64_vec().expect("integral values")
    }

    // ── Elementwise ──────────────────────────────────────────────

    #[test]
    fn add_broadcasts_size_one_dims() {
        let x = tensor(DType::F32, &[3, 1], &[1.0, 2.0, 3.0]);
        let y = tensor(DType::F32, &[1, 2], &[10.0, 20.0]);
        let out = eval_primitive(Primitive::Add, &[x, y], &Params::new()).expect("add");
        assert_eq!(out.shape(), Shape::new(&[3, 2]));
        assert_eq!(out.dtype(), DType::F32);
        assert_eq!(floats(&out), vec![11.0, 21.0, 12.0, 22.0, 13.0, 23.0]);
    }

    #[test]
    fn scalar_literal_takes_tensor_dtype() {
        let x = tensor(DType::F16, &[2], &[1.0, 2.0]);
        let out = eval_primitive(Primitive::Mul, &[x, Value::scalar_f64(1.0 / 3.0)], &Params::new())
            .expect("mul");
        assert_eq!(out.dtype(), DType::F16);
        let values = floats(&out);
        assert!((values[0] - 1.0 / 3.0).abs() < 1e-3);
        assert_ne!(values[0], 1.0 / 3.0);
    }

    #[test]
    fn mixed_tensor_dtypes_are_rejected() {
        let x = tensor(DType::F32, &[2], &[1.0, 2.0]);
        let y = tensor(DType::F64, &[2], &[1.0, 2.0]);
        assert!(matches!(
            eval_primitive(Primitive::Add, &[x, y], &Params::new()),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn integer_add_wraps_to_width() {
        let x = Value::Tensor(
            TensorValue::from_i64s(DType::I8, Shape::vector(2), &[120, -128]).expect("i8"),
        );
        let y = Value::Tensor(
            TensorValue::from_i64s(DType::I8, Shape::vector(2), &[10, -1]).expect("i8"),
        );
        let out = eval_primitive(Primitive::Add, &[x, y], &Params::new()).expect("add");
        assert_eq!(ints(&out), vec![-126, 127]);
    }

    #[test]
    fn float_only_unary_rejects_integers() {
        let x = Value::vector_i64(&[1, 2]).expect("ints");
        assert!(matches!(
            eval_primitive(Primitive::Exp, &[x], &Params::new()),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn max_propagates_nan() {
        let x = Value::vector_f64(&[f64::NAN, 1.0]).expect("vec");
        let y = Value::vector_f64(&[0.0, 2.0]).expect("vec");
        let out = eval_primitive(Primitive::Max, &[x, y], &Params::new()).expect("max");
        let values = floats(&out);
        assert!(values[0].is_nan());
        assert_eq!(values[1], 2.0);
    }

    #[test]
    fn complex_mul_and_unsupported_div() {
        let x = Value::scalar_complex128(1.0, 2.0);
        let y = Value::scalar_complex128(3.0, -1.0);
        let out = eval_primitive(Primitive::Mul, &[x.clone(), y.clone()], &Params::new())
            .expect("mul");
        assert_eq!(out, Value::Scalar(Literal::from_complex128(5.0, 5.0)));
        assert!(matches!(
            eval_primitive(Primitive::Div, &[x, y], &Params::new()),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn comparison_yields_bool() {
        let x = Value::vector_f64(&[1.0, f64::NAN, 3.0]).expect("vec");
        let out = eval_primitive(Primitive::Lt, &[x, Value::scalar_f64(2.0)], &Params::new())
            .expect("lt");
        assert_eq!(out.dtype(), DType::Bool);
        assert_eq!(
            out.to_tensor().elements,
            vec![Literal::Bool(true), Literal::Bool(false), Literal::Bool(false)]
        );
    }

    #[test]
    fn select_picks_by_predicate() {
        let pred = Value::Tensor(
            TensorValue::new(
                DType::Bool,
                Shape::vector(3),
                vec![Literal::Bool(true), Literal::Bool(false), Literal::Bool(true)],
            )
            .expect("pred"),
        );
        let on_true = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("vec");
        let on_false = Value::scalar_f64(-1.0);
        let out = eval_primitive(Primitive::Select, &[pred, on_true, on_false], &Params::new())
            .expect("select");
        assert_eq!(floats(&out), vec![1.0, -1.0, 3.0]);
    }

    #[test]
    fn clamp_orders_min_x_max() {
        let x = Value::vector_f64(&[-5.0, 0.5, 5.0]).expect("vec");
        let out = eval_primitive(
            Primitive::Clamp,
            &[Value::scalar_f64(0.0), x, Value::scalar_f64(1.0)],
            &Params::new(),
        )
        .expect("clamp");
        assert_eq!(floats(&out), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn convert_truncates_to_integer() {
        let x = Value::vector_f64(&[1.7, -2.5]).expect("vec");
        let out = eval_primitive(
            Primitive::ConvertElementType,
            &[x],
            &params(&[("new_dtype", "int32")]),
        )
        .expect("convert");
        assert_eq!(out.dtype(), DType::I32);
        assert_eq!(ints(&out), vec![1, -2]);
    }

    // ── Dot ──────────────────────────────────────────────────────

    #[test]
    fn dot_matrix_vector() {
        let m = tensor(DType::F64, &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let v = Value::vector_f64(&[1.0, 0.0, -1.0]).expect("vec");
        let out = eval_primitive(Primitive::Dot, &[m, v], &Params::new()).expect("dot");
        assert_eq!(out.shape(), Shape::vector(2));
        assert_eq!(floats(&out), vec![-2.0, -2.0]);
    }

    #[test]
    fn dot_vector_vector_is_rank_zero() {
        let a = Value::vector_f64(&[1.0, 2.0]).expect("vec");
        let b = Value::vector_f64(&[3.0, 4.0]).expect("vec");
        let out = eval_primitive(Primitive::Dot, &[a, b], &Params::new()).expect("dot");
        assert_eq!(out.rank(), 0);
        assert_eq!(out.as_f64_scalar(), Some(11.0));
    }

    #[test]
    fn dot_rejects_inner_mismatch() {
        let a = Value::vector_f64(&[1.0, 2.0]).expect("vec");
        let b = Value::vector_f64(&[3.0, 4.0, 5.0]).expect("vec");
        assert!(matches!(
            eval_primitive(Primitive::Dot, &[a, b], &Params::new()),
            Err(EvalError::ShapeMismatch { .. })
        ));
    }

    // ── Reductions ───────────────────────────────────────────────

    #[test]
    fn reduce_sum_over_one_axis() {
        let x = tensor(DType::F64, &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = eval_primitive(Primitive::ReduceSum, &[x], &params(&[("axes", "1")]))
            .expect("sum");
        assert_eq!(floats(&out), vec![6.0, 15.0]);
    }

    #[test]
    fn full_reduction_keeps_dtype_at_rank_zero() {
        let x = tensor(DType::F32, &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let out = eval_primitive(Primitive::ReduceMax, &[x], &Params::new()).expect("max");
        assert_eq!(out.rank(), 0);
        assert_eq!(out.dtype(), DType::F32);
        assert_eq!(out.as_f64_scalar(), Some(4.0));
    }

    #[test]
    fn empty_reduction_yields_identity() {
        let x = tensor(DType::F64, &[0, 2], &[]);
        let sum = eval_primitive(Primitive::ReduceSum, &[x.clone()], &params(&[("axes", "0")]))
            .expect("sum");
        assert_eq!(floats(&sum), vec![0.0, 0.0]);
        let prod = eval_primitive(Primitive::ReduceProd, &[x], &params(&[("axes", "0")]))
            .expect("prod");
        assert_eq!(floats(&prod), vec![1.0, 1.0]);
    }

    #[test]
    fn argmax_prefers_first_occurrence() {
        let x = tensor(DType::F64, &[2, 3], &[1.0, 3.0, 3.0, 7.0, 2.0, 7.0]);
        let out = eval_primitive(Primitive::Argmax, &[x], &params(&[("axis", "1")]))
            .expect("argmax");
        assert_eq!(out.dtype(), DType::I32);
        assert_eq!(ints(&out), vec![1, 0]);
    }

    #[test]
    fn cumsum_reverse() {
        let x = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("vec");
        let out = eval_primitive(Primitive::Cumsum, &[x], &params(&[("reverse", "true")]))
            .expect("cumsum");
        assert_eq!(floats(&out), vec![6.0, 5.0, 3.0]);
    }

    // ── Sorting ──────────────────────────────────────────────────

    #[test]
    fn sort_and_argsort_agree() {
        let x = tensor(DType::F64, &[2, 3], &[3.0, 1.0, 2.0, 0.0, 5.0, -1.0]);
        let sorted = eval_primitive(Primitive::Sort, &[x.clone()], &Params::new()).expect("sort");
        assert_eq!(floats(&sorted), vec![1.0, 2.0, 3.0, -1.0, 0.0, 5.0]);
        let order = eval_primitive(Primitive::Argsort, &[x], &Params::new()).expect("argsort");
        assert_eq!(ints(&order), vec![1, 2, 0, 2, 0, 1]);
    }

    #[test]
    fn descending_sort_is_stable() {
        let x = Value::vector_f64(&[1.0, 2.0, 1.0, 2.0]).expect("vec");
        let order = eval_primitive(
            Primitive::Argsort,
            &[x],
            &params(&[("descending", "true")]),
        )
        .expect("argsort");
        assert_eq!(ints(&order), vec![1, 3, 0, 2]);
    }

    #[test]
    fn sort_along_leading_dimension() {
        let x = tensor(DType::F64, &[2, 2], &[4.0, 1.0, 2.0, 3.0]);
        let sorted = eval_primitive(Primitive::Sort, &[x], &params(&[("dimension", "0")]))
            .expect("sort");
        assert_eq!(floats(&sorted), vec![2.0, 1.0, 4.0, 3.0]);
    }

    // ── Shape manipulation ───────────────────────────────────────

    #[test]
    fn reshape_infers_minus_one() {
        let x = tensor(DType::F64, &[2, 3], &[0.0; 6]);
        let out = eval_primitive(Primitive::Reshape, &[x], &params(&[("new_shape", "3,-1")]))
            .expect("reshape");
        assert_eq!(out.shape(), Shape::new(&[3, 2]));
    }

    #[test]
    fn squeeze_and_expand_dims_invert() {
        let x = tensor(DType::F64, &[3], &[1.0, 2.0, 3.0]);
        let expanded = eval_primitive(
            Primitive::ExpandDims,
            &[x.clone()],
            &params(&[("dimensions", "0,2")]),
        )
        .expect("expand");
        assert_eq!(expanded.shape(), Shape::new(&[1, 3, 1]));
        let squeezed = eval_primitive(
            Primitive::Squeeze,
            &[expanded],
            &params(&[("dimensions", "0,2")]),
        )
        .expect("squeeze");
        assert_eq!(squeezed, x);
    }

    #[test]
    fn broadcast_in_dim_places_operand_axes() {
        let x = Value::vector_f64(&[1.0, 2.0]).expect("vec");
        let out = eval_primitive(
            Primitive::BroadcastInDim,
            &[x],
            &params(&[("shape", "2,3"), ("broadcast_dimensions", "0")]),
        )
        .expect("broadcast_in_dim");
        assert_eq!(floats(&out), vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn slice_with_stride() {
        let x = Value::vector_f64(&[0.0, 1.0, 2.0, 3.0, 4.0]).expect("vec");
        let out = eval_primitive(
            Primitive::Slice,
            &[x],
            &params(&[
                ("start_indices", "1"),
                ("limit_indices", "5"),
                ("strides", "2"),
            ]),
        )
        .expect("slice");
        assert_eq!(floats(&out), vec![1.0, 3.0]);
    }

    #[test]
    fn pad_with_interior_and_negative_edge() {
        let x = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("vec");
        let out = eval_primitive(
            Primitive::Pad,
            &[x, Value::scalar_f64(0.0)],
            &params(&[
                ("padding_low", "-1"),
                ("padding_high", "2"),
                ("padding_interior", "1"),
            ]),
        )
        .expect("pad");
        assert_eq!(floats(&out), vec![0.0, 2.0, 0.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn concatenate_along_inner_axis() {
        let a = tensor(DType::F64, &[2, 1], &[1.0, 2.0]);
        let b = tensor(DType::F64, &[2, 2], &[3.0, 4.0, 5.0, 6.0]);
        let out = eval_primitive(Primitive::Concatenate, &[a, b], &params(&[("dimension", "1")]))
            .expect("concat");
        assert_eq!(floats(&out), vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn rev_reverses_selected_axis() {
        let x = tensor(DType::F64, &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let out = eval_primitive(Primitive::Rev, &[x], &params(&[("dimensions", "1")]))
            .expect("rev");
        assert_eq!(floats(&out), vec![2.0, 1.0, 4.0, 3.0]);
    }

    #[test]
    fn transpose_defaults_to_reversed_axes() {
        let x = tensor(DType::F64, &[1, 2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let out = eval_primitive(Primitive::Transpose, &[x], &Params::new()).expect("transpose");
        assert_eq!(out.shape(), Shape::new(&[3, 2, 1]));
        assert_eq!(floats(&out), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn arity_is_checked() {
        assert!(matches!(
            eval_primitive(Primitive::Add, &[Value::scalar_f64(1.0)], &Params::new()),
            Err(EvalError::ArityMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }
}
