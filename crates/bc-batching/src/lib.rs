#![forbid(unsafe_code)]

//! Vectorizing transform for batchcheck programs.
//!
//! [`vmap`] evaluates a program over a batch of inputs in one pass by
//! propagating batch dimensions through per-primitive batching rules.
//! [`loop_and_stack`] computes the same thing the slow way, one batch
//! element at a time.

pub mod batching;

pub use batching::{
    BatchError, BatchTracer, apply_batch_rule, batch_eval_program, broadcast_unbatched,
    move_batch_dim_from_front, move_batch_dim_to_front,
};

use bc_core::{BatchDim, Program, TensorValue, Value};
use bc_interpreters::eval_program;
use log::debug;

/// Determine the batch size implied by `args` and `in_axes`.
///
/// Every batched argument must agree with every other and with
/// `axis_size` when one is given. With no batched argument, `axis_size`
/// is required.
pub fn resolve_batch_size(
    args: &[Value],
    in_axes: &[BatchDim],
    axis_size: Option<usize>,
) -> Result<usize, BatchError> {
    if in_axes.len() != args.len() {
        return Err(BatchError::AxesCountMismatch {
            expected: args.len(),
            actual: in_axes.len(),
        });
    }

    let mut size = axis_size;
    for (arg_index, (arg, bdim)) in args.iter().zip(in_axes).enumerate() {
        let Some(axis) = bdim.axis() else {
            continue;
        };
        let rank = arg.rank();
        if axis >= rank {
            return Err(BatchError::BatchDimOutOfBounds {
                batch_dim: axis,
                rank,
            });
        }
        let actual = arg.shape().dims[axis] as usize;
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
    size.ok_or(BatchError::UnknownBatchSize)
}

/// Vectorize `program` over the batch dimensions named by `in_axes`.
///
/// Every output carries the batch dimension at axis 0. Outputs that do
/// not depend on any batched argument are replicated `batch_size` times.
pub fn vmap(
    program: &Program,
    args: &[Value],
    in_axes: &[BatchDim],
    axis_size: Option<usize>,
) -> Result<Vec<Value>, BatchError> {
    if args.len() != program.invars.len() {
        return Err(BatchError::InputArity {
            expected: program.invars.len(),
            actual: args.len(),
        });
    }
    let batch_size = resolve_batch_size(args, in_axes, axis_size)?;
    debug!(
        "vmap {} over batch of {} with in_axes={:?}",
        program.label(),
        batch_size,
        in_axes
    );

    let tracers: Vec<BatchTracer> = args
        .iter()
        .zip(in_axes)
        .map(|(arg, bdim)| BatchTracer {
            value: arg.clone(),
            batch_dim: bdim.axis(),
        })
        .collect();

    batch_eval_program(program, &tracers)?
        .into_iter()
        .map(|tracer| match tracer.batch_dim {
            Some(axis) => move_batch_dim_to_front(&tracer.value, axis),
            None => broadcast_unbatched(&tracer.value, batch_size, 0),
        })
        .collect()
}

/// Vectorize `program` by evaluating it once per batch element and
/// stacking the per-element outputs along a new leading axis.
///
/// An empty batch evaluates the program once on zero-filled examples to
/// learn each output's shape and dtype.
pub fn loop_and_stack(
    program: &Program,
    args: &[Value],
    in_axes: &[BatchDim],
    axis_size: Option<usize>,
) -> Result<Vec<Value>, BatchError> {
    if args.len() != program.invars.len() {
        return Err(BatchError::InputArity {
            expected: program.invars.len(),
            actual: args.len(),
        });
    }
    let batch_size = resolve_batch_size(args, in_axes, axis_size)?;

    let example = |index: Option<usize>| -> Result<Vec<Value>, BatchError> {
        args.iter()
            .zip(in_axes)
            .map(|(arg, bdim)| match (bdim.axis(), index) {
                (None, _) => Ok(arg.clone()),
                (Some(axis), Some(index)) => {
                    Ok(Value::Tensor(arg.to_tensor().slice_along_axis(axis, index)?))
                }
                (Some(axis), None) => {
                    let tensor = arg.to_tensor();
                    let shape = tensor.shape.with_removed_axis(axis)?;
                    Ok(Value::Tensor(TensorValue::zeros(tensor.dtype, shape)?))
                }
            })
            .collect()
    };

    if batch_size == 0 {
        let template = eval_program(program, &example(None)?)?;
        return template
            .iter()
            .map(|value| {
                let tensor = value.to_tensor();
                Ok(Value::Tensor(TensorValue::stack_axis0_with_template(
                    &[],
                    tensor.dtype,
                    &tensor.shape,
                )?))
            })
            .collect();
    }

    let mut per_output: Vec<Vec<Value>> = vec![Vec::with_capacity(batch_size); program.outvars.len()];
    for index in 0..batch_size {
        let outputs = eval_program(program, &example(Some(index))?)?;
        for (column, output) in per_output.iter_mut().zip(outputs) {
            column.push(output);
        }
    }
    per_output
        .iter()
        .map(|column| Ok(Value::Tensor(TensorValue::stack_axis0(column)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_core::{Atom, DType, Literal, Params, Primitive, ProgramBuilder, Shape};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn iota(dtype: DType, dims: &[u32]) -> Value {
        let count: u32 = dims.iter().product();
        let values: Vec<f64> = (0..count).map(f64::from).collect();
        Value::from_f64s(dtype, dims, &values).expect("iota tensor")
    }

    fn sum_of_squares() -> Program {
        let mut builder = ProgramBuilder::new();
        let x = builder.input();
        let sq = builder.push(Primitive::Mul, [Atom::Var(x), Atom::Var(x)], Params::new());
        let total = builder.push(Primitive::ReduceSum, [Atom::Var(sq)], Params::new());
        builder.output(total);
        builder.build()
    }

    #[test]
    fn vmap_matches_loop_on_chained_program() {
        init_logging();
        let program = sum_of_squares();
        let args = [iota(DType::F32, &[3, 4])];
        let in_axes = [BatchDim::Batched(1)];
        let fast = vmap(&program, &args, &in_axes, None).expect("vmap");
        let slow = loop_and_stack(&program, &args, &in_axes, None).expect("loop");
        assert_eq!(fast, slow);
        assert_eq!(fast[0].shape(), Shape::vector(4));
        assert_eq!(fast[0].dtype(), DType::F32);
    }

    #[test]
    fn vmap_broadcasts_unbatched_outputs() {
        init_logging();
        let program = Program::unary(Primitive::Neg, Params::new());
        let args = [Value::vector_f64(&[1.0, 2.0]).expect("vector")];
        let out = vmap(&program, &args, &[BatchDim::NotBatched], Some(3)).expect("vmap");
        assert_eq!(out[0].shape(), Shape::new(&[3, 2]));
        assert_eq!(
            out[0].to_tensor().to_f64_vec().expect("floats"),
            vec![-1.0, -2.0, -1.0, -2.0, -1.0, -2.0]
        );
    }

    #[test]
    fn vmap_requires_axis_size_without_batched_args() {
        let program = Program::unary(Primitive::Neg, Params::new());
        let args = [Value::scalar_f64(1.0)];
        assert_eq!(
            vmap(&program, &args, &[BatchDim::NotBatched], None),
            Err(BatchError::UnknownBatchSize)
        );
    }

    #[test]
    fn vmap_rejects_axis_count_and_range_errors() {
        let program = Program::binary(Primitive::Add, Params::new());
        let args = [iota(DType::F64, &[2]), iota(DType::F64, &[2])];
        assert_eq!(
            vmap(&program, &args, &[BatchDim::Batched(0)], None),
            Err(BatchError::AxesCountMismatch {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(
            vmap(
                &program,
                &args,
                &[BatchDim::Batched(0), BatchDim::Batched(1)],
                None
            ),
            Err(BatchError::BatchDimOutOfBounds {
                batch_dim: 1,
                rank: 1
            })
        );
    }

    #[test]
    fn vmap_rejects_disagreeing_axis_size() {
        let program = Program::unary(Primitive::Abs, Params::new());
        let args = [iota(DType::I32, &[4])];
        assert_eq!(
            vmap(&program, &args, &[BatchDim::Batched(0)], Some(5)),
            Err(BatchError::MismatchedBatchSize {
                arg_index: 0,
                expected: 5,
                actual: 4
            })
        );
    }

    #[test]
    fn empty_batch_yields_empty_outputs_of_the_right_shape() {
        let program = sum_of_squares();
        let args = [Value::from_f64s(DType::F64, &[0, 5], &[]).expect("empty")];
        let in_axes = [BatchDim::Batched(0)];
        let fast = vmap(&program, &args, &in_axes, None).expect("vmap");
        let slow = loop_and_stack(&program, &args, &in_axes, None).expect("loop");
        assert_eq!(fast[0].shape(), Shape::vector(0));
        assert_eq!(fast, slow);
    }

    #[test]
    fn literal_operands_keep_operand_dtype() {
        let mut builder = ProgramBuilder::new();
        let x = builder.input();
        let out = builder.push(
            Primitive::Add,
            [Atom::Var(x), Atom::Lit(Literal::from_f64(0.5))],
            Params::new(),
        );
        builder.output(out);
        let program = builder.build();
        let args = [iota(DType::F16, &[3])];
        let out = vmap(&program, &args, &[BatchDim::Batched(0)], None).expect("vmap");
        assert_eq!(out[0].dtype(), DType::F16);
        assert_eq!(
            out[0].to_tensor().to_f64_vec().expect("floats"),
            vec![0.5, 1.5, 2.5]
        );
    }

    #[test]
    fn multiple_outputs_each_get_a_leading_batch_axis() {
        let mut builder = ProgramBuilder::new();
        let x = builder.input();
        let sorted = builder.push(Primitive::Sort, [Atom::Var(x)], Params::new());
        let order = builder.push(Primitive::Argsort, [Atom::Var(x)], Params::new());
        builder.output(sorted);
        builder.output(order);
        let program = builder.build();

        let args = [Value::from_f64s(DType::F64, &[3, 2], &[3.0, 1.0, 0.0, 2.0, 5.0, 4.0])
            .expect("matrix")];
        let in_axes = [BatchDim::Batched(1)];
        let fast = vmap(&program, &args, &in_axes, None).expect("vmap");
        let slow = loop_and_stack(&program, &args, &in_axes, None).expect("loop");
        assert_eq!(fast, slow);
        assert_eq!(fast[0].shape(), Shape::new(&[2, 3]));
        assert_eq!(
            fast[1].to_tensor().to_i64_vec().expect("indices"),
            vec![1, 0, 2, 0, 1, 2]
        );
    }
}
