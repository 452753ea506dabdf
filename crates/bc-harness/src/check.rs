//! The batch-equivalence check.
//!
//! A check generates batched operands, evaluates the operation's vectorized
//! path once (the candidate), evaluates the operation slice by slice and
//! stacks the results (the reference), and compares the two.

use std::time::Instant;

use bc_core::{BatchDim, DType, Literal, Shape, TensorValue, Value, ValueError};
use bc_test_utils::{
    CheckLogV1, CheckOutcome, CheckPhaseTimings, check_log_enabled, fixture_id_from_json,
    format_shape_dtype_string,
};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::case::BatchingCase;
use crate::generator::{GeneratorError, ValueGenerator};
use crate::op::{BatchableOp, OpError};
use crate::tolerance::{Tolerance, assert_all_close};

#[derive(Debug, Clone, PartialEq)]
pub enum CheckError {
    /// `batch_dims`, `shapes`, and `dtypes` differ in length.
    OperandCountMismatch {
        batch_dims: usize,
        shapes: usize,
        dtypes: usize,
    },
    BatchDimOutOfRange {
        operand: usize,
        batch_dim: usize,
        rank: usize,
    },
    /// The batch size does not fit in a shape dimension.
    BatchSizeOverflow { batch_size: usize },
    Generator(GeneratorError),
    /// The per-slice reference evaluation failed.
    Reference(OpError),
    /// The vectorized evaluation failed.
    Candidate(OpError),
    /// A single-result case produced some other number of outputs.
    SingleResultExpected { actual: usize },
    OutputArity { candidate: usize, reference: usize },
    ShapeMismatch {
        output: usize,
        candidate: Shape,
        reference: Shape,
    },
    DTypeMismatch {
        output: usize,
        candidate: DType,
        reference: DType,
    },
    /// An output holds a different number of elements than its shape
    /// declares.
    ElementCountMismatch {
        output: usize,
        expected: usize,
        candidate: usize,
        reference: usize,
    },
    ValueMismatch {
        output: usize,
        index: usize,
        candidate: Literal,
        reference: Literal,
        atol: f64,
        rtol: f64,
    },
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OperandCountMismatch {
                batch_dims,
                shapes,
                dtypes,
            } => write!(
                f,
                "operand descriptors disagree in length: {batch_dims} batch dims, {shapes} shapes, {dtypes} dtypes"
            ),
            Self::BatchDimOutOfRange {
                operand,
                batch_dim,
                rank,
            } => write!(
                f,
                "operand {operand}: batch dim {batch_dim} out of range for unbatched rank {rank}"
            ),
            Self::BatchSizeOverflow { batch_size } => {
                write!(f, "batch size {batch_size} does not fit in a shape dimension")
            }
            Self::Generator(err) => write!(f, "operand generation failed: {err}"),
            Self::Reference(err) => write!(f, "reference evaluation failed: {err}"),
            Self::Candidate(err) => write!(f, "candidate evaluation failed: {err}"),
            Self::SingleResultExpected { actual } => {
                write!(f, "expected a single result, operation returned {actual}")
            }
            Self::OutputArity {
                candidate,
                reference,
            } => write!(
                f,
                "candidate has {candidate} outputs, reference has {reference}"
            ),
            Self::ShapeMismatch {
                output,
                candidate,
                reference,
            } => write!(
                f,
                "output {output}: candidate shape {candidate} != reference shape {reference}"
            ),
            Self::DTypeMismatch {
                output,
                candidate,
                reference,
            } => write!(
                f,
                "output {output}: candidate dtype {candidate} != reference dtype {reference}"
            ),
            Self::ElementCountMismatch {
                output,
                expected,
                candidate,
                reference,
            } => write!(
                f,
                "output {output}: shape holds {expected} elements, candidate has {candidate}, reference has {reference}"
            ),
            Self::ValueMismatch {
                output,
                index,
                candidate,
                reference,
                atol,
                rtol,
            } => write!(
                f,
                "output {output} element {index}: candidate {candidate} not close to reference {reference} (atol={atol:e}, rtol={rtol:e})"
            ),
        }
    }
}

impl std::error::Error for CheckError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Generator(err) => Some(err),
            Self::Reference(err) | Self::Candidate(err) => Some(err),
            _ => None,
        }
    }
}

impl From<GeneratorError> for CheckError {
    fn from(value: GeneratorError) -> Self {
        Self::Generator(value)
    }
}

/// Summary of a passing check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub op: String,
    pub seed: Option<u64>,
    pub batch_size: usize,
    pub batch_dims: Vec<BatchDim>,
    pub operand_shapes: Vec<Shape>,
    pub output_shapes: Vec<Shape>,
    pub max_abs_diff: Vec<f64>,
}

/// Verify that `op`'s vectorized evaluation over `case` matches evaluating
/// `op` once per batch slice and stacking.
pub fn check_batching<O, G>(
    op: &O,
    case: &BatchingCase,
    generator: &mut G,
    tolerance: &Tolerance,
) -> Result<CheckReport, CheckError>
where
    O: BatchableOp + ?Sized,
    G: ValueGenerator + ?Sized,
{
    let started = Instant::now();
    let mut timings = CheckPhaseTimings::default();
    let result = run_check(op, case, generator, tolerance, &mut timings);
    if let Err(err) = &result {
        warn!("batching check failed for {}: {err}", op.name());
    }
    if check_log_enabled() {
        emit_check_log(op, case, generator.seed(), &result, started, timings);
    }
    result
}

fn run_check<O, G>(
    op: &O,
    case: &BatchingCase,
    generator: &mut G,
    tolerance: &Tolerance,
    timings: &mut CheckPhaseTimings,
) -> Result<CheckReport, CheckError>
where
    O: BatchableOp + ?Sized,
    G: ValueGenerator + ?Sized,
{
    let name = op.name();
    let batch_size = case.batch_size;
    let batch_dims = case.batch_dims();

    let mut batched_shapes = Vec::with_capacity(case.operands.len());
    for (operand, spec) in case.operands.iter().enumerate() {
        let shape = spec.batched_shape(batch_size).map_err(|err| match err {
            ValueError::ShapeOverflow { .. } => CheckError::BatchSizeOverflow { batch_size },
            _ => CheckError::BatchDimOutOfRange {
                operand,
                batch_dim: spec.batch_dim.axis().unwrap_or(0),
                rank: spec.shape.rank(),
            },
        })?;
        batched_shapes.push(shape);
    }
    let labels: Vec<String> = case
        .operands
        .iter()
        .zip(&batched_shapes)
        .map(|(spec, shape)| format_shape_dtype_string(shape, spec.dtype))
        .collect();
    debug!("{name}: batch_size={batch_size} batch_dims={batch_dims:?} operands={labels:?}");

    let phase = Instant::now();
    let args = case
        .operands
        .iter()
        .zip(&batched_shapes)
        .map(|(spec, shape)| generator.generate(shape, spec.dtype))
        .collect::<Result<Vec<_>, _>>()?;
    timings.generate_ms = elapsed_ms(phase);
    debug!("{name}: generated {} operands", args.len());

    let phase = Instant::now();
    let candidate = op
        .eval_vmapped(&args, &batch_dims, batch_size)
        .map_err(CheckError::Candidate)?;
    timings.candidate_ms = elapsed_ms(phase);
    debug!("{name}: candidate produced {} outputs", candidate.len());

    let phase = Instant::now();
    let reference = if batch_size == 0 {
        empty_batch_reference(op, case, generator)?
    } else {
        looped_reference(op, case, &args, &batch_dims)?
    };
    timings.reference_ms = elapsed_ms(phase);
    debug!("{name}: reference produced {} outputs", reference.len());

    let phase = Instant::now();
    let diffs = assert_all_close(&candidate, &reference, tolerance)?;
    timings.compare_ms = elapsed_ms(phase);
    for diff in &diffs {
        trace!(
            "{name}: output {} shape={} max_abs_diff={:e}",
            diff.output, diff.shape, diff.max_abs_diff
        );
    }

    Ok(CheckReport {
        op: name,
        seed: generator.seed(),
        batch_size,
        batch_dims,
        operand_shapes: case.shapes(),
        output_shapes: diffs.iter().map(|diff| diff.shape.clone()).collect(),
        max_abs_diff: diffs.iter().map(|diff| diff.max_abs_diff).collect(),
    })
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn expect_result_count(case: &BatchingCase, outputs: &[Value]) -> Result<(), CheckError> {
    if !case.multiple_results && outputs.len() != 1 {
        return Err(CheckError::SingleResultExpected {
            actual: outputs.len(),
        });
    }
    Ok(())
}

/// One unbatched evaluation on freshly generated operands fixes each output's
/// shape and dtype; the reference is then `zeros((0,) + shape)`.
fn empty_batch_reference<O, G>(
    op: &O,
    case: &BatchingCase,
    generator: &mut G,
) -> Result<Vec<Value>, CheckError>
where
    O: BatchableOp + ?Sized,
    G: ValueGenerator + ?Sized,
{
    let template_args = case
        .operands
        .iter()
        .map(|spec| generator.generate(&spec.shape, spec.dtype))
        .collect::<Result<Vec<_>, _>>()?;
    let template = op.eval(&template_args).map_err(CheckError::Reference)?;
    expect_result_count(case, &template)?;
    template
        .iter()
        .map(|value| {
            let tensor = value.to_tensor();
            TensorValue::stack_axis0_with_template(&[], tensor.dtype, &tensor.shape)
                .map(Value::Tensor)
                .map_err(|err| CheckError::Reference(OpError::Tensor(err)))
        })
        .collect()
}

/// Slices `0..batch_size` in increasing order; unbatched operands are passed
/// through unchanged to every slice.
fn looped_reference<O>(
    op: &O,
    case: &BatchingCase,
    args: &[Value],
    batch_dims: &[BatchDim],
) -> Result<Vec<Value>, CheckError>
where
    O: BatchableOp + ?Sized,
{
    let slice = |index: usize| -> Result<Vec<Value>, ValueError> {
        args.iter()
            .zip(batch_dims)
            .map(|(arg, bdim)| match bdim.axis() {
                Some(axis) => arg.to_tensor().slice_along_axis(axis, index).map(Value::Tensor),
                None => Ok(arg.clone()),
            })
            .collect()
    };

    let mut columns: Vec<Vec<Value>> = Vec::new();
    for index in 0..case.batch_size {
        let slice_args = slice(index).map_err(|err| CheckError::Reference(OpError::Tensor(err)))?;
        let outputs = op.eval(&slice_args).map_err(CheckError::Reference)?;
        expect_result_count(case, &outputs)?;
        if columns.is_empty() {
            columns = vec![Vec::with_capacity(case.batch_size); outputs.len()];
        } else if columns.len() != outputs.len() {
            return Err(CheckError::Reference(OpError::Custom(format!(
                "slice {index} produced {} outputs, earlier slices produced {}",
                outputs.len(),
                columns.len()
            ))));
        }
        for (column, output) in columns.iter_mut().zip(outputs) {
            column.push(output);
        }
    }

    columns
        .iter()
        .map(|column| {
            TensorValue::stack_axis0(column)
                .map(Value::Tensor)
                .map_err(|err| CheckError::Reference(OpError::Tensor(err)))
        })
        .collect()
}

fn emit_check_log<O>(
    op: &O,
    case: &BatchingCase,
    seed: Option<u64>,
    result: &Result<CheckReport, CheckError>,
    started: Instant,
    timings: CheckPhaseTimings,
) where
    O: BatchableOp + ?Sized,
{
    let fixture_id = fixture_id_from_json(case).unwrap_or_else(|_| "<unserializable>".to_owned());
    let outcome = if result.is_ok() {
        CheckOutcome::Pass
    } else {
        CheckOutcome::Fail
    };
    let mut log = CheckLogV1::new(op.name(), fixture_id, seed.unwrap_or(0), outcome);
    log.duration_ms = elapsed_ms(started);
    log.phase_timings = timings;
    log.details = result.as_ref().err().map(ToString::to_string);
    match serde_json::to_string(&log) {
        Ok(line) => info!("{line}"),
        Err(err) => warn!("could not serialize check log: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{RandDefault, RandGenerator, RandUniqueInt};
    use crate::op::FnOp;
    use bc_core::{Params, Primitive, Program};

    fn case(batch_size: usize, bdims: &[BatchDim], shapes: &[&[u32]], dtype: DType) -> BatchingCase {
        let shapes: Vec<Shape> = shapes.iter().map(|dims| Shape::new(dims)).collect();
        BatchingCase::from_parts(batch_size, bdims, &shapes, &vec![dtype; shapes.len()])
            .expect("case")
    }

    #[test]
    fn add_program_passes() {
        let program = Program::binary(Primitive::Add, Params::new());
        let report = check_batching(
            &program,
            &case(
                4,
                &[BatchDim::Batched(1), BatchDim::NotBatched],
                &[&[3, 4], &[3, 4]],
                DType::F32,
            ),
            &mut RandGenerator::new(RandDefault, 5),
            &Tolerance::new(1e-6, 1e-6),
        )
        .expect("add batches correctly");
        assert_eq!(report.output_shapes, vec![Shape::new(&[4, 3, 4])]);
        assert_eq!(report.seed, Some(5));
    }

    #[test]
    fn batch_dim_beyond_rank_is_rejected() {
        let program = Program::unary(Primitive::Neg, Params::new());
        let err = check_batching(
            &program,
            &case(2, &[BatchDim::Batched(3)], &[&[3]], DType::F64),
            &mut RandGenerator::new(RandDefault, 0),
            &Tolerance::exact(),
        )
        .expect_err("out of range");
        assert_eq!(
            err,
            CheckError::BatchDimOutOfRange {
                operand: 0,
                batch_dim: 3,
                rank: 1
            }
        );
    }

    #[test]
    fn wrong_candidate_shape_is_reported() {
        // Drops the batch axis entirely.
        let op = FnOp::new(
            "broken",
            |args: &[Value]| Ok(vec![args[0].clone()]),
            |args: &[Value], _: &[BatchDim], _: usize| {
                let first = args[0].to_tensor().slice_axis0(0)?;
                Ok(vec![Value::Tensor(first)])
            },
        );
        let err = check_batching(
            &op,
            &case(3, &[BatchDim::Batched(0)], &[&[2]], DType::F64),
            &mut RandGenerator::new(RandDefault, 1),
            &Tolerance::exact(),
        )
        .expect_err("shape mismatch");
        assert!(matches!(err, CheckError::ShapeMismatch { output: 0, .. }));
    }

    #[test]
    fn single_result_cases_reject_multiple_outputs() {
        let op = FnOp::new(
            "pair",
            |args: &[Value]| Ok(vec![args[0].clone(), args[0].clone()]),
            |args: &[Value], _: &[BatchDim], _: usize| Ok(vec![args[0].clone(), args[0].clone()]),
        );
        let err = check_batching(
            &op,
            &case(2, &[BatchDim::Batched(0)], &[&[2]], DType::F64),
            &mut RandGenerator::new(RandDefault, 1),
            &Tolerance::exact(),
        )
        .expect_err("two outputs");
        assert_eq!(err, CheckError::SingleResultExpected { actual: 2 });
    }

    fn identity_eval(args: &[Value]) -> Result<Vec<Value>, OpError> {
        Ok(vec![args[0].clone()])
    }

    #[test]
    fn candidate_with_short_element_buffer_fails() {
        // Declares a (4, 3) output but carries a single element.
        let op = FnOp::new(
            "truncated",
            identity_eval,
            |args: &[Value], _: &[BatchDim], _: usize| {
                let tensor = args[0].to_tensor();
                Ok(vec![Value::Tensor(TensorValue {
                    dtype: tensor.dtype,
                    shape: tensor.shape.clone(),
                    elements: vec![tensor.elements[0]],
                })])
            },
        );
        let err = check_batching(
            &op,
            &case(4, &[BatchDim::Batched(0)], &[&[3]], DType::F64),
            &mut RandGenerator::new(RandDefault, 3),
            &Tolerance::exact(),
        )
        .expect_err("truncated candidate");
        assert_eq!(
            err,
            CheckError::ElementCountMismatch {
                output: 0,
                expected: 12,
                candidate: 1,
                reference: 12
            }
        );
    }

    #[test]
    fn generator_errors_propagate() {
        let program = Program::unary(Primitive::Neg, Params::new());
        let err = check_batching(
            &program,
            &case(3, &[BatchDim::Batched(0)], &[&[100]], DType::U8),
            &mut RandGenerator::new(RandUniqueInt, 0),
            &Tolerance::exact(),
        )
        .expect_err("u8 cannot hold 300 distinct values");
        assert_eq!(
            err,
            CheckError::Generator(GeneratorError::UniqueValuesExhausted {
                count: 300,
                dtype: DType::U8
            })
        );
    }

    #[test]
    fn candidate_errors_propagate() {
        let op = FnOp::new(
            "no_vmap",
            identity_eval,
            |_: &[Value], _: &[BatchDim], _: usize| {
                Err(OpError::Custom("vectorized path unavailable".to_owned()))
            },
        );
        let err = check_batching(
            &op,
            &case(2, &[BatchDim::Batched(0)], &[&[3]], DType::F64),
            &mut RandGenerator::new(RandDefault, 4),
            &Tolerance::exact(),
        )
        .expect_err("candidate fails");
        assert_eq!(
            err,
            CheckError::Candidate(OpError::Custom("vectorized path unavailable".to_owned()))
        );
    }

    #[test]
    fn reference_errors_propagate_for_every_batch_size() {
        let op = FnOp::new(
            "no_eval",
            |_: &[Value]| Err(OpError::Custom("unbatched path unavailable".to_owned())),
            |args: &[Value], _: &[BatchDim], _: usize| Ok(vec![args[0].clone()]),
        );
        // Batch size zero goes through the single template evaluation.
        for batch_size in [0_usize, 3] {
            let err = check_batching(
                &op,
                &case(batch_size, &[BatchDim::Batched(0)], &[&[3]], DType::F64),
                &mut RandGenerator::new(RandDefault, 5),
                &Tolerance::exact(),
            )
            .expect_err("reference fails");
            assert_eq!(
                err,
                CheckError::Reference(OpError::Custom("unbatched path unavailable".to_owned())),
                "batch_size={batch_size}"
            );
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn batch_size_past_u32_is_rejected_before_generation() {
        let program = Program::unary(Primitive::Neg, Params::new());
        let batch_size = u32::MAX as usize + 1;
        let err = check_batching(
            &program,
            &case(batch_size, &[BatchDim::Batched(0)], &[&[3]], DType::F64),
            &mut RandGenerator::new(RandDefault, 6),
            &Tolerance::exact(),
        )
        .expect_err("overflowing batch size");
        assert_eq!(err, CheckError::BatchSizeOverflow { batch_size });
    }

    #[test]
    fn report_serializes() {
        let program = Program::unary(Primitive::Exp, Params::new());
        let report = check_batching(
            &program,
            &case(2, &[BatchDim::Batched(0)], &[&[3]], DType::F64),
            &mut RandGenerator::new(RandDefault, 2),
            &Tolerance::new(1e-12, 1e-12),
        )
        .expect("exp batches");
        let json = serde_json::to_string(&report).expect("serialize");
        let decoded: CheckReport = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, report);
    }
}
