//! Batch-equivalence conformance for the primitive set.
//!
//! Covers:
//! - Worked scenarios: broadcast operand reuse, empty batches, multi-output ops
//! - Properties: shape consistency, numeric equivalence, zero-batch
//!   degeneracy, unbatched operand reuse, slice order
//! - Grids: every primitive family over compatible shapes, dtypes, and all
//!   batch-dimension placements

use bc_batching::vmap;
use bc_core::{
    Atom, BatchDim, DType, Params, Primitive, Program, ProgramBuilder, Shape, TensorValue, Value,
};
use bc_harness::{
    BatchableOp, BatchingCase, CaseGrid, CheckError, FnOp, GeneratorError, GridCase, Looped,
    OpError, RandBool, RandDefault, RandGenerator, RandPositive, RandSmall, RandUniqueInt,
    Strategy, Tolerance, ValueGenerator, all_bdims, cases_from_list, check_batching,
    compatible_shape_groups, run_grid,
};
use bc_test_utils::{generated_case_limit, property_test_case_count, seed_for, test_id};
use proptest::prelude::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn params(entries: &[(&str, &str)]) -> Params {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn shapes(groups: &[&[&[u32]]]) -> Vec<Vec<Shape>> {
    groups
        .iter()
        .map(|group| group.iter().map(|dims| Shape::new(dims)).collect())
        .collect()
}

fn f32_tol() -> Tolerance {
    Tolerance::new(1e-6, 1e-6)
}

/// Sample the grid and require every sampled case to pass.
fn assert_grid_passes<S, F>(name: &str, op: &dyn BatchableOp, grid: CaseGrid, strategy: F)
where
    S: Strategy,
    F: Fn(&GridCase) -> S + Sync,
{
    init_logging();
    let id = test_id(module_path!(), name);
    let cases = cases_from_list(grid.cases(), generated_case_limit(), seed_for(&id));
    assert!(!cases.is_empty(), "{name}: empty grid");
    let summary = run_grid(op, &cases, strategy, &Tolerance::dtype_defaults());
    assert!(
        summary.is_success(),
        "{name}: {} of {} cases failed: {:#?}",
        summary.failures.len(),
        summary.total(),
        summary.failures
    );
}

fn sort_with_indices() -> Program {
    let mut builder = ProgramBuilder::new();
    let x = builder.input();
    let sorted = builder.push(Primitive::Sort, [Atom::Var(x)], Params::new());
    let order = builder.push(Primitive::Argsort, [Atom::Var(x)], Params::new());
    builder.output(sorted);
    builder.output(order);
    builder.build()
}

// ── Worked scenarios ───────────────────────────────────────────────

#[test]
fn scenario_add_reuses_unbatched_operand() {
    init_logging();
    let program = Program::binary(Primitive::Add, Params::new());
    let case = BatchingCase::from_parts(
        10,
        &[BatchDim::Batched(0), BatchDim::NotBatched],
        &[Shape::new(&[3, 4]), Shape::new(&[3, 4])],
        &[DType::F32, DType::F32],
    )
    .expect("case");
    let mut generator = RandGenerator::for_test(RandDefault, "scenario_add_reuses_unbatched_operand");
    let report = check_batching(&program, &case, &mut generator, &f32_tol()).expect("add batches");
    assert_eq!(report.output_shapes, vec![Shape::new(&[10, 3, 4])]);
    assert_eq!(report.operand_shapes, vec![Shape::new(&[3, 4]); 2]);
}

#[test]
fn scenario_empty_batch_full_reduction() {
    init_logging();
    let program = Program::unary(Primitive::ReduceSum, Params::new());
    let case = BatchingCase::from_parts(
        0,
        &[BatchDim::Batched(1)],
        &[Shape::new(&[3, 4, 5])],
        &[DType::F32],
    )
    .expect("case");
    let mut generator = RandGenerator::for_test(RandDefault, "scenario_empty_batch_full_reduction");
    let report =
        check_batching(&program, &case, &mut generator, &f32_tol()).expect("empty batch passes");
    assert_eq!(report.output_shapes, vec![Shape::vector(0)]);
}

#[test]
fn scenario_sort_returns_values_and_indices() {
    init_logging();
    let case = BatchingCase::from_parts(
        5,
        &[BatchDim::Batched(1)],
        &[Shape::new(&[3, 4])],
        &[DType::F32],
    )
    .expect("case")
    .with_multiple_results(true);
    let mut generator =
        RandGenerator::for_test(RandUniqueInt, "scenario_sort_returns_values_and_indices");
    let report = check_batching(&sort_with_indices(), &case, &mut generator, &f32_tol())
        .expect("sort batches");
    assert_eq!(
        report.output_shapes,
        vec![Shape::new(&[5, 3, 4]), Shape::new(&[5, 3, 4])]
    );
}

// ── Properties ─────────────────────────────────────────────────────

#[test]
fn candidate_shape_is_batch_size_plus_slice_shape() {
    init_logging();
    let program = Program::unary(Primitive::ReduceMax, params(&[("axes", "1")]));
    for batch_size in [1_usize, 4, 7] {
        let case = BatchingCase::from_parts(
            batch_size,
            &[BatchDim::Batched(2)],
            &[Shape::new(&[2, 3, 4])],
            &[DType::F64],
        )
        .expect("case");
        let mut generator = RandGenerator::new(RandDefault, batch_size as u64);
        let report = check_batching(&program, &case, &mut generator, &Tolerance::exact())
            .expect("reduce_max batches");
        assert_eq!(
            report.output_shapes,
            vec![Shape::new(&[batch_size as u32, 2, 4])]
        );
    }
}

#[test]
fn zero_batch_agrees_for_every_family() {
    init_logging();
    let programs = [
        Program::unary(Primitive::Exp, Params::new()),
        Program::unary(Primitive::Argmax, params(&[("axis", "1")])),
        Program::unary(Primitive::Cumsum, params(&[("axis", "0")])),
        Program::unary(Primitive::Transpose, params(&[("permutation", "1,0")])),
        Program::unary(Primitive::Reshape, params(&[("new_shape", "-1")])),
        Program::binary(Primitive::Dot, Params::new()),
    ];
    for program in &programs {
        let case_shapes = if program.invars.len() == 2 {
            vec![Shape::new(&[3, 4]), Shape::vector(4)]
        } else {
            vec![Shape::new(&[3, 4])]
        };
        let dtypes = vec![DType::F32; case_shapes.len()];
        for bdims in all_bdims(&case_shapes) {
            let case = BatchingCase::from_parts(0, &bdims, &case_shapes, &dtypes).expect("case");
            let mut generator = RandGenerator::new(RandDefault, 0);
            let report = check_batching(program, &case, &mut generator, &f32_tol())
                .unwrap_or_else(|err| panic!("{} {bdims:?}: {err}", program.name()));
            assert!(report.output_shapes.iter().all(|shape| shape.dims[0] == 0));
        }
    }
}

/// Counts draws so the test can tell whether operands are regenerated per
/// slice.
struct CountingGenerator<G> {
    inner: G,
    calls: usize,
}

impl<G: ValueGenerator> ValueGenerator for CountingGenerator<G> {
    fn generate(&mut self, shape: &Shape, dtype: DType) -> Result<Value, GeneratorError> {
        self.calls += 1;
        self.inner.generate(shape, dtype)
    }
}

#[test]
fn unbatched_operand_is_generated_once() {
    init_logging();
    let program = Program::binary(Primitive::Mul, Params::new());
    let case = BatchingCase::from_parts(
        6,
        &[BatchDim::NotBatched, BatchDim::Batched(0)],
        &[Shape::vector(3), Shape::vector(3)],
        &[DType::F64, DType::F64],
    )
    .expect("case");
    let mut generator = CountingGenerator {
        inner: RandGenerator::new(RandDefault, 17),
        calls: 0,
    };
    check_batching(&program, &case, &mut generator, &Tolerance::exact()).expect("mul batches");
    assert_eq!(generator.calls, 2);
}

#[test]
fn reversed_batch_order_is_caught() {
    init_logging();
    let program = Program::unary(Primitive::Neg, Params::new());
    let reversed = FnOp::new(
        "neg_reversed",
        |args: &[Value]| Ok(bc_interpreters::eval_program(&program, args)?),
        |args: &[Value], in_axes: &[BatchDim], axis_size: usize| {
            let outputs = vmap(&program, args, in_axes, Some(axis_size))?;
            outputs
                .into_iter()
                .map(|value| -> Result<Value, OpError> {
                    let tensor = value.to_tensor();
                    let slices = (0..axis_size)
                        .rev()
                        .map(|index| tensor.slice_axis0(index).map(Value::Tensor))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Value::Tensor(TensorValue::stack_axis0(&slices)?))
                })
                .collect::<Result<Vec<_>, OpError>>()
        },
    );
    let case = BatchingCase::from_parts(4, &[BatchDim::Batched(0)], &[Shape::vector(3)], &[DType::I32])
        .expect("case");
    let mut generator = RandGenerator::new(RandUniqueInt, 3);
    let err = check_batching(&reversed, &case, &mut generator, &Tolerance::exact())
        .expect_err("reversed slices must not pass");
    assert!(matches!(err, CheckError::ValueMismatch { output: 0, .. }));
}

#[test]
fn looped_transform_agrees_with_vmap() {
    init_logging();
    let program = Program::binary(Primitive::Dot, Params::new());
    let looped = Looped(program.clone());
    for (lhs, rhs) in [(vec![2_u32, 3], vec![3_u32, 4]), (vec![3], vec![3])] {
        let case_shapes = [Shape::new(&lhs), Shape::new(&rhs)];
        for bdims in all_bdims(&case_shapes) {
            let case = BatchingCase::from_parts(3, &bdims, &case_shapes, &[DType::F64, DType::F64])
                .expect("case");
            let mut a = RandGenerator::new(RandDefault, 9);
            let mut b = RandGenerator::new(RandDefault, 9);
            let tol = Tolerance::new(1e-12, 1e-12);
            let fast = check_batching(&program, &case, &mut a, &tol).expect("vmap");
            let slow = check_batching(&looped, &case, &mut b, &tol).expect("loop");
            assert_eq!(fast.output_shapes, slow.output_shapes);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(property_test_case_count().min(128)))]

    #[test]
    fn prop_binary_ops_batch_like_loops(
        group in 0_usize..3,
        pick in any::<(usize, usize)>(),
        bdim_pick in any::<usize>(),
        batch_size in 0_usize..5,
        op_index in 0_usize..5,
        seed in any::<u64>(),
    ) {
        let groups = compatible_shape_groups();
        let group = &groups[group];
        let case_shapes = [group[pick.0 % group.len()].clone(), group[pick.1 % group.len()].clone()];
        let placements = all_bdims(&case_shapes);
        let bdims = &placements[bdim_pick % placements.len()];
        let primitive = [Primitive::Add, Primitive::Sub, Primitive::Mul, Primitive::Max, Primitive::Lt][op_index];
        let program = Program::binary(primitive, Params::new());
        let case = BatchingCase::from_parts(batch_size, bdims, &case_shapes, &[DType::F32, DType::F32])
            .expect("case");
        let mut generator = RandGenerator::new(RandDefault, seed);
        let result = check_batching(&program, &case, &mut generator, &Tolerance::exact());
        prop_assert!(result.is_ok(), "{primitive} {bdims:?} {case_shapes:?}: {result:?}");
    }
}

// ── Elementwise grids ──────────────────────────────────────────────

#[test]
fn grid_unary_float_ops() {
    for primitive in [
        Primitive::Neg,
        Primitive::Abs,
        Primitive::Sign,
        Primitive::Floor,
        Primitive::Ceil,
        Primitive::Round,
        Primitive::Exp,
        Primitive::Sin,
        Primitive::Cos,
        Primitive::Tan,
        Primitive::Tanh,
        Primitive::Logistic,
        Primitive::Square,
        Primitive::Expm1,
    ] {
        let program = Program::unary(primitive, Params::new());
        let grid = CaseGrid::new(primitive.as_str(), 1).dtypes(&[DType::F32, DType::F64, DType::F16]);
        assert_grid_passes(primitive.as_str(), &program, grid, |_| RandDefault);
    }
}

#[test]
fn grid_unary_positive_domain_ops() {
    for primitive in [Primitive::Log, Primitive::Sqrt, Primitive::Rsqrt, Primitive::Log1p] {
        let program = Program::unary(primitive, Params::new());
        let grid = CaseGrid::new(primitive.as_str(), 1).dtypes(&[DType::F32, DType::BF16]);
        assert_grid_passes(primitive.as_str(), &program, grid, |_| RandPositive);
    }
}

#[test]
fn grid_binary_ops() {
    for primitive in [
        Primitive::Add,
        Primitive::Sub,
        Primitive::Mul,
        Primitive::Max,
        Primitive::Min,
        Primitive::Rem,
    ] {
        let program = Program::binary(primitive, Params::new());
        let grid = CaseGrid::new(primitive.as_str(), 2).dtypes(&[DType::F32, DType::I32, DType::U8]);
        assert_grid_passes(primitive.as_str(), &program, grid, |_| RandDefault);
    }
    for primitive in [Primitive::Div, Primitive::Pow, Primitive::Atan2] {
        let program = Program::binary(primitive, Params::new());
        let grid = CaseGrid::new(primitive.as_str(), 2).dtypes(&[DType::F32, DType::F64]);
        assert_grid_passes(primitive.as_str(), &program, grid, |_| RandPositive);
    }
}

#[test]
fn grid_complex_arithmetic() {
    for primitive in [Primitive::Add, Primitive::Mul] {
        let program = Program::binary(primitive, Params::new());
        let grid = CaseGrid::new(primitive.as_str(), 2).dtypes(&[DType::Complex64, DType::Complex128]);
        assert_grid_passes(primitive.as_str(), &program, grid, |_| RandSmall);
    }
}

#[test]
fn grid_comparisons() {
    for primitive in [
        Primitive::Eq,
        Primitive::Ne,
        Primitive::Lt,
        Primitive::Le,
        Primitive::Gt,
        Primitive::Ge,
    ] {
        let program = Program::binary(primitive, Params::new());
        let grid = CaseGrid::new(primitive.as_str(), 2).dtypes(&[DType::F32, DType::I16]);
        assert_grid_passes(primitive.as_str(), &program, grid, |_| RandDefault);
    }
}

#[test]
fn grid_select_with_bool_predicate() {
    init_logging();
    let program = Program::ternary(Primitive::Select, Params::new());
    let group = [Shape::new(&[3, 4]), Shape::new(&[3, 4]), Shape::new(&[3, 4])];
    for bdims in all_bdims(&group) {
        let case = BatchingCase::from_parts(4, &bdims, &group, &[DType::Bool, DType::F32, DType::F32])
            .expect("case");
        let mut generator = RandGenerator::new(RandDefault, 4);
        check_batching(&program, &case, &mut generator, &f32_tol())
            .unwrap_or_else(|err| panic!("select {bdims:?}: {err}"));
    }
}

#[test]
fn grid_clamp() {
    let program = Program::ternary(Primitive::Clamp, Params::new());
    let grid = CaseGrid::new("clamp", 3).shape_groups(shapes(&[&[&[3]], &[&[3, 4]]]));
    assert_grid_passes("clamp", &program, grid, |_| RandDefault);
}

#[test]
fn grid_convert_element_type() {
    for target in ["int32", "float16", "bool"] {
        let program = Program::unary(
            Primitive::ConvertElementType,
            params(&[("new_dtype", target)]),
        );
        let grid = CaseGrid::new(format!("convert_{target}"), 1).dtypes(&[DType::F32, DType::I64]);
        assert_grid_passes("convert_element_type", &program, grid, |_| RandDefault);
    }
}

#[test]
fn grid_bool_logic_via_comparisons() {
    let program = Program::binary(Primitive::Eq, Params::new());
    let grid = CaseGrid::new("eq_bool", 2).dtypes(&[DType::Bool]);
    assert_grid_passes("eq_bool", &program, grid, |_| RandBool);
}

// ── Reductions and scans ───────────────────────────────────────────

#[test]
fn grid_reductions() {
    let rank2_up = shapes(&[&[&[3, 4], &[3, 1], &[1, 4]], &[&[2, 3, 4], &[2, 1, 4]]]);
    for primitive in [
        Primitive::ReduceSum,
        Primitive::ReduceProd,
        Primitive::ReduceMax,
        Primitive::ReduceMin,
    ] {
        for axes in ["", "0", "1", "0,1"] {
            let program = Program::unary(primitive, params(&[("axes", axes)]));
            let grid = CaseGrid::new(format!("{primitive}_axes={axes}"), 1)
                .shape_groups(rank2_up.clone())
                .dtypes(&[DType::F32, DType::I32]);
            assert_grid_passes(primitive.as_str(), &program, grid, |_| RandSmall);
        }
    }
}

#[test]
fn grid_arg_reductions() {
    for primitive in [Primitive::Argmax, Primitive::Argmin] {
        for axis in ["0", "1"] {
            let program = Program::unary(
                primitive,
                params(&[("axis", axis), ("index_dtype", "int32")]),
            );
            let grid = CaseGrid::new(format!("{primitive}_axis={axis}"), 1)
                .shape_groups(shapes(&[&[&[3, 4], &[3, 1]], &[&[2, 3, 4]]]))
                .dtypes(&[DType::F32, DType::I16]);
            assert_grid_passes(primitive.as_str(), &program, grid, |_| RandUniqueInt);
        }
    }
}

#[test]
fn grid_cumulative() {
    for primitive in [
        Primitive::Cumsum,
        Primitive::Cumprod,
        Primitive::Cummax,
        Primitive::Cummin,
    ] {
        for reverse in ["false", "true"] {
            let program = Program::unary(primitive, params(&[("axis", "0"), ("reverse", reverse)]));
            let grid = CaseGrid::new(format!("{primitive}_reverse={reverse}"), 1)
                .dtypes(&[DType::F32, DType::I32]);
            assert_grid_passes(primitive.as_str(), &program, grid, |_| RandSmall);
        }
    }
}

#[test]
fn grid_sort_multiple_results() {
    let grid = CaseGrid::new("sort+argsort", 1)
        .dtypes(&[DType::F32, DType::I32])
        .multiple_results(true);
    assert_grid_passes("sort", &sort_with_indices(), grid, |_| RandUniqueInt);

    let descending = Program::unary(
        Primitive::Sort,
        params(&[("dimension", "0"), ("descending", "true")]),
    );
    let grid = CaseGrid::new("sort_descending", 1).dtypes(&[DType::F64]);
    assert_grid_passes("sort_descending", &descending, grid, |_| RandDefault);
}

// ── Dot ────────────────────────────────────────────────────────────

#[test]
fn grid_dot_all_operand_ranks() {
    let program = Program::binary(Primitive::Dot, Params::new());
    for (lhs, rhs) in [
        (&[3_u32][..], &[3_u32][..]),
        (&[2, 3][..], &[3][..]),
        (&[3][..], &[3, 4][..]),
        (&[2, 3][..], &[3, 4][..]),
    ] {
        let group = vec![Shape::new(lhs), Shape::new(rhs)];
        let id = test_id(module_path!(), "grid_dot_all_operand_ranks");
        for dtype in [DType::F32, DType::I32] {
            for bdims in all_bdims(&group) {
                let case = BatchingCase::from_parts(3, &bdims, &group, &[dtype, dtype])
                    .expect("case");
                let mut generator = RandGenerator::for_test(RandSmall, &id);
                check_batching(&program, &case, &mut generator, &Tolerance::dtype_defaults())
                    .unwrap_or_else(|err| panic!("dot {lhs:?}x{rhs:?} {bdims:?}: {err}"));
            }
        }
    }
}

// ── Shape manipulation ─────────────────────────────────────────────

#[test]
fn grid_shape_ops() {
    let cases: Vec<(&str, Primitive, Params, Vec<Vec<Shape>>)> = vec![
        (
            "reshape",
            Primitive::Reshape,
            params(&[("new_shape", "-1,4")]),
            shapes(&[&[&[2, 3, 4], &[2, 1, 4]]]),
        ),
        (
            "squeeze",
            Primitive::Squeeze,
            params(&[("dimensions", "1")]),
            shapes(&[&[&[3, 1]], &[&[2, 1, 4]]]),
        ),
        (
            "expand_dims",
            Primitive::ExpandDims,
            params(&[("dimensions", "0,2")]),
            shapes(&[&[&[3]], &[&[3, 4]]]),
        ),
        (
            "broadcast",
            Primitive::Broadcast,
            params(&[("sizes", "2")]),
            compatible_shape_groups(),
        ),
        (
            "broadcast_in_dim",
            Primitive::BroadcastInDim,
            params(&[("shape", "2,3,4"), ("broadcast_dimensions", "1,2")]),
            shapes(&[&[&[3, 4], &[3, 1], &[1, 4]]]),
        ),
        (
            "transpose",
            Primitive::Transpose,
            params(&[("permutation", "1,0")]),
            shapes(&[&[&[3, 4], &[3, 1], &[1, 4]]]),
        ),
        (
            "transpose_default",
            Primitive::Transpose,
            Params::new(),
            compatible_shape_groups(),
        ),
        (
            "slice",
            Primitive::Slice,
            params(&[
                ("start_indices", "0,1"),
                ("limit_indices", "3,4"),
                ("strides", "2,1"),
            ]),
            shapes(&[&[&[3, 4]]]),
        ),
        (
            "rev",
            Primitive::Rev,
            params(&[("dimensions", "0")]),
            compatible_shape_groups(),
        ),
    ];
    for (name, primitive, op_params, groups) in cases {
        let program = Program::unary(primitive, op_params);
        let grid = CaseGrid::new(name, 1)
            .shape_groups(groups)
            .dtypes(&[DType::F32, DType::Bool]);
        assert_grid_passes(name, &program, grid, |_| RandDefault);
    }
}

#[test]
fn grid_pad_with_scalar_padding_value() {
    init_logging();
    let program = Program::binary(
        Primitive::Pad,
        params(&[
            ("padding_low", "1,-1"),
            ("padding_high", "0,2"),
            ("padding_interior", "0,1"),
        ]),
    );
    let group = [Shape::new(&[3, 4]), Shape::scalar()];
    for bdims in all_bdims(&group) {
        let case = BatchingCase::from_parts(5, &bdims, &group, &[DType::F32, DType::F32])
            .expect("case");
        let mut generator = RandGenerator::new(RandDefault, 12);
        check_batching(&program, &case, &mut generator, &f32_tol())
            .unwrap_or_else(|err| panic!("pad {bdims:?}: {err}"));
    }
}

#[test]
fn grid_concatenate() {
    for dimension in ["0", "1"] {
        let program = Program::binary(Primitive::Concatenate, params(&[("dimension", dimension)]));
        let grid = CaseGrid::new(format!("concatenate_dim={dimension}"), 2)
            .shape_groups(shapes(&[&[&[3, 4]], &[&[2, 3, 4]]]))
            .dtypes(&[DType::F32, DType::U16]);
        assert_grid_passes("concatenate", &program, grid, |_| RandDefault);
    }
}

// ── Composite programs ─────────────────────────────────────────────

#[test]
fn grid_composite_program_with_literals() {
    let mut builder = ProgramBuilder::new();
    let x = builder.input();
    let y = builder.input();
    let scaled = builder.push(
        Primitive::Mul,
        [Atom::Var(x), Atom::Lit(bc_core::Literal::from_f64(2.0))],
        Params::new(),
    );
    let summed = builder.push(Primitive::Add, [Atom::Var(scaled), Atom::Var(y)], Params::new());
    let squashed = builder.push(Primitive::Tanh, [Atom::Var(summed)], Params::new());
    let reduced = builder.push(
        Primitive::ReduceSum,
        [Atom::Var(squashed)],
        params(&[("axes", "0")]),
    );
    builder.output(reduced);
    let program = builder.build();

    let grid = CaseGrid::new("composite", 2)
        .shape_groups(shapes(&[&[&[3, 4], &[3, 1], &[1, 4]]]))
        .dtypes(&[DType::F32, DType::F64]);
    assert_grid_passes("composite", &program, grid, |_| RandDefault);
}
