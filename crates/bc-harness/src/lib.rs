#![forbid(unsafe_code)]

//! Batch-equivalence checking.
//!
//! [`check_batching`] asserts that evaluating an operation over a batch in
//! one vectorized pass gives the same result as evaluating it once per batch
//! slice and stacking. Grids of cases come from [`grid`] and run in parallel
//! through [`run_grid`].

pub mod case;
pub mod check;
pub mod generator;
pub mod grid;
pub mod op;
pub mod runner;
pub mod tolerance;

pub use case::{BatchingCase, OperandSpec};
pub use check::{CheckError, CheckReport, check_batching};
pub use generator::{
    GeneratorError, RandBool, RandDefault, RandGenerator, RandPositive, RandSmall, RandUniform,
    RandUniqueInt, Strategy, ValueGenerator,
};
pub use grid::{
    COMPATIBLE_SHAPES, CaseGrid, GridCase, all_bdims, cases_from_list,
    combinations_with_replacement, compatible_shape_groups,
};
pub use op::{BatchableOp, FnOp, Looped, OpError};
pub use runner::{GridSummary, run_grid};
pub use tolerance::{OutputDiff, Tolerance, assert_all_close};
