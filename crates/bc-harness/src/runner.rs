use bc_test_utils::seed_for;
use log::info;
use rayon::prelude::*;

use crate::check::{CheckError, CheckReport, check_batching};
use crate::generator::{RandGenerator, Strategy};
use crate::grid::GridCase;
use crate::op::BatchableOp;
use crate::tolerance::Tolerance;

#[derive(Debug, Clone, Default)]
pub struct GridSummary {
    pub passed: usize,
    pub reports: Vec<(String, CheckReport)>,
    pub failures: Vec<(String, CheckError)>,
}

impl GridSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.passed + self.failures.len()
    }
}

/// Check every case in parallel. Each case gets its own generator, seeded
/// from the case name, so results do not depend on scheduling.
pub fn run_grid<O, S, F>(
    op: &O,
    cases: &[GridCase],
    strategy_factory: F,
    tolerance: &Tolerance,
) -> GridSummary
where
    O: BatchableOp + ?Sized,
    S: Strategy,
    F: Fn(&GridCase) -> S + Sync,
{
    let outcomes: Vec<(String, Result<CheckReport, CheckError>)> = cases
        .par_iter()
        .map(|grid_case| {
            let mut generator =
                RandGenerator::new(strategy_factory(grid_case), seed_for(&grid_case.name));
            let outcome = check_batching(op, &grid_case.case, &mut generator, tolerance);
            (grid_case.name.clone(), outcome)
        })
        .collect();

    let mut summary = GridSummary::default();
    for (name, outcome) in outcomes {
        match outcome {
            Ok(report) => {
                summary.passed += 1;
                summary.reports.push((name, report));
            }
            Err(err) => summary.failures.push((name, err)),
        }
    }
    info!(
        "{}: {}/{} cases passed",
        op.name(),
        summary.passed,
        summary.total()
    );
    summary
}
