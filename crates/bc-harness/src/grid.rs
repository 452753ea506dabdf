//! Parameter grids over shapes, dtypes, and batch-dimension placements.

use bc_core::{BatchDim, DType, Shape, format_csv};
use rand::SeedableRng;
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;

use crate::case::{BatchingCase, OperandSpec};

/// Groups of mutually broadcast-compatible shapes.
pub const COMPATIBLE_SHAPES: &[&[&[u32]]] = &[
    &[&[3]],
    &[&[3, 4], &[3, 1], &[1, 4]],
    &[&[2, 3, 4], &[2, 1, 4]],
];

#[must_use]
pub fn compatible_shape_groups() -> Vec<Vec<Shape>> {
    COMPATIBLE_SHAPES
        .iter()
        .map(|group| group.iter().map(|dims| Shape::new(dims)).collect())
        .collect()
}

/// Every batch-dimension assignment for `shapes`: each operand is either
/// unbatched or batched at any of its `rank + 1` insertion points. The
/// all-unbatched assignment is excluded.
#[must_use]
pub fn all_bdims(shapes: &[Shape]) -> Vec<Vec<BatchDim>> {
    let mut out: Vec<Vec<BatchDim>> = vec![Vec::new()];
    for shape in shapes {
        let choices: Vec<BatchDim> = std::iter::once(BatchDim::NotBatched)
            .chain((0..=shape.rank()).map(BatchDim::Batched))
            .collect();
        out = out
            .into_iter()
            .flat_map(|prefix| {
                choices.iter().map(move |&choice| {
                    let mut next = prefix.clone();
                    next.push(choice);
                    next
                })
            })
            .collect();
    }
    out.retain(|bdims| bdims.iter().any(|bdim| bdim.is_batched()));
    out
}

/// `k`-element multisets of `items` in lexicographic index order.
#[must_use]
pub fn combinations_with_replacement<T: Clone>(items: &[T], k: usize) -> Vec<Vec<T>> {
    fn extend<T: Clone>(items: &[T], start: usize, k: usize, acc: &mut Vec<T>, out: &mut Vec<Vec<T>>) {
        if acc.len() == k {
            out.push(acc.clone());
            return;
        }
        for index in start..items.len() {
            acc.push(items[index].clone());
            extend(items, index, k, acc, out);
            acc.pop();
        }
    }
    let mut out = Vec::new();
    extend(items, 0, k, &mut Vec::with_capacity(k), &mut out);
    out
}

/// Keep at most `limit` items, chosen deterministically from `seed`, in
/// their original order.
pub fn cases_from_list<T>(items: impl IntoIterator<Item = T>, limit: usize, seed: u64) -> Vec<T> {
    let items: Vec<T> = items.into_iter().collect();
    if items.len() <= limit {
        return items;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut chosen = sample(&mut rng, items.len(), limit).into_vec();
    chosen.sort_unstable();
    let mut keep = vec![false; items.len()];
    for index in chosen {
        keep[index] = true;
    }
    items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, kept)| kept.then_some(item))
        .collect()
}

/// A named batching case from a grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCase {
    pub name: String,
    pub case: BatchingCase,
}

fn format_shapes(shapes: &[Shape]) -> String {
    shapes
        .iter()
        .map(|shape| format!("[{}]", format_csv(&shape.dims)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Builder for the Cartesian product of shape groups, dtypes, and batch-dim
/// placements for an `arity`-operand operation.
#[derive(Debug, Clone)]
pub struct CaseGrid {
    op_name: String,
    arity: usize,
    shape_groups: Vec<Vec<Shape>>,
    dtypes: Vec<DType>,
    batch_size: usize,
    multiple_results: bool,
}

impl CaseGrid {
    #[must_use]
    pub fn new(op_name: impl Into<String>, arity: usize) -> Self {
        Self {
            op_name: op_name.into(),
            arity,
            shape_groups: compatible_shape_groups(),
            dtypes: vec![DType::F32],
            batch_size: 10,
            multiple_results: false,
        }
    }

    #[must_use]
    pub fn shape_groups(mut self, groups: Vec<Vec<Shape>>) -> Self {
        self.shape_groups = groups;
        self
    }

    #[must_use]
    pub fn dtypes(mut self, dtypes: &[DType]) -> Self {
        self.dtypes = dtypes.to_vec();
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn multiple_results(mut self, multiple_results: bool) -> Self {
        self.multiple_results = multiple_results;
        self
    }

    /// Every case in the grid, in group, shape, batch-dim, dtype order.
    pub fn cases(&self) -> impl Iterator<Item = GridCase> + '_ {
        self.shape_groups.iter().flat_map(move |group| {
            combinations_with_replacement(group, self.arity)
                .into_iter()
                .flat_map(move |shapes| {
                    all_bdims(&shapes).into_iter().flat_map(move |bdims| {
                        let shapes = shapes.clone();
                        self.dtypes
                            .iter()
                            .map(move |&dtype| self.grid_case(&shapes, &bdims, dtype))
                    })
                })
        })
    }

    fn grid_case(&self, shapes: &[Shape], bdims: &[BatchDim], dtype: DType) -> GridCase {
        let dtypes = vec![dtype; shapes.len()];
        let name = format!(
            "{}_shapes={}_dtypes={}_bdims={}",
            self.op_name,
            format_shapes(shapes),
            format_csv(&dtypes),
            format_csv(bdims)
        );
        let operands = shapes
            .iter()
            .zip(bdims)
            .map(|(shape, &bdim)| OperandSpec::new(shape.clone(), dtype, bdim))
            .collect();
        GridCase {
            name,
            case: BatchingCase {
                batch_size: self.batch_size,
                operands,
                multiple_results: self.multiple_results,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_bdims_enumerates_insertion_points() {
        let bdims = all_bdims(&[Shape::vector(3)]);
        assert_eq!(
            bdims,
            vec![vec![BatchDim::Batched(0)], vec![BatchDim::Batched(1)]]
        );

        // (1 + 2) * (1 + 3) placements minus the all-unbatched one.
        let bdims = all_bdims(&[Shape::vector(3), Shape::new(&[3, 4])]);
        assert_eq!(bdims.len(), 11);
        assert_eq!(bdims[0], vec![BatchDim::NotBatched, BatchDim::Batched(0)]);
        assert!(bdims.iter().all(|b| b.iter().any(|d| d.is_batched())));
    }

    #[test]
    fn combinations_with_replacement_matches_multiset_count() {
        let combos = combinations_with_replacement(&['a', 'b', 'c'], 2);
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0], vec!['a', 'a']);
        assert_eq!(combos[5], vec!['c', 'c']);
        assert_eq!(combinations_with_replacement(&[1, 2], 0), vec![Vec::<i32>::new()]);
    }

    #[test]
    fn cases_from_list_is_deterministic_and_ordered() {
        let a = cases_from_list(0..100, 10, 7);
        let b = cases_from_list(0..100, 10, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(cases_from_list(0..3, 10, 7), vec![0, 1, 2]);
    }

    #[test]
    fn grid_names_are_descriptive_and_unique() {
        let grid = CaseGrid::new("add", 2).dtypes(&[DType::F32, DType::I32]);
        let cases: Vec<GridCase> = grid.cases().collect();
        let first = &cases[0];
        assert_eq!(
            first.name,
            "add_shapes=[3],[3]_dtypes=float32,float32_bdims=None,0"
        );
        let mut names: Vec<&str> = cases.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), cases.len());
        assert!(cases.iter().all(|c| c.case.batch_size == 10));
    }
}
