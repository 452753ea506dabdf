use bc_core::{DType, Literal, Shape, TensorValue, Value};
use log::trace;
use serde::{Deserialize, Serialize};

use crate::check::CheckError;

/// Absolute and relative closeness bounds, optionally overridden per dtype.
///
/// Integer and boolean outputs always compare exactly, whatever the bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
    overrides: Vec<(DType, f64, f64)>,
}

impl Tolerance {
    #[must_use]
    pub fn new(atol: f64, rtol: f64) -> Self {
        Self {
            atol,
            rtol,
            overrides: Vec::new(),
        }
    }

    #[must_use]
    pub fn exact() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Replace the bounds used for outputs of `dtype`.
    #[must_use]
    pub fn with_dtype(mut self, dtype: DType, atol: f64, rtol: f64) -> Self {
        self.overrides.retain(|(existing, _, _)| *existing != dtype);
        self.overrides.push((dtype, atol, rtol));
        self
    }

    /// Opt-in per-dtype table keyed on storage precision. Complex dtypes use
    /// the bounds of their component width.
    #[must_use]
    pub fn dtype_defaults() -> Self {
        [
            (DType::BF16, 1e-2),
            (DType::F16, 1e-3),
            (DType::F32, 1e-6),
            (DType::F64, 1e-15),
            (DType::Complex64, 1e-6),
            (DType::Complex128, 1e-15),
        ]
        .into_iter()
        .fold(Self::exact(), |tol, (dtype, bound)| {
            tol.with_dtype(dtype, bound, bound)
        })
    }

    /// `(atol, rtol)` in effect for `dtype`.
    #[must_use]
    pub fn bounds_for(&self, dtype: DType) -> (f64, f64) {
        if dtype.is_exact() {
            return (0.0, 0.0);
        }
        self.overrides
            .iter()
            .find(|(candidate, _, _)| *candidate == dtype)
            .map_or((self.atol, self.rtol), |&(_, atol, rtol)| (atol, rtol))
    }
}

/// Comparison summary for one output that passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDiff {
    pub output: usize,
    pub shape: Shape,
    pub dtype: DType,
    /// Largest finite `|candidate - reference|`; NaN and infinity matches
    /// contribute nothing.
    pub max_abs_diff: f64,
}

/// Check every candidate output against its reference: arity, then shape,
/// then dtype, then element count, then elementwise closeness.
pub fn assert_all_close(
    candidate: &[Value],
    reference: &[Value],
    tolerance: &Tolerance,
) -> Result<Vec<OutputDiff>, CheckError> {
    if candidate.len() != reference.len() {
        return Err(CheckError::OutputArity {
            candidate: candidate.len(),
            reference: reference.len(),
        });
    }
    candidate
        .iter()
        .zip(reference)
        .enumerate()
        .map(|(output, (cand, refv))| {
            compare_output(output, &cand.to_tensor(), &refv.to_tensor(), tolerance)
        })
        .collect()
}

fn compare_output(
    output: usize,
    candidate: &TensorValue,
    reference: &TensorValue,
    tolerance: &Tolerance,
) -> Result<OutputDiff, CheckError> {
    if candidate.shape != reference.shape {
        return Err(CheckError::ShapeMismatch {
            output,
            candidate: candidate.shape.clone(),
            reference: reference.shape.clone(),
        });
    }
    if candidate.dtype != reference.dtype {
        return Err(CheckError::DTypeMismatch {
            output,
            candidate: candidate.dtype,
            reference: reference.dtype,
        });
    }

    let expected = reference
        .shape
        .element_count_usize()
        .unwrap_or(usize::MAX);
    if candidate.elements.len() != expected || reference.elements.len() != expected {
        return Err(CheckError::ElementCountMismatch {
            output,
            expected,
            candidate: candidate.elements.len(),
            reference: reference.elements.len(),
        });
    }

    let dtype = reference.dtype;
    let (atol, rtol) = tolerance.bounds_for(dtype);
    let mut max_abs_diff = 0.0_f64;
    for (index, (&cand, &refv)) in candidate.elements.iter().zip(&reference.elements).enumerate() {
        let mismatch = || CheckError::ValueMismatch {
            output,
            index,
            candidate: cand,
            reference: refv,
            atol,
            rtol,
        };
        if dtype.is_exact() {
            if cand.as_i128() != refv.as_i128() {
                return Err(mismatch());
            }
            continue;
        }
        let parts = if dtype.is_complex() {
            complex_parts(cand).zip(complex_parts(refv))
        } else {
            cand.as_f64()
                .zip(refv.as_f64())
                .map(|(c, r)| ([c, 0.0], [r, 0.0]))
        };
        let Some((cand_parts, ref_parts)) = parts else {
            return Err(mismatch());
        };
        for (c, r) in cand_parts.into_iter().zip(ref_parts) {
            match close_within(c, r, atol, rtol) {
                Some(diff) => max_abs_diff = max_abs_diff.max(diff),
                None => return Err(mismatch()),
            }
        }
    }
    trace!("output {output}: shape={} dtype={dtype} max_abs_diff={max_abs_diff:e}", reference.shape);
    Ok(OutputDiff {
        output,
        shape: reference.shape.clone(),
        dtype,
        max_abs_diff,
    })
}

fn complex_parts(literal: Literal) -> Option<[f64; 2]> {
    literal.as_complex128().map(|(re, im)| [re, im])
}

/// `Some(|c - r|)` when `c` is close to `r`. NaNs match NaNs and infinities
/// match infinities of the same sign, both contributing a zero difference.
fn close_within(c: f64, r: f64, atol: f64, rtol: f64) -> Option<f64> {
    if c.is_nan() || r.is_nan() {
        return (c.is_nan() && r.is_nan()).then_some(0.0);
    }
    if c.is_infinite() || r.is_infinite() {
        return (c == r).then_some(0.0);
    }
    let diff = (c - r).abs();
    (diff <= atol + rtol * r.abs()).then_some(diff)
}
