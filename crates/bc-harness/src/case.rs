use bc_core::{BatchDim, DType, Shape, ValueError};
use serde::{Deserialize, Serialize};

use crate::check::CheckError;

/// One operand of a batching case: its unbatched shape, element type, and
/// where the batch axis goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandSpec {
    pub shape: Shape,
    pub dtype: DType,
    pub batch_dim: BatchDim,
}

impl OperandSpec {
    #[must_use]
    pub fn new(shape: Shape, dtype: DType, batch_dim: BatchDim) -> Self {
        Self {
            shape,
            dtype,
            batch_dim,
        }
    }

    /// Shape with `batch_size` spliced in at the batch axis. Batch sizes
    /// beyond a `u32` dimension overflow the shape.
    pub fn batched_shape(&self, batch_size: usize) -> Result<Shape, ValueError> {
        let size = u32::try_from(batch_size).map_err(|_| ValueError::ShapeOverflow {
            shape: self.shape.clone(),
        })?;
        self.batch_dim.batched_shape(&self.shape, size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingCase {
    pub batch_size: usize,
    pub operands: Vec<OperandSpec>,
    pub multiple_results: bool,
}

impl BatchingCase {
    /// Assemble a case from parallel per-operand sequences.
    pub fn from_parts(
        batch_size: usize,
        batch_dims: &[BatchDim],
        shapes: &[Shape],
        dtypes: &[DType],
    ) -> Result<Self, CheckError> {
        if shapes.len() != batch_dims.len() || dtypes.len() != batch_dims.len() {
            return Err(CheckError::OperandCountMismatch {
                batch_dims: batch_dims.len(),
                shapes: shapes.len(),
                dtypes: dtypes.len(),
            });
        }
        let operands = batch_dims
            .iter()
            .zip(shapes)
            .zip(dtypes)
            .map(|((&batch_dim, shape), &dtype)| OperandSpec::new(shape.clone(), dtype, batch_dim))
            .collect();
        Ok(Self {
            batch_size,
            operands,
            multiple_results: false,
        })
    }

    #[must_use]
    pub fn with_multiple_results(mut self, multiple_results: bool) -> Self {
        self.multiple_results = multiple_results;
        self
    }

    #[must_use]
    pub fn batch_dims(&self) -> Vec<BatchDim> {
        self.operands.iter().map(|operand| operand.batch_dim).collect()
    }

    #[must_use]
    pub fn shapes(&self) -> Vec<Shape> {
        self.operands.iter().map(|operand| operand.shape.clone()).collect()
    }
}
