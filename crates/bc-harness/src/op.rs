//! Operations under test.
//!
//! A [`BatchableOp`] pairs a direct evaluation with its vectorized form so the
//! checker can compare the two. Programs implement it through the
//! interpreter and the `vmap` transform; [`FnOp`] wraps arbitrary closures.

use bc_batching::{BatchError, loop_and_stack, vmap};
use bc_core::{BatchDim, Program, Value, ValueError};
use bc_interpreters::{InterpreterError, eval_program};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    Interpreter(InterpreterError),
    Batch(BatchError),
    Tensor(ValueError),
    Custom(String),
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interpreter(err) => write!(f, "evaluation failed: {err}"),
            Self::Batch(err) => write!(f, "vectorized evaluation failed: {err}"),
            Self::Tensor(err) => write!(f, "tensor error: {err}"),
            Self::Custom(detail) => f.write_str(detail),
        }
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Interpreter(err) => Some(err),
            Self::Batch(err) => Some(err),
            Self::Tensor(err) => Some(err),
            Self::Custom(_) => None,
        }
    }
}

impl From<InterpreterError> for OpError {
    fn from(value: InterpreterError) -> Self {
        Self::Interpreter(value)
    }
}

impl From<BatchError> for OpError {
    fn from(value: BatchError) -> Self {
        Self::Batch(value)
    }
}

impl From<ValueError> for OpError {
    fn from(value: ValueError) -> Self {
        Self::Tensor(value)
    }
}

/// An operation with a direct and a vectorized evaluation path.
pub trait BatchableOp: Sync {
    fn name(&self) -> String;

    /// Evaluate on one unbatched set of arguments.
    fn eval(&self, args: &[Value]) -> Result<Vec<Value>, OpError>;

    /// Evaluate over a batch in one pass. Every output must carry the batch
    /// dimension (of size `axis_size`) at axis 0.
    fn eval_vmapped(
        &self,
        args: &[Value],
        in_axes: &[BatchDim],
        axis_size: usize,
    ) -> Result<Vec<Value>, OpError>;
}

impl BatchableOp for Program {
    fn name(&self) -> String {
        self.label()
    }

    fn eval(&self, args: &[Value]) -> Result<Vec<Value>, OpError> {
        Ok(eval_program(self, args)?)
    }

    fn eval_vmapped(
        &self,
        args: &[Value],
        in_axes: &[BatchDim],
        axis_size: usize,
    ) -> Result<Vec<Value>, OpError> {
        Ok(vmap(self, args, in_axes, Some(axis_size))?)
    }
}

/// A program whose vectorized path is the explicit per-slice loop.
#[derive(Debug, Clone)]
pub struct Looped(pub Program);

impl BatchableOp for Looped {
    fn name(&self) -> String {
        format!("looped({})", self.0.label())
    }

    fn eval(&self, args: &[Value]) -> Result<Vec<Value>, OpError> {
        Ok(eval_program(&self.0, args)?)
    }

    fn eval_vmapped(
        &self,
        args: &[Value],
        in_axes: &[BatchDim],
        axis_size: usize,
    ) -> Result<Vec<Value>, OpError> {
        Ok(loop_and_stack(&self.0, args, in_axes, Some(axis_size))?)
    }
}

/// An operation built from a pair of closures.
pub struct FnOp<F, V> {
    name: String,
    eval: F,
    vmapped: V,
}

impl<F, V> FnOp<F, V>
where
    F: Fn(&[Value]) -> Result<Vec<Value>, OpError> + Sync,
    V: Fn(&[Value], &[BatchDim], usize) -> Result<Vec<Value>, OpError> + Sync,
{
    pub fn new(name: impl Into<String>, eval: F, vmapped: V) -> Self {
        Self {
            name: name.into(),
            eval,
            vmapped,
        }
    }
}

impl<F, V> BatchableOp for FnOp<F, V>
where
    F: Fn(&[Value]) -> Result<Vec<Value>, OpError> + Sync,
    V: Fn(&[Value], &[BatchDim], usize) -> Result<Vec<Value>, OpError> + Sync,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn eval(&self, args: &[Value]) -> Result<Vec<Value>, OpError> {
        (self.eval)(args)
    }

    fn eval_vmapped(
        &self,
        args: &[Value],
        in_axes: &[BatchDim],
        axis_size: usize,
    ) -> Result<Vec<Value>, OpError> {
        (self.vmapped)(args, in_axes, axis_size)
    }
}

impl<F, V> std::fmt::Debug for FnOp<F, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnOp").field("name", &self.name).finish()
    }
}
