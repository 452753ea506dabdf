#![forbid(unsafe_code)]

mod dtype;
mod program;

pub use dtype::DType;
pub use program::{Atom, Equation, Program, ProgramBuilder, ProgramValidationError, VarId};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Primitive parameters, keyed by name. List-valued parameters are
/// comma-separated (`"0,2"`), booleans are `"true"`/`"false"`.
pub type Params = BTreeMap<String, String>;

#[must_use]
pub fn format_csv<T: std::fmt::Display>(items: &[T]) -> String {
    let mut out = String::new();
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        let _ = write!(&mut out, "{item}");
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn new(dims: &[u32]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }

    pub fn element_count_usize(&self) -> Result<usize, ValueError> {
        self.element_count()
            .and_then(|count| usize::try_from(count).ok())
            .ok_or_else(|| ValueError::ShapeOverflow {
                shape: self.clone(),
            })
    }

    /// Row-major strides in elements.
    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1_usize; self.rank()];
        for axis in (0..self.rank().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1].saturating_mul(self.dims[axis + 1] as usize);
        }
        strides
    }

    pub fn with_inserted_axis(&self, axis: usize, size: u32) -> Result<Self, ValueError> {
        if axis > self.rank() {
            return Err(ValueError::AxisOutOfBounds {
                axis,
                rank: self.rank() + 1,
            });
        }
        let mut dims = self.dims.clone();
        dims.insert(axis, size);
        Ok(Self { dims })
    }

    pub fn with_removed_axis(&self, axis: usize) -> Result<Self, ValueError> {
        if axis >= self.rank() {
            return Err(ValueError::AxisOutOfBounds {
                axis,
                rank: self.rank(),
            });
        }
        let mut dims = self.dims.clone();
        dims.remove(axis);
        Ok(Self { dims })
    }

    /// Right-aligned broadcast of several shapes. Rank-0 shapes broadcast to
    /// anything; size-1 dims stretch to the other operand's size.
    pub fn broadcast_shapes(shapes: &[&Shape]) -> Result<Self, ValueError> {
        let rank = shapes.iter().map(|shape| shape.rank()).max().unwrap_or(0);
        let mut dims = vec![1_u32; rank];
        for shape in shapes {
            let offset = rank - shape.rank();
            for (idx, &dim) in shape.dims.iter().enumerate() {
                let slot = &mut dims[offset + idx];
                if *slot == 1 {
                    *slot = dim;
                } else if dim != 1 && dim != *slot {
                    return Err(ValueError::IncompatibleBroadcast {
                        shapes: shapes.iter().map(|shape| (*shape).clone()).collect(),
                    });
                }
            }
        }
        Ok(Self { dims })
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_char('(')?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        if self.rank() == 1 {
            f.write_char(',')?;
        }
        f.write_char(')')
    }
}

/// Per-operand batch axis: absent, or the position of the batch dimension
/// within the batched operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchDim {
    NotBatched,
    Batched(usize),
}

impl BatchDim {
    #[must_use]
    pub fn axis(self) -> Option<usize> {
        match self {
            Self::NotBatched => None,
            Self::Batched(axis) => Some(axis),
        }
    }

    #[must_use]
    pub fn is_batched(self) -> bool {
        matches!(self, Self::Batched(_))
    }

    /// Shape of the operand after splicing `batch_size` in at the batch axis.
    pub fn batched_shape(self, shape: &Shape, batch_size: u32) -> Result<Shape, ValueError> {
        match self {
            Self::NotBatched => Ok(shape.clone()),
            Self::Batched(axis) => shape.with_inserted_axis(axis, batch_size),
        }
    }

    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.eq_ignore_ascii_case("none") {
            return Some(Self::NotBatched);
        }
        token.parse::<usize>().ok().map(Self::Batched)
    }

    /// Parse a comma-separated list such as `"0,none,1"`.
    #[must_use]
    pub fn parse_list(text: &str) -> Option<Vec<Self>> {
        if text.trim().is_empty() {
            return Some(Vec::new());
        }
        text.split(',').map(Self::parse).collect()
    }
}

impl std::fmt::Display for BatchDim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotBatched => f.write_str("None"),
            Self::Batched(axis) => write!(f, "{axis}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Primitive {
    // Elementwise unary
    Neg,
    Abs,
    Sign,
    Floor,
    Ceil,
    Round,
    Exp,
    Log,
    Log1p,
    Expm1,
    Sqrt,
    Rsqrt,
    Sin,
    Cos,
    Tan,
    Tanh,
    Logistic,
    Square,
    // Elementwise binary
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Max,
    Min,
    Atan2,
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Selection and clamping
    Select,
    Clamp,
    ConvertElementType,
    // Dot product
    Dot,
    // Reduction
    ReduceSum,
    ReduceProd,
    ReduceMax,
    ReduceMin,
    Argmax,
    Argmin,
    // Cumulative
    Cumsum,
    Cumprod,
    Cummax,
    Cummin,
    // Sorting
    Sort,
    Argsort,
    // Shape manipulation
    Reshape,
    Squeeze,
    ExpandDims,
    Broadcast,
    BroadcastInDim,
    Transpose,
    Slice,
    Pad,
    Concatenate,
    Rev,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Sign => "sign",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Round => "round",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Log1p => "log1p",
            Self::Expm1 => "expm1",
            Self::Sqrt => "sqrt",
            Self::Rsqrt => "rsqrt",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Tanh => "tanh",
            Self::Logistic => "logistic",
            Self::Square => "square",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Rem => "rem",
            Self::Pow => "pow",
            Self::Max => "max",
            Self::Min => "min",
            Self::Atan2 => "atan2",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Select => "select",
            Self::Clamp => "clamp",
            Self::ConvertElementType => "convert_element_type",
            Self::Dot => "dot",
            Self::ReduceSum => "reduce_sum",
            Self::ReduceProd => "reduce_prod",
            Self::ReduceMax => "reduce_max",
            Self::ReduceMin => "reduce_min",
            Self::Argmax => "argmax",
            Self::Argmin => "argmin",
            Self::Cumsum => "cumsum",
            Self::Cumprod => "cumprod",
            Self::Cummax => "cummax",
            Self::Cummin => "cummin",
            Self::Sort => "sort",
            Self::Argsort => "argsort",
            Self::Reshape => "reshape",
            Self::Squeeze => "squeeze",
            Self::ExpandDims => "expand_dims",
            Self::Broadcast => "broadcast",
            Self::BroadcastInDim => "broadcast_in_dim",
            Self::Transpose => "transpose",
            Self::Slice => "slice",
            Self::Pad => "pad",
            Self::Concatenate => "concatenate",
            Self::Rev => "rev",
        }
    }

    #[must_use]
    pub fn is_elementwise_unary(self) -> bool {
        matches!(
            self,
            Self::Neg
                | Self::Abs
                | Self::Sign
                | Self::Floor
                | Self::Ceil
                | Self::Round
                | Self::Exp
                | Self::Log
                | Self::Log1p
                | Self::Expm1
                | Self::Sqrt
                | Self::Rsqrt
                | Self::Sin
                | Self::Cos
                | Self::Tan
                | Self::Tanh
                | Self::Logistic
                | Self::Square
                | Self::ConvertElementType
        )
    }

    #[must_use]
    pub fn is_elementwise_binary(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Sub
                | Self::Mul
                | Self::Div
                | Self::Rem
                | Self::Pow
                | Self::Max
                | Self::Min
                | Self::Atan2
        ) || self.is_comparison()
    }

    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// Every primitive whose output element depends only on the input
    /// elements at the same (broadcast) position.
    #[must_use]
    pub fn is_elementwise(self) -> bool {
        self.is_elementwise_unary()
            || self.is_elementwise_binary()
            || matches!(self, Self::Select | Self::Clamp)
    }
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    U64(u64),
    Bool(bool),
    F64Bits(u64),
    Complex64Bits(u32, u32),
    Complex128Bits(u64, u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn from_complex64(re: f32, im: f32) -> Self {
        Self::Complex64Bits(re.to_bits(), im.to_bits())
    }

    #[must_use]
    pub fn from_complex128(re: f64, im: f64) -> Self {
        Self::Complex128Bits(re.to_bits(), im.to_bits())
    }

    /// Real value of a non-complex literal. Booleans read as 0 or 1.
    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::U64(value) => Some(value as f64),
            Self::Bool(value) => Some(if value { 1.0 } else { 0.0 }),
            Self::Complex64Bits(..) | Self::Complex128Bits(..) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::U64(value) => i64::try_from(value).ok(),
            Self::Bool(value) => Some(i64::from(value)),
            Self::F64Bits(_) | Self::Complex64Bits(..) | Self::Complex128Bits(..) => None,
        }
    }

    #[must_use]
    pub fn as_i128(self) -> Option<i128> {
        match self {
            Self::I64(value) => Some(i128::from(value)),
            Self::U64(value) => Some(i128::from(value)),
            Self::Bool(value) => Some(i128::from(value)),
            Self::F64Bits(_) | Self::Complex64Bits(..) | Self::Complex128Bits(..) => None,
        }
    }

    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            Self::I64(value) => Some(value != 0),
            Self::U64(value) => Some(value != 0),
            Self::F64Bits(bits) => Some(f64::from_bits(bits) != 0.0),
            Self::Complex64Bits(..) | Self::Complex128Bits(..) => None,
        }
    }

    #[must_use]
    pub fn as_complex64(self) -> Option<(f32, f32)> {
        match self {
            Self::Complex64Bits(re, im) => Some((f32::from_bits(re), f32::from_bits(im))),
            _ => None,
        }
    }

    /// Complex view of any literal; real values get a zero imaginary part.
    #[must_use]
    pub fn as_complex128(self) -> Option<(f64, f64)> {
        match self {
            Self::Complex128Bits(re, im) => Some((f64::from_bits(re), f64::from_bits(im))),
            Self::Complex64Bits(re, im) => Some((
                f64::from(f32::from_bits(re)),
                f64::from(f32::from_bits(im)),
            )),
            other => other.as_f64().map(|re| (re, 0.0)),
        }
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::I64(_) | Self::U64(_))
    }

    #[must_use]
    pub fn is_complex(self) -> bool {
        matches!(self, Self::Complex64Bits(..) | Self::Complex128Bits(..))
    }

    #[must_use]
    pub fn is_nan(self) -> bool {
        match self {
            Self::F64Bits(bits) => f64::from_bits(bits).is_nan(),
            Self::Complex64Bits(re, im) => {
                f32::from_bits(re).is_nan() || f32::from_bits(im).is_nan()
            }
            Self::Complex128Bits(re, im) => {
                f64::from_bits(re).is_nan() || f64::from_bits(im).is_nan()
            }
            Self::I64(_) | Self::U64(_) | Self::Bool(_) => false,
        }
    }

    /// The dtype a bare scalar literal carries when it has no tensor context.
    #[must_use]
    pub fn natural_dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::U64(_) => DType::U64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
            Self::Complex64Bits(..) => DType::Complex64,
            Self::Complex128Bits(..) => DType::Complex128,
        }
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::I64(value) => write!(f, "{value}"),
            Self::U64(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::F64Bits(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Self::Complex64Bits(..) | Self::Complex128Bits(..) => {
                let (re, im) = self.as_complex128().unwrap_or((f64::NAN, f64::NAN));
                write!(f, "{re}{im:+}j")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
}

impl Value {
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::Scalar(Literal::Bool(value))
    }

    #[must_use]
    pub fn scalar_complex128(re: f64, im: f64) -> Self {
        Self::Scalar(Literal::from_complex128(re, im))
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::I64).collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::I64,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        Self::from_f64s(DType::F64, &[values.len() as u32], values)
    }

    /// Tensor of `dtype` with the given dims, each value rounded to `dtype`.
    pub fn from_f64s(dtype: DType, dims: &[u32], values: &[f64]) -> Result<Self, ValueError> {
        Ok(Self::Tensor(TensorValue::from_f64s(
            dtype,
            Shape::new(dims),
            values,
        )?))
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(lit) => Some(*lit),
            Self::Tensor(tensor) if tensor.rank() == 0 => tensor.elements.first().copied(),
            Self::Tensor(_) => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        self.as_scalar_literal().and_then(Literal::as_f64)
    }

    #[must_use]
    pub fn as_i64_scalar(&self) -> Option<i64> {
        self.as_scalar_literal().and_then(Literal::as_i64)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Scalar(lit) => lit.natural_dtype(),
            Self::Tensor(tensor) => tensor.dtype,
        }
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            Self::Scalar(_) => Shape::scalar(),
            Self::Tensor(tensor) => tensor.shape.clone(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        match self {
            Self::Scalar(_) => 0,
            Self::Tensor(tensor) => tensor.rank(),
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Scalar(_) => None,
            Self::Tensor(tensor) => Some(tensor),
        }
    }

    /// View as a tensor; bare scalars become rank-0 tensors of their natural dtype.
    #[must_use]
    pub fn to_tensor(&self) -> TensorValue {
        match self {
            Self::Scalar(lit) => TensorValue::scalar(lit.natural_dtype(), *lit),
            Self::Tensor(tensor) => tensor.clone(),
        }
    }

    #[must_use]
    pub fn into_tensor(self) -> TensorValue {
        match self {
            Self::Scalar(lit) => TensorValue::scalar(lit.natural_dtype(), lit),
            Self::Tensor(tensor) => tensor,
        }
    }
}

impl From<TensorValue> for Value {
    fn from(tensor: TensorValue) -> Self {
        Self::Tensor(tensor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    /// Rank-0 tensor holding `literal` rounded to `dtype`.
    #[must_use]
    pub fn scalar(dtype: DType, literal: Literal) -> Self {
        Self {
            dtype,
            shape: Shape::scalar(),
            elements: vec![dtype.quantize(literal)],
        }
    }

    pub fn zeros(dtype: DType, shape: Shape) -> Result<Self, ValueError> {
        let count = shape.element_count_usize()?;
        Ok(Self {
            dtype,
            shape,
            elements: vec![dtype.zero(); count],
        })
    }

    pub fn from_f64s(dtype: DType, shape: Shape, values: &[f64]) -> Result<Self, ValueError> {
        let elements = values
            .iter()
            .map(|&value| dtype.literal_from_f64(value))
            .collect();
        Self::new(dtype, shape, elements)
    }

    pub fn from_i64s(dtype: DType, shape: Shape, values: &[i64]) -> Result<Self, ValueError> {
        let elements = values
            .iter()
            .map(|&value| dtype.literal_from_i128(i128::from(value)))
            .collect();
        Self::new(dtype, shape, elements)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn leading_dim(&self) -> Option<u32> {
        self.shape.dims.first().copied()
    }

    pub fn slice_axis0(&self, index: usize) -> Result<Self, ValueError> {
        self.slice_along_axis(0, index)
    }

    /// Select position `index` of `axis`, dropping that axis. Slicing a
    /// rank-1 tensor yields a rank-0 tensor of the same dtype.
    pub fn slice_along_axis(&self, axis: usize, index: usize) -> Result<Self, ValueError> {
        let rank = self.rank();
        if rank == 0 {
            return Err(ValueError::RankZeroAxisSliceUnsupported);
        }
        if axis >= rank {
            return Err(ValueError::AxisOutOfBounds { axis, rank });
        }
        let axis_size = self.shape.dims[axis] as usize;
        if index >= axis_size {
            return Err(ValueError::SliceIndexOutOfBounds { index, axis_size });
        }

        let outer: usize = self.shape.dims[..axis].iter().map(|&d| d as usize).product();
        let inner: usize = self.shape.dims[axis + 1..]
            .iter()
            .map(|&d| d as usize)
            .product();
        let mut elements = Vec::with_capacity(outer * inner);
        for block in 0..outer {
            let start = (block * axis_size + index) * inner;
            elements.extend_from_slice(&self.elements[start..start + inner]);
        }
        Self::new(self.dtype, self.shape.with_removed_axis(axis)?, elements)
    }

    /// Stack equally shaped values along a new leading axis. Bare scalars
    /// stack as rank-0 tensors of their natural dtype.
    pub fn stack_axis0(slices: &[Value]) -> Result<Self, ValueError> {
        let first = slices.first().ok_or(ValueError::EmptyAxisStack)?.to_tensor();
        let mut elements = Vec::with_capacity(first.len() * slices.len());
        for value in slices {
            let tensor = value.to_tensor();
            if tensor.dtype != first.dtype {
                return Err(ValueError::AxisStackDTypeMismatch {
                    expected: first.dtype,
                    actual: tensor.dtype,
                });
            }
            if tensor.shape != first.shape {
                return Err(ValueError::AxisStackShapeMismatch {
                    expected: first.shape.clone(),
                    actual: tensor.shape.clone(),
                });
            }
            elements.extend(tensor.elements);
        }
        let shape = first.shape.with_inserted_axis(0, slices.len() as u32)?;
        Self::new(first.dtype, shape, elements)
    }

    /// Like [`TensorValue::stack_axis0`], but an empty stack yields
    /// `zeros((0,) + template_shape)` instead of an error.
    pub fn stack_axis0_with_template(
        slices: &[Value],
        template_dtype: DType,
        template_shape: &Shape,
    ) -> Result<Self, ValueError> {
        if slices.is_empty() {
            return Self::zeros(template_dtype, template_shape.with_inserted_axis(0, 0)?);
        }
        Self::stack_axis0(slices)
    }

    pub fn reshape(&self, shape: Shape) -> Result<Self, ValueError> {
        let target = shape.element_count_usize()?;
        if target != self.len() {
            return Err(ValueError::ReshapeElementCount {
                from: self.shape.clone(),
                to: shape,
            });
        }
        Ok(Self {
            dtype: self.dtype,
            shape,
            elements: self.elements.clone(),
        })
    }

    /// Reorder axes so that output axis `i` is input axis `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Self, ValueError> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        let valid = perm.len() == rank
            && perm.iter().all(|&axis| {
                axis < rank && !std::mem::replace(&mut seen[axis], true)
            });
        if !valid {
            return Err(ValueError::InvalidPermutation {
                perm: perm.to_vec(),
                rank,
            });
        }
        if perm.iter().enumerate().all(|(idx, &axis)| idx == axis) {
            return Ok(self.clone());
        }

        let old_strides = self.shape.strides();
        let new_dims: Vec<u32> = perm.iter().map(|&axis| self.shape.dims[axis]).collect();
        let mut elements = Vec::with_capacity(self.len());
        let mut index = vec![0_usize; rank];
        for _ in 0..self.len() {
            let offset: usize = index
                .iter()
                .zip(perm)
                .map(|(&pos, &axis)| pos * old_strides[axis])
                .sum();
            elements.push(self.elements[offset]);
            for dim in (0..rank).rev() {
                index[dim] += 1;
                if index[dim] < new_dims[dim] as usize {
                    break;
                }
                index[dim] = 0;
            }
        }
        Self::new(self.dtype, Shape { dims: new_dims }, elements)
    }

    /// Move axis `from` to position `to`, shifting the others to make room.
    pub fn move_axis(&self, from: usize, to: usize) -> Result<Self, ValueError> {
        let rank = self.rank();
        if from >= rank || to >= rank {
            return Err(ValueError::AxisOutOfBounds {
                axis: from.max(to),
                rank,
            });
        }
        if from == to {
            return Ok(self.clone());
        }
        let mut perm: Vec<usize> = (0..rank).filter(|&axis| axis != from).collect();
        perm.insert(to, from);
        self.permute(&perm)
    }

    /// Right-aligned broadcast to `target`.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Self, ValueError> {
        if self.shape == *target {
            return Ok(self.clone());
        }
        let rank = target.rank();
        let incompatible = || ValueError::IncompatibleBroadcast {
            shapes: vec![self.shape.clone(), target.clone()],
        };
        if self.rank() > rank {
            return Err(incompatible());
        }
        let offset = rank - self.rank();
        for (idx, &dim) in self.shape.dims.iter().enumerate() {
            if dim != 1 && dim != target.dims[offset + idx] {
                return Err(incompatible());
            }
        }

        let count = target.element_count_usize()?;
        let src_strides = self.shape.strides();
        let mut elements = Vec::with_capacity(count);
        let mut index = vec![0_usize; rank];
        for _ in 0..count {
            let mut src = 0_usize;
            for (idx, &dim) in self.shape.dims.iter().enumerate() {
                if dim != 1 {
                    src += index[offset + idx] * src_strides[idx];
                }
            }
            elements.push(self.elements[src]);
            for dim in (0..rank).rev() {
                index[dim] += 1;
                if index[dim] < target.dims[dim] as usize {
                    break;
                }
                index[dim] = 0;
            }
        }
        Self::new(self.dtype, target.clone(), elements)
    }

    #[must_use]
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }

    #[must_use]
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.elements.iter().copied().map(Literal::as_i64).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    RankZeroAxisSliceUnsupported,
    AxisOutOfBounds {
        axis: usize,
        rank: usize,
    },
    SliceIndexOutOfBounds {
        index: usize,
        axis_size: usize,
    },
    EmptyAxisStack,
    AxisStackShapeMismatch {
        expected: Shape,
        actual: Shape,
    },
    AxisStackDTypeMismatch {
        expected: DType,
        actual: DType,
    },
    IncompatibleBroadcast {
        shapes: Vec<Shape>,
    },
    ReshapeElementCount {
        from: Shape,
        to: Shape,
    },
    InvalidPermutation {
        perm: Vec<usize>,
        rank: usize,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {:?}", shape.dims)
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => {
                write!(
                    f,
                    "tensor element count mismatch for shape {:?}: expected {}, got {}",
                    shape.dims, expected_count, actual_count
                )
            }
            Self::RankZeroAxisSliceUnsupported => {
                write!(f, "cannot axis-slice rank-0 scalar tensor")
            }
            Self::AxisOutOfBounds { axis, rank } => {
                write!(f, "axis {} out of bounds for rank {}", axis, rank)
            }
            Self::SliceIndexOutOfBounds { index, axis_size } => {
                write!(
                    f,
                    "axis-slice index {} out of bounds for axis size {}",
                    index, axis_size
                )
            }
            Self::EmptyAxisStack => {
                write!(f, "cannot stack empty slice list")
            }
            Self::AxisStackShapeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack shape mismatch: expected {:?}, got {:?}",
                    expected.dims, actual.dims
                )
            }
            Self::AxisStackDTypeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack dtype mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::IncompatibleBroadcast { shapes } => {
                let dims: Vec<_> = shapes.iter().map(|shape| &shape.dims).collect();
                write!(f, "shapes cannot be broadcast together: {:?}", dims)
            }
            Self::ReshapeElementCount { from, to } => {
                write!(
                    f,
                    "cannot reshape {:?} to {:?}: element counts differ",
                    from.dims, to.dims
                )
            }
            Self::InvalidPermutation { perm, rank } => {
                write!(f, "{:?} is not a permutation of rank {}", perm, rank)
            }
        }
    }
}

impl std::error::Error for ValueError {}
