use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::Literal;

/// Element type of a tensor.
///
/// Signed integers are stored as [`Literal::I64`], unsigned integers as
/// [`Literal::U64`], every real floating width as [`Literal::F64Bits`]
/// rounded to the width's precision, and complex values as their own
/// bit-pattern pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    BF16,
    F16,
    F32,
    F64,
    Complex64,
    Complex128,
}

impl DType {
    pub const ALL: [DType; 15] = [
        Self::Bool,
        Self::I8,
        Self::I16,
        Self::I32,
        Self::I64,
        Self::U8,
        Self::U16,
        Self::U32,
        Self::U64,
        Self::BF16,
        Self::F16,
        Self::F32,
        Self::F64,
        Self::Complex64,
        Self::Complex128,
    ];

    pub const FLOATING: [DType; 4] = [Self::BF16, Self::F16, Self::F32, Self::F64];

    pub const INTEGER: [DType; 8] = [
        Self::I8,
        Self::I16,
        Self::I32,
        Self::I64,
        Self::U8,
        Self::U16,
        Self::U32,
        Self::U64,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::U64 => "uint64",
            Self::BF16 => "bfloat16",
            Self::F16 => "float16",
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::Complex64 => "complex64",
            Self::Complex128 => "complex128",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|dtype| dtype.as_str().eq_ignore_ascii_case(name.trim()))
    }

    #[must_use]
    pub fn is_bool(self) -> bool {
        matches!(self, Self::Bool)
    }

    #[must_use]
    pub fn is_signed_integer(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    #[must_use]
    pub fn is_unsigned_integer(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        self.is_signed_integer() || self.is_unsigned_integer()
    }

    #[must_use]
    pub fn is_floating(self) -> bool {
        matches!(self, Self::BF16 | Self::F16 | Self::F32 | Self::F64)
    }

    #[must_use]
    pub fn is_complex(self) -> bool {
        matches!(self, Self::Complex64 | Self::Complex128)
    }

    /// Whether values of this dtype compare exactly rather than within a tolerance.
    #[must_use]
    pub fn is_exact(self) -> bool {
        self.is_bool() || self.is_integral()
    }

    #[must_use]
    pub fn bit_width(self) -> u32 {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 8,
            Self::I16 | Self::U16 | Self::BF16 | Self::F16 => 16,
            Self::I32 | Self::U32 | Self::F32 => 32,
            Self::I64 | Self::U64 | Self::F64 | Self::Complex64 => 64,
            Self::Complex128 => 128,
        }
    }

    /// The real dtype backing each component of a complex dtype.
    #[must_use]
    pub fn real_component(self) -> Self {
        match self {
            Self::Complex64 => Self::F32,
            Self::Complex128 => Self::F64,
            other => other,
        }
    }

    /// Inclusive integer range representable by this dtype.
    #[must_use]
    pub fn integer_range(self) -> Option<(i128, i128)> {
        match self {
            Self::Bool => Some((0, 1)),
            Self::I8 => Some((i128::from(i8::MIN), i128::from(i8::MAX))),
            Self::I16 => Some((i128::from(i16::MIN), i128::from(i16::MAX))),
            Self::I32 => Some((i128::from(i32::MIN), i128::from(i32::MAX))),
            Self::I64 => Some((i128::from(i64::MIN), i128::from(i64::MAX))),
            Self::U8 => Some((0, i128::from(u8::MAX))),
            Self::U16 => Some((0, i128::from(u16::MAX))),
            Self::U32 => Some((0, i128::from(u32::MAX))),
            Self::U64 => Some((0, i128::from(u64::MAX))),
            _ => None,
        }
    }

    #[must_use]
    pub fn zero(self) -> Literal {
        match self {
            Self::Bool => Literal::Bool(false),
            Self::Complex64 => Literal::from_complex64(0.0, 0.0),
            Self::Complex128 => Literal::from_complex128(0.0, 0.0),
            _ if self.is_unsigned_integer() => Literal::U64(0),
            _ if self.is_signed_integer() => Literal::I64(0),
            _ => Literal::from_f64(0.0),
        }
    }

    /// Build a literal of this dtype from an integer, wrapping to the dtype width.
    #[must_use]
    pub fn literal_from_i128(self, value: i128) -> Literal {
        match self {
            Self::Bool => Literal::Bool(value != 0),
            Self::I8 => Literal::I64(i64::from(value as i8)),
            Self::I16 => Literal::I64(i64::from(value as i16)),
            Self::I32 => Literal::I64(i64::from(value as i32)),
            Self::I64 => Literal::I64(value as i64),
            Self::U8 => Literal::U64(u64::from(value as u8)),
            Self::U16 => Literal::U64(u64::from(value as u16)),
            Self::U32 => Literal::U64(u64::from(value as u32)),
            Self::U64 => Literal::U64(value as u64),
            _ => self.literal_from_f64(value as f64),
        }
    }

    /// Build a literal of this dtype from a real value.
    ///
    /// Integral targets truncate toward zero and then wrap; NaN maps to zero.
    #[must_use]
    pub fn literal_from_f64(self, value: f64) -> Literal {
        match self {
            Self::Bool => Literal::Bool(value != 0.0),
            Self::BF16 => Literal::from_f64(bf16::from_f64(value).to_f64()),
            Self::F16 => Literal::from_f64(f16::from_f64(value).to_f64()),
            Self::F32 => Literal::from_f64(f64::from(value as f32)),
            Self::F64 => Literal::from_f64(value),
            Self::Complex64 => Literal::from_complex64(value as f32, 0.0),
            Self::Complex128 => Literal::from_complex128(value, 0.0),
            _ => {
                let truncated = if value.is_nan() { 0.0 } else { value.trunc() };
                self.literal_from_i128(truncated as i128)
            }
        }
    }

    #[must_use]
    pub fn literal_from_complex(self, re: f64, im: f64) -> Literal {
        match self {
            Self::Complex64 => Literal::from_complex64(re as f32, im as f32),
            Self::Complex128 => Literal::from_complex128(re, im),
            _ => self.literal_from_f64(re),
        }
    }

    /// Round an arbitrary literal to this dtype's storage representation.
    #[must_use]
    pub fn quantize(self, literal: Literal) -> Literal {
        if self.is_complex() {
            let (re, im) = literal.as_complex128().unwrap_or((0.0, 0.0));
            return self.literal_from_complex(re, im);
        }
        match literal {
            Literal::I64(value) => self.literal_from_i128(i128::from(value)),
            Literal::U64(value) => self.literal_from_i128(i128::from(value)),
            Literal::Bool(value) => self.literal_from_i128(i128::from(value)),
            Literal::F64Bits(bits) => self.literal_from_f64(f64::from_bits(bits)),
            Literal::Complex64Bits(re, _) => self.literal_from_f64(f64::from(f32::from_bits(re))),
            Literal::Complex128Bits(re, _) => self.literal_from_f64(f64::from_bits(re)),
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
