//! Seeded random operand generation.
//!
//! A [`RandGenerator`] owns its own `ChaCha8Rng`; there is no process-wide
//! random state, so parallel checks stay reproducible per seed.

use bc_core::{DType, Literal, Shape, TensorValue, Value, ValueError};
use bc_test_utils::seed_for;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorError {
    UnsupportedDType {
        strategy: &'static str,
        dtype: DType,
    },
    /// More distinct values were requested than the dtype can represent.
    UniqueValuesExhausted { count: usize, dtype: DType },
    InvalidRange { low: f64, high: f64 },
    Tensor(ValueError),
}

impl std::fmt::Display for GeneratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedDType { strategy, dtype } => {
                write!(f, "strategy {strategy} cannot generate {dtype}")
            }
            Self::UniqueValuesExhausted { count, dtype } => {
                write!(f, "{dtype} cannot hold {count} distinct values")
            }
            Self::InvalidRange { low, high } => {
                write!(f, "invalid uniform range [{low}, {high})")
            }
            Self::Tensor(err) => write!(f, "generated tensor is invalid: {err}"),
        }
    }
}

impl std::error::Error for GeneratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tensor(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValueError> for GeneratorError {
    fn from(value: ValueError) -> Self {
        Self::Tensor(value)
    }
}

/// Source of concrete operands for a check.
pub trait ValueGenerator {
    fn generate(&mut self, shape: &Shape, dtype: DType) -> Result<Value, GeneratorError>;

    /// Seed that reproduces this generator's stream, when there is one.
    fn seed(&self) -> Option<u64> {
        None
    }
}

/// How element values are drawn.
pub trait Strategy {
    fn name(&self) -> &'static str;

    fn sample(
        &self,
        rng: &mut ChaCha8Rng,
        count: usize,
        dtype: DType,
    ) -> Result<Vec<Literal>, GeneratorError>;
}

/// Scaled standard-normal draws cast to `dtype`: integers round to nearest,
/// unsigned integers take the absolute value, bools test for positivity.
fn scaled_normal(rng: &mut ChaCha8Rng, count: usize, dtype: DType, scale: f64) -> Vec<Literal> {
    let mut draw = || rng.sample::<f64, _>(StandardNormal) * scale;
    (0..count)
        .map(|_| {
            if dtype.is_complex() {
                let re = draw();
                let im = draw();
                dtype.literal_from_complex(re, im)
            } else if dtype.is_bool() {
                Literal::Bool(draw() > 0.0)
            } else if dtype.is_unsigned_integer() {
                dtype.literal_from_f64(draw().round().abs())
            } else if dtype.is_signed_integer() {
                dtype.literal_from_f64(draw().round())
            } else {
                dtype.literal_from_f64(draw())
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandDefault;

impl Strategy for RandDefault {
    fn name(&self) -> &'static str {
        "rand_default"
    }

    fn sample(
        &self,
        rng: &mut ChaCha8Rng,
        count: usize,
        dtype: DType,
    ) -> Result<Vec<Literal>, GeneratorError> {
        Ok(scaled_normal(rng, count, dtype, 3.0))
    }
}

/// Small floating values; integers fall back to the default scale.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandSmall;

impl Strategy for RandSmall {
    fn name(&self) -> &'static str {
        "rand_small"
    }

    fn sample(
        &self,
        rng: &mut ChaCha8Rng,
        count: usize,
        dtype: DType,
    ) -> Result<Vec<Literal>, GeneratorError> {
        let scale = if dtype.is_floating() || dtype.is_complex() {
            1e-3
        } else {
            3.0
        };
        Ok(scaled_normal(rng, count, dtype, scale))
    }
}

/// Values in `[1, 3)`; integers round into `1..=3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandPositive;

impl Strategy for RandPositive {
    fn name(&self) -> &'static str {
        "rand_positive"
    }

    fn sample(
        &self,
        rng: &mut ChaCha8Rng,
        count: usize,
        dtype: DType,
    ) -> Result<Vec<Literal>, GeneratorError> {
        if dtype.is_bool() {
            return Err(GeneratorError::UnsupportedDType {
                strategy: self.name(),
                dtype,
            });
        }
        Ok((0..count)
            .map(|_| {
                let value = rng.gen_range(1.0..3.0);
                if dtype.is_integral() {
                    dtype.literal_from_f64(f64::round(value))
                } else if dtype.is_complex() {
                    dtype.literal_from_complex(value, 0.0)
                } else {
                    dtype.literal_from_f64(value)
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RandUniform {
    pub low: f64,
    pub high: f64,
}

impl Default for RandUniform {
    fn default() -> Self {
        Self {
            low: -1.0,
            high: 1.0,
        }
    }
}

impl Strategy for RandUniform {
    fn name(&self) -> &'static str {
        "rand_uniform"
    }

    fn sample(
        &self,
        rng: &mut ChaCha8Rng,
        count: usize,
        dtype: DType,
    ) -> Result<Vec<Literal>, GeneratorError> {
        if !self.low.is_finite() || !self.high.is_finite() || self.low >= self.high {
            return Err(GeneratorError::InvalidRange {
                low: self.low,
                high: self.high,
            });
        }
        if dtype.is_bool() {
            return Err(GeneratorError::UnsupportedDType {
                strategy: self.name(),
                dtype,
            });
        }
        Ok((0..count)
            .map(|_| {
                let value = rng.gen_range(self.low..self.high);
                if dtype.is_integral() {
                    dtype.literal_from_f64(value.floor())
                } else if dtype.is_complex() {
                    let im = rng.gen_range(self.low..self.high);
                    dtype.literal_from_complex(value, im)
                } else {
                    dtype.literal_from_f64(value)
                }
            })
            .collect())
    }
}

/// A shuffled permutation of `0..count`, so sorts and arg-reductions see no
/// ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandUniqueInt;

impl Strategy for RandUniqueInt {
    fn name(&self) -> &'static str {
        "rand_unique_int"
    }

    fn sample(
        &self,
        rng: &mut ChaCha8Rng,
        count: usize,
        dtype: DType,
    ) -> Result<Vec<Literal>, GeneratorError> {
        // Two values cannot be tie-free at any useful size.
        if dtype.is_complex() || dtype.is_bool() {
            return Err(GeneratorError::UnsupportedDType {
                strategy: self.name(),
                dtype,
            });
        }
        let capacity = match dtype {
            DType::BF16 => 1 << 8,
            DType::F16 => 1 << 11,
            _ => dtype
                .integer_range()
                .map_or(u128::MAX, |(_, hi)| hi as u128 + 1),
        };
        if count as u128 > capacity {
            return Err(GeneratorError::UniqueValuesExhausted { count, dtype });
        }
        let mut values: Vec<usize> = (0..count).collect();
        values.shuffle(rng);
        Ok(values
            .into_iter()
            .map(|value| dtype.literal_from_i128(value as i128))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandBool;

impl Strategy for RandBool {
    fn name(&self) -> &'static str {
        "rand_bool"
    }

    fn sample(
        &self,
        rng: &mut ChaCha8Rng,
        count: usize,
        dtype: DType,
    ) -> Result<Vec<Literal>, GeneratorError> {
        Ok((0..count)
            .map(|_| dtype.literal_from_i128(i128::from(rng.gen_bool(0.5))))
            .collect())
    }
}

/// A [`ValueGenerator`] drawing from `strategy` with a seeded `ChaCha8Rng`.
#[derive(Debug, Clone)]
pub struct RandGenerator<S> {
    strategy: S,
    rng: ChaCha8Rng,
    seed: u64,
}

impl<S: Strategy> RandGenerator<S> {
    #[must_use]
    pub fn new(strategy: S, seed: u64) -> Self {
        Self {
            strategy,
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// Seeded from the test's name, or from `BC_SEED` when set.
    #[must_use]
    pub fn for_test(strategy: S, test_id: &str) -> Self {
        Self::new(strategy, seed_for(test_id))
    }
}

impl<S: Strategy> ValueGenerator for RandGenerator<S> {
    fn generate(&mut self, shape: &Shape, dtype: DType) -> Result<Value, GeneratorError> {
        let count = shape.element_count_usize()?;
        let elements = self.strategy.sample(&mut self.rng, count, dtype)?;
        Ok(Value::Tensor(TensorValue::new(
            dtype,
            shape.clone(),
            elements,
        )?))
    }

    fn seed(&self) -> Option<u64> {
        Some(self.seed)
    }
}
