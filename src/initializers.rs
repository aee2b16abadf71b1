//! Parameter initializers.
//!
//! An [`Initializer`] is a fill policy: given a target shape, element type
//! and random source it produces a fresh tensor. Generation is pure; with a
//! seeded [`StdRng`](rand::rngs::StdRng) the output is reproducible.
//!
//! Fan-scaled policies read the layout used by the operations in this crate:
//! `shape[0]` is the output axis, `shape[1]` the input axis, and any further
//! axes are receptive-field extents.
//!
//! ```rust
//! use briny_kernels::initializers::Initializer;
//! use rand::SeedableRng;
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(7);
//! let w = Initializer::GlorotUniform { scale: 1.0 }
//!     .generate_f32(&[16, 8], &mut rng)
//!     .unwrap();
//! let bound = (6.0f32 / 24.0).sqrt();
//! assert!(w.data.iter().all(|v| v.abs() <= bound));
//! ```

use rand::Rng;
use rand::distr::Uniform;
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};
use crate::tensors::{AnyTensor, DType, Tensor};

const OP: &str = "initializer";

/// A policy for filling a new tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    Zero,
    One,
    Constant(f32),
    /// Copies the given tensor; the requested shape must match.
    Fixed(Tensor<f32>),
    /// Scaled identity of a square matrix.
    Identity { scale: f32 },
    /// N(0, scale²).
    Normal { scale: f32 },
    /// N(0, scale² · 2 / fan_in).
    HeNormal { scale: f32 },
    /// N(0, scale² · 2 / (fan_in + fan_out)).
    GlorotNormal { scale: f32 },
    /// Scaled orthonormal rows (or columns, for tall matrices).
    Orthogonal { scale: f32 },
    /// U(-scale, scale).
    Uniform { scale: f32 },
    /// U(-s, s) with s = scale · sqrt(3 / fan_in).
    LeCunUniform { scale: f32 },
    /// U(-s, s) with s = scale · sqrt(6 / (fan_in + fan_out)).
    GlorotUniform { scale: f32 },
    /// U(-s, s) with s = scale · sqrt(6 / fan_in).
    HeUniform { scale: f32 },
}

impl Default for Initializer {
    fn default() -> Self {
        Self::HeNormal {
            scale: core::f32::consts::FRAC_1_SQRT_2,
        }
    }
}

/// `(fan_in, fan_out)` of a parameter shape.
pub fn get_fans(shape: &[usize]) -> Result<(usize, usize)> {
    if shape.len() < 2 {
        return Err(Error::shape(format!(
            "fan-scaled initialization needs at least 2 dimensions, got {shape:?}"
        )));
    }
    let receptive: usize = shape[2..].iter().product();
    Ok((shape[1] * receptive, shape[0] * receptive))
}

impl Initializer {
    /// Generates a tensor of `shape` and element type `dtype`.
    ///
    /// `int32` tensors can only be produced by the fill policies, and
    /// `Constant` only with an integral value.
    pub fn generate<R: Rng + ?Sized>(&self, shape: &[usize], dtype: DType, rng: &mut R) -> Result<AnyTensor> {
        match dtype {
            DType::F32 => self.generate_f32(shape, rng).map(AnyTensor::F32),
            DType::I32 => self.generate_i32(shape).map(AnyTensor::I32),
        }
    }

    /// Generates a `float32` tensor of `shape`.
    pub fn generate_f32<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Result<Tensor<f32>> {
        let len: usize = shape.iter().product();
        let data = match self {
            Self::Zero => vec![0.0; len],
            Self::One => vec![1.0; len],
            Self::Constant(v) => vec![*v; len],
            Self::Fixed(src) => {
                if src.shape != shape {
                    return Err(Error::shape(format!(
                        "fixed initializer holds {:?}, requested {shape:?}",
                        src.shape
                    )));
                }
                src.data.clone()
            }
            Self::Identity { scale } => identity(shape, *scale)?,
            Self::Normal { scale } => normal(len, *scale, rng)?,
            Self::HeNormal { scale } => {
                let (fan_in, _) = get_fans(shape)?;
                normal(len, scale * (2.0 / fan_in as f32).sqrt(), rng)?
            }
            Self::GlorotNormal { scale } => {
                let (fan_in, fan_out) = get_fans(shape)?;
                normal(len, scale * (2.0 / (fan_in + fan_out) as f32).sqrt(), rng)?
            }
            Self::Orthogonal { scale } => orthogonal(shape, *scale, rng)?,
            Self::Uniform { scale } => uniform(len, *scale, rng)?,
            Self::LeCunUniform { scale } => {
                let (fan_in, _) = get_fans(shape)?;
                uniform(len, scale * (3.0 / fan_in as f32).sqrt(), rng)?
            }
            Self::GlorotUniform { scale } => {
                let (fan_in, fan_out) = get_fans(shape)?;
                uniform(len, scale * (6.0 / (fan_in + fan_out) as f32).sqrt(), rng)?
            }
            Self::HeUniform { scale } => {
                let (fan_in, _) = get_fans(shape)?;
                uniform(len, scale * (6.0 / fan_in as f32).sqrt(), rng)?
            }
        };
        Tensor::try_new(shape.to_vec(), data)
    }

    fn generate_i32(&self, shape: &[usize]) -> Result<Tensor<i32>> {
        let value = match self {
            Self::Zero => 0,
            Self::One => 1,
            Self::Constant(v) if v.fract() == 0.0 && *v >= i32::MIN as f32 && *v < 2_147_483_648.0 => *v as i32,
            _ => {
                return Err(Error::Type {
                    op: OP,
                    expected: format!("{} target for {self:?}", DType::F32),
                    actual: DType::I32.to_string(),
                });
            }
        };
        Ok(Tensor::full(shape.to_vec(), value))
    }
}

fn non_finite(scale: f32) -> Error {
    Error::config(format!("initializer scale {scale} is not a finite number"))
}

fn normal<R: Rng + ?Sized>(len: usize, std: f32, rng: &mut R) -> Result<Vec<f32>> {
    let dist = Normal::new(0.0f32, std.abs()).map_err(|_| non_finite(std))?;
    Ok((0..len).map(|_| dist.sample(rng)).collect())
}

fn uniform<R: Rng + ?Sized>(len: usize, bound: f32, rng: &mut R) -> Result<Vec<f32>> {
    let bound = bound.abs();
    let dist = Uniform::new_inclusive(-bound, bound).map_err(|_| non_finite(bound))?;
    Ok((0..len).map(|_| dist.sample(rng)).collect())
}

fn identity(shape: &[usize], scale: f32) -> Result<Vec<f32>> {
    let &[rows, cols] = shape else {
        return Err(Error::shape(format!("identity initializer needs a 2-D shape, got {shape:?}")));
    };
    if rows != cols {
        return Err(Error::shape(format!("identity initializer needs a square shape, got {shape:?}")));
    }
    let mut data = vec![0.0; rows * cols];
    for i in 0..rows {
        data[i * cols + i] = scale;
    }
    Ok(data)
}

/// Gram-Schmidt over normal draws on the flattened `[shape[0], rest]` view.
fn orthogonal<R: Rng + ?Sized>(shape: &[usize], scale: f32, rng: &mut R) -> Result<Vec<f32>> {
    if shape.len() < 2 {
        return Err(Error::shape(format!(
            "orthogonal initializer needs at least 2 dimensions, got {shape:?}"
        )));
    }
    let rows = shape[0];
    let cols: usize = shape[1..].iter().product();
    // orthonormalize the shorter side
    let (count, dim) = if rows <= cols { (rows, cols) } else { (cols, rows) };
    let dist = Normal::new(0.0f64, 1.0).map_err(|_| non_finite(scale))?;

    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(count);
    while basis.len() < count {
        let mut attempts = 0;
        let v = loop {
            let mut v: Vec<f64> = (0..dim).map(|_| dist.sample(rng)).collect();
            for b in &basis {
                let proj: f64 = v.iter().zip(b).map(|(a, b)| a * b).sum();
                v.iter_mut().zip(b).for_each(|(a, b)| *a -= proj * b);
            }
            let norm = v.iter().map(|a| a * a).sum::<f64>().sqrt();
            if norm > 1e-6 {
                v.iter_mut().for_each(|a| *a /= norm);
                break v;
            }
            attempts += 1;
            if attempts == 16 {
                return Err(Error::config("orthogonal initializer failed to draw an independent vector"));
            }
        };
        basis.push(v);
    }

    let mut data = vec![0.0f32; rows * cols];
    for (k, v) in basis.iter().enumerate() {
        for (j, &a) in v.iter().enumerate() {
            let at = if rows <= cols { k * cols + j } else { j * cols + k };
            data[at] = scale * a as f32;
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn fans_follow_the_layout() {
        assert_eq!(get_fans(&[8, 3, 5, 5]).unwrap(), (75, 200));
        assert!(matches!(get_fans(&[4]), Err(Error::Shape(_))));
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let a = Initializer::default().generate_f32(&[4, 6], &mut rng()).unwrap();
        let b = Initializer::default().generate_f32(&[4, 6], &mut rng()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fixed_checks_shape() {
        let src = Tensor::new(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0]);
        let init = Initializer::Fixed(src.clone());
        assert_eq!(init.generate_f32(&[2, 2], &mut rng()).unwrap(), src);
        assert!(matches!(init.generate_f32(&[4], &mut rng()), Err(Error::Shape(_))));
    }

    #[test]
    fn identity_needs_square() {
        let t = Initializer::Identity { scale: 2.0 }.generate_f32(&[2, 2], &mut rng()).unwrap();
        assert_eq!(t.data, vec![2.0, 0.0, 0.0, 2.0]);
        assert!(Initializer::Identity { scale: 1.0 }.generate_f32(&[2, 3], &mut rng()).is_err());
    }

    #[test]
    fn int_generation_only_for_fills() {
        let t = Initializer::Constant(3.0).generate(&[2], DType::I32, &mut rng()).unwrap();
        assert_eq!(t.as_i32().unwrap().data, vec![3, 3]);
        let err = Initializer::Constant(0.5).generate(&[2], DType::I32, &mut rng());
        assert!(matches!(err, Err(Error::Type { .. })));
        let err = Initializer::Normal { scale: 1.0 }.generate(&[2], DType::I32, &mut rng());
        assert!(matches!(err, Err(Error::Type { .. })));
    }

    #[test]
    fn int_constant_must_fit() {
        let t = Initializer::Constant(-2_147_483_648.0).generate(&[1], DType::I32, &mut rng()).unwrap();
        assert_eq!(t.as_i32().unwrap().data, vec![i32::MIN]);
        let err = Initializer::Constant(2_147_483_648.0).generate(&[1], DType::I32, &mut rng());
        assert!(matches!(err, Err(Error::Type { .. })));
    }

    #[test]
    fn orthogonal_rows_are_orthonormal() {
        let t = Initializer::Orthogonal { scale: 1.0 }.generate_f32(&[3, 5], &mut rng()).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let dot: f32 = (0..5).map(|k| t.data[i * 5 + k] * t.data[j * 5 + k]).sum();
                let want = if i == j { 1.0 } else { 0.0 };
                assert!((dot - want).abs() < 1e-4, "rows {i},{j}: {dot}");
            }
        }
    }
}
