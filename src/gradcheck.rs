//! Finite-difference gradient checking.
//!
//! A backward is checked by contracting the forward output with a fixed
//! upstream gradient `gy`, `L(x) = Σ f(x)ᵢ · gyᵢ`, and comparing the
//! analytic gradient against central differences of `L`.
//!
//! ```rust
//! use briny_kernels::approx::Tolerance;
//! use briny_kernels::gradcheck::{check, numerical_grad};
//!
//! // f(x) = x², so dL/dx = 2x · gy
//! let x = [1.0f32, -2.0];
//! let gy = [1.0f32, 0.5];
//! let numeric = numerical_grad(|v| v.iter().map(|a| a * a).collect(), &x, &gy, 1e-2);
//! assert!(check(&[2.0, -2.0], &numeric, Tolerance::GRADIENT).is_ok());
//! ```

use thiserror::Error;

use crate::approx::{Tolerance, first_mismatch};

/// First element where analytic and numerical gradients disagree.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("gradient mismatch at {index}: analytic {analytic}, numerical {numeric}")]
pub struct Mismatch {
    pub index: usize,
    pub analytic: f32,
    pub numeric: f32,
}

/// `Σ y · gy`, accumulated in `f64`.
pub fn contract(y: &[f32], gy: &[f32]) -> f64 {
    debug_assert_eq!(y.len(), gy.len());
    y.iter().zip(gy).map(|(&a, &b)| a as f64 * b as f64).sum()
}

/// Central-difference gradient of `x ↦ contract(f(x), gy)` at `point`.
pub fn numerical_grad<F>(mut f: F, point: &[f32], gy: &[f32], eps: f32) -> Vec<f32>
where
    F: FnMut(&[f32]) -> Vec<f32>,
{
    let mut probe = point.to_vec();
    (0..point.len())
        .map(|i| {
            probe[i] = point[i] + eps;
            let plus = contract(&f(&probe), gy);
            probe[i] = point[i] - eps;
            let minus = contract(&f(&probe), gy);
            probe[i] = point[i];
            ((plus - minus) / (2.0 * eps as f64)) as f32
        })
        .collect()
}

/// Compares an analytic gradient with a numerical one.
pub fn check(analytic: &[f32], numeric: &[f32], tol: Tolerance) -> Result<(), Mismatch> {
    match first_mismatch(analytic, numeric, tol) {
        None => Ok(()),
        Some((index, analytic, numeric)) => Err(Mismatch {
            index,
            analytic,
            numeric,
        }),
    }
}
