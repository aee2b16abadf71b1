//! Utilities to approximate equality of floating point buffers.
//!
//! Backends are compared against each other with an absolute plus relative
//! tolerance, `|a - b| <= atol + rtol * |b|`, elementwise.

/// The max epsilon accepted on `f32`s.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// The expected minimum epsilon accepted on `f32`s.
pub const F32_AVG_ERROR: f32 = 1e-5;

/// The best expected epsilon accepted on `f32`s.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// Absolute and relative slack for a comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f32,
    pub rtol: f32,
}

impl Tolerance {
    /// Agreement expected between two backends running the same operation.
    pub const BACKEND: Self = Self {
        atol: 1e-4,
        rtol: F32_MAX_ERROR,
    };

    /// Agreement expected between an analytic and a finite-difference gradient.
    pub const GRADIENT: Self = Self {
        atol: 1e-2,
        rtol: 1e-2,
    };

    pub const fn new(atol: f32, rtol: f32) -> Self {
        Self { atol, rtol }
    }

    /// Whether `actual` is within tolerance of `expected`.
    pub fn accepts(&self, actual: f32, expected: f32) -> bool {
        if actual == expected {
            return true;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Checks the relative distance based off a tolerance.
pub trait RelativeEq<Rhs: ?Sized> {
    /// Enumerates the equality of `self`
    fn approx_eq(&self, rhs: &Rhs, tol: Tolerance) -> ApproxEquality;
}

impl RelativeEq<Self> for f32 {
    fn approx_eq(&self, rhs: &Self, tol: Tolerance) -> ApproxEquality {
        let dif = (self - rhs).abs();

        if dif < F32_MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < F32_AVG_ERROR {
            ApproxEquality::Partial
        } else if tol.accepts(*self, *rhs) {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl RelativeEq<[f32]> for [f32] {
    fn approx_eq(&self, rhs: &[f32], tol: Tolerance) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut eq = ApproxEquality::Precise;
        for (a, b) in self.iter().zip(rhs) {
            let rating = a.approx_eq(b, tol);
            if rating == ApproxEquality::Scarce {
                return rating;
            }
            eq = eq.max(rating);
        }
        eq
    }
}

/// The approximated equality enumerated, best first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Very strong epsilon.
    Precise = 0,

    /// Good epsilon.
    Partial = 1,

    /// Within the supplied tolerance.
    Relative = 2,

    /// No relative equality.
    Scarce = 3,
}

/// Whether every element of `actual` is within tolerance of `expected`.
pub fn allclose(actual: &[f32], expected: &[f32], tol: Tolerance) -> bool {
    actual.approx_eq(expected, tol) != ApproxEquality::Scarce
}

/// Largest elementwise absolute difference, `0.0` for empty inputs.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Index and values of the first element outside tolerance.
pub fn first_mismatch(actual: &[f32], expected: &[f32], tol: Tolerance) -> Option<(usize, f32, f32)> {
    actual
        .iter()
        .zip(expected)
        .enumerate()
        .find(|&(_, (&a, &e))| !tol.accepts(a, e))
        .map(|(i, (&a, &e))| (i, a, e))
}
