//! Contiguous-slice reductions and updates.
//!
//! With `--features simd` on an AVX2 target the reductions run eight lanes
//! at a time through `core::arch`; otherwise an eight-accumulator loop gives
//! the compiler the same shape to vectorize.

#[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
const LANES: usize = 8;

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
mod avx2 {
    use core::arch::x86_64::*;

    #[inline]
    fn hsum(v: __m256) -> f32 {
        let mut lanes = [0.0f32; 8];
        unsafe { _mm256_storeu_ps(lanes.as_mut_ptr(), v) };
        lanes.iter().sum()
    }

    pub fn sum(xs: &[f32]) -> f32 {
        let chunks = xs.chunks_exact(8);
        let tail: f32 = chunks.remainder().iter().sum();
        let mut acc = unsafe { _mm256_setzero_ps() };
        for c in chunks {
            acc = unsafe { _mm256_add_ps(acc, _mm256_loadu_ps(c.as_ptr())) };
        }
        hsum(acc) + tail
    }

    pub fn dot(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let split = n - n % 8;
        let mut acc = unsafe { _mm256_setzero_ps() };
        let mut i = 0;
        while i < split {
            unsafe {
                let va = _mm256_loadu_ps(a.as_ptr().add(i));
                let vb = _mm256_loadu_ps(b.as_ptr().add(i));
                acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
            }
            i += 8;
        }
        let tail: f32 = a[split..n].iter().zip(&b[split..n]).map(|(x, y)| x * y).sum();
        hsum(acc) + tail
    }

    pub fn sum_sq_dev(xs: &[f32], mean: f32) -> f32 {
        let chunks = xs.chunks_exact(8);
        let tail: f32 = chunks.remainder().iter().map(|x| (x - mean) * (x - mean)).sum();
        let mut acc = unsafe { _mm256_setzero_ps() };
        let m = unsafe { _mm256_set1_ps(mean) };
        for c in chunks {
            unsafe {
                let d = _mm256_sub_ps(_mm256_loadu_ps(c.as_ptr()), m);
                acc = _mm256_add_ps(acc, _mm256_mul_ps(d, d));
            }
        }
        hsum(acc) + tail
    }
}

/// Sum of `xs`.
#[inline]
pub fn sum(xs: &[f32]) -> f32 {
    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        avx2::sum(xs)
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    {
        let mut acc = [0.0f32; LANES];
        let chunks = xs.chunks_exact(LANES);
        let tail: f32 = chunks.remainder().iter().sum();
        for c in chunks {
            for (a, &v) in acc.iter_mut().zip(c) {
                *a += v;
            }
        }
        acc.iter().sum::<f32>() + tail
    }
}

/// Inner product of two equally long slices.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        avx2::dot(a, b)
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    {
        let mut acc = [0.0f32; LANES];
        let ca = a.chunks_exact(LANES);
        let cb = b.chunks_exact(LANES);
        let tail: f32 = ca
            .remainder()
            .iter()
            .zip(cb.remainder())
            .map(|(x, y)| x * y)
            .sum();
        for (xa, xb) in ca.zip(cb) {
            for ((acc, x), y) in acc.iter_mut().zip(xa).zip(xb) {
                *acc += x * y;
            }
        }
        acc.iter().sum::<f32>() + tail
    }
}

/// `sum((x - mean)^2)` over `xs`.
#[inline]
pub fn sum_sq_dev(xs: &[f32], mean: f32) -> f32 {
    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        avx2::sum_sq_dev(xs, mean)
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    {
        let mut acc = [0.0f32; LANES];
        let chunks = xs.chunks_exact(LANES);
        let tail: f32 = chunks.remainder().iter().map(|x| (x - mean) * (x - mean)).sum();
        for c in chunks {
            for (a, &v) in acc.iter_mut().zip(c) {
                let d = v - mean;
                *a += d * d;
            }
        }
        acc.iter().sum::<f32>() + tail
    }
}

/// `y += alpha * x`.
#[inline]
pub fn axpy(y: &mut [f32], alpha: f32, x: &[f32]) {
    debug_assert_eq!(y.len(), x.len());
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reductions_cover_the_tail() {
        let xs: Vec<f32> = (1..=19).map(|v| v as f32).collect();
        assert_eq!(sum(&xs), 190.0);
        assert_eq!(dot(&xs, &xs), (1..=19).map(|v| (v * v) as f32).sum::<f32>());
        assert_eq!(sum_sq_dev(&[1.0, 3.0, 5.0], 3.0), 8.0);
        assert_eq!(sum(&[]), 0.0);
    }

    #[test]
    fn axpy_accumulates() {
        let mut y = vec![1.0f32; 3];
        axpy(&mut y, 2.0, &[1.0, 2.0, 3.0]);
        assert_eq!(y, vec![3.0, 5.0, 7.0]);
    }
}
