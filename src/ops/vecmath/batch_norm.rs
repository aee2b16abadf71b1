//! Fused batch-normalization kernels over raw buffers.
//!
//! [`do_forward`] and [`do_backward`] are the library boundary: they take
//! flat buffers, a [`NormDescriptor`] and three behaviour flags, and write
//! their outputs in place. Per-channel reductions run in parallel across
//! channels; elementwise passes run in parallel across samples, touching one
//! contiguous `spatial` run per channel.

use rayon::prelude::*;

use super::simd;
use crate::ops::{BatchNormBackward, BatchNormCache, BatchNormForward, NormDescriptor};

/// Behaviour switches of [`do_forward`] / [`do_backward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    /// Compute batch statistics and write them to `mean`/`var`.
    pub training: bool,
    /// Apply `weights` (`[scale; c]` then `[shift; c]`); identity otherwise.
    pub has_weights: bool,
    /// Read `mean`/`var` as inputs instead of computing them.
    pub fixed_mean_var: bool,
}

impl Flags {
    pub const TRAINING: Self = Self {
        training: true,
        has_weights: true,
        fixed_mean_var: false,
    };

    pub const INFERENCE: Self = Self {
        training: false,
        has_weights: true,
        fixed_mean_var: true,
    };
}

/// `sqrt(var + eps)` per channel.
pub fn std_from_var(var: &[f32], eps: f32) -> Vec<f32> {
    var.iter().map(|&v| (v + eps).sqrt()).collect()
}

/// Runs `f` over every contiguous channel run of sample-major `data`,
/// accumulating per-channel partial sums in `f64`.
fn channel_reduce(d: NormDescriptor, f: impl Fn(usize, usize) -> f32 + Sync) -> Vec<f64> {
    (0..d.c)
        .into_par_iter()
        .map(|ch| {
            (0..d.n)
                .map(|i| f((i * d.c + ch) * d.spatial, ch) as f64)
                .sum::<f64>()
        })
        .collect()
}

/// Batch-normalization forward.
///
/// - `x`, `y`: `d.len()` elements.
/// - `weights`: `2 * d.c` elements when `flags.has_weights`.
/// - `mean`, `var`: `d.c` elements, written when computing batch statistics
///   and read otherwise.
/// - `workspace`: receives `x_hat` when it has `d.len()` elements; may be
///   empty when no backward will follow.
#[allow(clippy::too_many_arguments)]
pub fn do_forward(
    x: &[f32],
    y: &mut [f32],
    weights: &[f32],
    mean: &mut [f32],
    var: &mut [f32],
    workspace: &mut [f32],
    d: NormDescriptor,
    eps: f32,
    flags: Flags,
) {
    debug_assert_eq!(x.len(), d.len());
    debug_assert_eq!(y.len(), d.len());
    debug_assert!(!flags.has_weights || weights.len() == 2 * d.c);
    debug_assert!(workspace.is_empty() || workspace.len() == d.len());

    let s = d.spatial;
    if flags.training && !flags.fixed_mean_var {
        let m = d.reduce_len() as f64;
        let sums = channel_reduce(d, |base, _| simd::sum(&x[base..base + s]));
        for (dst, total) in mean.iter_mut().zip(sums) {
            *dst = (total / m) as f32;
        }
        let mean_ro: &[f32] = mean;
        let sq = channel_reduce(d, |base, ch| simd::sum_sq_dev(&x[base..base + s], mean_ro[ch]));
        for (dst, total) in var.iter_mut().zip(sq) {
            *dst = (total / m) as f32;
        }
    }

    let std = std_from_var(var, eps);
    let mean: &[f32] = mean;
    let (scale, shift) = if flags.has_weights {
        weights.split_at(d.c)
    } else {
        (&[][..], &[][..])
    };
    let affine = |ch: usize| {
        if flags.has_weights {
            (scale[ch], shift[ch])
        } else {
            (1.0, 0.0)
        }
    };

    let sample = d.c * s;
    if sample == 0 {
        return;
    }
    let normalize = |xs: &[f32], ys: &mut [f32], mut xh: Option<&mut [f32]>| {
        for ch in 0..d.c {
            let (g, b) = affine(ch);
            let run = ch * s..(ch + 1) * s;
            for (k, (yv, &xv)) in ys[run.clone()].iter_mut().zip(&xs[run.clone()]).enumerate() {
                let hat = (xv - mean[ch]) / std[ch];
                *yv = g * hat + b;
                if let Some(xh) = xh.as_deref_mut() {
                    xh[run.start + k] = hat;
                }
            }
        }
    };

    if workspace.is_empty() {
        y.par_chunks_mut(sample)
            .zip(x.par_chunks(sample))
            .for_each(|(ys, xs)| normalize(xs, ys, None));
    } else {
        y.par_chunks_mut(sample)
            .zip(x.par_chunks(sample))
            .zip(workspace.par_chunks_mut(sample))
            .for_each(|((ys, xs), xh)| normalize(xs, ys, Some(xh)));
    }
}

/// Batch-normalization backward of the training form.
///
/// - `workspace`: the `x_hat` written by [`do_forward`].
/// - `std`: `sqrt(var + eps)` per channel, as used by that forward.
/// - `gw`: receives `[ggamma; c]` then `[gbeta; c]`.
#[allow(clippy::too_many_arguments)]
pub fn do_backward(
    workspace: &[f32],
    std: &[f32],
    weights: &[f32],
    gy: &[f32],
    gx: &mut [f32],
    gw: &mut [f32],
    d: NormDescriptor,
    flags: Flags,
) {
    debug_assert_eq!(workspace.len(), d.len());
    debug_assert_eq!(gy.len(), d.len());
    debug_assert_eq!(gw.len(), 2 * d.c);

    let s = d.spatial;
    let gbeta = channel_reduce(d, |base, _| simd::sum(&gy[base..base + s]));
    let ggamma = channel_reduce(d, |base, _| {
        simd::dot(&gy[base..base + s], &workspace[base..base + s])
    });
    let (gg, gb) = gw.split_at_mut(d.c);
    for ch in 0..d.c {
        gg[ch] = ggamma[ch] as f32;
        gb[ch] = gbeta[ch] as f32;
    }

    let sample = d.c * s;
    if sample == 0 {
        return;
    }
    let m = d.reduce_len() as f32;
    let (gg, gb) = (&*gg, &*gb);
    gx.par_chunks_mut(sample)
        .zip(gy.par_chunks(sample))
        .zip(workspace.par_chunks(sample))
        .for_each(|((gxs, gys), xh)| {
            for ch in 0..d.c {
                let g = if flags.has_weights { weights[ch] } else { 1.0 };
                let coeff = g / std[ch];
                let run = ch * s..(ch + 1) * s;
                for ((dst, &dy), &hat) in gxs[run.clone()].iter_mut().zip(&gys[run.clone()]).zip(&xh[run]) {
                    *dst = coeff * (dy - (hat * gg[ch] + gb[ch]) / m);
                }
            }
        });
}

/// Packs `gamma` and `beta` into the `[scale; c][shift; c]` weight layout.
fn pack_weights(gamma: &[f32], beta: &[f32]) -> Vec<f32> {
    let mut weights = Vec::with_capacity(gamma.len() * 2);
    weights.extend_from_slice(gamma);
    weights.extend_from_slice(beta);
    weights
}

/// Training forward returning owned outputs and the backward cache.
pub fn forward_training(x: &[f32], gamma: &[f32], beta: &[f32], d: NormDescriptor, eps: f32) -> BatchNormForward {
    let mut y = vec![0.0f32; x.len()];
    let mut mean = vec![0.0f32; d.c];
    let mut var = vec![0.0f32; d.c];
    let mut x_hat = vec![0.0f32; x.len()];
    do_forward(
        x,
        &mut y,
        &pack_weights(gamma, beta),
        &mut mean,
        &mut var,
        &mut x_hat,
        d,
        eps,
        Flags::TRAINING,
    );
    let std = std_from_var(&var, eps);
    BatchNormForward {
        y,
        cache: BatchNormCache { mean, var, std, x_hat },
    }
}

/// Forward with caller-supplied statistics.
pub fn forward_inference(
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    mean: &[f32],
    var: &[f32],
    d: NormDescriptor,
    eps: f32,
) -> Vec<f32> {
    let mut y = vec![0.0f32; x.len()];
    let mut mean = mean.to_vec();
    let mut var = var.to_vec();
    do_forward(
        x,
        &mut y,
        &pack_weights(gamma, beta),
        &mut mean,
        &mut var,
        &mut [],
        d,
        eps,
        Flags::INFERENCE,
    );
    y
}

/// Training backward from a cache produced by any backend.
pub fn backward(gy: &[f32], gamma: &[f32], cache: &BatchNormCache, d: NormDescriptor) -> BatchNormBackward {
    let mut gx = vec![0.0f32; gy.len()];
    let mut gw = vec![0.0f32; 2 * d.c];
    do_backward(&cache.x_hat, &cache.std, gamma, gy, &mut gx, &mut gw, d, Flags::TRAINING);
    let gbeta = gw.split_off(d.c);
    BatchNormBackward { gx, ggamma: gw, gbeta }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::{allclose, Tolerance};
    use crate::ops::reference;

    fn sample(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i * 37 % 23) as f32 - 11.0) * 0.25).collect()
    }

    #[test]
    fn matches_reference_forward_and_backward() {
        let d = NormDescriptor::derive(&[3, 4, 5, 2], 1);
        let x = sample(d.len());
        let gamma = [1.0, 0.5, -2.0, 1.5];
        let beta = [0.0, 1.0, 0.25, -1.0];
        let ours = forward_training(&x, &gamma, &beta, d, 2e-5);
        let theirs = reference::batch_norm_forward_training(&x, &gamma, &beta, d, 2e-5);
        assert!(allclose(&ours.y, &theirs.y, Tolerance::BACKEND));
        assert!(allclose(&ours.cache.var, &theirs.cache.var, Tolerance::BACKEND));

        let gy: Vec<f32> = sample(d.len()).iter().map(|v| v * 0.1 + 0.3).collect();
        let a = backward(&gy, &gamma, &ours.cache, d);
        let b = reference::batch_norm_backward(&gy, &gamma, &theirs.cache, d);
        assert!(allclose(&a.gx, &b.gx, Tolerance::BACKEND));
        assert!(allclose(&a.ggamma, &b.ggamma, Tolerance::BACKEND));
        assert!(allclose(&a.gbeta, &b.gbeta, Tolerance::BACKEND));
    }

    #[test]
    fn fixed_statistics_are_left_alone() {
        let d = NormDescriptor::derive(&[2, 2], 1);
        let y = forward_inference(&[1.0, 2.0, 3.0, 4.0], &[1.0, 1.0], &[0.0, 0.0], &[1.0, 2.0], &[1.0, 4.0], d, 0.0);
        assert_eq!(y, vec![0.0, 0.0, 2.0, 1.0]);
    }

    #[test]
    fn identity_weights_without_workspace() {
        let d = NormDescriptor::derive(&[4, 1], 1);
        let x = [1.0, 2.0, 3.0, 4.0];
        let mut y = [0.0f32; 4];
        let (mut mean, mut var) = ([0.0f32], [0.0f32]);
        let flags = Flags {
            has_weights: false,
            ..Flags::TRAINING
        };
        do_forward(&x, &mut y, &[], &mut mean, &mut var, &mut [], d, 0.0, flags);
        assert_eq!(mean, [2.5]);
        assert_eq!(var, [1.25]);
        assert!((y[0] + y[3]).abs() < 1e-6);
    }
}
