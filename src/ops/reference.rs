//! Reference backend.
//!
//! Straight elementwise loops with `f64` accumulation for reductions. Every
//! operation has an implementation here, so this backend is the fallback
//! for any call an accelerated backend declines or fails.

use super::{BatchNormBackward, BatchNormCache, BatchNormForward, ConvGeometry, NormDescriptor};

/// Per-channel sums over the `n * spatial` elements of each channel.
fn channel_sums(d: NormDescriptor, mut f: impl FnMut(usize, usize) -> f64) -> Vec<f64> {
    let mut sums = vec![0.0f64; d.c];
    for i in 0..d.n {
        for (ch, sum) in sums.iter_mut().enumerate() {
            let base = (i * d.c + ch) * d.spatial;
            for s in 0..d.spatial {
                *sum += f(base + s, ch);
            }
        }
    }
    sums
}

/// Training forward: batch statistics, biased variance.
pub fn batch_norm_forward_training(
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    d: NormDescriptor,
    eps: f32,
) -> BatchNormForward {
    let m = d.reduce_len() as f64;
    let mean: Vec<f32> = channel_sums(d, |i, _| x[i] as f64)
        .into_iter()
        .map(|s| (s / m) as f32)
        .collect();
    let var: Vec<f32> = channel_sums(d, |i, ch| {
        let dev = x[i] as f64 - mean[ch] as f64;
        dev * dev
    })
    .into_iter()
    .map(|s| (s / m) as f32)
    .collect();
    let std: Vec<f32> = var.iter().map(|&v| (v + eps).sqrt()).collect();

    let mut x_hat = vec![0.0f32; x.len()];
    let mut y = vec![0.0f32; x.len()];
    for (i, &xi) in x.iter().enumerate() {
        let ch = d.channel_of(i);
        x_hat[i] = (xi - mean[ch]) / std[ch];
        y[i] = gamma[ch] * x_hat[i] + beta[ch];
    }

    BatchNormForward {
        y,
        cache: BatchNormCache {
            mean,
            var,
            std,
            x_hat,
        },
    }
}

/// Forward with caller-supplied statistics.
pub fn batch_norm_forward_inference(
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    mean: &[f32],
    var: &[f32],
    d: NormDescriptor,
    eps: f32,
) -> Vec<f32> {
    let std: Vec<f32> = var.iter().map(|&v| (v + eps).sqrt()).collect();
    x.iter()
        .enumerate()
        .map(|(i, &xi)| {
            let ch = d.channel_of(i);
            gamma[ch] * (xi - mean[ch]) / std[ch] + beta[ch]
        })
        .collect()
}

/// Training backward from the cached `x_hat` and `std`.
pub fn batch_norm_backward(
    gy: &[f32],
    gamma: &[f32],
    cache: &BatchNormCache,
    d: NormDescriptor,
) -> BatchNormBackward {
    let m = d.reduce_len() as f32;
    let gbeta: Vec<f32> = channel_sums(d, |i, _| gy[i] as f64)
        .into_iter()
        .map(|s| s as f32)
        .collect();
    let ggamma: Vec<f32> = channel_sums(d, |i, _| gy[i] as f64 * cache.x_hat[i] as f64)
        .into_iter()
        .map(|s| s as f32)
        .collect();

    let gx = gy
        .iter()
        .enumerate()
        .map(|(i, &g)| {
            let ch = d.channel_of(i);
            let coeff = gamma[ch] / cache.std[ch];
            coeff * (g - (cache.x_hat[i] * ggamma[ch] + gbeta[ch]) / m)
        })
        .collect();

    BatchNormBackward { gx, ggamma, gbeta }
}

/// Gradients of the fixed-statistics form, including those of the statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedBackward {
    pub gx: Vec<f32>,
    pub ggamma: Vec<f32>,
    pub gbeta: Vec<f32>,
    pub gmean: Vec<f32>,
    pub gvar: Vec<f32>,
}

/// Closed-form backward of the fixed-statistics forward.
///
/// Statistics are inputs here, so the batch-coupling terms of the training
/// backward vanish and `gx` is a per-channel scaling of `gy`.
pub fn batch_norm_backward_fixed(
    x: &[f32],
    gamma: &[f32],
    mean: &[f32],
    var: &[f32],
    gy: &[f32],
    d: NormDescriptor,
    eps: f32,
) -> FixedBackward {
    let var_eps: Vec<f32> = var.iter().map(|&v| v + eps).collect();
    let std: Vec<f32> = var_eps.iter().map(|v| v.sqrt()).collect();
    let gbeta: Vec<f32> = channel_sums(d, |i, _| gy[i] as f64)
        .into_iter()
        .map(|s| s as f32)
        .collect();
    let ggamma: Vec<f32> = channel_sums(d, |i, ch| {
        let x_hat = (x[i] - mean[ch]) / std[ch];
        gy[i] as f64 * x_hat as f64
    })
    .into_iter()
    .map(|s| s as f32)
    .collect();

    let gs: Vec<f32> = gamma.iter().zip(&std).map(|(g, s)| g / s).collect();
    let gmean = gs.iter().zip(&gbeta).map(|(g, b)| -g * b).collect();
    let gvar = (0..d.c)
        .map(|ch| -0.5 * gamma[ch] / var_eps[ch] * ggamma[ch])
        .collect();
    let gx = gy
        .iter()
        .enumerate()
        .map(|(i, &g)| gs[d.channel_of(i)] * g)
        .collect();

    FixedBackward {
        gx,
        ggamma,
        gbeta,
        gmean,
        gvar,
    }
}

/// Row gather: `out[i] = w[x[i]]`.
pub fn embed_forward(w: &[f32], dim: usize, x: &[i32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(x.len() * dim);
    for &ix in x {
        let row = ix as usize * dim;
        out.extend_from_slice(&w[row..row + dim]);
    }
    out
}

/// Sequential scatter-add: `gw[x[i]] += gy[i]`.
pub fn embed_backward(gw: &mut [f32], dim: usize, x: &[i32], gy: &[f32]) {
    for (i, &ix) in x.iter().enumerate() {
        let row = ix as usize * dim;
        for (dst, &g) in gw[row..row + dim].iter_mut().zip(&gy[i * dim..(i + 1) * dim]) {
            *dst += g;
        }
    }
}

/// Direct convolution: `y[n,o,oy,ox] = b[o] + sum(w[o,c,ky,kx] * x[n,c,iy,ix])`.
pub fn conv2d_forward(x: &[f32], w: &[f32], b: Option<&[f32]>, g: &ConvGeometry) -> Vec<f32> {
    let mut y = vec![0.0f32; g.n * g.out_c * g.out_h * g.out_w];
    let mut idx = 0;
    for n in 0..g.n {
        for o in 0..g.out_c {
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let mut acc = b.map_or(0.0, |b| b[o] as f64);
                    for c in 0..g.c {
                        for ky in 0..g.kh {
                            let Some(iy) = ConvGeometry::source(oy, ky, g.sy, g.ph, g.h) else {
                                continue;
                            };
                            for kx in 0..g.kw {
                                let Some(ix) = ConvGeometry::source(ox, kx, g.sx, g.pw, g.w) else {
                                    continue;
                                };
                                let xv = x[((n * g.c + c) * g.h + iy) * g.w + ix];
                                let wv = w[((o * g.c + c) * g.kh + ky) * g.kw + kx];
                                acc += xv as f64 * wv as f64;
                            }
                        }
                    }
                    y[idx] = acc as f32;
                    idx += 1;
                }
            }
        }
    }
    y
}

/// Gradients of a convolution call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvBackward {
    pub gx: Vec<f32>,
    pub gw: Vec<f32>,
    pub gb: Vec<f32>,
}

/// Direct convolution backward.
pub fn conv2d_backward(x: &[f32], w: &[f32], gy: &[f32], g: &ConvGeometry) -> ConvBackward {
    let mut gx = vec![0.0f64; x.len()];
    let mut gw = vec![0.0f64; w.len()];
    let mut gb = vec![0.0f64; g.out_c];
    let mut idx = 0;
    for n in 0..g.n {
        for o in 0..g.out_c {
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let gv = gy[idx] as f64;
                    idx += 1;
                    gb[o] += gv;
                    for c in 0..g.c {
                        for ky in 0..g.kh {
                            let Some(iy) = ConvGeometry::source(oy, ky, g.sy, g.ph, g.h) else {
                                continue;
                            };
                            for kx in 0..g.kw {
                                let Some(ix) = ConvGeometry::source(ox, kx, g.sx, g.pw, g.w) else {
                                    continue;
                                };
                                let xi = ((n * g.c + c) * g.h + iy) * g.w + ix;
                                let wi = ((o * g.c + c) * g.kh + ky) * g.kw + kx;
                                gx[xi] += w[wi] as f64 * gv;
                                gw[wi] += x[xi] as f64 * gv;
                            }
                        }
                    }
                }
            }
        }
    }
    let narrow = |v: Vec<f64>| v.into_iter().map(|e| e as f32).collect();
    ConvBackward {
        gx: narrow(gx),
        gw: narrow(gw),
        gb: narrow(gb),
    }
}
