//! im2col convolution.
//!
//! Each sample is unfolded into a `[c * kh * kw, out_h * out_w]` column
//! matrix and multiplied by the filter viewed as `[out_c, c * kh * kw]`.
//! Samples are processed in parallel.

use rayon::prelude::*;

use super::simd;
use crate::ops::ConvGeometry;
use crate::ops::reference::ConvBackward;

/// Unfolds one input sample into `col`, zero where a window reads padding.
pub fn im2col(x: &[f32], g: &ConvGeometry, col: &mut [f32]) {
    let p = g.col_cols();
    for c in 0..g.c {
        for ky in 0..g.kh {
            for kx in 0..g.kw {
                let row = ((c * g.kh + ky) * g.kw + kx) * p;
                for oy in 0..g.out_h {
                    let iy = ConvGeometry::source(oy, ky, g.sy, g.ph, g.h);
                    for ox in 0..g.out_w {
                        let ix = ConvGeometry::source(ox, kx, g.sx, g.pw, g.w);
                        col[row + oy * g.out_w + ox] = match (iy, ix) {
                            (Some(iy), Some(ix)) => x[(c * g.h + iy) * g.w + ix],
                            _ => 0.0,
                        };
                    }
                }
            }
        }
    }
}

/// Folds `col` back onto one input sample, accumulating overlaps.
pub fn col2im(col: &[f32], g: &ConvGeometry, x: &mut [f32]) {
    let p = g.col_cols();
    for c in 0..g.c {
        for ky in 0..g.kh {
            for kx in 0..g.kw {
                let row = ((c * g.kh + ky) * g.kw + kx) * p;
                for oy in 0..g.out_h {
                    let Some(iy) = ConvGeometry::source(oy, ky, g.sy, g.ph, g.h) else {
                        continue;
                    };
                    for ox in 0..g.out_w {
                        if let Some(ix) = ConvGeometry::source(ox, kx, g.sx, g.pw, g.w) {
                            x[(c * g.h + iy) * g.w + ix] += col[row + oy * g.out_w + ox];
                        }
                    }
                }
            }
        }
    }
}

pub fn conv2d_forward(x: &[f32], w: &[f32], b: Option<&[f32]>, g: &ConvGeometry) -> Vec<f32> {
    let (k, p) = (g.col_rows(), g.col_cols());
    let mut y = vec![0.0f32; g.n * g.out_c * p];
    if p == 0 || g.out_c == 0 {
        return y;
    }
    y.par_chunks_mut(g.out_c * p)
        .zip(x.par_chunks(g.sample_len().max(1)))
        .for_each(|(ys, xs)| {
            let mut col = vec![0.0f32; k * p];
            im2col(xs, g, &mut col);
            for (o, yrow) in ys.chunks_mut(p).enumerate() {
                yrow.fill(b.map_or(0.0, |b| b[o]));
                let wrow = &w[o * k..(o + 1) * k];
                for (kk, &wv) in wrow.iter().enumerate() {
                    simd::axpy(yrow, wv, &col[kk * p..(kk + 1) * p]);
                }
            }
        });
    y
}

pub fn conv2d_backward(x: &[f32], w: &[f32], gy: &[f32], g: &ConvGeometry) -> ConvBackward {
    let (k, p) = (g.col_rows(), g.col_cols());
    let sample_in = g.sample_len().max(1);
    let sample_out = (g.out_c * p).max(1);

    let gw = x
        .par_chunks(sample_in)
        .zip(gy.par_chunks(sample_out))
        .map(|(xs, gys)| {
            let mut col = vec![0.0f32; k * p];
            im2col(xs, g, &mut col);
            let mut part = vec![0.0f32; g.out_c * k];
            for (o, prow) in part.chunks_mut(k.max(1)).enumerate() {
                let grow = &gys[o * p..(o + 1) * p];
                for (kk, dst) in prow.iter_mut().enumerate() {
                    *dst = simd::dot(grow, &col[kk * p..(kk + 1) * p]);
                }
            }
            part
        })
        .reduce(
            || vec![0.0f32; g.out_c * k],
            |mut acc, part| {
                simd::axpy(&mut acc, 1.0, &part);
                acc
            },
        );

    let mut gx = vec![0.0f32; x.len()];
    gx.par_chunks_mut(sample_in)
        .zip(gy.par_chunks(sample_out))
        .for_each(|(gxs, gys)| {
            let mut gcol = vec![0.0f32; k * p];
            for o in 0..g.out_c {
                let grow = &gys[o * p..(o + 1) * p];
                for kk in 0..k {
                    simd::axpy(&mut gcol[kk * p..(kk + 1) * p], w[o * k + kk], grow);
                }
            }
            col2im(&gcol, g, gxs);
        });

    let mut gb = vec![0.0f32; g.out_c];
    for gys in gy.chunks(sample_out) {
        for (o, acc) in gb.iter_mut().enumerate() {
            *acc += simd::sum(&gys[o * p..(o + 1) * p]);
        }
    }

    ConvBackward { gx, gw, gb }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::{allclose, Tolerance};
    use crate::ops::reference;

    fn ramp(len: usize, scale: f32) -> Vec<f32> {
        (0..len).map(|i| ((i * 29 % 17) as f32 - 8.0) * scale).collect()
    }

    #[test]
    fn im2col_pads_with_zeros() {
        let g = ConvGeometry::new(&[1, 1, 2, 2], &[1, 1, 3, 3], (1, 1), (1, 1), false).unwrap();
        let mut col = vec![f32::NAN; g.col_rows() * g.col_cols()];
        im2col(&[1.0, 2.0, 3.0, 4.0], &g, &mut col);
        // centre tap sees the input unchanged
        assert_eq!(&col[4 * 4..5 * 4], &[1.0, 2.0, 3.0, 4.0]);
        // top-left tap only sees pixel (0, 0) from output (1, 1)
        assert_eq!(&col[0..4], &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn strided_cover_all_matches_reference() {
        let g = ConvGeometry::new(&[2, 3, 7, 6], &[4, 3, 3, 2], (2, 2), (1, 0), true).unwrap();
        let x = ramp(2 * 3 * 7 * 6, 0.1);
        let w = ramp(4 * 3 * 3 * 2, 0.05);
        let b = [0.1, -0.2, 0.3, 0.0];
        let ours = conv2d_forward(&x, &w, Some(&b), &g);
        let theirs = reference::conv2d_forward(&x, &w, Some(&b), &g);
        assert!(allclose(&ours, &theirs, Tolerance::BACKEND));

        let gy = ramp(ours.len(), 0.02);
        let a = conv2d_backward(&x, &w, &gy, &g);
        let r = reference::conv2d_backward(&x, &w, &gy, &g);
        assert!(allclose(&a.gx, &r.gx, Tolerance::BACKEND));
        assert!(allclose(&a.gw, &r.gw, Tolerance::BACKEND));
        assert!(allclose(&a.gb, &r.gb, Tolerance::BACKEND));
    }
}
