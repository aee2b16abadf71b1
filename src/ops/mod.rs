//! # Kernel Layer
//!
//! This module holds the numeric kernels behind every differentiable
//! operation, one submodule per backend, plus the dispatch layer that routes
//! a call to the backend chosen by [`BackendSelector`](crate::backend::BackendSelector).
//!
//! ## Submodules
//!
//! - [`reference`] — Elementwise arithmetic, the always-available fallback
//! - [`vecmath`] — Fused, multi-threaded CPU kernels over raw buffers (optional AVX2)
//! - [`wgpu`] *(opt-in)* — WGSL compute pipelines dispatched through `wgpu`
//! - [`dispatch`] — Backend selection plus execution-time fallback
//!
//! ## Extending the Backends
//!
//! To add a new operation:
//!
//! 1. Implement it in [`reference`] and optionally in an accelerated backend
//! 2. Claim it in that backend's probe (`supports`)
//! 3. Route it in [`dispatch`]
//!
//! Kernels work on flat `&[f32]` buffers with a descriptor of the layout.
//! Shape validation happens in [`functions`](crate::functions) before any
//! kernel runs, so kernels only `debug_assert!` their preconditions.
//!
//! ## Feature Flags
//!
//! - `simd` — Enables AVX2 inner loops in [`vecmath`]
//! - `wgpu` — Enables the GPU backend

pub mod dispatch;
pub mod reference;
pub mod vecmath;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use crate::error::{Error, Result};

/// Batch-normalization layout of an input tensor.
///
/// An input of shape `[N, C1.., S1..]` normalized with a parameter of shape
/// `[C1..]` is viewed as `[n, c, spatial]`: element `(i, ch, s)` lives at
/// `(i * c + ch) * spatial + s`. Statistics are taken per channel over
/// `n * spatial` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormDescriptor {
    pub n: usize,
    pub c: usize,
    pub spatial: usize,
}

impl NormDescriptor {
    /// Derives the normalization layout of `x_shape` for a parameter of rank
    /// `param_rank`.
    ///
    /// Callers must have checked `x_shape.len() > param_rank`.
    pub fn derive(x_shape: &[usize], param_rank: usize) -> Self {
        let n = x_shape[0];
        let c = x_shape[1..=param_rank].iter().product();
        let spatial = x_shape[1 + param_rank..].iter().product();
        Self { n, c, spatial }
    }

    /// Number of elements reduced into each channel statistic.
    pub fn reduce_len(&self) -> usize {
        self.n * self.spatial
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.n * self.c * self.spatial
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channel of flat element `i`.
    #[inline]
    pub fn channel_of(&self, i: usize) -> usize {
        (i / self.spatial) % self.c
    }
}

/// Per-call values a training forward hands to the matching backward.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormCache {
    /// Batch mean per channel.
    pub mean: Vec<f32>,
    /// Biased batch variance per channel.
    pub var: Vec<f32>,
    /// `sqrt(var + eps)` per channel.
    pub std: Vec<f32>,
    /// Normalized input, same length as `x`.
    pub x_hat: Vec<f32>,
}

/// Output of a training-mode batch-normalization forward.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormForward {
    pub y: Vec<f32>,
    pub cache: BatchNormCache,
}

/// Raw gradients of a training-mode batch-normalization backward.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormBackward {
    pub gx: Vec<f32>,
    pub ggamma: Vec<f32>,
    pub gbeta: Vec<f32>,
}

/// Destination-major grouping of embedding indices.
///
/// `positions[offsets[r]..offsets[r + 1]]` lists, in ascending order, every
/// position `i` with `x[i] == r`. Scatter-add kernels walk one bucket per
/// destination row, so no two workers ever write the same row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buckets {
    pub offsets: Vec<u32>,
    pub positions: Vec<u32>,
}

impl Buckets {
    /// Groups `indices` by value. Every index must lie in `[0, rows)`.
    pub fn build(indices: &[i32], rows: usize) -> Self {
        let mut offsets = vec![0u32; rows + 1];
        for &ix in indices {
            offsets[ix as usize + 1] += 1;
        }
        for r in 0..rows {
            offsets[r + 1] += offsets[r];
        }
        let mut cursor = offsets.clone();
        let mut positions = vec![0u32; indices.len()];
        for (pos, &ix) in indices.iter().enumerate() {
            let slot = &mut cursor[ix as usize];
            positions[*slot as usize] = pos as u32;
            *slot += 1;
        }
        Self { offsets, positions }
    }

    /// Positions that scatter into `row`.
    pub fn bucket(&self, row: usize) -> &[u32] {
        &self.positions[self.offsets[row] as usize..self.offsets[row + 1] as usize]
    }
}

/// Output extent of a convolution along one axis.
///
/// `cover_all` adds `stride - 1` so that every input pixel is covered by at
/// least one window. Returns `None` when no window fits.
pub fn get_conv_outsize(size: usize, k: usize, s: usize, p: usize, cover_all: bool) -> Option<usize> {
    if s == 0 {
        return None;
    }
    let extra = if cover_all { s - 1 } else { 0 };
    let span = (size + 2 * p + extra).checked_sub(k)?;
    Some(span / s + 1)
}

/// Full geometry of a 2-D convolution call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub out_c: usize,
    pub kh: usize,
    pub kw: usize,
    pub sy: usize,
    pub sx: usize,
    pub ph: usize,
    pub pw: usize,
    pub out_h: usize,
    pub out_w: usize,
}

impl ConvGeometry {
    /// Geometry of `x [N, C, H, W]` convolved with `w [O, C, KH, KW]`.
    pub fn new(
        x_shape: &[usize],
        w_shape: &[usize],
        stride: (usize, usize),
        pad: (usize, usize),
        cover_all: bool,
    ) -> Result<Self> {
        if x_shape.len() != 4 || w_shape.len() != 4 {
            return Err(Error::shape(format!(
                "convolution expects 4-D input and filter, got {x_shape:?} and {w_shape:?}"
            )));
        }
        if x_shape[1] != w_shape[1] {
            return Err(Error::shape(format!(
                "input has {} channels but filter expects {}",
                x_shape[1], w_shape[1]
            )));
        }
        let (sy, sx) = stride;
        let (ph, pw) = pad;
        let (kh, kw) = (w_shape[2], w_shape[3]);
        let out_h = get_conv_outsize(x_shape[2], kh, sy, ph, cover_all);
        let out_w = get_conv_outsize(x_shape[3], kw, sx, pw, cover_all);
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            return Err(Error::shape(format!(
                "filter {kh}x{kw} does not fit input {}x{} with padding {pad:?}",
                x_shape[2], x_shape[3]
            )));
        };
        Ok(Self {
            n: x_shape[0],
            c: x_shape[1],
            h: x_shape[2],
            w: x_shape[3],
            out_c: w_shape[0],
            kh,
            kw,
            sy,
            sx,
            ph,
            pw,
            out_h,
            out_w,
        })
    }

    pub fn out_shape(&self) -> [usize; 4] {
        [self.n, self.out_c, self.out_h, self.out_w]
    }

    /// Rows of the unfolded input: `c * kh * kw`.
    pub fn col_rows(&self) -> usize {
        self.c * self.kh * self.kw
    }

    /// Columns of the unfolded input: `out_h * out_w`.
    pub fn col_cols(&self) -> usize {
        self.out_h * self.out_w
    }

    /// Elements in one input sample.
    pub fn sample_len(&self) -> usize {
        self.c * self.h * self.w
    }

    /// Input coordinate read by output `o` and kernel tap `k` along one axis,
    /// `None` when it falls into padding.
    #[inline]
    pub fn source(o: usize, k: usize, stride: usize, pad: usize, size: usize) -> Option<usize> {
        (o * stride + k).checked_sub(pad).filter(|&i| i < size)
    }
}
