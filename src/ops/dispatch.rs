//! Operation Dispatch Layer
//!
//! This module runs each kernel on the backend the [`BackendSelector`]
//! picks for the call, and handles accelerator failures at execution time.
//!
//! Each function follows the same order:
//! 1. Ask the selector for a backend (a mandate that cannot be honoured fails here)
//! 2. Run the accelerated kernel if one was chosen
//! 3. On an accelerator failure, log and fall back to the reference kernel,
//!    unless that accelerator was mandated
//!
//! Every function returns the backend that actually produced the result so
//! the caller can record it in its pending call state.

use tracing::trace;

use super::reference::{self, ConvBackward};
use super::{BatchNormBackward, BatchNormCache, BatchNormForward, ConvGeometry, NormDescriptor, vecmath};
use crate::backend::{Backend, BackendSelector, OpKind, Query};
use crate::error::Result;
use crate::tensors::{DType, Device};

/// Converts an accelerator failure into a fallback or, when the backend was
/// mandated, into an error.
#[cfg(feature = "wgpu")]
fn recover(selector: &BackendSelector, backend: Backend, op: OpKind, err: &dyn core::fmt::Display) -> Result<()> {
    if selector.config().is_mandated(backend) {
        return Err(crate::error::Error::Accelerator(format!("{op:?} on {backend}: {err}")));
    }
    tracing::warn!(?op, %backend, %err, "accelerator failed, falling back to reference");
    Ok(())
}

/// Training forward of batch normalization.
#[allow(clippy::too_many_arguments)]
pub fn batch_norm_forward_training(
    selector: &BackendSelector,
    device: Device,
    rank: usize,
    d: NormDescriptor,
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    eps: f32,
) -> Result<(BatchNormForward, Backend)> {
    let query = Query::new(OpKind::BatchNormForward, rank, DType::F32, device).with_eps(eps);
    let backend = selector.select(&query)?;
    trace!(?d, %backend, "batch_norm forward (batch statistics)");
    match backend {
        Backend::Gpu => {
            #[cfg(feature = "wgpu")]
            match super::wgpu::batch_norm_forward_training(x, gamma, beta, d, eps) {
                Ok(out) => return Ok((out, backend)),
                Err(err) => recover(selector, backend, query.kind, &err)?,
            };
        }
        Backend::CpuVector => {
            return Ok((vecmath::batch_norm::forward_training(x, gamma, beta, d, eps), backend));
        }
        Backend::Reference => {}
    }
    Ok((
        reference::batch_norm_forward_training(x, gamma, beta, d, eps),
        Backend::Reference,
    ))
}

/// Forward of batch normalization with caller-supplied statistics.
#[allow(clippy::too_many_arguments)]
pub fn batch_norm_forward_inference(
    selector: &BackendSelector,
    device: Device,
    rank: usize,
    d: NormDescriptor,
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    mean: &[f32],
    var: &[f32],
    eps: f32,
) -> Result<(Vec<f32>, Backend)> {
    let query = Query::new(OpKind::BatchNormForward, rank, DType::F32, device).with_eps(eps);
    let backend = selector.select(&query)?;
    trace!(?d, %backend, "batch_norm forward (fixed statistics)");
    match backend {
        Backend::Gpu => {
            #[cfg(feature = "wgpu")]
            match super::wgpu::batch_norm_forward_inference(x, gamma, beta, mean, var, d, eps) {
                Ok(y) => return Ok((y, backend)),
                Err(err) => recover(selector, backend, query.kind, &err)?,
            };
        }
        Backend::CpuVector => {
            return Ok((
                vecmath::batch_norm::forward_inference(x, gamma, beta, mean, var, d, eps),
                backend,
            ));
        }
        Backend::Reference => {}
    }
    Ok((
        reference::batch_norm_forward_inference(x, gamma, beta, mean, var, d, eps),
        Backend::Reference,
    ))
}

/// Training backward of batch normalization on the backend that ran the
/// forward.
#[cfg_attr(not(feature = "wgpu"), allow(unused_variables))]
pub fn batch_norm_backward(
    selector: &BackendSelector,
    backend: Backend,
    d: NormDescriptor,
    gy: &[f32],
    gamma: &[f32],
    cache: &BatchNormCache,
) -> Result<BatchNormBackward> {
    trace!(?d, %backend, "batch_norm backward");
    match backend {
        Backend::Gpu => {
            #[cfg(feature = "wgpu")]
            match super::wgpu::batch_norm_backward(gy, gamma, cache, d) {
                Ok(out) => return Ok(out),
                Err(err) => recover(selector, backend, OpKind::BatchNormBackward, &err)?,
            };
        }
        Backend::CpuVector => return Ok(vecmath::batch_norm::backward(gy, gamma, cache, d)),
        Backend::Reference => {}
    }
    Ok(reference::batch_norm_backward(gy, gamma, cache, d))
}

/// Row gather of an embedding lookup.
pub fn embed_forward(
    selector: &BackendSelector,
    device: Device,
    w: &[f32],
    dim: usize,
    x: &[i32],
) -> Result<(Vec<f32>, Backend)> {
    let query = Query::new(OpKind::EmbedForward, 1, DType::I32, device);
    match selector.select(&query)? {
        Backend::CpuVector => Ok((vecmath::embed::embed_forward(w, dim, x), Backend::CpuVector)),
        _ => Ok((reference::embed_forward(w, dim, x), Backend::Reference)),
    }
}

/// Scatter-add of an embedding backward into `gw`.
pub fn embed_backward(
    selector: &BackendSelector,
    device: Device,
    gw: &mut [f32],
    dim: usize,
    x: &[i32],
    gy: &[f32],
) -> Result<Backend> {
    let query = Query::new(OpKind::EmbedBackward, 1, DType::I32, device);
    let backend = selector.select(&query)?;
    trace!(len = x.len(), dim, %backend, "embed backward");
    match backend {
        Backend::Gpu => {
            #[cfg(feature = "wgpu")]
            match super::wgpu::embed_backward(gw, dim, x, gy) {
                Ok(()) => return Ok(backend),
                Err(err) => recover(selector, backend, query.kind, &err)?,
            };
        }
        Backend::CpuVector => {
            vecmath::embed::embed_backward(gw, dim, x, gy);
            return Ok(backend);
        }
        Backend::Reference => {}
    }
    reference::embed_backward(gw, dim, x, gy);
    Ok(Backend::Reference)
}

/// Forward of a 2-D convolution.
pub fn conv2d_forward(
    selector: &BackendSelector,
    device: Device,
    x: &[f32],
    w: &[f32],
    b: Option<&[f32]>,
    g: &ConvGeometry,
) -> Result<(Vec<f32>, Backend)> {
    let query = Query::new(OpKind::ConvForward, 4, DType::F32, device);
    match selector.select(&query)? {
        Backend::CpuVector => Ok((vecmath::conv::conv2d_forward(x, w, b, g), Backend::CpuVector)),
        _ => Ok((reference::conv2d_forward(x, w, b, g), Backend::Reference)),
    }
}

/// Backward of a 2-D convolution on the backend that ran the forward.
pub fn conv2d_backward(backend: Backend, x: &[f32], w: &[f32], gy: &[f32], g: &ConvGeometry) -> ConvBackward {
    match backend {
        Backend::CpuVector => vecmath::conv::conv2d_backward(x, w, gy, g),
        _ => reference::conv2d_backward(x, w, gy, g),
    }
}
