//! CPU vector-math backend
//!
//! # CpuVector Backend
//!
//! Fused kernels over raw host buffers, the CPU counterpart of a vendor
//! math library: batch normalization in a single call per direction,
//! destination-partitioned scatter-add, and im2col convolution.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon)
//! - Optional AVX2 reductions (enabled via `simd` feature flag)
//! - Pure Rust fallback path when SIMD is disabled or unavailable
//!
//! ## Coverage
//!
//! Batch normalization is claimed for rank-2 and rank-4 inputs only, and
//! only with `eps >= ACCELERATED_MIN_EPS`. Embedding is claimed for 1-D
//! `int32` indices, convolution for rank-4 `float32` inputs.

pub mod batch_norm;
pub mod conv;
pub mod embed;
pub mod simd;

use crate::backend::{ACCELERATED_MIN_EPS, Backend, OpKind, Probe};
use crate::tensors::DType;

/// Capability report of the CPU vector-math backend.
#[derive(Debug, Clone, Copy)]
pub struct VecMathProbe {
    enabled: bool,
}

impl VecMathProbe {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Probe for VecMathProbe {
    fn backend(&self) -> Backend {
        Backend::CpuVector
    }

    fn available(&self) -> bool {
        self.enabled
    }

    fn supports(&self, kind: OpKind, rank: usize, dtype: DType) -> bool {
        match kind {
            OpKind::BatchNormForward | OpKind::BatchNormBackward => {
                dtype == DType::F32 && matches!(rank, 2 | 4)
            }
            OpKind::EmbedForward | OpKind::EmbedBackward => dtype == DType::I32 && rank == 1,
            OpKind::ConvForward | OpKind::ConvBackward => dtype == DType::F32 && rank == 4,
        }
    }

    fn min_eps(&self) -> f32 {
        ACCELERATED_MIN_EPS
    }
}
