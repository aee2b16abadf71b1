//! briny_kernels: differentiable tensor operations with pluggable hardware backends.
//!
//! Each operation computes a forward result and, later, the gradients of its
//! inputs and parameters given the gradients of its outputs. Every call runs
//! on the best backend that can serve it, chosen per call from an explicit
//! [`BackendConfig`](backend::BackendConfig).
//!
//! # Features
//!
//! - Embedding lookup with an exact scatter-add backward, even under repeated indices.
//! - Batch normalization with batch or fixed statistics and decayed running statistics.
//! - 2-D convolution with stride, padding and `cover_all` output sizing.
//! - Parameter initializers (fills, normal and uniform families, fan scaling, orthogonal).
//! - Three interchangeable backends: reference arithmetic, a multi-threaded CPU
//!   vector-math library, and WGSL compute kernels through `wgpu`.
//!
//! # Modules
//!
//! - [`tensors`] — Tensor data model, element types, device placement.
//! - [`backend`] — Backend enum, capability probes, configuration and selection.
//! - [`function`] — The forward/backward contract and input type checks.
//! - [`functions`] — The differentiable operations.
//! - [`initializers`] — Parameter fill policies.
//! - [`ops`] — Kernels per backend and the dispatch layer.
//! - [`params`] — Named parameter access for checkpointing.
//! - [`approx`], [`gradcheck`] — Tolerance comparison and finite-difference checks.
//!
//! # Example
//!
//! ```rust
//! use briny_kernels::backend::BackendConfig;
//! use briny_kernels::functions::EmbedId;
//! use briny_kernels::tensors::Tensor;
//!
//! let mut embed = EmbedId::from_weights(Tensor::zeros(vec![6, 2]), BackendConfig::default()).unwrap();
//! let x = Tensor::new(vec![3], vec![2, 2, 5]);
//! let (_, pending) = embed.forward(&x).unwrap();
//! let gy = Tensor::new(vec![3, 2], vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
//! embed.backward(pending, &gy).unwrap();
//! assert_eq!(&embed.gw().data[4..6], &[3.0, 3.0]);
//! assert_eq!(&embed.gw().data[10..12], &[3.0, 3.0]);
//! ```

pub mod approx;
pub mod backend;
pub mod error;
pub mod function;
pub mod functions;
pub mod gradcheck;
pub mod initializers;
pub mod ops;
pub mod params;
pub mod tensors;

pub use error::{Error, Result};
