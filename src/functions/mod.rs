//! # Differentiable Operations
//!
//! Each operation has a typed API plus a [`Function`](crate::function::Function)
//! implementation over dynamically typed inputs:
//!
//! - [`embed_id`] — Embedding lookup with an exact scatter-add backward
//! - [`batch_normalization`] — Batch normalization with running statistics
//! - [`convolution_2d`] — 2-D convolution
//!
//! ## Call Protocol
//!
//! `forward` validates its inputs, lets the operation's
//! [`BackendSelector`](crate::backend::BackendSelector) pick a backend, and
//! returns the outputs together with a pending call state. `backward` takes
//! that state by value, so every forward is paired with at most one backward.
//!
//! ```rust
//! use briny_kernels::backend::BackendConfig;
//! use briny_kernels::function::Mode;
//! use briny_kernels::functions::batch_normalization::BatchNormalization;
//! use briny_kernels::tensors::Tensor;
//!
//! let mut bn = BatchNormalization::new(2e-5, 0.9, BackendConfig::default()).unwrap();
//! let x = Tensor::new(vec![4, 2], vec![1.0f32, 0.0, 2.0, 0.0, 3.0, 0.0, 4.0, 0.0]);
//! let gamma = Tensor::full(vec![2], 1.0f32);
//! let beta = Tensor::zeros(vec![2]);
//! let (y, pending) = bn.forward(Mode::Train, &x, &gamma, &beta, None).unwrap();
//! let grads = bn.backward(pending, &Tensor::full(y.shape.clone(), 1.0f32)).unwrap();
//! assert_eq!(grads.gbeta.data, vec![4.0, 4.0]);
//! ```

pub mod batch_normalization;
pub mod convolution_2d;
pub mod embed_id;

pub use batch_normalization::{BatchNormalization, fixed_batch_normalization};
pub use convolution_2d::Convolution2D;
pub use embed_id::EmbedId;
