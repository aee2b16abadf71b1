//! Embedding lookup.
//!
//! `EmbedId` owns a `[vocab, dim]` weight matrix `W` and its gradient
//! accumulator `gW`. Forward gathers one row of `W` per index; backward
//! scatter-adds the output gradient rows back into `gW`. Repeated indices
//! accumulate exactly on every backend.

use rand::Rng;
use tracing::trace;

use crate::backend::{Backend, BackendConfig, BackendSelector};
use crate::error::{Error, Result};
use crate::function::{self, Function, Mode};
use crate::initializers::Initializer;
use crate::ops::dispatch;
use crate::tensors::{AnyTensor, Tensor, WithGrad};

/// Learnable lookup table.
#[derive(Debug, Clone)]
pub struct EmbedId {
    params: WithGrad<Tensor<f32>>,
    selector: BackendSelector,
}

/// State a forward hands to its backward.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedPending {
    x: Tensor<i32>,
    backend: Backend,
}

impl EmbedPending {
    /// Backend that ran the forward.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The indices of the forward.
    pub fn indices(&self) -> &Tensor<i32> {
        &self.x
    }
}

impl EmbedId {
    /// Creates a `[vocab, dim]` table filled by `initializer`, standard
    /// normal when `None`.
    pub fn new<R: Rng + ?Sized>(
        vocab: usize,
        dim: usize,
        initializer: Option<&Initializer>,
        rng: &mut R,
        config: BackendConfig,
    ) -> Result<Self> {
        let w = match initializer {
            Some(init) => init.generate_f32(&[vocab, dim], rng)?,
            None => Initializer::Normal { scale: 1.0 }.generate_f32(&[vocab, dim], rng)?,
        };
        Self::from_weights(w, config)
    }

    /// Wraps an existing `[vocab, dim]` weight matrix.
    pub fn from_weights(w: Tensor<f32>, config: BackendConfig) -> Result<Self> {
        if w.ndim() != 2 {
            return Err(Error::shape(format!(
                "embedding weights must be 2-D, got {:?}",
                w.shape
            )));
        }
        Ok(Self {
            params: WithGrad::new(w),
            selector: BackendSelector::new(config),
        })
    }

    pub fn vocab(&self) -> usize {
        self.params.value.shape[0]
    }

    pub fn dim(&self) -> usize {
        self.params.value.shape[1]
    }

    /// The weight matrix `W`.
    pub fn w(&self) -> &Tensor<f32> {
        &self.params.value
    }

    /// The gradient accumulator `gW`.
    pub fn gw(&self) -> &Tensor<f32> {
        &self.params.grad
    }

    pub(crate) fn params_mut(&mut self) -> &mut WithGrad<Tensor<f32>> {
        &mut self.params
    }

    /// Resets `gW` to zero.
    pub fn zero_grad(&mut self) {
        self.params.zero_grad();
    }

    /// Looks up one row of `W` per index of the 1-D `x`.
    ///
    /// Returns `[len(x), dim]` placed like `x`.
    pub fn forward(&self, x: &Tensor<i32>) -> Result<(Tensor<f32>, EmbedPending)> {
        if x.ndim() != 1 {
            return Err(Error::shape(format!(
                "embedding indices must be 1-D, got {:?}",
                x.shape
            )));
        }
        self.check_indices(x)?;
        let dim = self.dim();
        let (y, backend) = dispatch::embed_forward(&self.selector, x.device, &self.params.value.data, dim, &x.data)?;
        trace!(len = x.len(), dim, %backend, "embed_id forward");
        let y = Tensor::new(vec![x.len(), dim], y).to_device(x.device);
        Ok((
            y,
            EmbedPending {
                x: x.clone(),
                backend,
            },
        ))
    }

    /// Adds `gy[i]` into `gW[x[i]]` for every position of the forward.
    ///
    /// The indices receive no gradient.
    pub fn backward(&mut self, pending: EmbedPending, gy: &Tensor<f32>) -> Result<()> {
        self.check_grad(&pending, gy)?;
        let dim = self.dim();
        dispatch::embed_backward(
            &self.selector,
            pending.x.device,
            &mut self.params.grad.data,
            dim,
            &pending.x.data,
            &gy.data,
        )?;
        Ok(())
    }

    fn check_indices(&self, x: &Tensor<i32>) -> Result<()> {
        let vocab = self.vocab();
        match x
            .data
            .iter()
            .enumerate()
            .find(|&(_, &ix)| ix < 0 || ix as usize >= vocab)
        {
            Some((pos, &ix)) => Err(Error::shape(format!(
                "index {ix} at position {pos} is outside the vocabulary of {vocab}"
            ))),
            None => Ok(()),
        }
    }

    // a pending state may come from another table
    fn check_grad(&self, pending: &EmbedPending, gy: &Tensor<f32>) -> Result<()> {
        function::expect_shape("gy", &gy.shape, &[pending.x.len(), self.dim()])?;
        self.check_indices(&pending.x)
    }
}

impl Function for EmbedId {
    type Pending = EmbedPending;

    const NAME: &'static str = "EmbedID";

    fn check_type_forward(&self, inputs: &[AnyTensor]) -> Result<()> {
        function::expect_count(Self::NAME, inputs, &[1])?;
        function::expect_i32(Self::NAME, "indices", &inputs[0])?;
        function::expect_ndim(Self::NAME, "indices", &inputs[0], 1)
    }

    fn forward_dyn(&mut self, _mode: Mode, inputs: &[AnyTensor]) -> Result<(Vec<Tensor<f32>>, EmbedPending)> {
        let x = function::expect_i32(Self::NAME, "indices", &inputs[0])?;
        let (y, pending) = self.forward(x)?;
        Ok((vec![y], pending))
    }

    fn check_backward(&self, pending: &EmbedPending, grad_outputs: &[Tensor<f32>]) -> Result<()> {
        let gy = function::single_grad(Self::NAME, grad_outputs)?;
        self.check_grad(pending, gy)
    }

    fn backward_dyn(&mut self, pending: EmbedPending, grad_outputs: &[Tensor<f32>]) -> Result<Vec<Option<Tensor<f32>>>> {
        let gy = function::single_grad(Self::NAME, grad_outputs)?;
        self.backward(pending, gy)?;
        Ok(vec![None])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Node;

    fn table() -> EmbedId {
        let w = Tensor::new(vec![3, 2], vec![0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0]);
        EmbedId::from_weights(w, BackendConfig::reference_only()).unwrap()
    }

    #[test]
    fn gathers_rows() {
        let (y, pending) = table().forward(&Tensor::new(vec![3], vec![1, 1, 0])).unwrap();
        assert_eq!(y.shape, vec![3, 2]);
        assert_eq!(y.data, vec![2.0, 3.0, 2.0, 3.0, 0.0, 1.0]);
        assert_eq!(pending.backend(), Backend::Reference);
    }

    #[test]
    fn rejects_out_of_range_indices() {
        let err = table().forward(&Tensor::new(vec![2], vec![0, 3])).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
        let err = table().forward(&Tensor::new(vec![1], vec![-1])).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[test]
    fn backward_checks_gy_shape() {
        let mut e = table();
        let (_, pending) = e.forward(&Tensor::new(vec![2], vec![0, 1])).unwrap();
        let err = e.backward(pending, &Tensor::zeros(vec![2, 3])).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
        assert!(e.gw().data.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn backward_rejects_indices_from_a_larger_table() {
        let big = EmbedId::from_weights(Tensor::zeros(vec![10, 2]), BackendConfig::default()).unwrap();
        let (_, pending) = big.forward(&Tensor::new(vec![1], vec![9])).unwrap();
        for config in [BackendConfig::reference_only(), BackendConfig::default()] {
            let mut small = EmbedId::from_weights(Tensor::zeros(vec![3, 2]), config).unwrap();
            let err = small
                .backward(pending.clone(), &Tensor::full(vec![1, 2], 1.0f32))
                .unwrap_err();
            assert!(matches!(err, Error::Shape(_)));
            assert!(small.gw().data.iter().all(|&g| g == 0.0));
        }
    }

    #[test]
    fn dynamic_path_rejects_float_and_matrix_indices() {
        let mut node = Node::new(table());
        let err = node
            .forward(Mode::Train, &[Tensor::new(vec![1], vec![0.0f32]).into()])
            .unwrap_err();
        assert!(matches!(err, Error::Type { .. }));
        let err = node
            .forward(Mode::Train, &[Tensor::new(vec![1, 1], vec![0i32]).into()])
            .unwrap_err();
        assert!(matches!(err, Error::Type { .. }));
    }

    #[test]
    fn dynamic_backward_needs_forward() {
        let mut node = Node::new(table());
        let err = node.backward(&[Tensor::zeros(vec![1, 2])]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        node.forward(Mode::Train, &[Tensor::new(vec![1], vec![2i32]).into()]).unwrap();
        let grads = node.backward(&[Tensor::full(vec![1, 2], 1.5f32)]).unwrap();
        assert_eq!(grads, vec![None]);
        assert_eq!(node.op().gw().data, vec![0.0, 0.0, 0.0, 0.0, 1.5, 1.5]);
        assert!(!node.has_pending());
    }
}
