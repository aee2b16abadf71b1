//! The differentiable-operation contract.
//!
//! Every operation in [`functions`](crate::functions) has a typed API in
//! which forward returns a pending call state and backward consumes it. The
//! [`Function`] trait describes that API over dynamically typed inputs,
//! and [`Node`] drives it the way a graph runtime would: type-check the
//! inputs, run forward, keep the pending state, and hand it to backward.
//!
//! # Example
//!
//! ```rust
//! use briny_kernels::backend::BackendConfig;
//! use briny_kernels::function::{Mode, Node};
//! use briny_kernels::functions::embed_id::EmbedId;
//! use briny_kernels::tensors::Tensor;
//!
//! let w = Tensor::new(vec![3, 2], vec![0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0]);
//! let mut node = Node::new(EmbedId::from_weights(w, BackendConfig::default()).unwrap());
//! let y = node.forward(Mode::Train, &[Tensor::new(vec![2], vec![2i32, 0]).into()]).unwrap();
//! assert_eq!(y[0].data, vec![4.0, 5.0, 0.0, 1.0]);
//! node.backward(&[Tensor::full(vec![2, 2], 1.0f32)]).unwrap();
//! ```

use crate::error::{Error, Result};
use crate::tensors::{AnyTensor, DType, Tensor};

/// Whether a call is part of training or evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Batch statistics, running-state updates.
    #[default]
    Train,
    /// Fixed statistics, no state updates.
    Evaluate,
}

/// An operation with a forward and a backward over dynamically typed inputs.
pub trait Function {
    /// Per-call cache produced by forward and consumed by backward.
    type Pending;

    /// Name used in error messages.
    const NAME: &'static str;

    /// Checks input count, element types and ranks.
    fn check_type_forward(&self, inputs: &[AnyTensor]) -> Result<()>;

    /// Computes outputs and the pending state. Inputs have passed
    /// [`check_type_forward`](Self::check_type_forward).
    fn forward_dyn(&mut self, mode: Mode, inputs: &[AnyTensor]) -> Result<(Vec<Tensor<f32>>, Self::Pending)>;

    /// Checks output gradients against the pending state without consuming it.
    fn check_backward(&self, pending: &Self::Pending, grad_outputs: &[Tensor<f32>]) -> Result<()>;

    /// Gradients with respect to each input, `None` for non-differentiable ones.
    fn backward_dyn(
        &mut self,
        pending: Self::Pending,
        grad_outputs: &[Tensor<f32>],
    ) -> Result<Vec<Option<Tensor<f32>>>>;
}

/// A differentiable operation holding at most one pending call.
#[derive(Debug)]
pub struct Node<F: Function> {
    op: F,
    pending: Option<F::Pending>,
}

impl<F: Function> Node<F> {
    pub fn new(op: F) -> Self {
        Self { op, pending: None }
    }

    pub fn op(&self) -> &F {
        &self.op
    }

    pub fn op_mut(&mut self) -> &mut F {
        &mut self.op
    }

    pub fn into_inner(self) -> F {
        self.op
    }

    /// Whether a forward result is waiting for its backward.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Type-checks `inputs`, runs forward and stores the pending state.
    ///
    /// A second forward replaces an unconsumed pending state.
    pub fn forward(&mut self, mode: Mode, inputs: &[AnyTensor]) -> Result<Vec<Tensor<f32>>> {
        self.op.check_type_forward(inputs)?;
        let (outputs, pending) = self.op.forward_dyn(mode, inputs)?;
        self.pending = Some(pending);
        Ok(outputs)
    }

    /// Runs backward against the stored pending state, consuming it.
    pub fn backward(&mut self, grad_outputs: &[Tensor<f32>]) -> Result<Vec<Option<Tensor<f32>>>> {
        let pending = self.pending.as_ref().ok_or_else(|| {
            Error::config(format!("{}: backward called without a matching forward", F::NAME))
        })?;
        self.op.check_backward(pending, grad_outputs)?;
        match self.pending.take() {
            Some(pending) => self.op.backward_dyn(pending, grad_outputs),
            None => Err(Error::config(format!("{}: pending state vanished", F::NAME))),
        }
    }
}

/// Fails unless `inputs.len()` is one of `allowed`.
pub fn expect_count(op: &'static str, inputs: &[AnyTensor], allowed: &[usize]) -> Result<()> {
    if allowed.contains(&inputs.len()) {
        return Ok(());
    }
    Err(Error::config(format!(
        "{op} takes {allowed:?} inputs, got {}",
        inputs.len()
    )))
}

/// The `f32` tensor behind `t`, or a type error.
pub fn expect_f32<'a>(op: &'static str, what: &str, t: &'a AnyTensor) -> Result<&'a Tensor<f32>> {
    t.as_f32().ok_or_else(|| type_error(op, what, DType::F32, t))
}

/// The `i32` tensor behind `t`, or a type error.
pub fn expect_i32<'a>(op: &'static str, what: &str, t: &'a AnyTensor) -> Result<&'a Tensor<i32>> {
    t.as_i32().ok_or_else(|| type_error(op, what, DType::I32, t))
}

/// Fails with a type error unless `t` has exactly `ndim` dimensions.
pub fn expect_ndim(op: &'static str, what: &str, t: &AnyTensor, ndim: usize) -> Result<()> {
    if t.ndim() == ndim {
        return Ok(());
    }
    Err(Error::Type {
        op,
        expected: format!("{ndim}-D {what}"),
        actual: format!("{}-D {}", t.ndim(), t.dtype()),
    })
}

fn type_error(op: &'static str, what: &str, expected: DType, t: &AnyTensor) -> Error {
    Error::Type {
        op,
        expected: format!("{expected} {what}"),
        actual: t.dtype().to_string(),
    }
}

/// Fails with a shape error unless `actual == expected`.
pub fn expect_shape(what: &str, actual: &[usize], expected: &[usize]) -> Result<()> {
    if actual == expected {
        return Ok(());
    }
    Err(Error::shape(format!(
        "{what} has shape {actual:?}, expected {expected:?}"
    )))
}

/// Fails unless exactly one output gradient was supplied, returning it.
pub fn single_grad<'a>(op: &'static str, grad_outputs: &'a [Tensor<f32>]) -> Result<&'a Tensor<f32>> {
    match grad_outputs {
        [gy] => Ok(gy),
        _ => Err(Error::config(format!(
            "{op} has one output but received {} gradients",
            grad_outputs.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_and_type_checks() {
        let f: AnyTensor = Tensor::new(vec![2], vec![1.0f32, 2.0]).into();
        let i: AnyTensor = Tensor::new(vec![2], vec![1i32, 2]).into();
        assert!(expect_count("op", &[f.clone()], &[1]).is_ok());
        assert!(matches!(expect_count("op", &[], &[1, 3]), Err(Error::Configuration(_))));
        assert!(expect_f32("op", "x", &f).is_ok());
        assert!(matches!(expect_f32("op", "x", &i), Err(Error::Type { .. })));
        assert!(matches!(expect_ndim("op", "x", &i, 2), Err(Error::Type { .. })));
        assert!(expect_shape("gy", &[2, 3], &[2, 3]).is_ok());
        assert!(matches!(expect_shape("gy", &[3, 2], &[2, 3]), Err(Error::Shape(_))));
    }
}
