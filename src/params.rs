//! Named parameter access.
//!
//! Checkpointing code reads and restores operation state by name through
//! [`NamedParams`]. Only the naming and shape contract lives here; how the
//! tensors are written to disk is up to the caller.
//!
//! ```rust
//! use briny_kernels::backend::BackendConfig;
//! use briny_kernels::functions::EmbedId;
//! use briny_kernels::params::{NamedParams, collect};
//! use briny_kernels::tensors::Tensor;
//!
//! let mut e = EmbedId::from_weights(Tensor::zeros(vec![4, 2]), BackendConfig::default()).unwrap();
//! e.set_param("W", Tensor::full(vec![4, 2], 0.5)).unwrap();
//! let state = collect(&e);
//! assert_eq!(state[0].0, "W");
//! assert_eq!(state[0].1.data[0], 0.5);
//! ```

use crate::backend::BackendConfig;
use crate::error::{Error, Result};
use crate::function::Mode;
use crate::functions::batch_normalization::{BatchNormGrads, BatchNormPending, BatchNormalization};
use crate::functions::embed_id::EmbedId;
use crate::tensors::{Tensor, WithGrad};

/// State reachable by name.
pub trait NamedParams {
    /// Every name [`param`](Self::param) may answer, in a stable order.
    fn param_names(&self) -> &'static [&'static str];

    /// The tensor stored under `name`, `None` when unknown or not yet allocated.
    fn param(&self, name: &str) -> Option<&Tensor<f32>>;

    /// Replaces the tensor stored under `name`.
    ///
    /// The shape must match the current tensor (or the shape the slot will
    /// have once allocated).
    fn set_param(&mut self, name: &str, value: Tensor<f32>) -> Result<()>;
}

/// Every allocated tensor of `p` paired with its name.
pub fn collect<P: NamedParams + ?Sized>(p: &P) -> Vec<(&'static str, Tensor<f32>)> {
    p.param_names()
        .iter()
        .filter_map(|&name| p.param(name).map(|t| (name, t.clone())))
        .collect()
}

/// Restores every `(name, tensor)` pair into `p`, stopping at the first error.
pub fn restore<P, I, S>(p: &mut P, state: I) -> Result<()>
where
    P: NamedParams + ?Sized,
    I: IntoIterator<Item = (S, Tensor<f32>)>,
    S: AsRef<str>,
{
    for (name, t) in state {
        p.set_param(name.as_ref(), t)?;
    }
    Ok(())
}

fn unknown(owner: &str, name: &str) -> Error {
    Error::config(format!("{owner} has no parameter named {name:?}"))
}

fn replace(slot: &mut Tensor<f32>, name: &str, value: Tensor<f32>) -> Result<()> {
    if slot.shape != value.shape {
        return Err(Error::shape(format!(
            "{name} has shape {:?}, got {:?}",
            slot.shape, value.shape
        )));
    }
    slot.update(value);
    Ok(())
}

/// Stores into an optional slot whose shape must equal `expected`.
fn replace_opt(slot: &mut Option<Tensor<f32>>, name: &str, expected: &[usize], value: Tensor<f32>) -> Result<()> {
    if value.shape != expected {
        return Err(Error::shape(format!(
            "{name} must have shape {expected:?}, got {:?}",
            value.shape
        )));
    }
    *slot = Some(value);
    Ok(())
}

impl NamedParams for EmbedId {
    fn param_names(&self) -> &'static [&'static str] {
        &["W", "gW"]
    }

    fn param(&self, name: &str) -> Option<&Tensor<f32>> {
        match name {
            "W" => Some(self.w()),
            "gW" => Some(self.gw()),
            _ => None,
        }
    }

    fn set_param(&mut self, name: &str, value: Tensor<f32>) -> Result<()> {
        let params = self.params_mut();
        match name {
            "W" => replace(&mut params.value, name, value),
            "gW" => replace(&mut params.grad, name, value),
            _ => Err(unknown("EmbedID", name)),
        }
    }
}

impl NamedParams for BatchNormalization {
    fn param_names(&self) -> &'static [&'static str] {
        &["running_mean", "running_var"]
    }

    fn param(&self, name: &str) -> Option<&Tensor<f32>> {
        match name {
            "running_mean" => self.running_mean(),
            "running_var" => self.running_var(),
            _ => None,
        }
    }

    /// Running statistics may be restored one at a time; the second must
    /// match the shape of the first.
    fn set_param(&mut self, name: &str, value: Tensor<f32>) -> Result<()> {
        let (mean, var) = self.running_mut();
        let (slot, other) = match name {
            "running_mean" => (mean, var),
            "running_var" => (var, mean),
            _ => return Err(unknown("BatchNormalization", name)),
        };
        let expected = match (&*slot, &*other) {
            (Some(t), _) | (None, Some(t)) => t.shape.clone(),
            (None, None) => value.shape.clone(),
        };
        replace_opt(slot, name, &expected, value)
    }
}

/// Batch normalization together with its learnable scale and shift.
#[derive(Debug, Clone)]
pub struct BatchNormParams {
    pub gamma: WithGrad<Tensor<f32>>,
    pub beta: WithGrad<Tensor<f32>>,
    pub op: BatchNormalization,
}

impl BatchNormParams {
    /// `gamma = 1`, `beta = 0` of the given parameter shape.
    pub fn new(shape: impl Into<Vec<usize>>, eps: f32, decay: f32, config: BackendConfig) -> Result<Self> {
        let shape = shape.into();
        Ok(Self {
            gamma: WithGrad::new(Tensor::full(shape.clone(), 1.0)),
            beta: WithGrad::new(Tensor::zeros(shape)),
            op: BatchNormalization::new(eps, decay, config)?,
        })
    }

    pub fn forward(&mut self, mode: Mode, x: &Tensor<f32>) -> Result<(Tensor<f32>, BatchNormPending)> {
        self.op.forward(mode, x, &self.gamma.value, &self.beta.value, None)
    }

    /// Accumulates `ggamma`/`gbeta` and returns the remaining gradients.
    pub fn backward(&mut self, pending: BatchNormPending, gy: &Tensor<f32>) -> Result<BatchNormGrads> {
        let grads = self.op.backward(pending, gy)?;
        for (acc, g) in [
            (&mut self.gamma.grad, &grads.ggamma),
            (&mut self.beta.grad, &grads.gbeta),
        ] {
            acc.data.iter_mut().zip(&g.data).for_each(|(a, g)| *a += g);
        }
        Ok(grads)
    }

    pub fn zero_grad(&mut self) {
        self.gamma.zero_grad();
        self.beta.zero_grad();
    }
}

impl NamedParams for BatchNormParams {
    fn param_names(&self) -> &'static [&'static str] {
        &["gamma", "beta", "running_mean", "running_var"]
    }

    fn param(&self, name: &str) -> Option<&Tensor<f32>> {
        match name {
            "gamma" => Some(&self.gamma.value),
            "beta" => Some(&self.beta.value),
            _ => self.op.param(name),
        }
    }

    fn set_param(&mut self, name: &str, value: Tensor<f32>) -> Result<()> {
        match name {
            "gamma" => replace(&mut self.gamma.value, name, value),
            "beta" => replace(&mut self.beta.value, name, value),
            "running_mean" | "running_var" => {
                let shape = self.gamma.value.shape.clone();
                let (mean, var) = self.op.running_mut();
                let slot = if name == "running_mean" { mean } else { var };
                replace_opt(slot, name, &shape, value)
            }
            _ => Err(unknown("BatchNormalization", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::batch_normalization::{DEFAULT_DECAY, DEFAULT_EPS};

    #[test]
    fn embed_names_and_shape_checks() {
        let mut e = EmbedId::from_weights(Tensor::zeros(vec![3, 2]), BackendConfig::default()).unwrap();
        assert_eq!(e.param_names(), &["W", "gW"]);
        assert!(matches!(e.set_param("W", Tensor::zeros(vec![2, 3])), Err(Error::Shape(_))));
        assert!(matches!(e.set_param("bias", Tensor::zeros(vec![3])), Err(Error::Configuration(_))));
        e.set_param("gW", Tensor::full(vec![3, 2], 1.0)).unwrap();
        assert_eq!(e.gw().data, vec![1.0; 6]);
    }

    #[test]
    fn running_stats_round_trip_through_names() {
        let mut src = BatchNormParams::new(vec![2], DEFAULT_EPS, DEFAULT_DECAY, BackendConfig::default()).unwrap();
        assert_eq!(collect(&src).len(), 2);
        let x = Tensor::new(vec![2, 2], vec![1.0f32, 2.0, 3.0, 6.0]);
        src.forward(Mode::Train, &x).unwrap();
        let state = collect(&src);
        assert_eq!(state.len(), 4);

        let mut dst = BatchNormParams::new(vec![2], DEFAULT_EPS, DEFAULT_DECAY, BackendConfig::default()).unwrap();
        restore(&mut dst, state).unwrap();
        assert_eq!(dst.op.running_mean(), src.op.running_mean());
        assert_eq!(dst.op.running_var(), src.op.running_var());
        assert!(matches!(
            dst.set_param("running_var", Tensor::zeros(vec![3])),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn backward_accumulates_scale_and_shift() {
        let mut bn = BatchNormParams::new(vec![1], DEFAULT_EPS, DEFAULT_DECAY, BackendConfig::reference_only()).unwrap();
        let x = Tensor::new(vec![2, 1], vec![1.0f32, 3.0]);
        for _ in 0..2 {
            let (_, pending) = bn.forward(Mode::Train, &x).unwrap();
            bn.backward(pending, &Tensor::full(vec![2, 1], 1.0)).unwrap();
        }
        assert_eq!(bn.beta.grad.data, vec![4.0]);
        bn.zero_grad();
        assert_eq!(bn.beta.grad.data, vec![0.0]);
    }
}
