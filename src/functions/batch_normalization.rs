//! Batch normalization.
//!
//! Normalizes `x` of shape `[N, C1.., S1..]` per channel of a `[C1..]`
//! parameter: `y = gamma * (x - mean) / sqrt(var + eps) + beta`.
//!
//! In [`Mode::Train`] without fixed statistics, `mean` and `var` are the
//! batch mean and biased batch variance, and the running statistics are
//! moved toward them:
//!
//! ```text
//! running_mean = decay * running_mean + (1 - decay) * mean
//! running_var  = decay * running_var  + (1 - decay) * var * m / max(m - 1, 1)
//! ```
//!
//! where `m` is the number of elements reduced per channel. Normalization
//! itself always uses the biased variance.
//!
//! With fixed statistics (passed explicitly, or the running statistics in
//! [`Mode::Evaluate`]) the forward is elementwise and the backward has a
//! closed form that also yields gradients for `mean` and `var`.

use tracing::debug;

use crate::backend::{Backend, BackendConfig, BackendSelector};
use crate::error::{Error, Result};
use crate::function::{self, Function, Mode};
use crate::ops::{BatchNormCache, NormDescriptor, dispatch, reference};
use crate::tensors::{AnyTensor, Device, Tensor};

/// Default epsilon.
pub const DEFAULT_EPS: f32 = 2e-5;
/// Default running-statistics decay.
pub const DEFAULT_DECAY: f32 = 0.9;

/// Batch normalization with running statistics.
#[derive(Debug, Clone)]
pub struct BatchNormalization {
    eps: f32,
    decay: f32,
    running_mean: Option<Tensor<f32>>,
    running_var: Option<Tensor<f32>>,
    selector: BackendSelector,
}

#[derive(Debug, Clone, PartialEq)]
enum Form {
    /// Batch statistics; backward couples every element of a channel.
    Batch { gamma: Vec<f32>, cache: BatchNormCache },
    /// Caller statistics; backward is a per-channel scaling.
    Fixed {
        x: Vec<f32>,
        gamma: Vec<f32>,
        mean: Vec<f32>,
        var: Vec<f32>,
    },
}

/// State a forward hands to its backward.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormPending {
    form: Form,
    x_shape: Vec<usize>,
    param_shape: Vec<usize>,
    d: NormDescriptor,
    backend: Backend,
    device: Device,
    eps: f32,
}

impl BatchNormPending {
    /// Backend that ran the forward.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Shape of the forward input.
    pub fn x_shape(&self) -> &[usize] {
        &self.x_shape
    }

    /// Batch statistics and normalized input of a batch-statistics forward.
    pub fn cache(&self) -> Option<&BatchNormCache> {
        match &self.form {
            Form::Batch { cache, .. } => Some(cache),
            Form::Fixed { .. } => None,
        }
    }

    /// Whether the forward used fixed statistics.
    pub fn is_fixed(&self) -> bool {
        matches!(self.form, Form::Fixed { .. })
    }
}

/// Gradients of a batch-normalization backward.
///
/// `gmean` and `gvar` are only present for the fixed-statistics form.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormGrads {
    pub gx: Tensor<f32>,
    pub ggamma: Tensor<f32>,
    pub gbeta: Tensor<f32>,
    pub gmean: Option<Tensor<f32>>,
    pub gvar: Option<Tensor<f32>>,
}

/// Checks `x`, `gamma` and `beta` against each other.
fn validate(x: &Tensor<f32>, gamma: &Tensor<f32>, beta: &Tensor<f32>) -> Result<()> {
    if x.ndim() < gamma.ndim() + 1 {
        return Err(Error::shape(format!(
            "input {:?} needs a batch axis in front of the parameter shape {:?}",
            x.shape, gamma.shape
        )));
    }
    if x.shape.contains(&0) {
        return Err(Error::shape(format!("input {:?} has an empty axis", x.shape)));
    }
    function::expect_shape("input channels", &x.shape[1..=gamma.ndim()], &gamma.shape)?;
    function::expect_shape("beta", &beta.shape, &gamma.shape)
}

fn fixed_forward(
    selector: &BackendSelector,
    x: &Tensor<f32>,
    gamma: &Tensor<f32>,
    beta: &Tensor<f32>,
    mean: &Tensor<f32>,
    var: &Tensor<f32>,
    eps: f32,
) -> Result<(Tensor<f32>, BatchNormPending)> {
    function::expect_shape("mean", &mean.shape, &gamma.shape)?;
    function::expect_shape("var", &var.shape, &gamma.shape)?;
    let d = NormDescriptor::derive(&x.shape, gamma.ndim());
    let (y, backend) = dispatch::batch_norm_forward_inference(
        selector,
        x.device,
        x.ndim(),
        d,
        &x.data,
        &gamma.data,
        &beta.data,
        &mean.data,
        &var.data,
        eps,
    )?;
    let pending = BatchNormPending {
        form: Form::Fixed {
            x: x.data.clone(),
            gamma: gamma.data.clone(),
            mean: mean.data.clone(),
            var: var.data.clone(),
        },
        x_shape: x.shape.clone(),
        param_shape: gamma.shape.clone(),
        d,
        backend,
        device: x.device,
        eps,
    };
    Ok((Tensor::new(x.shape.clone(), y).to_device(x.device), pending))
}

/// Moves `running` toward `batch` in place.
fn blend(running: &mut [f32], batch: &[f32], decay: f32, factor: f32) {
    for (r, &b) in running.iter_mut().zip(batch) {
        *r = decay * *r + (1.0 - decay) * factor * b;
    }
}

/// Batch normalization with caller-supplied statistics.
///
/// Equivalent to a [`BatchNormalization`] forward with `fixed` set, for
/// callers that keep no running state.
pub fn fixed_batch_normalization(
    x: &Tensor<f32>,
    gamma: &Tensor<f32>,
    beta: &Tensor<f32>,
    mean: &Tensor<f32>,
    var: &Tensor<f32>,
    eps: f32,
    config: BackendConfig,
) -> Result<(Tensor<f32>, BatchNormPending)> {
    config.check_eps(eps)?;
    validate(x, gamma, beta)?;
    fixed_forward(&BackendSelector::new(config), x, gamma, beta, mean, var, eps)
}

impl BatchNormalization {
    /// Creates an uninitialized instance.
    ///
    /// Fails when an accelerated backend is mandated and `eps` is below
    /// [`ACCELERATED_MIN_EPS`](crate::backend::ACCELERATED_MIN_EPS).
    pub fn new(eps: f32, decay: f32, config: BackendConfig) -> Result<Self> {
        config.check_eps(eps)?;
        if !(0.0..=1.0).contains(&decay) {
            return Err(Error::config(format!("decay {decay} is outside [0, 1]")));
        }
        Ok(Self {
            eps,
            decay,
            running_mean: None,
            running_var: None,
            selector: BackendSelector::new(config),
        })
    }

    /// Seeds the running statistics.
    pub fn with_running_stats(mut self, mean: Tensor<f32>, var: Tensor<f32>) -> Result<Self> {
        function::expect_shape("running_var", &var.shape, &mean.shape)?;
        self.running_mean = Some(mean);
        self.running_var = Some(var);
        Ok(self)
    }

    /// Stability term added to the variance.
    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// Weight kept by the running statistics on each update.
    pub fn decay(&self) -> f32 {
        self.decay
    }

    /// Running mean, `None` until the first train forward or a seed.
    pub fn running_mean(&self) -> Option<&Tensor<f32>> {
        self.running_mean.as_ref()
    }

    /// Running unbiased variance.
    pub fn running_var(&self) -> Option<&Tensor<f32>> {
        self.running_var.as_ref()
    }

    pub(crate) fn running_mut(&mut self) -> (&mut Option<Tensor<f32>>, &mut Option<Tensor<f32>>) {
        (&mut self.running_mean, &mut self.running_var)
    }

    /// Normalizes `x`.
    ///
    /// - `Train` without `fixed`: batch statistics, then a running update.
    /// - `fixed` given: those statistics, running state untouched.
    /// - `Evaluate` without `fixed`: the running statistics, which must exist.
    pub fn forward(
        &mut self,
        mode: Mode,
        x: &Tensor<f32>,
        gamma: &Tensor<f32>,
        beta: &Tensor<f32>,
        fixed: Option<(&Tensor<f32>, &Tensor<f32>)>,
    ) -> Result<(Tensor<f32>, BatchNormPending)> {
        validate(x, gamma, beta)?;
        match (mode, fixed) {
            (_, Some((mean, var))) => fixed_forward(&self.selector, x, gamma, beta, mean, var, self.eps),
            (Mode::Evaluate, None) => {
                let (Some(mean), Some(var)) = (&self.running_mean, &self.running_var) else {
                    return Err(Error::config(
                        "evaluation without fixed statistics needs running statistics",
                    ));
                };
                fixed_forward(&self.selector, x, gamma, beta, mean, var, self.eps)
            }
            (Mode::Train, None) => self.forward_batch(x, gamma, beta),
        }
    }

    fn forward_batch(
        &mut self,
        x: &Tensor<f32>,
        gamma: &Tensor<f32>,
        beta: &Tensor<f32>,
    ) -> Result<(Tensor<f32>, BatchNormPending)> {
        for (name, stat) in [("running_mean", &self.running_mean), ("running_var", &self.running_var)] {
            if let Some(stat) = stat {
                function::expect_shape(name, &stat.shape, &gamma.shape)?;
            }
        }

        let d = NormDescriptor::derive(&x.shape, gamma.ndim());
        let (out, backend) = dispatch::batch_norm_forward_training(
            &self.selector,
            x.device,
            x.ndim(),
            d,
            &x.data,
            &gamma.data,
            &beta.data,
            self.eps,
        )?;

        let m = d.reduce_len();
        let factor = m as f32 / (m.max(2) - 1) as f32;
        let running_mean = self
            .running_mean
            .get_or_insert_with(|| Tensor::zeros(gamma.shape.clone()));
        blend(&mut running_mean.data, &out.cache.mean, self.decay, 1.0);
        let running_var = self
            .running_var
            .get_or_insert_with(|| Tensor::zeros(gamma.shape.clone()));
        blend(&mut running_var.data, &out.cache.var, self.decay, factor);
        debug!(?d, %backend, "batch_norm running statistics updated");

        let y = Tensor::new(x.shape.clone(), out.y).to_device(x.device);
        let pending = BatchNormPending {
            form: Form::Batch {
                gamma: gamma.data.clone(),
                cache: out.cache,
            },
            x_shape: x.shape.clone(),
            param_shape: gamma.shape.clone(),
            d,
            backend,
            device: x.device,
            eps: self.eps,
        };
        Ok((y, pending))
    }

    /// Gradients of the forward that produced `pending`.
    pub fn backward(&self, pending: BatchNormPending, gy: &Tensor<f32>) -> Result<BatchNormGrads> {
        function::expect_shape("gy", &gy.shape, &pending.x_shape)?;
        let BatchNormPending {
            form,
            x_shape,
            param_shape,
            d,
            backend,
            device,
            eps,
        } = pending;
        let param = |data: Vec<f32>| Tensor::new(param_shape.clone(), data);

        match form {
            Form::Batch { gamma, cache } => {
                let g = dispatch::batch_norm_backward(&self.selector, backend, d, &gy.data, &gamma, &cache)?;
                Ok(BatchNormGrads {
                    gx: Tensor::new(x_shape, g.gx).to_device(device),
                    ggamma: param(g.ggamma),
                    gbeta: param(g.gbeta),
                    gmean: None,
                    gvar: None,
                })
            }
            Form::Fixed { x, gamma, mean, var } => {
                let g = reference::batch_norm_backward_fixed(&x, &gamma, &mean, &var, &gy.data, d, eps);
                Ok(BatchNormGrads {
                    gx: Tensor::new(x_shape, g.gx).to_device(device),
                    ggamma: param(g.ggamma),
                    gbeta: param(g.gbeta),
                    gmean: Some(param(g.gmean)),
                    gvar: Some(param(g.gvar)),
                })
            }
        }
    }
}

impl Function for BatchNormalization {
    type Pending = BatchNormPending;

    const NAME: &'static str = "BatchNormalization";

    /// Inputs are `x, gamma, beta` or `x, gamma, beta, mean, var`.
    fn check_type_forward(&self, inputs: &[AnyTensor]) -> Result<()> {
        function::expect_count(Self::NAME, inputs, &[3, 5])?;
        for (t, what) in inputs.iter().zip(["x", "gamma", "beta", "mean", "var"]) {
            function::expect_f32(Self::NAME, what, t)?;
        }
        Ok(())
    }

    fn forward_dyn(&mut self, mode: Mode, inputs: &[AnyTensor]) -> Result<(Vec<Tensor<f32>>, BatchNormPending)> {
        let t = inputs
            .iter()
            .zip(["x", "gamma", "beta", "mean", "var"])
            .map(|(t, what)| function::expect_f32(Self::NAME, what, t))
            .collect::<Result<Vec<_>>>()?;
        let fixed = match t[..] {
            [_, _, _, mean, var] => Some((mean, var)),
            _ => None,
        };
        let (y, pending) = self.forward(mode, t[0], t[1], t[2], fixed)?;
        Ok((vec![y], pending))
    }

    fn check_backward(&self, pending: &BatchNormPending, grad_outputs: &[Tensor<f32>]) -> Result<()> {
        let gy = function::single_grad(Self::NAME, grad_outputs)?;
        function::expect_shape("gy", &gy.shape, &pending.x_shape)
    }

    fn backward_dyn(
        &mut self,
        pending: BatchNormPending,
        grad_outputs: &[Tensor<f32>],
    ) -> Result<Vec<Option<Tensor<f32>>>> {
        let gy = function::single_grad(Self::NAME, grad_outputs)?;
        let g = self.backward(pending, gy)?;
        let mut out = vec![Some(g.gx), Some(g.ggamma), Some(g.gbeta)];
        if let (Some(gmean), Some(gvar)) = (g.gmean, g.gvar) {
            out.push(Some(gmean));
            out.push(Some(gvar));
        }
        Ok(out)
    }
}
