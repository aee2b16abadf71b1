//! 2-D convolution.
//!
//! `x [N, C, H, W]` convolved with `w [O, C, KH, KW]` plus an optional bias
//! `b [O]` gives `y [N, O, OH, OW]`, where each output extent follows
//! [`get_conv_outsize`]. The filter and bias are inputs, so the operation
//! holds no parameters.

use tracing::trace;

use crate::backend::{Backend, BackendConfig, BackendSelector};
use crate::error::{Error, Result};
use crate::function::{self, Function, Mode};
use crate::ops::dispatch;
use crate::tensors::{AnyTensor, Device, Tensor};

pub use crate::ops::{ConvGeometry, get_conv_outsize};

/// Stride, padding and output-size policy of a convolution.
#[derive(Debug, Clone)]
pub struct Convolution2D {
    stride: (usize, usize),
    pad: (usize, usize),
    cover_all: bool,
    selector: BackendSelector,
}

/// State a forward hands to its backward.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvPending {
    x: Vec<f32>,
    w: Vec<f32>,
    x_shape: Vec<usize>,
    w_shape: Vec<usize>,
    has_bias: bool,
    geometry: ConvGeometry,
    backend: Backend,
    device: Device,
}

impl ConvPending {
    /// Backend that ran the forward.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Shapes and output extents of the forward.
    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }
}

/// Gradients of a convolution backward. `gb` is present when the forward
/// had a bias.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvGrads {
    pub gx: Tensor<f32>,
    pub gw: Tensor<f32>,
    pub gb: Option<Tensor<f32>>,
}

impl Convolution2D {
    pub fn new(stride: (usize, usize), pad: (usize, usize), cover_all: bool, config: BackendConfig) -> Result<Self> {
        if stride.0 == 0 || stride.1 == 0 {
            return Err(Error::config(format!("stride {stride:?} must be positive")));
        }
        Ok(Self {
            stride,
            pad,
            cover_all,
            selector: BackendSelector::new(config),
        })
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    pub fn pad(&self) -> (usize, usize) {
        self.pad
    }

    pub fn cover_all(&self) -> bool {
        self.cover_all
    }

    pub fn forward(
        &self,
        x: &Tensor<f32>,
        w: &Tensor<f32>,
        b: Option<&Tensor<f32>>,
    ) -> Result<(Tensor<f32>, ConvPending)> {
        let g = ConvGeometry::new(&x.shape, &w.shape, self.stride, self.pad, self.cover_all)?;
        if let Some(b) = b {
            function::expect_shape("bias", &b.shape, &[g.out_c])?;
        }
        let (y, backend) = dispatch::conv2d_forward(
            &self.selector,
            x.device,
            &x.data,
            &w.data,
            b.map(|b| b.data.as_slice()),
            &g,
        )?;
        trace!(?g, %backend, "convolution_2d forward");
        let pending = ConvPending {
            x: x.data.clone(),
            w: w.data.clone(),
            x_shape: x.shape.clone(),
            w_shape: w.shape.clone(),
            has_bias: b.is_some(),
            geometry: g,
            backend,
            device: x.device,
        };
        Ok((Tensor::new(g.out_shape().to_vec(), y).to_device(x.device), pending))
    }

    pub fn backward(&self, pending: ConvPending, gy: &Tensor<f32>) -> Result<ConvGrads> {
        function::expect_shape("gy", &gy.shape, &pending.geometry.out_shape())?;
        let g = dispatch::conv2d_backward(pending.backend, &pending.x, &pending.w, &gy.data, &pending.geometry);
        Ok(ConvGrads {
            gx: Tensor::new(pending.x_shape, g.gx).to_device(pending.device),
            gw: Tensor::new(pending.w_shape, g.gw),
            gb: pending.has_bias.then(|| Tensor::new(vec![pending.geometry.out_c], g.gb)),
        })
    }
}

impl Function for Convolution2D {
    type Pending = ConvPending;

    const NAME: &'static str = "Convolution2D";

    /// Inputs are `x, w` or `x, w, b`.
    fn check_type_forward(&self, inputs: &[AnyTensor]) -> Result<()> {
        function::expect_count(Self::NAME, inputs, &[2, 3])?;
        for (t, (what, ndim)) in inputs.iter().zip([("x", 4), ("w", 4), ("b", 1)]) {
            function::expect_f32(Self::NAME, what, t)?;
            function::expect_ndim(Self::NAME, what, t, ndim)?;
        }
        Ok(())
    }

    fn forward_dyn(&mut self, _mode: Mode, inputs: &[AnyTensor]) -> Result<(Vec<Tensor<f32>>, ConvPending)> {
        let x = function::expect_f32(Self::NAME, "x", &inputs[0])?;
        let w = function::expect_f32(Self::NAME, "w", &inputs[1])?;
        let b = inputs
            .get(2)
            .map(|b| function::expect_f32(Self::NAME, "b", b))
            .transpose()?;
        let (y, pending) = self.forward(x, w, b)?;
        Ok((vec![y], pending))
    }

    fn check_backward(&self, pending: &ConvPending, grad_outputs: &[Tensor<f32>]) -> Result<()> {
        let gy = function::single_grad(Self::NAME, grad_outputs)?;
        function::expect_shape("gy", &gy.shape, &pending.geometry.out_shape())
    }

    fn backward_dyn(&mut self, pending: ConvPending, grad_outputs: &[Tensor<f32>]) -> Result<Vec<Option<Tensor<f32>>>> {
        let gy = function::single_grad(Self::NAME, grad_outputs)?;
        let g = self.backward(pending, gy)?;
        let mut out = vec![Some(g.gx), Some(g.gw)];
        if let Some(gb) = g.gb {
            out.push(Some(gb));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_by_one_filter_scales_channels() {
        let conv = Convolution2D::new((1, 1), (0, 0), false, BackendConfig::reference_only()).unwrap();
        let x = Tensor::new(vec![1, 2, 1, 2], vec![1.0f32, 2.0, 3.0, 4.0]);
        let w = Tensor::new(vec![1, 2, 1, 1], vec![1.0f32, 10.0]);
        let b = Tensor::new(vec![1], vec![0.5f32]);
        let (y, pending) = conv.forward(&x, &w, Some(&b)).unwrap();
        assert_eq!(y.shape, vec![1, 1, 1, 2]);
        assert_eq!(y.data, vec![31.5, 42.5]);

        let g = conv.backward(pending, &Tensor::full(vec![1, 1, 1, 2], 1.0f32)).unwrap();
        assert_eq!(g.gx.data, vec![1.0, 1.0, 10.0, 10.0]);
        assert_eq!(g.gw.data, vec![3.0, 7.0]);
        assert_eq!(g.gb.unwrap().data, vec![2.0]);
    }

    #[test]
    fn rejects_zero_stride_and_bad_bias() {
        assert!(matches!(
            Convolution2D::new((0, 1), (0, 0), false, BackendConfig::default()),
            Err(Error::Configuration(_))
        ));
        let conv = Convolution2D::new((1, 1), (0, 0), false, BackendConfig::default()).unwrap();
        let x = Tensor::zeros(vec![1, 1, 3, 3]);
        let w = Tensor::zeros(vec![2, 1, 2, 2]);
        let b = Tensor::zeros(vec![3]);
        assert!(matches!(conv.forward(&x, &w, Some(&b)), Err(Error::Shape(_))));
    }

    #[test]
    fn dynamic_path_rejects_integer_input() {
        let mut node = crate::function::Node::new(
            Convolution2D::new((1, 1), (0, 0), false, BackendConfig::default()).unwrap(),
        );
        let x: AnyTensor = Tensor::new(vec![1, 1, 1, 1], vec![1i32]).into();
        let w: AnyTensor = Tensor::new(vec![1, 1, 1, 1], vec![1.0f32]).into();
        assert!(matches!(node.forward(Mode::Train, &[x, w.clone()]), Err(Error::Type { .. })));
        assert!(matches!(node.forward(Mode::Train, &[w]), Err(Error::Configuration(_))));
    }
}
