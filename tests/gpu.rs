#![cfg(feature = "wgpu")]

mod common;

use briny_kernels::approx::{Tolerance, allclose};
use briny_kernels::backend::{Backend, BackendConfig};
use briny_kernels::function::Mode;
use briny_kernels::functions::EmbedId;
use briny_kernels::functions::batch_normalization::{BatchNormalization, DEFAULT_DECAY, DEFAULT_EPS};
use briny_kernels::ops::wgpu::is_available;
use briny_kernels::tensors::{Device, Tensor};

use common::{randn, uniform};

macro_rules! require_gpu {
    () => {
        if !is_available() {
            eprintln!("no GPU adapter, skipping");
            return;
        }
    };
}

#[test]
fn test_batch_norm_gpu_matches_reference() {
    require_gpu!();
    let shape = [4, 3, 6, 6];
    let x = randn(&shape, 1.0, 2.0, 201);
    let gamma = uniform(&[3], 0.5, 1.5, 202);
    let beta = uniform(&[3], -0.5, 0.5, 203);
    let gy = randn(&shape, 0.0, 1.0, 204);

    let mut gpu = BatchNormalization::new(DEFAULT_EPS, DEFAULT_DECAY, BackendConfig::default()).unwrap();
    let mut reference = BatchNormalization::new(DEFAULT_EPS, DEFAULT_DECAY, BackendConfig::reference_only()).unwrap();
    let xg = x.clone().to_device(Device::Gpu);
    let (ya, pa) = gpu.forward(Mode::Train, &xg, &gamma, &beta, None).unwrap();
    let (yb, pb) = reference.forward(Mode::Train, &x, &gamma, &beta, None).unwrap();
    assert_eq!(pa.backend(), Backend::Gpu);
    assert_eq!(ya.device, Device::Gpu);
    assert!(allclose(&ya.data, &yb.data, Tolerance::BACKEND));

    let ga = gpu.backward(pa, &gy).unwrap();
    let gb = reference.backward(pb, &gy).unwrap();
    assert!(allclose(&ga.gx.data, &gb.gx.data, Tolerance::BACKEND));
    assert!(allclose(&ga.ggamma.data, &gb.ggamma.data, Tolerance::BACKEND));
    assert!(allclose(&ga.gbeta.data, &gb.gbeta.data, Tolerance::BACKEND));

    let (ya, pa) = gpu.forward(Mode::Evaluate, &xg, &gamma, &beta, None).unwrap();
    let (yb, _) = reference.forward(Mode::Evaluate, &x, &gamma, &beta, None).unwrap();
    assert_eq!(pa.backend(), Backend::Gpu);
    assert!(allclose(&ya.data, &yb.data, Tolerance::BACKEND));
}

#[test]
fn test_embed_backward_gpu_is_exact() {
    require_gpu!();
    let vocab = 11usize;
    let dim = 5;
    let x: Vec<i32> = (0..300).map(|i| ((i * 7 + i / 3) % vocab) as i32).collect();
    let w = randn(&[vocab, dim], 0.0, 1.0, 211);
    let gy = randn(&[x.len(), dim], 0.0, 1.0, 212);

    let mut gpu = EmbedId::from_weights(w.clone(), BackendConfig::default()).unwrap();
    let mut reference = EmbedId::from_weights(w, BackendConfig::reference_only()).unwrap();
    let xt = Tensor::new(vec![x.len()], x);
    let (_, pa) = gpu.forward(&xt.clone().to_device(Device::Gpu)).unwrap();
    let (_, pb) = reference.forward(&xt).unwrap();
    gpu.backward(pa, &gy).unwrap();
    reference.backward(pb, &gy).unwrap();
    assert_eq!(gpu.gw(), reference.gw());
}
