#![allow(dead_code)]

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use briny_kernels::tensors::Tensor;

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Normal draws with the given mean and standard deviation.
pub fn randn(shape: &[usize], mean: f32, std: f32, seed: u64) -> Tensor<f32> {
    let mut rng = rng(seed);
    let dist = Normal::new(mean, std).unwrap();
    let len = shape.iter().product();
    Tensor::new(shape.to_vec(), (0..len).map(|_| dist.sample(&mut rng)).collect())
}

/// Uniform draws in `[lo, hi)`.
pub fn uniform(shape: &[usize], lo: f32, hi: f32, seed: u64) -> Tensor<f32> {
    use rand::Rng;
    let mut rng = rng(seed);
    let len = shape.iter().product();
    Tensor::new(shape.to_vec(), (0..len).map(|_| rng.random_range(lo..hi)).collect())
}
