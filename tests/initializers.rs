mod common;

use briny_kernels::Error;
use briny_kernels::initializers::{Initializer, get_fans};
use briny_kernels::tensors::DType;

use common::rng;

fn std_of(data: &[f32]) -> f32 {
    let n = data.len() as f32;
    let mean = data.iter().sum::<f32>() / n;
    (data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt()
}

#[test]
fn test_he_normal_scales_with_fan_in() {
    let t = Initializer::HeNormal { scale: 1.0 }
        .generate_f32(&[256, 128], &mut rng(1))
        .unwrap();
    let want = (2.0f32 / 128.0).sqrt();
    assert!((std_of(&t.data) / want - 1.0).abs() < 0.05);
}

#[test]
fn test_default_is_scaled_he_normal() {
    let t = Initializer::default().generate_f32(&[64, 8, 3, 3], &mut rng(2)).unwrap();
    let (fan_in, _) = get_fans(&t.shape).unwrap();
    let want = (1.0 / fan_in as f32).sqrt();
    assert!((std_of(&t.data) / want - 1.0).abs() < 0.05);
}

#[test]
fn test_glorot_normal() {
    let t = Initializer::GlorotNormal { scale: 1.0 }
        .generate_f32(&[200, 100], &mut rng(3))
        .unwrap();
    let want = (2.0f32 / 300.0).sqrt();
    assert!((std_of(&t.data) / want - 1.0).abs() < 0.05);
}

#[test]
fn test_uniform_bounds() {
    let cases = [
        (Initializer::Uniform { scale: 0.3 }, 0.3f32),
        (Initializer::LeCunUniform { scale: 1.0 }, (3.0f32 / 50.0).sqrt()),
        (Initializer::GlorotUniform { scale: 2.0 }, 2.0 * (6.0f32 / 90.0).sqrt()),
        (Initializer::HeUniform { scale: 1.0 }, (6.0f32 / 50.0).sqrt()),
    ];
    for (init, bound) in cases {
        let t = init.generate_f32(&[40, 50], &mut rng(4)).unwrap();
        assert!(t.data.iter().all(|v| v.abs() <= bound), "{init:?}");
        let max = t.data.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert!(max > 0.9 * bound, "{init:?} never approaches its bound");
    }
}

#[test]
fn test_orthogonal_tall_columns() {
    let t = Initializer::Orthogonal { scale: 2.0 }
        .generate_f32(&[6, 3], &mut rng(5))
        .unwrap();
    for i in 0..3 {
        for j in 0..3 {
            let dot: f32 = (0..6).map(|k| t.data[k * 3 + i] * t.data[k * 3 + j]).sum();
            let want = if i == j { 4.0 } else { 0.0 };
            assert!((dot - want).abs() < 1e-4);
        }
    }
}

#[test]
fn test_orthogonal_flattens_trailing_axes() {
    let t = Initializer::Orthogonal { scale: 1.0 }
        .generate_f32(&[4, 2, 2, 2], &mut rng(6))
        .unwrap();
    assert_eq!(t.shape, vec![4, 2, 2, 2]);
    for i in 0..4 {
        let norm: f32 = t.data[i * 8..(i + 1) * 8].iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}

#[test]
fn test_rank_errors() {
    for init in [
        Initializer::HeNormal { scale: 1.0 },
        Initializer::GlorotUniform { scale: 1.0 },
        Initializer::Orthogonal { scale: 1.0 },
        Initializer::Identity { scale: 1.0 },
    ] {
        assert!(matches!(init.generate_f32(&[5], &mut rng(7)), Err(Error::Shape(_))));
    }
    assert!(Initializer::Normal { scale: 1.0 }.generate_f32(&[5], &mut rng(7)).is_ok());
}

#[test]
fn test_generation_is_pure() {
    let init = Initializer::Constant(1.5);
    let a = init.generate(&[2, 2], DType::F32, &mut rng(8)).unwrap();
    let mut b = init.generate(&[2, 2], DType::F32, &mut rng(8)).unwrap();
    if let briny_kernels::tensors::AnyTensor::F32(t) = &mut b {
        t.data[0] = 0.0;
    }
    assert_eq!(a.as_f32().unwrap().data, vec![1.5; 4]);
    assert_ne!(a, b);
}
