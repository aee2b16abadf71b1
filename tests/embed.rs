mod common;

use briny_kernels::Error;
use briny_kernels::backend::{Backend, BackendConfig};
use briny_kernels::function::{Mode, Node};
use briny_kernels::functions::EmbedId;
use briny_kernels::initializers::Initializer;
use briny_kernels::tensors::Tensor;

use common::{randn, rng};

fn table(config: BackendConfig) -> EmbedId {
    let w = Tensor::new(vec![6, 2], (0..12).map(|v| v as f32).collect());
    EmbedId::from_weights(w, config).unwrap()
}

#[test]
fn test_repeated_indices_accumulate_exactly() {
    for config in [BackendConfig::reference_only(), BackendConfig::default()] {
        let mut e = table(config);
        let x = Tensor::new(vec![3], vec![2, 2, 5]);
        let (y, pending) = e.forward(&x).unwrap();
        assert_eq!(y.data, vec![4.0, 5.0, 4.0, 5.0, 10.0, 11.0]);

        let gy = Tensor::new(vec![3, 2], vec![1.0f32, 1.0, 2.0, 2.0, 3.0, 3.0]);
        e.backward(pending, &gy).unwrap();
        let gw = &e.gw().data;
        assert_eq!(&gw[4..6], &[3.0, 3.0]);
        assert_eq!(&gw[10..12], &[3.0, 3.0]);
        for row in [0, 1, 3, 4] {
            assert_eq!(&gw[row * 2..row * 2 + 2], &[0.0, 0.0]);
        }
    }
}

#[test]
fn test_accumulator_persists_until_zeroed() {
    let mut e = table(BackendConfig::default());
    let x = Tensor::new(vec![2], vec![1, 1]);
    for _ in 0..2 {
        let (_, pending) = e.forward(&x).unwrap();
        e.backward(pending, &Tensor::full(vec![2, 2], 0.5f32)).unwrap();
    }
    assert_eq!(&e.gw().data[2..4], &[2.0, 2.0]);
    e.zero_grad();
    assert!(e.gw().data.iter().all(|&g| g == 0.0));
}

#[test]
fn test_backends_agree_bitwise_under_heavy_repetition() {
    let vocab = 17;
    let dim = 9;
    let x: Vec<i32> = (0..500).map(|i| ((i * i + 3 * i) % vocab) as i32).collect();
    let gy = randn(&[x.len(), dim], 0.0, 1.0, 3);
    let w = randn(&[vocab as usize, dim], 0.0, 1.0, 4);

    let run = |config: BackendConfig| {
        let mut e = EmbedId::from_weights(w.clone(), config).unwrap();
        let (_, pending) = e.forward(&Tensor::new(vec![x.len()], x.clone())).unwrap();
        let backend = pending.backend();
        e.backward(pending, &gy).unwrap();
        (e.gw().clone(), backend)
    };
    let (reference, b_ref) = run(BackendConfig::reference_only());
    let (fast, b_fast) = run(BackendConfig::default());
    assert_eq!(b_ref, Backend::Reference);
    assert_eq!(b_fast, Backend::CpuVector);
    assert_eq!(reference, fast);
}

#[test]
fn test_new_uses_initializer() {
    let mut r = rng(9);
    let e = EmbedId::new(4, 3, Some(&Initializer::Constant(0.25)), &mut r, BackendConfig::default()).unwrap();
    assert_eq!(e.w().shape, vec![4, 3]);
    assert!(e.w().data.iter().all(|&v| v == 0.25));
    assert!(e.gw().data.iter().all(|&v| v == 0.0));

    let e = EmbedId::new(50, 20, None, &mut r, BackendConfig::default()).unwrap();
    let n = e.w().len() as f32;
    let mean = e.w().data.iter().sum::<f32>() / n;
    let var = e.w().data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    assert!(mean.abs() < 0.15);
    assert!((var - 1.0).abs() < 0.2);
}

#[test]
fn test_invalid_inputs() {
    let mut e = table(BackendConfig::default());
    assert!(matches!(e.forward(&Tensor::new(vec![1, 2], vec![0, 1])), Err(Error::Shape(_))));
    assert!(matches!(e.forward(&Tensor::new(vec![1], vec![6])), Err(Error::Shape(_))));

    let (_, pending) = e.forward(&Tensor::new(vec![2], vec![0, 1])).unwrap();
    let err = e.backward(pending, &Tensor::zeros(vec![3, 2])).unwrap_err();
    assert!(matches!(err, Error::Shape(_)));
}

#[test]
fn test_dynamic_contract() {
    let mut node = Node::new(table(BackendConfig::default()));
    let err = node
        .forward(Mode::Train, &[Tensor::new(vec![2], vec![0.0f32, 1.0]).into()])
        .unwrap_err();
    assert!(matches!(err, Error::Type { .. }));

    let y = node
        .forward(Mode::Evaluate, &[Tensor::new(vec![2], vec![3i32, 0]).into()])
        .unwrap();
    assert_eq!(y[0].data, vec![6.0, 7.0, 0.0, 1.0]);

    // a malformed gradient keeps the pending state
    assert!(node.backward(&[Tensor::zeros(vec![1, 2])]).is_err());
    assert!(node.has_pending());
    node.backward(&[Tensor::full(vec![2, 2], 1.0f32)]).unwrap();
    assert!(!node.has_pending());
    assert_eq!(&node.op().gw().data[6..8], &[1.0, 1.0]);
}
