use briny_kernels::tensors::{AnyTensor, DType, Device, Tensor, WithGrad};
use briny_kernels::{Error, tensor};

#[test]
fn test_tensor_creation() {
    let t = Tensor::new(vec![2, 2], vec![1.0f32, 2.0, 3.0, 4.0]);
    assert_eq!(t.shape, vec![2, 2]);
    assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.device, Device::Host);
    assert_eq!(t.dtype(), DType::F32);
}

#[test]
fn test_tensor_macro() {
    let t = tensor!([[1.0f32, 2.0], [3.0, 4.0]]);
    assert_eq!(t.shape, vec![2, 2]);
    assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);

    let cube = tensor!([[[1, 2]], [[3, 4]]]);
    assert_eq!(cube.shape, vec![2, 1, 2]);
}

#[test]
fn test_tensor_shape_mismatch_panics() {
    let result = std::panic::catch_unwind(|| {
        Tensor::new(vec![2, 2], vec![1.0f32, 2.0, 3.0]);
    });
    assert!(result.is_err());
}

#[test]
fn test_try_new_reports_shape_error() {
    let err = Tensor::try_new(vec![3], vec![1i32, 2]).unwrap_err();
    assert!(matches!(err, Error::Shape(_)));
}

#[test]
fn test_update_and_zero_grad() {
    let mut w = WithGrad::new(Tensor::new(vec![2], vec![1.0f32, 2.0]));
    w.value.update(Tensor::new(vec![2], vec![0.5, 1.5]));
    w.grad.data[0] = 3.0;
    w.zero_grad();
    assert_eq!(w.value.data, vec![0.5, 1.5]);
    assert_eq!(w.grad.data, vec![0.0, 0.0]);
}

#[test]
fn test_any_tensor_round_trip() {
    let ix: AnyTensor = Tensor::new(vec![2], vec![4i32, 7]).into();
    assert_eq!(ix.dtype(), DType::I32);
    assert_eq!(ix.ndim(), 1);
    assert_eq!(ix.as_i32().map(|t| t.data.clone()), Some(vec![4, 7]));
    assert!(ix.as_f32().is_none());
}
