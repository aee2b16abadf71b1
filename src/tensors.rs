//! Core tensor data structures.
//!
//! # Tensor Model
//!
//! A [`Tensor<T>`] is a shape plus a flat, row-major buffer of elements and a
//! [`Device`] placement tag. Operations read the placement tag to decide
//! whether the GPU backend may claim a call; data always lives in host memory
//! between calls.
//!
//! It supports:
//! - Construction of N-dimensional tensors, checked (`try_new`) or panicking (`new`)
//! - The two element types used by the operations, `f32` and `i32`, via [`Element`]
//! - A dynamically typed [`AnyTensor`] for the generic [`Function`](crate::function::Function) contract
//! - `WithGrad<T>` pairs of a parameter and its gradient accumulator
//! - The `tensor!` macro for literal construction in tests and docs
//!
//! ## Limitations
//! - Row-major only
//! - No broadcasting, slicing, or shape inference
//!
//! ## Example
//!
//! ```rust
//! use briny_kernels::tensors::{Device, Tensor};
//! let t = Tensor::new(vec![2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.shape, vec![2, 3]);
//! assert_eq!(t.device, Device::Host);
//! ```

use core::fmt;

use briny::prelude::*;

use crate::error::{Error, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE float.
    F32,
    /// 32-bit signed integer, used for indices.
    I32,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => f.write_str("float32"),
            Self::I32 => f.write_str("int32"),
        }
    }
}

/// Scalar types a [`Tensor`] may hold.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Runtime tag of the type.
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
}

/// Where a tensor is considered resident.
///
/// `Gpu` is a placement request: it makes a tensor eligible for the GPU
/// backend. The buffer itself is uploaded per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host memory.
    #[default]
    Host,
    /// GPU-resident.
    Gpu,
}

/// Represents an N-dimensional tensor with a shape and flat row-major data.
///
/// - All elements must be the same type (`T`).
/// - `shape` defines the structure, e.g., `[2, 3]` for a 2x3 matrix.
/// - `data` holds the flattened content in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
    pub device: Device,
}

/// Shape and buffer waiting for a consistency check.
struct PackedTensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T> Validate for PackedTensor<T> {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.shape.iter().product::<usize>() != self.data.len() {
            return Err(ValidationError);
        }
        Ok(())
    }
}

impl<T> Tensor<T> {
    /// Creates a new host tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self {
            shape,
            data,
            device: Device::Host,
        }
    }

    /// Creates a new host tensor, reporting a shape/data mismatch as
    /// [`Error::Shape`] instead of panicking.
    pub fn try_new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        let len = data.len();
        let trusted = TrustedData::new(PackedTensor { shape, data }).map_err(|_| {
            Error::shape(format!("{len} data elements cannot fill the requested shape"))
        })?;
        let inner = trusted.into_inner();
        Ok(Self {
            shape: inner.shape,
            data: inner.data,
            device: Device::Host,
        })
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the same tensor tagged with a new placement.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Reinterprets the buffer under a new shape with the same element count.
    pub fn reshape(self, shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        if shape.iter().product::<usize>() != self.data.len() {
            return Err(Error::shape(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }
        Ok(Self { shape, ..self })
    }

    /// Replaces this tensor's data with another tensor of the same shape.
    ///
    /// # Panics
    /// Panics if shapes do not match.
    pub fn update(&mut self, mut other: Tensor<T>) {
        assert_eq!(self.shape, other.shape, "shape mismatch");
        core::mem::swap(&mut self.data, &mut other.data);
    }
}

impl<T: Element> Tensor<T> {
    /// Tensor of the given shape filled with `value`.
    pub fn full(shape: impl Into<Vec<usize>>, value: T) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self::new(shape, vec![value; len])
    }

    /// Tensor of the given shape filled with the type's default (zero).
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::full(shape, T::default())
    }

    /// Zero tensor with this tensor's shape and placement.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone()).to_device(self.device)
    }

    /// Runtime element type.
    pub fn dtype(&self) -> DType {
        T::DTYPE
    }
}

/// A tensor whose element type is only known at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyTensor {
    F32(Tensor<f32>),
    I32(Tensor<i32>),
}

impl AnyTensor {
    /// Runtime element type.
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::I32(_) => DType::I32,
        }
    }

    /// Shape of the underlying tensor.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::F32(t) => &t.shape,
            Self::I32(t) => &t.shape,
        }
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn as_f32(&self) -> Option<&Tensor<f32>> {
        match self {
            Self::F32(t) => Some(t),
            Self::I32(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<&Tensor<i32>> {
        match self {
            Self::I32(t) => Some(t),
            Self::F32(_) => None,
        }
    }
}

impl From<Tensor<f32>> for AnyTensor {
    fn from(t: Tensor<f32>) -> Self {
        Self::F32(t)
    }
}

impl From<Tensor<i32>> for AnyTensor {
    fn from(t: Tensor<i32>) -> Self {
        Self::I32(t)
    }
}

/// A parameter paired with its gradient accumulator.
///
/// Typically used as `WithGrad<Tensor<f32>>`.
#[derive(Debug, Clone, PartialEq)]
pub struct WithGrad<T> {
    pub value: T,
    pub grad: T,
}

impl<E: Element> WithGrad<Tensor<E>> {
    /// Wraps `value` with a zero-filled gradient of the same shape.
    pub fn new(value: Tensor<E>) -> Self {
        let grad = value.zeros_like();
        Self { value, grad }
    }

    /// Resets the gradient accumulator to zero.
    pub fn zero_grad(&mut self) {
        self.grad.data.fill(E::default());
    }
}

/// Defines a host tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use briny_kernels::tensor;
/// let t = tensor!([[1.0f32, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape, vec![2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = &children[0].shape;
        assert!(children.iter().all(|c| c.shape == *first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children { data.extend(c.data); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_new_rejects_mismatch() {
        let err = Tensor::try_new(vec![2, 3], vec![1.0f32; 5]).unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
    }

    #[test]
    fn try_new_accepts_matching_buffer() {
        let t = Tensor::try_new(vec![2, 2], vec![1i32, 2, 3, 4]).unwrap();
        assert_eq!(t.dtype(), DType::I32);
        assert_eq!(t.ndim(), 2);
    }

    #[test]
    fn reshape_keeps_device() {
        let t = Tensor::new(vec![2, 3], vec![0.0f32; 6]).to_device(Device::Gpu);
        let r = t.reshape(vec![3, 2]).unwrap();
        assert_eq!(r.shape, vec![3, 2]);
        assert_eq!(r.device, Device::Gpu);
        assert!(r.reshape(vec![4]).is_err());
    }

    #[test]
    fn with_grad_zeroes() {
        let mut p = WithGrad::new(Tensor::full(vec![2], 3.0f32));
        assert_eq!(p.grad.data, vec![0.0, 0.0]);
        p.grad.data[1] = 4.0;
        p.zero_grad();
        assert_eq!(p.grad.data, vec![0.0, 0.0]);
    }

    #[test]
    fn any_tensor_reports_dtype() {
        let a: AnyTensor = Tensor::new(vec![3], vec![1i32, 2, 3]).into();
        assert_eq!(a.dtype(), DType::I32);
        assert!(a.as_f32().is_none());
        assert_eq!(a.shape(), &[3]);
    }
}
