//! Core Tensor type

use super::{Shape, Storage};
use crate::device::Device;
use crate::dtype::{DType, Element};
use std::fmt;

/// Dense value carried along graph edges
///
/// A tensor is Arc-shared storage plus a shape and a device placement.
/// Cloning is cheap (a reference count bump), which is what lets the engine
/// route one gradient to several consumers and capture requested outputs
/// without copying data.
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    device: Device,
}

impl Tensor {
    /// Create a tensor from a slice of data
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` does not equal the product of the `shape`
    /// dimensions.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize], device: Device) -> Self {
        let shape = Shape::from(shape);
        assert_eq!(
            data.len(),
            shape.numel(),
            "data length {} does not match shape {:?}",
            data.len(),
            shape
        );
        Self {
            storage: Storage::from_slice(data),
            shape,
            device,
        }
    }

    /// Create a zero-filled tensor
    pub fn zeros(shape: &[usize], dtype: DType, device: Device) -> Self {
        let shape = Shape::from(shape);
        Self {
            storage: Storage::zeros(shape.numel(), dtype),
            shape,
            device,
        }
    }

    /// Create a one-filled tensor
    pub fn ones(shape: &[usize], dtype: DType, device: Device) -> Self {
        Tensor::zeros(shape, dtype, device).map_elements(|_| 1.0)
    }

    pub(crate) fn from_parts(storage: Storage, shape: Shape, device: Device) -> Self {
        debug_assert_eq!(storage.len(), shape.numel());
        Self {
            storage,
            shape,
            device,
        }
    }

    /// The shape
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.shape.as_slice()
    }

    /// The element type
    #[inline]
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// The device placement
    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of elements
    #[inline]
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Number of dimensions
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Copy the data out as a typed Vec
    ///
    /// # Panics
    ///
    /// Panics if `T` does not match the tensor dtype.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        self.storage.to_vec()
    }

    /// Number of live references to this tensor's storage
    ///
    /// Gradient accumulators inspect this to decide between stealing and
    /// cloning an incoming gradient; the engine keeps one extra reference
    /// alive across `apply` when post-hooks are installed, which accumulators
    /// must account for.
    #[inline]
    pub fn storage_use_count(&self) -> usize {
        self.storage.use_count()
    }

    #[inline]
    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    #[inline]
    pub(crate) fn shape_ref(&self) -> &Shape {
        &self.shape
    }
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            shape: self.shape.clone(),
            device: self.device,
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype())
            .field("device", &self.device)
            .finish()
    }
}
