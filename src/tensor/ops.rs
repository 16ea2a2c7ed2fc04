//! The tensor operations gradient routing needs
//!
//! Accumulation (`add`), broadcast-aware reshaping by summation (`sum_to`),
//! float casts, and NaN scans. Kernels are scalar loops dispatched over the
//! runtime dtype; anything heavier belongs to the embedding tensor library.

use super::{is_expandable_to, Shape, Storage, Tensor};
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};

/// Run `$body` with `$T` aliased to the Rust type matching `$dtype`
macro_rules! with_dtype {
    ($dtype:expr, $T:ident, $body:expr) => {
        match $dtype {
            DType::F64 => {
                type $T = f64;
                $body
            }
            DType::F32 => {
                type $T = f32;
                $body
            }
            #[cfg(feature = "f16")]
            DType::F16 => {
                type $T = half::f16;
                $body
            }
            #[cfg(feature = "f16")]
            DType::BF16 => {
                type $T = half::bf16;
                $body
            }
            DType::I64 => {
                type $T = i64;
                $body
            }
            DType::I32 => {
                type $T = i32;
                $body
            }
        }
    };
}

impl Tensor {
    /// Element-wise sum of two same-shaped tensors
    ///
    /// This is the accumulation step of input-buffer filling; shapes and
    /// dtypes already match because both contributions were validated against
    /// the same consumer metadata.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.shape() != other.shape() {
            return Err(Error::shape_mismatch(self.shape(), other.shape()));
        }
        if self.dtype() != other.dtype() {
            return Err(Error::DTypeMismatch {
                lhs: self.dtype(),
                rhs: other.dtype(),
            });
        }
        if self.device() != other.device() {
            return Err(Error::DeviceMismatch);
        }
        with_dtype!(self.dtype(), T, {
            let a = self.storage().as_slice::<T>();
            let b = other.storage().as_slice::<T>();
            let out: Vec<T> = a.iter().zip(b).map(|(x, y)| *x + *y).collect();
            Ok(Tensor::from_parts(
                Storage::from_slice(&out),
                self.shape_ref().clone(),
                self.device(),
            ))
        })
    }

    /// Reshape to `shape` under broadcasting rules, summing where `shape` is
    /// smaller and repeating where it is larger
    ///
    /// Covers both directions of gradient/metadata shape coercion: a gradient
    /// produced in broadcast form is reduced back to the consumer's shape,
    /// and a size-1 seed is expanded to the shape the consumer expects.
    pub fn sum_to(&self, shape: &[usize]) -> Result<Tensor> {
        if self.shape() == shape {
            return Ok(self.clone());
        }

        let ndim = self.ndim().max(shape.len());
        let src = pad_leading(self.shape(), ndim);
        let dst = pad_leading(shape, ndim);

        // Per-dimension compatibility: equal, or one side is 1.
        let mut broadcast = Vec::with_capacity(ndim);
        for (s, d) in src.iter().zip(&dst) {
            if s != d && *s != 1 && *d != 1 {
                return Err(Error::shape_mismatch(shape, self.shape()));
            }
            broadcast.push((*s).max(*d));
        }

        let src_strides = broadcast_strides(&src);
        let dst_strides = broadcast_strides(&dst);
        let total: usize = broadcast.iter().product();
        let out_len: usize = dst.iter().product();

        with_dtype!(self.dtype(), T, {
            let data = self.storage().as_slice::<T>();
            let mut out = vec![T::zero(); out_len];
            let mut index = vec![0usize; ndim];
            for _ in 0..total {
                let mut si = 0;
                let mut di = 0;
                for d in 0..ndim {
                    si += index[d] * src_strides[d];
                    di += index[d] * dst_strides[d];
                }
                out[di] += data[si];
                for d in (0..ndim).rev() {
                    index[d] += 1;
                    if index[d] < broadcast[d] {
                        break;
                    }
                    index[d] = 0;
                }
            }
            Ok(Tensor::from_parts(
                Storage::from_slice(&out),
                Shape::from(shape),
                self.device(),
            ))
        })
    }

    /// Convert to another dtype
    pub fn cast(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype() {
            return self.clone();
        }
        with_dtype!(self.dtype(), S, {
            let src = self.storage().as_slice::<S>();
            with_dtype!(dtype, D, {
                let out: Vec<D> = src.iter().map(|x| D::from_f64(x.to_f64())).collect();
                Tensor::from_parts(
                    Storage::from_slice(&out),
                    self.shape_ref().clone(),
                    self.device(),
                )
            })
        })
    }

    /// Whether any element is NaN (always false for integer tensors)
    pub fn has_nan(&self) -> bool {
        if !self.dtype().is_float() {
            return false;
        }
        with_dtype!(self.dtype(), T, {
            self.storage()
                .as_slice::<T>()
                .iter()
                .any(|x| x.to_f64().is_nan())
        })
    }

    /// Whether this tensor's shape can be coerced to `shape` by [`Tensor::sum_to`]
    pub fn broadcast_compatible(&self, shape: &[usize]) -> bool {
        is_expandable_to(shape, self.shape()) || is_expandable_to(self.shape(), shape)
    }

    pub(crate) fn map_elements(&self, f: impl Fn(f64) -> f64) -> Tensor {
        with_dtype!(self.dtype(), T, {
            let out: Vec<T> = self
                .storage()
                .as_slice::<T>()
                .iter()
                .map(|x| T::from_f64(f(x.to_f64())))
                .collect();
            Tensor::from_parts(
                Storage::from_slice(&out),
                self.shape_ref().clone(),
                self.device(),
            )
        })
    }
}

/// Pad `shape` with leading 1s up to `ndim` dimensions
fn pad_leading(shape: &[usize], ndim: usize) -> Vec<usize> {
    let mut padded = vec![1usize; ndim - shape.len()];
    padded.extend_from_slice(shape);
    padded
}

/// Contiguous strides with broadcast (size-1) dimensions pinned to stride 0
fn broadcast_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; dims.len()];
    let mut stride = 1;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = if *dim == 1 { 0 } else { stride };
        stride *= dim;
    }
    strides
}
