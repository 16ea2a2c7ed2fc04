//! Storage: host memory with Arc-based sharing

use crate::dtype::{DType, Element};
use std::sync::Arc;

/// Reference-counted buffer backing a tensor
///
/// Storage wraps an element buffer with reference counting, so cloning a
/// tensor is cheap and gradient values can be handed between worker threads
/// without copies.
///
/// The buffer is kept as `u64` words so that typed views up to 8-byte
/// elements are always correctly aligned.
///
/// The strong count is observable through [`Storage::use_count`]: gradient
/// accumulators use it to decide whether an incoming gradient can be stolen
/// in place of a clone.
pub struct Storage {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    /// Raw data, 8-byte aligned
    buf: Vec<u64>,
    /// Number of elements (not bytes)
    len: usize,
    /// Element type
    dtype: DType,
}

impl Storage {
    /// Create storage holding a copy of `data`
    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buf = vec![0u64; bytes.len().div_ceil(8)];
        bytemuck::cast_slice_mut::<u64, u8>(&mut buf)[..bytes.len()].copy_from_slice(bytes);
        Self {
            inner: Arc::new(StorageInner {
                buf,
                len: data.len(),
                dtype: T::DTYPE,
            }),
        }
    }

    /// Create zero-filled storage of `len` elements
    pub fn zeros(len: usize, dtype: DType) -> Self {
        let size_bytes = len * dtype.size_in_bytes();
        Self {
            inner: Arc::new(StorageInner {
                buf: vec![0u64; size_bytes.div_ceil(8)],
                len,
                dtype,
            }),
        }
    }

    /// Number of elements
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Whether the storage holds no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Element type
    #[inline]
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// Typed view of the data
    ///
    /// # Panics
    ///
    /// Panics if `T` does not match the storage dtype.
    pub fn as_slice<T: Element>(&self) -> &[T] {
        assert_eq!(T::DTYPE, self.inner.dtype, "storage dtype mismatch");
        let bytes: &[u8] = bytemuck::cast_slice(&self.inner.buf);
        bytemuck::cast_slice(&bytes[..self.inner.len * self.inner.dtype.size_in_bytes()])
    }

    /// Copy the data out as a typed Vec
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        self.as_slice::<T>().to_vec()
    }

    /// The number of live references to this buffer
    #[inline]
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl Clone for Storage {
    /// Clone increments the reference count (zero-copy)
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("len", &self.inner.len)
            .field("dtype", &self.inner.dtype)
            .field("refs", &Arc::strong_count(&self.inner))
            .finish()
    }
}
