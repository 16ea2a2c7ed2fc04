//! Tensor value type and the operations gradient routing needs
//!
//! This module provides the dense `Tensor` value the engine moves along graph
//! edges. It is deliberately small: the engine does not own tensor
//! arithmetic, it only needs to accumulate contributions into input buffers
//! and to validate/coerce gradients against consumer metadata (broadcast
//! reduction, float casts, NaN scans).
//!
//! Storage is host-resident and Arc-shared; the tensor's [`Device`] field is
//! placement metadata the scheduler routes by. Embedders with real
//! accelerator memory keep it behind their own operators and streams; the
//! engine never dereferences device pointers.
//!
//! [`Device`]: crate::device::Device

mod core;
mod ops;
mod shape;
mod storage;

pub use core::Tensor;
pub use shape::{is_expandable_to, Shape};
pub use storage::Storage;
