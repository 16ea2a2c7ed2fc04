//! # gradr
//!
//! **Multi-threaded, multi-device reverse-mode automatic differentiation
//! execution engine.**
//!
//! gradr drives a previously-recorded computation graph backward: given a set
//! of root edges with seed gradients, it traverses the graph in reverse
//! topological order, invokes each node's backward operator, accumulates
//! gradient contributions into per-node input buffers, and returns the
//! gradients captured at the requested edges.
//!
//! The crate is an execution engine, not a tensor library. Backward operators
//! are supplied by the embedder as [`graph::Node`] implementations; device
//! runtimes (streams, events) are supplied through the
//! [`device::DeviceRuntime`] registry. The engine owns the scheduling:
//!
//! - one worker thread per accelerator device, a caller-driven CPU worker
//! - a priority ready queue per worker, ordered by reentrant depth
//! - dependency counting so every node runs exactly once, after all of its
//!   producers
//! - reentrant backward (a node's `apply` may call [`engine::Engine::execute`]
//!   again) without deadlocking its own worker, via inline recursion up to a
//!   depth limit and a thread pool beyond it
//! - producer/consumer stream synchronization on cross-stream accumulation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gradr::prelude::*;
//!
//! let engine = Engine::new();
//! let roots = vec![Edge::new(loss_grad_fn, 0)];
//! let seeds = vec![Some(Tensor::ones(&[1], DType::F32, Device::cpu()))];
//! let grads = engine.execute(&roots, seeds, false, false, &outputs)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `f16`: half-precision dtypes (F16, BF16) via the `half` crate

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod device;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod graph;
pub mod mode;
pub mod tensor;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::device::{Device, DeviceRuntime, DeviceType, Stream};
    pub use crate::dtype::DType;
    pub use crate::engine::{Engine, InputBuffer, NodeTask, ReadyQueue};
    pub use crate::error::{Error, Result};
    pub use crate::graph::{Edge, GradList, InputMetadata, Node};
    pub use crate::tensor::Tensor;
}
