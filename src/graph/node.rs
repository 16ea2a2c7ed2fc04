//! The node trait backward operators implement

use super::{Edge, GradList};
use crate::device::{Device, DeviceType, Stream};
use crate::dtype::DType;
use crate::error::Result;
use crate::tensor::Shape;
use std::sync::Arc;

/// What a node expects of the gradient arriving at one of its input slots
///
/// Captured during the forward pass; the engine validates every produced
/// gradient against the consuming slot's metadata and coerces shape and
/// dtype where the tensor semantics allow it.
#[derive(Clone, Debug)]
pub struct InputMetadata {
    /// Expected gradient shape
    pub shape: Shape,
    /// Expected gradient dtype
    pub dtype: DType,
    /// Device the gradient must live on
    pub device: Device,
    /// Stream the consumer ran on during forward, if any
    pub stream: Option<Stream>,
}

impl InputMetadata {
    /// Metadata for a slot expecting `shape`/`dtype` on `device`
    pub fn new(shape: impl Into<Shape>, dtype: DType, device: Device) -> Self {
        Self {
            shape: shape.into(),
            dtype,
            device,
            stream: None,
        }
    }

    /// Attach the consumer's forward stream
    pub fn with_stream(mut self, stream: Stream) -> Self {
        self.stream = Some(stream);
        self
    }
}

/// Hook run on a node's incoming gradients before `apply`
pub trait FunctionPreHook: Send + Sync {
    /// Transform the gradients about to be passed to the node
    fn call(&self, grads: GradList) -> GradList;
}

/// Hook run on a node's outputs after `apply`
pub trait FunctionPostHook: Send + Sync {
    /// Transform the node's outputs, with read access to its inputs
    fn call(&self, outputs: GradList, inputs: &GradList) -> GradList;
}

/// A unit of backward computation
///
/// Implementations compute the gradient contributions to their predecessors:
/// `apply` receives one gradient per input slot and returns one gradient per
/// successor edge. The engine guarantees `apply` is never entered
/// concurrently for a given node, which accumulator nodes rely on.
pub trait Node: Send + Sync {
    /// Run the backward operator
    ///
    /// `inputs` has [`Node::num_inputs`] slots; unfilled slots are `None`.
    /// The returned list must have one entry per edge in
    /// [`Node::next_edges`], in order.
    fn apply(&self, inputs: GradList) -> Result<GradList>;

    /// Successors this node's outputs flow into, in output order
    fn next_edges(&self) -> &[Edge];

    /// Number of gradient input slots
    fn num_inputs(&self) -> usize;

    /// Metadata for input slot `index`
    fn input_metadata(&self, index: usize) -> &InputMetadata;

    /// Human-readable operator name
    fn name(&self) -> &str;

    /// The stream this node ran on during forward for `device_type`, if any
    fn stream(&self, device_type: DeviceType) -> Option<Stream> {
        let _ = device_type;
        None
    }

    /// Hooks run on incoming gradients before `apply`
    fn pre_hooks(&self) -> &[Arc<dyn FunctionPreHook>] {
        &[]
    }

    /// Hooks run on outputs after `apply`
    fn post_hooks(&self) -> &[Arc<dyn FunctionPostHook>] {
        &[]
    }

    /// Notification that `apply` is allowed to free saved state
    ///
    /// Called before `apply` when the caller did not ask to keep the graph.
    fn will_release_variables(&self) {}

    /// Drop tensors saved for backward
    ///
    /// Called after `apply` when the caller did not ask to keep the graph.
    fn release_variables(&self) {}

    /// Forward-pass stack captured for anomaly mode, if any
    fn anomaly_stack(&self) -> Option<String> {
        None
    }
}

/// Identity key for engine-internal maps
///
/// Nodes are compared by the address of their trait object; the graph
/// structure keeps every pending node alive, so a key can never be reused
/// while its entry is live.
pub(crate) fn node_key(node: &Arc<dyn Node>) -> usize {
    Arc::as_ptr(node) as *const () as usize
}
