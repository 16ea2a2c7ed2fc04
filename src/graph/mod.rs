//! Graph vertices and edges the engine executes
//!
//! The engine does not build graphs; it consumes them. A backward graph is a
//! DAG of [`Node`] trait objects connected by [`Edge`]s, where each edge
//! names the successor and the input slot the gradient flows into.

mod edge;
mod node;
mod root;

pub use edge::{Edge, EdgeList};
pub use node::{FunctionPostHook, FunctionPreHook, InputMetadata, Node};
pub use root::GraphRoot;

pub(crate) use node::node_key;

use crate::tensor::Tensor;

/// A list of optional gradients, one per slot
///
/// `None` is the undefined-gradient sentinel: a slot that never received a
/// contribution, or an output a backward operator chose not to produce.
pub type GradList = Vec<Option<Tensor>>;
