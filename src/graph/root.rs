//! Synthetic root node seeding a backward invocation

use super::{Edge, EdgeList, GradList, InputMetadata, Node};
use crate::error::Result;

/// Synthetic node pushed first in every backward invocation
///
/// Its outputs are the (already validated) seed gradients and its successor
/// edges are the roots the caller passed to `execute`; running it through the
/// normal dispatch path means seeds reach root input buffers with the same
/// accumulation and stream handling as any other gradient.
pub struct GraphRoot {
    edges: EdgeList,
    outputs: GradList,
}

impl GraphRoot {
    /// Create a root over the given edges producing `outputs` as seeds
    pub fn new(edges: &[Edge], outputs: GradList) -> Self {
        Self {
            edges: edges.iter().cloned().collect(),
            outputs,
        }
    }
}

impl Node for GraphRoot {
    fn apply(&self, _inputs: GradList) -> Result<GradList> {
        Ok(self.outputs.clone())
    }

    fn next_edges(&self) -> &[Edge] {
        &self.edges
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn input_metadata(&self, _index: usize) -> &InputMetadata {
        unreachable!("GraphRoot has no inputs")
    }

    fn name(&self) -> &str {
        "GraphRoot"
    }
}
