//! Directed successor references between graph nodes

use super::Node;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// A list of edges; stack-allocated for the common one- or two-successor case
pub type EdgeList = SmallVec<[Edge; 2]>;

/// Directed reference to a successor node and the input slot it consumes
///
/// An edge without a function is *invalid*: the producing node computed a
/// gradient nothing downstream wants, and the engine drops it.
#[derive(Clone)]
pub struct Edge {
    /// The consuming node, if any
    pub function: Option<Arc<dyn Node>>,
    /// Which of the consumer's input slots this edge feeds
    pub input_nr: usize,
}

impl Edge {
    /// Create an edge into slot `input_nr` of `function`
    pub fn new(function: Arc<dyn Node>, input_nr: usize) -> Self {
        Self {
            function: Some(function),
            input_nr,
        }
    }

    /// Create an invalid edge
    pub fn empty() -> Self {
        Self {
            function: None,
            input_nr: 0,
        }
    }

    /// Whether this edge points at a consumer
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.function.is_some()
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(function) => write!(f, "Edge({} @ {})", function.name(), self.input_nr),
            None => write!(f, "Edge(<invalid>)"),
        }
    }
}
