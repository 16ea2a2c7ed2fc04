//! Error types for gradr

use crate::device::Device;
use crate::dtype::DType;
use thiserror::Error;

/// Result type alias using gradr's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while executing a backward pass
///
/// `Error` is `Clone` because the first failure is latched into the
/// graph task's completion future and handed to the blocked caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Wrong number of gradients handed to a function's successors
    #[error("invalid number of gradients - expected {expected}, but got {got}")]
    GradientCount {
        /// Expected gradient count (number of edges)
        expected: usize,
        /// Actual gradient count
        got: usize,
    },

    /// Gradient shape is neither equal nor broadcast-compatible with the
    /// consumer's input metadata
    #[error(
        "invalid gradient at index {index} - got {got:?} but expected shape compatible with {expected:?}"
    )]
    GradientShape {
        /// Gradient slot index
        index: usize,
        /// Shape of the produced gradient
        got: Vec<usize>,
        /// Shape expected by the consumer
        expected: Vec<usize>,
    },

    /// Gradient dtype is not a floating point type
    #[error("invalid gradient at index {index} - expected a floating point gradient, got {dtype}")]
    GradientNotFloat {
        /// Gradient slot index
        index: usize,
        /// The offending dtype
        dtype: DType,
    },

    /// Gradient landed on the wrong device
    #[error("invalid gradient at index {index} - expected device {expected} but got {got}")]
    GradientDevice {
        /// Gradient slot index
        index: usize,
        /// Device expected by the consumer
        expected: Device,
        /// Device the gradient is on
        got: Device,
    },

    /// A backward function produced an invalid gradient
    ///
    /// Wraps the gradient validation errors above with the name of the
    /// function that produced the output.
    #[error("Function '{function}' returned an {source}")]
    Function {
        /// Name of the offending node
        function: String,
        /// The underlying validation error
        #[source]
        source: Box<Error>,
    },

    /// Anomaly mode detected a NaN gradient
    #[error("Function '{function}' returned nan values in its {output_index}th output")]
    NanGradient {
        /// Name of the offending node
        function: String,
        /// Index of the NaN output
        output_index: usize,
    },

    /// Some reachable functions never received all of their inputs
    #[error("could not compute gradients for some functions")]
    GraphIncomplete,

    /// Shape mismatch in a tensor operation
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        got: Vec<usize>,
    },

    /// DType mismatch between operands
    #[error("DType mismatch: {lhs} vs {rhs}")]
    DTypeMismatch {
        /// Left-hand side dtype
        lhs: DType,
        /// Right-hand side dtype
        rhs: DType,
    },

    /// Device mismatch between operands
    #[error("Device mismatch: tensors must be on the same device")]
    DeviceMismatch,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a gradient validation error with the producing function's name
    pub fn function(function: impl Into<String>, source: Error) -> Self {
        Self::Function {
            function: function.into(),
            source: Box::new(source),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
