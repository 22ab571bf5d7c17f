//! Graph IR and tensor types for the spindle lowering toolkit.
//!
//! This crate provides the foundations the lowering pass and the reference
//! interpreter share:
//! - Operator/tensor graph with stable IDs (`Graph`, `Node`, `Tensor`)
//! - Closed operator vocabulary (`OpKind`) and typed attributes
//! - Element types, shapes, roles, and compile-time tensor values
//! - Broadcasting rules and row-major index arithmetic

pub mod broadcast;
pub mod dump;
pub mod graph;
pub mod index;
pub mod ops;
pub mod types;

// Re-export commonly used types
pub use broadcast::{broadcast_shape, broadcast_shapes, is_broadcastable_to};
pub use graph::{Graph, Node, OpId, Tensor, TensorId};
pub use ops::{Attribute, OpKind};
pub use types::{ElemType, Shape, TensorData, TensorRole, TensorValue};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for graph and tensor operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Attribute error: {0}")]
    Attribute(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Type error: {0}")]
    Type(String),
}
