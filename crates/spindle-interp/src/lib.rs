//! Reference interpreter for operator graphs.
//!
//! Executes a graph directly over [`spindle_core::TensorValue`]s, one node
//! at a time in topological order, with full support for `Loop` bodies and
//! their capture-by-name semantics. Nothing here is fast; the point is a
//! trustworthy baseline to compare lowered graphs against.

mod exec;

pub use exec::run_graph;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while executing a graph.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A node could not be executed as written.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Operand element types don't fit the operator.
    #[error("Type mismatch: {0}")]
    Type(String),

    /// Arithmetic fault (integer division by zero, bad index).
    #[error("Numeric fault: {0}")]
    Numeric(String),

    /// A tensor had no value and no enclosing scope provided one.
    #[error("No value for tensor '{0}'")]
    MissingValue(String),

    /// Error from the underlying graph model.
    #[error(transparent)]
    Graph(#[from] spindle_core::Error),
}
