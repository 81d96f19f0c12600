use thiserror::Error;

/// Errors raised while building or differentiating a graph on a [`crate::Tape`].
///
/// Numeric domain problems (a negative base under a fractional exponent, an
/// overflowing `exp`) are not errors: they produce `NaN`/`inf` values that
/// flow through the graph like any other number.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
  #[error("invalid argument to {op}: {value} is not a finite constant")]
  InvalidArgument { op: &'static str, value: f64 },

  #[error("operands belong to different tapes")]
  ForeignVar,

  #[error("only leaf nodes may have their value overwritten")]
  NotALeaf,

  #[error("width mismatch: expected {expected}, got {actual}")]
  WidthMismatch { expected: usize, actual: usize },

  #[error("invalid config: {0}")]
  InvalidConfig(String),

  #[error("cycle detected in the operand graph at node {node}")]
  Cycle { node: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
