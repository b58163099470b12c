//! Error types for the adjoint core.

use thiserror::Error;

use crate::id::{EqId, VarId};
use crate::space::SpaceType;

/// Errors surfaced while recording a tape or computing derivatives.
///
/// Out-of-range indexing into the right-hand-side hierarchy or the graph
/// tables is a caller bug and panics instead.
#[derive(Debug, Error)]
pub enum AdjointError {
  /// The leading dependencies of an equation must be its outputs.
  #[error("equation {eq}: dependencies must begin with the equation outputs")]
  OutputsNotLeadingDependencies { eq: EqId },

  /// An equation lists the same variable twice among its dependencies
  /// (which includes solving for the same variable twice).
  #[error("equation {eq}: dependency {var} appears more than once")]
  DuplicateDependency { eq: EqId, var: VarId },

  /// A functional that no equation on the tape produces.
  #[error("functional {var} is not computed by any equation on the tape")]
  FunctionalNotOnTape { var: VarId },

  /// A derivative equation appears on the tape before its root equation.
  #[error("equation {eq}: root equation does not precede its derivative equations")]
  MalformedTape { eq: EqId },

  /// An adjoint expected in the cache was not there when the sweep reached
  /// it, e.g. an alias visited before its root slot was solved.
  #[error("equation {eq}: no cached adjoint for functional {functional} at ({block}, {equation})")]
  MissingCachedAdjoint {
    eq: EqId,
    functional: usize,
    block: usize,
    equation: usize,
  },

  /// An adjoint solution was returned in the wrong space.
  #[error(
    "equation {eq}: adjoint solution {index} has space type {actual:?}, expected {expected:?}"
  )]
  SpaceTypeMismatch {
    eq: EqId,
    index: usize,
    expected: SpaceType,
    actual: SpaceType,
  },

  /// An adjoint solution has the wrong number of components.
  #[error("equation {eq}: expected {expected} adjoint solutions, got {actual}")]
  AdjointArity { eq: EqId, expected: usize, actual: usize },

  /// A forward or adjoint solve failed inside an equation.
  #[error("equation {eq}: {message}")]
  Solve { eq: EqId, message: String },
}
