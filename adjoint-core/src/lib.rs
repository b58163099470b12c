//!
//! # adjoint-core
//!
//! Backend independent machinery for adjoint (reverse mode) differentiation
//! of programs built from whole equation solves, e.g. one linear solve per
//! timestep.
//!
//! A forward run records [`Equation`]s on a [`Tape`], grouped into blocks. To
//! differentiate functionals with respect to controls, the tape is analysed
//! into a [`TransposeComputationalGraph`] (who reads whose output, and which
//! equations matter at all), adjoint right-hand-sides are accumulated in an
//! [`AdjointModelRhs`] while walking the tape backwards, and solved adjoints
//! are shared between functionals and kept between runs by an
//! [`AdjointCache`]. [`compute_gradient`] ties these together.
//!
//! The core never touches numerical data. Values live behind the
//! [`Variable`] trait, provided by a backend crate.
//!

pub mod cache;
pub mod equation;
pub mod error;
pub mod graph;
pub mod id;
pub mod rhs;
pub mod space;
pub mod sweep;
pub mod tangent;
pub mod tape;

#[cfg(test)]
mod testing;

pub use cache::{AdjointCache, Slot};
pub use equation::{
  ControlsMarker, DerivativeChain, DirectionKey, Equation, EquationKind, FunctionalMarker,
  Instruction, TlmKey, Variable,
};
pub use error::AdjointError;
pub use graph::{GraphOptions, TransposeComputationalGraph};
pub use id::{EqId, IdGenerator, VarId};
pub use rhs::{AdjointBlockRhs, AdjointEquationRhs, AdjointModelRhs, AdjointRhs, DependencyRhs};
pub use space::SpaceType;
pub use sweep::{compute_gradient, with_controls, GradientOptions};
pub use tangent::{functional_derivative_chains, FunctionalChains};
pub use tape::{Block, EquationRef, OutputPosition, Tape};
