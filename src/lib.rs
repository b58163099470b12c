//!
//! # adjoint
//!
//! ## Core API
//!
//! Reverse-mode differentiation of programs made of whole equation solves.
//! Record the forward run on a [`Tape`], then ask [`compute_gradient`] for the
//! derivatives of one or more functionals with respect to the controls. An
//! [`AdjointCache`] kept between calls lets repeated and related derivative
//! requests reuse adjoint solutions instead of solving again.
//!
//! The `vector` feature (on by default) adds a dense nalgebra backend.
//!

pub use lib_adjoint_core::*;

#[cfg(feature = "vector")]
pub use lib_adjoint_vector as vector;
