//!
//! Identity for variables and equations.
//!
//! Every variable and equation gets a dense integer id from an [`IdGenerator`]
//! created once per run and handed to whatever constructs them. Tape, graph and
//! cache structures are all keyed by these ids, never by object address.
//!

use std::cell::Cell;
use std::fmt;

/// Globally unique identity of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(u64);

impl VarId {
  #[inline(always)]
  pub fn index(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for VarId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "var#{}", self.0)
  }
}

/// Stable identity of an equation, distinct from its position on a tape
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EqId(u64);

impl EqId {
  #[inline(always)]
  pub fn index(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for EqId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "eq#{}", self.0)
  }
}

/// Hands out ids for variables and equations.
///
/// Counters only ever grow, so ids are unique until [`IdGenerator::reset`] is
/// called at an explicit "new run" boundary. Single threaded, like everything
/// else in the core; share it behind an `Rc`.
#[derive(Debug, Default)]
pub struct IdGenerator {
  next_var: Cell<u64>,
  next_eq: Cell<u64>,
}

impl IdGenerator {
  pub fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub fn var_id(&self) -> VarId {
    let id = self.next_var.get();
    self.next_var.set(id + 1);
    VarId(id)
  }

  #[inline]
  pub fn eq_id(&self) -> EqId {
    let id = self.next_eq.get();
    self.next_eq.set(id + 1);
    EqId(id)
  }

  /// Start a new run; every id handed out before this is invalidated. Needs
  /// exclusive access so nothing can be mid-construction.
  pub fn reset(&mut self) {
    self.next_var.set(0);
    self.next_eq.set(0);
  }
}
