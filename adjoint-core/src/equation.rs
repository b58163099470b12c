//!
//! The capabilities the core needs from variables and equations.
//!
//! Nothing here owns numerical data. A [`Variable`] is a cheap handle: cloning
//! it shares the underlying value (same id), [`Variable::copy`] makes a new
//! variable with a fresh id. An [`Equation`] solves for its outputs `X` given
//! its dependencies, and knows how to take part in an adjoint solve.
//!

use std::fmt;

use smallvec::SmallVec;

use crate::error::AdjointError;
use crate::id::{EqId, IdGenerator, VarId};
use crate::rhs::DependencyRhs;
use crate::space::SpaceType;

/// A handle on externally owned vector storage
pub trait Variable: Clone {
  /// Whatever the backend needs to allocate a new variable
  type Space: Clone;

  /// A term that can be subtracted from an adjoint right-hand-side, the
  /// result of an adjoint derivative action
  type Action;

  fn id(&self) -> VarId;

  fn space(&self) -> &Self::Space;

  fn space_type(&self) -> SpaceType;

  /// Monotonically increasing, bumped whenever the value changes
  fn state(&self) -> u64;

  /// For a functional produced as a tangent-linear of another functional, the
  /// id of the original (un-differentiated) functional
  fn tlm_root_id(&self) -> Option<VarId> {
    None
  }

  /// A new, zero valued variable of the given space type
  fn new_in(space: &Self::Space, space_type: SpaceType) -> Self;

  /// A deep copy, with a fresh id
  fn copy(&self) -> Self;

  /// Subtract an adjoint derivative action from this variable
  fn subtract_action(&mut self, action: &Self::Action);

  /// The action whose subtraction from a zero right-hand-side leaves the unit
  /// adjoint seed for the functional `self`
  fn seed_action(&self) -> Self::Action;
}

/// Tag for the few equation kinds the core has to tell apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EquationKind {
  #[default]
  Regular,
  /// Side effecting step with no outputs, never pruned
  Instruction,
  /// Brackets the controls; excluded from cache bookkeeping
  ControlsMarker,
  /// Brackets a functional; excluded from cache bookkeeping
  FunctionalMarker,
}

/// One tangent-linear direction: the controls and the direction along which
/// they were perturbed
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirectionKey {
  pub controls: SmallVec<[VarId; 2]>,
  pub directions: SmallVec<[VarId; 2]>,
}

impl DirectionKey {
  pub fn new<V: Variable>(controls: &[V], directions: &[V]) -> Self {
    Self {
      controls: controls.iter().map(V::id).collect(),
      directions: directions.iter().map(V::id).collect(),
    }
  }
}

/// The ordered sequence of tangent-linear directions that produced an
/// equation from its root equation
pub type TlmKey = SmallVec<[DirectionKey; 2]>;

/// Derivative metadata attached to a tangent-linear equation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativeChain {
  /// The original forward equation
  pub root: EqId,
  pub key: TlmKey,
}

/// An equation recorded on a tape.
///
/// `dependencies()` must begin with the outputs `x()`, in order; the remaining
/// entries are the equation's inputs. The tape rejects equations that break
/// this.
pub trait Equation<V: Variable> {
  fn id(&self) -> EqId;

  fn kind(&self) -> EquationKind {
    EquationKind::Regular
  }

  /// The forward variables solved for
  fn x(&self) -> &[V];

  fn dependencies(&self) -> &[V];

  /// The dependencies whose values are needed again by the adjoint
  fn nonlinear_dependencies(&self) -> &[V] {
    self.dependencies()
  }

  /// Outputs whose previous adjoint value is a useful initial guess
  fn adjoint_initial_condition_dependencies(&self) -> &[V] {
    &[]
  }

  /// Space type of adjoint `m`, relative to the space type of output `m`
  fn adj_x_type(&self, _m: usize) -> SpaceType {
    SpaceType::ConjugateDual
  }

  fn derivative_chain(&self) -> Option<&DerivativeChain> {
    None
  }

  fn forward_solve(&self) -> Result<(), AdjointError> {
    Ok(())
  }

  /// Zero valued adjoint variables for the outputs
  fn new_adj_x(&self) -> Vec<V> {
    self
      .x()
      .iter()
      .enumerate()
      .map(|(m, x)| V::new_in(x.space(), x.space_type().relative(self.adj_x_type(m))))
      .collect()
  }

  /// Solve the adjoint of the Jacobian with respect to the outputs.
  ///
  /// `initial_guess[m]` holds a previous adjoint solution for output `m`, when
  /// one is available. `b` holds one right-hand-side per output.
  fn adjoint_jacobian_solve(
    &self,
    initial_guess: Vec<Option<V>>,
    b: Vec<V>,
  ) -> Result<Vec<V>, AdjointError>;

  /// Action of the adjoint of the derivative with respect to dependency
  /// `dep_index` on `adj_x`; `None` when it vanishes
  fn adjoint_derivative_action(&self, dep_index: usize, adj_x: &[V]) -> Option<V::Action>;

  fn subtract_adjoint_derivative_actions(&self, adj_x: &[V], dep_bs: &mut DependencyRhs<'_, V>) {
    for j in dep_bs.slots() {
      let action = self.adjoint_derivative_action(j, adj_x);
      dep_bs.sub(j, action.as_ref());
    }
  }

  /// Solve for the adjoint and push its contributions into the right-hand
  /// sides of the equations that produced the dependencies
  fn adjoint(
    &self,
    initial_guess: Vec<Option<V>>,
    b: Vec<V>,
    dep_bs: &mut DependencyRhs<'_, V>,
  ) -> Result<Vec<V>, AdjointError> {
    let adj_x = self.adjoint_jacobian_solve(initial_guess, b)?;
    if adj_x.len() != self.x().len() {
      return Err(AdjointError::AdjointArity {
        eq: self.id(),
        expected: self.x().len(),
        actual: adj_x.len(),
      });
    }
    for (m, (x, adj)) in self.x().iter().zip(adj_x.iter()).enumerate() {
      let expected = x.space_type().relative(self.adj_x_type(m));
      if adj.space_type() != expected {
        return Err(AdjointError::SpaceTypeMismatch {
          eq: self.id(),
          index: m,
          expected,
          actual: adj.space_type(),
        });
      }
    }
    self.subtract_adjoint_derivative_actions(&adj_x, dep_bs);
    Ok(adj_x)
  }
}

impl<V: Variable> fmt::Debug for dyn Equation<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Equation")
      .field("id", &self.id())
      .field("kind", &self.kind())
      .field("outputs", &self.x().len())
      .field("dependencies", &self.dependencies().len())
      .finish()
  }
}

/// An uninterpretable side effecting step, e.g. writing a checkpoint. It has
/// no outputs and forward pruning never removes it.
pub struct Instruction<V> {
  id: EqId,
  dependencies: Vec<V>,
}

impl<V: Variable> Instruction<V> {
  pub fn new(ids: &IdGenerator, dependencies: Vec<V>) -> Self {
    Self {
      id: ids.eq_id(),
      dependencies,
    }
  }
}

impl<V: Variable> Equation<V> for Instruction<V> {
  fn id(&self) -> EqId {
    self.id
  }

  fn kind(&self) -> EquationKind {
    EquationKind::Instruction
  }

  fn x(&self) -> &[V] {
    &[]
  }

  fn dependencies(&self) -> &[V] {
    &self.dependencies
  }

  fn nonlinear_dependencies(&self) -> &[V] {
    &[]
  }

  fn adjoint_jacobian_solve(&self, _: Vec<Option<V>>, _: Vec<V>) -> Result<Vec<V>, AdjointError> {
    Ok(Vec::new())
  }

  fn adjoint_derivative_action(&self, _: usize, _: &[V]) -> Option<V::Action> {
    None
  }
}

/// Marks the controls. Its outputs are the controls themselves, so the
/// adjoint right-hand-side accumulated for it is the derivative with respect
/// to the controls.
pub struct ControlsMarker<V> {
  id: EqId,
  controls: Vec<V>,
}

impl<V: Variable> ControlsMarker<V> {
  pub fn new(ids: &IdGenerator, controls: Vec<V>) -> Self {
    Self {
      id: ids.eq_id(),
      controls,
    }
  }
}

impl<V: Variable> Equation<V> for ControlsMarker<V> {
  fn id(&self) -> EqId {
    self.id
  }

  fn kind(&self) -> EquationKind {
    EquationKind::ControlsMarker
  }

  fn x(&self) -> &[V] {
    &self.controls
  }

  fn dependencies(&self) -> &[V] {
    &self.controls
  }

  fn nonlinear_dependencies(&self) -> &[V] {
    &[]
  }

  fn adjoint_jacobian_solve(&self, _: Vec<Option<V>>, b: Vec<V>) -> Result<Vec<V>, AdjointError> {
    Ok(b)
  }

  fn adjoint_derivative_action(&self, _: usize, _: &[V]) -> Option<V::Action> {
    None
  }
}

/// Records that the functional `j` is to be differentiated as (a derivative
/// of) the functional `j_root`.
pub struct FunctionalMarker<V> {
  id: EqId,
  dependencies: [V; 2],
}

impl<V: Variable> FunctionalMarker<V> {
  pub fn new(ids: &IdGenerator, j: V, j_root: V) -> Self {
    Self {
      id: ids.eq_id(),
      dependencies: [j, j_root],
    }
  }

  pub fn functional(&self) -> &V {
    &self.dependencies[0]
  }

  pub fn root(&self) -> &V {
    &self.dependencies[1]
  }
}

impl<V: Variable> Equation<V> for FunctionalMarker<V> {
  fn id(&self) -> EqId {
    self.id
  }

  fn kind(&self) -> EquationKind {
    EquationKind::FunctionalMarker
  }

  fn x(&self) -> &[V] {
    &[]
  }

  fn dependencies(&self) -> &[V] {
    &self.dependencies
  }

  fn nonlinear_dependencies(&self) -> &[V] {
    &[]
  }

  fn adjoint_jacobian_solve(&self, _: Vec<Option<V>>, _: Vec<V>) -> Result<Vec<V>, AdjointError> {
    Ok(Vec::new())
  }

  fn adjoint_derivative_action(&self, _: usize, _: &[V]) -> Option<V::Action> {
    None
  }
}
