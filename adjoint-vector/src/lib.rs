//!
//! # adjoint-vector
//!
//! Dense real vectors for the adjoint core, backed by nalgebra.
//!
//! A [`Vector`] is a shared handle: clones see the same storage and the same
//! id, [`Variable::copy`] gives a detached vector with a fresh id. Every write
//! bumps the vector's state counter.
//!
//! The equations here are explicit (the output is a closed form of the
//! inputs) except [`LinearSolve`], which solves a dense linear system. The
//! first dependency of each equation is always its output.
//!

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use nalgebra::{DMatrix, DVector};
use smallvec::SmallVec;

use lib_adjoint_core::{
  AdjointError, DerivativeChain, EqId, Equation, IdGenerator, SpaceType, VarId, Variable,
};

/// Length of the vectors in a space, plus the id source for new vectors
#[derive(Clone)]
pub struct VectorSpace {
  ids: Rc<IdGenerator>,
  len: usize,
}

impl VectorSpace {
  pub fn new(ids: &Rc<IdGenerator>, len: usize) -> Self {
    Self {
      ids: Rc::clone(ids),
      len,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub fn ids(&self) -> &Rc<IdGenerator> {
    &self.ids
  }
}

impl fmt::Debug for VectorSpace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("VectorSpace").field("len", &self.len).finish()
  }
}

struct Inner {
  id: VarId,
  space: VectorSpace,
  space_type: SpaceType,
  value: RefCell<DVector<f64>>,
  state: Cell<u64>,
  tlm_root: Option<VarId>,
}

#[derive(Clone)]
pub struct Vector(Rc<Inner>);

impl Vector {
  /// A zero primal vector
  pub fn new(space: &VectorSpace) -> Self {
    Self::with_type(space, SpaceType::Primal)
  }

  pub fn with_type(space: &VectorSpace, space_type: SpaceType) -> Self {
    Self::build(space, space_type, DVector::zeros(space.len), None)
  }

  /// # Panics
  ///
  /// If `values` does not have the length of `space`
  pub fn from_vec(space: &VectorSpace, values: Vec<f64>) -> Self {
    assert_eq!(values.len(), space.len, "value does not fit the space");
    Self::build(space, SpaceType::Primal, DVector::from_vec(values), None)
  }

  /// A zero vector holding a tangent-linear of the functional `root`
  pub fn tangent_of(space: &VectorSpace, root: &Vector) -> Self {
    let root_id = root.0.tlm_root.unwrap_or(root.0.id);
    Self::build(space, SpaceType::Primal, DVector::zeros(space.len), Some(root_id))
  }

  fn build(
    space: &VectorSpace,
    space_type: SpaceType,
    value: DVector<f64>,
    tlm_root: Option<VarId>,
  ) -> Self {
    Self(Rc::new(Inner {
      id: space.ids.var_id(),
      space: space.clone(),
      space_type,
      value: RefCell::new(value),
      state: Cell::new(0),
      tlm_root,
    }))
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.0.space.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.0.space.is_empty()
  }

  #[inline]
  pub fn value(&self) -> Ref<'_, DVector<f64>> {
    self.0.value.borrow()
  }

  pub fn to_dvector(&self) -> DVector<f64> {
    self.value().clone()
  }

  /// First component, e.g. the value of a functional
  #[inline]
  pub fn scalar(&self) -> f64 {
    self.value()[0]
  }

  /// # Panics
  ///
  /// If `value` does not have the length of the vector
  pub fn set(&self, value: DVector<f64>) {
    assert_eq!(value.len(), self.len(), "value does not fit the space");
    *self.0.value.borrow_mut() = value;
    self.bump();
  }

  pub fn update(&self, f: impl FnOnce(&mut DVector<f64>)) {
    f(&mut self.0.value.borrow_mut());
    self.bump();
  }

  #[inline]
  fn bump(&self) {
    self.0.state.set(self.0.state.get() + 1);
  }
}

impl fmt::Debug for Vector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Vector")
      .field("id", &self.0.id)
      .field("space_type", &self.0.space_type)
      .field("value", &self.value().as_slice())
      .finish()
  }
}

impl Variable for Vector {
  type Space = VectorSpace;
  type Action = DVector<f64>;

  #[inline]
  fn id(&self) -> VarId {
    self.0.id
  }

  #[inline]
  fn space(&self) -> &VectorSpace {
    &self.0.space
  }

  #[inline]
  fn space_type(&self) -> SpaceType {
    self.0.space_type
  }

  #[inline]
  fn state(&self) -> u64 {
    self.0.state.get()
  }

  fn tlm_root_id(&self) -> Option<VarId> {
    self.0.tlm_root
  }

  fn new_in(space: &VectorSpace, space_type: SpaceType) -> Self {
    Self::with_type(space, space_type)
  }

  fn copy(&self) -> Self {
    Self::build(&self.0.space, self.0.space_type, self.to_dvector(), None)
  }

  fn subtract_action(&mut self, action: &DVector<f64>) {
    self.update(|value| *value -= action);
  }

  /// Seeds every component, so a functional is the sum of its components
  fn seed_action(&self) -> DVector<f64> {
    DVector::from_element(self.len(), -1.0)
  }
}

/// Adjoint of `b` as a vector in the space of `like`
fn adjoint_of(like: &Vector, value: DVector<f64>) -> Vector {
  let adj = Vector::with_type(like.space(), like.space_type());
  adj.set(value);
  adj
}

fn check_len(eq: EqId, expected: usize, actual: usize) -> Result<(), AdjointError> {
  if expected == actual {
    Ok(())
  } else {
    Err(AdjointError::Solve {
      eq,
      message: format!("length mismatch: expected {expected}, got {actual}"),
    })
  }
}

// =============================================================================
// EQUATIONS
// =============================================================================

/// `x = y`
pub struct Assignment {
  id: EqId,
  deps: [Vector; 2],
  chain: Option<DerivativeChain>,
}

impl Assignment {
  pub fn new(ids: &IdGenerator, x: &Vector, y: &Vector) -> Self {
    Self {
      id: ids.eq_id(),
      deps: [x.clone(), y.clone()],
      chain: None,
    }
  }

  pub fn with_chain(mut self, chain: DerivativeChain) -> Self {
    self.chain = Some(chain);
    self
  }
}

impl Equation<Vector> for Assignment {
  fn id(&self) -> EqId {
    self.id
  }

  fn x(&self) -> &[Vector] {
    &self.deps[..1]
  }

  fn dependencies(&self) -> &[Vector] {
    &self.deps
  }

  fn nonlinear_dependencies(&self) -> &[Vector] {
    &[]
  }

  fn derivative_chain(&self) -> Option<&DerivativeChain> {
    self.chain.as_ref()
  }

  fn forward_solve(&self) -> Result<(), AdjointError> {
    let [x, y] = &self.deps;
    check_len(self.id, x.len(), y.len())?;
    x.set(y.to_dvector());
    Ok(())
  }

  fn adjoint_jacobian_solve(
    &self,
    _: Vec<Option<Vector>>,
    b: Vec<Vector>,
  ) -> Result<Vec<Vector>, AdjointError> {
    Ok(b)
  }

  fn adjoint_derivative_action(&self, dep_index: usize, adj_x: &[Vector]) -> Option<DVector<f64>> {
    match dep_index {
      1 => Some(-adj_x[0].to_dvector()),
      _ => None,
    }
  }
}

/// `x = sum_k alpha_k * y_k`
pub struct LinearCombination {
  id: EqId,
  deps: Vec<Vector>,
  alphas: SmallVec<[f64; 4]>,
  adj_ic: bool,
  chain: Option<DerivativeChain>,
}

impl LinearCombination {
  pub fn new(ids: &IdGenerator, x: &Vector, terms: &[(f64, &Vector)]) -> Self {
    let mut deps = Vec::with_capacity(terms.len() + 1);
    deps.push(x.clone());
    deps.extend(terms.iter().map(|(_, y)| (*y).clone()));
    Self {
      id: ids.eq_id(),
      deps,
      alphas: terms.iter().map(|(alpha, _)| *alpha).collect(),
      adj_ic: false,
      chain: None,
    }
  }

  /// Offer the output as an adjoint initial condition
  pub fn with_adjoint_ic(mut self) -> Self {
    self.adj_ic = true;
    self
  }

  pub fn with_chain(mut self, chain: DerivativeChain) -> Self {
    self.chain = Some(chain);
    self
  }
}

impl Equation<Vector> for LinearCombination {
  fn id(&self) -> EqId {
    self.id
  }

  fn x(&self) -> &[Vector] {
    &self.deps[..1]
  }

  fn dependencies(&self) -> &[Vector] {
    &self.deps
  }

  fn nonlinear_dependencies(&self) -> &[Vector] {
    &[]
  }

  fn adjoint_initial_condition_dependencies(&self) -> &[Vector] {
    if self.adj_ic {
      self.x()
    } else {
      &[]
    }
  }

  fn derivative_chain(&self) -> Option<&DerivativeChain> {
    self.chain.as_ref()
  }

  fn forward_solve(&self) -> Result<(), AdjointError> {
    let x = &self.deps[0];
    let mut value = DVector::zeros(x.len());
    for (alpha, y) in self.alphas.iter().zip(&self.deps[1..]) {
      check_len(self.id, x.len(), y.len())?;
      value.axpy(*alpha, &*y.value(), 1.0);
    }
    x.set(value);
    Ok(())
  }

  fn adjoint_jacobian_solve(
    &self,
    _: Vec<Option<Vector>>,
    b: Vec<Vector>,
  ) -> Result<Vec<Vector>, AdjointError> {
    Ok(b)
  }

  fn adjoint_derivative_action(&self, dep_index: usize, adj_x: &[Vector]) -> Option<DVector<f64>> {
    let alpha = *self.alphas.get(dep_index.checked_sub(1)?)?;
    Some(&*adj_x[0].value() * -alpha)
  }
}

/// `x = a ∘ b`, componentwise
pub struct Product {
  id: EqId,
  deps: [Vector; 3],
  chain: Option<DerivativeChain>,
}

impl Product {
  pub fn new(ids: &IdGenerator, x: &Vector, a: &Vector, b: &Vector) -> Self {
    Self {
      id: ids.eq_id(),
      deps: [x.clone(), a.clone(), b.clone()],
      chain: None,
    }
  }

  pub fn with_chain(mut self, chain: DerivativeChain) -> Self {
    self.chain = Some(chain);
    self
  }
}

impl Equation<Vector> for Product {
  fn id(&self) -> EqId {
    self.id
  }

  fn x(&self) -> &[Vector] {
    &self.deps[..1]
  }

  fn dependencies(&self) -> &[Vector] {
    &self.deps
  }

  fn nonlinear_dependencies(&self) -> &[Vector] {
    &self.deps[1..]
  }

  fn derivative_chain(&self) -> Option<&DerivativeChain> {
    self.chain.as_ref()
  }

  fn forward_solve(&self) -> Result<(), AdjointError> {
    let [x, a, b] = &self.deps;
    check_len(self.id, x.len(), a.len())?;
    check_len(self.id, x.len(), b.len())?;
    let value = a.value().component_mul(&*b.value());
    x.set(value);
    Ok(())
  }

  fn adjoint_jacobian_solve(
    &self,
    _: Vec<Option<Vector>>,
    b: Vec<Vector>,
  ) -> Result<Vec<Vector>, AdjointError> {
    Ok(b)
  }

  fn adjoint_derivative_action(&self, dep_index: usize, adj_x: &[Vector]) -> Option<DVector<f64>> {
    // derivative with respect to one factor is the other factor
    let other = match dep_index {
      1 => &self.deps[2],
      2 => &self.deps[1],
      _ => return None,
    };
    Some(-other.value().component_mul(&*adj_x[0].value()))
  }
}

/// `x = y · z`, with `x` of length one
pub struct DotProduct {
  id: EqId,
  deps: [Vector; 3],
  chain: Option<DerivativeChain>,
}

impl DotProduct {
  pub fn new(ids: &IdGenerator, x: &Vector, y: &Vector, z: &Vector) -> Self {
    Self {
      id: ids.eq_id(),
      deps: [x.clone(), y.clone(), z.clone()],
      chain: None,
    }
  }

  pub fn with_chain(mut self, chain: DerivativeChain) -> Self {
    self.chain = Some(chain);
    self
  }
}

impl Equation<Vector> for DotProduct {
  fn id(&self) -> EqId {
    self.id
  }

  fn x(&self) -> &[Vector] {
    &self.deps[..1]
  }

  fn dependencies(&self) -> &[Vector] {
    &self.deps
  }

  fn nonlinear_dependencies(&self) -> &[Vector] {
    &self.deps[1..]
  }

  fn derivative_chain(&self) -> Option<&DerivativeChain> {
    self.chain.as_ref()
  }

  fn forward_solve(&self) -> Result<(), AdjointError> {
    let [x, y, z] = &self.deps;
    check_len(self.id, 1, x.len())?;
    check_len(self.id, y.len(), z.len())?;
    let value = y.value().dot(&*z.value());
    x.set(DVector::from_element(1, value));
    Ok(())
  }

  fn adjoint_jacobian_solve(
    &self,
    _: Vec<Option<Vector>>,
    b: Vec<Vector>,
  ) -> Result<Vec<Vector>, AdjointError> {
    Ok(b)
  }

  fn adjoint_derivative_action(&self, dep_index: usize, adj_x: &[Vector]) -> Option<DVector<f64>> {
    let other = match dep_index {
      1 => &self.deps[2],
      2 => &self.deps[1],
      _ => return None,
    };
    Some(&*other.value() * -adj_x[0].scalar())
  }
}

/// `A x = y` for a constant dense matrix `A`
pub struct LinearSolve {
  id: EqId,
  deps: [Vector; 2],
  matrix: DMatrix<f64>,
  adj_ic: bool,
  chain: Option<DerivativeChain>,
}

impl LinearSolve {
  pub fn new(ids: &IdGenerator, x: &Vector, matrix: DMatrix<f64>, y: &Vector) -> Self {
    Self {
      id: ids.eq_id(),
      deps: [x.clone(), y.clone()],
      matrix,
      adj_ic: false,
      chain: None,
    }
  }

  /// Offer the output as an adjoint initial condition. The direct solver
  /// here has no use for initial guesses, but an earlier solve for the same
  /// variable may.
  pub fn with_adjoint_ic(mut self) -> Self {
    self.adj_ic = true;
    self
  }

  pub fn with_chain(mut self, chain: DerivativeChain) -> Self {
    self.chain = Some(chain);
    self
  }

  fn solve(&self, matrix: DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>, AdjointError> {
    check_len(self.id, matrix.nrows(), rhs.len())?;
    matrix.lu().solve(rhs).ok_or_else(|| AdjointError::Solve {
      eq: self.id,
      message: "singular matrix".to_string(),
    })
  }
}

impl Equation<Vector> for LinearSolve {
  fn id(&self) -> EqId {
    self.id
  }

  fn x(&self) -> &[Vector] {
    &self.deps[..1]
  }

  fn dependencies(&self) -> &[Vector] {
    &self.deps
  }

  fn nonlinear_dependencies(&self) -> &[Vector] {
    &[]
  }

  fn adjoint_initial_condition_dependencies(&self) -> &[Vector] {
    if self.adj_ic {
      self.x()
    } else {
      &[]
    }
  }

  fn derivative_chain(&self) -> Option<&DerivativeChain> {
    self.chain.as_ref()
  }

  fn forward_solve(&self) -> Result<(), AdjointError> {
    let [x, y] = &self.deps;
    let value = self.solve(self.matrix.clone(), &y.value())?;
    check_len(self.id, x.len(), value.len())?;
    x.set(value);
    Ok(())
  }

  fn adjoint_jacobian_solve(
    &self,
    _: Vec<Option<Vector>>,
    b: Vec<Vector>,
  ) -> Result<Vec<Vector>, AdjointError> {
    let value = self.solve(self.matrix.transpose(), &b[0].value())?;
    tracing::trace!(eq = %self.id, "adjoint linear solve");
    Ok(vec![adjoint_of(&b[0], value)])
  }

  fn adjoint_derivative_action(&self, dep_index: usize, adj_x: &[Vector]) -> Option<DVector<f64>> {
    match dep_index {
      1 => Some(-adj_x[0].to_dvector()),
      _ => None,
    }
  }
}
