//! Minimal scalar backend for unit tests.

use std::cell::Cell;
use std::rc::Rc;

use crate::equation::{DerivativeChain, Equation, Variable};
use crate::error::AdjointError;
use crate::id::{EqId, IdGenerator, VarId};
use crate::space::SpaceType;
use crate::tape::EquationRef;

pub fn ids() -> Rc<IdGenerator> {
  Rc::new(IdGenerator::new())
}

struct ScalarInner {
  id: VarId,
  ids: Rc<IdGenerator>,
  space_type: SpaceType,
  value: Cell<f64>,
  state: Cell<u64>,
  tlm_root: Option<VarId>,
}

#[derive(Clone)]
pub struct Scalar(Rc<ScalarInner>);

impl Scalar {
  pub fn new(ids: &Rc<IdGenerator>) -> Self {
    Self::with_type(ids, SpaceType::Primal)
  }

  pub fn with_type(ids: &Rc<IdGenerator>, space_type: SpaceType) -> Self {
    Self(Rc::new(ScalarInner {
      id: ids.var_id(),
      ids: Rc::clone(ids),
      space_type,
      value: Cell::new(0.0),
      state: Cell::new(0),
      tlm_root: None,
    }))
  }

  pub fn tangent_of(ids: &Rc<IdGenerator>, root: &Scalar) -> Self {
    Self(Rc::new(ScalarInner {
      id: ids.var_id(),
      ids: Rc::clone(ids),
      space_type: SpaceType::Primal,
      value: Cell::new(0.0),
      state: Cell::new(0),
      tlm_root: Some(root.id()),
    }))
  }

  pub fn value(&self) -> f64 {
    self.0.value.get()
  }

  pub fn set(&self, value: f64) {
    self.0.value.set(value);
    self.0.state.set(self.0.state.get() + 1);
  }
}

impl Variable for Scalar {
  type Space = Rc<IdGenerator>;
  type Action = f64;

  fn id(&self) -> VarId {
    self.0.id
  }

  fn space(&self) -> &Self::Space {
    &self.0.ids
  }

  fn space_type(&self) -> SpaceType {
    self.0.space_type
  }

  fn state(&self) -> u64 {
    self.0.state.get()
  }

  fn tlm_root_id(&self) -> Option<VarId> {
    self.0.tlm_root
  }

  fn new_in(space: &Self::Space, space_type: SpaceType) -> Self {
    Self::with_type(space, space_type)
  }

  fn copy(&self) -> Self {
    let copy = Self::with_type(&self.0.ids, self.0.space_type);
    copy.0.value.set(self.value());
    copy
  }

  fn subtract_action(&mut self, action: &f64) {
    self.set(self.value() - action);
  }

  fn seed_action(&self) -> f64 {
    -1.0
  }
}

/// `x[0] = sum_j coeffs[j] * deps[j + len(x)]`, with adjoint solves counted
pub struct Affine {
  id: EqId,
  x: Vec<Scalar>,
  deps: Vec<Scalar>,
  coeffs: Vec<f64>,
  adj_ic: Vec<Scalar>,
  adj_types: Vec<SpaceType>,
  chain: Option<DerivativeChain>,
  pub solves: Rc<Cell<usize>>,
}

impl Affine {
  pub fn raw(ids: &IdGenerator, x: Vec<Scalar>, deps: Vec<Scalar>) -> Self {
    let coeffs = vec![1.0; deps.len().saturating_sub(x.len())];
    let adj_types = vec![SpaceType::ConjugateDual; x.len()];
    Self {
      id: ids.eq_id(),
      x,
      deps,
      coeffs,
      adj_ic: Vec::new(),
      adj_types,
      chain: None,
      solves: Rc::new(Cell::new(0)),
    }
  }

  pub fn new(ids: &IdGenerator, x: &Scalar, terms: &[(f64, &Scalar)]) -> Self {
    let mut deps = vec![x.clone()];
    deps.extend(terms.iter().map(|(_, y)| (*y).clone()));
    let mut eq = Self::raw(ids, vec![x.clone()], deps);
    eq.coeffs = terms.iter().map(|(alpha, _)| *alpha).collect();
    eq
  }

  pub fn with_adjoint_ic(mut self) -> Self {
    self.adj_ic = self.x.clone();
    self
  }

  pub fn with_adj_type(mut self, m: usize, space_type: SpaceType) -> Self {
    self.adj_types[m] = space_type;
    self
  }

  pub fn with_chain(mut self, chain: DerivativeChain) -> Self {
    self.chain = Some(chain);
    self
  }
}

impl Equation<Scalar> for Affine {
  fn id(&self) -> EqId {
    self.id
  }

  fn x(&self) -> &[Scalar] {
    &self.x
  }

  fn dependencies(&self) -> &[Scalar] {
    &self.deps
  }

  fn nonlinear_dependencies(&self) -> &[Scalar] {
    &[]
  }

  fn adjoint_initial_condition_dependencies(&self) -> &[Scalar] {
    &self.adj_ic
  }

  fn adj_x_type(&self, m: usize) -> SpaceType {
    self.adj_types[m]
  }

  fn derivative_chain(&self) -> Option<&DerivativeChain> {
    self.chain.as_ref()
  }

  fn forward_solve(&self) -> Result<(), AdjointError> {
    let offset = self.x.len();
    let value = self
      .coeffs
      .iter()
      .zip(&self.deps[offset..])
      .map(|(alpha, y)| alpha * y.value())
      .sum();
    self.x[0].set(value);
    Ok(())
  }

  fn adjoint_jacobian_solve(
    &self,
    _: Vec<Option<Scalar>>,
    b: Vec<Scalar>,
  ) -> Result<Vec<Scalar>, AdjointError> {
    self.solves.set(self.solves.get() + 1);
    Ok(b)
  }

  fn adjoint_derivative_action(&self, dep_index: usize, adj_x: &[Scalar]) -> Option<f64> {
    let offset = self.x.len();
    if dep_index < offset {
      return None;
    }
    Some(-self.coeffs[dep_index - offset] * adj_x[0].value())
  }
}

/// Shorthand: `x = sum(deps)`
pub fn eq(ids: &IdGenerator, x: &Scalar, deps: &[&Scalar]) -> EquationRef<Scalar> {
  let terms: Vec<(f64, &Scalar)> = deps.iter().map(|y| (1.0, *y)).collect();
  Rc::new(Affine::new(ids, x, &terms))
}
