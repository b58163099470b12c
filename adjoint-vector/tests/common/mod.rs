#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use nalgebra::DVector;

use lib_adjoint_core::{
  AdjointError, DerivativeChain, EqId, Equation, EquationKind, EquationRef, IdGenerator, SpaceType,
  Tape,
};
use lib_adjoint_vector::{LinearCombination, Vector, VectorSpace};

/// Wraps an equation and counts its adjoint solves, and how many of them
/// were handed an initial guess
pub struct Counted {
  inner: EquationRef<Vector>,
  pub solves: Rc<Cell<usize>>,
  pub guesses: Rc<Cell<usize>>,
}

impl Counted {
  pub fn new(inner: impl Equation<Vector> + 'static) -> Self {
    Self {
      inner: Rc::new(inner),
      solves: Rc::new(Cell::new(0)),
      guesses: Rc::new(Cell::new(0)),
    }
  }
}

impl Equation<Vector> for Counted {
  fn id(&self) -> EqId {
    self.inner.id()
  }

  fn kind(&self) -> EquationKind {
    self.inner.kind()
  }

  fn x(&self) -> &[Vector] {
    self.inner.x()
  }

  fn dependencies(&self) -> &[Vector] {
    self.inner.dependencies()
  }

  fn nonlinear_dependencies(&self) -> &[Vector] {
    self.inner.nonlinear_dependencies()
  }

  fn adjoint_initial_condition_dependencies(&self) -> &[Vector] {
    self.inner.adjoint_initial_condition_dependencies()
  }

  fn adj_x_type(&self, m: usize) -> SpaceType {
    self.inner.adj_x_type(m)
  }

  fn derivative_chain(&self) -> Option<&DerivativeChain> {
    self.inner.derivative_chain()
  }

  fn forward_solve(&self) -> Result<(), AdjointError> {
    self.inner.forward_solve()
  }

  fn adjoint_jacobian_solve(
    &self,
    initial_guess: Vec<Option<Vector>>,
    b: Vec<Vector>,
  ) -> Result<Vec<Vector>, AdjointError> {
    self.solves.set(self.solves.get() + 1);
    if initial_guess.iter().any(Option::is_some) {
      self.guesses.set(self.guesses.get() + 1);
    }
    self.inner.adjoint_jacobian_solve(initial_guess, b)
  }

  fn adjoint_derivative_action(
    &self,
    dep_index: usize,
    adj_x: &[Vector],
  ) -> Option<DVector<f64>> {
    self.inner.adjoint_derivative_action(dep_index, adj_x)
  }
}

pub fn total(solves: &[Rc<Cell<usize>>]) -> usize {
  solves.iter().map(|s| s.get()).sum()
}

/// A timestepping run: `x_k = x_{k-1} + c_k`, one block per step
pub struct Steps {
  pub ids: Rc<IdGenerator>,
  pub tape: Tape<Vector>,
  /// `x_0` (the control) to `x_steps`
  pub xs: Vec<Vector>,
  pub solves: Vec<Rc<Cell<usize>>>,
}

impl Steps {
  pub fn record(steps: usize) -> Self {
    let ids = Rc::new(IdGenerator::new());
    let space = VectorSpace::new(&ids, 1);
    let mut xs = vec![Vector::from_vec(&space, vec![1.0])];
    let mut solves = Vec::new();
    let mut tape = Tape::new();
    for k in 1..=steps {
      let x = Vector::new(&space);
      let c = Vector::from_vec(&space, vec![k as f64]);
      let step =
        Counted::new(LinearCombination::new(&ids, &x, &[(1.0, &xs[k - 1]), (1.0, &c)]));
      solves.push(Rc::clone(&step.solves));
      tape.solve(Rc::new(step)).unwrap();
      tape.new_block();
      xs.push(x);
    }
    Self { ids, tape, xs, solves }
  }

  pub fn counts(&self) -> Vec<usize> {
    self.solves.iter().map(|s| s.get()).collect()
  }
}
