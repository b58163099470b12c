use std::rc::Rc;

use nalgebra::dmatrix;

use lib_adjoint::vector::{DotProduct, LinearCombination, LinearSolve, Vector, VectorSpace};
use lib_adjoint::{compute_gradient, AdjointCache, AdjointError, GradientOptions, IdGenerator, Tape};

fn main() -> Result<(), AdjointError> {
  let ids = Rc::new(IdGenerator::new());
  let space = VectorSpace::new(&ids, 2);

  // Implicit Euler for du/dt = -A u, starting from the control u0
  let dt = 0.1;
  let a = dmatrix![2.0, -1.0; -1.0, 2.0];
  let step = nalgebra::DMatrix::identity(2, 2) + a * dt;

  let u0 = Vector::from_vec(&space, vec![1.0, 0.5]);
  let mut tape = Tape::new();
  let mut u = u0.clone();
  for _ in 0..10 {
    let u_next = Vector::new(&space);
    tape.solve(Rc::new(LinearSolve::new(&ids, &u_next, step.clone(), &u).with_adjoint_ic()))?;
    tape.new_block();
    u = u_next;
  }

  // J = |u_N|^2, through a copy since a dot product needs distinct inputs
  let v = Vector::new(&space);
  let j = Vector::new(&VectorSpace::new(&ids, 1));
  tape.solve(Rc::new(LinearCombination::new(&ids, &v, &[(1.0, &u)])))?;
  tape.solve(Rc::new(DotProduct::new(&ids, &j, &u, &v)))?;

  let mut cache = AdjointCache::new();
  let options = GradientOptions::default().with_store_adjoint(true);
  let dj = compute_gradient(&ids, &tape, &[j.clone()], &[u0.clone()], &mut cache, &options)?;
  println!("J = {}, dJ/du0 = {:?}", j.scalar(), dj[0][0].value().as_slice());

  // a second request for the same derivative is served from the cache
  let dj = compute_gradient(&ids, &tape, &[j.clone()], &[u0], &mut cache, &options)?;
  println!("cached: dJ/du0 = {:?} ({} adjoints cached)", dj[0][0].value().as_slice(), cache.len());
  Ok(())
}
