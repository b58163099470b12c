//!
//! Adjoint right-hand-side accumulators.
//!
//! The hierarchy has the same shape as the tape: an [`AdjointModelRhs`] holds
//! one [`AdjointBlockRhs`] per block, which holds one [`AdjointEquationRhs`]
//! per equation, which holds one [`AdjointRhs`] per equation output. Storage is
//! only allocated when something is actually accumulated, so "empty" means
//! "nothing was ever added", not "the value is zero".
//!

use std::ops::{Index, IndexMut};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::equation::{Equation, Variable};
use crate::space::SpaceType;
use crate::tape::{Block, OutputPosition, Tape};

/// Right-hand-side of the adjoint equation for one forward variable `x`
pub struct AdjointRhs<V: Variable> {
  space: V::Space,
  space_type: SpaceType,
  b: Option<V>,
}

impl<V: Variable> AdjointRhs<V> {
  pub fn new(x: &V) -> Self {
    Self {
      space: x.space().clone(),
      space_type: x.space_type().relative(SpaceType::ConjugateDual),
      b: None,
    }
  }

  /// Space type of the accumulated value, conjugate dual to `x`
  #[inline]
  pub fn space_type(&self) -> SpaceType {
    self.space_type
  }

  /// Allocate storage if it isn't there yet
  pub fn initialize(&mut self) -> &mut V {
    let (space, space_type) = (&self.space, self.space_type);
    self.b.get_or_insert_with(|| V::new_in(space, space_type))
  }

  /// The live accumulated value
  pub fn b(&mut self) -> &V {
    self.initialize()
  }

  /// A copy of the accumulated value
  pub fn b_copy(&mut self) -> V {
    self.initialize().copy()
  }

  /// Take the accumulated value, allocating a zero one if nothing was added
  pub fn into_b(self) -> V {
    let Self { space, space_type, b } = self;
    b.unwrap_or_else(|| V::new_in(&space, space_type))
  }

  /// Subtract a term; `None` is a zero term and leaves the storage alone
  pub fn sub(&mut self, term: Option<&V::Action>) {
    if let Some(term) = term {
      self.initialize().subtract_action(term);
    }
  }

  /// True iff nothing has ever been added
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.b.is_none()
  }
}

/// Right-hand-sides for every output of one equation
pub struct AdjointEquationRhs<V: Variable> {
  rhs: SmallVec<[AdjointRhs<V>; 1]>,
}

impl<V: Variable> AdjointEquationRhs<V> {
  pub fn new(eq: &dyn Equation<V>) -> Self {
    Self {
      rhs: eq.x().iter().map(AdjointRhs::new).collect(),
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.rhs.len()
  }

  /// The single right-hand-side of a one-output equation
  pub fn b(&mut self) -> &V {
    assert_eq!(self.rhs.len(), 1, "equation has {} outputs", self.rhs.len());
    self.rhs[0].b()
  }

  /// All right-hand-sides, live or copied
  pub fn bs(&mut self, copy: bool) -> Vec<V> {
    self
      .rhs
      .iter_mut()
      .map(|rhs| if copy { rhs.b_copy() } else { rhs.b().clone() })
      .collect()
  }

  pub fn into_bs(self) -> Vec<V> {
    self.rhs.into_iter().map(AdjointRhs::into_b).collect()
  }

  /// True iff every output's right-hand-side is empty
  pub fn is_empty(&self) -> bool {
    self.rhs.iter().all(AdjointRhs::is_empty)
  }

  #[inline]
  pub fn get_mut(&mut self, m: usize) -> Option<&mut AdjointRhs<V>> {
    self.rhs.get_mut(m)
  }
}

impl<V: Variable> Index<usize> for AdjointEquationRhs<V> {
  type Output = AdjointRhs<V>;

  fn index(&self, m: usize) -> &Self::Output {
    &self.rhs[m]
  }
}

impl<V: Variable> IndexMut<usize> for AdjointEquationRhs<V> {
  fn index_mut(&mut self, m: usize) -> &mut Self::Output {
    &mut self.rhs[m]
  }
}

/// Right-hand-sides for every equation in a block
pub struct AdjointBlockRhs<V: Variable> {
  rhs: Vec<AdjointEquationRhs<V>>,
}

impl<V: Variable> AdjointBlockRhs<V> {
  pub fn new(block: &Block<V>) -> Self {
    Self {
      rhs: block
        .iter()
        .map(|eq| AdjointEquationRhs::new(eq.as_ref()))
        .collect(),
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.rhs.len()
  }

  /// True iff no equations are left
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.rhs.is_empty()
  }

  /// Remove the last equation's right-hand-sides, with its index
  pub fn pop(&mut self) -> Option<(usize, AdjointEquationRhs<V>)> {
    let rhs = self.rhs.pop()?;
    Some((self.rhs.len(), rhs))
  }

  #[inline]
  pub fn get_mut(&mut self, i: usize) -> Option<&mut AdjointEquationRhs<V>> {
    self.rhs.get_mut(i)
  }
}

impl<V: Variable> Index<usize> for AdjointBlockRhs<V> {
  type Output = AdjointEquationRhs<V>;

  fn index(&self, i: usize) -> &Self::Output {
    &self.rhs[i]
  }
}

impl<V: Variable> IndexMut<usize> for AdjointBlockRhs<V> {
  fn index_mut(&mut self, i: usize) -> &mut Self::Output {
    &mut self.rhs[i]
  }
}

impl<V: Variable> Index<(usize, usize)> for AdjointBlockRhs<V> {
  type Output = AdjointRhs<V>;

  fn index(&self, (i, m): (usize, usize)) -> &Self::Output {
    &self.rhs[i][m]
  }
}

impl<V: Variable> IndexMut<(usize, usize)> for AdjointBlockRhs<V> {
  fn index_mut(&mut self, (i, m): (usize, usize)) -> &mut Self::Output {
    &mut self.rhs[i][m]
  }
}

/// Right-hand-sides for a whole tape.
///
/// Blocks are consumed from the back by [`AdjointModelRhs::pop`]. Whenever the
/// last block runs out of equations it is dropped, so the last retained block
/// always has at least one equation left.
pub struct AdjointModelRhs<V: Variable> {
  blocks_n: Vec<usize>,
  blocks: FxHashMap<usize, AdjointBlockRhs<V>>,
}

impl<V: Variable> AdjointModelRhs<V> {
  pub fn new(tape: &Tape<V>) -> Self {
    let blocks_n = tape.block_indices();
    let blocks = tape
      .blocks()
      .map(|(n, block)| (n, AdjointBlockRhs::new(block)))
      .collect();
    let mut rhs = Self { blocks_n, blocks };
    rhs.pop_empty();
    rhs
  }

  /// Remove the last equation's right-hand-sides, with its (block, equation)
  pub fn pop(&mut self) -> Option<((usize, usize), AdjointEquationRhs<V>)> {
    let n = *self.blocks_n.last()?;
    let popped = self.blocks.get_mut(&n).and_then(AdjointBlockRhs::pop);
    self.pop_empty();
    popped.map(|(i, rhs)| ((n, i), rhs))
  }

  fn pop_empty(&mut self) {
    while let Some(&n) = self.blocks_n.last() {
      if !self.blocks.get(&n).is_some_and(AdjointBlockRhs::is_empty) {
        break;
      }
      self.blocks.remove(&n);
      self.blocks_n.pop();
    }
  }

  /// True iff no blocks are left
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.blocks.is_empty()
  }

  /// Index of the last retained block
  #[inline]
  pub fn last_block(&self) -> Option<usize> {
    self.blocks_n.last().copied()
  }

  #[inline]
  pub fn get_mut(&mut self, n: usize) -> Option<&mut AdjointBlockRhs<V>> {
    self.blocks.get_mut(&n)
  }

  /// Non-panicking access to the right-hand-side of output `m` of equation
  /// `i` in block `n`
  pub fn get_rhs_mut(&mut self, (n, i, m): OutputPosition) -> Option<&mut AdjointRhs<V>> {
    self
      .blocks
      .get_mut(&n)
      .and_then(|block| block.get_mut(i))
      .and_then(|eq| eq.get_mut(m))
  }

  fn block(&self, n: usize) -> &AdjointBlockRhs<V> {
    match self.blocks.get(&n) {
      Some(block) => block,
      None => panic!("block {n} out of range"),
    }
  }

  fn block_mut(&mut self, n: usize) -> &mut AdjointBlockRhs<V> {
    match self.blocks.get_mut(&n) {
      Some(block) => block,
      None => panic!("block {n} out of range"),
    }
  }
}

impl<V: Variable> Index<usize> for AdjointModelRhs<V> {
  type Output = AdjointBlockRhs<V>;

  fn index(&self, n: usize) -> &Self::Output {
    self.block(n)
  }
}

impl<V: Variable> IndexMut<usize> for AdjointModelRhs<V> {
  fn index_mut(&mut self, n: usize) -> &mut Self::Output {
    self.block_mut(n)
  }
}

impl<V: Variable> Index<(usize, usize)> for AdjointModelRhs<V> {
  type Output = AdjointEquationRhs<V>;

  fn index(&self, (n, i): (usize, usize)) -> &Self::Output {
    &self.block(n)[i]
  }
}

impl<V: Variable> IndexMut<(usize, usize)> for AdjointModelRhs<V> {
  fn index_mut(&mut self, (n, i): (usize, usize)) -> &mut Self::Output {
    &mut self.block_mut(n)[i]
  }
}

impl<V: Variable> Index<OutputPosition> for AdjointModelRhs<V> {
  type Output = AdjointRhs<V>;

  fn index(&self, (n, i, m): OutputPosition) -> &Self::Output {
    &self.block(n)[(i, m)]
  }
}

impl<V: Variable> IndexMut<OutputPosition> for AdjointModelRhs<V> {
  fn index_mut(&mut self, (n, i, m): OutputPosition) -> &mut Self::Output {
    &mut self.block_mut(n)[(i, m)]
  }
}

/// The right-hand-sides that one equation's adjoint contributes to, keyed by
/// dependency slot. Only slots whose producer still has to be solved are
/// present; everything else would be thrown away anyway.
pub struct DependencyRhs<'a, V: Variable> {
  rhs: &'a mut AdjointModelRhs<V>,
  slots: SmallVec<[(usize, OutputPosition); 4]>,
}

impl<'a, V: Variable> DependencyRhs<'a, V> {
  pub(crate) fn new(
    rhs: &'a mut AdjointModelRhs<V>,
    slots: SmallVec<[(usize, OutputPosition); 4]>,
  ) -> Self {
    Self { rhs, slots }
  }

  /// Dependency slots present, ascending
  pub fn slots(&self) -> SmallVec<[usize; 4]> {
    self.slots.iter().map(|&(j, _)| j).collect()
  }

  /// The producer position a dependency slot feeds into
  pub fn position(&self, j: usize) -> Option<OutputPosition> {
    self
      .slots
      .iter()
      .find(|&&(slot, _)| slot == j)
      .map(|&(_, pos)| pos)
  }

  pub fn get_mut(&mut self, j: usize) -> Option<&mut AdjointRhs<V>> {
    let pos = self.position(j)?;
    self.rhs.get_rhs_mut(pos)
  }

  /// Subtract a term from the right-hand-side fed by slot `j`
  pub fn sub(&mut self, j: usize, term: Option<&V::Action>) {
    if let Some(rhs) = self.get_mut(j) {
      rhs.sub(term);
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.slots.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }
}
