//!
//! The tape: the forward computational graph, as blocks of equations.
//!
//! Blocks are keyed by an integer index and visited in ascending order, so a
//! tape may be contiguous (`0..n`) or sparse. Equations are never mutated once
//! recorded; derivative passes only ever read the tape.
//!

use std::collections::BTreeMap;
use std::ops::Index;
use std::rc::Rc;

use rustc_hash::FxHashSet;

use crate::equation::{Equation, Variable};
use crate::error::AdjointError;
use crate::id::VarId;

/// Shared handle on a recorded equation
pub type EquationRef<V> = Rc<dyn Equation<V>>;

/// Position of an output: (block, equation, output slot)
pub type OutputPosition = (usize, usize, usize);

/// An ordered sequence of equations, e.g. one timestep
pub struct Block<V> {
  equations: Vec<EquationRef<V>>,
}

impl<V: Variable> Block<V> {
  pub fn new() -> Self {
    Self {
      equations: Vec::new(),
    }
  }

  /// Build a block, checking every equation
  pub fn from_equations(equations: Vec<EquationRef<V>>) -> Result<Self, AdjointError> {
    for eq in &equations {
      validate(eq.as_ref())?;
    }
    Ok(Self { equations })
  }

  pub fn push(&mut self, eq: EquationRef<V>) -> Result<usize, AdjointError> {
    validate(eq.as_ref())?;
    self.equations.push(eq);
    Ok(self.equations.len() - 1)
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.equations.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.equations.is_empty()
  }

  #[inline]
  pub fn get(&self, i: usize) -> Option<&EquationRef<V>> {
    self.equations.get(i)
  }

  pub fn iter(&self) -> impl DoubleEndedIterator<Item = &EquationRef<V>> + ExactSizeIterator {
    self.equations.iter()
  }
}

impl<V: Variable> Default for Block<V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<V> Clone for Block<V> {
  fn clone(&self) -> Self {
    Self {
      equations: self.equations.clone(),
    }
  }
}

impl<V> Index<usize> for Block<V> {
  type Output = EquationRef<V>;

  fn index(&self, i: usize) -> &Self::Output {
    &self.equations[i]
  }
}

/// Check the structural contract the transpose graph relies on: dependencies
/// are distinct, and the outputs lead them
fn validate<V: Variable>(eq: &dyn Equation<V>) -> Result<(), AdjointError> {
  let x = eq.x();
  let deps = eq.dependencies();

  if deps.len() < x.len() || x.iter().zip(deps).any(|(x, dep)| x.id() != dep.id()) {
    return Err(AdjointError::OutputsNotLeadingDependencies { eq: eq.id() });
  }

  let mut seen = FxHashSet::default();
  for dep in deps {
    if !seen.insert(dep.id()) {
      return Err(AdjointError::DuplicateDependency {
        eq: eq.id(),
        var: dep.id(),
      });
    }
  }

  Ok(())
}

/// Record of a forward computation.
///
/// New equations go into the last block. After [`Tape::new_block`] the next
/// recorded equation opens a fresh block, so a trailing empty block is never
/// kept around.
pub struct Tape<V> {
  pub(crate) blocks: BTreeMap<usize, Block<V>>,
  open: bool,
}

impl<V: Variable> Tape<V> {
  pub fn new() -> Self {
    Self {
      blocks: BTreeMap::new(),
      open: false,
    }
  }

  /// Record an equation without solving it
  pub fn push(&mut self, eq: EquationRef<V>) -> Result<(usize, usize), AdjointError> {
    validate(eq.as_ref())?;
    let n = match (self.open, self.blocks.last_key_value()) {
      (true, Some((&n, _))) => n,
      (_, last) => {
        self.open = true;
        last.map_or(0, |(&n, _)| n + 1)
      }
    };
    let block = self.blocks.entry(n).or_default();
    block.equations.push(eq);
    Ok((n, block.len() - 1))
  }

  /// Solve an equation forward, then record it
  pub fn solve(&mut self, eq: EquationRef<V>) -> Result<(usize, usize), AdjointError> {
    validate(eq.as_ref())?;
    eq.forward_solve()?;
    self.push(eq)
  }

  /// Close the current block
  pub fn new_block(&mut self) {
    self.open = false;
  }

  /// Put a block at index `n`, replacing whatever was there. Empty blocks
  /// are not kept, and any block already at `n` is then removed.
  pub fn insert_block(&mut self, n: usize, block: Block<V>) -> Option<Block<V>> {
    self.open = false;
    if block.is_empty() {
      self.blocks.remove(&n)
    } else {
      self.blocks.insert(n, block)
    }
  }

  pub fn remove_block(&mut self, n: usize) -> Option<Block<V>> {
    let last = self.blocks.last_key_value().map(|(&n, _)| n);
    if last == Some(n) {
      self.open = false;
    }
    self.blocks.remove(&n)
  }

  #[inline]
  pub fn block(&self, n: usize) -> Option<&Block<V>> {
    self.blocks.get(&n)
  }

  #[inline]
  pub fn get(&self, n: usize, i: usize) -> Option<&EquationRef<V>> {
    self.blocks.get(&n).and_then(|block| block.get(i))
  }

  /// Blocks in tape order
  pub fn blocks(&self) -> impl DoubleEndedIterator<Item = (usize, &Block<V>)> {
    self.blocks.iter().map(|(&n, block)| (n, block))
  }

  /// Block indices in tape order
  pub fn block_indices(&self) -> Vec<usize> {
    self.blocks.keys().copied().collect()
  }

  /// Number of (non-empty) blocks
  #[inline]
  pub fn len(&self) -> usize {
    self.blocks.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.blocks.is_empty()
  }

  pub fn equation_count(&self) -> usize {
    self.blocks.values().map(Block::len).sum()
  }

  /// The most recent equation to produce `var`, as (block, equation, output)
  pub fn last_writer(&self, var: VarId) -> Option<OutputPosition> {
    for (&n, block) in self.blocks.iter().rev() {
      for (i, eq) in block.iter().enumerate().rev() {
        if let Some(m) = eq.x().iter().position(|x| x.id() == var) {
          return Some((n, i, m));
        }
      }
    }
    None
  }
}

impl<V: Variable> Default for Tape<V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<V> Clone for Tape<V> {
  fn clone(&self) -> Self {
    Self {
      blocks: self.blocks.clone(),
      open: self.open,
    }
  }
}
