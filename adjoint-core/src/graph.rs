//!
//! # Transpose computational graph
//!
//! Built once per set of functionals and controls from a finished tape. It
//! holds:
//!
//! - the reversed dependency map: for every dependency slot `(n, i, j)` the
//!   output `(p, k, m)` of the most recent earlier equation that wrote that
//!   variable. Later writes shadow earlier ones, so an edge always points at
//!   the unique last writer before the read;
//! - per functional, which equations are *active* (must be run forward and
//!   differentiated) and which still need their adjoint *solved* (as opposed
//!   to fetched from a cache). `solved` implies `active`;
//! - which adjoint solutions can serve as initial guesses for earlier adjoint
//!   solves of the same variable.
//!
//! Flags are kept in one dense bit set per functional, indexed by the flat
//! position of an equation on the tape.
//!

use std::ops::Index;

use bit_set::BitSet;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::equation::{Equation, EquationKind, Variable};
use crate::id::VarId;
use crate::rhs::{AdjointModelRhs, DependencyRhs};
use crate::space::SpaceType;
use crate::tape::{OutputPosition, Tape};

/// Which liveness analyses to run when building the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GraphOptions {
  /// Drop equations that cannot be reached from the controls. When off,
  /// every equation is assumed to have externally visible effects.
  pub prune_forward: bool,
  /// Drop equations whose outputs never reach the functional
  pub prune_adjoint: bool,
}

impl GraphOptions {
  pub fn with_prune_forward(mut self, prune_forward: bool) -> Self {
    self.prune_forward = prune_forward;
    self
  }

  pub fn with_prune_adjoint(mut self, prune_adjoint: bool) -> Self {
    self.prune_adjoint = prune_adjoint;
    self
  }
}

impl Default for GraphOptions {
  fn default() -> Self {
    Self {
      prune_forward: true,
      prune_adjoint: true,
    }
  }
}

/// Maps (block, equation) onto a dense index
#[derive(Debug, Clone)]
struct Layout {
  offsets: FxHashMap<usize, (usize, usize)>,
  len: usize,
}

impl Layout {
  fn new<V: Variable>(tape: &Tape<V>) -> Self {
    let mut offsets = FxHashMap::default();
    let mut len = 0;
    for (n, block) in tape.blocks() {
      offsets.insert(n, (len, block.len()));
      len += block.len();
    }
    Self { offsets, len }
  }

  #[inline]
  fn flat(&self, n: usize, i: usize) -> usize {
    match self.offsets.get(&n) {
      Some(&(offset, len)) if i < len => offset + i,
      _ => panic!("equation ({n}, {i}) out of range"),
    }
  }

  fn all(&self) -> BitSet {
    (0..self.len).collect()
  }
}

/// Adjoint space type of output `m` of `eq`
#[inline]
fn adj_x_type<V: Variable>(eq: &dyn Equation<V>, m: usize, x: &V) -> SpaceType {
  x.space_type().relative(eq.adj_x_type(m))
}

fn adj_ic_ids<V: Variable>(eq: &dyn Equation<V>) -> FxHashSet<VarId> {
  eq.adjoint_initial_condition_dependencies()
    .iter()
    .map(V::id)
    .collect()
}

pub struct TransposeComputationalGraph {
  layout: Layout,
  transpose_deps: FxHashMap<OutputPosition, OutputPosition>,
  active: Vec<BitSet>,
  solved: Vec<BitSet>,
  /// (n, i, m) -> (p, k): the adjoint for output m of (n, i) is the initial
  /// guess for the adjoint solve of (p, k)
  stored_adj_ics: FxHashMap<OutputPosition, (usize, usize)>,
  /// Variables whose last write declared an adjoint initial condition
  adj_ics: FxHashMap<VarId, (usize, usize)>,
}

impl TransposeComputationalGraph {
  /// Analyse `tape` for derivatives of each of `js` with respect to `m`
  pub fn new<V: Variable>(js: &[V], m: &[V], tape: &Tape<V>, options: GraphOptions) -> Self {
    let layout = Layout::new(tape);
    let transpose_deps = transpose_edges(tape);

    let active_forward = if options.prune_forward {
      let ic_edges = adjoint_ic_edges(tape, &transpose_deps);
      forward_liveness(tape, m, &layout, &ic_edges)
    } else {
      layout.all()
    };

    let mut active = vec![active_forward.clone(); js.len()];
    if options.prune_adjoint {
      for (j_i, j) in js.iter().enumerate() {
        let active_adjoint = adjoint_liveness(tape, j.id(), &layout, &transpose_deps);
        for (n, block) in tape.blocks() {
          for (i, eq) in block.iter().enumerate() {
            let idx = layout.flat(n, i);
            if !active_adjoint.contains(idx) && eq.kind() != EquationKind::Instruction {
              active[j_i].remove(idx);
            }
          }
        }
      }
    }
    let solved = active.clone();

    let (stored_adj_ics, adj_ics) = adjoint_initial_conditions(tape);

    tracing::debug!(
      equations = layout.len,
      edges = transpose_deps.len(),
      forward_active = active_forward.len(),
      active = ?active.iter().map(BitSet::len).collect::<SmallVec<[usize; 4]>>(),
      "built transpose computational graph"
    );

    Self {
      layout,
      transpose_deps,
      active,
      solved,
      stored_adj_ics,
      adj_ics,
    }
  }

  /// Number of functionals the graph was built for
  #[inline]
  pub fn functionals(&self) -> usize {
    self.active.len()
  }

  /// Whether dependency slot `(n, i, j)` reads a variable produced earlier
  /// on the tape
  #[inline]
  pub fn contains(&self, n: usize, i: usize, j: usize) -> bool {
    self.transpose_deps.contains_key(&(n, i, j))
  }

  /// The producer `(p, k, m)` of the variable read at dependency slot
  /// `(n, i, j)`
  #[inline]
  pub fn get(&self, n: usize, i: usize, j: usize) -> Option<OutputPosition> {
    self.transpose_deps.get(&(n, i, j)).copied()
  }

  #[inline]
  pub fn is_active(&self, j_i: usize, n: usize, i: usize) -> bool {
    self.active[j_i].contains(self.layout.flat(n, i))
  }

  pub fn any_is_active(&self, n: usize, i: usize) -> bool {
    let idx = self.layout.flat(n, i);
    self.active.iter().any(|active| active.contains(idx))
  }

  #[inline]
  pub fn is_solved(&self, j_i: usize, n: usize, i: usize) -> bool {
    self.solved[j_i].contains(self.layout.flat(n, i))
  }

  /// Mark an adjoint as available without solving, e.g. from a cache
  #[inline]
  pub fn set_not_solved(&mut self, j_i: usize, n: usize, i: usize) {
    let idx = self.layout.flat(n, i);
    self.solved[j_i].remove(idx);
  }

  /// Whether the last write of `x` declared an adjoint initial condition,
  /// and that equation's adjoint is still to be solved
  pub fn has_adj_ic(&self, j_i: usize, x: VarId) -> bool {
    match self.adj_ics.get(&x) {
      Some(&(n, i)) => self.is_solved(j_i, n, i),
      None => false,
    }
  }

  /// Whether the adjoint for output `m` of `(n, i)` should be kept as the
  /// initial guess for a later (in reverse order) adjoint solve
  pub fn is_stored_adj_ic(&self, j_i: usize, n: usize, i: usize, m: usize) -> bool {
    match self.stored_adj_ics.get(&(n, i, m)) {
      Some(&(p, k)) => self.is_solved(j_i, p, k),
      None => false,
    }
  }

  /// The right-hand-sides that the adjoint of equation `(n, i)` contributes
  /// to. Slots whose producer is not solved are left out, their
  /// contribution would never be used.
  pub fn adj_bs<'a, V: Variable>(
    &self,
    j_i: usize,
    n: usize,
    i: usize,
    eq: &dyn Equation<V>,
    rhs: &'a mut AdjointModelRhs<V>,
  ) -> DependencyRhs<'a, V> {
    let slots = (0..eq.dependencies().len())
      .filter_map(|j| {
        let (p, k, m) = self.get(n, i, j)?;
        self.is_solved(j_i, p, k).then_some((j, (p, k, m)))
      })
      .collect();
    DependencyRhs::new(rhs, slots)
  }
}

impl Index<OutputPosition> for TransposeComputationalGraph {
  type Output = OutputPosition;

  fn index(&self, key: OutputPosition) -> &Self::Output {
    match self.transpose_deps.get(&key) {
      Some(pos) => pos,
      None => panic!("no transpose dependency for {key:?}"),
    }
  }
}

/// Forward traversal: link every read to the last earlier write
fn transpose_edges<V: Variable>(tape: &Tape<V>) -> FxHashMap<OutputPosition, OutputPosition> {
  let mut last_eq: FxHashMap<VarId, OutputPosition> = FxHashMap::default();
  let mut edges = FxHashMap::default();
  for (n, block) in tape.blocks() {
    for (i, eq) in block.iter().enumerate() {
      for (m, x) in eq.x().iter().enumerate() {
        last_eq.insert(x.id(), (n, i, m));
      }
      for (j, dep) in eq.dependencies().iter().enumerate() {
        if let Some(&(p, k, m)) = last_eq.get(&dep.id()) {
          // the equation's own outputs lead its dependencies, skip them
          if (p, k) != (n, i) {
            edges.insert((n, i, j), (p, k, m));
          }
        }
      }
    }
  }
  edges
}

/// Reverse traversal: the primary edges plus edges from a later write of a
/// variable to an earlier write that declared it as an adjoint initial
/// condition
fn adjoint_ic_edges<V: Variable>(
  tape: &Tape<V>,
  transpose_deps: &FxHashMap<OutputPosition, OutputPosition>,
) -> FxHashMap<OutputPosition, OutputPosition> {
  let mut edges = transpose_deps.clone();
  let mut last_eq: FxHashMap<VarId, (SpaceType, OutputPosition)> = FxHashMap::default();
  for (p, block) in tape.blocks().rev() {
    for (k, eq) in block.iter().enumerate().rev() {
      let eq = eq.as_ref();
      let adj_ic_ids = adj_ic_ids(eq);
      for (m, x) in eq.x().iter().enumerate() {
        let x_type = adj_x_type(eq, m, x);
        let x_id = x.id();
        if adj_ic_ids.contains(&x_id) {
          if let Some(&(later_type, (n, i, j))) = last_eq.get(&x_id) {
            if later_type == x_type {
              debug_assert!(n > p || (n == p && i > k));
              edges.insert((n, i, j), (p, k, m));
            }
          }
        }
        // outputs lead the dependencies, so output m is dependency slot m
        last_eq.insert(x_id, (x_type, (p, k, m)));
      }
    }
  }
  edges
}

/// Forward traversal: which equations are needed to get from the controls to
/// anything downstream
fn forward_liveness<V: Variable>(
  tape: &Tape<V>,
  m: &[V],
  layout: &Layout,
  ic_edges: &FxHashMap<OutputPosition, OutputPosition>,
) -> BitSet {
  let mut active_m: FxHashSet<VarId> = m.iter().map(V::id).collect();
  let mut active = BitSet::with_capacity(layout.len);
  for (n, block) in tape.blocks() {
    for (i, eq) in block.iter().enumerate() {
      let idx = layout.flat(n, i);
      if eq.kind() == EquationKind::Instruction {
        active.insert(idx);
      }
      if !active_m.is_empty() && eq.x().iter().any(|x| active_m.contains(&x.id())) {
        // a control is only picked up by its first writer
        for x in eq.x() {
          active_m.remove(&x.id());
        }
        active.insert(idx);
      }
      if !active.contains(idx) {
        let reached = (0..eq.dependencies().len()).any(|j| {
          ic_edges
            .get(&(n, i, j))
            .is_some_and(|&(p, k, _)| active.contains(layout.flat(p, k)))
        });
        if reached {
          active.insert(idx);
        }
      }
    }
  }
  active
}

/// Reverse traversal: which equations feed the functional `j`. The search
/// starts at the last equation writing `j`.
fn adjoint_liveness<V: Variable>(
  tape: &Tape<V>,
  j: VarId,
  layout: &Layout,
  transpose_deps: &FxHashMap<OutputPosition, OutputPosition>,
) -> BitSet {
  let mut searching = true;
  let mut active = BitSet::with_capacity(layout.len);
  for (n, block) in tape.blocks().rev() {
    for (i, eq) in block.iter().enumerate().rev() {
      let idx = layout.flat(n, i);
      if searching && eq.x().iter().any(|x| x.id() == j) {
        searching = false;
        active.insert(idx);
      }
      if active.contains(idx) {
        for dep in 0..eq.dependencies().len() {
          if let Some(&(p, k, _)) = transpose_deps.get(&(n, i, dep)) {
            active.insert(layout.flat(p, k));
          }
        }
      }
    }
  }
  active
}

type StoredAdjointIcs = FxHashMap<OutputPosition, (usize, usize)>;
type AdjointIcs = FxHashMap<VarId, (usize, usize)>;

/// Forward traversal: chain up writes of the same variable whose adjoints
/// can be reused as initial guesses for one another
fn adjoint_initial_conditions<V: Variable>(tape: &Tape<V>) -> (StoredAdjointIcs, AdjointIcs) {
  let mut stored = FxHashMap::default();
  let mut adj_ics = FxHashMap::default();
  let mut last_eq: FxHashMap<VarId, (SpaceType, (usize, usize))> = FxHashMap::default();
  for (n, block) in tape.blocks() {
    for (i, eq) in block.iter().enumerate() {
      let eq = eq.as_ref();
      let adj_ic_ids = adj_ic_ids(eq);
      for (m, x) in eq.x().iter().enumerate() {
        let x_type = adj_x_type(eq, m, x);
        let x_id = x.id();
        if let Some(&(earlier_type, (p, k))) = last_eq.get(&x_id) {
          if earlier_type == x_type {
            stored.insert((n, i, m), (p, k));
          }
        }
        if adj_ic_ids.contains(&x_id) {
          adj_ics.insert(x_id, (n, i));
          last_eq.insert(x_id, (x_type, (n, i)));
        } else {
          adj_ics.remove(&x_id);
          last_eq.remove(&x_id);
        }
      }
    }
  }
  (stored, adj_ics)
}
