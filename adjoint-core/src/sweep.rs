//!
//! # Adjoint sweep
//!
//! Drives a reverse pass over a recorded tape. The tape is augmented with a
//! [`ControlsMarker`] in block `0` (recorded blocks shift up by one), the
//! transpose graph and the cache are prepared, and then every functional's
//! right-hand-sides are unwound from the last equation to the first. The
//! marker's adjoint is the derivative with respect to the controls.
//!

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::cache::AdjointCache;
use crate::equation::{ControlsMarker, Variable};
use crate::error::AdjointError;
use crate::graph::{GraphOptions, TransposeComputationalGraph};
use crate::id::{IdGenerator, VarId};
use crate::rhs::AdjointModelRhs;
use crate::space::SpaceType;
use crate::tape::{Block, EquationRef, Tape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GradientOptions {
  pub graph: GraphOptions,
  /// Only derivatives with fewer adjoint directions than this are cached.
  /// `None` caches everything, `Some(0)` nothing.
  pub cache_degree: Option<usize>,
  /// Cache every solved adjoint, not only those shared with another slot
  pub store_adjoint: bool,
}

impl GradientOptions {
  pub fn with_graph(mut self, graph: GraphOptions) -> Self {
    self.graph = graph;
    self
  }

  pub fn with_cache_degree(mut self, cache_degree: Option<usize>) -> Self {
    self.cache_degree = cache_degree;
    self
  }

  pub fn with_store_adjoint(mut self, store_adjoint: bool) -> Self {
    self.store_adjoint = store_adjoint;
    self
  }
}

/// The tape as seen by the sweep: controls first, then every recorded block
pub fn with_controls<V: Variable + 'static>(
  ids: &IdGenerator,
  tape: &Tape<V>,
  m: &[V],
) -> Result<Tape<V>, AdjointError> {
  let marker: EquationRef<V> = Rc::new(ControlsMarker::new(ids, m.to_vec()));
  let mut augmented = Tape::new();
  augmented.insert_block(0, Block::from_equations(vec![marker])?);
  for (n, block) in tape.blocks() {
    augmented.insert_block(n + 1, block.clone());
  }
  Ok(augmented)
}

/// Derivatives of each of `js` with respect to each of `m`.
///
/// `result[j_i][k]` is the derivative of `js[j_i]` with respect to `m[k]`, in
/// the space conjugate dual to `m[k]`. Values already in `cache` from an
/// earlier call for the same derivatives are reused instead of solved.
pub fn compute_gradient<V: Variable + 'static>(
  ids: &IdGenerator,
  tape: &Tape<V>,
  js: &[V],
  m: &[V],
  cache: &mut AdjointCache<V>,
  options: &GradientOptions,
) -> Result<Vec<Vec<V>>, AdjointError> {
  let tape = with_controls(ids, tape, m)?;
  let mut graph = TransposeComputationalGraph::new(js, m, &tape, options.graph);
  cache.initialize(js, &tape, &mut graph, options.cache_degree)?;

  let mut rhs: Vec<AdjointModelRhs<V>> = Vec::with_capacity(js.len());
  for j in js {
    let pos = tape
      .last_writer(j.id())
      .ok_or(AdjointError::FunctionalNotOnTape { var: j.id() })?;
    let mut b = AdjointModelRhs::new(&tape);
    b[pos].sub(Some(&j.seed_action()));
    rhs.push(b);
  }

  // adjoint solutions kept as initial guesses, by forward variable
  let mut adj_ics: Vec<FxHashMap<VarId, V>> = vec![FxHashMap::default(); js.len()];
  let mut gradient: Vec<Option<Vec<V>>> = vec![None; js.len()];

  for (n, block) in tape.blocks().rev() {
    for (i, eq) in block.iter().enumerate().rev() {
      let any_active = graph.any_is_active(n, i);
      for j_i in 0..js.len() {
        let Some((pos, b)) = rhs[j_i].pop() else {
          continue;
        };
        debug_assert_eq!(pos, (n, i), "right-hand-sides out of step with the tape");
        if !any_active {
          continue;
        }

        let adj_x = if graph.is_solved(j_i, n, i) {
          let guess: Vec<Option<V>> = eq.x().iter().map(|x| adj_ics[j_i].remove(&x.id())).collect();
          if b.is_empty() && guess.iter().all(Option::is_none) {
            tracing::trace!(functional = j_i, block = n, equation = i, "zero adjoint");
            // aliases still need a value
            cache.cache((j_i, n, i), &eq.new_adj_x(), false, false);
            continue;
          }
          tracing::trace!(
            functional = j_i,
            block = n,
            equation = i,
            eq = %eq.id(),
            "solving adjoint"
          );
          let mut dep_bs = graph.adj_bs(j_i, n, i, eq.as_ref(), &mut rhs[j_i]);
          let adj_x = eq.adjoint(guess, b.into_bs(), &mut dep_bs)?;
          cache.cache((j_i, n, i), &adj_x, true, options.store_adjoint);
          adj_x
        } else if graph.is_active(j_i, n, i) {
          let adj_x = cache
            .get((j_i, n, i), false)
            .ok_or(AdjointError::MissingCachedAdjoint {
              eq: eq.id(),
              functional: j_i,
              block: n,
              equation: i,
            })?;
          tracing::trace!(functional = j_i, block = n, equation = i, "cached adjoint");
          let mut dep_bs = graph.adj_bs(j_i, n, i, eq.as_ref(), &mut rhs[j_i]);
          eq.subtract_adjoint_derivative_actions(&adj_x, &mut dep_bs);
          // a root slot served from the cache still feeds its aliases
          cache.cache((j_i, n, i), &adj_x, false, false);
          adj_x
        } else {
          continue;
        };

        for (m, (x, adj)) in eq.x().iter().zip(&adj_x).enumerate() {
          if graph.is_stored_adj_ic(j_i, n, i, m) {
            adj_ics[j_i].insert(x.id(), adj.copy());
          }
        }

        if n == 0 {
          gradient[j_i] = Some(adj_x);
        }
      }
    }
  }

  let zero = || -> Vec<V> {
    m.iter()
      .map(|m| V::new_in(m.space(), m.space_type().relative(SpaceType::ConjugateDual)))
      .collect()
  };
  Ok(gradient.into_iter().map(|dj| dj.unwrap_or_else(zero)).collect())
}
