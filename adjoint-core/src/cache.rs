//!
//! # Adjoint cache
//!
//! Keeps adjoint solutions between sweeps, keyed by `(J_i, n, i)`: functional
//! index, block, equation. The cache is only valid for one set of requested
//! derivatives. [`AdjointCache::initialize`] compares the set against the one
//! seen last time and starts over when it changed.
//!
//! Within one request, several slots can hold the very same derivative, e.g.
//! when a functional is requested twice or when a tangent-linear equation and
//! its root equation both end up computing the same first derivative of one
//! functional. For each root equation, the first slot found (walking the tape
//! backwards) for a given derivative becomes the *root slot*; the others are
//! registered as its *aliases*. Root slots are solved by the sweep and push
//! their value into the aliases, which are never solved themselves.
//!

use std::rc::Rc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::equation::{DirectionKey, EquationKind, TlmKey, Variable};
use crate::error::AdjointError;
use crate::graph::TransposeComputationalGraph;
use crate::id::{EqId, VarId};
use crate::tangent::functional_derivative_chains;
use crate::tape::Tape;

/// `(J_i, n, i)`: functional index, block, equation
pub type Slot = (usize, usize, usize);

/// A derivative of an original functional: its id and the chain of
/// directions handled by the adjoint
type DerivativeKey = (VarId, TlmKey);

#[derive(Clone)]
struct Entry<V> {
  values: Rc<[V]>,
  states: SmallVec<[u64; 2]>,
}

impl<V: Variable> Entry<V> {
  fn new(values: Rc<[V]>) -> Self {
    let states = values.iter().map(V::state).collect();
    Self { values, states }
  }

  #[inline]
  fn check(&self) {
    debug_assert!(
      self.values.iter().zip(&self.states).all(|(v, &state)| v.state() == state),
      "cached adjoint modified in place"
    );
  }
}

pub struct AdjointCache<V> {
  cache: FxHashMap<Slot, Entry<V>>,
  /// root slot -> aliases sharing its value
  keys: FxHashMap<Slot, Vec<Slot>>,
  cache_key: Option<Vec<DerivativeKey>>,
}

impl<V: Variable> AdjointCache<V> {
  pub fn new() -> Self {
    Self {
      cache: FxHashMap::default(),
      keys: FxHashMap::default(),
      cache_key: None,
    }
  }

  /// Number of slots holding a value
  #[inline]
  pub fn len(&self) -> usize {
    self.cache.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.cache.is_empty()
  }

  #[inline]
  pub fn contains(&self, slot: Slot) -> bool {
    self.cache.contains_key(&slot)
  }

  /// Drop every value and forget the derivative set
  pub fn clear(&mut self) {
    self.cache.clear();
    self.keys.clear();
    self.cache_key = None;
  }

  /// The cached adjoint for `slot`. With `copy` the caller gets detached
  /// copies it may modify, otherwise handles on the cached values.
  pub fn get(&self, slot: Slot, copy: bool) -> Option<Vec<V>> {
    let entry = self.cache.get(&slot)?;
    entry.check();
    Some(Self::values(&entry.values, copy))
  }

  /// The shared value itself; aliases of one root slot return the same `Rc`
  pub fn get_shared(&self, slot: Slot) -> Option<Rc<[V]>> {
    let entry = self.cache.get(&slot)?;
    entry.check();
    Some(Rc::clone(&entry.values))
  }

  pub fn pop(&mut self, slot: Slot, copy: bool) -> Option<Vec<V>> {
    let entry = self.cache.remove(&slot)?;
    entry.check();
    Some(Self::values(&entry.values, copy))
  }

  /// Returns whether a value was present
  pub fn remove(&mut self, slot: Slot) -> bool {
    self.cache.remove(&slot).is_some()
  }

  fn values(values: &[V], copy: bool) -> Vec<V> {
    if copy {
      values.iter().map(V::copy).collect()
    } else {
      values.to_vec()
    }
  }

  /// Offer a freshly solved adjoint for `slot`.
  ///
  /// Only root slots take part. The value goes to every alias, and to `slot`
  /// itself when `store` is set. A value already cached for `slot` wins over
  /// `adj_x`.
  pub fn cache(&mut self, slot: Slot, adj_x: &[V], copy: bool, store: bool) {
    let Some(aliases) = self.keys.get(&slot) else {
      return;
    };
    if !store && aliases.is_empty() {
      return;
    }

    let entry = match self.cache.get(&slot) {
      Some(entry) => entry.clone(),
      None => Entry::new(Self::values(adj_x, copy).into()),
    };
    for &alias in aliases {
      self.cache.insert(alias, entry.clone());
    }
    if store {
      self.cache.insert(slot, entry);
    }
  }

  /// Prepare for a sweep computing derivatives of `js` on `tape`.
  ///
  /// Clears the cache if the requested derivatives differ from last time,
  /// registers root slots and aliases, and marks every slot that is cached
  /// or aliased as not to be solved in `graph`. Only derivatives with fewer
  /// than `cache_degree` adjoint directions are cached; `Some(0)` disables
  /// caching altogether.
  pub fn initialize(
    &mut self,
    js: &[V],
    tape: &Tape<V>,
    graph: &mut TransposeComputationalGraph,
    cache_degree: Option<usize>,
  ) -> Result<(), AdjointError> {
    let chains = functional_derivative_chains(js, tape, cache_degree);
    let root_ids: SmallVec<[VarId; 4]> = (0..js.len()).map(|j_i| chains.root_id(j_i)).collect();

    let mut pairs: Vec<(usize, TlmKey)> = chains.tlm_adj.values().flatten().cloned().collect();
    pairs.sort();
    let cache_key: Vec<DerivativeKey> = pairs
      .into_iter()
      .map(|(j_i, adj_key)| (root_ids[j_i], adj_key))
      .collect();

    if self.cache_key.as_ref() != Some(&cache_key) {
      if !self.cache.is_empty() {
        tracing::debug!(
          entries = self.cache.len(),
          "derivative set changed, clearing adjoint cache"
        );
      }
      self.clear();
    }
    self.keys.clear();
    self.cache_key = None;

    if cache_degree != Some(0) {
      self.cache_key = Some(cache_key);

      // root equation -> slots computing some derivative of it
      let mut eqs: FxHashMap<EqId, Vec<(Slot, DerivativeKey)>> = FxHashMap::default();
      for (n, block) in tape.blocks().rev() {
        for (i, eq) in block.iter().enumerate().rev() {
          if matches!(eq.kind(), EquationKind::ControlsMarker | EquationKind::FunctionalMarker) {
            continue;
          }
          let root_eq = eq.derivative_chain().map_or(eq.id(), |chain| chain.root);
          let key: &[DirectionKey] = match eq.derivative_chain() {
            Some(chain) => &chain.key,
            None => &[],
          };

          for (j_i, adj_key) in chains.tlm_adj.get(key).into_iter().flatten() {
            let slot = (*j_i, n, i);
            if graph.is_solved(*j_i, n, i) || self.cache.contains_key(&slot) {
              debug_assert!(cache_degree.map_or(true, |degree| adj_key.len() < degree));
              eqs
                .entry(root_eq)
                .or_default()
                .push((slot, (root_ids[*j_i], adj_key.clone())));
            }
          }

          // the root equation precedes its derivatives, so every slot is known
          let mut eq_root: FxHashMap<DerivativeKey, Slot> = FxHashMap::default();
          for (slot, key) in eqs.remove(&eq.id()).unwrap_or_default() {
            let (j_i, n, i) = slot;
            debug_assert!(graph.is_solved(j_i, n, i) || self.cache.contains_key(&slot));
            match eq_root.get(&key) {
              Some(&root) => {
                self.keys.entry(root).or_default().push(slot);
                // a value already cached in an alias serves the root slot too
                if !self.cache.contains_key(&root) {
                  if let Some(entry) = self.cache.get(&slot).cloned() {
                    self.cache.insert(root, entry);
                  }
                }
              }
              None => {
                eq_root.insert(key, slot);
                self.keys.insert(slot, Vec::new());
              }
            }
          }
        }
      }

      if let Some(&eq) = eqs.keys().next() {
        return Err(AdjointError::MalformedTape { eq });
      }
    }

    for &(j_i, n, i) in self.cache.keys() {
      graph.set_not_solved(j_i, n, i);
    }
    for &(j_i, n, i) in self.keys.values().flatten() {
      graph.set_not_solved(j_i, n, i);
    }

    tracing::debug!(
      cached = self.cache.len(),
      roots = self.keys.len(),
      aliases = self.keys.values().map(Vec::len).sum::<usize>(),
      "initialized adjoint cache"
    );
    Ok(())
  }
}

impl<V: Variable> Default for AdjointCache<V> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use std::rc::Rc;

  use smallvec::smallvec;

  use super::*;
  use crate::equation::{DerivativeChain, Equation};
  use crate::graph::GraphOptions;
  use crate::testing::{eq, ids, Affine, Scalar};

  fn no_pruning() -> GraphOptions {
    GraphOptions::default()
      .with_prune_forward(false)
      .with_prune_adjoint(false)
  }

  fn chain(ids: &Rc<crate::id::IdGenerator>) -> (Tape<Scalar>, Scalar, Scalar) {
    let (a, j) = (Scalar::new(ids), Scalar::new(ids));
    let mut tape = Tape::new();
    tape.push(eq(ids, &a, &[])).unwrap();
    tape.push(eq(ids, &j, &[&a])).unwrap();
    (tape, a, j)
  }

  mod storage {
    use super::*;

    #[test]
    fn unknown_slots_are_ignored() {
      let ids = ids();
      let mut cache = AdjointCache::new();
      cache.cache((0, 0, 0), &[Scalar::new(&ids)], true, true);
      assert!(cache.is_empty());
    }

    #[test]
    fn root_without_aliases_stores_only_on_request() {
      let ids = ids();
      let (tape, _, j) = chain(&ids);
      let mut graph = TransposeComputationalGraph::new(&[j.clone()], &[], &tape, no_pruning());
      let mut cache = AdjointCache::new();
      cache.initialize(&[j.clone()], &tape, &mut graph, None).unwrap();

      let adj = Scalar::new(&ids);
      adj.set(2.0);
      cache.cache((0, 0, 1), &[adj.clone()], true, false);
      assert!(cache.is_empty());
      cache.cache((0, 0, 1), &[adj.clone()], true, true);
      assert_eq!(cache.len(), 1);

      let copy = cache.get((0, 0, 1), true).unwrap();
      assert_ne!(copy[0].id(), adj.id());
      assert_eq!(copy[0].value(), 2.0);
      // copied on the way in, so later writes do not leak into the cache
      adj.set(3.0);
      assert_eq!(cache.get((0, 0, 1), false).unwrap()[0].value(), 2.0);
    }

    #[test]
    fn pop_and_remove() {
      let ids = ids();
      let (tape, _, j) = chain(&ids);
      let mut graph = TransposeComputationalGraph::new(&[j.clone()], &[], &tape, no_pruning());
      let mut cache = AdjointCache::new();
      cache.initialize(&[j.clone()], &tape, &mut graph, None).unwrap();
      cache.cache((0, 0, 0), &[Scalar::new(&ids)], false, true);
      cache.cache((0, 0, 1), &[Scalar::new(&ids)], false, true);

      assert!(cache.pop((0, 0, 0), true).is_some());
      assert!(!cache.contains((0, 0, 0)));
      assert!(cache.remove((0, 0, 1)));
      assert!(!cache.remove((0, 0, 1)));
      assert!(cache.pop((0, 0, 1), false).is_none());
    }
  }

  mod sharing {
    use super::*;

    #[test]
    fn repeated_functional_aliases_the_first() {
      let ids = ids();
      let (tape, _, j) = chain(&ids);
      let js = [j.clone(), j.clone()];
      let mut graph = TransposeComputationalGraph::new(&js, &[], &tape, no_pruning());
      let mut cache = AdjointCache::new();
      cache.initialize(&js, &tape, &mut graph, None).unwrap();

      for i in 0..2 {
        assert!(graph.is_solved(0, 0, i));
        assert!(!graph.is_solved(1, 0, i));
        assert!(graph.is_active(1, 0, i));
      }

      cache.cache((0, 0, 1), &[Scalar::new(&ids)], true, false);
      assert!(!cache.contains((0, 0, 1)));
      assert!(cache.contains((1, 0, 1)));

      cache.cache((0, 0, 1), &[Scalar::new(&ids)], true, true);
      let root = cache.get_shared((0, 0, 1)).unwrap();
      let alias = cache.get_shared((1, 0, 1)).unwrap();
      assert!(Rc::ptr_eq(&root, &alias));
    }

    #[test]
    fn tangent_and_root_equations_share_a_first_derivative() {
      let ids = ids();
      let (m, j) = (Scalar::new(&ids), Scalar::new(&ids));
      let (tlm_m, tlm_j) = (Scalar::tangent_of(&ids, &m), Scalar::tangent_of(&ids, &j));
      let d = DirectionKey::new(&[m.clone()], &[Scalar::new(&ids)]);

      let root_m = Affine::new(&ids, &m, &[]);
      let root_j = Affine::new(&ids, &j, &[(1.0, &m)]);
      let tlm_root_m = root_m.id();
      let tlm_root_j = root_j.id();
      let mut tape: Tape<Scalar> = Tape::new();
      tape.push(Rc::new(root_m)).unwrap();
      tape.push(Rc::new(root_j)).unwrap();
      tape
        .push(Rc::new(Affine::new(&ids, &tlm_m, &[]).with_chain(DerivativeChain {
          root: tlm_root_m,
          key: smallvec![d.clone()],
        })))
        .unwrap();
      tape
        .push(Rc::new(Affine::new(&ids, &tlm_j, &[(1.0, &tlm_m)]).with_chain(DerivativeChain {
          root: tlm_root_j,
          key: smallvec![d.clone()],
        })))
        .unwrap();

      // J and dJ/dm.d: the adjoint for J of the root equations and the
      // adjoint for dJ/dm.d of the tangent equations hold the same values
      let js = [j.clone(), tlm_j.clone()];
      let mut graph = TransposeComputationalGraph::new(&js, &[], &tape, no_pruning());
      let mut cache = AdjointCache::new();
      cache.initialize(&js, &tape, &mut graph, None).unwrap();

      assert!(graph.is_solved(1, 0, 3) && graph.is_solved(1, 0, 2));
      assert!(!graph.is_solved(0, 0, 1) && !graph.is_solved(0, 0, 0));
      // the root equations still have their own second-order adjoint for dJ/dm.d
      assert!(graph.is_solved(1, 0, 1) && graph.is_solved(1, 0, 0));

      cache.cache((1, 0, 3), &[Scalar::new(&ids)], true, false);
      assert!(cache.contains((0, 0, 1)));
    }

    #[test]
    fn derivative_before_its_root_is_malformed() {
      let ids = ids();
      let (j, tlm_j) = (Scalar::new(&ids), Scalar::tangent_of(&ids, &Scalar::new(&ids)));
      let root = Affine::new(&ids, &j, &[]);
      let tlm = Affine::new(&ids, &tlm_j, &[]).with_chain(DerivativeChain {
        root: root.id(),
        key: smallvec![DirectionKey::new(&[Scalar::new(&ids)], &[Scalar::new(&ids)])],
      });
      let mut tape: Tape<Scalar> = Tape::new();
      tape.push(Rc::new(tlm)).unwrap();
      tape.push(Rc::new(root)).unwrap();

      let js = [tlm_j];
      let mut graph = TransposeComputationalGraph::new(&js, &[], &tape, no_pruning());
      let mut cache = AdjointCache::new();
      let result = cache.initialize(&js, &tape, &mut graph, None);
      assert!(matches!(result, Err(AdjointError::MalformedTape { .. })));
    }
  }

  mod invalidation {
    use super::*;

    #[test]
    fn same_derivatives_keep_values_and_skip_solves() {
      let ids = ids();
      let (tape, _, j) = chain(&ids);
      let mut cache = AdjointCache::new();
      let mut graph = TransposeComputationalGraph::new(&[j.clone()], &[], &tape, no_pruning());
      cache.initialize(&[j.clone()], &tape, &mut graph, None).unwrap();
      cache.cache((0, 0, 1), &[Scalar::new(&ids)], true, true);

      let mut graph = TransposeComputationalGraph::new(&[j.clone()], &[], &tape, no_pruning());
      cache.initialize(&[j.clone()], &tape, &mut graph, None).unwrap();
      assert!(cache.contains((0, 0, 1)));
      assert!(!graph.is_solved(0, 0, 1));
      assert!(graph.is_solved(0, 0, 0));
    }

    #[test]
    fn different_derivatives_clear() {
      let ids = ids();
      let (tape, a, j) = chain(&ids);
      let mut cache = AdjointCache::new();
      let mut graph = TransposeComputationalGraph::new(&[j.clone()], &[], &tape, no_pruning());
      cache.initialize(&[j.clone()], &tape, &mut graph, None).unwrap();
      cache.cache((0, 0, 1), &[Scalar::new(&ids)], true, true);

      let mut graph = TransposeComputationalGraph::new(&[a.clone()], &[], &tape, no_pruning());
      cache.initialize(&[a.clone()], &tape, &mut graph, None).unwrap();
      assert!(cache.is_empty());
      assert!(graph.is_solved(0, 0, 1));
    }

    #[test]
    fn permuted_functionals_clear() {
      let ids = ids();
      let (tape, a, j) = chain(&ids);
      let mut cache = AdjointCache::new();
      let js = [j.clone(), a.clone()];
      let mut graph = TransposeComputationalGraph::new(&js, &[], &tape, no_pruning());
      cache.initialize(&js, &tape, &mut graph, None).unwrap();
      cache.cache((0, 0, 1), &[Scalar::new(&ids)], true, true);

      let js = [a.clone(), j.clone()];
      let mut graph = TransposeComputationalGraph::new(&js, &[], &tape, no_pruning());
      cache.initialize(&js, &tape, &mut graph, None).unwrap();
      assert!(cache.is_empty());
    }

    #[test]
    fn zero_degree_disables_caching() {
      let ids = ids();
      let (tape, _, j) = chain(&ids);
      let js = [j.clone(), j.clone()];
      let mut cache = AdjointCache::new();
      let mut graph = TransposeComputationalGraph::new(&js, &[], &tape, no_pruning());
      cache.initialize(&js, &tape, &mut graph, Some(0)).unwrap();
      assert!(graph.is_solved(1, 0, 1));
      cache.cache((0, 0, 1), &[Scalar::new(&ids)], true, true);
      assert!(cache.is_empty());
    }
  }
}
