//!
//! Which derivative each adjoint computes.
//!
//! A tangent-linear equation is tagged with the root equation it was derived
//! from and the ordered chain of directions used to derive it. Running the
//! adjoint of such an equation for a functional `J` computes a mixed
//! derivative: part of the chain is handled in tangent-linear mode, the rest
//! by the adjoint. [`functional_derivative_chains`] lists, for every chain
//! seen on the tape, which functionals pair with it and what is left over for
//! the adjoint.
//!

use std::collections::BTreeMap;
use std::hash::Hash;

use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::equation::{DirectionKey, EquationKind, TlmKey, Variable};
use crate::id::VarId;
use crate::tape::Tape;

/// Derivative bookkeeping for a set of functionals
pub struct FunctionalChains<V> {
  /// The functional actually differentiated by the adjoint for each `J_i`
  pub roots: Vec<V>,
  /// Tangent-linear chain of an equation -> `(J_i, adjoint chain)` pairs
  pub tlm_adj: FxHashMap<TlmKey, Vec<(usize, TlmKey)>>,
}

impl<V: Variable> FunctionalChains<V> {
  /// Id of the original functional behind `J_i`
  pub fn root_id(&self, j_i: usize) -> VarId {
    let root = &self.roots[j_i];
    root.tlm_root_id().unwrap_or_else(|| root.id())
  }
}

/// Walk the tape backwards, pairing each functional with the derivative chains
/// of the equation that computes it.
///
/// Only adjoint chains shorter than `max_adjoint_degree` are listed.
pub fn functional_derivative_chains<V: Variable>(
  js: &[V],
  tape: &Tape<V>,
  max_adjoint_degree: Option<usize>,
) -> FunctionalChains<V> {
  let mut roots = js.to_vec();
  let mut root_ids: FxHashMap<VarId, VarId> = js.iter().map(|j| (j.id(), j.id())).collect();
  let mut remaining: BTreeMap<usize, VarId> = js.iter().map(V::id).enumerate().collect();
  let mut tlm_adj: FxHashMap<TlmKey, Vec<(usize, TlmKey)>> = FxHashMap::default();

  'blocks: for (_, block) in tape.blocks().rev() {
    for eq in block.iter().rev() {
      match eq.kind() {
        EquationKind::ControlsMarker => continue,
        EquationKind::FunctionalMarker => {
          let (j, j_root) = match eq.dependencies() {
            [j, j_root, ..] => (j, j_root),
            _ => continue,
          };
          if let Some(root_id) = root_ids.get_mut(&j.id()) {
            debug_assert_eq!(*root_id, j.id(), "functional re-rooted twice");
            *root_id = j_root.id();
            for (j_i, _) in js.iter().enumerate().filter(|(_, js_j)| js_j.id() == j.id()) {
              roots[j_i] = j_root.clone();
            }
          }
          continue;
        }
        EquationKind::Regular | EquationKind::Instruction => {}
      }

      let x_ids: FxHashSet<VarId> = eq.x().iter().map(V::id).collect();
      let key: &[DirectionKey] = match eq.derivative_chain() {
        Some(chain) => &chain.key,
        None => &[],
      };

      let found: SmallVec<[usize; 4]> = remaining
        .iter()
        .filter(|(_, j_id)| x_ids.contains(&root_ids[*j_id]))
        .map(|(&j_i, _)| j_i)
        .collect();

      for j_i in found {
        remaining.remove(&j_i);
        let degree = max_adjoint_degree.map_or(key.len() + 1, |max| max.min(key.len() + 1));
        for size in (key.len() + 1 - degree)..=key.len() {
          for ks in distinct_combinations_indices(key, size) {
            let tlm_key: TlmKey = ks.iter().map(|&k| key[k].clone()).collect();
            let adj_key: TlmKey = (0..key.len())
              .filter(|k| !ks.contains(k))
              .map(|k| key[k].clone())
              .collect();
            tlm_adj.entry(tlm_key).or_default().push((j_i, adj_key));
          }
        }
      }

      if remaining.is_empty() {
        break 'blocks;
      }
    }
  }

  FunctionalChains { roots, tlm_adj }
}

/// Index combinations of size `r`, in lexicographic order, keeping only the
/// first combination for each distinct (ordered) tuple of values
fn distinct_combinations_indices<T: Eq + Hash>(
  values: &[T],
  r: usize,
) -> Vec<SmallVec<[usize; 4]>> {
  let mut seen: FxHashSet<SmallVec<[&T; 4]>> = FxHashSet::default();
  (0..values.len())
    .combinations(r)
    .filter(|idx| seen.insert(idx.iter().map(|&k| &values[k]).collect()))
    .map(SmallVec::from_vec)
    .collect()
}

#[cfg(test)]
mod tests {
  use std::rc::Rc;

  use smallvec::smallvec;

  use super::*;
  use crate::equation::{DerivativeChain, Equation, FunctionalMarker};
  use crate::testing::{eq, ids, Affine, Scalar};

  fn direction(ids: &Rc<crate::id::IdGenerator>) -> DirectionKey {
    DirectionKey::new(&[Scalar::new(ids)], &[Scalar::new(ids)])
  }

  #[test]
  fn combinations_skip_repeated_values() {
    let combos = |values: &[char], r| -> Vec<Vec<usize>> {
      distinct_combinations_indices(values, r)
        .into_iter()
        .map(|c| c.to_vec())
        .collect()
    };
    // (a, b) and (b, a) are different tuples
    assert_eq!(combos(&['a', 'b', 'a'], 2), vec![vec![0, 1], vec![0, 2], vec![1, 2]]);
    // the second (a, b) is dropped
    assert_eq!(combos(&['a', 'a', 'b'], 2), vec![vec![0, 1], vec![0, 2]]);
    assert_eq!(combos(&['a', 'a', 'a'], 2), vec![vec![0, 1]]);
    assert_eq!(combos(&['a', 'b'], 0), vec![Vec::<usize>::new()]);
    assert!(combos(&['a'], 2).is_empty());
  }

  #[test]
  fn plain_functional_pairs_with_the_empty_chain() {
    let ids = ids();
    let (a, j) = (Scalar::new(&ids), Scalar::new(&ids));
    let mut tape = Tape::new();
    tape.push(eq(&ids, &a, &[])).unwrap();
    tape.push(eq(&ids, &j, &[&a])).unwrap();

    let chains = functional_derivative_chains(&[j.clone(), j.clone()], &tape, None);
    assert_eq!(chains.tlm_adj.len(), 1);
    assert_eq!(chains.tlm_adj[&TlmKey::new()], vec![(0, TlmKey::new()), (1, TlmKey::new())]);
    assert_eq!(chains.root_id(1), j.id());
  }

  #[test]
  fn first_order_chain_splits_between_tangent_and_adjoint() {
    let ids = ids();
    let (j, tlm_j) = (Scalar::new(&ids), Scalar::tangent_of(&ids, &Scalar::new(&ids)));
    let root = Affine::new(&ids, &j, &[]);
    let d = direction(&ids);
    let tlm = Affine::new(&ids, &tlm_j, &[]).with_chain(DerivativeChain {
      root: root.id(),
      key: smallvec![d.clone()],
    });
    let mut tape: Tape<Scalar> = Tape::new();
    tape.push(Rc::new(root)).unwrap();
    tape.push(Rc::new(tlm)).unwrap();

    let chains = functional_derivative_chains(&[tlm_j.clone()], &tape, None);
    let key: TlmKey = smallvec![d.clone()];
    // adjoint of the tangent-linear equation: first derivative of J, tlm part done
    assert_eq!(chains.tlm_adj[&key], vec![(0, TlmKey::new())]);
    // adjoint of the root equation: the same derivative, computed by the adjoint
    assert_eq!(chains.tlm_adj[&TlmKey::new()], vec![(0, key)]);
    assert_eq!(chains.root_id(0), tlm_j.tlm_root_id().unwrap());

    let chains = functional_derivative_chains(&[tlm_j], &tape, Some(1));
    assert!(!chains.tlm_adj.contains_key(&TlmKey::new()));
  }

  #[test]
  fn functional_markers_reroot() {
    let ids = ids();
    let (j, j_root) = (Scalar::new(&ids), Scalar::new(&ids));
    let mut tape = Tape::new();
    tape.push(eq(&ids, &j_root, &[])).unwrap();
    tape.push(eq(&ids, &j, &[&j_root])).unwrap();
    tape.push(Rc::new(FunctionalMarker::new(&ids, j.clone(), j_root.clone()))).unwrap();

    let chains = functional_derivative_chains(&[j.clone()], &tape, None);
    assert_eq!(chains.roots[0].id(), j_root.id());
    assert_eq!(chains.root_id(0), j_root.id());
    assert_eq!(chains.tlm_adj[&TlmKey::new()], vec![(0, TlmKey::new())]);
  }
}
