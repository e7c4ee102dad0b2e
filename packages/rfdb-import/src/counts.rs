//! Relationship counts keys and per-aggregator accumulation arenas.
//!
//! A key is `(start selector, type selector, end selector)` where a label
//! selector is either `Any` or one label of the endpoint's label set. For a
//! relationship `(s, t, e)` the counted keys are the full cross product
//!
//! ```text
//! ({Any} ∪ labels(s)) × {Any, t} × ({Any} ∪ labels(e))
//! ```
//!
//! so every wildcard key equals the sum of its specific-label constituents
//! and the planner can answer "relationships of type R between any :A and
//! any :B" with a point lookup.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::labels::LabelId;

// ── Selectors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LabelSelector {
    Any,
    Label(LabelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TypeSelector {
    Any,
    Type(u32),
}

/// Key of one relationship count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CountsKey {
    pub start: LabelSelector,
    pub rel_type: TypeSelector,
    pub end: LabelSelector,
}

impl CountsKey {
    pub fn new(start: LabelSelector, rel_type: TypeSelector, end: LabelSelector) -> Self {
        Self { start, rel_type, end }
    }

    /// Fully specific key `(:start)-[:rel_type]->(:end)`.
    pub fn specific(start: LabelId, rel_type: u32, end: LabelId) -> Self {
        Self::new(
            LabelSelector::Label(start),
            TypeSelector::Type(rel_type),
            LabelSelector::Label(end),
        )
    }

    /// `()-[]->()`: every relationship.
    pub fn all() -> Self {
        Self::new(LabelSelector::Any, TypeSelector::Any, LabelSelector::Any)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelSelector::Any => write!(f, "()"),
            LabelSelector::Label(id) => write!(f, "(:{id})"),
        }
    }
}

impl fmt::Display for CountsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rel_type {
            TypeSelector::Any => write!(f, "{}-[]->{}", self.start, self.end),
            TypeSelector::Type(t) => write!(f, "{}-[:{t}]->{}", self.start, self.end),
        }
    }
}

/// Every key a relationship `(labels(s), t, labels(e))` contributes to.
pub fn enumerate_keys(starts: &[LabelId], rel_type: u32, ends: &[LabelId]) -> Vec<CountsKey> {
    let start_sel = selectors(starts);
    let end_sel = selectors(ends);
    let types = [TypeSelector::Any, TypeSelector::Type(rel_type)];

    let mut keys = Vec::with_capacity(start_sel.len() * 2 * end_sel.len());
    for &s in &start_sel {
        for &t in &types {
            for &e in &end_sel {
                keys.push(CountsKey::new(s, t, e));
            }
        }
    }
    keys
}

fn selectors(labels: &[LabelId]) -> Vec<LabelSelector> {
    std::iter::once(LabelSelector::Any)
        .chain(labels.iter().map(|&l| LabelSelector::Label(l)))
        .collect()
}

// ── CountsArena ─────────────────────────────────────────────────────

/// Private accumulation storage of one aggregator.
///
/// Dense when `(L+2) × (T+2) × (L+2)` cells fit `dense_cell_limit`
/// (L = highest label id, T = highest type id, slot 0 = `Any`), sparse
/// otherwise. Callers validate ids against the bounds before recording.
#[derive(Debug)]
pub enum CountsArena {
    Dense(DenseArena),
    Sparse(HashMap<CountsKey, i64>),
}

#[derive(Debug)]
pub struct DenseArena {
    label_dim: usize,
    type_dim: usize,
    cells: Vec<i64>,
}

impl CountsArena {
    pub fn new(
        high_label_id: u32,
        high_relationship_type_id: u32,
        dense_cell_limit: usize,
    ) -> Self {
        let label_dim = high_label_id as usize + 2;
        let type_dim = high_relationship_type_id as usize + 2;
        let cells = label_dim
            .checked_mul(type_dim)
            .and_then(|n| n.checked_mul(label_dim));

        match cells {
            Some(n) if n <= dense_cell_limit => CountsArena::Dense(DenseArena {
                label_dim,
                type_dim,
                cells: vec![0; n],
            }),
            _ => CountsArena::Sparse(HashMap::new()),
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, CountsArena::Dense(_))
    }

    /// Add `delta` to every key the relationship contributes to.
    pub fn record(&mut self, starts: &[LabelId], rel_type: u32, ends: &[LabelId], delta: i64) {
        match self {
            CountsArena::Dense(arena) => arena.record(starts, rel_type, ends, delta),
            CountsArena::Sparse(map) => {
                for key in enumerate_keys(starts, rel_type, ends) {
                    *map.entry(key).or_insert(0) += delta;
                }
            }
        }
    }

    pub fn get(&self, key: &CountsKey) -> i64 {
        match self {
            CountsArena::Dense(arena) => arena.index(key).map_or(0, |idx| arena.cells[idx]),
            CountsArena::Sparse(map) => map.get(key).copied().unwrap_or(0),
        }
    }

    /// Remove and return every non-zero delta. The arena is empty afterwards.
    pub fn drain(&mut self) -> Vec<(CountsKey, i64)> {
        match self {
            CountsArena::Dense(arena) => arena.drain(),
            CountsArena::Sparse(map) => {
                let mut out: Vec<_> = map.drain().filter(|&(_, d)| d != 0).collect();
                out.sort_unstable_by_key(|&(k, _)| k);
                out
            }
        }
    }
}

impl DenseArena {
    #[inline]
    fn cell(&self, s: usize, t: usize, e: usize) -> usize {
        (s * self.type_dim + t) * self.label_dim + e
    }

    /// Cell of `key`, or None if any selector lies outside the arena bounds.
    fn index(&self, key: &CountsKey) -> Option<usize> {
        let s = label_slot(key.start);
        let t = match key.rel_type {
            TypeSelector::Any => 0,
            TypeSelector::Type(id) => id as usize + 1,
        };
        let e = label_slot(key.end);
        if s >= self.label_dim || t >= self.type_dim || e >= self.label_dim {
            return None;
        }
        Some(self.cell(s, t, e))
    }

    fn record(&mut self, starts: &[LabelId], rel_type: u32, ends: &[LabelId], delta: i64) {
        let types = [0, rel_type as usize + 1];
        let start_slots = std::iter::once(0).chain(starts.iter().map(|&l| l as usize + 1));
        for s in start_slots {
            for &t in &types {
                let row = self.cell(s, t, 0);
                self.cells[row] += delta;
                for &l in ends {
                    self.cells[row + l as usize + 1] += delta;
                }
            }
        }
    }

    fn drain(&mut self) -> Vec<(CountsKey, i64)> {
        let mut out = Vec::new();
        for (idx, cell) in self.cells.iter_mut().enumerate() {
            if *cell == 0 {
                continue;
            }
            let delta = std::mem::take(cell);
            let e = idx % self.label_dim;
            let t = (idx / self.label_dim) % self.type_dim;
            let s = idx / (self.label_dim * self.type_dim);
            out.push((
                CountsKey::new(label_selector(s), type_selector(t), label_selector(e)),
                delta,
            ));
        }
        out
    }
}

#[inline]
fn label_slot(sel: LabelSelector) -> usize {
    match sel {
        LabelSelector::Any => 0,
        LabelSelector::Label(id) => id as usize + 1,
    }
}

fn label_selector(slot: usize) -> LabelSelector {
    if slot == 0 {
        LabelSelector::Any
    } else {
        LabelSelector::Label((slot - 1) as LabelId)
    }
}

fn type_selector(slot: usize) -> TypeSelector {
    if slot == 0 {
        TypeSelector::Any
    } else {
        TypeSelector::Type((slot - 1) as u32)
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use LabelSelector as L;
    use TypeSelector as T;

    #[test]
    fn test_enumerate_cross_product() {
        let keys = enumerate_keys(&[0, 1], 7, &[2]);
        // 3 start selectors x 2 type selectors x 2 end selectors
        assert_eq!(keys.len(), 12);
        assert!(keys.contains(&CountsKey::specific(1, 7, 2)));
        assert!(keys.contains(&CountsKey::new(L::Label(0), T::Any, L::Any)));
        assert!(keys.contains(&CountsKey::all()));
    }

    #[test]
    fn test_enumerate_unlabeled_endpoints() {
        let keys = enumerate_keys(&[], 0, &[]);
        assert_eq!(
            keys,
            vec![
                CountsKey::new(L::Any, T::Any, L::Any),
                CountsKey::new(L::Any, T::Type(0), L::Any),
            ]
        );
    }

    #[test]
    fn test_dense_and_sparse_agree() {
        let mut dense = CountsArena::new(3, 2, usize::MAX);
        let mut sparse = CountsArena::new(3, 2, 0);
        assert!(dense.is_dense());
        assert!(!sparse.is_dense());

        let rels: [(&[LabelId], u32, &[LabelId]); 4] = [
            (&[0], 1, &[2, 3]),
            (&[], 2, &[3]),
            (&[0, 1], 1, &[]),
            (&[3], 0, &[3]),
        ];
        for (s, t, e) in rels {
            dense.record(s, t, e, 1);
            sparse.record(s, t, e, 1);
        }

        let mut d = dense.drain();
        d.sort_unstable_by_key(|&(k, _)| k);
        assert_eq!(d, sparse.drain());
    }

    #[test]
    fn test_drain_empties_arena() {
        let mut arena = CountsArena::new(1, 1, 1 << 10);
        arena.record(&[1], 1, &[0], 1);
        assert_eq!(arena.get(&CountsKey::specific(1, 1, 0)), 1);

        let first = arena.drain();
        assert_eq!(first.len(), 8);
        assert!(arena.drain().is_empty());
        assert_eq!(arena.get(&CountsKey::all()), 0);
    }

    #[test]
    fn test_dense_decodes_high_bounds() {
        let mut arena = CountsArena::new(4, 9, usize::MAX);
        arena.record(&[4], 9, &[4], 2);
        let drained = arena.drain();
        assert!(drained.contains(&(CountsKey::specific(4, 9, 4), 2)));
        assert!(drained.contains(&(CountsKey::all(), 2)));
    }

    #[test]
    fn test_get_outside_bounds_reads_zero() {
        let mut arena = CountsArena::new(1, 0, usize::MAX);
        assert!(arena.is_dense());
        arena.record(&[1], 0, &[1], 1);

        // one past the label bound would alias the next row's Any cell
        assert_eq!(arena.get(&CountsKey::new(L::Label(2), T::Any, L::Any)), 0);
        assert_eq!(arena.get(&CountsKey::new(L::Any, T::Any, L::Label(2))), 0);
        assert_eq!(arena.get(&CountsKey::specific(9, 0, 0)), 0);
        assert_eq!(arena.get(&CountsKey::specific(1, 1, 1)), 0);
        assert_eq!(arena.get(&CountsKey::specific(1, 0, 1)), 1);
    }

    #[test]
    fn test_falls_back_to_sparse_on_overflow() {
        let arena = CountsArena::new(u32::MAX - 2, u32::MAX - 2, usize::MAX);
        assert!(!arena.is_dense());
    }

    #[test]
    fn test_display() {
        assert_eq!(CountsKey::specific(1, 2, 3).to_string(), "(:1)-[:2]->(:3)");
        assert_eq!(CountsKey::all().to_string(), "()-[]->()");
    }
}
