//! Brute-force scan over the arena.
//!
//! Used directly for small indexes and as the ground truth when measuring
//! approximate recall.

use crate::index::arena::VectorArena;
use crate::index::search::sort_by_score;
use ordered_float::OrderedFloat;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Heap key where "greater" means "ranks higher": higher score, then lower seq.
#[derive(Debug, PartialEq, Eq)]
struct Ranked {
    score: OrderedFloat<f32>,
    seq: u64,
    slot: u32,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Exact top-`k` over live slots accepted by `accept`.
///
/// Same ordering contract as the graph search: score descending, then
/// insertion sequence ascending.
pub fn exact_search(
    arena: &VectorArena,
    query: &[f32],
    query_norm: f32,
    k: usize,
    accept: &dyn Fn(u32) -> bool,
) -> Vec<(f32, u32)> {
    if k == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);
    for slot in 0..arena.slot_count() as u32 {
        if arena.is_deleted(slot) || !accept(slot) {
            continue;
        }
        let ranked = Ranked {
            score: OrderedFloat(arena.similarity(query, query_norm, slot)),
            seq: arena.seq(slot),
            slot,
        };
        if heap.len() < k {
            heap.push(Reverse(ranked));
        } else if heap.peek().is_some_and(|Reverse(worst)| ranked > *worst) {
            heap.pop();
            heap.push(Reverse(ranked));
        }
    }
    let mut out: Vec<(f32, u32)> = heap
        .into_iter()
        .map(|Reverse(r)| (r.score.0, r.slot))
        .collect();
    sort_by_score(arena, &mut out);
    out
}

/// Fraction of `truth` slots present in `approx`. An empty truth set counts as full recall.
pub fn recall(truth: &[(f32, u32)], approx: &[(f32, u32)]) -> f32 {
    if truth.is_empty() {
        return 1.0;
    }
    let hits = truth
        .iter()
        .filter(|(_, t)| approx.iter().any(|(_, a)| a == t))
        .count();
    hits as f32 / truth.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::distance::norm;
    use uuid::Uuid;

    fn arena_of(vectors: &[[f32; 2]]) -> VectorArena {
        let mut arena = VectorArena::new(2);
        for (seq, v) in vectors.iter().enumerate() {
            arena.push(Uuid::new_v4(), v, norm(v), seq as u64);
        }
        arena
    }

    #[test]
    fn test_exact_top_k_order() {
        let arena = arena_of(&[[0.0, 1.0], [1.0, 0.0], [1.0, 1.0], [1.0, 0.1]]);
        let hits = exact_search(&arena, &[1.0, 0.0], 1.0, 3, &|_| true);
        let slots: Vec<u32> = hits.iter().map(|h| h.1).collect();
        assert_eq!(slots, vec![1, 3, 2]);
        assert!((hits[0].0 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let arena = arena_of(&[[0.0, 1.0], [2.0, 0.0], [1.0, 0.0], [3.0, 0.0]]);
        let hits = exact_search(&arena, &[1.0, 0.0], 1.0, 2, &|_| true);
        let slots: Vec<u32> = hits.iter().map(|h| h.1).collect();
        assert_eq!(slots, vec![1, 2]);
    }

    #[test]
    fn test_skips_tombstones_and_rejected() {
        let mut arena = arena_of(&[[1.0, 0.0], [0.9, 0.1], [0.5, 0.5]]);
        arena.mark_deleted(0);
        let hits = exact_search(&arena, &[1.0, 0.0], 1.0, 5, &|s| s != 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, 2);
    }

    #[test]
    fn test_recall() {
        let truth = vec![(1.0, 1), (0.9, 2)];
        assert_eq!(recall(&truth, &[(1.0, 1), (0.5, 7)]), 0.5);
        assert_eq!(recall(&[], &[]), 1.0);
    }
}
