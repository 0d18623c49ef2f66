//! HNSW insertion with heuristic neighbor selection.
//!
//! The new slot must already be pushed into the arena. Links are made
//! bidirectional and over-full neighbor lists are pruned with the same
//! diversity heuristic used to pick the new slot's own links.

use crate::index::arena::VectorArena;
use crate::index::graph::HnswGraph;
use crate::index::search::{descend, search_layer};
use crate::index::visited::VisitedMarks;
use ordered_float::OrderedFloat;

impl HnswGraph {
    /// Link `slot` (whose vector is already in `arena`) into the graph.
    ///
    /// `slot` must equal `node_count()`; slots are linked in arena order.
    pub fn insert(&mut self, arena: &VectorArena, slot: u32) {
        debug_assert_eq!(slot as usize, self.node_count());
        let level = self.level_for(arena.seq(slot));
        let query = arena.vector(slot);
        let query_norm = arena.norm(slot);

        let mut marks = VisitedMarks::with_capacity(arena.slot_count());
        let start = descend(self, arena, query, query_norm, level, &mut marks);

        self.neighbors.push(vec![Vec::new(); level + 1]);
        self.layers.push(level as u8);

        let Some(start) = start else {
            self.entry_point = Some(slot);
            self.max_layer = level;
            return;
        };

        let everything = |_: u32| true;
        let top = level.min(self.max_layer);
        let mut entry_points = vec![start];
        for layer in (0..=top).rev() {
            let candidates = search_layer(
                self,
                arena,
                query,
                query_norm,
                &entry_points,
                self.params.ef_construction,
                layer,
                &mut marks,
                &everything,
            );
            let selected = select_diverse(arena, &candidates, self.max_links(layer));
            self.neighbors[slot as usize][layer] = selected.iter().map(|&(_, s)| s).collect();

            entry_points.clear();
            entry_points.extend(candidates.iter().map(|&(_, s)| s));
            if entry_points.is_empty() {
                entry_points.push(start);
            }
        }

        for layer in 0..=top {
            let cap = self.max_links(layer);
            let linked = self.neighbors[slot as usize][layer].clone();
            for neighbor in linked {
                let n = neighbor as usize;
                if self.neighbors[n].len() <= layer {
                    self.neighbors[n].resize(layer + 1, Vec::new());
                }
                self.neighbors[n][layer].push(slot);
                if self.neighbors[n][layer].len() > cap {
                    let pool: Vec<(f32, u32)> = self.neighbors[n][layer]
                        .iter()
                        .map(|&c| (1.0 - arena.slot_similarity(neighbor, c), c))
                        .collect();
                    let kept = select_diverse(arena, &pool, cap);
                    self.neighbors[n][layer] = kept.into_iter().map(|(_, s)| s).collect();
                }
            }
        }

        if level > self.max_layer || self.entry_point.is_none() {
            self.max_layer = level;
            self.entry_point = Some(slot);
        }
    }
}

/// Pick up to `m` candidates, preferring ones closer to the base than to any
/// already-picked neighbor; leftover capacity is filled nearest-first.
fn select_diverse(arena: &VectorArena, candidates: &[(f32, u32)], m: usize) -> Vec<(f32, u32)> {
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable_by_key(|&(d, s)| (OrderedFloat(d), s));

    let mut picked: Vec<(f32, u32)> = Vec::with_capacity(m);
    for &(to_base, cand) in &sorted {
        if picked.len() >= m {
            break;
        }
        let diverse = picked
            .iter()
            .all(|&(_, p)| to_base <= 1.0 - arena.slot_similarity(cand, p));
        if diverse {
            picked.push((to_base, cand));
        }
    }

    if picked.len() < m {
        for &(d, cand) in &sorted {
            if picked.len() >= m {
                break;
            }
            if !picked.iter().any(|&(_, p)| p == cand) {
                picked.push((d, cand));
            }
        }
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HnswParams;
    use crate::index::distance::norm;
    use uuid::Uuid;

    fn build(vectors: &[Vec<f32>], params: HnswParams) -> (VectorArena, HnswGraph) {
        let mut arena = VectorArena::new(vectors[0].len());
        let mut graph = HnswGraph::new(params);
        for (seq, v) in vectors.iter().enumerate() {
            let slot = arena.push(Uuid::new_v4(), v, norm(v), seq as u64);
            graph.insert(&arena, slot);
        }
        (arena, graph)
    }

    #[test]
    fn test_first_insert_becomes_entry_point() {
        let (_, graph) = build(&[vec![1.0, 0.0]], HnswParams::default());
        assert_eq!(graph.entry_point, Some(0));
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_links_are_capped_and_never_loop() {
        let params = HnswParams {
            m: 4,
            ..HnswParams::default()
        };
        let vectors: Vec<Vec<f32>> = (0..60)
            .map(|i| {
                let a = i as f32 * 0.1;
                vec![a.cos(), a.sin(), (a * 0.5).cos()]
            })
            .collect();
        let (arena, graph) = build(&vectors, params);
        assert!(graph.validate(arena.slot_count()).is_ok());
        for (slot, per_layer) in graph.neighbors.iter().enumerate() {
            for (layer, links) in per_layer.iter().enumerate() {
                assert!(links.len() <= graph.max_links(layer));
                assert!(!links.contains(&(slot as u32)));
            }
        }
        // every later slot links back into the existing graph on the base layer
        for slot in 1..vectors.len() {
            assert!(!graph.neighbors[slot][0].is_empty(), "slot {} is isolated", slot);
        }
    }

    #[test]
    fn test_same_order_same_graph() {
        let vectors: Vec<Vec<f32>> = (0..40)
            .map(|i| vec![(i as f32).sin(), (i as f32).cos(), 0.3])
            .collect();
        let (_, a) = build(&vectors, HnswParams::default());
        let (_, b) = build(&vectors, HnswParams::default());
        assert_eq!(a.neighbors, b.neighbors);
        assert_eq!(a.entry_point, b.entry_point);
    }
}
