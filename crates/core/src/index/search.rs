//! Graph traversal: single-layer beam search and multi-layer k-NN.
//!
//! A slot predicate restricts what may appear in results. Slots that fail it
//! (and tombstoned slots) still serve as stepping stones so that filtering
//! never disconnects the graph.

use crate::index::arena::VectorArena;
use crate::index::graph::HnswGraph;
use crate::index::visited::VisitedMarks;
use ordered_float::OrderedFloat;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

thread_local! {
    static SEARCH_MARKS: RefCell<VisitedMarks> = RefCell::new(VisitedMarks::default());
}

/// Frontier entry; the heap pops the nearest first.
#[derive(Debug, PartialEq, Eq)]
struct Frontier {
    neg_distance: OrderedFloat<f32>,
    slot: u32,
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.neg_distance
            .cmp(&other.neg_distance)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result entry; the heap pops the farthest first so it can be trimmed to `ef`.
#[derive(Debug, PartialEq, Eq)]
struct Kept {
    distance: OrderedFloat<f32>,
    slot: u32,
}

impl Ord for Kept {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

impl PartialOrd for Kept {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[inline]
fn distance(arena: &VectorArena, query: &[f32], query_norm: f32, slot: u32) -> f32 {
    1.0 - arena.similarity(query, query_norm, slot)
}

/// Beam search on one layer. Returns up to `ef` `(distance, slot)` pairs,
/// nearest first, restricted to live slots accepted by `accept`.
#[allow(clippy::too_many_arguments)]
pub fn search_layer(
    graph: &HnswGraph,
    arena: &VectorArena,
    query: &[f32],
    query_norm: f32,
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    marks: &mut VisitedMarks,
    accept: &dyn Fn(u32) -> bool,
) -> Vec<(f32, u32)> {
    marks.reset();
    let mut frontier: BinaryHeap<Frontier> = BinaryHeap::with_capacity(ef * 2);
    let mut kept: BinaryHeap<Kept> = BinaryHeap::with_capacity(ef + 1);
    let mut worst = f32::MAX;

    for &ep in entry_points {
        if !marks.visit(ep) {
            continue;
        }
        let d = distance(arena, query, query_norm, ep);
        frontier.push(Frontier {
            neg_distance: OrderedFloat(-d),
            slot: ep,
        });
        if !arena.is_deleted(ep) && accept(ep) {
            kept.push(Kept {
                distance: OrderedFloat(d),
                slot: ep,
            });
            if kept.len() > ef {
                kept.pop();
            }
            if kept.len() >= ef {
                worst = kept.peek().map_or(f32::MAX, |k| k.distance.0);
            }
        }
    }

    while let Some(current) = frontier.pop() {
        let d = -current.neg_distance.0;
        if kept.len() >= ef && d > worst {
            break;
        }
        let Some(links) = graph.neighbors[current.slot as usize].get(layer) else {
            continue;
        };
        for &next in links {
            if !marks.visit(next) {
                continue;
            }
            let nd = distance(arena, query, query_norm, next);
            if kept.len() < ef || nd < worst {
                frontier.push(Frontier {
                    neg_distance: OrderedFloat(-nd),
                    slot: next,
                });
                if !arena.is_deleted(next) && accept(next) {
                    kept.push(Kept {
                        distance: OrderedFloat(nd),
                        slot: next,
                    });
                    if kept.len() > ef {
                        kept.pop();
                    }
                    worst = kept.peek().map_or(f32::MAX, |k| k.distance.0);
                }
            }
        }
    }

    kept.into_sorted_vec()
        .into_iter()
        .map(|k| (k.distance.0, k.slot))
        .collect()
}

/// Greedy descent from the entry point through every layer above `stop`.
/// Returns the slot to start the layer-`stop` search from.
pub(crate) fn descend(
    graph: &HnswGraph,
    arena: &VectorArena,
    query: &[f32],
    query_norm: f32,
    stop: usize,
    marks: &mut VisitedMarks,
) -> Option<u32> {
    let mut current = graph.entry_point?;
    for layer in (stop + 1..=graph.max_layer).rev() {
        current = greedy_step(graph, arena, query, query_norm, current, layer, marks);
    }
    Some(current)
}

/// Hill-climb on one layer. Tombstoned slots are valid stepping stones here.
fn greedy_step(
    graph: &HnswGraph,
    arena: &VectorArena,
    query: &[f32],
    query_norm: f32,
    start: u32,
    layer: usize,
    marks: &mut VisitedMarks,
) -> u32 {
    marks.reset();
    marks.visit(start);
    let mut best = start;
    let mut best_d = distance(arena, query, query_norm, start);
    loop {
        let Some(links) = graph.neighbors[best as usize].get(layer) else {
            break;
        };
        let mut next_best = best;
        for &next in links {
            if !marks.visit(next) {
                continue;
            }
            let d = distance(arena, query, query_norm, next);
            if d < best_d {
                next_best = next;
                best_d = d;
            }
        }
        if next_best == best {
            break;
        }
        best = next_best;
    }
    best
}

/// Multi-layer k-NN. Returns `(cosine score, slot)` sorted by score descending,
/// ties broken by ascending insertion sequence.
///
/// Candidates are re-scored exactly before truncation. When the filtered base
/// layer yields fewer than `k` results, `ef` doubles up to four times its base.
pub fn knn_search(
    graph: &HnswGraph,
    arena: &VectorArena,
    query: &[f32],
    query_norm: f32,
    k: usize,
    ef_search: usize,
    accept: &dyn Fn(u32) -> bool,
) -> Vec<(f32, u32)> {
    if graph.entry_point.is_none() || k == 0 {
        return Vec::new();
    }
    SEARCH_MARKS.with(|cell| {
        let mut marks = cell.borrow_mut();
        marks.reserve_slots(arena.slot_count());

        let Some(start) = descend(graph, arena, query, query_norm, 0, &mut marks) else {
            return Vec::new();
        };

        let base_ef = ef_search.max(k);
        let max_ef = (base_ef * 4).min(arena.slot_count().max(base_ef));
        let mut ef = base_ef;
        let mut found;
        loop {
            found = search_layer(
                graph,
                arena,
                query,
                query_norm,
                std::slice::from_ref(&start),
                ef,
                0,
                &mut marks,
                accept,
            );
            if found.len() >= k || ef >= max_ef {
                break;
            }
            ef = (ef * 2).min(max_ef);
        }

        let mut scored: Vec<(f32, u32)> = found
            .into_iter()
            .map(|(_, slot)| (arena.similarity(query, query_norm, slot), slot))
            .collect();
        sort_by_score(arena, &mut scored);
        scored.truncate(k);
        scored
    })
}

/// Sort `(score, slot)` pairs by score descending, then insertion sequence ascending.
pub fn sort_by_score(arena: &VectorArena, scored: &mut [(f32, u32)]) {
    scored.sort_unstable_by(|a, b| {
        OrderedFloat(b.0)
            .cmp(&OrderedFloat(a.0))
            .then_with(|| arena.seq(a.1).cmp(&arena.seq(b.1)))
    });
}
