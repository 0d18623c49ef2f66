//! HNSW adjacency structure over arena slots.
//!
//! The graph only stores topology (`neighbors[slot][layer]`); vectors live in
//! the [`VectorArena`](crate::index::arena::VectorArena) it was built against.
//! Level assignment is seeded from the entry's insertion sequence, so building
//! the same entries in the same order always yields the same graph.

use crate::config::HnswParams;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswGraph {
    pub params: HnswParams,
    pub neighbors: Vec<Vec<Vec<u32>>>, // [slot][layer][neighbor slots]
    pub layers: Vec<u8>,
    pub entry_point: Option<u32>,
    pub max_layer: usize,
}

impl HnswGraph {
    pub fn new(params: HnswParams) -> Self {
        Self {
            params,
            neighbors: Vec::new(),
            layers: Vec::new(),
            entry_point: None,
            max_layer: 0,
        }
    }

    /// Number of slots the graph knows about.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.layers.len()
    }

    /// Link capacity at `layer`: `2 * m` on the base layer, `m` above it.
    #[inline]
    pub fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    /// Deterministic level for an entry, drawn from the exponential
    /// distribution with normalization factor `1 / ln(m)`.
    pub fn level_for(&self, seq: u64) -> usize {
        let seed = self.params.level_seed ^ seq.wrapping_mul(0xD1B5_4A32_D192_ED03);
        let mut rng = StdRng::seed_from_u64(seed);
        // 1 - [0, 1) keeps ln() finite
        let r: f64 = 1.0 - rng.gen::<f64>();
        let ml = 1.0 / (self.params.m.max(2) as f64).ln();
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.params.max_layers.saturating_sub(1))
    }

    /// Structural checks run after deserialization.
    pub fn validate(&self, slot_count: usize) -> Result<(), String> {
        if self.neighbors.len() != self.layers.len() {
            return Err(format!(
                "neighbor lists ({}) and layer table ({}) disagree",
                self.neighbors.len(),
                self.layers.len()
            ));
        }
        if self.node_count() != slot_count {
            return Err(format!(
                "graph covers {} slots but arena holds {}",
                self.node_count(),
                slot_count
            ));
        }
        match self.entry_point {
            Some(ep) if ep as usize >= slot_count => {
                return Err(format!("entry point {} out of range", ep));
            }
            None if slot_count > 0 => return Err("non-empty graph without entry point".into()),
            _ => {}
        }
        for (slot, per_layer) in self.neighbors.iter().enumerate() {
            if per_layer.len() > self.layers[slot] as usize + 1 {
                return Err(format!("slot {} has links above its level", slot));
            }
            for links in per_layer {
                if let Some(bad) = links.iter().find(|&&n| n as usize >= slot_count) {
                    return Err(format!("slot {} links to missing slot {}", slot, bad));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_is_deterministic() {
        let graph = HnswGraph::new(HnswParams::default());
        for seq in 0..100 {
            assert_eq!(graph.level_for(seq), graph.level_for(seq));
        }
    }

    #[test]
    fn test_levels_are_mostly_zero_and_capped() {
        let params = HnswParams {
            max_layers: 3,
            ..HnswParams::default()
        };
        let graph = HnswGraph::new(params);
        let levels: Vec<usize> = (0..2000).map(|s| graph.level_for(s)).collect();
        let zeros = levels.iter().filter(|&&l| l == 0).count();
        assert!(zeros > 1500, "expected most entries on layer 0, got {}", zeros);
        assert!(levels.iter().all(|&l| l < 3));
    }

    #[test]
    fn test_validate_rejects_dangling_links() {
        let mut graph = HnswGraph::new(HnswParams::default());
        graph.neighbors = vec![vec![vec![5]]];
        graph.layers = vec![0];
        graph.entry_point = Some(0);
        assert!(graph.validate(1).is_err());
        graph.neighbors = vec![vec![vec![]]];
        assert!(graph.validate(1).is_ok());
    }
}
