//! Struct-of-arrays storage for index entries.
//!
//! Every slot holds one vector, its norm, the chunk id it belongs to and the
//! insertion sequence number used for tie-breaks. Slots are append-only;
//! removal sets a tombstone until the next rebuild compacts the arena.

use crate::index::distance::cosine_with_norms;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A live entry copied out of the arena.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: Uuid,
    pub vector: Vec<f32>,
    pub norm: f32,
    pub seq: u64,
}

/// Contiguous vector arena plus per-slot metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorArena {
    pub dimension: usize,
    pub vectors: Vec<f32>,
    pub norms: Vec<f32>,
    pub chunk_ids: Vec<Uuid>,
    pub seqs: Vec<u64>,
    pub deleted: Vec<bool>,
}

impl VectorArena {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
            norms: Vec::new(),
            chunk_ids: Vec::new(),
            seqs: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Number of slots, including tombstoned ones.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.norms.len()
    }

    pub fn live_count(&self) -> usize {
        self.deleted.iter().filter(|&&d| !d).count()
    }

    /// Append a vector whose dimension and norm have already been checked.
    pub fn push(&mut self, chunk_id: Uuid, vector: &[f32], norm: f32, seq: u64) -> u32 {
        debug_assert_eq!(vector.len(), self.dimension);
        let slot = self.slot_count() as u32;
        self.vectors.extend_from_slice(vector);
        self.norms.push(norm);
        self.chunk_ids.push(chunk_id);
        self.seqs.push(seq);
        self.deleted.push(false);
        slot
    }

    #[inline]
    pub fn vector(&self, slot: u32) -> &[f32] {
        let start = slot as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    #[inline]
    pub fn norm(&self, slot: u32) -> f32 {
        self.norms[slot as usize]
    }

    #[inline]
    pub fn chunk_id(&self, slot: u32) -> Uuid {
        self.chunk_ids[slot as usize]
    }

    #[inline]
    pub fn seq(&self, slot: u32) -> u64 {
        self.seqs[slot as usize]
    }

    #[inline]
    pub fn is_deleted(&self, slot: u32) -> bool {
        self.deleted[slot as usize]
    }

    pub fn mark_deleted(&mut self, slot: u32) {
        if let Some(flag) = self.deleted.get_mut(slot as usize) {
            *flag = true;
        }
    }

    /// Cosine similarity between a query and a stored slot.
    #[inline]
    pub fn similarity(&self, query: &[f32], query_norm: f32, slot: u32) -> f32 {
        cosine_with_norms(query, self.vector(slot), query_norm, self.norm(slot))
    }

    /// Similarity between two stored slots.
    #[inline]
    pub fn slot_similarity(&self, a: u32, b: u32) -> f32 {
        cosine_with_norms(self.vector(a), self.vector(b), self.norm(a), self.norm(b))
    }

    /// Live entries in slot order.
    pub fn live_entries(&self) -> Vec<IndexEntry> {
        (0..self.slot_count() as u32)
            .filter(|&s| !self.is_deleted(s))
            .map(|s| IndexEntry {
                chunk_id: self.chunk_id(s),
                vector: self.vector(s).to_vec(),
                norm: self.norm(s),
                seq: self.seq(s),
            })
            .collect()
    }

    /// Check that the parallel arrays agree with each other.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.slot_count();
        if self.vectors.len() != n * self.dimension {
            return Err(format!(
                "vector arena length {} != slots({}) * dimension({})",
                self.vectors.len(),
                n,
                self.dimension
            ));
        }
        if self.chunk_ids.len() != n || self.seqs.len() != n || self.deleted.len() != n {
            return Err(format!(
                "slot metadata lengths disagree: norms={}, ids={}, seqs={}, deleted={}",
                n,
                self.chunk_ids.len(),
                self.seqs.len(),
                self.deleted.len()
            ));
        }
        if self.norms.iter().any(|n| !n.is_finite() || *n <= 0.0) {
            return Err("stored vector with non-positive or non-finite norm".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_tombstone() {
        let mut arena = VectorArena::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let sa = arena.push(a, &[1.0, 0.0], 1.0, 0);
        let sb = arena.push(b, &[0.0, 2.0], 2.0, 1);
        assert_eq!(arena.vector(sb), &[0.0, 2.0]);
        assert_eq!(arena.live_count(), 2);
        arena.mark_deleted(sa);
        assert_eq!(arena.live_count(), 1);
        let live = arena.live_entries();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].chunk_id, b);
        assert_eq!(live[0].seq, 1);
        assert!(arena.validate().is_ok());
    }

    #[test]
    fn test_validate_detects_truncated_arena() {
        let mut arena = VectorArena::new(2);
        arena.push(Uuid::new_v4(), &[1.0, 0.0], 1.0, 0);
        arena.vectors.pop();
        assert!(arena.validate().is_err());
    }
}
