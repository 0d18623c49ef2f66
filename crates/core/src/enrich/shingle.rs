//! Word-shingle inverted index for probable-duplicate detection.
//!
//! Each enriched chunk contributes the set of its `w`-word shingles. Postings
//! map a shingle to the chunks containing it, so the Jaccard overlap against
//! every earlier chunk is computed by touching only chunks that share at
//! least one shingle.

use crate::enrich::tokenizer::{fnv1a, words, FNV_OFFSET};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// FNV-1a over the shingle's words, separated by a unit separator byte.
fn shingle_key(window: &[&str]) -> u64 {
    let mut hash = FNV_OFFSET;
    for (i, word) in window.iter().enumerate() {
        if i > 0 {
            hash = fnv1a(hash, &[0x1f]);
        }
        hash = fnv1a(hash, word.as_bytes());
    }
    hash
}

/// Distinct shingle keys of normalized text. Text shorter than `size` words
/// yields a single shingle of all its words.
pub fn shingles(normalized: &str, size: usize) -> Vec<u64> {
    let words = words(normalized);
    if words.is_empty() {
        return Vec::new();
    }
    let size = size.max(1);
    let mut keys: Vec<u64> = if words.len() <= size {
        vec![shingle_key(&words)]
    } else {
        words.windows(size).map(shingle_key).collect()
    };
    keys.sort_unstable();
    keys.dedup();
    keys
}

#[derive(Debug, Default)]
pub struct ShingleIndex {
    size: usize,
    postings: HashMap<u64, Vec<u32>>,
    members: Vec<Option<(Uuid, Vec<u64>)>>,
    internal: HashMap<Uuid, u32>,
}

impl ShingleIndex {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.internal.is_empty()
    }

    /// Index a chunk's normalized text. Re-adding a known id is a no-op.
    pub fn add(&mut self, chunk_id: Uuid, normalized: &str) {
        if self.internal.contains_key(&chunk_id) {
            return;
        }
        let keys = shingles(normalized, self.size);
        let internal = self.members.len() as u32;
        for key in &keys {
            self.postings.entry(*key).or_default().push(internal);
        }
        self.members.push(Some((chunk_id, keys)));
        self.internal.insert(chunk_id, internal);
    }

    pub fn remove(&mut self, chunk_id: &Uuid) {
        let Some(internal) = self.internal.remove(chunk_id) else {
            return;
        };
        if let Some((_, keys)) = self.members[internal as usize].take() {
            for key in keys {
                if let Some(list) = self.postings.get_mut(&key) {
                    list.retain(|&m| m != internal);
                    if list.is_empty() {
                        self.postings.remove(&key);
                    }
                }
            }
        }
    }

    /// Earlier chunk with the highest Jaccard overlap at or above `threshold`.
    /// Ties go to the chunk indexed first.
    pub fn best_match(&self, normalized: &str, threshold: f32) -> Option<(Uuid, f32)> {
        let keys = shingles(normalized, self.size);
        if keys.is_empty() {
            return None;
        }
        let mut shared: HashMap<u32, usize> = HashMap::new();
        let unique: HashSet<u64> = keys.iter().copied().collect();
        for key in &unique {
            if let Some(list) = self.postings.get(key) {
                for &m in list {
                    *shared.entry(m).or_insert(0) += 1;
                }
            }
        }

        let mut best: Option<(u32, f32)> = None;
        for (member, inter) in shared {
            let Some((_, other)) = &self.members[member as usize] else {
                continue;
            };
            let union = unique.len() + other.len() - inter;
            let jaccard = inter as f32 / union as f32;
            let better = match best {
                None => true,
                Some((bm, bj)) => jaccard > bj || (jaccard == bj && member < bm),
            };
            if better {
                best = Some((member, jaccard));
            }
        }
        let (member, jaccard) = best?;
        if jaccard < threshold {
            return None;
        }
        self.members[member as usize]
            .as_ref()
            .map(|(id, _)| (*id, jaccard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shingles_short_text() {
        assert_eq!(shingles("one two", 3).len(), 1);
        assert!(shingles("", 3).is_empty());
        assert_eq!(shingles("a b c d", 3).len(), 2);
    }

    #[test]
    fn test_best_match_finds_near_copy() {
        let mut index = ShingleIndex::new(3);
        let original = Uuid::new_v4();
        let unrelated = Uuid::new_v4();
        index.add(
            original,
            "the quick brown fox jumps over the lazy dog near the river bank",
        );
        index.add(unrelated, "water boils at one hundred degrees celsius at sea level");

        let hit = index
            .best_match(
                "the quick brown fox jumps over the lazy dog near the river bank today",
                0.8,
            )
            .unwrap();
        assert_eq!(hit.0, original);
        assert!(hit.1 >= 0.8);
        assert!(index.best_match("completely different words here", 0.8).is_none());
    }

    #[test]
    fn test_remove_forgets_chunk() {
        let mut index = ShingleIndex::new(2);
        let id = Uuid::new_v4();
        index.add(id, "alpha beta gamma");
        assert!(index.best_match("alpha beta gamma", 0.9).is_some());
        index.remove(&id);
        assert!(index.best_match("alpha beta gamma", 0.1).is_none());
        assert!(index.is_empty());
    }
}
