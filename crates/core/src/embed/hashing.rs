//! Deterministic feature-hashing embedder.
//!
//! Each token is hashed into one of `dimension` buckets with a hash-derived
//! sign; the bucket counts are L2-normalized. Texts with the same bag of
//! terms embed identically, so word order and stop words do not matter. No
//! model or network is involved, which makes this the offline default and
//! the test double for every component that needs an [`Embedder`].

use crate::config::MAX_DIMENSION;
use crate::embed::Embedder;
use crate::enrich::tokenizer::{fnv1a, normalize, tokenize, FNV_OFFSET};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(Error::InvalidConfig(format!(
                "hashing embedder dimension must be 1-{}, got {}",
                MAX_DIMENSION, dimension
            )));
        }
        Ok(Self { dimension })
    }

    fn accumulate(&self, vector: &mut [f32], term: &str, offset: u64) {
        let h = fnv1a(offset, term.as_bytes());
        let bucket = (h % self.dimension as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
}

/// How many hash seeds are tried before giving up on a cancelled vector.
const SEEDS: u64 = 8;

fn seed_offset(seed: u64) -> u64 {
    if seed == 0 {
        FNV_OFFSET
    } else {
        fnv1a(FNV_OFFSET, &seed.to_le_bytes())
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let whole = normalize(text);
        if whole.is_empty() {
            return Err(Error::InvalidQuery("cannot embed empty text".into()));
        }
        let tokens = tokenize(text);
        // only stop words or symbols: fall back to the whole normalized text
        let terms: Vec<&str> = if tokens.is_empty() {
            vec![whole.as_str()]
        } else {
            tokens.iter().collect()
        };

        let mut vector = vec![0.0f32; self.dimension];
        for seed in 0..SEEDS {
            vector.fill(0.0);
            let offset = seed_offset(seed);
            for term in &terms {
                self.accumulate(&mut vector, term, offset);
            }
            let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > f32::EPSILON {
                vector.iter_mut().for_each(|x| *x /= norm);
                return Ok(vector);
            }
            // every term cancelled out in shared buckets; rehash
        }
        vector.fill(0.0);
        let h = fnv1a(FNV_OFFSET, whole.as_bytes());
        vector[(h % self.dimension as u64) as usize] = 1.0;
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::distance::cosine;

    #[test]
    fn test_unit_length_and_dimension() {
        let e = HashingEmbedder::new(64).unwrap();
        let v = e.embed("vector databases index embeddings").unwrap();
        assert_eq!(v.len(), 64);
        let n: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((n - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_same_terms_same_vector() {
        let e = HashingEmbedder::new(384).unwrap();
        let a = e.embed("The capital of France is Paris.").unwrap();
        let b = e.embed("Paris is the capital of France.").unwrap();
        assert!((cosine(&a, &b) - 1.0).abs() < 1e-6);
        let q = e.embed("capital of France").unwrap();
        assert!(cosine(&q, &a) > 0.5);
    }

    #[test]
    fn test_empty_text_is_an_error() {
        let e = HashingEmbedder::new(8).unwrap();
        assert!(matches!(e.embed("   "), Err(Error::InvalidQuery(_))));
        // stop words only still embeds
        assert!(e.embed("the of and").is_ok());
    }

    #[test]
    fn test_cancelled_terms_rehash_instead_of_colliding() {
        let e = HashingEmbedder::new(4).unwrap();
        // both pairs share a bucket with opposite signs under the first seed
        let a = e.embed("river canyon").unwrap();
        let b = e.embed("stone maple").unwrap();
        for v in [&a, &b] {
            let n: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((n - 1.0).abs() < 1e-5);
        }
        assert!(cosine(&a, &b) < 0.5);
        assert_eq!(a, e.embed("canyon river").unwrap());
    }

    #[test]
    fn test_rejects_bad_dimension() {
        assert!(HashingEmbedder::new(0).is_err());
        assert!(HashingEmbedder::new(MAX_DIMENSION + 1).is_err());
    }
}
