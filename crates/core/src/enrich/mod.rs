//! Chunk enrichment: normalization, content identity, duplicate detection and tags.
//!
//! Two duplicate notions are kept apart:
//!
//! - **Exact duplicates** share a normalized-content hash. They never become a
//!   second chunk; [`Enricher::process`] resolves them to the existing id.
//! - **Near duplicates** have distinct content but nearly the same meaning.
//!   Before embedding, shingle overlap marks them *probable*; after embedding,
//!   [`Enricher::confirm_duplicate`] checks cosine similarity against the index
//!   and records the canonical chunk. Near duplicates are retained, only tagged.
//!
//! Each new chunk also gets its named entities from an [`EntityTagger`].

pub mod entity;
pub mod shingle;
pub mod tokenizer;

use crate::chunk::{chunk_id_for, provenance_tags, Chunk, ChunkStage, Document, DuplicateFlag, RawChunk};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::store::ChunkStore;
use entity::{EntityTagger, RuleTagger};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use shingle::ShingleIndex;
use std::sync::Arc;
use uuid::Uuid;

/// How many nearest neighbors are inspected when confirming a duplicate.
const DUPLICATE_CANDIDATES: usize = 8;

/// Result of enriching one raw chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichOutcome {
    /// A new chunk was stored.
    Created(Chunk),
    /// The normalized content already exists; no chunk was created.
    ExactDuplicate { chunk_id: Uuid },
    /// Nothing left after normalization.
    Empty,
}

impl EnrichOutcome {
    pub fn chunk_id(&self) -> Option<Uuid> {
        match self {
            EnrichOutcome::Created(chunk) => Some(chunk.id),
            EnrichOutcome::ExactDuplicate { chunk_id } => Some(*chunk_id),
            EnrichOutcome::Empty => None,
        }
    }
}

/// Thresholds the enricher works with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnrichSettings {
    pub shingle_size: usize,
    pub shingle_threshold: f32,
    pub near_duplicate_threshold: f32,
}

impl From<&Settings> for EnrichSettings {
    fn from(s: &Settings) -> Self {
        Self {
            shingle_size: s.shingle_size,
            shingle_threshold: s.shingle_threshold,
            near_duplicate_threshold: s.near_duplicate_threshold,
        }
    }
}

/// Hex SHA-256 of normalized text.
pub fn content_hash(normalized: &str) -> String {
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

pub struct Enricher {
    store: Arc<ChunkStore>,
    shingles: Mutex<ShingleIndex>,
    tagger: Arc<dyn EntityTagger>,
    settings: EnrichSettings,
}

impl Enricher {
    /// Enricher over `store`, with the shingle index seeded from the chunks
    /// already stored.
    pub fn new(store: Arc<ChunkStore>, settings: EnrichSettings) -> Self {
        let mut shingles = ShingleIndex::new(settings.shingle_size);
        for doc in store.documents() {
            if let Ok(chunks) = store.list_by_document(&doc.id) {
                for chunk in chunks {
                    shingles.add(chunk.id, &chunk.normalized);
                }
            }
        }
        Self {
            store,
            shingles: Mutex::new(shingles),
            tagger: Arc::new(RuleTagger),
            settings,
        }
    }

    /// Replace the built-in [`RuleTagger`].
    pub fn with_tagger(mut self, tagger: Arc<dyn EntityTagger>) -> Self {
        self.tagger = tagger;
        self
    }

    pub fn settings(&self) -> &EnrichSettings {
        &self.settings
    }

    /// Enrich one raw chunk of `doc` and store the result.
    ///
    /// Deterministic: the same raw chunk always yields the same id and tags.
    pub fn process(&self, doc: &Document, raw: &RawChunk) -> Result<EnrichOutcome> {
        if raw.document_id != doc.id {
            return Err(Error::InvalidQuery(format!(
                "raw chunk belongs to {} but was enriched for {}",
                raw.document_id, doc.id
            )));
        }
        let normalized = tokenizer::normalize(&raw.text);
        if normalized.is_empty() {
            return Ok(EnrichOutcome::Empty);
        }
        let hash = content_hash(&normalized);

        if let Some(existing) = self.store.find_by_hash(&hash) {
            self.store.link_chunk(&doc.id, &existing, &raw.location)?;
            return Ok(EnrichOutcome::ExactDuplicate { chunk_id: existing });
        }

        let id = chunk_id_for(&doc.id, &raw.location, &hash);
        let probable = {
            let mut shingles = self.shingles.lock();
            let found = shingles
                .best_match(&normalized, self.settings.shingle_threshold)
                .map(|(other, _)| other);
            shingles.add(id, &normalized);
            found
        };

        let chunk = Chunk {
            id,
            document_id: doc.id,
            text: raw.text.clone(),
            normalized,
            content_hash: hash,
            location: raw.location.clone(),
            tags: provenance_tags(&doc.id, &doc.origin, &raw.location),
            embedding: None,
            stage: ChunkStage::Enriched,
            duplicate_of: None,
            probable_duplicate_of: probable,
            entities: self.tagger.entities(&raw.text),
        };
        self.store.put(chunk.clone())?;
        Ok(EnrichOutcome::Created(chunk))
    }

    /// Compare an embedded chunk with its nearest indexed neighbors. The most
    /// similar one at or above the threshold, with a different content hash,
    /// becomes the canonical. The flag is stored on the chunk and returned.
    pub fn confirm_duplicate(
        &self,
        chunk_id: &Uuid,
        vector: &[f32],
        index: &VectorIndex,
    ) -> Result<Option<DuplicateFlag>> {
        let chunk = self.store.get(chunk_id)?;
        let not_self = |id: &Uuid| id != chunk_id;
        let hits = index.search(vector, DUPLICATE_CANDIDATES, Some(&not_self))?;

        let mut flag = None;
        for hit in hits {
            if hit.score < self.settings.near_duplicate_threshold {
                break;
            }
            let Ok(other) = self.store.get(&hit.chunk_id) else {
                continue;
            };
            if other.content_hash == chunk.content_hash {
                continue;
            }
            flag = Some(DuplicateFlag {
                canonical: other.canonical_id(),
                similarity: hit.score,
            });
            break;
        }
        self.store.set_duplicate_of(chunk_id, flag)?;
        if let Some(f) = flag {
            tracing::debug!(chunk = %chunk_id, canonical = %f.canonical, similarity = f.similarity, "near duplicate");
        }
        Ok(flag)
    }

    /// Drop chunks from the shingle index (after their document was deleted).
    pub fn forget(&self, chunk_ids: &[Uuid]) {
        let mut shingles = self.shingles.lock();
        for id in chunk_ids {
            shingles.remove(id);
        }
    }
}
