//! Query-time retrieval: embed, search, filter, boost, collapse duplicates.

pub mod filter;

use crate::chunk::{Chunk, ChunkLocation, DuplicateFlag, Entity, Tags};
use crate::config::{self, RecencyBoost, Settings};
use crate::embed::Embedder;
use crate::enrich::entity;
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::store::ChunkStore;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub use filter::{TagCondition, TagFilter, TagOperator};

/// A retrieval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    /// Number of results wanted. Signed so that a non-positive value is
    /// reported as an invalid query instead of failing to parse.
    pub k: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,
    /// Keep only chunks carrying at least one entity with one of these labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
}

impl Query {
    pub fn new(text: impl Into<String>, k: i64) -> Self {
        Self {
            text: text.into(),
            k,
            document_ids: None,
            tags: None,
            min_score: None,
            entities: Vec::new(),
        }
    }

    pub fn in_documents(mut self, ids: Vec<Uuid>) -> Self {
        self.document_ids = Some(ids);
        self
    }

    pub fn with_tags(mut self, tags: TagFilter) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn with_entities(mut self, labels: Vec<String>) -> Self {
        self.entities = labels;
        self
    }

    /// Checks `k`, the filters and the score floor; returns `k` as a count.
    pub fn validate(&self) -> Result<usize> {
        if self.text.trim().is_empty() {
            return Err(Error::InvalidQuery("query text is empty".into()));
        }
        if self.k < 1 || self.k > config::MAX_K as i64 {
            return Err(Error::InvalidQuery(format!(
                "k must be between 1 and {}, got {}",
                config::MAX_K,
                self.k
            )));
        }
        if self.document_ids.as_ref().is_some_and(|ids| ids.is_empty()) {
            return Err(Error::InvalidQuery(
                "document_ids filter must list at least one document".into(),
            ));
        }
        if let Some(tags) = &self.tags {
            tags.validate()?;
        }
        if let Some(label) = self
            .entities
            .iter()
            .find(|l| !entity::LABELS.iter().any(|known| known.eq_ignore_ascii_case(l)))
        {
            return Err(Error::InvalidQuery(format!("unknown entity label '{label}'")));
        }
        if let Some(min) = self.min_score {
            if !(-1.0..=1.0).contains(&min) {
                return Err(Error::InvalidQuery(format!(
                    "min_score must be within [-1, 1], got {min}"
                )));
            }
        }
        Ok(self.k as usize)
    }
}

/// Where a retrieved chunk came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub document_id: Uuid,
    /// Origin path of the document.
    pub source: String,
    pub location: ChunkLocation,
    pub tags: Tags,
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: Uuid,
    /// Ranking score: cosine similarity plus any recency boost.
    pub score: f32,
    /// Raw cosine similarity to the query.
    pub similarity: f32,
    pub snippet: String,
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<DuplicateFlag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
    /// Lower-ranked members of the same duplicate group that were folded in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collapsed: Vec<Uuid>,
}

/// Ranked results, score descending, at most `k` long.
pub type RetrievalResult = Vec<RetrievedChunk>;

/// Retrieval knobs taken from [`Settings`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrieveSettings {
    pub over_fetch_factor: usize,
    pub snippet_chars: usize,
    pub recency_boost: Option<RecencyBoost>,
}

impl From<&Settings> for RetrieveSettings {
    fn from(s: &Settings) -> Self {
        Self {
            over_fetch_factor: s.over_fetch_factor.max(1),
            snippet_chars: s.snippet_chars,
            recency_boost: s.recency_boost,
        }
    }
}

impl Default for RetrieveSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

struct Candidate {
    chunk: Chunk,
    source: String,
    similarity: f32,
    score: f32,
    seq: u64,
}

/// Answers [`Query`]s against a store and its index.
pub struct Retriever {
    store: Arc<ChunkStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    settings: RetrieveSettings,
}

impl Retriever {
    pub fn new(
        store: Arc<ChunkStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        settings: RetrieveSettings,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            settings,
        }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Run a query, measuring document age against the current clock.
    pub fn retrieve(&self, query: &Query) -> Result<RetrievalResult> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.retrieve_at(query, now)
    }

    /// Run a query with an explicit "now" (unix seconds) for the recency boost.
    pub fn retrieve_at(&self, query: &Query, now: u64) -> Result<RetrievalResult> {
        let k = query.validate()?;
        let vector = self.embedder.embed(&query.text)?;
        if vector.len() != self.index.dimension() {
            return Err(Error::InvalidQuery(format!(
                "query embedding has dimension {} but the index expects {}",
                vector.len(),
                self.index.dimension()
            )));
        }

        let doc_filter: Option<HashSet<Uuid>> =
            query.document_ids.as_ref().map(|ids| ids.iter().copied().collect());
        let live = self.index.len();
        if live == 0 {
            return Ok(Vec::new());
        }

        let mut fetch = k.saturating_mul(self.settings.over_fetch_factor).min(live).max(1);
        let mut sources: HashMap<Uuid, (String, u64)> = HashMap::new();
        loop {
            let hits = self.index.search(&vector, fetch, None)?;
            let exhausted = hits.len() < fetch || fetch >= live;

            let mut pool = Vec::with_capacity(hits.len());
            for hit in hits {
                // A concurrent delete may have removed the chunk after the search.
                let Ok(chunk) = self.store.get(&hit.chunk_id) else {
                    continue;
                };
                if doc_filter.as_ref().is_some_and(|d| !d.contains(&chunk.document_id)) {
                    continue;
                }
                if query.tags.as_ref().is_some_and(|t| !t.matches(&chunk.tags)) {
                    continue;
                }
                if query.min_score.is_some_and(|min| hit.score < min) {
                    continue;
                }
                if !query.entities.is_empty() && !chunk.has_entity_label(&query.entities) {
                    continue;
                }
                let (source, extracted_at) = match sources.get(&chunk.document_id) {
                    Some(known) => known.clone(),
                    None => {
                        let Ok(doc) = self.store.document(&chunk.document_id) else {
                            continue;
                        };
                        let entry = (doc.origin, doc.extracted_at);
                        sources.insert(chunk.document_id, entry.clone());
                        entry
                    }
                };
                let score = hit.score + self.boost(extracted_at, now);
                pool.push(Candidate {
                    chunk,
                    source,
                    similarity: hit.score,
                    score,
                    seq: hit.seq,
                });
            }

            let ranked = self.collapse(pool);
            if ranked.len() >= k || exhausted {
                tracing::debug!(
                    fetched = fetch,
                    returned = ranked.len().min(k),
                    "retrieval finished"
                );
                return Ok(ranked.into_iter().take(k).collect());
            }
            fetch = fetch.saturating_mul(2).min(live);
        }
    }

    fn boost(&self, extracted_at: u64, now: u64) -> f32 {
        match self.settings.recency_boost {
            Some(b) if b.weight > 0.0 => {
                let age = now.saturating_sub(extracted_at) as f64;
                let half_lives = age / b.half_life_secs.max(1) as f64;
                (b.weight as f64 * (-half_lives).exp2()) as f32
            }
            _ => 0.0,
        }
    }

    /// Sort by score then sequence, keep the best member of each duplicate group.
    fn collapse(&self, mut pool: Vec<Candidate>) -> Vec<RetrievedChunk> {
        pool.sort_by(|a, b| {
            OrderedFloat(b.score)
                .cmp(&OrderedFloat(a.score))
                .then(a.seq.cmp(&b.seq))
        });
        let mut group_of: HashMap<Uuid, usize> = HashMap::new();
        let mut out: Vec<RetrievedChunk> = Vec::new();
        for c in pool {
            let group = c.chunk.canonical_id();
            if let Some(&at) = group_of.get(&group) {
                out[at].collapsed.push(c.chunk.id);
                continue;
            }
            group_of.insert(group, out.len());
            out.push(RetrievedChunk {
                chunk_id: c.chunk.id,
                score: c.score,
                similarity: c.similarity,
                snippet: snippet(&c.chunk.text, self.settings.snippet_chars),
                duplicate_of: c.chunk.duplicate_of,
                entities: c.chunk.entities,
                provenance: Provenance {
                    document_id: c.chunk.document_id,
                    source: c.source,
                    location: c.chunk.location,
                    tags: c.chunk.tags,
                },
                collapsed: Vec::new(),
            });
        }
        out
    }
}

/// First `max_chars` characters of `text` with whitespace collapsed, with an
/// ellipsis when cut.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.truncate(cut.trim_end().len());
    cut.push('…');
    cut
}
