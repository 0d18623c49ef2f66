//! Vector index over chunk embeddings.
//!
//! [`VectorIndex`] maps chunk ids to embedding vectors and answers top-k
//! cosine queries. Small indexes are scanned exactly; larger ones go through an
//! HNSW graph whose `ef_search` is calibrated against the exact scan so that
//! recall@k stays within the configured tolerance.
//!
//! Locking: a writer gate serializes every mutation (add, remove, rebuild);
//! the data itself sits behind a reader-writer lock. A rebuild builds the new
//! graph without holding the data lock and swaps it in at the end, so queries
//! keep running against the old graph meanwhile.

pub mod arena;
pub mod distance;
pub mod exact;
pub mod graph;
pub mod insert;
pub mod persist;
pub mod search;
pub mod visited;

use crate::config::{self, IndexSettings};
use crate::error::{Error, Result};
use arena::VectorArena;
use graph::HnswGraph;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub use arena::IndexEntry;

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
    /// Insertion sequence of the entry; lower wins ties.
    pub seq: u64,
}

/// Counters reported by [`VectorIndex::stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub dimension: usize,
    pub live_entries: usize,
    pub slots: usize,
    pub tombstones: usize,
    pub churn: usize,
    pub ef_search: usize,
    pub max_layer: usize,
}

/// Outcome of a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildReport {
    pub live_entries: usize,
    pub dropped_tombstones: usize,
    /// Recall@k of approximate search measured after the rebuild.
    pub recall: f32,
    pub ef_search: usize,
}

/// Arena, graph and bookkeeping guarded by the data lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexData {
    pub arena: VectorArena,
    pub graph: HnswGraph,
    pub next_seq: u64,
    #[serde(skip)]
    pub slot_of: HashMap<Uuid, u32>,
    #[serde(skip)]
    pub churn: usize,
}

impl IndexData {
    fn empty(settings: &IndexSettings) -> Self {
        Self {
            arena: VectorArena::new(settings.dimension),
            graph: HnswGraph::new(settings.hnsw.clone()),
            next_seq: 0,
            slot_of: HashMap::new(),
            churn: 0,
        }
    }

    /// Build fresh data from entries, linking them in ascending seq order.
    fn from_entries(settings: &IndexSettings, mut entries: Vec<IndexEntry>, next_seq: u64) -> Self {
        entries.sort_by_key(|e| e.seq);
        let mut data = Self::empty(settings);
        data.next_seq = next_seq;
        for entry in &entries {
            let slot = data
                .arena
                .push(entry.chunk_id, &entry.vector, entry.norm, entry.seq);
            data.graph.insert(&data.arena, slot);
            data.slot_of.insert(entry.chunk_id, slot);
        }
        data
    }

    /// Rebuild the id map from live slots; fails on duplicate live ids.
    fn index_slots(&mut self) -> std::result::Result<(), String> {
        self.slot_of.clear();
        for slot in 0..self.arena.slot_count() as u32 {
            if self.arena.is_deleted(slot) {
                continue;
            }
            if self.slot_of.insert(self.arena.chunk_id(slot), slot).is_some() {
                return Err(format!(
                    "chunk {} has more than one live entry",
                    self.arena.chunk_id(slot)
                ));
            }
        }
        Ok(())
    }

    fn live_count(&self) -> usize {
        self.slot_of.len()
    }

    fn search(
        &self,
        exact_threshold: usize,
        query: &[f32],
        query_norm: f32,
        k: usize,
        accept: &dyn Fn(u32) -> bool,
    ) -> Vec<(f32, u32)> {
        if self.live_count() <= exact_threshold {
            exact::exact_search(&self.arena, query, query_norm, k, accept)
        } else {
            search::knn_search(
                &self.graph,
                &self.arena,
                query,
                query_norm,
                k,
                self.graph.params.ef_search,
                accept,
            )
        }
    }

    /// Mean recall@k of the graph against the exact scan for `ef`, using a
    /// deterministic sample of stored vectors as queries.
    fn recall_at(&self, ef: usize) -> f32 {
        let live: Vec<u32> = self.slot_of.values().copied().collect();
        if live.is_empty() {
            return 1.0;
        }
        let mut sample = live;
        sample.sort_unstable_by_key(|&s| self.arena.seq(s));
        let step = (sample.len() / config::RECALL_SAMPLE_QUERIES).max(1);
        let k = config::RECALL_SAMPLE_K.min(sample.len());
        let everything = |_: u32| true;

        let mut total = 0.0;
        let mut n = 0;
        for &slot in sample.iter().step_by(step).take(config::RECALL_SAMPLE_QUERIES) {
            let query = self.arena.vector(slot);
            let query_norm = self.arena.norm(slot);
            let truth = exact::exact_search(&self.arena, query, query_norm, k, &everything);
            let approx =
                search::knn_search(&self.graph, &self.arena, query, query_norm, k, ef, &everything);
            total += exact::recall(&truth, &approx);
            n += 1;
        }
        total / n as f32
    }
}

/// Thread-safe chunk-id → vector index.
pub struct VectorIndex {
    settings: IndexSettings,
    data: Arc<RwLock<IndexData>>,
    writer: Mutex<()>,
}

impl VectorIndex {
    /// Empty index for `settings.dimension`.
    pub fn new(settings: IndexSettings) -> Result<Self> {
        if settings.dimension == 0 || settings.dimension > config::MAX_DIMENSION {
            return Err(Error::InvalidConfig(format!(
                "index dimension must be 1-{}, got {}",
                config::MAX_DIMENSION,
                settings.dimension
            )));
        }
        let data = IndexData::empty(&settings);
        Ok(Self {
            settings,
            data: Arc::new(RwLock::new(data)),
            writer: Mutex::new(()),
        })
    }

    pub(crate) fn from_data(settings: IndexSettings, data: IndexData) -> Self {
        Self {
            settings,
            data: Arc::new(RwLock::new(data)),
            writer: Mutex::new(()),
        }
    }

    /// Load from `dir` when a persisted index exists there, otherwise start empty.
    pub fn open(dir: &Path, settings: IndexSettings) -> Result<Self> {
        if persist::exists(dir) {
            persist::load(dir, settings)
        } else {
            Self::new(settings)
        }
    }

    /// Persist to `dir` (see [`persist`]).
    pub fn save(&self, dir: &Path) -> Result<()> {
        let _gate = self.writer.lock();
        let data = self.data.read();
        persist::save(dir, &data)
    }

    pub fn dimension(&self) -> usize {
        self.settings.dimension
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.data.read().live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chunk_id: &Uuid) -> bool {
        self.data.read().slot_of.contains_key(chunk_id)
    }

    /// Stored vector for a chunk.
    pub fn get(&self, chunk_id: &Uuid) -> Option<Vec<f32>> {
        let data = self.data.read();
        data.slot_of
            .get(chunk_id)
            .map(|&slot| data.arena.vector(slot).to_vec())
    }

    /// Live chunk ids in insertion order.
    pub fn chunk_ids(&self) -> Vec<Uuid> {
        let data = self.data.read();
        let mut live: Vec<(u64, Uuid)> = data
            .slot_of
            .iter()
            .map(|(id, &slot)| (data.arena.seq(slot), *id))
            .collect();
        live.sort_unstable();
        live.into_iter().map(|(_, id)| id).collect()
    }

    /// Add or replace the vector for `chunk_id`.
    ///
    /// Replacing keeps the entry's original insertion sequence, so its
    /// position in score ties does not change when a chunk is re-embedded.
    pub fn add(&self, chunk_id: Uuid, vector: &[f32]) -> Result<()> {
        let norm = distance::checked_norm(vector, self.settings.dimension)?;
        let _gate = self.writer.lock();
        self.add_locked(chunk_id, vector, norm);
        self.maybe_rebuild_locked()
    }

    /// Add many entries. Every vector is validated before any is inserted,
    /// so a bad vector leaves the index untouched.
    pub fn add_batch(&self, entries: &[(Uuid, Vec<f32>)]) -> Result<()> {
        let norms = entries
            .iter()
            .map(|(_, v)| distance::checked_norm(v, self.settings.dimension))
            .collect::<Result<Vec<f32>>>()?;
        let _gate = self.writer.lock();
        for ((id, vector), norm) in entries.iter().zip(norms) {
            self.add_locked(*id, vector, norm);
        }
        self.maybe_rebuild_locked()
    }

    fn add_locked(&self, chunk_id: Uuid, vector: &[f32], norm: f32) {
        let mut data = self.data.write();
        let seq = match data.slot_of.get(&chunk_id).copied() {
            Some(old) => {
                let seq = data.arena.seq(old);
                data.arena.mark_deleted(old);
                seq
            }
            None => {
                let seq = data.next_seq;
                data.next_seq += 1;
                seq
            }
        };
        let data = &mut *data;
        let slot = data.arena.push(chunk_id, vector, norm, seq);
        data.graph.insert(&data.arena, slot);
        data.slot_of.insert(chunk_id, slot);
        data.churn += 1;
    }

    /// Remove one entry. Returns whether it was present. The slot is
    /// tombstoned immediately and reclaimed by the next rebuild.
    pub fn remove(&self, chunk_id: &Uuid) -> Result<bool> {
        let removed = self.remove_many(std::slice::from_ref(chunk_id))?;
        Ok(removed == 1)
    }

    /// Remove every listed entry; unknown ids are ignored. Returns how many were removed.
    pub fn remove_many(&self, chunk_ids: &[Uuid]) -> Result<usize> {
        let _gate = self.writer.lock();
        let removed = {
            let mut data = self.data.write();
            let mut removed = 0;
            for id in chunk_ids {
                if let Some(slot) = data.slot_of.remove(id) {
                    data.arena.mark_deleted(slot);
                    data.churn += 1;
                    removed += 1;
                }
            }
            removed
        };
        if removed > 0 {
            tracing::debug!(removed, "index entries tombstoned");
            self.maybe_rebuild_locked()?;
        }
        Ok(removed)
    }

    /// Top-`k` live entries by cosine similarity to `query`.
    ///
    /// `filter`, when given, restricts results to chunk ids it accepts.
    /// Results are ordered by score descending, then insertion sequence ascending.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(&Uuid) -> bool>,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Err(Error::InvalidQuery("k must be at least 1".into()));
        }
        let query_norm = distance::checked_norm(query, self.settings.dimension)?;
        let data = self.data.read();
        let arena = &data.arena;
        let accept = |slot: u32| filter.map_or(true, |f| f(&arena.chunk_id(slot)));
        let found = data.search(
            self.settings.exact_scan_threshold,
            query,
            query_norm,
            k,
            &accept,
        );
        Ok(found
            .into_iter()
            .map(|(score, slot)| SearchHit {
                chunk_id: arena.chunk_id(slot),
                score,
                seq: arena.seq(slot),
            })
            .collect())
    }

    /// Compact tombstones, rebuild the graph from live entries and recalibrate.
    pub fn rebuild(&self) -> Result<RebuildReport> {
        let _gate = self.writer.lock();
        self.rebuild_locked()
    }

    fn maybe_rebuild_locked(&self) -> Result<()> {
        let (churn, live) = {
            let data = self.data.read();
            (data.churn, data.live_count())
        };
        let ratio = self.settings.rebuild_churn_ratio;
        if ratio > 0.0
            && churn >= config::REBUILD_MIN_CHURN
            && churn as f32 >= ratio * live.max(1) as f32
        {
            tracing::info!(churn, live, "churn threshold reached, rebuilding index");
            self.rebuild_locked()?;
        }
        Ok(())
    }

    /// Caller holds the writer gate.
    fn rebuild_locked(&self) -> Result<RebuildReport> {
        let start = Instant::now();

        // Snapshot under the read lock.
        let (entries, next_seq, slots) = {
            let data = self.data.read();
            let entries: Vec<IndexEntry> = data
                .slot_of
                .values()
                .map(|&slot| IndexEntry {
                    chunk_id: data.arena.chunk_id(slot),
                    vector: data.arena.vector(slot).to_vec(),
                    norm: data.arena.norm(slot),
                    seq: data.arena.seq(slot),
                })
                .collect();
            (entries, data.next_seq, data.arena.slot_count())
        };
        let live = entries.len();

        // Build with no lock held; queries continue on the old graph.
        let mut fresh = IndexData::from_entries(&self.settings, entries, next_seq);
        let (recall, ef_search) = calibrate(&mut fresh, &self.settings);

        // Swap.
        *self.data.write() = fresh;

        tracing::info!(
            live,
            dropped = slots - live,
            recall,
            ef_search,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "index rebuilt"
        );
        Ok(RebuildReport {
            live_entries: live,
            dropped_tombstones: slots - live,
            recall,
            ef_search,
        })
    }

    /// Current approximate recall@k against the exact scan.
    pub fn measure_recall(&self) -> f32 {
        let data = self.data.read();
        if data.live_count() <= self.settings.exact_scan_threshold {
            return 1.0;
        }
        data.recall_at(data.graph.params.ef_search)
    }

    /// Raise `ef_search` until recall meets the tolerance. Returns the measured recall.
    pub fn calibrate(&self) -> f32 {
        let _gate = self.writer.lock();
        let mut data = self.data.write();
        calibrate(&mut data, &self.settings).0
    }

    pub fn stats(&self) -> IndexStats {
        let data = self.data.read();
        let live = data.live_count();
        IndexStats {
            dimension: self.settings.dimension,
            live_entries: live,
            slots: data.arena.slot_count(),
            tombstones: data.arena.slot_count() - live,
            churn: data.churn,
            ef_search: data.graph.params.ef_search,
            max_layer: data.graph.max_layer,
        }
    }
}

/// Double `ef_search` from its configured value until recall reaches
/// `1 - tolerance` or the cap is hit. Exact-scan-sized data reports full recall.
fn calibrate(data: &mut IndexData, settings: &IndexSettings) -> (f32, usize) {
    if data.live_count() <= settings.exact_scan_threshold {
        return (1.0, data.graph.params.ef_search);
    }
    let target = 1.0 - settings.recall_tolerance;
    let mut ef = settings.hnsw.ef_search.max(1);
    let mut recall = data.recall_at(ef);
    while recall < target && ef < config::HNSW_MAX_EF_SEARCH {
        ef = (ef * 2).min(config::HNSW_MAX_EF_SEARCH);
        recall = data.recall_at(ef);
    }
    if recall < target {
        tracing::warn!(
            recall,
            target,
            ef,
            "approximate recall below tolerance at maximum ef_search"
        );
    }
    data.graph.params.ef_search = ef;
    (recall, ef)
}
