//! Staged, resumable ingestion pipeline.
//!
//! Documents move `Pending → Extracted → Enriched → Embedded → Indexed → Ready`.
//! Each stage runs over every document waiting for it, persists its outputs
//! (extraction artifacts, the chunk store snapshot, the index files) and only
//! then journals the transitions. A failing document is recorded as
//! `Failed { stage, reason }` and the others carry on. Restarting replays the
//! journal, so work resumes from the last committed transition.
//!
//! On-disk layout under the data directory:
//!
//! ```text
//! journal.bin          checkpoint journal
//! chunks.bin           chunk store snapshot
//! index/vectors.bin    vector index payload
//! index/index.json     vector index sidecar
//! extracted/<id>.json  extraction artifacts
//! extracted/<id>.skipped.json  pages a PDF extraction skipped
//! ```

pub mod checkpoint;
pub mod extract;
pub mod pdf;
pub mod pool;

use crate::chunk::{ChunkStage, Document};
use crate::config::Settings;
use crate::embed::Embedder;
use crate::enrich::{EnrichOutcome, EnrichSettings, Enricher};
use crate::error::{Error, ErrorKind, Result};
use crate::index::{RebuildReport, VectorIndex};
use crate::retrieve::{RetrieveSettings, Retriever};
use crate::store::{ChunkStore, STORE_FILE};
pub use checkpoint::DocRecord;
use checkpoint::{Journal, JournalEntry};
use extract::{Extractor, FileExtractor, SkippedPage};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const INDEX_DIR: &str = "index";

/// The four stages, named after the state each one produces.
pub const STAGES: [ChunkStage; 4] = [
    ChunkStage::Extracted,
    ChunkStage::Enriched,
    ChunkStage::Embedded,
    ChunkStage::Indexed,
];

/// Per-document pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocState {
    Pending,
    Extracted,
    Enriched,
    Embedded,
    Indexed,
    Ready,
    /// `stage` is the state the failed stage was trying to reach.
    Failed { stage: ChunkStage, reason: String },
}

impl DocState {
    fn reached(stage: ChunkStage) -> Self {
        match stage {
            ChunkStage::Extracted => DocState::Extracted,
            ChunkStage::Enriched => DocState::Enriched,
            ChunkStage::Embedded => DocState::Embedded,
            ChunkStage::Indexed => DocState::Indexed,
        }
    }

    /// The state a document must be in for `stage` to pick it up.
    fn before(stage: ChunkStage) -> Self {
        match stage {
            ChunkStage::Extracted => DocState::Pending,
            ChunkStage::Enriched => DocState::Extracted,
            ChunkStage::Embedded => DocState::Enriched,
            ChunkStage::Indexed => DocState::Embedded,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, DocState::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DocState::Failed { .. })
    }
}

impl fmt::Display for DocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocState::Pending => f.write_str("pending"),
            DocState::Extracted => f.write_str("extracted"),
            DocState::Enriched => f.write_str("enriched"),
            DocState::Embedded => f.write_str("embedded"),
            DocState::Indexed => f.write_str("indexed"),
            DocState::Ready => f.write_str("ready"),
            DocState::Failed { stage, reason } => {
                write!(f, "failed({}): {}", stage_name(*stage), reason)
            }
        }
    }
}

pub fn stage_name(stage: ChunkStage) -> &'static str {
    match stage {
        ChunkStage::Extracted => "extract",
        ChunkStage::Enriched => "enrich",
        ChunkStage::Embedded => "embed",
        ChunkStage::Indexed => "index",
    }
}

/// Cooperative cancellation shared between the orchestrator and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A document that failed a stage, with the category of its error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub document_id: Uuid,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Outcome of one stage over its eligible documents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: ChunkStage,
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<StageFailure>,
}

impl StageReport {
    fn new(stage: ChunkStage) -> Self {
        Self {
            stage,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Outcome of a full run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    pub ready: usize,
    pub failed: usize,
}

impl RunReport {
    /// Failures recorded by the stages of this run, in stage order. Documents
    /// that were already failed before the run are not included.
    pub fn failures(&self) -> impl Iterator<Item = &StageFailure> {
        self.stages.iter().flat_map(|s| s.failed.iter())
    }

    /// `Err(DocumentsFailed)` categorized by the first failure when any
    /// document failed in this run.
    pub fn check(&self) -> Result<()> {
        let mut failures = self.failures();
        let Some(first) = failures.next() else {
            return Ok(());
        };
        Err(Error::DocumentsFailed {
            failed: 1 + failures.count(),
            kind: first.kind,
            first: format!("{}: {}", first.document_id, first.reason),
        })
    }
}

/// Errors that abort a stage instead of failing a single document.
fn is_fatal(err: &Error) -> bool {
    matches!(
        err,
        Error::CorruptIndex { .. } | Error::DimensionMismatch { .. } | Error::Cancelled
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Drives documents through the stages and owns the persisted state.
pub struct Orchestrator {
    data_dir: PathBuf,
    settings: Settings,
    store: Arc<ChunkStore>,
    index: Arc<VectorIndex>,
    enricher: Enricher,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn Extractor>,
    journal: Journal,
    states: RwLock<BTreeMap<Uuid, DocRecord>>,
    cancel: CancelFlag,
    /// Serializes runs, retries and deletes.
    gate: Mutex<()>,
}

impl Orchestrator {
    /// Open the data directory, loading the store, the index and the journal.
    pub fn open(data_dir: impl Into<PathBuf>, settings: Settings, embedder: Arc<dyn Embedder>) -> Result<Self> {
        settings.validate()?;
        if embedder.dimension() != settings.embedding_dimension {
            return Err(Error::InvalidConfig(format!(
                "embedder {} produces {} dimensions but embedding_dimension is {}",
                embedder.name(),
                embedder.dimension(),
                settings.embedding_dimension
            )));
        }
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let store = Arc::new(ChunkStore::load(&data_dir)?);
        let index = Arc::new(VectorIndex::open(
            &data_dir.join(INDEX_DIR),
            settings.index_settings(),
        )?);
        store.attach_index(index.clone());
        reconcile(&store, &index)?;

        let (journal, states, stats) = Journal::open(&data_dir)?;
        let enricher = Enricher::new(store.clone(), EnrichSettings::from(&settings));
        tracing::info!(
            data_dir = ?data_dir,
            documents = states.len(),
            chunks = store.chunk_count(),
            indexed = index.len(),
            journal_entries = stats.applied,
            "pipeline opened"
        );
        Ok(Self {
            extractor: Arc::new(FileExtractor::from(&settings)),
            data_dir,
            settings,
            store,
            index,
            enricher,
            embedder,
            journal,
            states: RwLock::new(states),
            cancel: CancelFlag::new(),
            gate: Mutex::new(()),
        })
    }

    /// Replace the default text and PDF extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// A retriever over this pipeline's store and index.
    pub fn retriever(&self) -> Retriever {
        Retriever::new(
            self.store.clone(),
            self.index.clone(),
            self.embedder.clone(),
            RetrieveSettings::from(&self.settings),
        )
    }

    /// Register every supported file under `dir` as `Pending`. Files already
    /// known keep their state. Returns the ids of all supported files found.
    pub fn discover(&self, dir: &Path) -> Result<Vec<Uuid>> {
        let _gate = self.gate.lock();
        if !dir.is_dir() {
            return Err(Error::NotFound {
                kind: "input directory",
                id: dir.display().to_string(),
            });
        }
        let mut files = Vec::new();
        collect_files(dir, self.extractor.as_ref(), &mut files)?;
        files.sort();

        let mut found = Vec::with_capacity(files.len());
        let mut fresh = Vec::new();
        {
            let states = self.states.read();
            for path in files {
                let origin = fs::canonicalize(&path)?.display().to_string();
                let id = crate::chunk::document_id_for(&origin);
                found.push(id);
                if !states.contains_key(&id) {
                    fresh.push((id, origin));
                }
            }
        }
        let at = unix_now();
        let entries: Vec<JournalEntry> = fresh
            .iter()
            .map(|(id, origin)| JournalEntry::Transition {
                document_id: *id,
                origin: origin.clone(),
                state: DocState::Pending,
                at,
            })
            .collect();
        self.journal.append_all(&entries)?;
        let mut states = self.states.write();
        for (id, origin) in fresh {
            states.insert(
                id,
                DocRecord {
                    document_id: id,
                    origin,
                    state: DocState::Pending,
                    updated_at: at,
                },
            );
        }
        tracing::info!(dir = ?dir, found = found.len(), new = entries.len(), "discovered documents");
        Ok(found)
    }

    /// Run every stage, then report how many documents are ready or failed.
    pub fn run(&self) -> Result<RunReport> {
        let _gate = self.gate.lock();
        let mut stages = Vec::with_capacity(STAGES.len());
        for stage in STAGES {
            stages.push(self.run_stage_locked(stage, None)?);
        }
        let states = self.states.read();
        let ready = states.values().filter(|r| r.state.is_ready()).count();
        let failed = states.values().filter(|r| r.state.is_failed()).count();
        if self.journal.entries() > states.len() {
            self.journal.compact(&states)?;
        }
        tracing::info!(ready, failed, "pipeline run finished");
        Ok(RunReport {
            stages,
            ready,
            failed,
        })
    }

    /// Run one stage over every document waiting for it.
    pub fn run_stage(&self, stage: ChunkStage) -> Result<StageReport> {
        let _gate = self.gate.lock();
        self.run_stage_locked(stage, None)
    }

    /// Re-enter a failed document at its failed stage and drive it as far as
    /// it goes. Documents that are not failed just continue from where they are.
    pub fn retry(&self, document_id: &Uuid) -> Result<DocState> {
        let _gate = self.gate.lock();
        let current = self
            .state(document_id)
            .ok_or_else(|| Error::document_not_found(document_id))?;
        if let DocState::Failed { stage, reason } = &current {
            tracing::info!(document = %document_id, stage = stage_name(*stage), %reason, "retrying document");
            self.commit(vec![(*document_id, DocState::before(*stage))])?;
        }
        let only: HashSet<Uuid> = [*document_id].into_iter().collect();
        for stage in STAGES {
            self.run_stage_locked(stage, Some(&only))?;
        }
        self.state(document_id)
            .ok_or_else(|| Error::document_not_found(document_id))
    }

    /// Delete a document: its chunks, index entries, artifact and journal record.
    pub fn delete(&self, document_id: &Uuid) -> Result<Vec<Uuid>> {
        let _gate = self.gate.lock();
        let known = self.states.read().contains_key(document_id);
        let removed = match self.store.delete_document(document_id) {
            Ok(removed) => removed,
            Err(Error::NotFound { .. }) if known => Vec::new(),
            Err(e) => return Err(e),
        };
        self.enricher.forget(&removed);
        extract::remove_artifact(&self.data_dir, document_id)?;
        self.index.save(&self.data_dir.join(INDEX_DIR))?;
        self.store.save(&self.data_dir)?;
        self.journal.append(&JournalEntry::Forget {
            document_id: *document_id,
        })?;
        self.states.write().remove(document_id);
        Ok(removed)
    }

    /// Compact the index, recalibrate it and persist the result.
    pub fn rebuild_index(&self) -> Result<RebuildReport> {
        let _gate = self.gate.lock();
        let report = self.index.rebuild()?;
        self.index.save(&self.data_dir.join(INDEX_DIR))?;
        Ok(report)
    }

    /// Rebuild the index files under `data_dir` from the embeddings in the
    /// chunk store, for when the persisted index no longer loads.
    ///
    /// Chunks that reached `Indexed` are re-added in document origin and
    /// location order. Runs without an open pipeline.
    pub fn recover_index(data_dir: &Path, settings: &Settings) -> Result<RebuildReport> {
        settings.validate()?;
        let store = ChunkStore::load(data_dir)?;
        let index = VectorIndex::new(settings.index_settings())?;

        let mut documents = store.documents();
        documents.sort_by(|a, b| a.origin.cmp(&b.origin));
        let mut entries = Vec::new();
        for doc in &documents {
            for chunk in store.list_by_document(&doc.id)? {
                if chunk.document_id != doc.id || chunk.stage < ChunkStage::Indexed {
                    continue;
                }
                let Some(vector) = chunk.embedding else {
                    continue;
                };
                if vector.len() != settings.embedding_dimension {
                    return Err(Error::corrupt(
                        data_dir.join(STORE_FILE),
                        format!(
                            "chunk {} has {} dimensions, expected {}",
                            chunk.id,
                            vector.len(),
                            settings.embedding_dimension
                        ),
                    ));
                }
                entries.push((chunk.id, vector));
            }
        }
        index.add_batch(&entries)?;
        let report = index.rebuild()?;
        index.save(&data_dir.join(INDEX_DIR))?;
        tracing::info!(
            data_dir = %data_dir.display(),
            live = report.live_entries,
            recall = report.recall,
            "index recovered from chunk store"
        );
        Ok(report)
    }

    /// Pages the last extraction of a document skipped.
    pub fn skipped_pages(&self, document_id: &Uuid) -> Result<Vec<SkippedPage>> {
        extract::read_skipped(&self.data_dir, document_id)
    }

    pub fn state(&self, document_id: &Uuid) -> Option<DocState> {
        self.states.read().get(document_id).map(|r| r.state.clone())
    }

    /// Every known document, ordered by origin.
    pub fn status(&self) -> Vec<DocRecord> {
        let mut all: Vec<DocRecord> = self.states.read().values().cloned().collect();
        all.sort_by(|a, b| a.origin.cmp(&b.origin));
        all
    }

    fn eligible(&self, stage: ChunkStage, only: Option<&HashSet<Uuid>>) -> Vec<DocRecord> {
        let wanted = DocState::before(stage);
        let mut out: Vec<DocRecord> = self
            .states
            .read()
            .values()
            .filter(|r| r.state == wanted && only.map_or(true, |o| o.contains(&r.document_id)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.origin.cmp(&b.origin));
        out
    }

    fn run_stage_locked(&self, stage: ChunkStage, only: Option<&HashSet<Uuid>>) -> Result<StageReport> {
        let started = Instant::now();
        let docs = self.eligible(stage, only);
        let outcomes = match stage {
            ChunkStage::Extracted => self.extract_stage(&docs)?,
            ChunkStage::Enriched => self.enrich_stage(&docs)?,
            ChunkStage::Embedded => self.embed_stage(&docs)?,
            ChunkStage::Indexed => self.index_stage(&docs)?,
        };

        let mut report = StageReport::new(stage);
        let mut updates = Vec::with_capacity(outcomes.len());
        let mut fatal = None;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    report.succeeded.push(id);
                    updates.push((id, DocState::reached(stage)));
                }
                Err(err) if is_fatal(&err) => {
                    fatal.get_or_insert(err);
                }
                Err(err) => {
                    tracing::warn!(
                        document = %id,
                        stage = stage_name(stage),
                        error = %err,
                        "document failed"
                    );
                    let reason = err.to_string();
                    report.failed.push(StageFailure {
                        document_id: id,
                        kind: err.kind(),
                        reason: reason.clone(),
                    });
                    updates.push((id, DocState::Failed { stage, reason }));
                }
            }
        }
        self.commit(updates)?;
        if stage == ChunkStage::Indexed {
            self.finalize(only)?;
        }

        tracing::info!(
            stage = stage_name(stage),
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stage finished"
        );
        if let Some(err) = fatal {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(report)
    }

    /// Journal transitions, then apply them to the in-memory states.
    fn commit(&self, updates: Vec<(Uuid, DocState)>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let at = unix_now();
        let mut states = self.states.write();
        let entries: Vec<JournalEntry> = updates
            .iter()
            .filter_map(|(id, state)| {
                states.get(id).map(|r| JournalEntry::Transition {
                    document_id: *id,
                    origin: r.origin.clone(),
                    state: state.clone(),
                    at,
                })
            })
            .collect();
        self.journal.append_all(&entries)?;
        for (id, state) in updates {
            if let Some(record) = states.get_mut(&id) {
                record.state = state;
                record.updated_at = at;
            }
        }
        Ok(())
    }

    /// Move indexed documents whose chunks are all present in the index to `Ready`.
    fn finalize(&self, only: Option<&HashSet<Uuid>>) -> Result<()> {
        let indexed: Vec<Uuid> = self
            .states
            .read()
            .values()
            .filter(|r| r.state == DocState::Indexed && only.map_or(true, |o| o.contains(&r.document_id)))
            .map(|r| r.document_id)
            .collect();
        let mut updates = Vec::new();
        for id in indexed {
            let doc = self.store.document(&id)?;
            match doc.chunk_ids.iter().find(|c| !self.index.contains(c)) {
                None => updates.push((id, DocState::Ready)),
                Some(missing) => updates.push((
                    id,
                    DocState::Failed {
                        stage: ChunkStage::Indexed,
                        reason: format!("chunk {missing} is missing from the index"),
                    },
                )),
            }
        }
        self.commit(updates)
    }

    fn extract_stage(&self, docs: &[DocRecord]) -> Result<Vec<(Uuid, Result<()>)>> {
        let extractor = self.extractor.as_ref();
        let data_dir = self.data_dir.as_path();
        let results = pool::run_parallel(
            docs.to_vec(),
            self.settings.worker_threads,
            &self.cancel,
            |record: DocRecord| -> Result<()> {
                let path = Path::new(&record.origin);
                if !extractor.supports(path) {
                    return Err(Error::ExtractionFailure {
                        path: record.origin.clone(),
                        reason: "unsupported file type".into(),
                    });
                }
                let doc = Document::new(record.origin.clone(), 0);
                let extraction = extractor.extract_pages(path, &doc)?;
                extract::write_artifact(data_dir, &doc.id, &extraction.chunks)?;
                extract::write_skipped(data_dir, &doc.id, &extraction.skipped_pages)?;
                for skipped in &extraction.skipped_pages {
                    tracing::warn!(
                        document = %doc.id,
                        page = skipped.page,
                        reason = %skipped.reason,
                        "page skipped"
                    );
                }
                tracing::debug!(document = %doc.id, chunks = extraction.chunks.len(), "extracted");
                Ok(())
            },
        );

        let at = unix_now();
        let mut outcomes = Vec::new();
        for (record, result) in docs.iter().zip(results) {
            let Some(result) = result else { continue };
            if result.is_ok() {
                self.store
                    .register_document(Document::new(record.origin.clone(), at));
            }
            outcomes.push((record.document_id, result));
        }
        if outcomes.iter().any(|(_, r)| r.is_ok()) {
            self.store.save(&self.data_dir)?;
        }
        Ok(outcomes)
    }

    fn enrich_stage(&self, docs: &[DocRecord]) -> Result<Vec<(Uuid, Result<()>)>> {
        let mut outcomes = Vec::new();
        for record in docs {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = (|| -> Result<()> {
                let doc = self.store.document(&record.document_id)?;
                let raw = extract::read_artifact(&self.data_dir, &doc.id)?;
                let mut created = 0usize;
                for r in &raw {
                    if let EnrichOutcome::Created(_) = self.enricher.process(&doc, r)? {
                        created += 1;
                    }
                }
                tracing::debug!(document = %doc.id, raw = raw.len(), created, "enriched");
                Ok(())
            })();
            outcomes.push((record.document_id, result));
        }
        if outcomes.iter().any(|(_, r)| r.is_ok()) {
            self.store.save(&self.data_dir)?;
        }
        Ok(outcomes)
    }

    fn embed_stage(&self, docs: &[DocRecord]) -> Result<Vec<(Uuid, Result<()>)>> {
        // one work item per chunk still lacking a vector
        let mut work: Vec<(Uuid, Uuid, String)> = Vec::new();
        let mut seen = HashSet::new();
        let mut outcomes: Vec<(Uuid, Result<()>)> = Vec::new();
        for record in docs {
            match self.store.document(&record.document_id) {
                Ok(doc) => {
                    for chunk_id in &doc.chunk_ids {
                        let chunk = self.store.get(chunk_id)?;
                        if !chunk.is_embedded() && seen.insert(*chunk_id) {
                            work.push((doc.id, chunk.id, chunk.text));
                        }
                    }
                    outcomes.push((doc.id, Ok(())));
                }
                Err(e) => outcomes.push((record.document_id, Err(e))),
            }
        }

        let embedder = self.embedder.as_ref();
        let vectors = pool::run_parallel(
            work.iter().map(|(_, _, text)| text.as_str()).collect(),
            self.settings.worker_threads,
            &self.cancel,
            |text: &str| embedder.embed(text),
        );

        let mut failures: HashMap<Uuid, Error> = HashMap::new();
        let mut skipped: HashSet<Uuid> = HashSet::new();
        for ((doc_id, chunk_id, _), result) in work.iter().zip(vectors) {
            match result {
                Some(Ok(vector)) => self.store.set_embedding(chunk_id, vector)?,
                Some(Err(e)) => {
                    failures.entry(*doc_id).or_insert(e);
                }
                None => {
                    skipped.insert(*doc_id);
                }
            }
        }
        if !work.is_empty() {
            self.store.save(&self.data_dir)?;
        }

        Ok(outcomes
            .into_iter()
            .filter(|(id, _)| !skipped.contains(id))
            .map(|(id, outcome)| match failures.remove(&id) {
                Some(e) => (id, Err(e)),
                None => (id, outcome),
            })
            .collect())
    }

    fn index_stage(&self, docs: &[DocRecord]) -> Result<Vec<(Uuid, Result<()>)>> {
        let mut outcomes = Vec::new();
        for record in docs {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = (|| -> Result<()> {
                let doc = self.store.document(&record.document_id)?;
                for chunk_id in &doc.chunk_ids {
                    if !self.index.contains(chunk_id) {
                        let chunk = self.store.get(chunk_id)?;
                        let vector = chunk.embedding.ok_or_else(|| {
                            Error::InvalidVector(format!("chunk {chunk_id} has no embedding"))
                        })?;
                        self.enricher
                            .confirm_duplicate(chunk_id, &vector, &self.index)?;
                        self.index.add(*chunk_id, &vector)?;
                    }
                    self.store.mark_indexed(chunk_id)?;
                }
                Ok(())
            })();
            outcomes.push((record.document_id, result));
        }
        if !outcomes.is_empty() {
            self.index.save(&self.data_dir.join(INDEX_DIR))?;
            self.store.save(&self.data_dir)?;
        }
        Ok(outcomes)
    }
}

fn collect_files(dir: &Path, extractor: &dyn Extractor, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, extractor, out)?;
        } else if extractor.supports(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// Drop index entries that no longer match an embedded chunk in the store.
/// Happens when a crash lands between saving the index and saving the store.
fn reconcile(store: &ChunkStore, index: &VectorIndex) -> Result<()> {
    let stale: Vec<Uuid> = index
        .chunk_ids()
        .into_iter()
        .filter(|id| store.get(id).map_or(true, |c| !c.is_embedded()))
        .collect();
    if !stale.is_empty() {
        tracing::warn!(count = stale.len(), "dropping index entries without an embedded chunk");
        index.remove_many(&stale)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashingEmbedder;
    use tempfile::TempDir;

    const DIM: usize = 128;

    fn settings() -> Settings {
        Settings {
            embedding_dimension: DIM,
            worker_threads: 2,
            ..Settings::default()
        }
    }

    fn open(data: &Path) -> Orchestrator {
        Orchestrator::open(data, settings(), Arc::new(HashingEmbedder::new(DIM).unwrap())).unwrap()
    }

    fn write(dir: &Path, name: &str, text: &str) {
        fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn test_run_reaches_ready_and_resumes() {
        let input = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        write(input.path(), "a.txt", "Rivers carve canyons over time. Rain feeds the rivers.");
        write(input.path(), "b.md", "# Notes\n\nGlaciers move slowly. Ice shapes valleys.");

        let ids = {
            let p = open(data.path());
            let ids = p.discover(input.path()).unwrap();
            assert_eq!(ids.len(), 2);
            let report = p.run().unwrap();
            assert_eq!(report.ready, 2);
            assert_eq!(report.failed, 0);
            ids
        };

        let p = open(data.path());
        for id in &ids {
            assert_eq!(p.state(id), Some(DocState::Ready));
        }
        // nothing left to do on a rerun
        let report = p.run().unwrap();
        assert!(report.stages.iter().all(|s| s.succeeded.is_empty()));
        assert_eq!(p.discover(input.path()).unwrap(), ids);
        assert!(p.index().len() >= 2);
    }

    #[test]
    fn test_failed_document_is_isolated_and_retryable() {
        let input = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        write(input.path(), "good.txt", "Bees pollinate flowers.");
        fs::write(input.path().join("bad.txt"), [0xffu8, 0xfe, 0x00]).unwrap();

        let p = open(data.path());
        p.discover(input.path()).unwrap();
        let report = p.run().unwrap();
        assert_eq!(report.ready, 1);
        assert_eq!(report.failed, 1);
        let err = report.check().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Extraction);
        assert_eq!(err.exit_code(), 2);
        assert_eq!(report.failures().count(), 1);

        let bad = p
            .status()
            .into_iter()
            .find(|r| r.origin.ends_with("bad.txt"))
            .unwrap();
        assert!(matches!(
            bad.state,
            DocState::Failed {
                stage: ChunkStage::Extracted,
                ..
            }
        ));

        fs::write(input.path().join("bad.txt"), "Now it is readable text.").unwrap();
        assert_eq!(p.retry(&bad.document_id).unwrap(), DocState::Ready);
    }

    #[test]
    fn test_pdf_pages_are_ingested_and_skips_recorded() {
        let input = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        pdf::tests::write_pdf(
            &input.path().join("atlas.pdf"),
            &[None, Some("Deserts receive little rain.")],
        );
        let p = open(data.path());
        let ids = p.discover(input.path()).unwrap();
        assert_eq!(ids.len(), 1);
        p.run().unwrap().check().unwrap();

        let chunks = p.store().list_by_document(&ids[0]).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].location.page, 2);
        let skipped = p.skipped_pages(&ids[0]).unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].page, 1);

        p.delete(&ids[0]).unwrap();
        assert!(p.skipped_pages(&ids[0]).unwrap().is_empty());
    }

    #[test]
    fn test_single_stages_advance_one_step() {
        let input = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        write(input.path(), "a.txt", "Stars form in nebulae.");
        let p = open(data.path());
        let ids = p.discover(input.path()).unwrap();

        p.run_stage(ChunkStage::Extracted).unwrap();
        assert_eq!(p.state(&ids[0]), Some(DocState::Extracted));
        // embedding before enrichment finds nothing eligible
        let early = p.run_stage(ChunkStage::Embedded).unwrap();
        assert!(early.succeeded.is_empty());
        p.run_stage(ChunkStage::Enriched).unwrap();
        p.run_stage(ChunkStage::Embedded).unwrap();
        assert_eq!(p.state(&ids[0]), Some(DocState::Embedded));
        p.run_stage(ChunkStage::Indexed).unwrap();
        assert_eq!(p.state(&ids[0]), Some(DocState::Ready));
    }

    #[test]
    fn test_delete_cascades() {
        let input = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        write(input.path(), "a.txt", "Volcanoes erupt lava.");
        write(input.path(), "b.txt", "Oceans cover most of the planet.");
        let p = open(data.path());
        let ids = p.discover(input.path()).unwrap();
        p.run().unwrap();

        let removed = p.delete(&ids[0]).unwrap();
        assert!(!removed.is_empty());
        assert!(removed.iter().all(|c| !p.index().contains(c)));
        assert_eq!(p.state(&ids[0]), None);
        assert!(matches!(p.delete(&ids[0]), Err(Error::NotFound { .. })));
        drop(p);

        let p = open(data.path());
        assert_eq!(p.state(&ids[0]), None);
        assert_eq!(p.state(&ids[1]), Some(DocState::Ready));
    }

    #[test]
    fn test_rebuild_index_drops_tombstones_and_persists() {
        let input = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        write(input.path(), "a.txt", "Bridges span rivers. Tunnels cross mountains.");
        write(input.path(), "b.txt", "Canals link seas.");
        let p = open(data.path());
        let ids = p.discover(input.path()).unwrap();
        p.run().unwrap();
        p.delete(&ids[0]).unwrap();
        assert!(p.index().stats().tombstones > 0);

        let report = p.rebuild_index().unwrap();
        assert_eq!(report.live_entries, p.index().len());
        assert_eq!(p.index().stats().tombstones, 0);
        drop(p);
        assert_eq!(open(data.path()).index().stats().tombstones, 0);
    }

    #[test]
    fn test_run_compacts_journal() {
        let input = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        write(input.path(), "a.txt", "Moss grows on stones.");
        write(input.path(), "b.txt", "Lichens survive on bare rock.");
        let before = {
            let p = open(data.path());
            p.discover(input.path()).unwrap();
            let report = p.run().unwrap();
            report.check().unwrap();
            // one transition per document survives compaction
            assert_eq!(p.journal.entries(), 2);
            p.status()
        };
        let p = open(data.path());
        assert_eq!(p.status(), before);
        assert_eq!(p.journal.entries(), 2);
    }

    #[test]
    fn test_recover_index_from_store() {
        let input = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        write(input.path(), "a.txt", "Owls hunt at night. Hawks hunt by day.");
        write(input.path(), "b.txt", "Bats navigate by echolocation.");
        let (ids, hits) = {
            let p = open(data.path());
            p.discover(input.path()).unwrap();
            p.run().unwrap();
            let hits = p
                .retriever()
                .retrieve(&crate::retrieve::Query::new("owls hunt", 2))
                .unwrap();
            (p.index().chunk_ids(), hits)
        };

        let sidecar = data.path().join(INDEX_DIR).join(crate::index::persist::SIDECAR_FILE);
        fs::write(&sidecar, b"{ not json").unwrap();
        let err = Orchestrator::open(
            data.path(),
            settings(),
            Arc::new(HashingEmbedder::new(DIM).unwrap()),
        )
        .err()
        .unwrap();
        assert_eq!(err.exit_code(), 4);

        let report = Orchestrator::recover_index(data.path(), &settings()).unwrap();
        assert_eq!(report.live_entries, ids.len());
        let p = open(data.path());
        let mut recovered = p.index().chunk_ids();
        recovered.sort();
        let mut ids = ids;
        ids.sort();
        assert_eq!(recovered, ids);
        let again = p
            .retriever()
            .retrieve(&crate::retrieve::Query::new("owls hunt", 2))
            .unwrap();
        let chunk_ids = |r: &[crate::retrieve::RetrievedChunk]| {
            r.iter().map(|h| h.chunk_id).collect::<Vec<_>>()
        };
        assert_eq!(chunk_ids(&again), chunk_ids(&hits));
    }

    #[test]
    fn test_cancel_stops_before_work() {
        let input = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        write(input.path(), "a.txt", "Wind turns turbines.");
        let p = open(data.path());
        let ids = p.discover(input.path()).unwrap();
        p.cancel_flag().cancel();
        assert!(matches!(p.run(), Err(Error::Cancelled)));
        assert_eq!(p.state(&ids[0]), Some(DocState::Pending));
        p.cancel_flag().reset();
        assert_eq!(p.run().unwrap().ready, 1);
    }

    #[test]
    fn test_embedder_dimension_must_match_settings() {
        let data = TempDir::new().unwrap();
        let err = Orchestrator::open(
            data.path(),
            settings(),
            Arc::new(HashingEmbedder::new(DIM * 2).unwrap()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
