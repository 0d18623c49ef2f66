//! Durable record of documents and chunks.
//!
//! The store is the source of truth for chunk identity. Vectors live here
//! (on the chunk) and in the [`VectorIndex`]; the index is attached so that
//! deleting a document removes its index entries in the same call.
//!
//! A document's chunk list may contain chunks owned by another document: an
//! exact duplicate resolves to the chunk that already carries that content.
//! Shared chunks are reference counted by the documents listing them. Deleting
//! a document removes a chunk only when no other document lists it; a shared
//! chunk whose owner is deleted passes to a remaining document and keeps its id.

use crate::chunk::{provenance_tags, Chunk, ChunkLocation, ChunkStage, Document, DuplicateFlag};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::snapshot;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub const STORE_FILE: &str = "chunks.bin";
const STORE_MAGIC: &[u8; 4] = b"CKS1";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    documents: BTreeMap<Uuid, Document>,
    chunks: BTreeMap<Uuid, Chunk>,
    /// content hash → the chunk that first carried it
    by_hash: HashMap<String, Uuid>,
}

impl StoreData {
    fn validate(&self) -> std::result::Result<(), String> {
        for (id, chunk) in &self.chunks {
            if chunk.id != *id {
                return Err(format!("chunk keyed {} carries id {}", id, chunk.id));
            }
            if !self.documents.contains_key(&chunk.document_id) {
                return Err(format!(
                    "chunk {} belongs to unknown document {}",
                    id, chunk.document_id
                ));
            }
        }
        for doc in self.documents.values() {
            if let Some(missing) = doc.chunk_ids.iter().find(|c| !self.chunks.contains_key(c)) {
                return Err(format!("document {} lists missing chunk {}", doc.id, missing));
            }
            if let Some(stray) = doc.linked.keys().find(|c| !doc.chunk_ids.contains(c)) {
                return Err(format!("document {} links unlisted chunk {}", doc.id, stray));
            }
        }
        for (hash, id) in &self.by_hash {
            match self.chunks.get(id) {
                Some(chunk) if &chunk.content_hash == hash => {}
                _ => return Err(format!("hash entry {} points at bad chunk {}", hash, id)),
            }
        }
        Ok(())
    }

    fn link(&mut self, doc_id: &Uuid, chunk_id: Uuid) {
        if let Some(doc) = self.documents.get_mut(doc_id) {
            if !doc.chunk_ids.contains(&chunk_id) {
                doc.chunk_ids.push(chunk_id);
            }
        }
        self.sort_document_chunks(doc_id);
    }

    /// Make `heir` the owner of a shared chunk: its location in `heir` and
    /// the provenance tags follow. Other tags are kept.
    fn hand_over(&mut self, chunk_id: &Uuid, heir: &Uuid) {
        let Some(doc) = self.documents.get_mut(heir) else {
            return;
        };
        let location = doc.linked.remove(chunk_id);
        let origin = doc.origin.clone();
        let Some(chunk) = self.chunks.get_mut(chunk_id) else {
            return;
        };
        chunk.document_id = *heir;
        if let Some(location) = location {
            chunk.location = location;
        }
        chunk.tags.remove("section");
        chunk
            .tags
            .extend(provenance_tags(heir, &origin, &chunk.location));
        self.sort_document_chunks(heir);
    }

    fn sort_document_chunks(&mut self, doc_id: &Uuid) {
        let chunks = &self.chunks;
        if let Some(doc) = self.documents.get_mut(doc_id) {
            doc.chunk_ids.sort_by(|a, b| {
                let la = chunks.get(a).map(|c| (&c.location, c.id));
                let lb = chunks.get(b).map(|c| (&c.location, c.id));
                la.cmp(&lb)
            });
        }
    }
}

/// In-memory chunk store with snapshot persistence.
#[derive(Default)]
pub struct ChunkStore {
    data: Arc<RwLock<StoreData>>,
    index: RwLock<Option<Arc<VectorIndex>>>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the index that mirrors this store's embedded chunks.
    pub fn attach_index(&self, index: Arc<VectorIndex>) {
        *self.index.write() = Some(index);
    }

    pub fn index(&self) -> Option<Arc<VectorIndex>> {
        self.index.read().clone()
    }

    /// Register a document. Returns `false` (and keeps the existing record)
    /// when the id is already known.
    pub fn register_document(&self, doc: Document) -> bool {
        let mut data = self.data.write();
        if data.documents.contains_key(&doc.id) {
            return false;
        }
        data.documents.insert(doc.id, doc);
        true
    }

    pub fn document(&self, id: &Uuid) -> Result<Document> {
        self.data
            .read()
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| Error::document_not_found(id))
    }

    /// All documents ordered by origin path.
    pub fn documents(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self.data.read().documents.values().cloned().collect();
        docs.sort_by(|a, b| a.origin.cmp(&b.origin));
        docs
    }

    /// Insert a chunk. An id that already exists is left untouched and
    /// `Ok(false)` is returned. The owning document must be registered.
    pub fn put(&self, chunk: Chunk) -> Result<bool> {
        let mut data = self.data.write();
        if data.chunks.contains_key(&chunk.id) {
            return Ok(false);
        }
        let doc_id = chunk.document_id;
        if !data.documents.contains_key(&doc_id) {
            return Err(Error::document_not_found(doc_id));
        }
        data.by_hash
            .entry(chunk.content_hash.clone())
            .or_insert(chunk.id);
        let id = chunk.id;
        data.chunks.insert(id, chunk);
        data.link(&doc_id, id);
        Ok(true)
    }

    /// Record that `doc_id` contains an existing chunk (exact duplicate
    /// content) at `location`.
    pub fn link_chunk(&self, doc_id: &Uuid, chunk_id: &Uuid, location: &ChunkLocation) -> Result<()> {
        let mut data = self.data.write();
        let owner = data
            .chunks
            .get(chunk_id)
            .map(|c| c.document_id)
            .ok_or_else(|| Error::chunk_not_found(chunk_id))?;
        let doc = data
            .documents
            .get_mut(doc_id)
            .ok_or_else(|| Error::document_not_found(doc_id))?;
        if owner != *doc_id {
            doc.linked.entry(*chunk_id).or_insert_with(|| location.clone());
        }
        data.link(doc_id, *chunk_id);
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Result<Chunk> {
        self.data
            .read()
            .chunks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::chunk_not_found(id))
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.data.read().chunks.contains_key(id)
    }

    /// Chunks of a document in location order.
    pub fn list_by_document(&self, doc_id: &Uuid) -> Result<Vec<Chunk>> {
        let data = self.data.read();
        let doc = data
            .documents
            .get(doc_id)
            .ok_or_else(|| Error::document_not_found(doc_id))?;
        Ok(doc
            .chunk_ids
            .iter()
            .filter_map(|id| data.chunks.get(id).cloned())
            .collect())
    }

    /// Chunk that first carried this normalized-content hash.
    pub fn find_by_hash(&self, content_hash: &str) -> Option<Uuid> {
        self.data.read().by_hash.get(content_hash).copied()
    }

    /// Store an embedding and move the chunk to `Embedded`.
    pub fn set_embedding(&self, id: &Uuid, vector: Vec<f32>) -> Result<()> {
        self.update(id, |chunk| {
            chunk.embedding = Some(vector);
            if chunk.stage < ChunkStage::Embedded {
                chunk.stage = ChunkStage::Embedded;
            }
        })
    }

    /// Move an embedded chunk to `Indexed`.
    pub fn mark_indexed(&self, id: &Uuid) -> Result<()> {
        let mut result = Ok(());
        self.update(id, |chunk| {
            if chunk.is_embedded() {
                chunk.stage = ChunkStage::Indexed;
            } else {
                result = Err(Error::InvalidVector(format!(
                    "chunk {} has no embedding to index",
                    chunk.id
                )));
            }
        })?;
        result
    }

    pub fn set_duplicate_of(&self, id: &Uuid, flag: Option<DuplicateFlag>) -> Result<()> {
        self.update(id, |chunk| chunk.duplicate_of = flag)
    }

    fn update(&self, id: &Uuid, f: impl FnOnce(&mut Chunk)) -> Result<()> {
        let mut data = self.data.write();
        let chunk = data
            .chunks
            .get_mut(id)
            .ok_or_else(|| Error::chunk_not_found(id))?;
        f(chunk);
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.data.read().chunks.len()
    }

    pub fn embedded_count(&self) -> usize {
        self.data
            .read()
            .chunks
            .values()
            .filter(|c| c.is_embedded())
            .count()
    }

    /// Every chunk id in id order.
    pub fn chunk_ids(&self) -> Vec<Uuid> {
        self.data.read().chunks.keys().copied().collect()
    }

    /// Remove a document. Chunks no other document lists are removed with
    /// their index entries; shared chunks it owned pass to the remaining
    /// document with the lowest origin. Returns the removed chunk ids.
    pub fn delete_document(&self, doc_id: &Uuid) -> Result<Vec<Uuid>> {
        let removed = {
            let mut data = self.data.write();
            let Some(doc) = data.documents.remove(doc_id) else {
                return Err(Error::document_not_found(doc_id));
            };
            let mut listed: BTreeSet<Uuid> = doc.chunk_ids.iter().copied().collect();
            listed.extend(
                data.chunks
                    .values()
                    .filter(|c| c.document_id == *doc_id)
                    .map(|c| c.id),
            );

            // remaining documents per listed chunk, lowest origin first
            let mut holders: HashMap<Uuid, Vec<(&str, Uuid)>> = HashMap::new();
            for other in data.documents.values() {
                for id in other.chunk_ids.iter().filter(|c| listed.contains(c)) {
                    holders.entry(*id).or_default().push((&other.origin, other.id));
                }
            }
            let heirs: HashMap<Uuid, Uuid> = holders
                .into_iter()
                .filter_map(|(id, mut docs)| {
                    docs.sort();
                    docs.first().map(|(_, heir)| (id, *heir))
                })
                .collect();

            let mut removed = Vec::new();
            for id in &listed {
                let owned = data.chunks.get(id).is_some_and(|c| c.document_id == *doc_id);
                match heirs.get(id) {
                    Some(heir) if owned => data.hand_over(id, heir),
                    Some(_) => {}
                    None => {
                        if let Some(chunk) = data.chunks.remove(id) {
                            if data.by_hash.get(&chunk.content_hash) == Some(id) {
                                data.by_hash.remove(&chunk.content_hash);
                            }
                            removed.push(*id);
                        }
                    }
                }
            }

            let gone: HashSet<Uuid> = removed.iter().copied().collect();
            for chunk in data.chunks.values_mut() {
                if chunk.duplicate_of.is_some_and(|d| gone.contains(&d.canonical)) {
                    chunk.duplicate_of = None;
                }
                if chunk.probable_duplicate_of.is_some_and(|p| gone.contains(&p)) {
                    chunk.probable_duplicate_of = None;
                }
            }
            removed
        };
        if let Some(index) = self.index() {
            index.remove_many(&removed)?;
        }
        tracing::info!(document = %doc_id, chunks = removed.len(), "document deleted");
        Ok(removed)
    }

    /// Snapshot to `dir/chunks.bin`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = self.data.read();
        snapshot::write(&dir.join(STORE_FILE), STORE_MAGIC, &*data)?;
        tracing::info!(
            documents = data.documents.len(),
            chunks = data.chunks.len(),
            "chunk store saved"
        );
        Ok(())
    }

    /// Load `dir/chunks.bin`, or an empty store when the file does not exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(STORE_FILE);
        if !path.exists() {
            return Ok(Self::new());
        }
        let (data, _): (StoreData, u32) = snapshot::read(&path, STORE_MAGIC)?;
        data.validate().map_err(|reason| Error::corrupt(&path, reason))?;
        tracing::info!(
            documents = data.documents.len(),
            chunks = data.chunks.len(),
            "chunk store loaded"
        );
        Ok(Self {
            data: Arc::new(RwLock::new(data)),
            index: RwLock::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_id_for, TagValue, Tags};
    use crate::config::IndexSettings;
    use tempfile::TempDir;

    fn chunk(doc: &Document, page: u32, text: &str) -> Chunk {
        let location = ChunkLocation::text(page, 1, 5);
        let hash = format!("hash-{}", text);
        Chunk {
            id: chunk_id_for(&doc.id, &location, &hash),
            document_id: doc.id,
            text: text.to_string(),
            normalized: text.to_lowercase(),
            content_hash: hash,
            location,
            tags: Tags::new(),
            embedding: None,
            stage: ChunkStage::Enriched,
            duplicate_of: None,
            probable_duplicate_of: None,
            entities: Vec::new(),
        }
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = ChunkStore::new();
        let doc = Document::new("a.txt", 0);
        store.register_document(doc.clone());
        let c = chunk(&doc, 1, "alpha");
        assert!(store.put(c.clone()).unwrap());
        assert!(!store.put(c.clone()).unwrap());
        assert_eq!(store.chunk_count(), 1);
        assert_eq!(store.document(&doc.id).unwrap().chunk_ids, vec![c.id]);
        assert_eq!(store.find_by_hash("hash-alpha"), Some(c.id));
    }

    #[test]
    fn test_put_requires_document() {
        let store = ChunkStore::new();
        let doc = Document::new("a.txt", 0);
        assert!(matches!(
            store.put(chunk(&doc, 1, "x")),
            Err(Error::NotFound { kind: "document", .. })
        ));
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let store = ChunkStore::new();
        assert!(matches!(
            store.get(&Uuid::new_v4()),
            Err(Error::NotFound { kind: "chunk", .. })
        ));
    }

    #[test]
    fn test_list_by_document_in_location_order() {
        let store = ChunkStore::new();
        let doc = Document::new("a.txt", 0);
        store.register_document(doc.clone());
        store.put(chunk(&doc, 3, "three")).unwrap();
        store.put(chunk(&doc, 1, "one")).unwrap();
        store.put(chunk(&doc, 2, "two")).unwrap();
        let pages: Vec<u32> = store
            .list_by_document(&doc.id)
            .unwrap()
            .iter()
            .map(|c| c.location.page)
            .collect();
        assert_eq!(pages, vec![1, 2, 3]);
    }

    /// `a` owns "shared" and "a-only"; `b` owns "b-only" and links "shared".
    fn shared_pair() -> (ChunkStore, Arc<VectorIndex>, Document, Document, [Chunk; 3]) {
        let store = ChunkStore::new();
        let index = Arc::new(VectorIndex::new(IndexSettings::with_dimension(2)).unwrap());
        store.attach_index(index.clone());

        let a = Document::new("a.txt", 0);
        let b = Document::new("b.txt", 0);
        store.register_document(a.clone());
        store.register_document(b.clone());
        let shared = chunk(&a, 1, "shared");
        let a_only = chunk(&a, 2, "a-only");
        let b_only = chunk(&b, 1, "b-only");
        for c in [&shared, &a_only, &b_only] {
            store.put(c.clone()).unwrap();
        }
        store
            .link_chunk(&b.id, &shared.id, &ChunkLocation::text(4, 2, 6))
            .unwrap();
        for c in [&shared, &a_only, &b_only] {
            store.set_embedding(&c.id, vec![1.0, 0.5]).unwrap();
            index.add(c.id, &[1.0, 0.5]).unwrap();
            store.mark_indexed(&c.id).unwrap();
        }
        (store, index, a, b, [shared, a_only, b_only])
    }

    #[test]
    fn test_delete_linking_document_keeps_shared_chunk() {
        let (store, index, a, b, [shared, a_only, b_only]) = shared_pair();

        let removed = store.delete_document(&b.id).unwrap();
        assert_eq!(removed, vec![b_only.id]);
        assert!(!index.contains(&b_only.id));
        assert!(index.contains(&shared.id));
        assert_eq!(store.get(&shared.id).unwrap().document_id, a.id);
        assert_eq!(
            store.document(&a.id).unwrap().chunk_ids,
            vec![shared.id, a_only.id]
        );

        let removed: BTreeSet<Uuid> = store.delete_document(&a.id).unwrap().into_iter().collect();
        assert_eq!(removed, [shared.id, a_only.id].into_iter().collect());
        assert!(index.is_empty());
        assert_eq!(store.chunk_count(), 0);
        assert_eq!(store.find_by_hash("hash-shared"), None);
    }

    #[test]
    fn test_delete_owner_hands_shared_chunk_over() {
        let (store, index, a, b, [shared, a_only, b_only]) = shared_pair();

        let removed = store.delete_document(&a.id).unwrap();
        assert_eq!(removed, vec![a_only.id]);
        assert!(index.contains(&shared.id));
        assert!(!index.contains(&a_only.id));

        // same id, now cited from b at the place b contains it
        let moved = store.get(&shared.id).unwrap();
        assert_eq!(moved.document_id, b.id);
        assert_eq!(moved.location, ChunkLocation::text(4, 2, 6));
        assert_eq!(moved.tags.get("source"), Some(&TagValue::from("b.txt")));
        assert_eq!(moved.tags.get("page_start"), Some(&TagValue::Integer(4)));
        let doc = store.document(&b.id).unwrap();
        assert_eq!(doc.chunk_ids, vec![b_only.id, shared.id]);
        assert!(doc.linked.is_empty());
        assert_eq!(store.find_by_hash("hash-shared"), Some(shared.id));

        store.delete_document(&b.id).unwrap();
        assert!(index.is_empty());
        assert!(matches!(
            store.delete_document(&a.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_shared_chunks_survive_save_and_load() {
        let dir = TempDir::new().unwrap();
        let (store, _, _, b, [shared, ..]) = shared_pair();
        store.save(dir.path()).unwrap();
        let loaded = ChunkStore::load(dir.path()).unwrap();
        let doc = loaded.document(&b.id).unwrap();
        assert_eq!(doc.linked.get(&shared.id), Some(&ChunkLocation::text(4, 2, 6)));
    }

    #[test]
    fn test_mark_indexed_needs_embedding() {
        let store = ChunkStore::new();
        let doc = Document::new("a.txt", 0);
        store.register_document(doc.clone());
        let c = chunk(&doc, 1, "x");
        store.put(c.clone()).unwrap();
        assert!(store.mark_indexed(&c.id).is_err());
        store.set_embedding(&c.id, vec![0.1, 0.2]).unwrap();
        store.mark_indexed(&c.id).unwrap();
        assert_eq!(store.get(&c.id).unwrap().stage, ChunkStage::Indexed);
        assert_eq!(store.embedded_count(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new();
        let doc = Document::new("a.txt", 7);
        store.register_document(doc.clone());
        let c = chunk(&doc, 1, "persisted");
        store.put(c.clone()).unwrap();
        store.save(dir.path()).unwrap();

        let loaded = ChunkStore::load(dir.path()).unwrap();
        assert_eq!(loaded.get(&c.id).unwrap(), c);
        assert_eq!(loaded.document(&doc.id).unwrap().extracted_at, 7);

        let path = dir.path().join(STORE_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        raw[3] ^= 0x01;
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(
            ChunkStore::load(dir.path()),
            Err(Error::CorruptIndex { .. })
        ));
    }
}
