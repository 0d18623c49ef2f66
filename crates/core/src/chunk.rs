//! Core record types: documents, chunks and their tags.
//!
//! Identifiers are UUID v5 values derived from content, never random: a document
//! id hashes its origin path and a chunk id hashes its document, location and
//! normalized-content hash. Re-running extraction on unchanged input therefore
//! reproduces identical ids.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Namespace for document ids.
const DOCUMENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b0e_8a51_4c47_9d3e_51a7_0c2e_d401);

/// Namespace for chunk ids.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x2d94_77f3_0b6a_4e1f_a8c5_93e2_6b10_f7c2);

/// A typed tag value attached to a chunk.
///
/// Uses the default externally-tagged serde representation for bincode compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        TagValue::String(s.to_string())
    }
}

impl From<String> for TagValue {
    fn from(s: String) -> Self {
        TagValue::String(s)
    }
}

impl From<i64> for TagValue {
    fn from(i: i64) -> Self {
        TagValue::Integer(i)
    }
}

impl From<bool> for TagValue {
    fn from(b: bool) -> Self {
        TagValue::Boolean(b)
    }
}

/// Ordered tag map. Ordered so that serialized chunks are byte-stable.
pub type Tags = BTreeMap<String, TagValue>;

/// Kind of element a chunk was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Text,
    Table,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Text => "text",
            ElementKind::Table => "table",
        }
    }
}

/// Where in its document a chunk came from.
///
/// Orders by page, then sentence window, then element kind and position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkLocation {
    /// 1-based page number.
    pub page: u32,
    /// 1-based first sentence of the window (0 for non-text elements).
    pub start_sentence: u32,
    /// 1-based last sentence of the window, inclusive.
    pub end_sentence: u32,
    pub element: ElementKind,
    /// Index of the element on its page when several share a sentence window (tables).
    pub ordinal: u32,
    /// Section heading in effect, when the extractor knows it.
    pub section: Option<String>,
}

impl ChunkLocation {
    pub fn text(page: u32, start_sentence: u32, end_sentence: u32) -> Self {
        Self {
            page,
            start_sentence,
            end_sentence,
            element: ElementKind::Text,
            ordinal: 0,
            section: None,
        }
    }

    pub fn table(page: u32, ordinal: u32) -> Self {
        Self {
            page,
            start_sentence: 0,
            end_sentence: 0,
            element: ElementKind::Table,
            ordinal,
            section: None,
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

impl fmt::Display for ChunkLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.element {
            ElementKind::Text => write!(
                f,
                "p{} s{}-{}",
                self.page, self.start_sentence, self.end_sentence
            ),
            ElementKind::Table => write!(f, "p{} table {}", self.page, self.ordinal),
        }
    }
}

/// Lifecycle stage of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkStage {
    Extracted,
    Enriched,
    Embedded,
    Indexed,
}

/// Marks a chunk as a near-duplicate of a canonical chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DuplicateFlag {
    pub canonical: Uuid,
    /// Cosine similarity to the canonical chunk.
    pub similarity: f32,
}

/// A source document known to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    /// Origin path as given to the extractor.
    pub origin: String,
    /// Unix seconds when text was extracted.
    pub extracted_at: u64,
    /// Chunk ids this document contains, in location order, without repeats.
    /// Includes exact duplicates owned by another document.
    pub chunk_ids: Vec<Uuid>,
    /// Where each chunk owned by another document appears in this one.
    #[serde(default)]
    pub linked: BTreeMap<Uuid, ChunkLocation>,
}

impl Document {
    /// Creates a document record whose id is derived from its origin path.
    pub fn new(origin: impl Into<String>, extracted_at: u64) -> Self {
        let origin = origin.into();
        Self {
            id: document_id_for(&origin),
            origin,
            extracted_at,
            chunk_ids: Vec::new(),
            linked: BTreeMap::new(),
        }
    }
}

/// Extractor output before enrichment: raw text plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChunk {
    pub document_id: Uuid,
    pub text: String,
    pub location: ChunkLocation,
}

/// An enriched chunk and everything later stages attach to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Text as extracted, kept for display.
    pub text: String,
    /// Normalized text used for hashing and shingling.
    pub normalized: String,
    /// Hex SHA-256 of `normalized`.
    pub content_hash: String,
    pub location: ChunkLocation,
    pub tags: Tags,
    /// Embedding vector, `None` until the embed stage ran.
    pub embedding: Option<Vec<f32>>,
    pub stage: ChunkStage,
    /// Confirmed near-duplicate of another chunk (cosine, after embedding).
    pub duplicate_of: Option<DuplicateFlag>,
    /// Probable duplicate found by shingle overlap before embedding.
    pub probable_duplicate_of: Option<Uuid>,
    /// Named entities found in `text`, in order of appearance.
    #[serde(default)]
    pub entities: Vec<Entity>,
}

/// A labelled span of chunk text, e.g. `ORG` for "Acme Corp".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    pub label: String,
}

impl Entity {
    pub fn new(text: impl Into<String>, label: &str) -> Self {
        Self {
            text: text.into(),
            label: label.to_string(),
        }
    }
}

impl Chunk {
    /// Id of the group this chunk collapses into during ranking.
    pub fn canonical_id(&self) -> Uuid {
        self.duplicate_of.map_or(self.id, |d| d.canonical)
    }

    pub fn is_embedded(&self) -> bool {
        self.embedding.as_ref().is_some_and(|v| !v.is_empty())
    }

    /// Whether any entity carries one of `labels` (case-insensitive).
    pub fn has_entity_label(&self, labels: &[String]) -> bool {
        self.entities
            .iter()
            .any(|e| labels.iter().any(|l| l.eq_ignore_ascii_case(&e.label)))
    }
}

/// Tags naming where a chunk came from. Rewritten when a chunk changes owner.
pub fn provenance_tags(document_id: &Uuid, origin: &str, location: &ChunkLocation) -> Tags {
    let mut tags = Tags::new();
    tags.insert("source".into(), TagValue::from(origin));
    tags.insert("document_id".into(), TagValue::from(document_id.to_string()));
    tags.insert("page_start".into(), TagValue::Integer(location.page as i64));
    tags.insert("page_end".into(), TagValue::Integer(location.page as i64));
    tags.insert("element".into(), TagValue::from(location.element.as_str()));
    if let Some(section) = &location.section {
        tags.insert("section".into(), TagValue::from(section.as_str()));
    }
    tags
}

/// Deterministic document id for an origin path.
pub fn document_id_for(origin: &str) -> Uuid {
    Uuid::new_v5(&DOCUMENT_NAMESPACE, origin.as_bytes())
}

/// Deterministic chunk id from document, location and normalized-content hash.
pub fn chunk_id_for(document_id: &Uuid, location: &ChunkLocation, content_hash: &str) -> Uuid {
    let key = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        document_id,
        location.page,
        location.start_sentence,
        location.end_sentence,
        location.element.as_str(),
        location.ordinal,
        content_hash
    );
    Uuid::new_v5(&CHUNK_NAMESPACE, key.as_bytes())
}
