//! Request and response data transfer objects for the REST API.

use chunkdb_core::chunk::{Chunk, ChunkLocation, DuplicateFlag, Entity, TagValue, Tags};
use chunkdb_core::index::IndexStats;
use chunkdb_core::pipeline::extract::SkippedPage;
use chunkdb_core::pipeline::{DocRecord, DocState};
use chunkdb_core::retrieve::{Query, RetrievedChunk, TagFilter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default number of results when a query omits `k`.
pub const DEFAULT_K: i64 = 5;

fn default_k() -> i64 {
    DEFAULT_K
}

/// Convert core tags to plain JSON values (for API responses).
pub fn tags_to_json(tags: &Tags) -> BTreeMap<String, serde_json::Value> {
    tags.iter()
        .map(|(k, v)| {
            let jv = match v {
                TagValue::Boolean(b) => serde_json::Value::Bool(*b),
                TagValue::Integer(i) => serde_json::json!(*i),
                TagValue::Float(f) => serde_json::json!(*f),
                TagValue::String(s) => serde_json::Value::String(s.clone()),
            };
            (k.clone(), jv)
        })
        .collect()
}

/// Request body for `POST /query`.
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default = "default_k")]
    pub k: i64,
    pub document_ids: Option<Vec<Uuid>>,
    pub tags: Option<TagFilter>,
    pub min_score: Option<f32>,
    /// Entity labels, any of which a result must carry.
    #[serde(default)]
    pub entities: Vec<String>,
}

impl From<QueryRequest> for Query {
    fn from(req: QueryRequest) -> Self {
        Query {
            text: req.text,
            k: req.k,
            document_ids: req.document_ids,
            tags: req.tags,
            min_score: req.min_score,
            entities: req.entities,
        }
    }
}

/// Where a result came from.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProvenanceResponse {
    pub document_id: Uuid,
    pub source: String,
    pub location: ChunkLocation,
    /// Human-readable location, e.g. `p3 s4-8`.
    pub cite: String,
    pub tags: BTreeMap<String, serde_json::Value>,
}

/// One ranked result of `POST /query`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResultResponse {
    pub chunk_id: Uuid,
    pub score: f32,
    pub similarity: f32,
    pub snippet: String,
    pub provenance: ProvenanceResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<DuplicateFlag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collapsed: Vec<Uuid>,
}

impl From<RetrievedChunk> for ResultResponse {
    fn from(r: RetrievedChunk) -> Self {
        Self {
            chunk_id: r.chunk_id,
            score: r.score,
            similarity: r.similarity,
            snippet: r.snippet,
            provenance: ProvenanceResponse {
                document_id: r.provenance.document_id,
                source: r.provenance.source,
                cite: r.provenance.location.to_string(),
                location: r.provenance.location,
                tags: tags_to_json(&r.provenance.tags),
            },
            duplicate_of: r.duplicate_of,
            entities: r.entities,
            collapsed: r.collapsed,
        }
    }
}

/// Response body for `POST /query`.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<ResultResponse>,
    pub count: usize,
    pub took_ms: u128,
}

/// Response body for `GET /chunks/:id`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub id: Uuid,
    pub document_id: Uuid,
    pub text: String,
    pub content_hash: String,
    pub location: ChunkLocation,
    pub tags: BTreeMap<String, serde_json::Value>,
    pub embedded: bool,
    pub indexed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<DuplicateFlag>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl ChunkResponse {
    pub fn new(chunk: &Chunk, indexed: bool) -> Self {
        Self {
            id: chunk.id,
            document_id: chunk.document_id,
            text: chunk.text.clone(),
            content_hash: chunk.content_hash.clone(),
            location: chunk.location.clone(),
            tags: tags_to_json(&chunk.tags),
            embedded: chunk.is_embedded(),
            indexed,
            duplicate_of: chunk.duplicate_of,
            entities: chunk.entities.clone(),
        }
    }
}

/// One entry of `GET /documents`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub id: Uuid,
    pub origin: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub chunks: usize,
    pub updated_at: u64,
    /// PDF pages that yielded no text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_pages: Vec<SkippedPage>,
}

impl DocumentStatus {
    pub fn new(record: &DocRecord, chunks: usize) -> Self {
        let failure = match &record.state {
            DocState::Failed { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        Self {
            id: record.document_id,
            origin: record.origin.clone(),
            state: record.state.to_string(),
            failure,
            chunks,
            updated_at: record.updated_at,
            skipped_pages: Vec::new(),
        }
    }
}

/// Response body for `DELETE /documents/:id`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub id: Uuid,
    pub removed_chunks: Vec<Uuid>,
}

/// Response body for `POST /documents/:id/retry`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    pub id: Uuid,
    pub state: String,
}

/// Response body for `GET /stats`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub documents: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
    pub index: IndexStats,
}

/// Response body for `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub documents: usize,
    pub indexed_chunks: usize,
    pub failed_documents: usize,
    pub warnings: Vec<String>,
}
