//! HTTP request handlers and shared application state.
//!
//! Retrieval, deletes and retries block on locks, file I/O and possibly a
//! remote embedder, so they run on the blocking pool.

use crate::api::errors::ApiError;
use crate::api::metrics;
use crate::api::models::*;
use axum::extract::{Path, State};
use axum::Json;
use chunkdb_core::pipeline::Orchestrator;
use chunkdb_core::retrieve::{Query, Retriever};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Shared application state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Orchestrator>,
    pub retriever: Arc<Retriever>,
    pub prometheus_handle: PrometheusHandle,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(pipeline: Arc<Orchestrator>, prometheus_handle: PrometheusHandle) -> Self {
        Self {
            retriever: Arc::new(pipeline.retriever()),
            pipeline,
            prometheus_handle,
            start_time: Instant::now(),
        }
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> chunkdb_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(format!("worker task failed: {e}")))?
        .map_err(ApiError::from)
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.pipeline.status();
    let failed_documents = status.iter().filter(|r| r.state.is_failed()).count();
    let stats = state.pipeline.index().stats();

    let mut warnings = Vec::new();
    if failed_documents > 0 {
        warnings.push(format!("{failed_documents} document(s) failed ingestion"));
    }
    if stats.live_entries > 0 && stats.tombstones > stats.live_entries {
        warnings.push(format!(
            "index holds {} tombstones for {} live entries",
            stats.tombstones, stats.live_entries
        ));
    }

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        documents: status.len(),
        indexed_chunks: stats.live_entries,
        failed_documents,
        warnings,
    })
}

/// `GET /metrics`
pub async fn metrics_endpoint(State(state): State<AppState>) -> String {
    metrics::update_index_metrics(&state.pipeline);
    state.prometheus_handle.render()
}

/// `POST /query`
pub async fn query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let query = Query::from(req);
    let k = query.k;
    let retriever = state.retriever.clone();
    let start = Instant::now();
    let outcome = run_blocking(move || retriever.retrieve(&query)).await;
    let elapsed = start.elapsed();

    let results = match outcome {
        Ok(results) => results,
        Err(err) => {
            metrics::record_query("error", 0, elapsed);
            return Err(err);
        }
    };
    metrics::record_query("ok", results.len(), elapsed);
    let count = results.len();
    tracing::info!(k, results = count, took_ms = elapsed.as_millis() as u64, "query completed");
    Ok(Json(QueryResponse {
        results: results.into_iter().map(ResultResponse::from).collect(),
        count,
        took_ms: elapsed.as_millis(),
    }))
}

/// `GET /chunks/:id`
pub async fn get_chunk(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChunkResponse>, ApiError> {
    let chunk = state.pipeline.store().get(&id)?;
    let indexed = state.pipeline.index().contains(&id);
    Ok(Json(ChunkResponse::new(&chunk, indexed)))
}

/// `GET /documents`
pub async fn list_documents(State(state): State<AppState>) -> Json<Vec<DocumentStatus>> {
    let store = state.pipeline.store();
    let documents = state
        .pipeline
        .status()
        .iter()
        .map(|record| {
            let chunks = store
                .document(&record.document_id)
                .map(|d| d.chunk_ids.len())
                .unwrap_or(0);
            let mut status = DocumentStatus::new(record, chunks);
            match state.pipeline.skipped_pages(&record.document_id) {
                Ok(pages) => status.skipped_pages = pages,
                Err(e) => tracing::warn!(
                    document = %record.document_id,
                    error = %e,
                    "unreadable skipped-page record"
                ),
            }
            status
        })
        .collect();
    Json(documents)
}

/// `DELETE /documents/:id`
pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let pipeline = state.pipeline.clone();
    let removed_chunks = run_blocking(move || pipeline.delete(&id)).await?;
    tracing::info!(document = %id, chunks = removed_chunks.len(), "document deleted");
    Ok(Json(DeleteResponse { id, removed_chunks }))
}

/// `POST /documents/:id/retry`
pub async fn retry_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RetryResponse>, ApiError> {
    let pipeline = state.pipeline.clone();
    let doc_state = run_blocking(move || pipeline.retry(&id)).await?;
    tracing::info!(document = %id, state = %doc_state, "document retried");
    Ok(Json(RetryResponse {
        id,
        state: doc_state.to_string(),
    }))
}

/// `GET /stats`
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let store = state.pipeline.store();
    Json(StatsResponse {
        documents: store.documents().len(),
        chunks: store.chunk_count(),
        embedded_chunks: store.embedded_count(),
        index: state.pipeline.index().stats(),
    })
}
