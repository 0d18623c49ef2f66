//! Prometheus metrics recording and background collection.

use chunkdb_core::pipeline::{Orchestrator, StageReport, stage_name};
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Records HTTP request metrics.
pub fn record_request(method: &str, path: &str, status: u16, duration: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];
    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Records one retrieval: outcome, result count and latency.
pub fn record_query(outcome: &'static str, results: usize, duration: Duration) {
    counter!("chunkdb_queries_total", "outcome" => outcome).increment(1);
    histogram!("chunkdb_query_duration_seconds").record(duration.as_secs_f64());
    histogram!("chunkdb_query_results").record(results as f64);
}

/// Records the per-document outcomes of one pipeline stage.
pub fn record_stage(report: &StageReport) {
    let stage = stage_name(report.stage);
    counter!("chunkdb_stage_documents_total", "stage" => stage, "outcome" => "succeeded")
        .increment(report.succeeded.len() as u64);
    counter!("chunkdb_stage_documents_total", "stage" => stage, "outcome" => "failed")
        .increment(report.failed.len() as u64);
}

/// Updates the store and index gauges.
pub fn update_index_metrics(pipeline: &Orchestrator) {
    let stats = pipeline.index().stats();
    gauge!("chunkdb_index_entries").set(stats.live_entries as f64);
    gauge!("chunkdb_index_tombstones").set(stats.tombstones as f64);
    gauge!("chunkdb_index_ef_search").set(stats.ef_search as f64);
    gauge!("chunkdb_chunks_total").set(pipeline.store().chunk_count() as f64);

    let status = pipeline.status();
    let failed = status.iter().filter(|r| r.state.is_failed()).count();
    gauge!("chunkdb_documents_total").set(status.len() as f64);
    gauge!("chunkdb_documents_failed").set(failed as f64);
}
