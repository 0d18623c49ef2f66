//! chunkdb-server: CLI, HTTP query API and service supervision for chunkdb.
//!
//! Pipeline, index and retrieval logic lives in `chunkdb-core`.

/// REST API layer: Axum router, HTTP handlers, models, metrics.
pub mod api;
/// Remote embedding client and embedder selection.
pub mod embedder;
/// Start, health-check and stop external services.
pub mod supervisor;
