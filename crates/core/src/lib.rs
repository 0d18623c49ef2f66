//! # chunkdb-core
//!
//! Chunk store, deduplicating enricher, HNSW vector index and retriever for
//! document retrieval pipelines.
//!
//! This is the core library crate with no async runtime. The server crate
//! wraps it with a CLI, an HTTP query API and a service supervisor.

/// Core record types: documents, chunks, locations and tags.
pub mod chunk;
/// Compile-time limits and defaults plus the TOML-loadable `Settings`.
pub mod config;
/// The `Embedder` capability and its in-process implementations.
pub mod embed;
/// Normalization, content hashing, duplicate detection and tagging.
pub mod enrich;
/// Error taxonomy and exit codes.
pub mod error;
/// Vector index: exact scan, HNSW graph, persistence.
pub mod index;
/// Staged ingestion pipeline with a checkpoint journal.
pub mod pipeline;
/// Query embedding, filtering, boosting and duplicate collapse.
pub mod retrieve;
/// Checksummed snapshot files.
pub mod snapshot;
/// Durable record of documents and chunks.
pub mod store;

pub use error::{Error, ErrorKind, Result};
