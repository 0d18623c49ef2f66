//! Configuration for chunkdb.
//!
//! Limits and defaults are compile-time constants. Runtime tuning lives in
//! [`Settings`], which is loaded once (TOML file, then CLI/env overrides in the
//! binary) and validated at startup with [`Settings::validate`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default embedding dimension (matches common MiniLM sentence encoders).
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;

/// Maximum allowed embedding dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Maximum number of results (`k`) per query.
pub const MAX_K: usize = 1_000;

/// Cosine similarity above which two chunks with distinct content are tagged as duplicates.
pub const DEFAULT_NEAR_DUPLICATE_THRESHOLD: f32 = 0.95;

/// Allowed recall shortfall of approximate search versus the exact scan (recall@k ≥ 1 - tolerance).
pub const DEFAULT_INDEX_RECALL_TOLERANCE: f32 = 0.05;

/// Fraction of add/remove operations relative to live entries that triggers a rebuild.
pub const DEFAULT_REBUILD_CHURN_RATIO: f32 = 0.2;

/// Default number of attempts for external model calls.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 4;

/// Default base delay for exponential backoff between attempts.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;

/// Backoff exponent cap: delays stop doubling after this many attempts.
pub const RETRY_MAX_EXPONENT: u32 = 6;

/// Default number of bidirectional links per HNSW node.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default ef parameter during HNSW construction.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default ef parameter during HNSW search.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 64;

/// Upper bound for ef_search when calibrating toward the recall tolerance.
pub const HNSW_MAX_EF_SEARCH: usize = 4_096;

/// Maximum number of layers in the HNSW graph.
pub const HNSW_DEFAULT_MAX_LAYERS: usize = 16;

/// Seed mixed with insertion sequence numbers for HNSW level assignment.
pub const HNSW_DEFAULT_LEVEL_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Below this many live entries the index answers with an exact scan.
pub const DEFAULT_EXACT_SCAN_THRESHOLD: usize = 2_048;

/// Churn below this many operations never triggers an automatic rebuild.
pub const REBUILD_MIN_CHURN: usize = 64;

/// Number of stored vectors sampled as queries when calibrating recall.
pub const RECALL_SAMPLE_QUERIES: usize = 64;

/// Result count used when calibrating recall.
pub const RECALL_SAMPLE_K: usize = 10;

/// Over-fetch multiplier applied to `k` before post-filtering.
pub const DEFAULT_OVER_FETCH_FACTOR: usize = 4;

/// Words per shingle for pre-embedding near-duplicate detection.
pub const DEFAULT_SHINGLE_SIZE: usize = 3;

/// Shingle Jaccard overlap above which a chunk is flagged as a probable duplicate.
pub const DEFAULT_SHINGLE_THRESHOLD: f32 = 0.8;

/// Sentences per chunk window.
pub const DEFAULT_CHUNK_WINDOW: usize = 5;

/// Sentences shared between consecutive windows.
pub const DEFAULT_CHUNK_OVERLAP: usize = 2;

/// Maximum length of chunk text in bytes.
pub const MAX_CHUNK_TEXT_LEN: usize = 64 * 1024;

/// Characters of raw text returned as a result snippet.
pub const DEFAULT_SNIPPET_CHARS: usize = 240;

/// Default embedding worker pool size.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Default HTTP server port.
pub const DEFAULT_PORT: u16 = 8000;

/// Default directory for the store, index and checkpoint journal.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Per-request timeout in seconds for the HTTP API.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of concurrent in-flight HTTP requests.
pub const MAX_CONCURRENT_REQUESTS: usize = 256;

/// Default timeout for a single embedding request.
pub const DEFAULT_EMBED_TIMEOUT_SECS: u64 = 30;

/// Maximum HTTP request body size (1 MiB). Queries are small.
pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Seconds a supervised service gets to exit after a graceful stop request.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 10;

/// Seconds to wait for a supervised service to accept connections.
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 30;

/// Backoff parameters for external model calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryBackoff {
    /// Total attempts including the first call.
    pub attempts: u32,
    /// Delay before the second attempt; doubles afterwards.
    pub base_delay_ms: u64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

impl RetryBackoff {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(RETRY_MAX_EXPONENT);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exponent))
    }
}

/// HNSW graph parameters recorded alongside a persisted index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswParams {
    /// Links per node above layer 0 (layer 0 uses `2 * m`).
    pub m: usize,
    /// Candidate list size during construction.
    pub ef_construction: usize,
    /// Candidate list size during search; raised by recall calibration.
    pub ef_search: usize,
    /// Maximum number of layers.
    pub max_layers: usize,
    /// Seed for deterministic level assignment.
    pub level_seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: HNSW_DEFAULT_M,
            ef_construction: HNSW_DEFAULT_EF_CONSTRUCTION,
            ef_search: HNSW_DEFAULT_EF_SEARCH,
            max_layers: HNSW_DEFAULT_MAX_LAYERS,
            level_seed: HNSW_DEFAULT_LEVEL_SEED,
        }
    }
}

/// Optional score boost favouring recently extracted documents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecencyBoost {
    /// Maximum score added for a document extracted just now.
    pub weight: f32,
    /// Age in seconds at which the boost halves.
    pub half_life_secs: u64,
}

/// Index-level settings handed to [`crate::index::VectorIndex`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub dimension: usize,
    pub hnsw: HnswParams,
    pub recall_tolerance: f32,
    pub rebuild_churn_ratio: f32,
    pub exact_scan_threshold: usize,
}

impl IndexSettings {
    /// Settings with defaults for everything but the dimension.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            hnsw: HnswParams::default(),
            recall_tolerance: DEFAULT_INDEX_RECALL_TOLERANCE,
            rebuild_churn_ratio: DEFAULT_REBUILD_CHURN_RATIO,
            exact_scan_threshold: DEFAULT_EXACT_SCAN_THRESHOLD,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub embedding_dimension: usize,
    pub near_duplicate_threshold: f32,
    pub index_recall_tolerance: f32,
    pub rebuild_churn_ratio: f32,
    pub retry_backoff: RetryBackoff,
    pub hnsw: HnswParams,
    pub exact_scan_threshold: usize,
    pub over_fetch_factor: usize,
    pub shingle_size: usize,
    pub shingle_threshold: f32,
    pub chunk_window: usize,
    pub chunk_overlap: usize,
    pub worker_threads: usize,
    pub snippet_chars: usize,
    pub recency_boost: Option<RecencyBoost>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            near_duplicate_threshold: DEFAULT_NEAR_DUPLICATE_THRESHOLD,
            index_recall_tolerance: DEFAULT_INDEX_RECALL_TOLERANCE,
            rebuild_churn_ratio: DEFAULT_REBUILD_CHURN_RATIO,
            retry_backoff: RetryBackoff::default(),
            hnsw: HnswParams::default(),
            exact_scan_threshold: DEFAULT_EXACT_SCAN_THRESHOLD,
            over_fetch_factor: DEFAULT_OVER_FETCH_FACTOR,
            shingle_size: DEFAULT_SHINGLE_SIZE,
            shingle_threshold: DEFAULT_SHINGLE_THRESHOLD,
            chunk_window: DEFAULT_CHUNK_WINDOW,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            worker_threads: DEFAULT_WORKER_THREADS,
            snippet_chars: DEFAULT_SNIPPET_CHARS,
            recency_boost: None,
        }
    }
}

impl Settings {
    /// Parse settings from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Read and parse a TOML settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&text)?;
        tracing::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Check every option against its valid range.
    pub fn validate(&self) -> Result<()> {
        fn unit_interval(name: &str, value: f32) -> Result<()> {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
            Ok(())
        }

        if self.embedding_dimension == 0 || self.embedding_dimension > MAX_DIMENSION {
            return Err(Error::InvalidConfig(format!(
                "embedding_dimension must be 1-{MAX_DIMENSION}, got {}",
                self.embedding_dimension
            )));
        }
        unit_interval("near_duplicate_threshold", self.near_duplicate_threshold)?;
        unit_interval("index_recall_tolerance", self.index_recall_tolerance)?;
        unit_interval("shingle_threshold", self.shingle_threshold)?;
        if self.rebuild_churn_ratio.is_nan() || self.rebuild_churn_ratio < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "rebuild_churn_ratio must be >= 0, got {}",
                self.rebuild_churn_ratio
            )));
        }
        if self.retry_backoff.attempts == 0 {
            return Err(Error::InvalidConfig(
                "retry_backoff.attempts must be at least 1".into(),
            ));
        }
        if self.hnsw.m < 2 || self.hnsw.max_layers == 0 {
            return Err(Error::InvalidConfig(
                "hnsw.m must be >= 2 and hnsw.max_layers >= 1".into(),
            ));
        }
        if self.hnsw.ef_search == 0 || self.hnsw.ef_construction == 0 {
            return Err(Error::InvalidConfig(
                "hnsw.ef_search and hnsw.ef_construction must be >= 1".into(),
            ));
        }
        if self.over_fetch_factor == 0 {
            return Err(Error::InvalidConfig("over_fetch_factor must be >= 1".into()));
        }
        if self.shingle_size == 0 {
            return Err(Error::InvalidConfig("shingle_size must be >= 1".into()));
        }
        if self.chunk_window == 0 || self.chunk_overlap >= self.chunk_window {
            return Err(Error::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_window ({})",
                self.chunk_overlap, self.chunk_window
            )));
        }
        if self.worker_threads == 0 {
            return Err(Error::InvalidConfig("worker_threads must be >= 1".into()));
        }
        if let Some(boost) = self.recency_boost {
            if boost.weight < 0.0 || boost.half_life_secs == 0 {
                return Err(Error::InvalidConfig(
                    "recency_boost needs weight >= 0 and half_life_secs >= 1".into(),
                ));
            }
        }
        Ok(())
    }

    /// Index-level subset of the settings.
    pub fn index_settings(&self) -> IndexSettings {
        IndexSettings {
            dimension: self.embedding_dimension,
            hnsw: self.hnsw.clone(),
            recall_tolerance: self.index_recall_tolerance,
            rebuild_churn_ratio: self.rebuild_churn_ratio,
            exact_scan_threshold: self.exact_scan_threshold,
        }
    }
}
