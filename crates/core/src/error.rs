//! Error taxonomy shared by every chunkdb component.
//!
//! Index-level structural errors (`CorruptIndex`, `DimensionMismatch`) are fatal
//! to the operation that raised them. Pipeline failures carry the document they
//! belong to so the orchestrator can isolate them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for chunkdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors surfaced by the core library.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown chunk or document id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A vector or query dimension disagrees with the index.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A vector that cannot be compared by cosine similarity (NaN, Inf, zero norm).
    #[error("invalid vector: {0}")]
    InvalidVector(String),

    /// Malformed query: k out of range, bad filter, or unusable query text.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Persisted state failed checksum or structural validation.
    #[error("corrupt index at {path}: {reason}")]
    CorruptIndex { path: String, reason: String },

    /// An embedding or generation call exhausted its retries.
    #[error("{service} failed after {attempts} attempt(s): {reason}")]
    ExternalServiceFailure {
        service: String,
        attempts: u32,
        reason: String,
    },

    /// Text extraction failed for one document.
    #[error("extraction failed for {path}: {reason}")]
    ExtractionFailure { path: String, reason: String },

    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The run was cancelled before the operation committed.
    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Documents failed during a pipeline run. `kind` is the category of the
    /// first failure and decides the exit status.
    #[error("{failed} document(s) failed; first: {first}")]
    DocumentsFailed {
        failed: usize,
        kind: ErrorKind,
        first: String,
    },
}

/// Error category, one per exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Extraction,
    ExternalService,
    CorruptIndex,
    InvalidConfig,
    InvalidInput,
    NotFound,
    Other,
}

impl ErrorKind {
    /// `2` extraction, `3` embedding service unreachable, `4` index corruption,
    /// `5` configuration, `6` invalid query or vector, `7` not found, `1` anything else.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Extraction => 2,
            ErrorKind::ExternalService => 3,
            ErrorKind::CorruptIndex => 4,
            ErrorKind::InvalidConfig => 5,
            ErrorKind::InvalidInput => 6,
            ErrorKind::NotFound => 7,
            ErrorKind::Other => 1,
        }
    }
}

impl Error {
    pub fn chunk_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            kind: "chunk",
            id: id.to_string(),
        }
    }

    pub fn document_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            kind: "document",
            id: id.to_string(),
        }
    }

    pub fn corrupt(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        Error::CorruptIndex {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ExtractionFailure { .. } => ErrorKind::Extraction,
            Error::ExternalServiceFailure { .. } => ErrorKind::ExternalService,
            Error::CorruptIndex { .. } => ErrorKind::CorruptIndex,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::InvalidQuery(_) | Error::DimensionMismatch { .. } | Error::InvalidVector(_) => {
                ErrorKind::InvalidInput
            }
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::DocumentsFailed { kind, .. } => *kind,
            Error::Cancelled | Error::Io(_) => ErrorKind::Other,
        }
    }

    /// Process exit status for this error category.
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        let extraction = Error::ExtractionFailure {
            path: "a.pdf".into(),
            reason: "bad xref".into(),
        };
        let service = Error::ExternalServiceFailure {
            service: "embedder".into(),
            attempts: 3,
            reason: "connection refused".into(),
        };
        let corrupt = Error::corrupt("/tmp/index", "crc mismatch");
        let codes = [extraction.exit_code(), service.exit_code(), corrupt.exit_code()];
        assert_eq!(codes, [2, 3, 4]);

        let batch = Error::DocumentsFailed {
            failed: 2,
            kind: ErrorKind::ExternalService,
            first: "connection refused".into(),
        };
        assert_eq!(batch.exit_code(), 3);
        assert_eq!(Error::Cancelled.exit_code(), 1);
    }

    #[test]
    fn test_messages() {
        let e = Error::DimensionMismatch {
            expected: 4,
            actual: 3,
        };
        assert_eq!(e.to_string(), "dimension mismatch: expected 4, got 3");
        assert_eq!(
            Error::chunk_not_found("abc").to_string(),
            "chunk not found: abc"
        );
    }
}
