//! Error types for the arxiv2md library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal** for one item. The paper cannot be
//!   converted at all (unknown identifier, or every conversion
//!   strategy failed). Returned as `Err(PipelineError)` from
//!   [`crate::Orchestrator::process`] and the lower-level stage functions.
//!
//! * [`ItemFailure`]: **Non-fatal** for a batch. One identifier failed but
//!   the rest of the batch is fine. Stored inside
//!   [`crate::output::ItemOutcome::Failed`] so callers can see which
//!   identifiers failed and why without matching on error values.
//!
//! Cache failures are a third, softer category: they are reported by
//! [`crate::cache::CacheStore`] but the orchestrator always downgrades them to
//! a cache miss.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the arxiv2md library.
///
/// Batch-level failures are converted to [`ItemFailure`] and stored in the
/// batch report rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The string is not an arXiv identifier in either supported form.
    #[error("Invalid arXiv identifier '{input}'\nExpected e.g. 2301.00001, 2301.00001v2 or hep-th/9901001.")]
    InvalidIdentifier { input: String },

    // ── Remote errors ─────────────────────────────────────────────────────
    /// Neither the source nor the rendered PDF endpoint had content.
    #[error("arXiv has no source or PDF for '{identifier}'")]
    NotFound { identifier: String },

    /// Transient network or service failure that survived every retry.
    #[error("arXiv request to '{url}' failed after {attempts} attempt(s): {reason}")]
    RemoteUnavailable {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// The API answered but the body could not be understood.
    #[error("Unexpected response from arXiv: {detail}")]
    RemoteFormat { detail: String },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// Archive is corrupt or contains no usable primary document.
    #[error("Extraction failed for '{identifier}': {reason}")]
    Extraction { identifier: String, reason: String },

    /// Every conversion strategy in the chain failed.
    #[error("Conversion failed for '{identifier}': {}", attempts.join("; "))]
    Conversion {
        identifier: String,
        attempts: Vec<String>,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// The cache directory or an entry could not be read or written.
    #[error("Cache I/O error at '{path}': {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A cache entry exists but could not be decoded.
    #[error("Cache entry '{path}' is unreadable: {detail}")]
    CacheEncoding { path: PathBuf, detail: String },

    /// Could not write an output artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Control flow ──────────────────────────────────────────────────────
    /// The operation was cancelled before it finished.
    #[error("Operation cancelled")]
    Cancelled,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Coarse classification used in batch reports and exit-code mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidIdentifier { .. } => ErrorKind::InvalidIdentifier,
            PipelineError::NotFound { .. } => ErrorKind::NotFound,
            PipelineError::RemoteUnavailable { .. } => ErrorKind::RemoteUnavailable,
            PipelineError::RemoteFormat { .. } => ErrorKind::RemoteFormat,
            PipelineError::Extraction { .. } => ErrorKind::Extraction,
            PipelineError::Conversion { .. } => ErrorKind::Conversion,
            PipelineError::CacheIo { .. } | PipelineError::CacheEncoding { .. } => {
                ErrorKind::CacheIo
            }
            PipelineError::OutputWriteFailed { .. } => ErrorKind::OutputWrite,
            PipelineError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for failures of the cache, which callers treat as a miss.
    pub fn is_cache_error(&self) -> bool {
        self.kind() == ErrorKind::CacheIo
    }
}

/// Serializable error taxonomy, one value per [`PipelineError`] family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidIdentifier,
    NotFound,
    RemoteUnavailable,
    RemoteFormat,
    Extraction,
    Conversion,
    CacheIo,
    OutputWrite,
    InvalidConfig,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidIdentifier => "invalid_identifier",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RemoteUnavailable => "remote_unavailable",
            ErrorKind::RemoteFormat => "remote_format",
            ErrorKind::Extraction => "extraction",
            ErrorKind::Conversion => "conversion",
            ErrorKind::CacheIo => "cache_io",
            ErrorKind::OutputWrite => "output_write",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Pipeline stage an item was in when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStage {
    Pending,
    Fetching,
    Extracting,
    Converting,
    Cached,
    Failed,
}

impl fmt::Display for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStage::Pending => "pending",
            ItemStage::Fetching => "fetching",
            ItemStage::Extracting => "extracting",
            ItemStage::Converting => "converting",
            ItemStage::Cached => "cached",
            ItemStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A non-fatal failure for a single batch item.
///
/// Carries the `(kind, message)` pair callers use to tell which identifiers
/// failed and why, plus the stage the item had reached.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} during {stage}: {message}")]
pub struct ItemFailure {
    pub kind: ErrorKind,
    pub stage: ItemStage,
    pub message: String,
}

impl ItemFailure {
    pub fn new(err: &PipelineError, stage: ItemStage) -> Self {
        Self {
            kind: err.kind(),
            stage,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_identifier_display() {
        let e = PipelineError::InvalidIdentifier {
            input: "nope".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("'nope'"), "got: {msg}");
        assert_eq!(e.kind(), ErrorKind::InvalidIdentifier);
    }

    #[test]
    fn remote_unavailable_display() {
        let e = PipelineError::RemoteUnavailable {
            url: "https://arxiv.org/e-print/2301.00001".into(),
            attempts: 4,
            reason: "HTTP 503".into(),
        };
        assert!(e.to_string().contains("4 attempt"));
        assert!(e.to_string().contains("HTTP 503"));
    }

    #[test]
    fn conversion_display_joins_attempts() {
        let e = PipelineError::Conversion {
            identifier: "2301.00001".into(),
            attempts: vec!["pandoc: exit 1".into(), "builtin: empty".into()],
        };
        assert!(e.to_string().contains("pandoc: exit 1; builtin: empty"));
    }

    #[test]
    fn cache_errors_are_flagged() {
        let e = PipelineError::CacheEncoding {
            path: PathBuf::from("/tmp/x.json"),
            detail: "eof".into(),
        };
        assert!(e.is_cache_error());
        assert!(!PipelineError::Cancelled.is_cache_error());
    }

    #[test]
    fn item_failure_keeps_kind_and_stage() {
        let e = PipelineError::NotFound {
            identifier: "2301.99999".into(),
        };
        let f = ItemFailure::new(&e, ItemStage::Fetching);
        assert_eq!(f.kind, ErrorKind::NotFound);
        assert_eq!(f.stage, ItemStage::Fetching);
        assert!(f.to_string().starts_with("not_found during fetching"));
    }

    #[test]
    fn item_failure_serialises() {
        let f = ItemFailure {
            kind: ErrorKind::Extraction,
            stage: ItemStage::Extracting,
            message: "corrupt".into(),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"extraction\""));
        let back: ItemFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }
}
