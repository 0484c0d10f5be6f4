//! # arxiv2md
//!
//! Fetch arXiv papers and convert them to Markdown.
//!
//! A paper's LaTeX source carries its real structure: sections, equations,
//! citations, figure captions. This crate downloads the e-print bundle,
//! unpacks it safely, picks the main document and converts it, with pandoc
//! when it is installed and a built-in transformer otherwise. Papers without
//! source fall back to the rendered PDF. Results are cached on disk and
//! scored for conversion quality.
//!
//! ## Pipeline Overview
//!
//! ```text
//! identifier
//!  │
//!  ├─ 1. Cache    hit → return immediately
//!  ├─ 2. Fetch    e-print, else PDF (rate-limited, retried)
//!  ├─ 3. Extract  gzip/tar/PDF/TeX sniffing, traversal-safe (spawn_blocking)
//!  ├─ 4. Convert  pandoc / pdftotext, then the built-in transformer
//!  ├─ 5. Score    length, residual markup, structure
//!  └─ 6. Store    cache entry + source/markdown/metadata artifacts
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use arxiv2md::{Orchestrator, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder().concurrency(4).build()?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!
//!     let result = orchestrator.process("2301.00001").await?;
//!     println!("{}", result.markdown);
//!     eprintln!("quality {:.2} via {}", result.score(), result.method);
//!
//!     let report = orchestrator.process_batch(&["2301.00002", "hep-th/9901001"], 2).await;
//!     for (input, failure) in report.failures() {
//!         eprintln!("{input}: {failure}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `arxiv2md` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! arxiv2md = { version = "0.1", default-features = false }
//! ```
//!
//! ## External Tools
//!
//! | Program | Used for | When missing |
//! |---------|----------|--------------|
//! | `pandoc` | LaTeX → Markdown | built-in LaTeX transformer |
//! | `pdftotext` | PDF text with layout | built-in `lopdf` extraction |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifacts;
pub mod cache;
pub mod config;
pub mod error;
pub mod identifier;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use artifacts::{ArtifactPaths, ArtifactStore};
pub use cache::{CacheKey, CacheStore};
pub use config::{MethodPreference, PipelineConfig, PipelineConfigBuilder};
pub use error::{ErrorKind, ItemFailure, ItemStage, PipelineError};
pub use identifier::ItemIdentifier;
pub use orchestrator::{CancelHandle, Orchestrator, Processed};
pub use output::{
    BatchOutcome, BatchReport, BatchStats, ConversionIssue, ConversionMethod, ConversionResult,
    DocumentKind, IssueKind, ItemOutcome, PaperHints, PaperMetadata, QualityReport,
    StrategyAttempt,
};
pub use pipeline::feed::{PaperRecord, SearchResponse};
pub use pipeline::rate_limit::RateLimiter;
pub use pipeline::remote::{RemoteClient, SearchQuery, SortBy, SortOrder, SourceKind};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use stream::OutcomeStream;
