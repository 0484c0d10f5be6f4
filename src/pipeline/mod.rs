//! Pipeline stages for arXiv-to-Markdown conversion.
//!
//! Each submodule implements one step; the orchestrator strings them
//! together per item.
//!
//! ## Data Flow
//!
//! ```text
//! remote ──▶ extract ──▶ strategy ──▶ postprocess ──▶ quality
//! (e-print/pdf) (tar/gz)  (tool|builtin)  (cleanup)     (score)
//! ```
//!
//! 1. [`remote`] fetches sources and search results through the shared
//!    [`rate_limit::RateLimiter`]; [`feed`] parses the Atom responses
//! 2. [`extract`] unpacks the archive into a private workspace and picks
//!    the primary document; blocking, run under `spawn_blocking`
//! 3. [`strategy`] runs the conversion chain: [`tool`] (pandoc/pdftotext)
//!    then the built-in [`latex`] and [`pdf_text`] transformers
//! 4. [`postprocess`] applies deterministic Markdown cleanup rules
//! 5. [`quality`] scores the result; [`metadata`] fills the bibliographic
//!    record

pub mod extract;
pub mod feed;
pub mod latex;
pub mod metadata;
pub mod pdf_text;
pub mod postprocess;
pub mod quality;
pub mod rate_limit;
pub mod remote;
pub mod strategy;
pub mod tool;
