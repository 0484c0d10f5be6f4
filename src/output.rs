//! Result types produced by the pipeline.
//!
//! Everything here is plain data: `Serialize + Deserialize` so results can be
//! cached as JSON, printed by the CLI with `--json`, or shipped to another
//! process.

use crate::error::ItemFailure;
use crate::identifier::ItemIdentifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Format of the primary document selected from an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// LaTeX source: the high-fidelity path.
    Latex,
    /// Rendered PDF: only text layout is available.
    Pdf,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocumentKind::Latex => "latex",
            DocumentKind::Pdf => "pdf",
        })
    }
}

/// How a result's markup was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMethod {
    /// An external converter (pandoc / pdftotext).
    ExternalTool,
    /// The crate's own structural transformer.
    Builtin,
}

impl fmt::Display for ConversionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConversionMethod::ExternalTool => "external_tool",
            ConversionMethod::Builtin => "builtin",
        })
    }
}

/// Category of a detected conversion issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A LaTeX command the converter does not understand; its text was kept.
    UnresolvedCommand,
    /// An environment the converter does not understand.
    UnhandledEnvironment,
    /// An `\input`/`\include` target missing from the archive.
    MissingInput,
    /// A command still present in the final markup (outside math and code).
    ResidualMarkup,
    /// A PDF page with no extractable text.
    EmptyPage,
    /// A table that could not be turned into a grid.
    MalformedTable,
    /// A nesting or expansion budget ran out; the remainder was flattened
    /// to plain text.
    LimitExceeded,
}

/// One aggregated issue: `count` occurrences of `construct`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionIssue {
    pub kind: IssueKind,
    pub construct: String,
    pub count: usize,
}

impl fmt::Display for ConversionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} `{}`", self.kind, self.construct)?;
        if self.count > 1 {
            write!(f, " ×{}", self.count)?;
        }
        Ok(())
    }
}

/// Accumulates issues by `(kind, construct)` while a document is converted.
#[derive(Debug, Default)]
pub(crate) struct IssueLog {
    counts: BTreeMap<(IssueKind, String), usize>,
}

impl IssueLog {
    pub(crate) fn record(&mut self, kind: IssueKind, construct: impl Into<String>) {
        self.record_n(kind, construct, 1);
    }

    pub(crate) fn record_n(&mut self, kind: IssueKind, construct: impl Into<String>, n: usize) {
        if n > 0 {
            *self.counts.entry((kind, construct.into())).or_insert(0) += n;
        }
    }

    pub(crate) fn extend(&mut self, issues: impl IntoIterator<Item = ConversionIssue>) {
        for issue in issues {
            self.record_n(issue.kind, issue.construct, issue.count);
        }
    }

    /// Issues ordered by kind, then construct.
    pub(crate) fn into_issues(self) -> Vec<ConversionIssue> {
        self.counts
            .into_iter()
            .map(|((kind, construct), count)| ConversionIssue {
                kind,
                construct,
                count,
            })
            .collect()
    }
}

/// Components of the advisory quality score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Final score in [0, 1].
    pub score: f64,
    /// Markup length over source text length, clamped to [0, 1].
    pub length_ratio: f64,
    /// Residual-markup component, `1 / (1 + 0.15·issues)`.
    pub residual_score: f64,
    /// Share of applicable structure checks that passed.
    pub structure_score: f64,
    /// LaTeX commands still visible in the markup.
    pub residual_commands: usize,
}

/// Best-effort bibliographic record for a paper.
///
/// Every field except `identifier` is optional; metadata extraction never
/// fails, it just leaves fields empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperMetadata {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    /// Submission date as given by arXiv (RFC 3339) or the document's `\date`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

/// Out-of-band metadata, usually from a prior [`crate::RemoteClient::search`].
///
/// Takes precedence over whatever the converter scans from the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperHints {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub published: Option<String>,
    pub abstract_text: Option<String>,
}

/// Record of a strategy that was tried and did not produce the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub outcome: AttemptOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Unavailable,
    Failed,
}

/// The complete output of converting one paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub identifier: ItemIdentifier,
    /// Converted Markdown body (no front matter).
    pub markdown: String,
    pub metadata: PaperMetadata,
    pub quality: QualityReport,
    pub issues: Vec<ConversionIssue>,
    pub method: ConversionMethod,
    /// Name of the external tool, when `method` is `ExternalTool`.
    pub tool: Option<String>,
    pub source_kind: DocumentKind,
    /// Strategies tried before the one that succeeded, in order.
    pub fallbacks: Vec<StrategyAttempt>,
    /// Warnings raised while unpacking the archive.
    pub extraction_warnings: Vec<String>,
}

impl ConversionResult {
    /// Advisory quality score in [0, 1].
    pub fn score(&self) -> f64 {
        self.quality.score
    }
}

// ── Batch types ──────────────────────────────────────────────────────────

/// What happened to one batch slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Converted {
        result: Box<ConversionResult>,
        from_cache: bool,
    },
    Failed(ItemFailure),
    Skipped {
        reason: String,
    },
    Cancelled,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Converted { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ItemOutcome::Failed(_))
    }

    pub fn result(&self) -> Option<&ConversionResult> {
        match self {
            ItemOutcome::Converted { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&ItemFailure> {
        match self {
            ItemOutcome::Failed(f) => Some(f),
            _ => None,
        }
    }
}

/// One filled batch slot, addressed by input position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Position of the identifier in the input list.
    pub index: usize,
    /// Identifier exactly as the caller passed it.
    pub input: String,
    pub outcome: ItemOutcome,
}

/// Aggregate counters for a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub converted: usize,
    /// Subset of `converted` served from the cache.
    pub from_cache: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub duration_ms: u64,
}

/// Output of a batch: exactly one outcome per input identifier, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcomes: Vec<BatchOutcome>,
    pub stats: BatchStats,
}

impl BatchReport {
    pub(crate) fn from_outcomes(outcomes: Vec<BatchOutcome>, duration_ms: u64) -> Self {
        let mut stats = BatchStats {
            total: outcomes.len(),
            duration_ms,
            ..BatchStats::default()
        };
        for o in &outcomes {
            match &o.outcome {
                ItemOutcome::Converted { from_cache, .. } => {
                    stats.converted += 1;
                    if *from_cache {
                        stats.from_cache += 1;
                    }
                }
                ItemOutcome::Failed(_) => stats.failed += 1,
                ItemOutcome::Skipped { .. } => stats.skipped += 1,
                ItemOutcome::Cancelled => stats.cancelled += 1,
            }
        }
        Self { outcomes, stats }
    }

    /// Outcomes that failed, with their inputs.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &ItemFailure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.outcome.failure().map(|f| (o.input.as_str(), f)))
    }
}
