//! Conversion strategies and the fallback chain that drives them.
//!
//! ## Chain
//!
//! ```text
//! Auto         ──▶ [external tool, builtin]
//! ToolOnly     ──▶ [external tool]
//! BuiltinOnly  ──▶ [builtin]
//! ```
//!
//! Strategies never return errors. They report `Unavailable` (could not even
//! try) or `Failed` (tried and gave up), and the [`Converter`] moves to the
//! next one, recording the attempt in [`ConversionResult::fallbacks`].

use crate::config::{MethodPreference, PipelineConfig};
use crate::error::PipelineError;
use crate::output::{
    AttemptOutcome, ConversionIssue, ConversionMethod, ConversionResult, DocumentKind, IssueKind,
    IssueLog, PaperHints, PaperMetadata, StrategyAttempt,
};
use crate::pipeline::extract::ExtractedDocument;
use crate::pipeline::quality::{self, SourceSignals};
use crate::pipeline::tool::ExternalToolStrategy;
use crate::pipeline::{latex, metadata, pdf_text, postprocess};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

/// Raw markup produced by a strategy, before post-processing.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutput {
    pub markdown: String,
    pub issues: Vec<ConversionIssue>,
    /// External program that produced the markup, if any.
    pub tool: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    Converted(StrategyOutput),
    /// The strategy cannot run here (e.g. its program is missing).
    Unavailable(String),
    /// The strategy ran and did not produce usable output.
    Failed(String),
}

/// One way of turning an [`ExtractedDocument`] into Markdown.
pub trait ConversionStrategy: Send + Sync {
    fn method(&self) -> ConversionMethod;

    /// Short name used in logs and in recorded fallbacks.
    fn name(&self) -> &str;

    fn convert<'a>(&'a self, doc: &'a ExtractedDocument) -> BoxFuture<'a, StrategyOutcome>;
}

// ── Built-in strategy ────────────────────────────────────────────────────

/// The crate's own transformers. Never unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinStrategy;

impl ConversionStrategy for BuiltinStrategy {
    fn method(&self) -> ConversionMethod {
        ConversionMethod::Builtin
    }

    fn name(&self) -> &str {
        "builtin"
    }

    fn convert<'a>(&'a self, doc: &'a ExtractedDocument) -> BoxFuture<'a, StrategyOutcome> {
        Box::pin(async move {
            match doc.kind() {
                DocumentKind::Latex => {
                    let job = latex::LatexJob::new(doc);
                    let out = match tokio::task::spawn_blocking(move || job.convert()).await {
                        Ok(out) => out,
                        Err(e) => {
                            return StrategyOutcome::Failed(format!("LaTeX task failed: {e}"))
                        }
                    };
                    if out.markdown.trim().is_empty() {
                        return StrategyOutcome::Failed("document body is empty".to_string());
                    }
                    StrategyOutcome::Converted(StrategyOutput {
                        markdown: out.markdown,
                        issues: out.issues,
                        tool: None,
                    })
                }
                DocumentKind::Pdf => {
                    match pdf_text::document_text(doc)
                        .await
                        .and_then(|text| pdf_text::convert_text(&text))
                    {
                        Ok(out) => StrategyOutcome::Converted(StrategyOutput {
                            markdown: out.markdown,
                            issues: out.issues,
                            tool: None,
                        }),
                        Err(reason) => StrategyOutcome::Failed(reason),
                    }
                }
            }
        })
    }
}

// ── Converter ────────────────────────────────────────────────────────────

/// Runs the strategy chain, then post-processes, scores and attaches
/// metadata.
pub struct Converter {
    chain: Vec<Box<dyn ConversionStrategy>>,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("chain", &self.strategy_names())
            .finish()
    }
}

impl Converter {
    /// Build the chain for `config.method`.
    pub fn new(config: &PipelineConfig) -> Self {
        let tool = || Box::new(ExternalToolStrategy::new(config)) as Box<dyn ConversionStrategy>;
        let builtin = || Box::new(BuiltinStrategy) as Box<dyn ConversionStrategy>;
        let chain = match config.method {
            MethodPreference::Auto => vec![tool(), builtin()],
            MethodPreference::ToolOnly => vec![tool()],
            MethodPreference::BuiltinOnly => vec![builtin()],
        };
        Self { chain }
    }

    /// Use an explicit chain, tried in order.
    pub fn with_strategies(chain: Vec<Box<dyn ConversionStrategy>>) -> Self {
        Self { chain }
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.chain.iter().map(|s| s.name()).collect()
    }

    /// Convert one document.
    ///
    /// # Errors
    /// [`PipelineError::Conversion`] when every strategy in the chain was
    /// unavailable or failed.
    pub async fn convert(
        &self,
        doc: &ExtractedDocument,
        hints: Option<&PaperHints>,
    ) -> Result<ConversionResult, PipelineError> {
        let id = doc.identifier();

        // ── Step 1: Analyse the source ───────────────────────────────────
        let (signals, scanned) = analyse(doc).await;

        // ── Step 2: Run the chain ────────────────────────────────────────
        let mut fallbacks = Vec::new();
        let mut chosen = None;
        for strategy in &self.chain {
            match strategy.convert(doc).await {
                StrategyOutcome::Converted(out) => {
                    chosen = Some((strategy.method(), out));
                    break;
                }
                StrategyOutcome::Unavailable(reason) => {
                    debug!("{}: strategy {} unavailable: {}", id, strategy.name(), reason);
                    fallbacks.push(StrategyAttempt {
                        strategy: strategy.name().to_string(),
                        outcome: AttemptOutcome::Unavailable,
                        detail: reason,
                    });
                }
                StrategyOutcome::Failed(reason) => {
                    warn!("{}: strategy {} failed: {}", id, strategy.name(), reason);
                    fallbacks.push(StrategyAttempt {
                        strategy: strategy.name().to_string(),
                        outcome: AttemptOutcome::Failed,
                        detail: reason,
                    });
                }
            }
        }

        let Some((method, output)) = chosen else {
            return Err(PipelineError::Conversion {
                identifier: id.to_string(),
                attempts: fallbacks
                    .iter()
                    .map(|a| format!("{}: {}", a.strategy, a.detail))
                    .collect(),
            });
        };

        // ── Step 3: Post-process ─────────────────────────────────────────
        let mut markdown = postprocess::clean_markdown(&output.markdown);
        if let Some(title) = &scanned.title {
            if !markdown.starts_with("# ") {
                markdown = format!("# {title}\n\n{markdown}");
            }
        }

        // ── Step 4: Collect issues ───────────────────────────────────────
        let mut log = IssueLog::default();
        log.extend(output.issues);
        for (command, count) in quality::residual_commands(&markdown) {
            log.record_n(IssueKind::ResidualMarkup, command, count);
        }
        let issues = log.into_issues();

        // ── Step 5: Score ────────────────────────────────────────────────
        let quality = quality::score(&markdown, &signals, &issues, doc.kind());
        info!(
            "{}: converted via {} (quality {:.2}, {} issues)",
            id,
            method,
            quality.score,
            issues.len()
        );

        Ok(ConversionResult {
            identifier: id.clone(),
            markdown,
            metadata: metadata::merge(scanned, hints),
            quality,
            issues,
            method,
            tool: output.tool,
            source_kind: doc.kind(),
            fallbacks,
            extraction_warnings: doc.warnings().iter().map(ToString::to_string).collect(),
        })
    }
}

/// Source signals for scoring plus metadata scanned from the document.
async fn analyse(doc: &ExtractedDocument) -> (SourceSignals, PaperMetadata) {
    let id = doc.identifier().as_str();
    match doc.kind() {
        DocumentKind::Latex => {
            let source = latex::LatexJob::new(doc).expanded_source();
            let signals = SourceSignals::from_latex(latex::document_body(&source));
            (signals, metadata::from_latex(id, &source))
        }
        DocumentKind::Pdf => match pdf_text::document_text(doc).await {
            Ok(text) => (
                SourceSignals::from_pdf_text(&text.joined()),
                metadata::from_pdf_info(id, &text.info),
            ),
            Err(reason) => {
                debug!("{}: cannot analyse PDF: {}", id, reason);
                (SourceSignals::default(), PaperMetadata { identifier: id.to_string(), ..Default::default() })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::ItemIdentifier;
    use crate::pipeline::extract::{extract_bytes, tests::tar_with, ExtractionLimits};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        name: &'static str,
        outcome: StrategyOutcome,
        calls: Arc<AtomicUsize>,
    }

    impl ConversionStrategy for Scripted {
        fn method(&self) -> ConversionMethod {
            ConversionMethod::ExternalTool
        }
        fn name(&self) -> &str {
            self.name
        }
        fn convert<'a>(&'a self, _doc: &'a ExtractedDocument) -> BoxFuture<'a, StrategyOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self.outcome.clone();
            Box::pin(async move { outcome })
        }
    }

    fn scripted(name: &'static str, outcome: StrategyOutcome) -> (Box<dyn ConversionStrategy>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Scripted {
                name,
                outcome,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    const PAPER: &[u8] = b"\\documentclass{article}
\\title{A Small Paper}
\\author{Ada Lovelace \\and Alan Turing}
\\begin{document}
\\maketitle
\\begin{abstract}
We study small things.
\\end{abstract}
\\section{Introduction}
Small things matter \\cite{knuth}.
\\begin{equation}
E = mc^2
\\end{equation}
\\section{Conclusion}
They do.
\\end{document}
";

    fn doc(source: &[u8]) -> ExtractedDocument {
        extract_bytes(
            &ItemIdentifier::parse("2301.00001").unwrap(),
            &tar_with(&[("main.tex", source)]),
            &ExtractionLimits::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn builtin_converts_latex() {
        let converter = Converter::with_strategies(vec![Box::new(BuiltinStrategy)]);
        let result = converter.convert(&doc(PAPER), None).await.unwrap();
        assert!(result.markdown.starts_with("# A Small Paper\n"), "got: {}", result.markdown);
        assert!(result.markdown.contains("## Introduction"));
        assert!(result.markdown.contains("$$\nE = mc^2\n$$"));
        assert_eq!(result.method, ConversionMethod::Builtin);
        assert_eq!(result.source_kind, DocumentKind::Latex);
        assert!(result.issues.is_empty(), "issues: {:?}", result.issues);
        assert!(result.score() > 0.75, "score {}", result.score());
        assert_eq!(result.metadata.authors, vec!["Ada Lovelace", "Alan Turing"]);
    }

    #[tokio::test]
    async fn runaway_macros_finish_with_an_issue() {
        let src = b"\\documentclass{article}
\\newcommand{\\x}{\\x\\x\\x\\x\\x\\x\\x\\x}
\\begin{document}
Text \\x.
\\end{document}
";
        let result = Converter::with_strategies(vec![Box::new(BuiltinStrategy)])
            .convert(&doc(src), None)
            .await
            .unwrap();
        assert_eq!(result.method, ConversionMethod::Builtin);
        assert!(
            result.issues.iter().any(|i| i.kind == IssueKind::LimitExceeded),
            "issues: {:?}",
            result.issues
        );
    }

    #[tokio::test]
    async fn falls_back_and_records_attempts() {
        let (tool, tool_calls) = scripted("tool", StrategyOutcome::Failed("crashed".into()));
        let converter = Converter::with_strategies(vec![tool, Box::new(BuiltinStrategy)]);
        let result = converter.convert(&doc(PAPER), None).await.unwrap();
        assert_eq!(tool_calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.method, ConversionMethod::Builtin);
        assert_eq!(result.fallbacks.len(), 1);
        assert_eq!(result.fallbacks[0].outcome, AttemptOutcome::Failed);
        assert_eq!(result.fallbacks[0].detail, "crashed");
    }

    #[tokio::test]
    async fn first_success_stops_the_chain() {
        let (first, _) = scripted(
            "tool",
            StrategyOutcome::Converted(StrategyOutput {
                markdown: "Body from tool.".into(),
                issues: vec![],
                tool: Some("pandoc".into()),
            }),
        );
        let (second, second_calls) = scripted("other", StrategyOutcome::Failed("unused".into()));
        let converter = Converter::with_strategies(vec![first, second]);
        let result = converter.convert(&doc(PAPER), None).await.unwrap();
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.tool.as_deref(), Some("pandoc"));
        // Tool output lacks a title, so the scanned one is prepended.
        assert_eq!(result.markdown, "# A Small Paper\n\nBody from tool.\n");
        assert!(result.fallbacks.is_empty());
    }

    #[tokio::test]
    async fn exhausted_chain_is_an_error() {
        let (a, _) = scripted("a", StrategyOutcome::Unavailable("missing".into()));
        let (b, _) = scripted("b", StrategyOutcome::Failed("broken".into()));
        let converter = Converter::with_strategies(vec![a, b]);
        let err = converter.convert(&doc(PAPER), None).await.unwrap_err();
        match err {
            PipelineError::Conversion { attempts, .. } => {
                assert_eq!(attempts, vec!["a: missing", "b: broken"]);
            }
            other => panic!("expected Conversion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn residual_markup_lowers_quality() {
        let clean = Converter::with_strategies(vec![Box::new(BuiltinStrategy)])
            .convert(&doc(PAPER), None)
            .await
            .unwrap();
        let (tool, _) = scripted(
            "tool",
            StrategyOutcome::Converted(StrategyOutput {
                markdown: format!("{}\n\\weird and \\odd left over", clean.markdown),
                issues: vec![],
                tool: None,
            }),
        );
        let noisy = Converter::with_strategies(vec![tool])
            .convert(&doc(PAPER), None)
            .await
            .unwrap();
        let residual: Vec<_> = noisy
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::ResidualMarkup)
            .map(|i| i.construct.as_str())
            .collect();
        assert_eq!(residual, vec!["\\odd", "\\weird"]);
        assert!(noisy.score() < clean.score());
    }

    #[tokio::test]
    async fn conversion_is_deterministic() {
        let converter = Converter::with_strategies(vec![Box::new(BuiltinStrategy)]);
        let a = converter.convert(&doc(PAPER), None).await.unwrap();
        let b = converter.convert(&doc(PAPER), None).await.unwrap();
        assert_eq!(a.markdown, b.markdown);
        assert_eq!(a.issues, b.issues);
    }

    #[tokio::test]
    async fn hints_override_metadata_only() {
        let converter = Converter::with_strategies(vec![Box::new(BuiltinStrategy)]);
        let hints = PaperHints {
            title: Some("Official".into()),
            ..PaperHints::default()
        };
        let plain = converter.convert(&doc(PAPER), None).await.unwrap();
        let hinted = converter.convert(&doc(PAPER), Some(&hints)).await.unwrap();
        assert_eq!(hinted.metadata.title.as_deref(), Some("Official"));
        assert_eq!(hinted.markdown, plain.markdown);
    }

    #[test]
    fn chain_follows_preference() {
        let build = |method| {
            let config = PipelineConfig::builder().method(method).build().unwrap();
            Converter::new(&config).strategy_names().join(",")
        };
        assert_eq!(build(MethodPreference::Auto), "external-tool,builtin");
        assert_eq!(build(MethodPreference::ToolOnly), "external-tool");
        assert_eq!(build(MethodPreference::BuiltinOnly), "builtin");
    }
}
