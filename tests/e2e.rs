//! End-to-end tests for arxiv2md against a mocked arXiv.
//!
//! Every endpoint (Atom API, e-print, PDF) is served by `wiremock`, and
//! archives and PDFs are built in-test, so these run offline. The built-in
//! converter is selected throughout so results do not depend on whether
//! pandoc happens to be installed.
//!
//! Run with:
//!   cargo test --test e2e -- --nocapture

use arxiv2md::pipeline::extract::ExtractedDocument;
use arxiv2md::pipeline::strategy::{
    BuiltinStrategy, ConversionStrategy, Converter, StrategyOutcome,
};
use arxiv2md::{
    CancelHandle, ConversionMethod, DocumentKind, ErrorKind, ItemIdentifier, ItemOutcome,
    ItemStage, MethodPreference, Orchestrator, PipelineConfig, PipelineConfigBuilder,
    RateLimiter, RemoteClient, SearchQuery, SourceKind,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::BoxFuture;
use lopdf::{dictionary, Document, Object, Stream};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Fixtures ─────────────────────────────────────────────────────────────────

const MAIN_TEX: &str = r"\documentclass{article}
\usepackage{graphicx}
\title{A Study of Things}
\author{Ada Lovelace \and Alan Turing}
\begin{document}
\maketitle
\begin{abstract}
We study things carefully and at some length.
\end{abstract}
\section{Introduction}
Things are interesting~\cite{knuth84}. See Figure~\ref{fig:plot} and
Equation~\eqref{eq:energy}. % a comment that must vanish
\input{sections/method}
\begin{figure}[t]
\centering
\includegraphics[width=0.5\linewidth]{figs/plot.png}
\caption{A plot of things.}
\label{fig:plot}
\end{figure}
\begin{equation}
E = mc^2 \label{eq:energy}
\end{equation}
\section{Conclusion}
Things remain interesting.
\end{document}
";

const METHOD_TEX: &str = r"\section{Method}
We use \textbf{bold} methods and \emph{careful} measurements.
\begin{itemize}
\item first step
\item second step
\end{itemize}
";

const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <id>https://arxiv.org/api/abc</id>
  <title>arXiv Query</title>
  <updated>2023-01-05T00:00:00-05:00</updated>
  <opensearch:totalResults>1</opensearch:totalResults>
  <opensearch:startIndex>0</opensearch:startIndex>
  <opensearch:itemsPerPage>1</opensearch:itemsPerPage>
  <entry>
    <id>http://arxiv.org/abs/2301.00001v1</id>
    <updated>2023-01-02T10:00:00Z</updated>
    <published>2023-01-01T10:00:00Z</published>
    <title>A Study of Things (Published Version)</title>
    <summary>We study things.</summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <arxiv:primary_category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
    <category term="stat.ML" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
</feed>"#;

/// Tar with raw member names (hostile names included).
fn tar_with(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        let raw = name.as_bytes();
        header.as_old_mut().name[..raw.len()].copy_from_slice(raw);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes).unwrap();
    enc.finish().unwrap()
}

fn paper_bundle() -> Vec<u8> {
    gzip(&tar_with(&[
        ("main.tex", MAIN_TEX.as_bytes()),
        ("sections/method.tex", METHOD_TEX.as_bytes()),
        ("figs/plot.png", b"\x89PNG\r\n\x1a\n fake"),
    ]))
}

/// A one-page PDF whose text mirrors the LaTeX paper.
fn rendered_pdf() -> Vec<u8> {
    let lines = [
        "A Study of Things",
        "Ada Lovelace, Alan Turing",
        "Abstract",
        "We study things carefully and at some length.",
        "1 Introduction",
        "Things are interesting [1]. See Figure 1 and Equation 1.",
        "2 Method",
        "We use bold methods and careful measurements.",
        "3 Conclusion",
        "Things remain interesting.",
    ];
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let mut ops = String::new();
    for (i, line) in lines.iter().enumerate() {
        ops.push_str(&format!(
            "BT /F1 11 Tf 72 {} Td ({line}) Tj ET\n",
            740 - 16 * i as i64
        ));
    }
    let content_id = doc.add_object(Stream::new(dictionary! {}, ops.into_bytes()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Contents" => content_id,
        "Resources" => resources_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::from(page_id)],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

// ── Test helpers ─────────────────────────────────────────────────────────────

struct Dirs {
    cache: TempDir,
    output: TempDir,
}

impl Dirs {
    fn new() -> Self {
        Self {
            cache: tempfile::tempdir().unwrap(),
            output: tempfile::tempdir().unwrap(),
        }
    }
}

fn config(server: &MockServer, dirs: &Dirs) -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .api_url(format!("{}/api/query", server.uri()))
        .source_base_url(server.uri())
        .cache_dir(dirs.cache.path())
        .output_root(dirs.output.path())
        .method(MethodPreference::BuiltinOnly)
        .requests_per_second(50.0)
        .burst(50)
        .max_retries(0)
}

async fn serve(server: &MockServer, route: &str, body: Vec<u8>, content_type: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", content_type)
                .set_body_bytes(body),
        )
        .mount(server)
        .await;
}

/// Assert the markdown passes basic quality checks.
fn assert_markdown_quality(md: &str, context: &str) {
    assert!(!md.trim().is_empty(), "[{context}] Markdown is empty");
    assert!(md.ends_with('\n'), "[{context}] Markdown must end with a newline");
    assert!(
        !md.contains("\n\n\n\n"),
        "[{context}] Output has more than 3 consecutive blank lines"
    );
    let first_line = md.lines().next().unwrap_or("");
    assert!(
        !first_line.starts_with("```"),
        "[{context}] Output must not start with a code fence, got: {first_line:?}"
    );
}

// ── Source path ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_latex_source_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/e-print/2301.00001"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/gzip")
                .set_body_bytes(paper_bundle()),
        )
        .expect(1)
        .mount(&server)
        .await;
    let dirs = Dirs::new();
    let orch = Orchestrator::new(config(&server, &dirs).build().unwrap())
        .await
        .unwrap();

    let result = orch.process("arXiv:2301.00001").await.unwrap();
    let md = &result.markdown;
    assert_markdown_quality(md, "latex");
    assert!(md.starts_with("# A Study of Things\n"), "[latex] title heading missing:\n{md}");
    for needle in ["## Abstract", "## Introduction", "## Method", "## Conclusion", "**bold**", "$$"] {
        assert!(md.contains(needle), "[latex] expected {needle:?} in:\n{md}");
    }
    assert!(md.contains("![A plot of things.](figs/plot.png)"), "[latex] figure missing:\n{md}");
    assert!(md.contains("[@knuth84]"), "[latex] citation missing:\n{md}");
    assert!(!md.contains("a comment that must vanish"), "[latex] comment leaked");

    assert_eq!(result.source_kind, DocumentKind::Latex);
    assert_eq!(result.method, ConversionMethod::Builtin);
    assert!(result.score() > 0.0 && result.score() <= 1.0, "[latex] score {}", result.score());
    assert_eq!(result.metadata.title.as_deref(), Some("A Study of Things"));
    assert_eq!(result.metadata.authors, vec!["Ada Lovelace", "Alan Turing"]);

    // Cache entry retrievable by (identifier, version).
    let id = ItemIdentifier::parse("2301.00001").unwrap();
    let cached = orch.cache().unwrap().get(&orch.cache_key(&id)).await.unwrap();
    assert_eq!(cached.as_ref(), Some(&result), "[latex] cache entry differs");

    // Artifacts in the three-way layout.
    let paths = orch.artifacts().unwrap().paths(&id);
    assert!(paths.source_dir.join("sections/method.tex").is_file(), "[latex] source not saved");
    assert!(paths.manifest.is_file());
    assert!(paths.metadata.is_file());
    let saved = std::fs::read_to_string(&paths.markdown).unwrap();
    assert!(saved.starts_with("---\n"), "[latex] front matter missing");
    assert!(saved.ends_with(md.as_str()));

    // Second call is a cache hit: the e-print mock expects exactly one request.
    let second = orch.process_item(&id, None).await.unwrap();
    assert!(second.from_cache, "[latex] second call should hit the cache");
    assert_eq!(second.result.markdown, *md);
}

#[tokio::test]
async fn test_conversion_is_deterministic() {
    let server = MockServer::start().await;
    serve(&server, "/e-print/2301.00001", paper_bundle(), "application/gzip").await;
    let dirs = Dirs::new();
    let orch = Orchestrator::new(
        config(&server, &dirs)
            .cache_enabled(false)
            .save_artifacts(false)
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    let first = orch.process("2301.00001").await.unwrap();
    let second = orch.process("2301.00001").await.unwrap();
    assert_eq!(first.markdown, second.markdown, "[determinism] markup differs");
    assert_eq!(first.quality, second.quality, "[determinism] quality differs");
    assert_eq!(first.issues, second.issues, "[determinism] issues differ");
}

#[tokio::test]
async fn test_unusable_cache_degrades_to_misses() {
    let server = MockServer::start().await;
    serve(&server, "/e-print/2301.00001", paper_bundle(), "application/gzip").await;
    let dirs = Dirs::new();
    let blocker = dirs.output.path().join("not-a-dir");
    std::fs::write(&blocker, b"plain file").unwrap();
    let orch = Orchestrator::new(
        config(&server, &dirs)
            .cache_dir(blocker.join("cache"))
            .save_artifacts(false)
            .build()
            .unwrap(),
    )
    .await
    .expect("[cache] an unusable cache dir must not stop the pipeline");
    assert!(orch.cache().is_none(), "[cache] caching should be disabled");

    let result = orch.process("2301.00001").await.unwrap();
    assert_markdown_quality(&result.markdown, "cache");
    assert_eq!(result.metadata.title.as_deref(), Some("A Study of Things"));
}

// ── PDF fallback ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pdf_fallback_scores_lower() {
    let server = MockServer::start().await;
    serve(&server, "/e-print/2301.00001", paper_bundle(), "application/gzip").await;
    // 2301.00002 has no source: e-print is unmatched and answers 404.
    serve(&server, "/pdf/2301.00002", rendered_pdf(), "application/pdf").await;
    let dirs = Dirs::new();
    let cfg = config(&server, &dirs).build().unwrap();

    let remote = RemoteClient::new(&cfg, Arc::new(RateLimiter::new(50.0, 50))).unwrap();
    let raw = remote
        .fetch_source(&ItemIdentifier::parse("2301.00002").unwrap())
        .await
        .unwrap();
    assert_eq!(raw.kind, SourceKind::Rendered, "[fallback] expected the PDF endpoint");

    let orch = Orchestrator::new(cfg).await.unwrap();
    let latex = orch.process("2301.00001").await.unwrap();
    let pdf = orch.process("2301.00002").await.unwrap();

    assert_markdown_quality(&pdf.markdown, "pdf");
    assert_eq!(pdf.source_kind, DocumentKind::Pdf);
    assert!(pdf.markdown.contains("Things remain interesting."), "[pdf] body missing:\n{}", pdf.markdown);
    assert!(
        pdf.score() < latex.score(),
        "[fallback] PDF quality {} should be below LaTeX quality {}",
        pdf.score(),
        latex.score()
    );
}

#[tokio::test]
async fn test_missing_everywhere_is_not_found() {
    let server = MockServer::start().await;
    let dirs = Dirs::new();
    let orch = Orchestrator::new(config(&server, &dirs).build().unwrap())
        .await
        .unwrap();
    let err = orch.process("2301.09999").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound, "[not-found] got {err}");
}

// ── Safety ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_traversal_member_never_escapes() {
    let server = MockServer::start().await;
    let bundle = gzip(&tar_with(&[
        ("../../evil.txt", b"owned"),
        ("main.tex", MAIN_TEX.as_bytes()),
    ]));
    serve(&server, "/e-print/2301.00001", bundle, "application/gzip").await;
    let dirs = Dirs::new();
    let orch = Orchestrator::new(config(&server, &dirs).build().unwrap())
        .await
        .unwrap();

    let result = orch.process("2301.00001").await.unwrap();
    assert!(
        result.extraction_warnings.iter().any(|w| w.contains("../../evil.txt")),
        "[traversal] warning missing: {:?}",
        result.extraction_warnings
    );
    let root = dirs.output.path();
    assert!(!root.join("../evil.txt").exists(), "[traversal] escaped the output root");
    assert!(!root.join("../../evil.txt").exists(), "[traversal] escaped the output root");
    let source = orch
        .artifacts()
        .unwrap()
        .paths(&ItemIdentifier::parse("2301.00001").unwrap())
        .source_dir;
    assert!(!contains_file(&source, "evil.txt"), "[traversal] member was saved");
}

fn contains_file(dir: &Path, name: &str) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                let p = e.path();
                p.file_name().is_some_and(|n| n == name) || (p.is_dir() && contains_file(&p, name))
            })
        })
        .unwrap_or(false)
}

// ── Batch ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_batch_reports_every_input() {
    let server = MockServer::start().await;
    serve(&server, "/e-print/2301.00001", paper_bundle(), "application/gzip").await;
    serve(&server, "/e-print/2301.00002", paper_bundle(), "application/gzip").await;
    let dirs = Dirs::new();
    let orch = Orchestrator::new(config(&server, &dirs).save_artifacts(false).build().unwrap())
        .await
        .unwrap();

    let inputs = ["2301.00001", "2301.00003", "2301.00002", "2301.00004"];
    let report = orch.process_batch(&inputs, 2).await;

    assert_eq!(report.outcomes.len(), 4, "[batch] one outcome per input");
    assert_eq!(report.stats.converted, 2);
    assert_eq!(report.stats.failed, 2);
    for (i, o) in report.outcomes.iter().enumerate() {
        assert_eq!(o.index, i, "[batch] outcomes must be in input order");
        assert_eq!(o.input, inputs[i]);
    }
    let failed: Vec<&str> = report.failures().map(|(input, _)| input).collect();
    assert_eq!(failed, vec!["2301.00003", "2301.00004"]);
    for (_, failure) in report.failures() {
        assert_eq!(failure.kind, ErrorKind::NotFound);
        assert_eq!(failure.stage, ItemStage::Fetching);
    }
}

static BUILTIN: BuiltinStrategy = BuiltinStrategy;

/// Panics inside one item's conversion; delegates everything else.
struct PanicsOn(&'static str);

impl ConversionStrategy for PanicsOn {
    fn method(&self) -> ConversionMethod {
        ConversionMethod::Builtin
    }

    fn name(&self) -> &str {
        "panics-on"
    }

    fn convert<'a>(&'a self, doc: &'a ExtractedDocument) -> BoxFuture<'a, StrategyOutcome> {
        if doc.identifier().as_str() == self.0 {
            panic!("converter exploded on {}", self.0);
        }
        BUILTIN.convert(doc)
    }
}

#[tokio::test]
async fn test_batch_survives_a_panicking_item() {
    let server = MockServer::start().await;
    serve(&server, "/e-print/2301.00001", paper_bundle(), "application/gzip").await;
    serve(&server, "/e-print/2301.00002", paper_bundle(), "application/gzip").await;
    let dirs = Dirs::new();
    let cfg = config(&server, &dirs).save_artifacts(false).build().unwrap();
    let converter = Converter::with_strategies(vec![Box::new(PanicsOn("2301.00002"))]);
    let orch = Orchestrator::with_converter(cfg, converter).await.unwrap();

    let report = orch.process_batch(&["2301.00001", "2301.00002"], 2).await;
    assert!(report.outcomes[0].outcome.is_success(), "[panic] healthy item affected");
    let failure = report.outcomes[1].outcome.failure().expect("[panic] expected a failure");
    assert_eq!(failure.kind, ErrorKind::Internal);
    assert_eq!(failure.stage, ItemStage::Converting);
    assert!(failure.message.contains("converter exploded"), "[panic] got {}", failure.message);
}

#[tokio::test]
async fn test_cancel_stops_in_flight_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(paper_bundle())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;
    let dirs = Dirs::new();
    let orch = Orchestrator::new(config(&server, &dirs).build().unwrap())
        .await
        .unwrap();

    let cancel = CancelHandle::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });
    }
    let started = Instant::now();
    let report = orch
        .process_batch_with_cancel(&["2301.00001", "2301.00002", "2301.00003"], 1, &cancel)
        .await;

    assert!(started.elapsed() < Duration::from_secs(5), "[cancel] batch did not stop early");
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.stats.cancelled, 3, "[cancel] got {:?}", report.stats);
    assert!(report.outcomes.iter().all(|o| o.outcome == ItemOutcome::Cancelled));
}

// ── Metadata ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_lookup_hints_override_scanned_metadata() {
    let server = MockServer::start().await;
    serve(&server, "/e-print/2301.00001", paper_bundle(), "application/gzip").await;
    Mock::given(method("GET"))
        .and(path("/api/query"))
        .and(query_param("id_list", "2301.00001"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
        .expect(1)
        .mount(&server)
        .await;
    let dirs = Dirs::new();
    let orch = Orchestrator::new(
        config(&server, &dirs)
            .lookup_metadata(true)
            .save_artifacts(false)
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    let result = orch.process("2301.00001").await.unwrap();
    assert_eq!(
        result.metadata.title.as_deref(),
        Some("A Study of Things (Published Version)"),
        "[hints] title should come from the API record"
    );
    assert_eq!(result.metadata.categories, vec!["cs.LG", "stat.ML"]);
    assert_eq!(result.metadata.submitted.as_deref(), Some("2023-01-01T10:00:00Z"));
    // Markup is independent of out-of-band metadata.
    assert!(result.markdown.starts_with("# A Study of Things\n"));
}

#[tokio::test]
async fn test_search_returns_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/query"))
        .and(query_param("max_results", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
        .mount(&server)
        .await;
    let dirs = Dirs::new();
    let orch = Orchestrator::new(config(&server, &dirs).build().unwrap())
        .await
        .unwrap();

    let response = orch
        .search(&SearchQuery::new("things").category("cs.LG").max_results(5))
        .await
        .unwrap();
    assert_eq!(response.total_results, 1);
    assert_eq!(response.records.len(), 1);
    assert_eq!(response.records[0].id, "2301.00001v1");
    assert_eq!(response.records[0].primary_category.as_deref(), Some("cs.LG"));
}
