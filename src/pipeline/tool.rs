//! External converter strategy: pandoc for LaTeX, pdftotext for PDF.
//!
//! Programs are located once, at construction. A missing program makes the
//! strategy report `Unavailable` so the chain moves on; a crash, timeout or
//! empty output is a `Failed` attempt.

use crate::config::PipelineConfig;
use crate::output::{ConversionMethod, DocumentKind};
use crate::pipeline::extract::ExtractedDocument;
use crate::pipeline::pdf_text;
use crate::pipeline::strategy::{ConversionStrategy, StrategyOutcome, StrategyOutput};
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub struct ExternalToolStrategy {
    pandoc: Option<PathBuf>,
    pdftotext: Option<PathBuf>,
    timeout: Duration,
}

impl std::fmt::Debug for ExternalToolStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalToolStrategy")
            .field("pandoc", &self.pandoc)
            .field("pdftotext", &self.pdftotext)
            .field("timeout_secs", &self.timeout.as_secs())
            .finish()
    }
}

impl ExternalToolStrategy {
    /// Resolve programs from configured paths, else from `PATH`.
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_programs(
            locate(config.pandoc_path.as_deref(), "pandoc"),
            locate(config.pdftotext_path.as_deref(), "pdftotext"),
            Duration::from_secs(config.tool_timeout_secs),
        )
    }

    /// Use exactly these programs; `None` marks a format as unsupported.
    pub fn with_programs(
        pandoc: Option<PathBuf>,
        pdftotext: Option<PathBuf>,
        timeout: Duration,
    ) -> Self {
        debug!(
            "external tools: pandoc={:?} pdftotext={:?}",
            pandoc, pdftotext
        );
        Self {
            pandoc,
            pdftotext,
            timeout,
        }
    }

    async fn run_pandoc(&self, program: &Path, doc: &ExtractedDocument) -> StrategyOutcome {
        let args = [
            "--from=latex",
            "--to=markdown",
            "--wrap=none",
            doc.primary().name.as_str(),
        ];
        match self.run(program, &args, doc.root()).await {
            Ok(markdown) => StrategyOutcome::Converted(StrategyOutput {
                markdown,
                issues: Vec::new(),
                tool: Some("pandoc".to_string()),
            }),
            Err(reason) => StrategyOutcome::Failed(reason),
        }
    }

    async fn run_pdftotext(&self, program: &Path, doc: &ExtractedDocument) -> StrategyOutcome {
        let args = ["-layout", "-enc", "UTF-8", doc.primary().name.as_str(), "-"];
        match self.run(program, &args, doc.root()).await {
            Ok(text) => {
                let mut pages: Vec<String> = text.split('\u{c}').map(str::to_string).collect();
                if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
                    pages.pop();
                }
                let structured = pdf_text::structure_pages(&pages);
                StrategyOutcome::Converted(StrategyOutput {
                    markdown: structured.markdown,
                    issues: structured.issues,
                    tool: Some("pdftotext".to_string()),
                })
            }
            Err(reason) => StrategyOutcome::Failed(reason),
        }
    }

    /// Run a program in `cwd`, returning stdout. The child is killed if the
    /// timeout fires or the future is dropped.
    async fn run(&self, program: &Path, args: &[&str], cwd: &Path) -> Result<String, String> {
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());

        let child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("cannot start {name}: {e}"))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("{name} failed: {e}")),
            Err(_) => {
                warn!("{} timed out after {}s", name, self.timeout.as_secs());
                return Err(format!("{name} timed out after {}s", self.timeout.as_secs()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(format!("{name} exited with {}: {}", output.status, first.trim()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.trim().is_empty() {
            return Err(format!("{name} produced no output"));
        }
        Ok(stdout)
    }
}

impl ConversionStrategy for ExternalToolStrategy {
    fn method(&self) -> ConversionMethod {
        ConversionMethod::ExternalTool
    }

    fn name(&self) -> &str {
        "external-tool"
    }

    fn convert<'a>(&'a self, doc: &'a ExtractedDocument) -> BoxFuture<'a, StrategyOutcome> {
        Box::pin(async move {
            match (doc.kind(), &self.pandoc, &self.pdftotext) {
                (DocumentKind::Latex, Some(pandoc), _) => self.run_pandoc(pandoc, doc).await,
                (DocumentKind::Pdf, _, Some(pdftotext)) => self.run_pdftotext(pdftotext, doc).await,
                (DocumentKind::Latex, None, _) => {
                    StrategyOutcome::Unavailable("pandoc not found".to_string())
                }
                (DocumentKind::Pdf, _, None) => {
                    StrategyOutcome::Unavailable("pdftotext not found".to_string())
                }
            }
        })
    }
}

fn locate(configured: Option<&Path>, program: &str) -> Option<PathBuf> {
    let found = match configured {
        Some(path) => which::which(path),
        None => which::which(program),
    };
    match found {
        Ok(path) => Some(path),
        Err(e) => {
            debug!("{} not available: {}", program, e);
            None
        }
    }
}
