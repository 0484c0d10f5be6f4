//! Advisory quality scoring.
//!
//! ```text
//! score = fidelity × (0.35·length_ratio + 0.40·residual_score + 0.25·structure_score)
//! ```
//!
//! The score never gates anything; it is stored with the result so callers
//! can decide what to re-run or inspect.

use crate::output::{ConversionIssue, DocumentKind, QualityReport};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

const LENGTH_WEIGHT: f64 = 0.35;
const RESIDUAL_WEIGHT: f64 = 0.40;
const STRUCTURE_WEIGHT: f64 = 0.25;
const ISSUE_PENALTY: f64 = 0.15;

/// What the source promised, so the output can be checked against it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSignals {
    pub text_chars: usize,
    pub has_sections: bool,
    pub has_figures: bool,
    pub has_equations: bool,
}

static RE_TEX_SECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\(?:part|chapter|section|subsection|subsubsection)\*?\s*[\[{]").unwrap()
});
static RE_TEX_FIGURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\includegraphics|\\begin\{figure\*?\}").unwrap());
static RE_TEX_EQUATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\begin\{(?:equation|align|gather|multline|eqnarray|displaymath)\*?\}|\\\[|\$\$")
        .unwrap()
});
static RE_PDF_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\d+(?:\.\d+)*\.?\s+[A-Z][A-Za-z]").unwrap());

impl SourceSignals {
    /// Signals from comment-stripped, input-expanded LaTeX.
    pub fn from_latex(source: &str) -> Self {
        Self {
            text_chars: source.chars().count(),
            has_sections: RE_TEX_SECTION.is_match(source),
            has_figures: RE_TEX_FIGURE.is_match(source),
            has_equations: RE_TEX_EQUATION.is_match(source),
        }
    }

    /// Signals from extracted PDF text. Figures and equations cannot be
    /// detected from text alone, so only sectioning is checked.
    pub fn from_pdf_text(text: &str) -> Self {
        Self {
            text_chars: text.chars().filter(|c| !c.is_whitespace()).count(),
            has_sections: RE_PDF_SECTION.is_match(text),
            has_figures: false,
            has_equations: false,
        }
    }
}

/// Fidelity ceiling for the source format.
pub fn fidelity(kind: DocumentKind) -> f64 {
    match kind {
        DocumentKind::Latex => 1.0,
        DocumentKind::Pdf => 0.75,
    }
}

/// Score converted markup.
///
/// `issues` must already include the residual-markup issues; every entry
/// counts once toward the penalty regardless of its `count`.
pub fn score(
    markdown: &str,
    signals: &SourceSignals,
    issues: &[ConversionIssue],
    kind: DocumentKind,
) -> QualityReport {
    let markdown_chars = match kind {
        DocumentKind::Latex => markdown.chars().count(),
        DocumentKind::Pdf => markdown.chars().filter(|c| !c.is_whitespace()).count(),
    };
    let length_ratio = if signals.text_chars == 0 {
        if markdown_chars > 0 { 1.0 } else { 0.0 }
    } else {
        (markdown_chars as f64 / signals.text_chars as f64).clamp(0.0, 1.0)
    };

    let residual_score = 1.0 / (1.0 + ISSUE_PENALTY * issues.len() as f64);

    let mut checks = Vec::with_capacity(3);
    if signals.has_sections {
        checks.push(markdown.lines().any(|l| l.starts_with('#')));
    }
    if signals.has_figures {
        checks.push(markdown.contains("!["));
    }
    if signals.has_equations {
        checks.push(markdown.contains("$$"));
    }
    let structure_score = if checks.is_empty() {
        1.0
    } else {
        checks.iter().filter(|passed| **passed).count() as f64 / checks.len() as f64
    };

    let raw = LENGTH_WEIGHT * length_ratio
        + RESIDUAL_WEIGHT * residual_score
        + STRUCTURE_WEIGHT * structure_score;

    QualityReport {
        score: (fidelity(kind) * raw).clamp(0.0, 1.0),
        length_ratio,
        residual_score,
        structure_score,
        residual_commands: residual_commands(markdown).values().sum(),
    }
}

static RE_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\([A-Za-z]+)").unwrap());
static RE_INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[^`\n]*`").unwrap());
static RE_INLINE_MATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$[^$\n]+\$|\\\([^\n]*?\\\)").unwrap());

/// LaTeX commands still visible in prose, by name (`\foo` → count).
pub fn residual_commands(markdown: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    let mut in_code = false;
    let mut in_math = false;

    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_code = !in_code;
            continue;
        }
        if in_code {
            continue;
        }
        if trimmed.starts_with("$$") {
            let single_line = trimmed.len() > 2 && trimmed[2..].contains("$$");
            if !single_line {
                in_math = !in_math;
            }
            continue;
        }
        if in_math {
            continue;
        }

        let without_code = RE_INLINE_CODE.replace_all(line, "");
        let prose = RE_INLINE_MATH.replace_all(&without_code, "");
        for caps in RE_COMMAND.captures_iter(&prose) {
            *counts.entry(format!("\\{}", &caps[1])).or_insert(0) += 1;
        }
    }
    counts
}
