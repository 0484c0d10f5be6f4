//! Built-in PDF → Markdown transformer.
//!
//! Rendered PDFs carry no structure, only positioned glyphs. Text is pulled
//! page by page with `lopdf`, then a handful of layout heuristics recover
//! headings, lists and paragraphs. The same heuristics are applied to
//! `pdftotext` output by the external tool strategy.

use crate::output::{ConversionIssue, IssueKind, IssueLog};
use crate::pipeline::extract::ExtractedDocument;
use lopdf::content::Content;
use lopdf::{Document, Object};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Text and document info read from a PDF.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdfText {
    pub pages: Vec<String>,
    pub info: PdfInfo,
}

impl PdfText {
    /// All page text, pages separated by blank lines.
    pub fn joined(&self) -> String {
        self.pages.join("\n\n")
    }
}

/// Fields of the PDF `Info` dictionary that feed metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdfInfo {
    pub title: Option<String>,
    pub author: Option<String>,
    pub keywords: Option<String>,
}

/// Structured Markdown recovered from page text.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfOutput {
    pub markdown: String,
    pub title: Option<String>,
    pub issues: Vec<ConversionIssue>,
}

/// Load a PDF and extract per-page text plus its info dictionary.
///
/// Blocking; callers run it under `spawn_blocking`.
pub fn read_pdf(bytes: &[u8]) -> Result<PdfText, String> {
    let doc = Document::load_mem(bytes).map_err(|e| format!("cannot parse PDF: {e}"))?;
    let pages = doc.get_pages();
    if pages.is_empty() {
        return Err("PDF has no pages".to_string());
    }

    let mut texts = Vec::with_capacity(pages.len());
    for (&number, &page_id) in &pages {
        let text = match doc.extract_text(&[number]) {
            Ok(t) if !t.trim().is_empty() => t,
            Ok(_) | Err(_) => {
                debug!("page {}: falling back to content stream scan", number);
                scan_content_stream(&doc, page_id).unwrap_or_default()
            }
        };
        texts.push(text);
    }

    Ok(PdfText {
        pages: texts,
        info: read_info(&doc),
    })
}

/// Text-showing operators of one page, decoded as PDFDocEncoding.
fn scan_content_stream(doc: &Document, page_id: lopdf::ObjectId) -> Option<String> {
    let raw = doc.get_page_content(page_id).ok()?;
    let content = Content::decode(&raw).ok()?;
    let mut out = String::new();

    for op in &content.operations {
        match op.operator.as_str() {
            "Tj" | "'" | "\"" => {
                if op.operator != "Tj" {
                    out.push('\n');
                }
                if let Some(Object::String(bytes, _)) = op.operands.last() {
                    out.push_str(&decode_text_string(bytes));
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = op.operands.first() {
                    for item in items {
                        match item {
                            Object::String(bytes, _) => out.push_str(&decode_text_string(bytes)),
                            Object::Integer(n) if *n < -200 => out.push(' '),
                            Object::Real(n) if *n < -200.0 => out.push(' '),
                            _ => {}
                        }
                    }
                }
            }
            "Td" | "TD" | "T*" | "Tm" | "ET" => {
                if !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
    Some(out)
}

fn read_info(doc: &Document) -> PdfInfo {
    let info = match doc.trailer.get(b"Info") {
        Ok(Object::Reference(id)) => doc.get_object(*id).ok(),
        Ok(obj) => Some(obj),
        Err(_) => None,
    };
    let Some(Object::Dictionary(dict)) = info else {
        return PdfInfo::default();
    };

    let field = |key: &[u8]| {
        dict.get(key)
            .ok()
            .and_then(|o| match o {
                Object::String(bytes, _) => Some(decode_text_string(bytes)),
                _ => None,
            })
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    PdfInfo {
        title: field(b"Title"),
        author: field(b"Author"),
        keywords: field(b"Keywords"),
    }
}

/// Decode a PDF text string: UTF-16BE with BOM, else PDFDocEncoding
/// (treated as Latin-1, which matches it for printable ASCII).
pub(crate) fn decode_text_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

// ── Structure recovery ───────────────────────────────────────────────────

const STANDALONE_HEADINGS: [&str; 14] = [
    "abstract", "introduction", "background", "related work", "method", "methods",
    "results", "discussion", "conclusion", "conclusions", "references", "bibliography",
    "acknowledgments", "acknowledgements",
];

static RE_NUMBERED_HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,2}(?:\.\d{1,2}){0,3})\.?\s+([A-Z][^.!?]{1,78})$").unwrap()
});

static RE_BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\u{2022}\u{25E6}\u{25AA}\u{2023}\u{2219}\u{00B7}\u{2013}\*]\s+(.+)$").unwrap());

/// Turn page text into Markdown.
pub fn structure_pages(pages: &[String]) -> PdfOutput {
    let mut issues = IssueLog::default();
    let mut blocks: Vec<String> = Vec::new();
    let mut title = None;

    for (n, page) in pages.iter().enumerate() {
        if page.trim().is_empty() {
            issues.record(IssueKind::EmptyPage, format!("page {}", n + 1));
            continue;
        }

        let mut paragraph: Vec<String> = Vec::new();
        let mut list: Vec<String> = Vec::new();

        for raw in page.lines() {
            let line = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            if line.is_empty() {
                flush(&mut paragraph, &mut list, &mut blocks);
                continue;
            }

            if title.is_none() && blocks.is_empty() && paragraph.is_empty() && is_title_line(&line) {
                blocks.push(format!("# {line}"));
                title = Some(line);
                continue;
            }

            if let Some(heading) = heading_for(&line) {
                flush(&mut paragraph, &mut list, &mut blocks);
                blocks.push(heading);
                continue;
            }

            if let Some(caps) = RE_BULLET.captures(&line) {
                if !paragraph.is_empty() {
                    flush(&mut paragraph, &mut Vec::new(), &mut blocks);
                }
                list.push(caps[1].to_string());
                continue;
            }

            match list.last_mut() {
                Some(item) if paragraph.is_empty() => join_line(item, &line),
                _ => paragraph.push(line),
            }
        }
        flush(&mut paragraph, &mut list, &mut blocks);
    }

    let mut markdown = blocks.join("\n\n");
    markdown.push('\n');
    PdfOutput {
        markdown,
        title,
        issues: issues.into_issues(),
    }
}

fn flush(paragraph: &mut Vec<String>, list: &mut Vec<String>, blocks: &mut Vec<String>) {
    if !list.is_empty() {
        let items: Vec<String> = list.drain(..).map(|item| format!("- {item}")).collect();
        blocks.push(items.join("\n"));
    }
    if !paragraph.is_empty() {
        let mut text = String::new();
        for line in paragraph.drain(..) {
            join_line(&mut text, &line);
        }
        blocks.push(text);
    }
}

/// Append `line`, rejoining words hyphenated across the break.
fn join_line(acc: &mut String, line: &str) {
    if acc.is_empty() {
        acc.push_str(line);
        return;
    }
    let hyphenated = acc.ends_with('-')
        && acc[..acc.len() - 1]
            .chars()
            .next_back()
            .is_some_and(char::is_alphabetic)
        && line.chars().next().is_some_and(char::is_lowercase);
    if hyphenated {
        acc.pop();
    } else {
        acc.push(' ');
    }
    acc.push_str(line);
}

fn heading_for(line: &str) -> Option<String> {
    let bare = line.trim_end_matches(':').trim();
    if STANDALONE_HEADINGS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(bare))
    {
        return Some(format!("## {bare}"));
    }
    let caps = RE_NUMBERED_HEADING.captures(line)?;
    let depth = caps[1].split('.').count();
    let text = caps[2].trim();
    // Numbered lines ending in a digit are usually table rows or references.
    if text.ends_with(|c: char| c.is_ascii_digit()) || text.split_whitespace().count() > 10 {
        return None;
    }
    let hashes = if depth == 1 { "##" } else { "###" };
    Some(format!("{hashes} {} {}", &caps[1], text))
}

fn is_title_line(line: &str) -> bool {
    let len = line.chars().count();
    (4..=160).contains(&len)
        && line.chars().any(char::is_alphabetic)
        && !line.to_ascii_lowercase().starts_with("arxiv:")
        && heading_for(line).is_none()
}

/// Text of a document's primary PDF. The file is parsed on a blocking
/// thread the first time; later calls reuse that result.
pub async fn document_text(doc: &ExtractedDocument) -> Result<Arc<PdfText>, String> {
    if let Some(parsed) = doc.parsed_pdf().get() {
        return parsed.clone();
    }
    let bytes = doc.primary().bytes.clone();
    let parsed = match tokio::task::spawn_blocking(move || read_pdf(&bytes)).await {
        Ok(result) => result.map(Arc::new),
        Err(e) => Err(format!("PDF task failed: {e}")),
    };
    doc.parsed_pdf().get_or_init(|| parsed).clone()
}

/// Structure already-extracted page text with the built-in transformer.
pub fn convert_text(text: &PdfText) -> Result<PdfOutput, String> {
    if text.pages.iter().all(|p| p.trim().is_empty()) {
        return Err("no extractable text in PDF".to_string());
    }
    Ok(structure_pages(&text.pages))
}

/// Convert PDF bytes with the built-in transformer.
pub fn convert_pdf(bytes: &[u8]) -> Result<PdfOutput, String> {
    convert_text(&read_pdf(bytes)?)
}
