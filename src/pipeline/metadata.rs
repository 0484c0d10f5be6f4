//! Bibliographic metadata, scanned from the document and merged with hints.
//!
//! Extraction is best-effort and infallible: anything not found is left
//! empty.

use crate::output::{PaperHints, PaperMetadata};
use crate::pipeline::latex::{command_args, environment_bodies, to_plain_text};
use crate::pipeline::pdf_text::PdfInfo;
use once_cell::sync::Lazy;
use regex::Regex;

static RE_AUTHOR_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\\(?:thanks|footnote|inst|IEEEauthorrefmark|textsuperscript|affil|email|orcidlink)\s*\{[^{}]*\}|\$\^\{?[^$]*\}?\$|\\footnotemark(?:\[[^\]]*\])?",
    )
    .unwrap()
});

/// Scan a comment-stripped LaTeX source.
pub fn from_latex(identifier: &str, source: &str) -> PaperMetadata {
    let title = command_args(source, "title")
        .into_iter()
        .chain(command_args(source, "icmltitle"))
        .map(|t| to_plain_text(&t))
        .find(|t| !t.is_empty());

    let mut authors: Vec<String> = command_args(source, "author")
        .iter()
        .flat_map(|block| split_authors(block))
        .collect();
    if authors.is_empty() {
        authors = command_args(source, "icmlauthor")
            .iter()
            .map(|a| to_plain_text(a))
            .filter(|a| !a.is_empty())
            .collect();
    }
    authors.dedup();

    let abstract_text = environment_bodies(source, "abstract")
        .into_iter()
        .map(to_plain_text)
        .chain(command_args(source, "abstract").iter().map(|a| to_plain_text(a)))
        .find(|a| !a.is_empty());

    let keyword_blocks: Vec<String> = command_args(source, "keywords")
        .into_iter()
        .chain(environment_bodies(source, "keywords").into_iter().map(str::to_string))
        .chain(environment_bodies(source, "IEEEkeywords").into_iter().map(str::to_string))
        .collect();
    let keywords = keyword_blocks
        .iter()
        .flat_map(|block| split_keywords(block))
        .collect();

    let submitted = command_args(source, "date")
        .first()
        .filter(|d| !d.contains("\\today"))
        .map(|d| to_plain_text(d))
        .filter(|d| !d.is_empty());

    PaperMetadata {
        identifier: identifier.to_string(),
        title,
        authors,
        categories: Vec::new(),
        submitted,
        abstract_text,
        keywords,
    }
}

/// Split one `\author{…}` block on `\and`, keeping each name's first line.
fn split_authors(block: &str) -> Vec<String> {
    let cleaned = RE_AUTHOR_NOISE.replace_all(block, "");
    cleaned
        .split("\\and")
        .filter_map(|chunk| {
            let first_line = chunk.split("\\\\").next().unwrap_or(chunk);
            let name = to_plain_text(first_line);
            let name = name.trim_matches(|c: char| c == ',' || c.is_whitespace());
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

fn split_keywords(block: &str) -> Vec<String> {
    to_plain_text(&block.replace("\\sep", ","))
        .split([',', ';'])
        .map(|k| k.trim().trim_end_matches('.').to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Metadata from a PDF's info dictionary.
pub fn from_pdf_info(identifier: &str, info: &PdfInfo) -> PaperMetadata {
    let authors = info
        .author
        .as_deref()
        .map(|a| {
            a.split([';', ','])
                .flat_map(|part| part.split(" and "))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let keywords = info
        .keywords
        .as_deref()
        .map(|k| {
            k.split([',', ';'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    PaperMetadata {
        identifier: identifier.to_string(),
        title: info.title.clone(),
        authors,
        keywords,
        ..PaperMetadata::default()
    }
}

/// Overlay hints on scanned metadata; a present hint field wins.
pub fn merge(scanned: PaperMetadata, hints: Option<&PaperHints>) -> PaperMetadata {
    let Some(h) = hints else {
        return scanned;
    };
    PaperMetadata {
        identifier: scanned.identifier,
        title: h.title.clone().or(scanned.title),
        authors: if h.authors.is_empty() { scanned.authors } else { h.authors.clone() },
        categories: if h.categories.is_empty() {
            scanned.categories
        } else {
            h.categories.clone()
        },
        submitted: h.published.clone().or(scanned.submitted),
        abstract_text: h.abstract_text.clone().or(scanned.abstract_text),
        keywords: scanned.keywords,
    }
}
