//! arXiv Atom feed parsing.
//!
//! The query API answers with an Atom 1.0 document extended with the
//! `opensearch:` and `arxiv:` namespaces. quick-xml's serde support matches
//! elements by local name, so `opensearch:totalResults` deserialises into
//! `total_results` and `arxiv:primary_category` into `primary_category`.

use crate::error::PipelineError;
use crate::identifier::ItemIdentifier;
use crate::output::PaperHints;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(rename = "totalResults", default)]
    total_results: Option<u64>,
    #[serde(rename = "startIndex", default)]
    start_index: Option<u64>,
    #[serde(rename = "itemsPerPage", default)]
    items_per_page: Option<u64>,
    #[serde(rename = "entry", default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    published: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(rename = "author", default)]
    authors: Vec<Author>,
    #[serde(rename = "category", default)]
    categories: Vec<Category>,
    #[serde(default)]
    primary_category: Option<Category>,
    #[serde(rename = "link", default)]
    links: Vec<Link>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    journal_ref: Option<String>,
    #[serde(default)]
    doi: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Author {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Category {
    #[serde(rename = "@term")]
    term: String,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(rename = "@href")]
    href: String,
    #[serde(rename = "@rel", default)]
    rel: Option<String>,
    #[serde(rename = "@title", default)]
    title: Option<String>,
}

/// One paper's metadata as returned by the arXiv query API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    /// Bare identifier taken from the entry URL (version included).
    pub id: String,
    pub title: String,
    pub summary: String,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub primary_category: Option<String>,
    pub published: Option<String>,
    pub updated: Option<String>,
    pub abs_url: Option<String>,
    pub pdf_url: Option<String>,
    pub comment: Option<String>,
    pub journal_ref: Option<String>,
    pub doi: Option<String>,
}

impl PaperRecord {
    /// The record's identifier, when it parses.
    pub fn identifier(&self) -> Option<ItemIdentifier> {
        ItemIdentifier::parse(&self.id).ok()
    }
}

impl From<&PaperRecord> for PaperHints {
    fn from(record: &PaperRecord) -> Self {
        PaperHints {
            title: non_empty(&record.title),
            authors: record.authors.clone(),
            categories: record.categories.clone(),
            published: record.published.clone(),
            abstract_text: non_empty(&record.summary),
        }
    }
}

/// Parsed page of search results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total_results: u64,
    pub start_index: u64,
    pub items_per_page: u64,
    pub records: Vec<PaperRecord>,
}

/// Parse an Atom response body.
///
/// Returns [`PipelineError::RemoteFormat`] for malformed XML and for arXiv's
/// in-band error entries (`…/api/errors#…`).
pub fn parse_feed(xml: &str) -> Result<SearchResponse, PipelineError> {
    let feed: Feed = quick_xml::de::from_str(xml).map_err(|e| PipelineError::RemoteFormat {
        detail: format!("invalid Atom feed: {e}"),
    })?;

    if let Some(err) = feed.entries.iter().find(|e| e.id.contains("/api/errors")) {
        return Err(PipelineError::RemoteFormat {
            detail: format!("arXiv API error: {}", collapse_whitespace(&err.summary)),
        });
    }

    let records: Vec<PaperRecord> = feed.entries.into_iter().map(into_record).collect();
    Ok(SearchResponse {
        total_results: feed.total_results.unwrap_or(records.len() as u64),
        start_index: feed.start_index.unwrap_or(0),
        items_per_page: feed.items_per_page.unwrap_or(records.len() as u64),
        records,
    })
}

fn into_record(entry: Entry) -> PaperRecord {
    let raw_id = entry
        .id
        .trim()
        .split("/abs/")
        .nth(1)
        .unwrap_or_else(|| entry.id.trim().rsplit('/').next().unwrap_or_default())
        .to_string();
    let id = crate::identifier::normalize(&raw_id).unwrap_or(raw_id);

    let abs_url = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("alternate"))
        .map(|l| l.href.clone());
    let pdf_url = entry
        .links
        .iter()
        .find(|l| l.title.as_deref() == Some("pdf"))
        .map(|l| l.href.clone());

    PaperRecord {
        id,
        title: collapse_whitespace(&entry.title),
        summary: collapse_whitespace(&entry.summary),
        authors: entry
            .authors
            .into_iter()
            .map(|a| collapse_whitespace(&a.name))
            .collect(),
        categories: entry.categories.into_iter().map(|c| c.term).collect(),
        primary_category: entry.primary_category.map(|c| c.term),
        published: entry.published.map(|s| s.trim().to_string()),
        updated: entry.updated.map(|s| s.trim().to_string()),
        abs_url,
        pdf_url,
        comment: entry.comment.map(|s| collapse_whitespace(&s)),
        journal_ref: entry.journal_ref.map(|s| collapse_whitespace(&s)),
        doi: entry.doi.map(|s| s.trim().to_string()),
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}
