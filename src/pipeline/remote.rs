//! HTTP access to arXiv: metadata search and source download.
//!
//! Every outbound attempt, retries included, first waits on the shared
//! [`RateLimiter`]. Transient failures (5xx, 429, timeouts, connection
//! errors) are retried with exponential backoff
//! `retry_backoff_ms * 2^(attempt-1)`, capped at `max_backoff_ms`. A
//! `Retry-After` header in seconds replaces the computed delay, under the same
//! cap. Any other 4xx answer is final. Bodies larger than
//! `max_extracted_bytes` are refused without buffering them.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::identifier::ItemIdentifier;
use crate::pipeline::feed::{parse_feed, PaperRecord, SearchResponse};
use crate::pipeline::rate_limit::RateLimiter;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Hard ceiling the query API enforces on one page of results.
pub const MAX_RESULTS_CAP: usize = 2000;

/// Which endpoint produced a [`RawArchive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// The author-submitted source bundle from `/e-print/`.
    Source,
    /// The rendered PDF from `/pdf/`.
    Rendered,
}

/// Raw bytes of a downloaded source bundle or PDF.
#[derive(Debug, Clone)]
pub struct RawArchive {
    pub identifier: ItemIdentifier,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub kind: SourceKind,
    pub url: String,
}

// ── Search query ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Relevance,
    LastUpdatedDate,
    SubmittedDate,
}

impl SortBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortBy::Relevance => "relevance",
            SortBy::LastUpdatedDate => "lastUpdatedDate",
            SortBy::SubmittedDate => "submittedDate",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ascending",
            SortOrder::Descending => "descending",
        }
    }
}

/// A structured search against the arXiv query API.
///
/// ```rust
/// use arxiv2md::SearchQuery;
///
/// let q = SearchQuery::new("diffusion models")
///     .category("cs.LG")
///     .author("Ho")
///     .max_results(20);
/// assert!(q.to_query_string().contains("cat:cs.LG"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub categories: Vec<String>,
    pub authors: Vec<String>,
    pub submitted_from: Option<NaiveDate>,
    pub submitted_to: Option<NaiveDate>,
    pub start: usize,
    pub max_results: usize,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            categories: Vec::new(),
            authors: Vec::new(),
            submitted_from: None,
            submitted_to: None,
            start: 0,
            max_results: 10,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            text: (!text.trim().is_empty()).then_some(text),
            ..Self::default()
        }
    }

    pub fn category(mut self, cat: impl Into<String>) -> Self {
        self.categories.push(cat.into());
        self
    }

    pub fn author(mut self, name: impl Into<String>) -> Self {
        self.authors.push(name.into());
        self
    }

    pub fn submitted_between(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.submitted_from = from;
        self.submitted_to = to;
        self
    }

    pub fn start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    /// Page size, capped at [`MAX_RESULTS_CAP`].
    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = n.clamp(1, MAX_RESULTS_CAP);
        self
    }

    pub fn sort(mut self, by: SortBy, order: SortOrder) -> Self {
        self.sort_by = by;
        self.sort_order = order;
        self
    }

    /// Render the `search_query` parameter.
    pub fn to_query_string(&self) -> String {
        build_search_query(self)
    }
}

/// Join the query's clauses with ` AND `; an empty query matches everything.
pub fn build_search_query(q: &SearchQuery) -> String {
    let mut clauses = Vec::new();

    if let Some(text) = q.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let text = text.replace('"', "");
        clauses.push(format!("(ti:\"{text}\" OR abs:\"{text}\")"));
    }
    if !q.categories.is_empty() {
        let cats: Vec<String> = q.categories.iter().map(|c| format!("cat:{}", c.trim())).collect();
        clauses.push(format!("({})", cats.join(" OR ")));
    }
    if !q.authors.is_empty() {
        let authors: Vec<String> = q
            .authors
            .iter()
            .map(|a| format!("au:\"{}\"", a.trim().replace('"', "")))
            .collect();
        clauses.push(format!("({})", authors.join(" OR ")));
    }
    if q.submitted_from.is_some() || q.submitted_to.is_some() {
        let from = q
            .submitted_from
            .map(|d| format!("{}0000", d.format("%Y%m%d")))
            .unwrap_or_else(|| "*".to_string());
        let to = q
            .submitted_to
            .map(|d| format!("{}2359", d.format("%Y%m%d")))
            .unwrap_or_else(|| "*".to_string());
        clauses.push(format!("submittedDate:[{from} TO {to}]"));
    }

    if clauses.is_empty() {
        "all:*".to_string()
    } else {
        clauses.join(" AND ")
    }
}

// ── Client ───────────────────────────────────────────────────────────────

/// A response that is not retried, body fully read.
#[derive(Debug)]
struct Fetched {
    status: StatusCode,
    content_type: Option<String>,
    body: Vec<u8>,
}

/// Rate-limited arXiv client.
pub struct RemoteClient {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    api_url: String,
    source_base_url: String,
    max_retries: u32,
    retry_backoff_ms: u64,
    max_backoff_ms: u64,
    max_body_bytes: u64,
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("api_url", &self.api_url)
            .field("source_base_url", &self.source_base_url)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl RemoteClient {
    /// Build a client from config. The limiter is shared with every other
    /// client that talks to the same host.
    pub fn new(config: &PipelineConfig, limiter: Arc<RateLimiter>) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            limiter,
            api_url: config.api_url.clone(),
            source_base_url: config.source_base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            max_body_bytes: config.max_extracted_bytes,
        })
    }

    /// Run a metadata search.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, PipelineError> {
        let search_query = build_search_query(query);
        info!("search: {}", search_query);
        let params = [
            ("search_query", search_query),
            ("start", query.start.to_string()),
            ("max_results", query.max_results.min(MAX_RESULTS_CAP).to_string()),
            ("sortBy", query.sort_by.as_str().to_string()),
            ("sortOrder", query.sort_order.as_str().to_string()),
        ];
        self.query_feed(&self.api_url, &params).await
    }

    /// Fetch the metadata record of one paper, if arXiv knows it.
    pub async fn lookup(&self, id: &ItemIdentifier) -> Result<Option<PaperRecord>, PipelineError> {
        let params = [
            ("id_list", id.as_str().to_string()),
            ("max_results", "1".to_string()),
        ];
        let response = self.query_feed(&self.api_url, &params).await?;
        Ok(response
            .records
            .into_iter()
            .find(|r| r.identifier().is_some_and(|rid| rid.base() == id.base())))
    }

    /// Download the source bundle, falling back to the rendered PDF when the
    /// source is withheld.
    pub async fn fetch_source(&self, id: &ItemIdentifier) -> Result<RawArchive, PipelineError> {
        // ── Step 1: e-print ──
        let eprint_url = format!("{}/e-print/{}", self.source_base_url, id);
        let fetched = self.get_with_retry(&eprint_url, &[]).await?;
        if let Some(archive) = self.accept(id, &eprint_url, fetched, SourceKind::Source)? {
            info!("{}: fetched source ({} bytes)", id, archive.bytes.len());
            return Ok(archive);
        }
        warn!("{}: source not available, falling back to PDF", id);

        // ── Step 2: rendered PDF ──
        let pdf_url = format!("{}/pdf/{}", self.source_base_url, id);
        let fetched = self.get_with_retry(&pdf_url, &[]).await?;
        match self.accept(id, &pdf_url, fetched, SourceKind::Rendered)? {
            Some(archive) => {
                info!("{}: fetched PDF ({} bytes)", id, archive.bytes.len());
                Ok(archive)
            }
            None => Err(PipelineError::NotFound {
                identifier: id.to_string(),
            }),
        }
    }

    /// `Ok(None)` means "not available here"; other 4xx are errors.
    fn accept(
        &self,
        id: &ItemIdentifier,
        url: &str,
        fetched: Fetched,
        kind: SourceKind,
    ) -> Result<Option<RawArchive>, PipelineError> {
        let status = fetched.status;
        if status.is_success() {
            if fetched.body.is_empty() {
                debug!("{}: empty body from {}", id, url);
                return Ok(None);
            }
            return Ok(Some(RawArchive {
                identifier: id.clone(),
                bytes: fetched.body,
                content_type: fetched.content_type,
                kind,
                url: url.to_string(),
            }));
        }
        if matches!(
            status,
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE
        ) {
            debug!("{}: {} answered {}", id, url, status);
            return Ok(None);
        }
        Err(PipelineError::RemoteUnavailable {
            url: url.to_string(),
            attempts: 1,
            reason: format!("HTTP {status}"),
        })
    }

    async fn query_feed(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<SearchResponse, PipelineError> {
        let fetched = self.get_with_retry(url, params).await?;
        let text = String::from_utf8_lossy(&fetched.body);
        if fetched.status.is_success() {
            return parse_feed(&text);
        }
        // The API reports bad queries as an Atom error entry with a 400.
        match parse_feed(&text) {
            Err(e) => Err(e),
            Ok(_) => Err(PipelineError::RemoteUnavailable {
                url: url.to_string(),
                attempts: 1,
                reason: format!("HTTP {}", fetched.status),
            }),
        }
    }

    /// GET with limiter admission on every attempt and bounded retries on
    /// transient failure.
    async fn get_with_retry(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<Fetched, PipelineError> {
        let mut last_error = String::new();
        let mut retry_after = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = match retry_after.take() {
                    Some(ms) => self.max_backoff_ms.min(ms),
                    None => self.backoff_ms(attempt),
                };
                warn!(
                    "GET {}: retry {}/{} after {}ms ({})",
                    url, attempt, self.max_retries, backoff, last_error
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            self.limiter.acquire().await;
            debug!("GET {} (attempt {})", url, attempt + 1);

            let response = match self.http.get(url).query(params).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = describe(&e);
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                last_error = format!("HTTP {status}");
                retry_after = retry_after_ms(response.headers());
                continue;
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            match self.read_body(url, response).await {
                Ok(body) => {
                    return Ok(Fetched {
                        status,
                        content_type,
                        body,
                    })
                }
                Err(BodyError::TooLarge(detail)) => {
                    return Err(PipelineError::RemoteFormat { detail })
                }
                Err(BodyError::Http(e)) => last_error = describe(&e),
            }
        }

        Err(PipelineError::RemoteUnavailable {
            url: url.to_string(),
            attempts: self.max_retries + 1,
            reason: last_error,
        })
    }

    /// Buffer a response body chunk by chunk, refusing anything past
    /// `max_body_bytes`.
    async fn read_body(
        &self,
        url: &str,
        mut response: reqwest::Response,
    ) -> Result<Vec<u8>, BodyError> {
        let too_large = |size: u64| {
            BodyError::TooLarge(format!(
                "{url}: body of {size} bytes exceeds the {} byte limit",
                self.max_body_bytes
            ))
        };
        if let Some(declared) = response.content_length() {
            if declared > self.max_body_bytes {
                return Err(too_large(declared));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(BodyError::Http)? {
            let size = (body.len() + chunk.len()) as u64;
            if size > self.max_body_bytes {
                return Err(too_large(size));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64 << (attempt.saturating_sub(1)).min(20);
        self.retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms)
    }
}

enum BodyError {
    TooLarge(String),
    Http(reqwest::Error),
}

/// `Retry-After` in delay-seconds form, as milliseconds.
fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs.saturating_mul(1000))
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}
