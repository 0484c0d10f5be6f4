//! Configuration types for the ingestion-and-conversion pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. The orchestrator reads it once at
//! construction; it is immutable for the lifetime of a run.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default arXiv Atom API endpoint.
pub const DEFAULT_API_URL: &str = "https://export.arxiv.org/api/query";

/// Default host for `/e-print/{id}` and `/pdf/{id}` downloads.
pub const DEFAULT_SOURCE_BASE_URL: &str = "https://arxiv.org";

/// Configuration for the arxiv2md pipeline.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use arxiv2md::{MethodPreference, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .requests_per_second(1.0)
///     .concurrency(4)
///     .method(MethodPreference::BuiltinOnly)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Sustained request rate towards arXiv. Default: 2.0.
    ///
    /// Applies to every outbound request, API and downloads alike, retries
    /// included. At most `max(1, floor(rps))` requests start in any one-second
    /// window regardless of `burst`.
    pub requests_per_second: f64,

    /// Number of requests that may start back-to-back before spacing kicks
    /// in. Default: 2.
    pub burst: u32,

    /// Maximum retry attempts on a transient failure (5xx, timeout, connection
    /// reset). Default: 3.
    ///
    /// Client errors (4xx) are never retried.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds. Doubles after each attempt.
    /// Default: 500.
    pub retry_backoff_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds. Default: 8000.
    pub max_backoff_ms: u64,

    /// Whole-request timeout for every HTTP call, in seconds. Default: 60.
    pub request_timeout_secs: u64,

    /// TCP connect timeout in seconds. Default: 10.
    pub connect_timeout_secs: u64,

    /// `User-Agent` header sent with every request.
    pub user_agent: String,

    /// arXiv Atom query endpoint. Default: [`DEFAULT_API_URL`].
    pub api_url: String,

    /// Base URL for source and PDF downloads. Default: [`DEFAULT_SOURCE_BASE_URL`].
    pub source_base_url: String,

    /// Number of papers processed at once in batch mode. Default: 3.
    ///
    /// Every item still goes through the shared rate limiter, so raising this
    /// mostly overlaps extraction and conversion with downloads.
    pub concurrency: usize,

    /// Maximum number of archive members extracted per paper. Default: 1000.
    ///
    /// Members past the cap are not extracted; a warning is recorded.
    pub max_archive_members: usize,

    /// Maximum total bytes extracted per paper. Default: 200 MiB.
    pub max_extracted_bytes: u64,

    /// Which conversion strategies to use. Default: [`MethodPreference::Auto`].
    pub method: MethodPreference,

    /// Timeout for one external converter invocation, in seconds. Default: 60.
    ///
    /// On timeout the child process is killed and the built-in converter
    /// takes over (unless the method is pinned to the tool).
    pub tool_timeout_secs: u64,

    /// Explicit path to `pandoc`. If None, `PATH` is searched.
    pub pandoc_path: Option<PathBuf>,

    /// Explicit path to `pdftotext`. If None, `PATH` is searched.
    pub pdftotext_path: Option<PathBuf>,

    /// Root of the `source/`, `markdown/` and `metadata/` artifact tree.
    /// Default: `./output`.
    pub output_root: PathBuf,

    /// Write artifacts after each fresh conversion. Default: true.
    pub save_artifacts: bool,

    /// Directory holding cache entries. Default: the platform cache dir
    /// joined with `arxiv2md`.
    pub cache_dir: PathBuf,

    /// Consult and populate the cache. Default: true.
    pub cache_enabled: bool,

    /// Fetch title/authors/categories from the API before converting when the
    /// caller supplied no hints. Default: false.
    pub lookup_metadata: bool,

    /// Optional observer for per-item progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            burst: 2,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 8_000,
            request_timeout_secs: 60,
            connect_timeout_secs: 10,
            user_agent: format!("arxiv2md/{}", env!("CARGO_PKG_VERSION")),
            api_url: DEFAULT_API_URL.to_string(),
            source_base_url: DEFAULT_SOURCE_BASE_URL.to_string(),
            concurrency: 3,
            max_archive_members: 1_000,
            max_extracted_bytes: 200 * 1024 * 1024,
            method: MethodPreference::default(),
            tool_timeout_secs: 60,
            pandoc_path: None,
            pdftotext_path: None,
            output_root: PathBuf::from("./output"),
            save_artifacts: true,
            cache_dir: default_cache_dir(),
            cache_enabled: true,
            lookup_metadata: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("requests_per_second", &self.requests_per_second)
            .field("burst", &self.burst)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("api_url", &self.api_url)
            .field("source_base_url", &self.source_base_url)
            .field("concurrency", &self.concurrency)
            .field("max_archive_members", &self.max_archive_members)
            .field("max_extracted_bytes", &self.max_extracted_bytes)
            .field("method", &self.method)
            .field("tool_timeout_secs", &self.tool_timeout_secs)
            .field("output_root", &self.output_root)
            .field("save_artifacts", &self.save_artifacts)
            .field("cache_dir", &self.cache_dir)
            .field("cache_enabled", &self.cache_enabled)
            .field("lookup_metadata", &self.lookup_metadata)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("arxiv2md"))
        .unwrap_or_else(|| PathBuf::from(".arxiv2md-cache"))
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn requests_per_second(mut self, rps: f64) -> Self {
        self.config.requests_per_second = rps;
        self
    }

    pub fn burst(mut self, n: u32) -> Self {
        self.config.burst = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(10);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs.max(1);
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs.max(1);
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn source_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.source_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_archive_members(mut self, n: usize) -> Self {
        self.config.max_archive_members = n;
        self
    }

    pub fn max_extracted_bytes(mut self, n: u64) -> Self {
        self.config.max_extracted_bytes = n;
        self
    }

    pub fn method(mut self, method: MethodPreference) -> Self {
        self.config.method = method;
        self
    }

    pub fn tool_timeout_secs(mut self, secs: u64) -> Self {
        self.config.tool_timeout_secs = secs.max(1);
        self
    }

    pub fn pandoc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pandoc_path = Some(path.into());
        self
    }

    pub fn pdftotext_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdftotext_path = Some(path.into());
        self
    }

    pub fn output_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output_root = path.into();
        self
    }

    pub fn save_artifacts(mut self, v: bool) -> Self {
        self.config.save_artifacts = v;
        self
    }

    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = path.into();
        self
    }

    pub fn cache_enabled(mut self, v: bool) -> Self {
        self.config.cache_enabled = v;
        self
    }

    pub fn lookup_metadata(mut self, v: bool) -> Self {
        self.config.lookup_metadata = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if !c.requests_per_second.is_finite() || c.requests_per_second <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "requests_per_second must be > 0, got {}",
                c.requests_per_second
            )));
        }
        if c.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_archive_members == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_archive_members must be ≥ 1".into(),
            ));
        }
        if c.max_extracted_bytes == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_extracted_bytes must be ≥ 1".into(),
            ));
        }
        for (name, url) in [("api_url", &c.api_url), ("source_base_url", &c.source_base_url)] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be an http(s) URL, got '{url}'"
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which conversion strategies the converter may use.
///
/// | Preference | Chain |
/// |------------|-------|
/// | `Auto` | external tool, then built-in transformer (default) |
/// | `ToolOnly` | external tool only; fails if it is missing |
/// | `BuiltinOnly` | built-in transformer only; fully deterministic |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodPreference {
    #[default]
    Auto,
    ToolOnly,
    BuiltinOnly,
}

impl MethodPreference {
    /// Version tag stored in cache keys.
    ///
    /// Bump the suffix whenever a strategy's output format changes so stale
    /// entries stop matching.
    pub fn version_tag(&self) -> &'static str {
        match self {
            MethodPreference::Auto => "auto-v1",
            MethodPreference::ToolOnly => "tool-v1",
            MethodPreference::BuiltinOnly => "builtin-v1",
        }
    }
}

impl fmt::Display for MethodPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MethodPreference::Auto => "auto",
            MethodPreference::ToolOnly => "tool",
            MethodPreference::BuiltinOnly => "builtin",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = PipelineConfig::builder().build().unwrap();
        assert_eq!(config.requests_per_second, 2.0);
        assert_eq!(config.burst, 2);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_archive_members, 1000);
        assert_eq!(config.method, MethodPreference::Auto);
        assert!(config.user_agent.starts_with("arxiv2md/"));
    }

    #[test]
    fn builder_clamps() {
        let config = PipelineConfig::builder()
            .concurrency(0)
            .burst(0)
            .max_retries(99)
            .source_base_url("http://127.0.0.1:9999/")
            .build()
            .unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.burst, 1);
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.source_base_url, "http://127.0.0.1:9999");
    }

    #[test]
    fn rejects_bad_rate() {
        let err = PipelineConfig::builder()
            .requests_per_second(0.0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("requests_per_second"));
    }

    #[test]
    fn rejects_non_http_url() {
        let err = PipelineConfig::builder()
            .api_url("ftp://example.org")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("api_url"));
    }

    #[test]
    fn version_tags_differ_per_method() {
        let tags = [
            MethodPreference::Auto.version_tag(),
            MethodPreference::ToolOnly.version_tag(),
            MethodPreference::BuiltinOnly.version_tag(),
        ];
        assert_eq!(tags.len(), tags.iter().collect::<std::collections::HashSet<_>>().len());
    }

    #[test]
    fn debug_hides_callback() {
        let dbg = format!("{:?}", PipelineConfig::default());
        assert!(dbg.contains("progress_callback: None"));
    }
}
