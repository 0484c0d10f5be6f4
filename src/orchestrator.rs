//! Per-item pipeline and batch fan-out.
//!
//! One item moves through `Pending → Fetching → Extracting → Converting →
//! Cached`, or straight from `Pending` to `Cached` on a cache hit. Any stage
//! may end in `Failed`; there are no orchestrator-level retries (the remote
//! client retries transient HTTP errors itself).
//!
//! A batch runs at most `concurrency` items at once. Each input position
//! owns exactly one outcome slot, so one item's failure (or panic) never
//! leaks into another's, and the report always has one outcome per input.

use crate::artifacts::ArtifactStore;
use crate::cache::{CacheKey, CacheStore};
use crate::config::PipelineConfig;
use crate::error::{ItemFailure, ItemStage, PipelineError};
use crate::identifier::ItemIdentifier;
use crate::output::{BatchOutcome, BatchReport, ConversionResult, ItemOutcome, PaperHints};
use crate::pipeline::extract::{self, ExtractionLimits};
use crate::pipeline::feed::SearchResponse;
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::remote::{RemoteClient, SearchQuery};
use crate::pipeline::strategy::Converter;
use crate::progress::ProgressCallback;
use futures::future::FutureExt;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ── Cancellation ─────────────────────────────────────────────────────────

/// Cloneable cancellation signal for a running batch.
///
/// Once [`cancel`](Self::cancel) is called no further items are admitted and
/// in-flight items are abandoned; their slots report `Cancelled`.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation has been signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` only returns on `true`.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// A successfully processed item.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub result: ConversionResult,
    pub from_cache: bool,
}

/// Tracks the stage of one in-flight item and forwards transitions to the
/// progress callback.
struct ItemRun<'a> {
    id: &'a ItemIdentifier,
    stage: Mutex<ItemStage>,
    callback: Option<&'a ProgressCallback>,
}

impl<'a> ItemRun<'a> {
    fn new(id: &'a ItemIdentifier, callback: Option<&'a ProgressCallback>) -> Self {
        Self {
            id,
            stage: Mutex::new(ItemStage::Pending),
            callback,
        }
    }

    fn enter(&self, stage: ItemStage) {
        *self.stage.lock().unwrap_or_else(|p| p.into_inner()) = stage;
        debug!("{}: {}", self.id, stage);
        if let Some(cb) = self.callback {
            cb.on_item_stage(self.id.as_str(), stage);
        }
    }

    fn stage(&self) -> ItemStage {
        *self.stage.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Drives papers from identifier to Markdown.
///
/// Built once from a [`PipelineConfig`]; the configuration is immutable
/// afterwards. All methods take `&self`, so one orchestrator can serve many
/// concurrent callers and they share a single rate limiter.
pub struct Orchestrator {
    config: PipelineConfig,
    remote: RemoteClient,
    converter: Converter,
    cache: Option<CacheStore>,
    artifacts: Option<ArtifactStore>,
    limits: ExtractionLimits,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("converter", &self.converter.strategy_names())
            .field("cache", &self.cache.as_ref().map(|c| c.dir()))
            .finish()
    }
}

impl Orchestrator {
    /// Build an orchestrator with the conversion chain implied by
    /// `config.method`.
    ///
    /// # Errors
    /// [`PipelineError::InvalidConfig`] if the HTTP client cannot be built.
    /// An unusable cache directory only disables caching.
    pub async fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let converter = Converter::new(&config);
        Self::with_converter(config, converter).await
    }

    /// Build an orchestrator around a caller-supplied converter.
    pub async fn with_converter(
        config: PipelineConfig,
        converter: Converter,
    ) -> Result<Self, PipelineError> {
        let limiter = Arc::new(RateLimiter::new(config.requests_per_second, config.burst));
        let remote = RemoteClient::new(&config, limiter)?;
        let cache = if config.cache_enabled {
            match CacheStore::open(&config.cache_dir).await {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!("cache disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let artifacts = config
            .save_artifacts
            .then(|| ArtifactStore::new(&config.output_root));
        info!(
            "orchestrator ready: method={}, chain={:?}, cache={}",
            config.method,
            converter.strategy_names(),
            if cache.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            limits: ExtractionLimits::from_config(&config),
            config,
            remote,
            converter,
            cache,
            artifacts,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    pub fn artifacts(&self) -> Option<&ArtifactStore> {
        self.artifacts.as_ref()
    }

    /// Cache key used for `id` under this orchestrator's method.
    pub fn cache_key(&self, id: &ItemIdentifier) -> CacheKey {
        CacheKey::for_method(id, self.config.method)
    }

    /// Search arXiv metadata.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, PipelineError> {
        self.remote.search(query).await
    }

    /// Convert one paper.
    pub async fn process(&self, input: &str) -> Result<ConversionResult, PipelineError> {
        let id = ItemIdentifier::parse(input)?;
        self.process_item(&id, None).await.map(|p| p.result)
    }

    /// Convert one paper using out-of-band metadata (usually a search hit).
    pub async fn process_with_hints(
        &self,
        input: &str,
        hints: &PaperHints,
    ) -> Result<ConversionResult, PipelineError> {
        let id = ItemIdentifier::parse(input)?;
        self.process_item(&id, Some(hints)).await.map(|p| p.result)
    }

    /// Convert one parsed identifier, reporting whether the cache served it.
    pub async fn process_item(
        &self,
        id: &ItemIdentifier,
        hints: Option<&PaperHints>,
    ) -> Result<Processed, PipelineError> {
        let callback = self.config.progress_callback.as_ref();
        if let Some(cb) = callback {
            cb.on_item_start(id.as_str());
        }
        let run = ItemRun::new(id, callback);
        let outcome = self.run_pipeline(&run, hints).await;
        if let Some(cb) = callback {
            match &outcome {
                Ok(p) => cb.on_item_complete(id.as_str(), p.from_cache, p.result.score()),
                Err(e) => cb.on_item_error(id.as_str(), &ItemFailure::new(e, run.stage())),
            }
        }
        outcome
    }

    /// Convert many papers with at most `concurrency` in flight.
    ///
    /// Never fails as a whole: the report has exactly one outcome per input,
    /// in input order.
    pub async fn process_batch<S: AsRef<str>>(&self, inputs: &[S], concurrency: usize) -> BatchReport {
        self.process_batch_with_cancel(inputs, concurrency, &CancelHandle::new())
            .await
    }

    /// [`process_batch`](Self::process_batch) that stops admitting items once
    /// `cancel` fires. Abandoned and never-started items report `Cancelled`.
    pub async fn process_batch_with_cancel<S: AsRef<str>>(
        &self,
        inputs: &[S],
        concurrency: usize,
        cancel: &CancelHandle,
    ) -> BatchReport {
        let started = Instant::now();
        let total = inputs.len();
        let inputs: Vec<String> = inputs.iter().map(|s| s.as_ref().to_string()).collect();
        info!("batch: {} items, concurrency {}", total, concurrency.max(1));
        if let Some(cb) = &self.config.progress_callback {
            cb.on_batch_start(total);
        }

        // ── Step 1: run every admitted item, filling slots by position ──
        let mut slots: Vec<Option<ItemOutcome>> = vec![None; total];
        let mut outcomes = self.outcome_stream(inputs.clone(), concurrency, cancel.clone());
        while let Some(done) = outcomes.next().await {
            slots[done.index] = Some(done.outcome);
        }
        drop(outcomes);

        // ── Step 2: anything never admitted was cut off by cancellation ──
        let outcomes: Vec<BatchOutcome> = slots
            .into_iter()
            .zip(inputs)
            .enumerate()
            .map(|(index, (slot, input))| BatchOutcome {
                index,
                input,
                outcome: slot.unwrap_or(ItemOutcome::Cancelled),
            })
            .collect();

        let report = BatchReport::from_outcomes(outcomes, started.elapsed().as_millis() as u64);
        info!(
            "batch complete: {}/{} converted ({} cached), {} failed, {} skipped, {} cancelled in {}ms",
            report.stats.converted,
            report.stats.total,
            report.stats.from_cache,
            report.stats.failed,
            report.stats.skipped,
            report.stats.cancelled,
            report.stats.duration_ms
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_batch_complete(report.stats.total, report.stats.converted);
        }
        report
    }

    /// Outcomes in completion order. Invalid and duplicate inputs are
    /// reported first, without touching the network.
    pub(crate) fn outcome_stream(
        &self,
        inputs: Vec<String>,
        concurrency: usize,
        cancel: CancelHandle,
    ) -> BoxStream<'_, BatchOutcome> {
        let (immediate, admitted) = self.admit(inputs);

        let stop = cancel.clone();
        let running = stream::iter(admitted)
            .take_until(async move { stop.cancelled().await })
            .map(move |(index, input, id)| {
                let cancel = cancel.clone();
                async move {
                    let outcome = self.run_guarded(&id, &cancel).await;
                    BatchOutcome {
                        index,
                        input,
                        outcome,
                    }
                }
            })
            .buffer_unordered(concurrency.max(1));

        stream::iter(immediate).chain(running).boxed()
    }

    /// Split inputs into outcomes known up front and items to run.
    #[allow(clippy::type_complexity)]
    fn admit(
        &self,
        inputs: Vec<String>,
    ) -> (Vec<BatchOutcome>, Vec<(usize, String, ItemIdentifier)>) {
        let callback = self.config.progress_callback.as_ref();
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        let mut immediate = Vec::new();
        let mut admitted = Vec::new();

        for (index, input) in inputs.into_iter().enumerate() {
            match ItemIdentifier::parse(&input) {
                Err(e) => {
                    let failure = ItemFailure::new(&e, ItemStage::Pending);
                    warn!("#{}: {}", index, e);
                    if let Some(cb) = callback {
                        cb.on_item_error(&input, &failure);
                    }
                    immediate.push(BatchOutcome {
                        index,
                        input,
                        outcome: ItemOutcome::Failed(failure),
                    });
                }
                Ok(id) => match first_seen.get(id.as_str()) {
                    Some(&first) => {
                        debug!("#{}: {} duplicates #{}", index, id, first);
                        immediate.push(BatchOutcome {
                            index,
                            input,
                            outcome: ItemOutcome::Skipped {
                                reason: format!("duplicate of #{first}"),
                            },
                        });
                    }
                    None => {
                        first_seen.insert(id.as_str().to_string(), index);
                        admitted.push((index, input, id));
                    }
                },
            }
        }
        (immediate, admitted)
    }

    /// Run one batch item: race it against cancellation and turn errors and
    /// panics into an outcome.
    async fn run_guarded(&self, id: &ItemIdentifier, cancel: &CancelHandle) -> ItemOutcome {
        let callback = self.config.progress_callback.as_ref();
        if let Some(cb) = callback {
            cb.on_item_start(id.as_str());
        }
        let run = ItemRun::new(id, callback);
        let pipeline = AssertUnwindSafe(self.run_pipeline(&run, None)).catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("{}: cancelled during {}", id, run.stage());
                return ItemOutcome::Cancelled;
            }
            finished = pipeline => match finished {
                Ok(Ok(p)) => ItemOutcome::Converted {
                    result: Box::new(p.result),
                    from_cache: p.from_cache,
                },
                Ok(Err(e)) => {
                    warn!("{}: failed during {}: {}", id, run.stage(), e);
                    ItemOutcome::Failed(ItemFailure::new(&e, run.stage()))
                }
                Err(panic) => {
                    let e = PipelineError::Internal(format!("panic: {}", panic_message(&*panic)));
                    warn!("{}: {}", id, e);
                    ItemOutcome::Failed(ItemFailure::new(&e, run.stage()))
                }
            }
        };

        if let Some(cb) = callback {
            match &outcome {
                ItemOutcome::Converted { result, from_cache } => {
                    cb.on_item_complete(id.as_str(), *from_cache, result.score())
                }
                ItemOutcome::Failed(f) => cb.on_item_error(id.as_str(), f),
                _ => {}
            }
        }
        outcome
    }

    async fn run_pipeline(
        &self,
        run: &ItemRun<'_>,
        hints: Option<&PaperHints>,
    ) -> Result<Processed, PipelineError> {
        let id = run.id;

        // ── Step 1: cache ──
        let key = self.cache_key(id);
        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(result)) => {
                    info!("{}: served from cache", id);
                    run.enter(ItemStage::Cached);
                    return Ok(Processed {
                        result,
                        from_cache: true,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!("{}: cache read failed, treating as miss: {}", id, e),
            }
        }

        // ── Step 2: fetch ──
        run.enter(ItemStage::Fetching);
        let looked_up = match hints {
            None if self.config.lookup_metadata => self.lookup_hints(id).await,
            _ => None,
        };
        let hints = hints.or(looked_up.as_ref());
        let raw = self.remote.fetch_source(id).await?;

        // ── Step 3: extract ──
        run.enter(ItemStage::Extracting);
        let limits = self.limits;
        let doc = tokio::task::spawn_blocking(move || extract::extract(&raw, &limits))
            .await
            .map_err(|e| PipelineError::Internal(format!("extraction task: {e}")))??;
        for warning in doc.warnings() {
            warn!("{}: {}", id, warning);
        }

        // ── Step 4: convert ──
        run.enter(ItemStage::Converting);
        let result = self.converter.convert(&doc, hints).await?;

        // ── Step 5: persist ──
        if let Some(artifacts) = &self.artifacts {
            artifacts.write(&doc, &result).await?;
        }
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(&key, &result).await {
                warn!("{}: result not cached: {}", id, e);
            }
        }
        run.enter(ItemStage::Cached);
        info!(
            "{}: converted via {} (quality {:.2})",
            id,
            result.tool.as_deref().unwrap_or("builtin"),
            result.score()
        );

        Ok(Processed {
            result,
            from_cache: false,
        })
    }

    async fn lookup_hints(&self, id: &ItemIdentifier) -> Option<PaperHints> {
        match self.remote.lookup(id).await {
            Ok(Some(record)) => Some(PaperHints::from(&record)),
            Ok(None) => {
                debug!("{}: no metadata record", id);
                None
            }
            Err(e) => {
                warn!("{}: metadata lookup failed: {}", id, e);
                None
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
