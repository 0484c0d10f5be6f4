//! Progress-callback trait for per-item pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the orchestrator moves each paper through its stages.
//!
//! # Example
//!
//! ```rust
//! use arxiv2md::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_item_complete(&self, item: &str, from_cache: bool, quality: f64) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{item} done (cached: {from_cache}, quality {quality:.2})");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::{ItemFailure, ItemStage};
use std::sync::Arc;

/// Called by the orchestrator as it processes each identifier.
///
/// Implementations must be `Send + Sync`: in batch mode several items are in
/// flight at once and events for different items interleave. All methods
/// have default no-op implementations so callers only override what they
/// care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before a batch admits its first item.
    fn on_batch_start(&self, total_items: usize) {
        let _ = total_items;
    }

    /// Called when an item leaves `Pending`.
    fn on_item_start(&self, item: &str) {
        let _ = item;
    }

    /// Called on every stage transition (`Fetching`, `Extracting`, …).
    fn on_item_stage(&self, item: &str, stage: ItemStage) {
        let _ = (item, stage);
    }

    /// Called when an item produced a result.
    ///
    /// # Arguments
    /// * `from_cache`: the result came from the cache, nothing was fetched
    /// * `quality`: advisory quality score in [0, 1]
    fn on_item_complete(&self, item: &str, from_cache: bool, quality: f64) {
        let _ = (item, from_cache, quality);
    }

    /// Called when an item failed. The batch carries on.
    fn on_item_error(&self, item: &str, failure: &ItemFailure) {
        let _ = (item, failure);
    }

    /// Called once after every batch slot has been filled.
    ///
    /// # Arguments
    /// * `total_items`: slots in the batch
    /// * `success_count`: items that produced a result
    fn on_batch_complete(&self, total_items: usize, success_count: usize) {
        let _ = (total_items, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
