//! Streaming batch API: emit outcomes as items finish.
//!
//! [`Orchestrator::process_batch`] waits for every slot before returning.
//! [`Orchestrator::process_stream`] yields each [`BatchOutcome`] as soon as
//! its item completes, so callers can write results or update a display
//! progressively. Outcomes arrive in completion order; use
//! [`BatchOutcome::index`] to restore input order.
//!
//! Inputs rejected up front (invalid identifiers, duplicates) are yielded
//! first. After cancellation the stream ends without yielding the items it
//! never started.

use crate::orchestrator::{CancelHandle, Orchestrator};
use crate::output::BatchOutcome;
use futures::stream::BoxStream;

/// A boxed stream of batch outcomes borrowing the orchestrator.
pub type OutcomeStream<'a> = BoxStream<'a, BatchOutcome>;

impl Orchestrator {
    /// Convert many papers, yielding outcomes in completion order.
    pub fn process_stream<S: AsRef<str>>(&self, inputs: &[S], concurrency: usize) -> OutcomeStream<'_> {
        self.process_stream_with_cancel(inputs, concurrency, CancelHandle::new())
    }

    /// [`process_stream`](Self::process_stream) that stops admitting items
    /// once `cancel` fires.
    pub fn process_stream_with_cancel<S: AsRef<str>>(
        &self,
        inputs: &[S],
        concurrency: usize,
        cancel: CancelHandle,
    ) -> OutcomeStream<'_> {
        let inputs = inputs.iter().map(|s| s.as_ref().to_string()).collect();
        self.outcome_stream(inputs, concurrency, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::sample_result;
    use crate::config::PipelineConfig;
    use crate::identifier::ItemIdentifier;
    use crate::output::ItemOutcome;
    use futures::StreamExt;

    async fn cached_orchestrator(dir: &std::path::Path, ids: &[&str]) -> Orchestrator {
        let config = PipelineConfig::builder()
            .cache_dir(dir)
            .save_artifacts(false)
            .build()
            .unwrap();
        let orch = Orchestrator::new(config).await.unwrap();
        for id in ids {
            let parsed = ItemIdentifier::parse(id).unwrap();
            orch.cache()
                .unwrap()
                .put(&orch.cache_key(&parsed), &sample_result(id, "# cached\n"))
                .await
                .unwrap();
        }
        orch
    }

    #[tokio::test]
    async fn yields_one_outcome_per_input() {
        let dir = tempfile::tempdir().unwrap();
        let orch = cached_orchestrator(dir.path(), &["2301.00001", "2301.00002", "2301.00003"]).await;
        let inputs = ["2301.00001", "junk", "2301.00002", "2301.00003"];

        let outcomes: Vec<BatchOutcome> = orch.process_stream(&inputs, 2).collect().await;
        assert_eq!(outcomes.len(), 4);
        // Rejected inputs come first.
        assert_eq!(outcomes[0].index, 1);
        assert!(outcomes[0].outcome.is_failure());

        let mut indices: Vec<usize> = outcomes.iter().map(|o| o.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(outcomes
            .iter()
            .filter(|o| o.index != 1)
            .all(|o| matches!(o.outcome, ItemOutcome::Converted { from_cache: true, .. })));
    }

    #[tokio::test]
    async fn cancelled_stream_ends_early() {
        let dir = tempfile::tempdir().unwrap();
        let orch = cached_orchestrator(dir.path(), &["2301.00001"]).await;
        let cancel = CancelHandle::new();
        cancel.cancel();
        let outcomes: Vec<BatchOutcome> = orch
            .process_stream_with_cancel(&["2301.00001", "2301.00001"], 1, cancel)
            .collect()
            .await;
        // Only the duplicate, decided before any work starts.
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].outcome, ItemOutcome::Skipped { .. }));
    }
}
