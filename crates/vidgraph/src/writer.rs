//! Graph writer: validates a delta and commits it through the [`GraphStore`].
//!
//! Transaction conflicts are retried here, a few times with short jittered
//! backoff, before being surfaced. `StoreUnavailable` is returned straight
//! away; the coordinator's stage retry decides what to do with it.

use std::sync::Arc;

use vidgraph_core::delta::{GraphDelta, WriteReport};
use vidgraph_core::error::IngestError;
use vidgraph_core::retry::RetryPolicy;
use vidgraph_core::store::GraphStore;

#[derive(Clone)]
pub struct GraphWriter {
    store: Arc<dyn GraphStore>,
    conflict_policy: RetryPolicy,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn GraphStore>, conflict_policy: RetryPolicy) -> Self {
        Self {
            store,
            conflict_policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub async fn apply(&self, delta: &GraphDelta) -> Result<WriteReport, IngestError> {
        delta.validate()?;

        let mut attempt: u32 = 1;
        loop {
            match self.store.apply_delta(delta).await {
                Ok(mut report) => {
                    report.attempts = attempt;
                    tracing::debug!(
                        nodes_created = report.nodes_created,
                        nodes_updated = report.nodes_updated,
                        relationships_created = report.relationships_created,
                        relationships_updated = report.relationships_updated,
                        attempts = attempt,
                        "delta committed"
                    );
                    return Ok(report);
                }
                Err(IngestError::TransactionConflict(msg))
                    if self.conflict_policy.allows_retry_after(attempt) =>
                {
                    attempt += 1;
                    let delay = self
                        .conflict_policy
                        .jittered_delay_before(attempt, rand::random::<f64>());
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %msg, "write conflict, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
