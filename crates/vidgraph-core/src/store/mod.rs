//! Storage abstractions for vidgraph.
//!
//! [`GraphStore`] is the transaction and query surface of the graph
//! database; [`JobStore`] holds the coordinator's job bookkeeping. Both are
//! object-safe (`Arc<dyn …>`) and `Send + Sync` so one instance can be
//! shared by every in-flight job.
//!
//! | Backend | Graph | Jobs |
//! |---------|-------|------|
//! | [`memory`] | [`InMemoryGraphStore`](memory::InMemoryGraphStore) | [`InMemoryJobStore`](memory::InMemoryJobStore) |
//! | SQLite (`vidgraph` crate) | `SqliteGraphStore` | `SqliteJobStore` |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::delta::{GraphDelta, Properties, WriteReport};
use crate::error::IngestError;
use crate::models::{JobStatus, JobUpdate, UploadJob};

/// A node as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub natural_key: String,
    pub label: String,
    pub properties: Properties,
}

/// A relationship as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub from_key: String,
    pub relation_type: String,
    pub to_key: String,
    pub properties: Properties,
}

/// Bounded view of the graph: nodes plus the relationships among them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNode>,
    pub relationships: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub nodes: u64,
    pub relationships: u64,
}

/// Graph database as seen by the pipeline.
///
/// # Write contract
///
/// [`apply_delta`](GraphStore::apply_delta) runs one serializable
/// transaction and either commits the whole delta or nothing:
///
/// 1. every node is upserted by natural key: created if absent, otherwise
///    its properties are merged with the supplied ones winning; a key that
///    already exists under another label is a `ConstraintViolation`;
/// 2. then every relationship is upserted by `(from, type, to)`; an
///    endpoint missing from both the delta and the store is a
///    `ConstraintViolation`.
///
/// Errors are classified: `TransactionConflict` when a concurrent writer
/// got in the way, `StoreUnavailable` for transport failures.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn apply_delta(&self, delta: &GraphDelta) -> Result<WriteReport, IngestError>;

    async fn get_node(&self, natural_key: &str) -> Result<Option<GraphNode>, IngestError>;

    /// Relationships where `natural_key` is either endpoint.
    async fn neighbors(&self, natural_key: &str) -> Result<Vec<GraphEdge>, IngestError>;

    async fn nodes_by_label(&self, label: &str, limit: usize)
        -> Result<Vec<GraphNode>, IngestError>;

    /// Nodes of `label` whose `property` matches `value` (see
    /// [`PropertyValue::matches_text`](crate::delta::PropertyValue::matches_text)),
    /// ordered by key.
    async fn nodes_by_property(
        &self,
        label: &str,
        property: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, IngestError> {
        let mut nodes = self.nodes_by_label(label, usize::MAX).await?;
        nodes.retain(|n| n.properties.get(property).is_some_and(|p| p.matches_text(value)));
        nodes.truncate(limit);
        Ok(nodes)
    }

    /// Up to `limit` nodes (ordered by key) and the relationships among them.
    async fn snapshot(&self, limit: usize) -> Result<GraphSnapshot, IngestError>;

    async fn stats(&self) -> Result<GraphStats, IngestError>;
}

/// Durable or in-memory table of [`UploadJob`]s.
///
/// All state changes go through [`transition`](JobStore::transition), which
/// must check the state-machine edge and write atomically so two callers
/// can never both move a job out of the same state.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &UploadJob) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<UploadJob>>;

    /// Move `id` to `to`, applying `update`. Fails on an invalid edge or unknown id.
    async fn transition(&self, id: &str, to: JobStatus, update: &JobUpdate) -> Result<UploadJob>;

    /// Increment the attempt counter of the current stage; returns the new value.
    async fn record_attempt(&self, id: &str) -> Result<u32>;

    /// Oldest non-terminal job whose staged content has this hash.
    async fn find_active_by_hash(&self, content_hash: &str) -> Result<Option<UploadJob>>;

    /// Every non-terminal job, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<UploadJob>>;

    /// Most recent jobs first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<UploadJob>>;

    /// Drop a record that never started a pipeline.
    async fn remove(&self, id: &str) -> Result<()>;
}
