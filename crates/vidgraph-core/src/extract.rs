//! Extraction capability.
//!
//! An [`Extractor`] turns a staged artifact into a [`GraphDelta`]. Concrete
//! extractors live in the `vidgraph` crate and are chosen by configuration;
//! the pipeline only ever sees this trait.

use async_trait::async_trait;

use crate::delta::GraphDelta;
use crate::error::IngestError;
use crate::models::StagedFile;

/// Pluggable analysis step of the pipeline.
///
/// Implementations must not keep mutable state shared between calls and
/// must treat the artifact as read-only: the same extractor instance runs
/// concurrently for different jobs.
///
/// Return [`IngestError::CorruptInput`] when the content cannot be parsed.
/// An empty delta is a valid result.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short identifier used in logs and configuration (e.g. `"container"`).
    fn name(&self) -> &str;

    async fn extract(&self, staged: &StagedFile) -> Result<GraphDelta, IngestError>;
}
