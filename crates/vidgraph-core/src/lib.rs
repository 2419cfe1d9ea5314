//! # vidgraph core
//!
//! Runtime-free building blocks of the vidgraph ingestion pipeline: job and
//! staging models, the graph delta value type, the error taxonomy, the retry
//! policy, and the store and extractor traits.
//!
//! This crate has no tokio, sqlx, or filesystem dependencies; the `vidgraph`
//! crate supplies the SQLite stores, the extractors, and the coordinator.

pub mod delta;
pub mod error;
pub mod extract;
pub mod models;
pub mod retry;
pub mod store;

pub use delta::{GraphDelta, NodeSpec, PropertyValue, RelationshipSpec, WriteReport};
pub use error::{ErrorKind, IngestError};
pub use extract::Extractor;
pub use models::{JobStatus, StagedFile, UploadJob, UploadMeta};
pub use retry::RetryPolicy;
