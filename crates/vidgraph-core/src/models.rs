//! Job and staging models.
//!
//! An [`UploadJob`] tracks one submission through the pipeline. A
//! [`StagedFile`] is the content-addressed artifact the job points at.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, IngestError};

/// Pipeline position of an [`UploadJob`].
///
/// ```text
/// RECEIVED → STAGED → EXTRACTING → WRITING → COMPLETE
///     └─────────┴──────────┴──────────┴────→ FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Received,
    Staged,
    Extracting,
    Writing,
    Complete,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Received,
        JobStatus::Staged,
        JobStatus::Extracting,
        JobStatus::Writing,
        JobStatus::Complete,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Received => "RECEIVED",
            JobStatus::Staged => "STAGED",
            JobStatus::Extracting => "EXTRACTING",
            JobStatus::Writing => "WRITING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    /// Whether `self → next` is an edge of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Received, Staged) | (Staged, Extracting) | (Extracting, Writing) => true,
            (Writing, Complete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// States from which `self` may be entered.
    pub fn predecessors(self) -> Vec<JobStatus> {
        JobStatus::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(self))
            .collect()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown job status: {}", s))
    }
}

/// Error recorded on a FAILED job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&IngestError> for JobError {
    fn from(err: &IngestError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Caller-supplied description of an upload.
#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub filename: String,
    pub content_type: String,
    /// Size announced by the client, if any (e.g. `Content-Length`).
    pub declared_size: Option<u64>,
}

/// One submission and its progress through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: String,
    pub source_filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// SHA-256 of the staged bytes; `None` until staging completes.
    pub content_hash: Option<String>,
    pub status: JobStatus,
    /// Attempts made in the current stage.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<JobError>,
}

impl UploadJob {
    /// A fresh job in `RECEIVED` with a new UUID.
    pub fn received(meta: &UploadMeta) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source_filename: meta.filename.clone(),
            content_type: meta.content_type.clone(),
            size_bytes: meta.declared_size.unwrap_or(0),
            content_hash: None,
            status: JobStatus::Received,
            attempts: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Apply a transition in place. Fails if the edge is not allowed.
    pub fn apply(&mut self, to: JobStatus, update: &JobUpdate) -> anyhow::Result<()> {
        if !self.status.can_transition_to(to) {
            anyhow::bail!(
                "invalid transition for job {}: {} -> {}",
                self.id,
                self.status,
                to
            );
        }
        self.status = to;
        if let Some(ref hash) = update.content_hash {
            self.content_hash = Some(hash.clone());
        }
        if let Some(size) = update.size_bytes {
            self.size_bytes = size;
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(ref error) = update.error {
            self.last_error = Some(error.clone());
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Field changes carried by a state transition.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub content_hash: Option<String>,
    pub size_bytes: Option<u64>,
    pub attempts: Option<u32>,
    pub error: Option<JobError>,
}

impl JobUpdate {
    pub fn staged(file: &StagedFile) -> Self {
        Self {
            content_hash: Some(file.content_hash.clone()),
            size_bytes: Some(file.size_bytes),
            attempts: Some(0),
            error: None,
        }
    }

    /// Entering a new stage resets the attempt counter.
    pub fn next_stage() -> Self {
        Self {
            attempts: Some(0),
            ..Default::default()
        }
    }

    pub fn failed(err: &IngestError) -> Self {
        Self {
            error: Some(JobError::from(err)),
            ..Default::default()
        }
    }
}

/// A fully written, content-addressed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub content_hash: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Type declared at upload time; not part of the artifact's identity.
    pub content_type: String,
}
