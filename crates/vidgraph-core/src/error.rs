//! Error taxonomy for the ingestion pipeline.
//!
//! Every pipeline stage returns [`IngestError`]. The coordinator never
//! inspects messages; it branches on [`ErrorKind`] alone, which is also what
//! a FAILED job records and what the HTTP layer turns into an error code.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Machine-readable classification of an [`IngestError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SizeExceeded,
    UnsupportedType,
    IoFailure,
    CorruptInput,
    ExtractionTimeout,
    TransactionConflict,
    StoreUnavailable,
    ConstraintViolation,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Transient kinds are retried with backoff; everything else ends the job.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::ExtractionTimeout
                | ErrorKind::TransactionConflict
                | ErrorKind::StoreUnavailable
        )
    }

    /// Input errors: resubmitting the same content will fail the same way.
    pub fn is_input_error(self) -> bool {
        matches!(
            self,
            ErrorKind::SizeExceeded
                | ErrorKind::UnsupportedType
                | ErrorKind::CorruptInput
                | ErrorKind::ConstraintViolation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SizeExceeded => "size_exceeded",
            ErrorKind::UnsupportedType => "unsupported_type",
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::CorruptInput => "corrupt_input",
            ErrorKind::ExtractionTimeout => "extraction_timeout",
            ErrorKind::TransactionConflict => "transaction_conflict",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Inverse of [`as_str`](ErrorKind::as_str). Unknown codes map to `Internal`.
    pub fn parse(code: &str) -> Self {
        match code {
            "size_exceeded" => ErrorKind::SizeExceeded,
            "unsupported_type" => ErrorKind::UnsupportedType,
            "io_failure" => ErrorKind::IoFailure,
            "corrupt_input" => ErrorKind::CorruptInput,
            "extraction_timeout" => ErrorKind::ExtractionTimeout,
            "transaction_conflict" => ErrorKind::TransactionConflict,
            "store_unavailable" => ErrorKind::StoreUnavailable,
            "constraint_violation" => ErrorKind::ConstraintViolation,
            "cancelled" => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("upload exceeds the {limit}-byte limit")]
    SizeExceeded { limit: u64 },

    #[error("unsupported content type: {0}")]
    UnsupportedType(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt input: {0}")]
    CorruptInput(String),

    #[error("extraction did not finish within {0:?}")]
    ExtractionTimeout(Duration),

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("graph store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            IngestError::UnsupportedType(_) => ErrorKind::UnsupportedType,
            IngestError::Io(_) => ErrorKind::IoFailure,
            IngestError::CorruptInput(_) => ErrorKind::CorruptInput,
            IngestError::ExtractionTimeout(_) => ErrorKind::ExtractionTimeout,
            IngestError::TransactionConflict(_) => ErrorKind::TransactionConflict,
            IngestError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            IngestError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            IngestError::Cancelled => ErrorKind::Cancelled,
            IngestError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Shorthand for an I/O failure that has no underlying `io::Error`.
    pub fn io(message: impl Into<String>) -> Self {
        IngestError::Io(std::io::Error::other(message.into()))
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(err: anyhow::Error) -> Self {
        IngestError::Internal(format!("{:#}", err))
    }
}
