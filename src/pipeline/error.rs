//! Classified job failures.

use std::fmt;

use schemars::JsonSchema;

use crate::prelude::*;

/// Why a job failed. Every failure that leaves the pipeline carries one of
/// these, so callers can tell "send a different file" from "try again later".
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Not a PDF, empty, wrong content type, or an unsupported language.
    InvalidInput,
    /// Larger than the configured upload ceiling.
    PayloadTooLarge,
    /// The job's deadline passed while it was waiting for a worker.
    QueueTimeout,
    /// The job's deadline passed while OCR was running. The OCR process was
    /// killed.
    Timeout,
    /// The OCR tool rejected the document (corrupt, encrypted, unsupported).
    ToolFailure,
    /// We could not allocate scratch storage for the job.
    ResourceExhausted,
    /// The caller went away before the job finished.
    Cancelled,
    /// Something unexpected went wrong on our side.
    Internal,
}

impl FailureKind {
    /// The serialized name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::PayloadTooLarge => "payload_too_large",
            FailureKind::QueueTimeout => "queue_timeout",
            FailureKind::Timeout => "timeout",
            FailureKind::ToolFailure => "tool_failure",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure with a human-readable explanation.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct PipelineError {
    /// What kind of failure this is.
    pub kind: FailureKind,
    /// Details for humans. May include an excerpt of the OCR tool's stderr.
    pub detail: String,
}

impl PipelineError {
    /// Create a new error.
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, detail)
    }

    pub fn payload_too_large(len: usize, max: usize) -> Self {
        Self::new(
            FailureKind::PayloadTooLarge,
            format!("document is {len} bytes, but the limit is {max} bytes"),
        )
    }

    /// Storage trouble. Keeps the whole `anyhow` chain in the detail.
    pub fn resource_exhausted(err: &anyhow::Error) -> Self {
        Self::new(FailureKind::ResourceExhausted, format!("{:#}", err))
    }

    pub fn internal(err: &anyhow::Error) -> Self {
        Self::new(FailureKind::Internal, format!("{:#}", err))
    }
}
