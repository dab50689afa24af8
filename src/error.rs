//! Control-plane error kinds.

use thiserror::Error;

/// Violations of the submission rules. Each variant names the offending
/// element so the caller can fix the submission without guessing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("tenant_id must be non-empty")]
    EmptyTenant,
    #[error("workflow must contain at least one job")]
    NoJobs,
    #[error("duplicate job_id '{0}' within workflow")]
    DuplicateJobId(String),
    #[error("job '{job_id}' depends on unknown job '{dependency}'")]
    UnknownDependency { job_id: String, dependency: String },
    #[error("dependency cycle involving job '{0}'")]
    Cycle(String),
    #[error("job '{job_id}' has unknown job_type '{job_type}'")]
    UnknownJobType { job_id: String, job_type: String },
    #[error("job '{0}' has an empty branch")]
    EmptyBranch(String),
    #[error("job '{0}' has an empty image_path")]
    EmptyImagePath(String),
}

/// Errors surfaced by the control API. Executor failures never appear here;
/// they are reported as FAILED job status and observed by polling or
/// subscribing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("X-User-ID header is required")]
    TenantMissing,
    #[error("validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
    #[error("active user limit reached, try again later")]
    TenantRejected,
    #[error("workflow_id '{0}' already exists")]
    DuplicateWorkflowId(String),
    #[error("not found")]
    NotFound,
    #[error("job '{0}' has already started and cannot be cancelled")]
    NotCancellable(String),
    #[error("scheduler is shutting down")]
    Unavailable,
}

impl ApiError {
    /// Stable machine-readable kind for the wire, independent of the
    /// human-readable message.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::TenantMissing => "tenant_missing",
            ApiError::ValidationFailed(_) => "validation_failed",
            ApiError::TenantRejected => "tenant_rejected",
            ApiError::DuplicateWorkflowId(_) => "duplicate_workflow_id",
            ApiError::NotFound => "not_found",
            ApiError::NotCancellable(_) => "not_cancellable",
            ApiError::Unavailable => "unavailable",
        }
    }
}
