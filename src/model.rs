//! Workflow and job records.
//!
//! The registry is the single owner of these records; everything else sees
//! cloned snapshots. Job state is mutated exclusively through [`JobPatch`],
//! which carries only the fields a transition is allowed to touch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution status of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are absorbing: once reached, no further status
    /// transition is accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Derived status of a workflow, computed from its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Succeeded | WorkflowStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Succeeded => "SUCCEEDED",
            WorkflowStatus::Failed => "FAILED",
        }
    }
}

/// The closed set of job types the dispatch table knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CellSegmentation,
    TissueMask,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CellSegmentation => "cell_segmentation",
            JobType::TissueMask => "tissue_mask",
        }
    }

    /// Parse from the wire spelling. Unknown types are a validation error,
    /// not a deserialization failure, so submissions carry plain strings.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cell_segmentation" => Some(JobType::CellSegmentation),
            "tissue_mask" => Some(JobType::TissueMask),
            _ => None,
        }
    }
}

/// A single unit of executable work within a workflow.
///
/// `workflow_id` and `tenant_id` are denormalized onto the job so completion
/// and progress events can be routed without a registry lookup.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub workflow_id: String,
    pub tenant_id: String,
    pub job_type: JobType,
    pub branch: String,
    pub depends_on: Vec<String>,
    pub image_path: String,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tiles_processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tiles_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The (tenant, branch) pair this job serializes on.
    pub fn branch_key(&self) -> (String, String) {
        (self.tenant_id.clone(), self.branch.clone())
    }
}

/// A named DAG of jobs owned by one tenant.
///
/// The record does not store progress; workflow progress is always computed
/// from the jobs at read time.
#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    /// Job ids in submission order, kept for display only.
    pub job_order: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Typed patch applied to a job through the registry write path.
///
/// Only the fields a scheduler transition may legally touch appear here; the
/// registry enforces the absorbing-terminal and monotone-progress rules when
/// applying one.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub tiles_processed: Option<u64>,
    pub tiles_total: Option<u64>,
    pub error_message: Option<String>,
    pub result_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        JobPatch {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Immutable view of a workflow and its jobs, handed to readers.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    /// Arithmetic mean of the jobs' progress values.
    pub progress: f64,
    pub job_count: usize,
    pub jobs_completed: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub jobs: Vec<Job>,
}

/// Incoming workflow submission, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSubmission {
    pub name: String,
    #[serde(default)]
    pub jobs: Vec<JobSubmission>,
}

/// Incoming job description. `job_type` stays a plain string here so an
/// unknown type surfaces as a validation error rather than a decode failure.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSubmission {
    pub job_id: String,
    pub job_type: String,
    pub image_path: String,
    pub branch: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_wire_spelling_is_upper_case() {
        let json = serde_json::to_string(&JobStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
        let parsed: JobStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(parsed, JobStatus::Cancelled);
    }

    #[test]
    fn job_type_parse_round_trip() {
        assert_eq!(
            JobType::parse("cell_segmentation"),
            Some(JobType::CellSegmentation)
        );
        assert_eq!(JobType::parse("tissue_mask"), Some(JobType::TissueMask));
        assert_eq!(JobType::parse("nuclei_count"), None);
    }
}
