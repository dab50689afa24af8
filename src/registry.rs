//! Job registry: the single source of truth for workflow and job records.
//!
//! All mutations are funneled through the scheduler loop, which is the only
//! writer; readers get deep snapshots. The registry enforces the two record
//! invariants that do not depend on scheduling context: terminal statuses are
//! absorbing, and progress never decreases.

use std::collections::HashMap;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::model::{Job, JobPatch, JobStatus, Workflow, WorkflowSnapshot, WorkflowStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("workflow '{0}' already exists")]
    DuplicateWorkflow(String),
    #[error("workflow '{0}' not found")]
    UnknownWorkflow(String),
    #[error("job '{1}' not found in workflow '{0}'")]
    UnknownJob(String, String),
    #[error("job '{1}' in workflow '{0}' is terminal; refusing status change")]
    TerminalTransition(String, String),
}

#[derive(Debug, Default)]
pub struct Registry {
    workflows: HashMap<String, Workflow>,
    /// Global job key is the (workflow_id, job_id) pair.
    jobs: HashMap<(String, String), Job>,
    /// Workflow ids per tenant, in submission order.
    by_tenant: HashMap<String, Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a workflow and its jobs. Fails without writing anything if the
    /// workflow id collides.
    pub fn create_workflow(
        &mut self,
        workflow: Workflow,
        jobs: Vec<Job>,
    ) -> Result<(), RegistryError> {
        if self.workflows.contains_key(&workflow.workflow_id) {
            return Err(RegistryError::DuplicateWorkflow(workflow.workflow_id));
        }
        self.by_tenant
            .entry(workflow.tenant_id.clone())
            .or_default()
            .push(workflow.workflow_id.clone());
        for job in jobs {
            self.jobs
                .insert((workflow.workflow_id.clone(), job.job_id.clone()), job);
        }
        self.workflows
            .insert(workflow.workflow_id.clone(), workflow);
        Ok(())
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<&Workflow> {
        self.workflows.get(workflow_id)
    }

    pub fn job(&self, workflow_id: &str, job_id: &str) -> Option<&Job> {
        self.jobs
            .get(&(workflow_id.to_string(), job_id.to_string()))
    }

    /// Jobs of a workflow in submission order.
    pub fn jobs_of(&self, workflow_id: &str) -> Vec<&Job> {
        let Some(workflow) = self.workflows.get(workflow_id) else {
            return Vec::new();
        };
        workflow
            .job_order
            .iter()
            .filter_map(|job_id| {
                self.jobs
                    .get(&(workflow_id.to_string(), job_id.clone()))
            })
            .collect()
    }

    pub fn tenant_workflow_ids(&self, tenant_id: &str) -> &[String] {
        self.by_tenant
            .get(tenant_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Apply a typed patch to a job.
    ///
    /// Status changes on a terminal job are an internal invariant violation
    /// and rejected with an error. Progress regressions and out-of-range
    /// values are not errors: regressions are dropped, values clamped, and
    /// progress updates racing a terminal transition are ignored.
    pub fn update_job(
        &mut self,
        workflow_id: &str,
        job_id: &str,
        patch: JobPatch,
    ) -> Result<&Job, RegistryError> {
        let key = (workflow_id.to_string(), job_id.to_string());
        let job = self.jobs.get_mut(&key).ok_or_else(|| {
            RegistryError::UnknownJob(workflow_id.to_string(), job_id.to_string())
        })?;

        if let Some(status) = patch.status {
            if job.status.is_terminal() {
                if status != job.status {
                    return Err(RegistryError::TerminalTransition(
                        workflow_id.to_string(),
                        job_id.to_string(),
                    ));
                }
            } else {
                job.status = status;
            }
        }

        if let Some(progress) = patch.progress {
            if job.status.is_terminal() && patch.status.is_none() {
                // Late progress callback racing the terminal transition.
            } else {
                let clamped = progress.clamp(0.0, 1.0);
                if clamped < job.progress {
                    warn!(
                        workflow_id,
                        job_id,
                        have = job.progress,
                        got = clamped,
                        "ignoring regressing progress update"
                    );
                } else {
                    job.progress = clamped;
                }
            }
        }

        if let Some(tiles) = patch.tiles_processed {
            job.tiles_processed = Some(tiles);
        }
        if let Some(tiles) = patch.tiles_total {
            job.tiles_total = Some(tiles);
        }
        if let Some(message) = patch.error_message {
            job.error_message = Some(message);
        }
        if let Some(path) = patch.result_path {
            job.result_path = Some(path);
        }
        if let Some(at) = patch.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = patch.finished_at {
            job.finished_at = Some(at);
        }

        Ok(&self.jobs[&key])
    }

    /// Recompute a workflow's derived status from its jobs. Returns the new
    /// status if it changed.
    pub fn refresh_workflow_status(&mut self, workflow_id: &str) -> Option<WorkflowStatus> {
        let jobs = self.jobs_of(workflow_id);
        if jobs.is_empty() {
            return None;
        }
        let all_terminal = jobs.iter().all(|j| j.status.is_terminal());
        let all_succeeded = jobs.iter().all(|j| j.status == JobStatus::Succeeded);
        let any_started = jobs
            .iter()
            .any(|j| j.status != JobStatus::Pending);

        let next = if all_terminal {
            if all_succeeded {
                WorkflowStatus::Succeeded
            } else {
                // Any FAILED, or a cancellation mix: not a full success.
                WorkflowStatus::Failed
            }
        } else if any_started {
            WorkflowStatus::Running
        } else {
            WorkflowStatus::Pending
        };

        let workflow = self.workflows.get_mut(workflow_id)?;
        if workflow.status == next {
            return None;
        }
        workflow.status = next;
        let now = Utc::now();
        if next == WorkflowStatus::Running && workflow.started_at.is_none() {
            workflow.started_at = Some(now);
        }
        if next.is_terminal() && workflow.finished_at.is_none() {
            workflow.finished_at = Some(now);
        }
        Some(next)
    }

    /// Arithmetic mean of the jobs' progress values.
    pub fn workflow_progress(&self, workflow_id: &str) -> f64 {
        let jobs = self.jobs_of(workflow_id);
        if jobs.is_empty() {
            return 0.0;
        }
        // TODO: weight by tiles_total once executors report it upfront;
        // today it only appears after a job starts, so the mean stays
        // unweighted.
        jobs.iter().map(|j| j.progress).sum::<f64>() / jobs.len() as f64
    }

    /// Deep-immutable view of a workflow for readers.
    pub fn snapshot_workflow(&self, workflow_id: &str) -> Option<WorkflowSnapshot> {
        let workflow = self.workflows.get(workflow_id)?;
        let jobs: Vec<Job> = self
            .jobs_of(workflow_id)
            .into_iter()
            .cloned()
            .collect();
        let jobs_completed = jobs.iter().filter(|j| j.status.is_terminal()).count();
        Some(WorkflowSnapshot {
            workflow_id: workflow.workflow_id.clone(),
            tenant_id: workflow.tenant_id.clone(),
            name: workflow.name.clone(),
            status: workflow.status,
            progress: self.workflow_progress(workflow_id),
            job_count: jobs.len(),
            jobs_completed,
            created_at: workflow.created_at,
            started_at: workflow.started_at,
            finished_at: workflow.finished_at,
            jobs,
        })
    }

    /// True while the tenant has any job counted against the admission cap.
    pub fn tenant_has_live_jobs(&self, tenant_id: &str) -> bool {
        self.tenant_workflow_ids(tenant_id).iter().any(|wf_id| {
            self.jobs_of(wf_id)
                .iter()
                .any(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
        })
    }

    /// Find a job by bare job id within one tenant's workflows.
    ///
    /// The canonical identity is the (workflow_id, job_id) pair; a bare-id
    /// lookup succeeds only when it is unambiguous. No underscore splitting.
    pub fn find_tenant_job(&self, tenant_id: &str, job_id: &str) -> Option<&Job> {
        let mut found: Option<&Job> = None;
        for wf_id in self.tenant_workflow_ids(tenant_id) {
            if let Some(job) = self.job(wf_id, job_id) {
                if found.is_some() {
                    return None; // ambiguous
                }
                found = Some(job);
            }
        }
        found
    }

    /// All jobs currently RUNNING, for the metrics view and self-checks.
    pub fn running_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
    }

    pub fn workflows(&self) -> impl Iterator<Item = &Workflow> {
        self.workflows.values()
    }
}
