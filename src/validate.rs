//! Submission validation.
//!
//! Every rule gets its own check so the returned error names exactly what is
//! wrong. Nothing here touches the filesystem: an unreadable image path is
//! the executor's problem, not the scheduler's.

use std::collections::{HashMap, HashSet};

use crate::error::ValidationError;
use crate::model::{JobSubmission, JobType, WorkflowSubmission};

/// Validate a workflow submission against the admission rules.
///
/// Returns the resolved job types in submission order so the caller does not
/// re-parse the strings it just validated.
pub fn validate_submission(
    tenant_id: &str,
    submission: &WorkflowSubmission,
) -> Result<Vec<JobType>, ValidationError> {
    if tenant_id.trim().is_empty() {
        return Err(ValidationError::EmptyTenant);
    }
    if submission.jobs.is_empty() {
        return Err(ValidationError::NoJobs);
    }

    validate_unique_job_ids(&submission.jobs)?;
    validate_dependencies_exist(&submission.jobs)?;
    validate_acyclic(&submission.jobs)?;

    let mut job_types = Vec::with_capacity(submission.jobs.len());
    for job in &submission.jobs {
        let job_type =
            JobType::parse(&job.job_type).ok_or_else(|| ValidationError::UnknownJobType {
                job_id: job.job_id.clone(),
                job_type: job.job_type.clone(),
            })?;
        if job.branch.trim().is_empty() {
            return Err(ValidationError::EmptyBranch(job.job_id.clone()));
        }
        if job.image_path.trim().is_empty() {
            return Err(ValidationError::EmptyImagePath(job.job_id.clone()));
        }
        job_types.push(job_type);
    }

    Ok(job_types)
}

fn validate_unique_job_ids(jobs: &[JobSubmission]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for job in jobs {
        if !seen.insert(job.job_id.as_str()) {
            return Err(ValidationError::DuplicateJobId(job.job_id.clone()));
        }
    }
    Ok(())
}

fn validate_dependencies_exist(jobs: &[JobSubmission]) -> Result<(), ValidationError> {
    let ids: HashSet<&str> = jobs.iter().map(|j| j.job_id.as_str()).collect();
    for job in jobs {
        for dep in &job.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    job_id: job.job_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Iterative DFS with a three-color marking. A job found on the current
/// stack twice closes a cycle.
fn validate_acyclic(jobs: &[JobSubmission]) -> Result<(), ValidationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let deps: HashMap<&str, &[String]> = jobs
        .iter()
        .map(|j| (j.job_id.as_str(), j.depends_on.as_slice()))
        .collect();
    let mut marks: HashMap<&str, Mark> = jobs
        .iter()
        .map(|j| (j.job_id.as_str(), Mark::Unvisited))
        .collect();

    for root in jobs {
        if marks[root.job_id.as_str()] != Mark::Unvisited {
            continue;
        }
        // Stack entries are (job, next dependency index to explore).
        let mut stack: Vec<(&str, usize)> = vec![(root.job_id.as_str(), 0)];
        marks.insert(root.job_id.as_str(), Mark::InProgress);

        while let Some((job_id, dep_idx)) = stack.pop() {
            let job_deps = deps[job_id];
            if dep_idx < job_deps.len() {
                stack.push((job_id, dep_idx + 1));
                let dep = job_deps[dep_idx].as_str();
                match marks[dep] {
                    Mark::InProgress => {
                        return Err(ValidationError::Cycle(dep.to_string()));
                    }
                    Mark::Unvisited => {
                        marks.insert(dep, Mark::InProgress);
                        stack.push((dep, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks.insert(job_id, Mark::Done);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, branch: &str, deps: &[&str]) -> JobSubmission {
        JobSubmission {
            job_id: id.to_string(),
            job_type: "cell_segmentation".to_string(),
            image_path: format!("/slides/{id}.svs"),
            branch: branch.to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn submission(jobs: Vec<JobSubmission>) -> WorkflowSubmission {
        WorkflowSubmission {
            name: "slide run".to_string(),
            jobs,
        }
    }

    #[test]
    fn accepts_a_linear_chain() {
        let s = submission(vec![
            job("a", "b1", &[]),
            job("b", "b1", &["a"]),
            job("c", "b1", &["b"]),
        ]);
        let types = validate_submission("t1", &s).unwrap();
        assert_eq!(types.len(), 3);
    }

    #[test]
    fn rejects_empty_tenant() {
        let s = submission(vec![job("a", "b1", &[])]);
        assert_eq!(
            validate_submission("  ", &s),
            Err(ValidationError::EmptyTenant)
        );
    }

    #[test]
    fn rejects_empty_workflow() {
        let s = submission(vec![]);
        assert_eq!(validate_submission("t1", &s), Err(ValidationError::NoJobs));
    }

    #[test]
    fn rejects_duplicate_job_ids() {
        let s = submission(vec![job("a", "b1", &[]), job("a", "b2", &[])]);
        assert_eq!(
            validate_submission("t1", &s),
            Err(ValidationError::DuplicateJobId("a".to_string()))
        );
    }

    #[test]
    fn rejects_unknown_dependency() {
        let s = submission(vec![job("a", "b1", &["ghost"])]);
        assert!(matches!(
            validate_submission("t1", &s),
            Err(ValidationError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn rejects_two_node_cycle() {
        let s = submission(vec![job("a", "b1", &["b"]), job("b", "b1", &["a"])]);
        assert!(matches!(
            validate_submission("t1", &s),
            Err(ValidationError::Cycle(_))
        ));
    }

    #[test]
    fn rejects_self_cycle() {
        let s = submission(vec![job("a", "b1", &["a"])]);
        assert!(matches!(
            validate_submission("t1", &s),
            Err(ValidationError::Cycle(_))
        ));
    }

    #[test]
    fn accepts_diamond() {
        let s = submission(vec![
            job("a", "b1", &[]),
            job("b", "b1", &["a"]),
            job("c", "b2", &["a"]),
            job("d", "b1", &["b", "c"]),
        ]);
        assert!(validate_submission("t1", &s).is_ok());
    }

    #[test]
    fn rejects_unknown_job_type() {
        let mut bad = job("a", "b1", &[]);
        bad.job_type = "stain_normalization".to_string();
        let s = submission(vec![bad]);
        assert!(matches!(
            validate_submission("t1", &s),
            Err(ValidationError::UnknownJobType { .. })
        ));
    }

    #[test]
    fn rejects_empty_branch_and_image_path() {
        let s = submission(vec![job("a", " ", &[])]);
        assert_eq!(
            validate_submission("t1", &s),
            Err(ValidationError::EmptyBranch("a".to_string()))
        );

        let mut no_image = job("a", "b1", &[]);
        no_image.image_path = String::new();
        let s = submission(vec![no_image]);
        assert_eq!(
            validate_submission("t1", &s),
            Err(ValidationError::EmptyImagePath("a".to_string()))
        );
    }
}
