//! Worker pool and executor dispatch.
//!
//! The pool runs opaque executors on the blocking thread pool, because jobs
//! are compute-bound and must occupy real cores. It knows nothing about
//! branches or tenants: the scheduler loop gates submission so that at most
//! one job per (tenant, branch) is in flight, and the pool's semaphore is the
//! global `MAX_WORKERS` backstop. Progress and completion flow back to the
//! loop as channel events, never as direct state mutation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use crate::model::{Job, JobType};

/// Terminal outcome of one executor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded { result_path: String },
    Failed { error_message: String },
}

/// Events the pool posts back to the scheduler loop.
#[derive(Debug)]
pub enum WorkerEvent {
    Progress {
        workflow_id: String,
        job_id: String,
        progress: f64,
        tiles_processed: Option<u64>,
        tiles_total: Option<u64>,
    },
    Finished {
        workflow_id: String,
        job_id: String,
        outcome: ExecutionOutcome,
    },
}

/// Progress callback handed to executors. Cloneable and safe to call from
/// any thread the executor spreads work onto; updates are marshalled to the
/// scheduler loop, not applied in place.
#[derive(Clone)]
pub struct ProgressSink {
    workflow_id: String,
    job_id: String,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ProgressSink {
    pub fn update(&self, progress: f64, tiles_processed: Option<u64>, tiles_total: Option<u64>) {
        let _ = self.events_tx.send(WorkerEvent::Progress {
            workflow_id: self.workflow_id.clone(),
            job_id: self.job_id.clone(),
            progress,
            tiles_processed,
            tiles_total,
        });
    }
}

/// An opaque per-job-type executor. Synchronous by contract: the pool wraps
/// each run in `spawn_blocking`, and an executor that wants its own timeout
/// enforces it internally and reports `Failed`.
pub trait JobExecutor: Send + Sync {
    fn execute(&self, job: &Job, progress: &ProgressSink) -> ExecutionOutcome;
}

/// Fixed dispatch table from job type to executor. Built at startup;
/// submission validation already rejected unknown job types, so a miss here
/// is a wiring bug surfaced as a FAILED job rather than a crash.
#[derive(Default)]
pub struct ExecutorRegistry {
    table: HashMap<JobType, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType, executor: Arc<dyn JobExecutor>) {
        self.table.insert(job_type, executor);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobExecutor>> {
        self.table.get(&job_type).cloned()
    }
}

/// Bounded concurrent executor host.
pub struct WorkerPool {
    executors: Arc<ExecutorRegistry>,
    slots: Arc<Semaphore>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerPool {
    pub fn new(
        max_workers: usize,
        executors: Arc<ExecutorRegistry>,
        events_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            executors,
            slots: Arc::new(Semaphore::new(max_workers.max(1))),
            events_tx,
        }
    }

    /// Spawn execution of a dispatched job snapshot. Returns immediately;
    /// the outcome arrives later as a [`WorkerEvent::Finished`].
    pub fn submit(&self, job: Job) {
        let workflow_id = job.workflow_id.clone();
        let job_id = job.job_id.clone();

        let Some(executor) = self.executors.get(job.job_type) else {
            warn!(
                workflow_id,
                job_id,
                job_type = job.job_type.as_str(),
                "no executor registered for job type"
            );
            let _ = self.events_tx.send(WorkerEvent::Finished {
                workflow_id,
                job_id,
                outcome: ExecutionOutcome::Failed {
                    error_message: format!(
                        "no executor registered for job type '{}'",
                        job.job_type.as_str()
                    ),
                },
            });
            return;
        };

        let slots = Arc::clone(&self.slots);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            // The loop already gates on MAX_WORKERS, so this permit is
            // normally free; it is the hard backstop if dispatch miscounts.
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // pool shut down
            };

            let sink = ProgressSink {
                workflow_id: workflow_id.clone(),
                job_id: job_id.clone(),
                events_tx: events_tx.clone(),
            };

            debug!(workflow_id, job_id, "executing job");
            let run = tokio::task::spawn_blocking(move || executor.execute(&job, &sink)).await;

            let outcome = match run {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    warn!(workflow_id, job_id, ?join_error, "executor panicked");
                    ExecutionOutcome::Failed {
                        error_message: format!("executor panicked: {join_error}"),
                    }
                }
            };

            let _ = events_tx.send(WorkerEvent::Finished {
                workflow_id,
                job_id,
                outcome,
            });
        });
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}
