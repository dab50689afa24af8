//! Scheduler engine: the single writer over registry, branch queues, and
//! dependency resolver.
//!
//! The loop task drains two input sources, control-plane commands
//! (submit/cancel, replied over oneshot channels) and worker callbacks
//! (progress/completion), applying one mutation per event followed by an
//! idempotent dispatch pass. Reads are served concurrently from the shared
//! state under a read lock; the loop is the only writer. Event publishes are
//! collected during the mutation and flushed after the write lock is
//! released, so the bus never runs under the lock.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::branch_queue::{BranchKey, BranchQueues};
use crate::config::Config;
use crate::error::ApiError;
use crate::events::{EventBus, EventStream, ProgressEvent};
use crate::metrics::{
    ActiveUsers, ActiveWorkers, DashboardSnapshot, HealthSnapshot, JobLatency, LatencyWindow,
    QueueDepth, SystemHealth,
};
use crate::model::{
    Job, JobPatch, JobStatus, Workflow, WorkflowSnapshot, WorkflowStatus, WorkflowSubmission,
};
use crate::registry::Registry;
use crate::resolver::DependencyResolver;
use crate::validate::validate_submission;
use crate::worker::{ExecutionOutcome, ExecutorRegistry, WorkerEvent, WorkerPool};

/// Control-plane commands entering the loop.
enum Command {
    Submit {
        tenant_id: String,
        submission: WorkflowSubmission,
        reply: oneshot::Sender<Result<WorkflowSnapshot, ApiError>>,
    },
    CancelJob {
        tenant_id: String,
        job_id: String,
        reply: oneshot::Sender<Result<Job, ApiError>>,
    },
}

/// Mutable scheduler state shared between the loop (writer) and readers.
struct EngineState {
    registry: Registry,
    admission: AdmissionController,
    queues: BranchQueues,
    resolver: DependencyResolver,
    latency: LatencyWindow,
    /// Jobs currently RUNNING, maintained by the loop alongside the registry.
    running: usize,
    /// Workflows that hit an internal invariant violation; no further
    /// transitions are applied to them.
    poisoned: HashSet<String>,
    healthy: bool,
    max_workers: usize,
}

/// Events queued during a mutation and published after the lock drops.
type PendingEvents = Vec<(String, ProgressEvent)>;

/// Handle to a running scheduler engine. Cheap to clone; transport handlers
/// hold one.
#[derive(Clone)]
pub struct Engine {
    state: Arc<RwLock<EngineState>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    bus: Arc<EventBus>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Construct the engine and spawn its loop task.
    pub fn start(config: &Config, executors: ExecutorRegistry) -> (Engine, JoinHandle<()>) {
        let state = Arc::new(RwLock::new(EngineState {
            registry: Registry::new(),
            admission: AdmissionController::new(config.max_active_users),
            queues: BranchQueues::new(),
            resolver: DependencyResolver::new(),
            latency: LatencyWindow::new(config.latency_window),
            running: 0,
            poisoned: HashSet::new(),
            healthy: true,
            max_workers: config.max_workers,
        }));
        let bus = Arc::new(EventBus::new(config.event_mailbox_size));

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = WorkerPool::new(config.max_workers, Arc::new(executors), worker_tx);

        let task = EngineTask {
            state: Arc::clone(&state),
            bus: Arc::clone(&bus),
            pool,
            commands_rx,
            worker_rx,
            shutdown_rx,
        };
        let handle = tokio::spawn(task.run());

        info!(
            max_workers = config.max_workers,
            max_active_users = config.max_active_users,
            "scheduler engine started"
        );

        (
            Engine {
                state,
                commands_tx,
                bus,
                shutdown_tx,
            },
            handle,
        )
    }

    /// Validate and submit a workflow. Nothing is written on any error.
    pub async fn submit_workflow(
        &self,
        tenant_id: &str,
        submission: WorkflowSubmission,
    ) -> Result<WorkflowSnapshot, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.commands_tx
            .send(Command::Submit {
                tenant_id: tenant_id.to_string(),
                submission,
                reply,
            })
            .map_err(|_| ApiError::Unavailable)?;
        rx.await.map_err(|_| ApiError::Unavailable)?
    }

    /// Cancel a PENDING job by bare job id (unambiguous within the tenant).
    pub async fn cancel_job(&self, tenant_id: &str, job_id: &str) -> Result<Job, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.commands_tx
            .send(Command::CancelJob {
                tenant_id: tenant_id.to_string(),
                job_id: job_id.to_string(),
                reply,
            })
            .map_err(|_| ApiError::Unavailable)?;
        rx.await.map_err(|_| ApiError::Unavailable)?
    }

    /// All workflows of one tenant, newest last. Isolation is absolute: the
    /// result never contains another tenant's workflows.
    pub fn list_workflows(&self, tenant_id: &str) -> Vec<WorkflowSnapshot> {
        let state = self.state.read().expect("engine state poisoned");
        state
            .registry
            .tenant_workflow_ids(tenant_id)
            .iter()
            .filter_map(|wf_id| state.registry.snapshot_workflow(wf_id))
            .collect()
    }

    pub fn get_workflow(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<WorkflowSnapshot, ApiError> {
        let state = self.state.read().expect("engine state poisoned");
        state
            .registry
            .snapshot_workflow(workflow_id)
            .filter(|snapshot| snapshot.tenant_id == tenant_id)
            .ok_or(ApiError::NotFound)
    }

    pub fn get_job(&self, tenant_id: &str, job_id: &str) -> Result<Job, ApiError> {
        let state = self.state.read().expect("engine state poisoned");
        state
            .registry
            .find_tenant_job(tenant_id, job_id)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    /// Subscribe to the tenant's progress events.
    pub fn subscribe(&self, tenant_id: &str) -> EventStream {
        self.bus.subscribe(tenant_id)
    }

    /// Point-in-time dashboard view, including the structural self-check.
    pub fn dashboard(&self) -> DashboardSnapshot {
        let state = self.state.read().expect("engine state poisoned");

        let mut by_tenant_running = std::collections::BTreeMap::new();
        for job in state.registry.running_jobs() {
            *by_tenant_running.entry(job.tenant_id.clone()).or_insert(0) += 1;
        }

        let mut by_tenant_depth = std::collections::BTreeMap::new();
        let mut by_branch = std::collections::BTreeMap::new();
        for (tenant, branch, depth) in state.queues.depths() {
            *by_tenant_depth.entry(tenant.to_string()).or_insert(0) += depth;
            by_branch
                .entry(branch.to_string())
                .or_insert_with(std::collections::BTreeMap::new)
                .insert(tenant.to_string(), depth);
        }

        let violations = verify_invariants(&state);
        let healthy = state.healthy && violations.is_empty();
        if !violations.is_empty() {
            warn!(?violations, "structural invariant check failed");
        }

        DashboardSnapshot {
            active_workers: ActiveWorkers {
                global: state.running,
                by_tenant: by_tenant_running,
                max: state.max_workers,
            },
            queue_depth: QueueDepth {
                total: state.queues.total_depth(),
                by_tenant: by_tenant_depth,
                by_branch,
            },
            job_latency: JobLatency::from_window(&state.latency),
            active_users: ActiveUsers {
                count: state.admission.active_count(),
                max: state.admission.limit(),
            },
            system_health: SystemHealth {
                status: if healthy { "healthy" } else { "unhealthy" },
                running_jobs: state.running,
                queue_depth: state.queues.total_depth(),
            },
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        let state = self.state.read().expect("engine state poisoned");
        HealthSnapshot {
            status: if state.healthy { "healthy" } else { "unhealthy" },
            active_users: state.admission.active_count(),
            running_jobs: state.running,
            queue_depth: state.queues.total_depth(),
        }
    }

    /// Signal the loop to stop. In-flight executors finish on the blocking
    /// pool but no further transitions are applied.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The loop task. Owns the receivers and the worker pool.
struct EngineTask {
    state: Arc<RwLock<EngineState>>,
    bus: Arc<EventBus>,
    pool: WorkerPool,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EngineTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command);
                }
                Some(event) = self.worker_rx.recv() => {
                    self.handle_worker_event(event);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                tenant_id,
                submission,
                reply,
            } => {
                let result = self.handle_submit(&tenant_id, submission);
                let _ = reply.send(result);
            }
            Command::CancelJob {
                tenant_id,
                job_id,
                reply,
            } => {
                let result = self.handle_cancel(&tenant_id, &job_id);
                let _ = reply.send(result);
            }
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Progress {
                workflow_id,
                job_id,
                progress,
                tiles_processed,
                tiles_total,
            } => self.handle_progress(&workflow_id, &job_id, progress, tiles_processed, tiles_total),
            WorkerEvent::Finished {
                workflow_id,
                job_id,
                outcome,
            } => self.handle_finished(&workflow_id, &job_id, outcome),
        }
    }

    fn handle_submit(
        &mut self,
        tenant_id: &str,
        submission: WorkflowSubmission,
    ) -> Result<WorkflowSnapshot, ApiError> {
        let job_types = validate_submission(tenant_id, &submission)?;

        let mut state = self.state.write().expect("engine state poisoned");

        let was_active = state.admission.is_active(tenant_id);
        if state.admission.try_admit(tenant_id) == AdmissionDecision::Rejected {
            return Err(ApiError::TenantRejected);
        }

        let workflow_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let workflow = Workflow {
            workflow_id: workflow_id.clone(),
            tenant_id: tenant_id.to_string(),
            name: submission.name.clone(),
            status: WorkflowStatus::Pending,
            job_order: submission.jobs.iter().map(|j| j.job_id.clone()).collect(),
            created_at: now,
            started_at: None,
            finished_at: None,
        };
        let jobs: Vec<Job> = submission
            .jobs
            .iter()
            .zip(job_types)
            .map(|(spec, job_type)| Job {
                job_id: spec.job_id.clone(),
                workflow_id: workflow_id.clone(),
                tenant_id: tenant_id.to_string(),
                job_type,
                branch: spec.branch.clone(),
                depends_on: spec.depends_on.clone(),
                image_path: spec.image_path.clone(),
                status: JobStatus::Pending,
                progress: 0.0,
                tiles_processed: None,
                tiles_total: None,
                error_message: None,
                result_path: None,
                created_at: now,
                started_at: None,
                finished_at: None,
            })
            .collect();

        if state.registry.create_workflow(workflow, jobs).is_err() {
            // Roll back a slot that was taken for this submission only.
            if !was_active {
                state.admission.release(tenant_id);
            }
            return Err(ApiError::DuplicateWorkflowId(workflow_id));
        }

        let ready = {
            let specs: Vec<(&str, &[String])> = submission
                .jobs
                .iter()
                .map(|j| (j.job_id.as_str(), j.depends_on.as_slice()))
                .collect();
            state.resolver.register_workflow(&workflow_id, specs)
        };
        for job_id in ready {
            let Some(job) = state.registry.job(&workflow_id, &job_id) else {
                continue;
            };
            let key = job.branch_key();
            state
                .queues
                .enqueue(key, (workflow_id.clone(), job_id.clone()));
        }

        debug!(
            tenant_id,
            workflow_id,
            jobs = submission.jobs.len(),
            "workflow submitted"
        );

        let (events, to_submit) = dispatch_pass(&mut state);
        let snapshot = state
            .registry
            .snapshot_workflow(&workflow_id)
            .ok_or(ApiError::NotFound)?;
        drop(state);

        self.flush(events, to_submit);
        Ok(snapshot)
    }

    fn handle_cancel(&mut self, tenant_id: &str, job_id: &str) -> Result<Job, ApiError> {
        let mut state = self.state.write().expect("engine state poisoned");

        let (workflow_id, branch_key) = {
            let job = state
                .registry
                .find_tenant_job(tenant_id, job_id)
                .ok_or(ApiError::NotFound)?;
            if job.status != JobStatus::Pending {
                return Err(ApiError::NotCancellable(job_id.to_string()));
            }
            (job.workflow_id.clone(), job.branch_key())
        };
        if state.poisoned.contains(&workflow_id) {
            return Err(ApiError::NotCancellable(job_id.to_string()));
        }

        let mut events = PendingEvents::new();
        let now = Utc::now();
        let patch = JobPatch {
            status: Some(JobStatus::Cancelled),
            finished_at: Some(now),
            ..Default::default()
        };
        let cancelled = match state.registry.update_job(&workflow_id, job_id, patch) {
            Ok(job) => job.clone(),
            Err(err) => {
                poison(&mut state, &workflow_id, &err.to_string());
                return Err(ApiError::NotCancellable(job_id.to_string()));
            }
        };
        state
            .queues
            .remove(&branch_key, &(workflow_id.clone(), job_id.to_string()));
        state.resolver.mark_terminal(&workflow_id, job_id);
        events.push((
            tenant_id.to_string(),
            ProgressEvent::JobStatus {
                job_id: job_id.to_string(),
                workflow_id: workflow_id.clone(),
                status: JobStatus::Cancelled,
                error_message: None,
                timestamp: now,
            },
        ));

        cascade_abort(
            &mut state,
            &workflow_id,
            job_id,
            "upstream cancelled",
            &mut events,
        );
        finish_workflow_bookkeeping(&mut state, &workflow_id, tenant_id, &mut events);

        let (pass_events, to_submit) = dispatch_pass(&mut state);
        drop(state);

        self.flush(events, Vec::new());
        self.flush(pass_events, to_submit);
        Ok(cancelled)
    }

    fn handle_progress(
        &mut self,
        workflow_id: &str,
        job_id: &str,
        progress: f64,
        tiles_processed: Option<u64>,
        tiles_total: Option<u64>,
    ) {
        let mut state = self.state.write().expect("engine state poisoned");
        if state.poisoned.contains(workflow_id) {
            return;
        }

        let patch = JobPatch {
            progress: Some(progress),
            tiles_processed,
            tiles_total,
            ..Default::default()
        };
        let (tenant_id, applied, terminal) =
            match state.registry.update_job(workflow_id, job_id, patch) {
                Ok(job) => (
                    job.tenant_id.clone(),
                    job.progress,
                    job.status.is_terminal(),
                ),
                Err(err) => {
                    warn!(workflow_id, job_id, %err, "dropping progress for unknown job");
                    return;
                }
            };
        if terminal {
            // Late callback racing the completion; the registry kept the
            // terminal state, nothing to publish.
            return;
        }

        let workflow_progress = state.registry.workflow_progress(workflow_id);
        drop(state);

        let now = Utc::now();
        self.bus.publish(
            &tenant_id,
            &ProgressEvent::JobProgress {
                job_id: job_id.to_string(),
                workflow_id: workflow_id.to_string(),
                progress: applied,
                tiles_processed,
                tiles_total,
                timestamp: now,
            },
        );
        self.bus.publish(
            &tenant_id,
            &ProgressEvent::WorkflowProgress {
                workflow_id: workflow_id.to_string(),
                progress: workflow_progress,
                timestamp: now,
            },
        );
    }

    fn handle_finished(&mut self, workflow_id: &str, job_id: &str, outcome: ExecutionOutcome) {
        let mut state = self.state.write().expect("engine state poisoned");

        let Some(job) = state.registry.job(workflow_id, job_id) else {
            error!(workflow_id, job_id, "completion for unknown job");
            state.healthy = false;
            return;
        };
        let tenant_id = job.tenant_id.clone();
        let branch_key = job.branch_key();

        // The lane and the running counter must be released even for a
        // poisoned workflow, or its (tenant, branch) would jam forever.
        state.queues.mark_done(&branch_key);
        state.running = state.running.saturating_sub(1);

        if state.poisoned.contains(workflow_id) {
            let (pass_events, to_submit) = dispatch_pass(&mut state);
            drop(state);
            self.flush(pass_events, to_submit);
            return;
        }

        let mut events = PendingEvents::new();
        let now = Utc::now();
        let (status, patch, error_message) = match outcome {
            ExecutionOutcome::Succeeded { result_path } => (
                JobStatus::Succeeded,
                JobPatch {
                    status: Some(JobStatus::Succeeded),
                    progress: Some(1.0),
                    result_path: Some(result_path),
                    finished_at: Some(now),
                    ..Default::default()
                },
                None,
            ),
            ExecutionOutcome::Failed { error_message } => (
                JobStatus::Failed,
                JobPatch {
                    status: Some(JobStatus::Failed),
                    error_message: Some(error_message.clone()),
                    finished_at: Some(now),
                    ..Default::default()
                },
                Some(error_message),
            ),
        };

        let finished = match state.registry.update_job(workflow_id, job_id, patch) {
            Ok(job) => job.clone(),
            Err(err) => {
                poison(&mut state, workflow_id, &err.to_string());
                let (pass_events, to_submit) = dispatch_pass(&mut state);
                drop(state);
                self.flush(pass_events, to_submit);
                return;
            }
        };

        if let (Some(started), Some(ended)) = (finished.started_at, finished.finished_at) {
            if let Ok(latency) = (ended - started).to_std() {
                state.latency.record(latency);
            }
        }

        state.resolver.mark_terminal(workflow_id, job_id);
        events.push((
            tenant_id.clone(),
            ProgressEvent::JobStatus {
                job_id: job_id.to_string(),
                workflow_id: workflow_id.to_string(),
                status,
                error_message,
                timestamp: now,
            },
        ));

        match status {
            JobStatus::Succeeded => {
                let newly_ready = state.resolver.on_succeeded(workflow_id, job_id);
                for ready_id in newly_ready {
                    let Some(ready) = state.registry.job(workflow_id, &ready_id) else {
                        continue;
                    };
                    let key = ready.branch_key();
                    state
                        .queues
                        .enqueue(key, (workflow_id.to_string(), ready_id));
                }
            }
            JobStatus::Failed => {
                cascade_abort(
                    &mut state,
                    workflow_id,
                    job_id,
                    &format!("upstream failure: {job_id}"),
                    &mut events,
                );
            }
            _ => {}
        }

        events.push((
            tenant_id.clone(),
            ProgressEvent::WorkflowProgress {
                workflow_id: workflow_id.to_string(),
                progress: state.registry.workflow_progress(workflow_id),
                timestamp: now,
            },
        ));

        finish_workflow_bookkeeping(&mut state, workflow_id, &tenant_id, &mut events);

        let (pass_events, to_submit) = dispatch_pass(&mut state);
        drop(state);

        self.flush(events, Vec::new());
        self.flush(pass_events, to_submit);
    }

    /// Publish queued events and hand dispatched jobs to the pool. Runs
    /// strictly after the state lock has been released.
    fn flush(&self, events: PendingEvents, to_submit: Vec<Job>) {
        for (tenant_id, event) in &events {
            self.bus.publish(tenant_id, event);
        }
        for job in to_submit {
            self.pool.submit(job);
        }
    }
}

/// One sweep over the branch lanes: start jobs round-robin until the worker
/// cap is reached or no lane has eligible work. Idempotent.
fn dispatch_pass(state: &mut EngineState) -> (PendingEvents, Vec<Job>) {
    let mut events = PendingEvents::new();
    let mut to_submit = Vec::new();

    while state.running < state.max_workers {
        let Some((key, (workflow_id, job_id))) = state.queues.next_dispatch() else {
            break;
        };
        if state.poisoned.contains(&workflow_id) {
            // Refuse transitions on a poisoned workflow; free the lane so
            // the tenant's other branches are unaffected.
            state.queues.mark_done(&key);
            continue;
        }

        let now = Utc::now();
        let patch = JobPatch {
            status: Some(JobStatus::Running),
            started_at: Some(now),
            ..Default::default()
        };
        let job = match state.registry.update_job(&workflow_id, &job_id, patch) {
            Ok(job) => job.clone(),
            Err(err) => {
                poison(state, &workflow_id, &err.to_string());
                state.queues.mark_done(&key);
                continue;
            }
        };
        state.running += 1;

        if let Some(new_status) = state.registry.refresh_workflow_status(&workflow_id) {
            events.push((
                job.tenant_id.clone(),
                ProgressEvent::WorkflowStatus {
                    workflow_id: workflow_id.clone(),
                    status: new_status,
                    timestamp: now,
                },
            ));
        }
        events.push((
            job.tenant_id.clone(),
            ProgressEvent::JobStatus {
                job_id: job_id.clone(),
                workflow_id: workflow_id.clone(),
                status: JobStatus::Running,
                error_message: None,
                timestamp: now,
            },
        ));
        to_submit.push(job);
    }

    state.queues.collect_idle();
    (events, to_submit)
}

/// Fail every not-yet-terminal transitive dependent of `job_id` with the
/// given upstream message. Cascaded jobs were never enqueued (a job with an
/// unfinished predecessor is never promoted), so no queue surgery is needed.
fn cascade_abort(
    state: &mut EngineState,
    workflow_id: &str,
    job_id: &str,
    message: &str,
    events: &mut PendingEvents,
) {
    let dependents = state.resolver.transitive_dependents(workflow_id, job_id);
    let now = Utc::now();
    for dependent in dependents {
        let Some(job) = state.registry.job(workflow_id, &dependent) else {
            continue;
        };
        if job.status.is_terminal() {
            continue;
        }
        let tenant_id = job.tenant_id.clone();
        let patch = JobPatch {
            status: Some(JobStatus::Failed),
            error_message: Some(message.to_string()),
            finished_at: Some(now),
            ..Default::default()
        };
        if let Err(err) = state.registry.update_job(workflow_id, &dependent, patch) {
            poison(state, workflow_id, &err.to_string());
            return;
        }
        state.resolver.mark_terminal(workflow_id, &dependent);
        events.push((
            tenant_id,
            ProgressEvent::JobStatus {
                job_id: dependent.clone(),
                workflow_id: workflow_id.to_string(),
                status: JobStatus::Failed,
                error_message: Some(message.to_string()),
                timestamp: now,
            },
        ));
    }
}

/// Recompute workflow status, emit a status event on change, drop resolver
/// bookkeeping once terminal, and release the tenant's admission slot when
/// it has drained.
fn finish_workflow_bookkeeping(
    state: &mut EngineState,
    workflow_id: &str,
    tenant_id: &str,
    events: &mut PendingEvents,
) {
    if let Some(new_status) = state.registry.refresh_workflow_status(workflow_id) {
        events.push((
            tenant_id.to_string(),
            ProgressEvent::WorkflowStatus {
                workflow_id: workflow_id.to_string(),
                status: new_status,
                timestamp: Utc::now(),
            },
        ));
        if new_status.is_terminal() {
            state.resolver.remove_workflow(workflow_id);
        }
    }

    if !state.registry.tenant_has_live_jobs(tenant_id) {
        state.admission.release(tenant_id);
    }
}

fn poison(state: &mut EngineState, workflow_id: &str, reason: &str) {
    error!(
        workflow_id,
        reason, "internal invariant violation; freezing workflow"
    );
    state.poisoned.insert(workflow_id.to_string());
    state.healthy = false;
}

/// Read-only structural self-check backing the dashboard health flag.
fn verify_invariants(state: &EngineState) -> Vec<String> {
    let mut violations = Vec::new();

    let mut per_lane: std::collections::HashMap<BranchKey, usize> = std::collections::HashMap::new();
    let mut running = 0usize;
    for job in state.registry.running_jobs() {
        running += 1;
        *per_lane.entry(job.branch_key()).or_insert(0) += 1;

        for dep in &job.depends_on {
            let ok = state
                .registry
                .job(&job.workflow_id, dep)
                .map(|d| d.status == JobStatus::Succeeded)
                .unwrap_or(false);
            if !ok {
                violations.push(format!(
                    "job {}/{} is RUNNING with unfinished predecessor {}",
                    job.workflow_id, job.job_id, dep
                ));
            }
        }
    }
    for ((tenant, branch), count) in per_lane {
        if count > 1 {
            violations.push(format!(
                "{count} jobs RUNNING on lane ({tenant}, {branch})"
            ));
        }
    }
    if running > state.max_workers {
        violations.push(format!(
            "{running} jobs RUNNING above the cap of {}",
            state.max_workers
        ));
    }

    let mut live_tenants: HashSet<&str> = HashSet::new();
    for workflow in state.registry.workflows() {
        if state.registry.tenant_has_live_jobs(&workflow.tenant_id) {
            live_tenants.insert(workflow.tenant_id.as_str());
        }
    }
    if live_tenants.len() > state.admission.limit() {
        violations.push(format!(
            "{} tenants with live jobs above the cap of {}",
            live_tenants.len(),
            state.admission.limit()
        ));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::model::JobSubmission;
    use crate::worker::{JobExecutor, ProgressSink};

    struct InstantExecutor;

    impl JobExecutor for InstantExecutor {
        fn execute(&self, job: &Job, progress: &ProgressSink) -> crate::worker::ExecutionOutcome {
            progress.update(1.0, Some(4), Some(4));
            crate::worker::ExecutionOutcome::Succeeded {
                result_path: format!("/results/{}/{}.json", job.workflow_id, job.job_id),
            }
        }
    }

    fn executors() -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        let executor = Arc::new(InstantExecutor);
        registry.register(crate::model::JobType::CellSegmentation, executor.clone());
        registry.register(crate::model::JobType::TissueMask, executor);
        registry
    }

    fn submission(jobs: Vec<JobSubmission>) -> WorkflowSubmission {
        WorkflowSubmission {
            name: "run".to_string(),
            jobs,
        }
    }

    fn job_spec(id: &str, branch: &str, deps: &[&str]) -> JobSubmission {
        JobSubmission {
            job_id: id.to_string(),
            job_type: "cell_segmentation".to_string(),
            image_path: format!("/slides/{id}.svs"),
            branch: branch.to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    async fn wait_terminal(engine: &Engine, tenant: &str, workflow_id: &str) -> WorkflowSnapshot {
        for _ in 0..500 {
            let snapshot = engine.get_workflow(tenant, workflow_id).unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workflow {workflow_id} did not reach a terminal status");
    }

    #[tokio::test]
    async fn single_job_workflow_succeeds_with_result_path() {
        let (engine, _task) = Engine::start(&Config::default(), executors());
        let snapshot = engine
            .submit_workflow("t1", submission(vec![job_spec("a", "b1", &[])]))
            .await
            .unwrap();

        let done = wait_terminal(&engine, "t1", &snapshot.workflow_id).await;
        assert_eq!(done.status, WorkflowStatus::Succeeded);
        assert!(done.jobs[0].result_path.as_deref().unwrap().contains("a.json"));
        assert_eq!(done.jobs[0].progress, 1.0);
    }

    #[tokio::test]
    async fn validation_failure_writes_nothing() {
        let (engine, _task) = Engine::start(&Config::default(), executors());
        let err = engine
            .submit_workflow("t1", submission(vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_failed");
        assert!(engine.list_workflows("t1").is_empty());
        assert_eq!(engine.dashboard().active_users.count, 0);
    }

    #[tokio::test]
    async fn admission_rejects_and_recovers() {
        let config = Config {
            max_active_users: 1,
            ..Config::default()
        };
        let (engine, _task) = Engine::start(&config, executors());

        let first = engine
            .submit_workflow("t1", submission(vec![job_spec("a", "b1", &[])]))
            .await
            .unwrap();
        let rejected = engine
            .submit_workflow("t2", submission(vec![job_spec("a", "b1", &[])]))
            .await;
        // t1 may have drained already on a fast machine, in which case t2 is
        // admitted; only assert rejection while t1 is still live.
        if let Err(err) = rejected {
            assert_eq!(err, ApiError::TenantRejected);
        }

        wait_terminal(&engine, "t1", &first.workflow_id).await;
        let readmitted = engine
            .submit_workflow("t2", submission(vec![job_spec("a", "b1", &[])]))
            .await
            .unwrap();
        wait_terminal(&engine, "t2", &readmitted.workflow_id).await;
    }

    #[tokio::test]
    async fn tenant_isolation_on_reads() {
        let (engine, _task) = Engine::start(&Config::default(), executors());
        let snapshot = engine
            .submit_workflow("t1", submission(vec![job_spec("a", "b1", &[])]))
            .await
            .unwrap();

        assert!(engine.list_workflows("t2").is_empty());
        assert_eq!(
            engine.get_workflow("t2", &snapshot.workflow_id).unwrap_err(),
            ApiError::NotFound
        );
    }
}
