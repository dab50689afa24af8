//! Switchback - a branch-aware, multi-tenant workflow scheduler.
//!
//! Clients submit named workflows: DAGs of image-inference jobs tagged with a
//! tenant and a branch string. The scheduler runs them under three
//! simultaneous constraints:
//!
//! - within one (tenant, branch) pair, at most one job runs at a time;
//! - a job starts only after all of its declared predecessors succeeded;
//! - global caps bound the number of active tenants and executing jobs.
//!
//! ## Components
//!
//! - [`Engine`]: the single-writer scheduler loop and its control handle
//! - [`Registry`]: source of truth for workflow and job records
//! - [`BranchQueues`]: per-(tenant, branch) FIFO lanes with round-robin
//!   dispatch
//! - [`DependencyResolver`]: readiness tracking and failure cascades
//! - [`WorkerPool`]: bounded executor host on the blocking thread pool
//! - [`EventBus`]: lossy per-tenant progress fan-out
//! - [`ApiServer`]: HTTP/WebSocket transport

pub mod admission;
pub mod branch_queue;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executors;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod validate;
pub mod worker;

// Configuration
pub use config::Config;

// Engine
pub use engine::Engine;

// Records and statuses
pub use model::{
    Job, JobPatch, JobStatus, JobSubmission, JobType, Workflow, WorkflowSnapshot, WorkflowStatus,
    WorkflowSubmission,
};

// Components
pub use admission::{AdmissionController, AdmissionDecision};
pub use branch_queue::{BranchKey, BranchQueues, JobRef};
pub use events::{EventBus, EventStream, ProgressEvent};
pub use registry::Registry;
pub use resolver::DependencyResolver;
pub use worker::{ExecutionOutcome, ExecutorRegistry, JobExecutor, ProgressSink, WorkerPool};

// Errors
pub use error::{ApiError, ValidationError};

// Metrics view
pub use metrics::{DashboardSnapshot, HealthSnapshot};

// Transport
pub use server::ApiServer;
