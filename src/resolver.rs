//! Dependency resolver: tracks outstanding predecessors per job and promotes
//! jobs to ready as their predecessors succeed.
//!
//! The resolver holds a forward count (how many predecessors a job still
//! waits on) and a reverse successor index per workflow. Failure propagation
//! walks the successor index transitively; the scheduler decides what status
//! and message the cascaded jobs get.

use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Default)]
struct WorkflowGraph {
    /// job_id -> number of predecessors not yet SUCCEEDED.
    outstanding: HashMap<String, usize>,
    /// job_id -> jobs that depend on it, in registration order.
    successors: HashMap<String, Vec<String>>,
    /// Jobs not yet terminal.
    remaining: usize,
}

#[derive(Debug, Default)]
pub struct DependencyResolver {
    graphs: HashMap<String, WorkflowGraph>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow's jobs as (job_id, depends_on) pairs and return
    /// the jobs with no predecessors, in submission order.
    pub fn register_workflow<'a, I>(&mut self, workflow_id: &str, jobs: I) -> Vec<String>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let mut graph = WorkflowGraph::default();
        let mut ready = Vec::new();

        for (job_id, depends_on) in jobs {
            graph.remaining += 1;
            graph.outstanding.insert(job_id.to_string(), depends_on.len());
            if depends_on.is_empty() {
                ready.push(job_id.to_string());
            }
            for dep in depends_on {
                graph
                    .successors
                    .entry(dep.clone())
                    .or_default()
                    .push(job_id.to_string());
            }
        }

        self.graphs.insert(workflow_id.to_string(), graph);
        ready
    }

    /// Record a success and return the successors whose outstanding count
    /// reached zero.
    pub fn on_succeeded(&mut self, workflow_id: &str, job_id: &str) -> Vec<String> {
        let Some(graph) = self.graphs.get_mut(workflow_id) else {
            return Vec::new();
        };
        let mut newly_ready = Vec::new();
        let successors = graph.successors.get(job_id).cloned().unwrap_or_default();
        for successor in successors {
            if let Some(count) = graph.outstanding.get_mut(&successor) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    newly_ready.push(successor);
                }
            }
        }
        newly_ready
    }

    /// All transitive dependents of a job, in breadth-first order. Used to
    /// cascade a failure or cancellation downstream.
    pub fn transitive_dependents(&self, workflow_id: &str, job_id: &str) -> Vec<String> {
        let Some(graph) = self.graphs.get(workflow_id) else {
            return Vec::new();
        };
        let mut seen: HashSet<&str> = HashSet::new();
        let mut order = Vec::new();
        let mut frontier: VecDeque<&str> = VecDeque::new();
        frontier.push_back(job_id);

        while let Some(current) = frontier.pop_front() {
            let Some(successors) = graph.successors.get(current) else {
                continue;
            };
            for successor in successors {
                if seen.insert(successor.as_str()) {
                    order.push(successor.clone());
                    frontier.push_back(successor.as_str());
                }
            }
        }
        order
    }

    /// Record that a job reached a terminal status.
    pub fn mark_terminal(&mut self, workflow_id: &str, job_id: &str) {
        if let Some(graph) = self.graphs.get_mut(workflow_id) {
            // Guard against double-marking the same job.
            if graph.outstanding.remove(job_id).is_some() {
                graph.remaining = graph.remaining.saturating_sub(1);
            }
        }
    }

    pub fn is_workflow_done(&self, workflow_id: &str) -> bool {
        self.graphs
            .get(workflow_id)
            .map(|g| g.remaining == 0)
            .unwrap_or(true)
    }

    /// Drop the bookkeeping for a finished workflow.
    pub fn remove_workflow(&mut self, workflow_id: &str) {
        self.graphs.remove(workflow_id);
    }
}
