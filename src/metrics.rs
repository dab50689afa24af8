//! Dashboard metrics view.
//!
//! A read-only snapshot assembled from the registry, branch queues, and
//! admission set, plus a rolling window of job completion latencies in the
//! style of a rolling metric buffer: samples pruned by wall-clock cutoff,
//! averaged on demand.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

/// One completion latency sample.
#[derive(Debug, Clone, Copy)]
struct Sample {
    recorded_at: Instant,
    latency: Duration,
}

/// Completion latencies within a sliding window.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<Sample>,
    window: Duration,
}

impl LatencyWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let now = Instant::now();
        self.samples.push_back(Sample {
            recorded_at: now,
            latency,
        });
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.recorded_at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average latency over the window; `None` when no job completed inside
    /// it. Does not mutate, so it can run under a read lock: stale samples
    /// are filtered out here and physically dropped on the next `record`.
    pub fn average(&self) -> Option<(Duration, usize)> {
        let now = Instant::now();
        let mut total = Duration::ZERO;
        let mut count = 0usize;
        for sample in &self.samples {
            if now.duration_since(sample.recorded_at) <= self.window {
                total += sample.latency;
                count += 1;
            }
        }
        if count == 0 {
            None
        } else {
            Some((total / count as u32, count))
        }
    }
}

/// Global and per-tenant running-job counts.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveWorkers {
    pub global: usize,
    pub by_tenant: BTreeMap<String, usize>,
    pub max: usize,
}

/// Queue depths: total, per tenant, and per (tenant, branch) keyed as
/// branch -> tenant -> depth.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub total: usize,
    pub by_tenant: BTreeMap<String, usize>,
    pub by_branch: BTreeMap<String, BTreeMap<String, usize>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobLatency {
    pub average_seconds: f64,
    pub average_minutes: f64,
    pub completed_in_window: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveUsers {
    pub count: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: &'static str,
    pub running_jobs: usize,
    pub queue_depth: usize,
}

/// Payload for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub active_users: usize,
    pub running_jobs: usize,
    pub queue_depth: usize,
}

/// Point-in-time dashboard view.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub active_workers: ActiveWorkers,
    pub queue_depth: QueueDepth,
    pub job_latency: JobLatency,
    pub active_users: ActiveUsers,
    pub system_health: SystemHealth,
}

impl JobLatency {
    pub fn from_window(window: &LatencyWindow) -> Self {
        match window.average() {
            Some((avg, count)) => {
                let seconds = avg.as_secs_f64();
                JobLatency {
                    average_seconds: seconds,
                    average_minutes: seconds / 60.0,
                    completed_in_window: count,
                }
            }
            None => JobLatency {
                average_seconds: 0.0,
                average_minutes: 0.0,
                completed_in_window: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zero() {
        let window = LatencyWindow::new(Duration::from_secs(60));
        let latency = JobLatency::from_window(&window);
        assert_eq!(latency.average_seconds, 0.0);
        assert_eq!(latency.average_minutes, 0.0);
        assert_eq!(latency.completed_in_window, 0);
    }

    #[test]
    fn average_over_recent_samples() {
        let mut window = LatencyWindow::new(Duration::from_secs(60));
        window.record(Duration::from_secs(30));
        window.record(Duration::from_secs(90));

        let (avg, count) = window.average().unwrap();
        assert_eq!(count, 2);
        assert_eq!(avg, Duration::from_secs(60));

        let latency = JobLatency::from_window(&window);
        assert!((latency.average_minutes - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stale_samples_are_pruned_on_record() {
        let mut window = LatencyWindow::new(Duration::ZERO);
        window.record(Duration::from_secs(10));
        // Window of zero: the sample above is already stale for the next
        // record call, which prunes it.
        window.record(Duration::from_secs(20));
        assert!(window.samples.len() <= 2);
    }
}
