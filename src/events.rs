//! In-process progress event fan-out.
//!
//! Subscribers register per tenant and read an async stream of typed events.
//! Delivery is best-effort and lossy: each subscriber owns a bounded mailbox,
//! and a publish that would overflow discards the oldest undelivered event
//! instead of blocking the scheduler or tearing the subscriber down. The bus
//! holds only weak references, so a dropped stream never blocks progress and
//! is reaped on the next publish to its tenant.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

use crate::model::{JobStatus, WorkflowStatus};

/// Events delivered to subscribers. Serialized with a `type` discriminator
/// and upper-case status strings, matching the wire envelopes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    JobProgress {
        job_id: String,
        workflow_id: String,
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        tiles_processed: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tiles_total: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    JobStatus {
        job_id: String,
        workflow_id: String,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowProgress {
        workflow_id: String,
        progress: f64,
        timestamp: DateTime<Utc>,
    },
    WorkflowStatus {
        workflow_id: String,
        status: WorkflowStatus,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct Mailbox {
    events: Mutex<VecDeque<ProgressEvent>>,
    capacity: usize,
    notify: tokio::sync::Notify,
}

impl Mailbox {
    fn push(&self, event: ProgressEvent) {
        {
            let mut events = self.events.lock().expect("mailbox poisoned");
            if events.len() >= self.capacity {
                // Lossy under back-pressure: oldest undelivered goes first.
                events.pop_front();
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<ProgressEvent> {
        self.events.lock().expect("mailbox poisoned").pop_front()
    }
}

/// Subscriber handle. Dropping it unsubscribes; the bus reaps the dead entry
/// on the next publish to the same tenant.
pub struct EventStream {
    mailbox: Arc<Mailbox>,
}

impl EventStream {
    /// Wait for the next event in publish order.
    pub async fn recv(&mut self) -> ProgressEvent {
        loop {
            if let Some(event) = self.mailbox.pop() {
                return event;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Drain without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.mailbox.pop()
    }
}

#[derive(Debug)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Weak<Mailbox>>>>,
    mailbox_capacity: usize,
}

impl EventBus {
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            mailbox_capacity: mailbox_capacity.max(1),
        }
    }

    pub fn subscribe(&self, tenant_id: &str) -> EventStream {
        let mailbox = Arc::new(Mailbox {
            events: Mutex::new(VecDeque::new()),
            capacity: self.mailbox_capacity,
            notify: tokio::sync::Notify::new(),
        });
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .entry(tenant_id.to_string())
            .or_default()
            .push(Arc::downgrade(&mailbox));
        EventStream { mailbox }
    }

    /// Publish to every live subscriber of the tenant. Never blocks.
    pub fn publish(&self, tenant_id: &str, event: &ProgressEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("subscriber registry poisoned");
        let Some(entries) = subscribers.get_mut(tenant_id) else {
            return;
        };
        entries.retain(|weak| match weak.upgrade() {
            Some(mailbox) => {
                mailbox.push(event.clone());
                true
            }
            None => {
                trace!(tenant_id, "reaping dead subscriber");
                false
            }
        });
        if entries.is_empty() {
            subscribers.remove(tenant_id);
        }
    }

    pub fn subscriber_count(&self, tenant_id: &str) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .get(tenant_id)
            .map(|entries| entries.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}
