//! Event bus: per-job status channels and a global broadcast channel.
//!
//! Delivery is at-most-once and nothing is replayed. Producers never wait:
//! a subscriber whose queue is full is dropped, which ends its stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::frame::{Frame, GlobalEvent, JobEvent};
use crate::config::EventConfig;

pub struct EventBus {
    config: EventConfig,
    jobs: Mutex<HashMap<Uuid, Vec<mpsc::Sender<JobEvent>>>>,
    global: Mutex<HashMap<u64, mpsc::Sender<GlobalEvent>>>,
    next_subscriber: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            jobs: Mutex::new(HashMap::new()),
            global: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
        })
    }

    // ── Per-job channels ────────────────────────────────────────────

    /// Listen for status changes of `job_id`. The receiver closes after the
    /// job's terminal event.
    pub fn subscribe_job(&self, job_id: Uuid) -> mpsc::Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_capacity);
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(job_id)
            .or_default()
            .push(tx);
        debug!(job_id = %job_id, "Job subscriber registered");
        rx
    }

    /// Deliver `event` to the job's subscribers. Returns how many received it.
    pub fn publish_job(&self, event: &JobEvent) -> usize {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(senders) = jobs.get_mut(&event.job_id) else {
            return 0;
        };

        let before = senders.len();
        senders.retain(|tx| tx.try_send(event.clone()).is_ok());
        let delivered = senders.len();
        if delivered < before {
            warn!(
                job_id = %event.job_id,
                dropped = before - delivered,
                "Dropped slow or closed job subscribers"
            );
        }

        if event.is_terminal() || senders.is_empty() {
            jobs.remove(&event.job_id);
        }
        delivered
    }

    /// Forget subscribers of `job_id` whose receivers are gone.
    pub fn prune_job(&self, job_id: Uuid) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = jobs.get_mut(&job_id) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                jobs.remove(&job_id);
            }
        }
    }

    pub fn job_subscriber_count(&self, job_id: Uuid) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .map_or(0, Vec::len)
    }

    // ── Global channel ──────────────────────────────────────────────

    pub fn subscribe_global(self: &Arc<Self>) -> GlobalSubscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_capacity);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.global
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        debug!(subscriber = id, "Global subscriber registered");

        GlobalSubscription {
            id,
            rx,
            heartbeat: self.config.heartbeat_interval,
            bus: Arc::clone(self),
        }
    }

    /// Send a named event to every global subscriber. Returns how many received it.
    pub fn broadcast(&self, name: &str, data: Value) -> usize {
        let event = GlobalEvent {
            name: name.to_string(),
            data,
        };
        let mut global = self.global.lock().unwrap_or_else(|e| e.into_inner());
        let before = global.len();
        global.retain(|_, tx| tx.try_send(event.clone()).is_ok());
        let delivered = global.len();
        if delivered < before {
            warn!(
                event = name,
                dropped = before - delivered,
                "Dropped slow or closed global subscribers"
            );
        }
        delivered
    }

    pub fn global_subscriber_count(&self) -> usize {
        self.global.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop every subscriber, ending all open streams.
    pub fn close_all(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(|e| e.into_inner()));
        let global = std::mem::take(&mut *self.global.lock().unwrap_or_else(|e| e.into_inner()));
        debug!(
            job_channels = jobs.len(),
            global_subscribers = global.len(),
            "Event bus closed"
        );
    }
}

/// A registered global listener. Deregisters itself when dropped.
pub struct GlobalSubscription {
    id: u64,
    rx: mpsc::Receiver<GlobalEvent>,
    heartbeat: Duration,
    bus: Arc<EventBus>,
}

impl GlobalSubscription {
    /// Next event, or `None` once the bus has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<GlobalEvent> {
        self.rx.recv().await
    }

    /// Wire frames: every event, plus a heartbeat after each idle interval.
    pub fn into_frames(self) -> impl Stream<Item = Frame> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            match tokio::time::timeout(sub.heartbeat, sub.rx.recv()).await {
                Ok(Some(event)) => Some((Frame::from(event), sub)),
                Ok(None) => None,
                Err(_) => Some((Frame::Heartbeat, sub)),
            }
        })
    }
}

impl Drop for GlobalSubscription {
    fn drop(&mut self) {
        self.bus
            .global
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        debug!(subscriber = self.id, "Global subscriber removed");
    }
}
