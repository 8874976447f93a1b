//! Event types and their mapping onto server-sent events.

use axum::response::sse::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::model::{Job, JobStatus};

/// Event name used for per-job status frames.
pub const STATUS_EVENT: &str = "status";

/// A status change of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(skip)]
    pub job_id: Uuid,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn to_frame(&self) -> Frame {
        Frame::Event {
            name: STATUS_EVENT.to_string(),
            data: serde_json::to_value(self).unwrap_or(Value::Null),
        }
    }
}

impl From<&Job> for JobEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            started_at: job.started_at,
            finished_at: job.finished_at,
            exit_code: job.exit_code,
        }
    }
}

/// A named message for every global subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalEvent {
    pub name: String,
    pub data: Value,
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event { name: String, data: Value },
    /// Keeps idle connections from being reaped by proxies.
    Heartbeat,
}

impl Frame {
    /// Name and JSON payload become `event:` / `data:`; heartbeats become a comment.
    pub fn into_event(self) -> Event {
        match self {
            Frame::Event { name, data } => Event::default().event(name).data(data.to_string()),
            Frame::Heartbeat => Event::default().comment("ping"),
        }
    }
}

impl From<GlobalEvent> for Frame {
    fn from(event: GlobalEvent) -> Self {
        Frame::Event {
            name: event.name,
            data: event.data,
        }
    }
}
