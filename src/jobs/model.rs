//! Job records and the job state machine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runner::{RoomSettings, Runner};

/// Maximum number of jobs a single listing returns.
pub const MAX_LIST_LIMIT: usize = 200;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, waiting for its session key and a free execution slot.
    Pending,
    /// Runner process is executing.
    Running,
    /// Runner exited with code 0.
    Success,
    /// Runner could not be started, exited non-zero, timed out, or was interrupted.
    Failed,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    ///
    /// `Pending → Failed` covers jobs that never got to run (shutdown,
    /// restart recovery).
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) | (Running, Success) | (Running, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// States a job may be in right before entering `self`.
    pub fn predecessors(&self) -> Vec<JobStatus> {
        [Self::Pending, Self::Running, Self::Success, Self::Failed]
            .into_iter()
            .filter(|from| from.can_transition_to(*self))
            .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One submitted prompt and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub runner: Runner,
    pub device_id: String,
    pub room_id: String,
    pub thread_id: String,
    pub input_text: String,
    pub workspace_path: PathBuf,
    pub settings: Option<RoomSettings>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output_text: Option<String>,
    pub error_message: Option<String>,
    pub notify_token: Option<String>,
}

impl Job {
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            runner: self.runner,
            status: self.status,
        }
    }
}

/// What `create_job` hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub runner: Runner,
    pub status: JobStatus,
}

/// A request to create a job. Fields arrive unvalidated except for
/// `workspace_path` and `settings`, which upstream collaborators sanitize.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateJob {
    pub runner: String,
    pub input_text: String,
    pub device_id: String,
    pub room_id: String,
    pub workspace_path: PathBuf,
    #[serde(default)]
    pub settings: Option<RoomSettings>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub notify_token: Option<String>,
}

/// Terminal result written when a job finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub finished_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub output_text: Option<String>,
    pub error_message: Option<String>,
}

impl JobCompletion {
    pub fn success(exit_code: i32, output: String) -> Self {
        Self {
            status: JobStatus::Success,
            finished_at: Utc::now(),
            exit_code: Some(exit_code),
            output_text: Some(output),
            error_message: None,
        }
    }

    pub fn failed(exit_code: Option<i32>, output: Option<String>, error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            finished_at: Utc::now(),
            exit_code,
            output_text: output,
            error_message: Some(error.into()),
        }
    }
}

/// Filters for listing jobs. All filters are optional and conjunctive.
#[derive(Debug, Clone, Deserialize)]
pub struct JobFilter {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub device_id: Option<String>,
}

impl JobFilter {
    /// Limit clamped to `1..=MAX_LIST_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            status: None,
            device_id: None,
        }
    }
}

fn default_limit() -> usize {
    20
}

/// The jobs of one conversation, oldest first.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationQuery {
    pub device_id: String,
    pub room_id: String,
    pub runner: Runner,
    /// `None` lists every thread of the room (compatibility mode).
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}
