//! `Database` trait: single async interface for job and session persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{ConversationQuery, Job, JobCompletion, JobFilter};
use crate::runner::Runner;
use crate::session::SessionKey;

/// Backend-agnostic database trait covering jobs and device sessions.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a freshly created job.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Jobs matching `filter`, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError>;

    /// The newest page of one conversation, in chronological order.
    async fn list_conversation(&self, query: &ConversationQuery)
    -> Result<Vec<Job>, DatabaseError>;

    /// Move a pending job to running. Returns `false` if the job was not pending.
    async fn mark_job_running(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Write the terminal record. Returns `false` if the job could not legally
    /// enter `completion.status` (already terminal, or missing).
    async fn finish_job(&self, id: Uuid, completion: &JobCompletion)
    -> Result<bool, DatabaseError>;

    /// Fail every pending or running job. Returns the affected jobs as stored afterwards.
    async fn fail_interrupted_jobs(
        &self,
        error_message: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError>;

    // ── Device sessions ─────────────────────────────────────────────

    /// Stored continuation token for a session key.
    async fn get_session_token(&self, key: &SessionKey) -> Result<Option<String>, DatabaseError>;

    /// Insert or replace the token for a session key in one statement.
    async fn upsert_session_token(
        &self,
        key: &SessionKey,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Delete stored tokens. `thread_id: None` deletes every thread.
    async fn delete_sessions(
        &self,
        device_id: &str,
        room_id: &str,
        runner: Runner,
        thread_id: Option<&str>,
    ) -> Result<u64, DatabaseError>;
}
