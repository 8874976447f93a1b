//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{ConversationQuery, Job, JobCompletion, JobFilter, JobStatus};
use crate::runner::{RoomSettings, Runner};
use crate::session::SessionKey;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that text order equals time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    opt_text(dt.map(format_datetime).as_deref())
}

/// SQL list of the states a job may leave to enter `target`.
fn predecessor_list(target: JobStatus) -> String {
    target
        .predecessors()
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

const JOB_COLUMNS: &str = "id, runner, device_id, room_id, thread_id, input_text, workspace_path, settings, status, created_at, started_at, finished_at, exit_code, output_text, error_message, notify_token";

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("job row parse: {e}"));

    let id_str: String = row.get(0).map_err(col)?;
    let runner_str: String = row.get(1).map_err(col)?;
    let settings_str: Option<String> = row.get::<String>(7).ok();
    let status_str: String = row.get(8).map_err(col)?;
    let created_str: String = row.get(9).map_err(col)?;

    let settings = settings_str
        .map(|s| serde_json::from_str::<RoomSettings>(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("job settings: {e}")))?;

    Ok(Job {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?,
        runner: runner_str
            .parse::<Runner>()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        device_id: row.get(2).map_err(col)?,
        room_id: row.get(3).map_err(col)?,
        thread_id: row.get(4).map_err(col)?,
        input_text: row.get(5).map_err(col)?,
        workspace_path: PathBuf::from(row.get::<String>(6).map_err(col)?),
        settings,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&row.get::<String>(10).ok()),
        finished_at: parse_optional_datetime(&row.get::<String>(11).ok()),
        exit_code: row.get::<i64>(12).ok().map(|c| c as i32),
        output_text: row.get::<String>(13).ok(),
        error_message: row.get::<String>(14).ok(),
        notify_token: row.get::<String>(15).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let settings = job
            .settings
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("job settings: {e}")))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    job.id.to_string(),
                    job.runner.as_str(),
                    job.device_id.as_str(),
                    job.room_id.as_str(),
                    job.thread_id.as_str(),
                    job.input_text.as_str(),
                    job.workspace_path.display().to_string(),
                    opt_text(settings.as_deref()),
                    job.status.as_str(),
                    format_datetime(&job.created_at),
                    opt_datetime(job.started_at.as_ref()),
                    opt_datetime(job.finished_at.as_ref()),
                    match job.exit_code {
                        Some(code) => libsql::Value::Integer(code as i64),
                        None => libsql::Value::Null,
                    },
                    opt_text(job.output_text.as_deref()),
                    opt_text(job.error_message.as_deref()),
                    opt_text(job.notify_token.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, "Job inserted");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let jobs = self
            .query_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                vec![libsql::Value::Text(id.to_string())],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(libsql::Value::Text(status.as_str().to_string()));
        }
        if let Some(device_id) = &filter.device_id {
            clauses.push("device_id = ?");
            values.push(libsql::Value::Text(device_id.clone()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        values.push(libsql::Value::Integer(filter.effective_limit() as i64));

        self.query_jobs(
            "list_jobs",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs{where_sql} ORDER BY created_at DESC, rowid DESC LIMIT ?"
            ),
            values,
        )
        .await
    }

    async fn list_conversation(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut sql =
            format!("SELECT {JOB_COLUMNS} FROM jobs WHERE device_id = ? AND room_id = ? AND runner = ?");
        let mut values = vec![
            libsql::Value::Text(query.device_id.clone()),
            libsql::Value::Text(query.room_id.clone()),
            libsql::Value::Text(query.runner.as_str().to_string()),
        ];
        if let Some(thread_id) = &query.thread_id {
            sql.push_str(" AND thread_id = ?");
            values.push(libsql::Value::Text(thread_id.clone()));
        }
        // Newest page first, then flipped into reading order.
        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?");
        values.push(libsql::Value::Integer(
            query.limit.clamp(1, crate::jobs::model::MAX_LIST_LIMIT) as i64,
        ));
        values.push(libsql::Value::Integer(query.offset as i64));

        let mut jobs = self.query_jobs("list_conversation", &sql, values).await?;
        jobs.reverse();
        Ok(jobs)
    }

    async fn mark_job_running(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                &format!(
                    "UPDATE jobs SET status = 'running', started_at = ?1 WHERE id = ?2 AND status IN ({})",
                    predecessor_list(JobStatus::Running)
                ),
                params![format_datetime(&started_at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_job_running: {e}")))?;
        Ok(updated == 1)
    }

    async fn finish_job(
        &self,
        id: Uuid,
        completion: &JobCompletion,
    ) -> Result<bool, DatabaseError> {
        if !completion.status.is_terminal() {
            return Err(DatabaseError::Constraint(format!(
                "finish_job: {} is not a terminal status",
                completion.status
            )));
        }

        let updated = self
            .conn()
            .execute(
                &format!(
                    "UPDATE jobs SET status = ?1, finished_at = ?2, exit_code = ?3, output_text = ?4, error_message = ?5
                     WHERE id = ?6 AND status IN ({})",
                    predecessor_list(completion.status)
                ),
                params![
                    completion.status.as_str(),
                    format_datetime(&completion.finished_at),
                    match completion.exit_code {
                        Some(code) => libsql::Value::Integer(code as i64),
                        None => libsql::Value::Null,
                    },
                    opt_text(completion.output_text.as_deref()),
                    opt_text(completion.error_message.as_deref()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_job: {e}")))?;
        Ok(updated == 1)
    }

    async fn fail_interrupted_jobs(
        &self,
        error_message: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let unfinished = predecessor_list(JobStatus::Failed);
        let jobs = self
            .query_jobs(
                "fail_interrupted_jobs",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ({unfinished})"),
                Vec::new(),
            )
            .await?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        self.conn()
            .execute(
                &format!(
                    "UPDATE jobs SET status = 'failed', finished_at = ?1, error_message = ?2 WHERE status IN ({unfinished})"
                ),
                params![format_datetime(&finished_at), error_message],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_interrupted_jobs: {e}")))?;

        Ok(jobs
            .into_iter()
            .map(|job| Job {
                status: JobStatus::Failed,
                finished_at: Some(finished_at),
                error_message: Some(error_message.to_string()),
                ..job
            })
            .collect())
    }

    // ── Device sessions ─────────────────────────────────────────────

    async fn get_session_token(&self, key: &SessionKey) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT session_token FROM device_sessions
                 WHERE device_id = ?1 AND room_id = ?2 AND runner = ?3 AND thread_id = ?4",
                params![
                    key.device_id.as_str(),
                    key.room_id.as_str(),
                    key.runner.as_str(),
                    key.thread_id.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session_token: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(|e| {
                DatabaseError::Query(format!("get_session_token row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_session_token: {e}"))),
        }
    }

    async fn upsert_session_token(
        &self,
        key: &SessionKey,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO device_sessions
                    (device_id, room_id, runner, thread_id, session_token, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (device_id, room_id, runner, thread_id) DO UPDATE SET
                    session_token = excluded.session_token,
                    updated_at = excluded.updated_at",
                params![
                    key.device_id.as_str(),
                    key.room_id.as_str(),
                    key.runner.as_str(),
                    key.thread_id.as_str(),
                    token,
                    format_datetime(&now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_session_token: {e}")))?;
        Ok(())
    }

    async fn delete_sessions(
        &self,
        device_id: &str,
        room_id: &str,
        runner: Runner,
        thread_id: Option<&str>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let deleted = match thread_id {
            Some(thread_id) => {
                conn.execute(
                    "DELETE FROM device_sessions
                     WHERE device_id = ?1 AND room_id = ?2 AND runner = ?3 AND thread_id = ?4",
                    params![device_id, room_id, runner.as_str(), thread_id],
                )
                .await
            }
            None => {
                conn.execute(
                    "DELETE FROM device_sessions WHERE device_id = ?1 AND room_id = ?2 AND runner = ?3",
                    params![device_id, room_id, runner.as_str()],
                )
                .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("delete_sessions: {e}")))?;
        Ok(deleted)
    }
}
