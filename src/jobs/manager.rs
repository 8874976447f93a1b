//! Job manager: accepts prompts, runs them, and reports their progress.
//!
//! Each job runs on its own task:
//!
//! 1. wait for the job's session key (one job per conversation at a time)
//! 2. wait for a free execution slot (`max_concurrent_jobs`)
//! 3. look up the stored continuation token
//! 4. mark the job running and publish
//! 5. run the runner process
//! 6. on success, store the new continuation token if one was printed
//! 7. write the terminal record, publish, and hand off the notification
//!
//! Nothing past `create_job` returns an error to the caller; every failure
//! ends up on the job record.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{
    ConversationQuery, CreateJob, Job, JobCompletion, JobFilter, JobStatus, JobSummary,
};
use super::notify::{JobNotification, Notifier};
use crate::config::JobConfig;
use crate::error::JobError;
use crate::events::{EventBus, GlobalSubscription, JobEvent};
use crate::runner::process::{self, Invocation, ProcessOutcome};
use crate::runner::{CommandBuilder, Runner, SessionTokenExtractor, TokenExtractors};
use crate::session::{DEFAULT_THREAD_ID, SessionKey, SessionStore};
use crate::store::Database;

/// Error recorded on jobs that a previous server process left unfinished.
pub const RESTART_INTERRUPTED: &str = "interrupted by server restart";

/// Error recorded on jobs killed because the server stopped.
pub const SHUTDOWN_INTERRUPTED: &str = "interrupted by server shutdown";

/// Tracked execution task.
#[derive(Debug)]
struct TrackedJob {
    handle: JoinHandle<()>,
}

pub struct JobManager {
    config: JobConfig,
    db: Arc<dyn Database>,
    sessions: SessionStore,
    events: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    extractors: TokenExtractors,
    slots: Arc<Semaphore>,
    accepting: AtomicBool,
    tasks: RwLock<HashMap<Uuid, TrackedJob>>,
}

impl JobManager {
    pub fn new(
        config: JobConfig,
        db: Arc<dyn Database>,
        events: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            sessions: SessionStore::new(Arc::clone(&db)),
            config,
            db,
            events,
            notifier,
            extractors: TokenExtractors::default(),
            accepting: AtomicBool::new(true),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the continuation token extractor for one runner.
    pub fn with_extractor(
        mut self,
        runner: Runner,
        extractor: Arc<dyn SessionTokenExtractor>,
    ) -> Self {
        self.extractors.set(runner, extractor);
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Validate a request, record it as pending, and start executing it.
    pub async fn create_job(self: &Arc<Self>, req: CreateJob) -> Result<JobSummary, JobError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(JobError::ShuttingDown);
        }

        let runner: Runner = req.runner.trim().parse()?;
        let device_id = required(&req.device_id, "device_id")?;
        let room_id = required(&req.room_id, "room_id")?;
        if req.input_text.trim().is_empty() {
            return Err(JobError::MissingField("input_text"));
        }
        if req.workspace_path.as_os_str().is_empty() {
            return Err(JobError::MissingField("workspace_path"));
        }
        let thread_id = match req.thread_id.as_deref().map(str::trim) {
            Some(thread) if !thread.is_empty() => thread.to_string(),
            _ if self.config.threads_compat_mode => DEFAULT_THREAD_ID.to_string(),
            _ => return Err(JobError::ThreadRequired),
        };

        let argv = CommandBuilder::build(runner, req.settings.as_ref());

        let job = Job {
            id: Uuid::new_v4(),
            runner,
            device_id,
            room_id,
            thread_id,
            input_text: req.input_text,
            workspace_path: req.workspace_path,
            settings: req.settings,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            output_text: None,
            error_message: None,
            notify_token: req.notify_token.filter(|t| !t.trim().is_empty()),
        };
        self.db.insert_job(&job).await?;

        info!(
            job_id = %job.id,
            runner = %runner,
            device_id = %job.device_id,
            room_id = %job.room_id,
            thread_id = %job.thread_id,
            "Job created"
        );

        let summary = job.summary();
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.execute(job, argv).await });

        let mut tasks = self.tasks.write().await;
        tasks.retain(|_, tracked| !tracked.handle.is_finished());
        tasks.insert(summary.id, TrackedJob { handle });

        Ok(summary)
    }

    async fn execute(&self, job: Job, argv: Vec<String>) {
        let key = SessionKey {
            device_id: job.device_id.clone(),
            room_id: job.room_id.clone(),
            runner: job.runner,
            thread_id: job.thread_id.clone(),
        };

        let _lease = self.sessions.lock(&key).await;
        let Ok(_slot) = Arc::clone(&self.slots).acquire_owned().await else {
            self.finish(&job, None, JobCompletion::failed(None, None, SHUTDOWN_INTERRUPTED))
                .await;
            return;
        };

        let token = match self.sessions.get(&key).await {
            Ok(token) => token,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to load session token");
                let completion =
                    JobCompletion::failed(None, None, format!("failed to load session: {e}"));
                self.finish(&job, None, completion).await;
                return;
            }
        };

        let started_at = Utc::now();
        match self.db.mark_job_running(job.id, started_at).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "Job is no longer pending; skipping execution");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to mark job running");
                let completion = JobCompletion::failed(None, None, e.to_string());
                self.finish(&job, None, completion).await;
                return;
            }
        }
        self.events.publish_job(&JobEvent {
            job_id: job.id,
            status: JobStatus::Running,
            started_at: Some(started_at),
            finished_at: None,
            exit_code: None,
        });

        let mut args: Vec<String> = argv.into_iter().skip(1).collect();
        if let Some(token) = &token {
            args.extend(CommandBuilder::resume_args(job.runner, token));
        }
        let invocation = Invocation {
            program: self.config.executable(job.runner),
            args,
            working_dir: job.workspace_path.clone(),
            stdin_text: job.input_text.clone(),
            timeout: self.config.job_timeout,
        };

        info!(
            job_id = %job.id,
            runner = %job.runner,
            resumed = token.is_some(),
            "Runner started"
        );

        let completion = match process::run(&invocation).await {
            Ok(ProcessOutcome::Exited {
                code: 0,
                stdout,
                stderr,
            }) => {
                match self.extractors.extract(job.runner, &stdout, &stderr) {
                    Some(new_token) => {
                        if let Err(e) = self.sessions.upsert(&key, &new_token).await {
                            warn!(job_id = %job.id, error = %e, "Failed to store session token");
                        }
                    }
                    None => {
                        debug!(job_id = %job.id, "No session token in output; keeping stored token")
                    }
                }
                JobCompletion::success(0, stdout)
            }
            Ok(ProcessOutcome::Exited {
                code,
                stdout,
                stderr,
            }) => JobCompletion::failed(
                Some(code),
                Some(stdout),
                error_text(&stderr, || format!("exit status {code}")),
            ),
            Ok(ProcessOutcome::Signaled { stdout, stderr }) => JobCompletion::failed(
                None,
                Some(stdout),
                error_text(&stderr, || "terminated by signal".to_string()),
            ),
            Ok(ProcessOutcome::TimedOut { timeout }) => JobCompletion::failed(
                None,
                None,
                format!("timed out after {}s", timeout.as_secs()),
            ),
            Err(e) => JobCompletion::failed(None, None, e.to_string()),
        };

        self.finish(&job, Some(started_at), completion).await;
    }

    /// Write the terminal record, publish it, and dispatch the notification.
    async fn finish(
        &self,
        job: &Job,
        started_at: Option<chrono::DateTime<Utc>>,
        completion: JobCompletion,
    ) {
        match self.db.finish_job(job.id, &completion).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "Job already finished; dropping result");
                return;
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to store job result"),
        }

        if completion.status == JobStatus::Success {
            info!(job_id = %job.id, runner = %job.runner, "Job succeeded");
        } else {
            warn!(
                job_id = %job.id,
                runner = %job.runner,
                exit_code = ?completion.exit_code,
                error = completion.error_message.as_deref().unwrap_or_default(),
                "Job failed"
            );
        }

        self.events.publish_job(&JobEvent {
            job_id: job.id,
            status: completion.status,
            started_at,
            finished_at: Some(completion.finished_at),
            exit_code: completion.exit_code,
        });

        let Some(device_token) = job.notify_token.clone() else {
            return;
        };
        let finished = Job {
            status: completion.status,
            started_at,
            finished_at: Some(completion.finished_at),
            exit_code: completion.exit_code,
            output_text: completion.output_text,
            error_message: completion.error_message,
            ..job.clone()
        };
        let payload = JobNotification::for_job(&finished);
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&device_token, &payload).await {
                warn!(job_id = %payload.job_id, error = %e, "Notification failed");
            }
        });
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, JobError> {
        self.db
            .get_job(id)
            .await?
            .ok_or(JobError::NotFound { id })
    }

    /// Jobs newest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        Ok(self.db.list_jobs(filter).await?)
    }

    /// The newest page of one conversation, oldest first within the page.
    pub async fn list_conversation(&self, query: &ConversationQuery) -> Result<Vec<Job>, JobError> {
        required(&query.device_id, "device_id")?;
        required(&query.room_id, "room_id")?;
        self.require_thread(query.thread_id.as_deref())?;
        Ok(self.db.list_conversation(query).await?)
    }

    /// Status events for one job: the current state first, then every change,
    /// ending after the terminal event.
    pub async fn subscribe_job_events(
        &self,
        id: Uuid,
    ) -> Result<impl Stream<Item = JobEvent> + Send + 'static, JobError> {
        // Register before reading so no transition can fall between the two.
        let rx = self.events.subscribe_job(id);

        let job = match self.db.get_job(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                drop(rx);
                self.events.prune_job(id);
                return Err(JobError::NotFound { id });
            }
            Err(e) => {
                drop(rx);
                self.events.prune_job(id);
                return Err(e.into());
            }
        };

        let snapshot = JobEvent::from(&job);
        let rx = if snapshot.is_terminal() {
            drop(rx);
            self.events.prune_job(id);
            None
        } else {
            Some(rx)
        };

        let live = futures::stream::unfold(rx, |rx| async move {
            match rx {
                Some(mut rx) => match rx.recv().await {
                    Some(event) if event.is_terminal() => Some((event, None)),
                    Some(event) => Some((event, Some(rx))),
                    None => None,
                },
                None => None,
            }
        });
        Ok(futures::stream::once(async move { snapshot }).chain(live))
    }

    pub fn subscribe_global_events(&self) -> GlobalSubscription {
        self.events.subscribe_global()
    }

    /// Send a named event to every global subscriber.
    pub fn broadcast_event(&self, name: &str, data: Value) -> usize {
        self.events.broadcast(name, data)
    }

    /// Forget stored continuation tokens so the next job starts fresh.
    pub async fn delete_sessions(
        &self,
        device_id: &str,
        room_id: &str,
        runner: &str,
        thread_id: Option<&str>,
    ) -> Result<u64, JobError> {
        let runner: Runner = runner.trim().parse()?;
        let device_id = required(device_id, "device_id")?;
        let room_id = required(room_id, "room_id")?;
        let thread_id = thread_id.map(str::trim).filter(|t| !t.is_empty());
        self.require_thread(thread_id)?;

        let deleted = self
            .sessions
            .delete(&device_id, &room_id, runner, thread_id)
            .await?;
        info!(
            device_id = %device_id,
            room_id = %room_id,
            runner = %runner,
            thread_id = thread_id.unwrap_or("*"),
            deleted,
            "Sessions cleared"
        );
        Ok(deleted)
    }

    /// Fail jobs a previous process left pending or running. Call once at startup.
    pub async fn recover_interrupted(&self) -> Result<usize, JobError> {
        let jobs = self
            .db
            .fail_interrupted_jobs(RESTART_INTERRUPTED, Utc::now())
            .await?;
        for job in &jobs {
            warn!(job_id = %job.id, "Marked interrupted job as failed");
        }
        Ok(jobs.len())
    }

    /// Stop accepting jobs, wait up to `grace` for running ones, then kill the rest.
    /// Every open event stream ends once this returns.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);

        let tracked: Vec<(Uuid, TrackedJob)> = self.tasks.write().await.drain().collect();
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0usize;

        for (id, mut job) in tracked {
            if tokio::time::timeout_at(deadline, &mut job.handle).await.is_err() {
                job.handle.abort();
                let _ = job.handle.await;
                aborted += 1;
                debug!(job_id = %id, "Job task aborted");
            }
        }
        self.slots.close();

        if aborted > 0 {
            match self
                .db
                .fail_interrupted_jobs(SHUTDOWN_INTERRUPTED, Utc::now())
                .await
            {
                Ok(jobs) => {
                    for job in &jobs {
                        self.events.publish_job(&JobEvent::from(job));
                    }
                }
                Err(e) => error!(error = %e, "Failed to record interrupted jobs"),
            }
        }
        self.events.close_all();
        info!(aborted, "Job manager stopped");
    }

    /// Without compatibility mode every conversation operation names its thread.
    fn require_thread(&self, thread_id: Option<&str>) -> Result<(), JobError> {
        match thread_id.map(str::trim) {
            Some(thread) if !thread.is_empty() => Ok(()),
            _ if self.config.threads_compat_mode => Ok(()),
            _ => Err(JobError::ThreadRequired),
        }
    }

    /// Execution tasks that have not finished yet.
    pub async fn running_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|tracked| !tracked.handle.is_finished())
            .count()
    }
}

fn required(value: &str, field: &'static str) -> Result<String, JobError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(JobError::MissingField(field));
    }
    Ok(value.to_string())
}

/// stderr (truncated) if the runner printed any, otherwise `fallback`.
fn error_text(stderr: &str, fallback: impl FnOnce() -> String) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        fallback()
    } else {
        process::truncate_output(stderr)
    }
}
