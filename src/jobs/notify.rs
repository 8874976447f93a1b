//! Push notifications for finished jobs.
//!
//! Delivery is fire-and-forget: the job manager spawns `notify` on its own
//! task and only logs failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::model::{Job, JobStatus};
use crate::config::NotificationConfig;
use crate::error::NotifyError;
use crate::runner::Runner;

/// Characters of output (or error) carried in a notification.
pub const PREVIEW_CHARS: usize = 120;

const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// What a device is told about a finished job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobNotification {
    pub job_id: Uuid,
    pub runner: Runner,
    pub status: JobStatus,
    pub room_id: String,
    pub thread_id: String,
    pub preview: String,
}

impl JobNotification {
    pub fn for_job(job: &Job) -> Self {
        let text = match job.status {
            JobStatus::Failed => job.error_message.as_deref(),
            _ => job.output_text.as_deref(),
        }
        .unwrap_or_default();

        Self {
            job_id: job.id,
            runner: job.runner,
            status: job.status,
            room_id: job.room_id.clone(),
            thread_id: job.thread_id.clone(),
            preview: text.trim().chars().take(PREVIEW_CHARS).collect(),
        }
    }
}

/// Delivers a notification to one device.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, device_token: &str, payload: &JobNotification)
    -> Result<(), NotifyError>;
}

/// Build the notifier described by `config`.
pub fn from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    match &config.relay_url {
        Some(url) => Arc::new(RelayNotifier::new(url.clone(), config.relay_token.clone())),
        None => Arc::new(LogNotifier),
    }
}

/// Posts notifications to the push relay server.
pub struct RelayNotifier {
    endpoint: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl RelayNotifier {
    pub fn new(base_url: String, token: Option<SecretString>) -> Self {
        Self {
            endpoint: format!("{}/notify", base_url.trim_end_matches('/')),
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    device_token: &'a str,
    #[serde(flatten)]
    notification: &'a JobNotification,
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn notify(
        &self,
        device_token: &str,
        payload: &JobNotification,
    ) -> Result<(), NotifyError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(RELAY_TIMEOUT)
            .json(&RelayRequest {
                device_token,
                notification: payload,
            });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                NotifyError::Timeout(RELAY_TIMEOUT)
            } else {
                NotifyError::Request(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Logs instead of delivering. Used when no relay is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        _device_token: &str,
        payload: &JobNotification,
    ) -> Result<(), NotifyError> {
        info!(
            job_id = %payload.job_id,
            runner = %payload.runner,
            status = %payload.status,
            "Job finished (no notification relay configured)"
        );
        Ok(())
    }
}
