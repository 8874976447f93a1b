//! Configuration types.
//!
//! Everything is read from the environment once at startup. `from_lookup`
//! takes the variable source as a function so tests never touch the real
//! process environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::runner::Runner;

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    /// Origins allowed by CORS.
    pub allowed_origins: Vec<String>,
    /// How long shutdown waits for running jobs before killing them.
    pub shutdown_grace: Duration,
    pub jobs: JobConfig,
    pub events: EventConfig,
    pub notifications: NotificationConfig,
}

/// Job execution settings.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Wall-clock limit for one runner process.
    pub job_timeout: Duration,
    /// Runner processes allowed at once, across all session keys.
    pub max_concurrent_jobs: usize,
    /// When set, a missing `thread_id` falls back to the default thread.
    pub threads_compat_mode: bool,
    /// Executable overrides; runners not listed are looked up on `PATH`.
    pub executables: HashMap<Runner, PathBuf>,
}

impl JobConfig {
    /// Program to launch for `runner`.
    pub fn executable(&self, runner: Runner) -> PathBuf {
        self.executables
            .get(&runner)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(runner.as_str()))
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(1800), // 30 minutes
            max_concurrent_jobs: 4,
            threads_compat_mode: true,
            executables: HashMap::new(),
        }
    }
}

/// Event stream settings.
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Idle time after which a global subscriber receives a heartbeat.
    pub heartbeat_interval: Duration,
    /// Per-subscriber queue length; a subscriber that falls this far behind is dropped.
    pub subscriber_queue_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            subscriber_queue_capacity: 64,
        }
    }
}

/// Push notification relay. Without a URL, notifications are only logged.
#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    pub relay_url: Option<String>,
    pub relay_token: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            db_path: PathBuf::from("./data/jobs.db"),
            log_dir: PathBuf::from("./logs"),
            allowed_origins: vec!["http://127.0.0.1:8443".to_string()],
            shutdown_grace: Duration::from_secs(10),
            jobs: JobConfig::default(),
            events: EventConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut executables = HashMap::new();
        for runner in Runner::ALL {
            let key = format!("REMOTE_PROMPT_{}_BIN", runner.as_str().to_uppercase());
            if let Some(path) = var(key.as_str()) {
                executables.insert(runner, PathBuf::from(path));
            }
        }

        let max_concurrent_jobs: usize = parse_or(
            var("REMOTE_PROMPT_MAX_CONCURRENT_JOBS"),
            "REMOTE_PROMPT_MAX_CONCURRENT_JOBS",
            defaults.jobs.max_concurrent_jobs,
        )?;
        if max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REMOTE_PROMPT_MAX_CONCURRENT_JOBS".into(),
                message: "must be at least 1".into(),
            });
        }

        let subscriber_queue_capacity: usize = parse_or(
            var("REMOTE_PROMPT_SUBSCRIBER_QUEUE"),
            "REMOTE_PROMPT_SUBSCRIBER_QUEUE",
            defaults.events.subscriber_queue_capacity,
        )?;
        if subscriber_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REMOTE_PROMPT_SUBSCRIBER_QUEUE".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            bind_addr: parse_or(
                var("REMOTE_PROMPT_BIND"),
                "REMOTE_PROMPT_BIND",
                defaults.bind_addr,
            )?,
            db_path: var("REMOTE_PROMPT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: var("REMOTE_PROMPT_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            allowed_origins: var("REMOTE_PROMPT_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.allowed_origins),
            shutdown_grace: secs_or(
                var("REMOTE_PROMPT_SHUTDOWN_GRACE_SECS"),
                "REMOTE_PROMPT_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace,
            )?,
            jobs: JobConfig {
                job_timeout: secs_or(
                    var("REMOTE_PROMPT_JOB_TIMEOUT_SECS"),
                    "REMOTE_PROMPT_JOB_TIMEOUT_SECS",
                    defaults.jobs.job_timeout,
                )?,
                max_concurrent_jobs,
                threads_compat_mode: bool_or(
                    var("REMOTE_PROMPT_THREADS_COMPAT_MODE"),
                    "REMOTE_PROMPT_THREADS_COMPAT_MODE",
                    defaults.jobs.threads_compat_mode,
                )?,
                executables,
            },
            events: EventConfig {
                heartbeat_interval: secs_or(
                    var("REMOTE_PROMPT_HEARTBEAT_SECS"),
                    "REMOTE_PROMPT_HEARTBEAT_SECS",
                    defaults.events.heartbeat_interval,
                )?,
                subscriber_queue_capacity,
            },
            notifications: NotificationConfig {
                relay_url: var("NOTIFICATION_SERVER_URL")
                    .map(|url| url.trim_end_matches('/').to_string()),
                relay_token: var("NOTIFICATION_SERVER_TOKEN").map(SecretString::from),
            },
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{v:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn secs_or(value: Option<String>, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = parse_or(value, key, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1 second".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn bool_or(value: Option<String>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{v:?} is not a boolean"),
            }),
        },
    }
}
