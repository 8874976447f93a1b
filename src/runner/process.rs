//! Runner subprocess execution.
//!
//! Provides controlled process execution with:
//! - Working directory set to the job's workspace
//! - Prompt delivered on stdin, never on the command line
//! - Timeout enforcement (the child is killed when the run is abandoned)
//! - Output capture

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Maximum size of error text derived from process output (64KB).
pub const MAX_ERROR_SIZE: usize = 64 * 1024;

/// A fully resolved runner invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub stdin_text: String,
    pub timeout: Duration,
}

/// How a process run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Normal termination with an exit code.
    Exited {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// Terminated by a signal; no exit code.
    Signaled { stdout: String, stderr: String },
    /// Exceeded the time limit and was killed.
    TimedOut { timeout: Duration },
}

/// The process could not be started at all.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to collect output of {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run an invocation to completion or timeout.
pub async fn run(invocation: &Invocation) -> Result<ProcessOutcome, ProcessError> {
    let program = invocation.program.display().to_string();

    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .current_dir(&invocation.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

    debug!(program = %program, pid = ?child.id(), "Runner process spawned");

    // Feed stdin from its own task so a chatty child can't deadlock us on a full pipe.
    if let Some(mut stdin) = child.stdin.take() {
        let input = invocation.stdin_text.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!(error = %e, "Runner closed stdin early");
            }
            let _ = stdin.shutdown().await;
        });
    }

    // Dropping the future on timeout drops the child, and kill_on_drop kills it.
    match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            Ok(match output.status.code() {
                Some(code) => ProcessOutcome::Exited {
                    code,
                    stdout,
                    stderr,
                },
                None => ProcessOutcome::Signaled { stdout, stderr },
            })
        }
        Ok(Err(source)) => Err(ProcessError::Wait { program, source }),
        Err(_) => {
            warn!(program = %program, timeout = ?invocation.timeout, "Runner process timed out");
            Ok(ProcessOutcome::TimedOut {
                timeout: invocation.timeout,
            })
        }
    }
}

/// Truncate text to fit within `MAX_ERROR_SIZE` (UTF-8 safe), keeping head and tail.
pub fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_ERROR_SIZE {
        s.to_string()
    } else {
        let half = MAX_ERROR_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_ERROR_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> Invocation {
        Invocation {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
            working_dir: std::env::temp_dir(),
            stdin_text: String::new(),
            timeout,
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let outcome = run(&sh("echo hello; echo oops >&2; exit 3", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Exited {
                code: 3,
                stdout: "hello\n".into(),
                stderr: "oops\n".into(),
            }
        );
    }

    #[tokio::test]
    async fn prompt_arrives_on_stdin() {
        let mut invocation = sh("cat", Duration::from_secs(5));
        invocation.stdin_text = "what is 2+2? --not-a-flag".into();
        let outcome = run(&invocation).await.unwrap();
        assert!(matches!(
            outcome,
            ProcessOutcome::Exited { code: 0, ref stdout, .. } if stdout == "what is 2+2? --not-a-flag"
        ));
    }

    #[tokio::test]
    async fn runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut invocation = sh("pwd", Duration::from_secs(5));
        invocation.working_dir = dir.path().to_path_buf();
        let outcome = run(&invocation).await.unwrap();
        let ProcessOutcome::Exited { stdout, .. } = outcome else {
            panic!("expected normal exit");
        };
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(stdout.trim()).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let outcome = run(&sh("sleep 10", Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn signal_has_no_exit_code() {
        let outcome = run(&sh("kill -9 $$", Duration::from_secs(5))).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Signaled { .. }));
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let invocation = Invocation {
            program: PathBuf::from("/nonexistent/runner-binary"),
            args: vec![],
            working_dir: std::env::temp_dir(),
            stdin_text: String::new(),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            run(&invocation).await,
            Err(ProcessError::Spawn { .. })
        ));
    }

    #[test]
    fn truncate_output_short() {
        assert_eq!(truncate_output("short output"), "short output");
    }

    #[test]
    fn truncate_output_long() {
        let s = "x".repeat(MAX_ERROR_SIZE + 1000);
        let result = truncate_output(&s);
        assert!(result.len() <= MAX_ERROR_SIZE + 100);
        assert!(result.contains("[truncated 1000 bytes]"));
    }

    #[test]
    fn floor_char_boundary_multibyte() {
        let s = "café";
        assert_eq!(floor_char_boundary(s, 5), 5);
        assert_eq!(floor_char_boundary(s, 4), 3);
        assert_eq!(floor_char_boundary(s, 3), 3);
    }
}
