//! Integration tests for the job HTTP + event-stream API.
//!
//! Each test spins up an Axum server on a random port with fake runner
//! scripts and drives the real REST / stream contract over reqwest.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use remote_prompt::api;
use remote_prompt::config::{EventConfig, JobConfig};
use remote_prompt::events::EventBus;
use remote_prompt::jobs::{JobManager, LogNotifier};
use remote_prompt::runner::Runner;
use remote_prompt::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const CLAUDE_SCRIPT: &str = r#"input=$(cat)
echo "reply to: $input"
echo '{"session_id": "claude-session-1"}'"#;

fn fake_runner(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-claude");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

struct TestServer {
    base: String,
    manager: Arc<JobManager>,
    workspace: tempfile::TempDir,
    client: reqwest::Client,
}

/// Start an Axum server on a random port backed by an in-memory database.
async fn start_server(script: &str) -> TestServer {
    let workspace = tempfile::tempdir().unwrap();
    let mut config = JobConfig::default();
    config
        .executables
        .insert(Runner::Claude, fake_runner(workspace.path(), script));

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let events = EventBus::new(EventConfig {
        heartbeat_interval: Duration::from_millis(100),
        subscriber_queue_capacity: 16,
    });
    let manager = Arc::new(JobManager::new(config, db, events, Arc::new(LogNotifier)));
    let app = api::routes(Arc::clone(&manager));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        manager,
        workspace,
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    fn job_body(&self, prompt: &str, thread: &str) -> Value {
        json!({
            "runner": "claude",
            "input_text": prompt,
            "device_id": "phone",
            "room_id": "room-1",
            "thread_id": thread,
            "workspace_path": self.workspace.path(),
        })
    }

    async fn post_job(&self, prompt: &str, thread: &str) -> Value {
        let response = self
            .client
            .post(format!("{}/jobs", self.base))
            .json(&self.job_body(prompt, thread))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }

    async fn wait_finished(&self, id: &str) -> Value {
        loop {
            let job: Value = self
                .client
                .get(format!("{}/jobs/{id}", self.base))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if job["status"] == "success" || job["status"] == "failed" {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[tokio::test]
async fn test_create_and_poll_job() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(CLAUDE_SCRIPT).await;

        let summary = server.post_job("hello there", "t1").await;
        assert_eq!(summary["runner"], "claude");
        assert_eq!(summary["status"], "pending");

        let job = server.wait_finished(summary["id"].as_str().unwrap()).await;
        assert_eq!(job["status"], "success");
        assert_eq!(job["exit_code"], 0);
        assert_eq!(job["thread_id"], "t1");
        assert!(
            job["output_text"]
                .as_str()
                .unwrap()
                .contains("reply to: hello there")
        );

        let listed: Value = server
            .client
            .get(format!("{}/jobs?device_id=phone&limit=5", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_job_stream_ends_with_terminal_status() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(&format!("sleep 0.2\n{CLAUDE_SCRIPT}")).await;
        let summary = server.post_job("stream me", "t1").await;
        let id = summary["id"].as_str().unwrap();

        let response = server
            .client
            .get(format!("{}/jobs/{id}/stream", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        // The stream closes by itself after the terminal event.
        let body = response.text().await.unwrap();
        let frames: Vec<&str> = body.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.starts_with("event: status\n")), "{body}");
        let last = frames.last().unwrap();
        assert!(last.contains(r#""status":"success""#), "{body}");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_global_stream_heartbeat_and_broadcast() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(CLAUDE_SCRIPT).await;
        let mut response = server
            .client
            .get(format!("{}/events", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let mut seen = String::new();
        while !seen.lines().any(|l| l.starts_with(':') && l.ends_with("ping")) {
            let chunk = response.chunk().await.unwrap().expect("stream ended early");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }

        assert_eq!(
            server
                .manager
                .broadcast_event("room_updated", json!({"room_id": "room-1"})),
            1
        );
        while !seen.contains("event: room_updated\n") {
            let chunk = response.chunk().await.unwrap().expect("stream ended early");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(seen.contains(r#"data: {"room_id":"room-1"}"#), "{seen}");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_messages_are_chronological() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(CLAUDE_SCRIPT).await;
        for prompt in ["first", "second", "third"] {
            let summary = server.post_job(prompt, "t1").await;
            server.wait_finished(summary["id"].as_str().unwrap()).await;
        }
        let other = server.post_job("elsewhere", "t2").await;
        server.wait_finished(other["id"].as_str().unwrap()).await;

        let body: Value = server
            .client
            .get(format!(
                "{}/messages?device_id=phone&room_id=room-1&runner=claude&thread_id=t1",
                server.base
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["thread_id"], "t1");
        let prompts: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["input_text"].as_str().unwrap())
            .collect();
        assert_eq!(prompts, ["first", "second", "third"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_delete_sessions_after_job() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(CLAUDE_SCRIPT).await;
        let summary = server.post_job("remember me", "t1").await;
        server.wait_finished(summary["id"].as_str().unwrap()).await;

        let url = format!(
            "{}/sessions?device_id=phone&room_id=room-1&runner=claude&thread_id=t1",
            server.base
        );
        let body: Value = server
            .client
            .delete(&url)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["deleted"], 1);

        let body: Value = server
            .client
            .delete(&url)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["deleted"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(CLAUDE_SCRIPT).await;

        let mut body = server.job_body("hi", "t1");
        body["runner"] = json!("llama");
        let response = server
            .client
            .post(format!("{}/jobs", server.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let error: Value = response.json().await.unwrap();
        assert_eq!(error["error"], "Unsupported runner: llama");

        let response = server
            .client
            .get(format!("{}/jobs/not-a-uuid", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let jobs: Value = server
            .client
            .get(format!("{}/jobs", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(jobs.as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}
