//! Command builder: maps a runner and its room settings to an argv.
//!
//! Every value becomes its own argv element and no shell is ever involved,
//! so settings can never be re-parsed into extra commands.

use super::settings::{ClaudeSettings, CodexSettings, GeminiSettings, RoomSettings, RunnerSettings};
use super::Runner;

/// Builds argument vectors for runner executables.
pub struct CommandBuilder;

impl CommandBuilder {
    /// Build the argv for `runner`. Element 0 is the executable name.
    pub fn build(runner: Runner, settings: Option<&RoomSettings>) -> Vec<String> {
        let section = settings.and_then(|s| s.for_runner(runner));
        match (runner, section) {
            (Runner::Claude, Some(RunnerSettings::Claude(cfg))) => claude(Some(cfg)),
            (Runner::Claude, _) => claude(None),
            (Runner::Codex, Some(RunnerSettings::Codex(cfg))) => codex(Some(cfg)),
            (Runner::Codex, _) => codex(None),
            (Runner::Gemini, Some(RunnerSettings::Gemini(cfg))) => gemini(Some(cfg)),
            (Runner::Gemini, _) => gemini(None),
        }
    }

    /// Arguments that make `runner` continue the conversation identified by `token`.
    pub fn resume_args(runner: Runner, token: &str) -> Vec<String> {
        match runner {
            Runner::Claude | Runner::Gemini => vec!["--resume".into(), token.into()],
            Runner::Codex => vec!["resume".into(), token.into()],
        }
    }
}

fn claude(cfg: Option<&ClaudeSettings>) -> Vec<String> {
    let mut cmd = args(["claude", "--print", "--output-format", "text"]);
    let Some(cfg) = cfg else {
        return cmd;
    };

    push_opt(&mut cmd, "--model", cfg.model.as_deref());
    push_opt(&mut cmd, "--permission-mode", cfg.permission_mode.as_deref());
    if let Some(tools) = &cfg.tools {
        cmd.push("--tools".into());
        cmd.push(tools.join(","));
    }
    if !cfg.allowed_tools.is_empty() {
        cmd.push("--allowedTools".into());
        cmd.push(cfg.allowed_tools.join(","));
    }
    if !cfg.disallowed_tools.is_empty() {
        cmd.push("--disallowedTools".into());
        cmd.push(cfg.disallowed_tools.join(","));
    }
    cmd.extend(cfg.custom_flags.iter().cloned());
    cmd
}

fn codex(cfg: Option<&CodexSettings>) -> Vec<String> {
    let mut cmd = args(["codex", "exec"]);
    let Some(cfg) = cfg else {
        return cmd;
    };

    push_opt(&mut cmd, "-m", cfg.model.as_deref());
    push_opt(&mut cmd, "-s", cfg.sandbox.as_deref());
    if let Some(effort) = cfg.reasoning_effort.as_deref() {
        // Newer codex releases spell the top level "xhigh".
        let effort = if effort == "extra-high" { "xhigh" } else { effort };
        cmd.push("-c".into());
        cmd.push(format!("model_reasoning_effort={effort}"));
    }
    cmd.extend(cfg.custom_flags.iter().cloned());
    cmd
}

fn gemini(cfg: Option<&GeminiSettings>) -> Vec<String> {
    let mut cmd = args(["gemini", "-o", "text"]);
    let Some(cfg) = cfg else {
        return cmd;
    };

    push_opt(&mut cmd, "-m", cfg.model.as_deref());
    if cfg.sandbox {
        cmd.push("-s".into());
    }
    if cfg.yolo {
        cmd.push("-y".into());
    }
    push_opt(&mut cmd, "--approval-mode", cfg.approval_mode.as_deref());
    cmd.extend(cfg.custom_flags.iter().cloned());
    cmd
}

fn args<const N: usize>(base: [&str; N]) -> Vec<String> {
    base.iter().map(|s| s.to_string()).collect()
}

fn push_opt(cmd: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(value) = value {
        cmd.push(flag.to_string());
        cmd.push(value.to_string());
    }
}
