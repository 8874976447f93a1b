//! Per-room runner settings.
//!
//! A room stores one settings document with an optional section per runner.
//! Values arrive already whitelisted by the settings validator upstream, so
//! nothing here re-validates them. Unknown keys are dropped on
//! deserialization.

use serde::{Deserialize, Serialize};

use super::Runner;

/// Settings document attached to a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude: Option<ClaudeSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex: Option<CodexSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini: Option<GeminiSettings>,
}

impl RoomSettings {
    /// The section that applies to `runner`, if the room configured one.
    pub fn for_runner(&self, runner: Runner) -> Option<RunnerSettings<'_>> {
        match runner {
            Runner::Claude => self.claude.as_ref().map(RunnerSettings::Claude),
            Runner::Codex => self.codex.as_ref().map(RunnerSettings::Codex),
            Runner::Gemini => self.gemini.as_ref().map(RunnerSettings::Gemini),
        }
    }
}

/// Settings for a single runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerSettings<'a> {
    Claude(&'a ClaudeSettings),
    Codex(&'a CodexSettings),
    Gemini(&'a GeminiSettings),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaudeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    /// Present-but-empty still emits the flag; the CLI treats that as "no tools".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_flags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodexSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    /// Accepted for compatibility; `codex exec` has no approval flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_flags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeminiSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_mode: Option<String>,
    #[serde(default)]
    pub sandbox: bool,
    #[serde(default)]
    pub yolo: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_flags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_ignored() {
        let settings: RoomSettings = serde_json::from_value(serde_json::json!({
            "claude": {"model": "opus", "temperature": 0.2},
            "llama": {"model": "x"}
        }))
        .unwrap();
        assert_eq!(settings.claude.unwrap().model.as_deref(), Some("opus"));
        assert!(settings.codex.is_none());
    }

    #[test]
    fn for_runner_picks_matching_section() {
        let settings = RoomSettings {
            codex: Some(CodexSettings {
                model: Some("gpt-5.1-codex".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(settings.for_runner(Runner::Claude).is_none());
        assert!(matches!(
            settings.for_runner(Runner::Codex),
            Some(RunnerSettings::Codex(c)) if c.model.as_deref() == Some("gpt-5.1-codex")
        ));
    }

    #[test]
    fn gemini_flags_default_off() {
        let settings: RoomSettings =
            serde_json::from_value(serde_json::json!({"gemini": {}})).unwrap();
        let gemini = settings.gemini.unwrap();
        assert!(!gemini.sandbox);
        assert!(!gemini.yolo);
    }
}
